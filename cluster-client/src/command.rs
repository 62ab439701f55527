//! Command and reply types for the batch executor
//!
//! A command is the unit the accumulator queues and the executor pipelines:
//! an opcode, its arguments, a reply codec, a per-command response slot, and
//! the sequence number that restores user-visible ordering after the
//! scatter-gather completes.

use crate::error::ClusterError;
use crate::types::SequenceNumber;
use crate::Result;
use std::sync::Mutex;

/// A reply as the wire codec hands it back, before per-command decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawReply {
    /// Simple status line (for example `OK` or `PONG`)
    Status(String),
    /// Signed integer reply
    Integer(i64),
    /// Bulk byte-string reply
    Bulk(Vec<u8>),
    /// Absent value
    Nil,
    /// Error line from the server
    Error(String),
}

/// A decoded, user-facing reply value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Status line
    Status(String),
    /// Integer value
    Integer(i64),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// UTF-8 string decoded from a bulk reply
    Utf8(String),
    /// Boolean decoded from an integer or status reply
    Bool(bool),
    /// Absent value
    Nil,
}

/// Per-command reply decoder
///
/// Chosen at enqueue time by the facade issuing the command; the executor
/// applies it when the transport delivers the raw reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCodec {
    /// Keep the wire shape: status stays status, bulk stays bytes
    Verbatim,
    /// Decode bulk replies as UTF-8 strings
    Utf8,
    /// Decode integer replies (0/1) and `OK` statuses as booleans
    Boolean,
}

impl ReplyCodec {
    /// Decodes a raw reply into a user-facing reply
    ///
    /// Server error lines decode to `Err(ServerError)` under every codec.
    pub fn decode(&self, raw: RawReply) -> Result<Reply> {
        if let RawReply::Error(message) = raw {
            return Err(ClusterError::ServerError { message });
        }
        match self {
            ReplyCodec::Verbatim => Ok(match raw {
                RawReply::Status(s) => Reply::Status(s),
                RawReply::Integer(i) => Reply::Integer(i),
                RawReply::Bulk(b) => Reply::Bytes(b),
                RawReply::Nil => Reply::Nil,
                RawReply::Error(_) => unreachable!("handled above"),
            }),
            ReplyCodec::Utf8 => match raw {
                RawReply::Bulk(b) => {
                    let s = String::from_utf8(b).map_err(|e| ClusterError::DecodeFailed {
                        details: format!("bulk reply is not valid UTF-8: {}", e),
                    })?;
                    Ok(Reply::Utf8(s))
                }
                RawReply::Status(s) => Ok(Reply::Utf8(s)),
                RawReply::Nil => Ok(Reply::Nil),
                other => Err(ClusterError::DecodeFailed {
                    details: format!("expected bulk reply for UTF-8 decoding, got {:?}", other),
                }),
            },
            ReplyCodec::Boolean => match raw {
                RawReply::Integer(0) => Ok(Reply::Bool(false)),
                RawReply::Integer(1) => Ok(Reply::Bool(true)),
                RawReply::Status(s) if s == "OK" => Ok(Reply::Bool(true)),
                RawReply::Nil => Ok(Reply::Bool(false)),
                other => Err(ClusterError::DecodeFailed {
                    details: format!("expected boolean-shaped reply, got {:?}", other),
                }),
            },
        }
    }
}

/// The per-command promise the transport delivers the reply into
///
/// A success latches: once a command has its reply, later attempts must not
/// overwrite it and the executor filters the command out of retried
/// pipelines. Errors are clearable so that a redirect or a loading retry
/// starts from a clean slate.
#[derive(Debug, Default)]
pub struct ResponseSlot {
    outcome: Mutex<Option<Result<Reply>>>,
}

impl ResponseSlot {
    /// Creates an empty slot
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers an outcome into the slot
    ///
    /// A latched success is never overwritten. Returns true if the slot
    /// changed.
    pub fn complete(&self, result: Result<Reply>) -> bool {
        let mut outcome = self.outcome.lock().expect("response slot poisoned");
        if matches!(*outcome, Some(Ok(_))) {
            return false;
        }
        *outcome = Some(result);
        true
    }

    /// Returns true if the slot holds a successful reply
    pub fn is_success(&self) -> bool {
        matches!(
            *self.outcome.lock().expect("response slot poisoned"),
            Some(Ok(_))
        )
    }

    /// Clears a held error, leaving successes untouched
    pub fn clear_error(&self) {
        let mut outcome = self.outcome.lock().expect("response slot poisoned");
        if matches!(*outcome, Some(Err(_))) {
            *outcome = None;
        }
    }

    /// Returns a copy of the current outcome
    pub fn peek(&self) -> Option<Result<Reply>> {
        self.outcome.lock().expect("response slot poisoned").clone()
    }
}

/// A single queued command
#[derive(Debug)]
pub struct Command {
    opcode: String,
    args: Vec<Vec<u8>>,
    codec: ReplyCodec,
    seq: SequenceNumber,
    response: ResponseSlot,
}

impl Command {
    /// Creates a new command with the given sequence number
    pub fn new(
        opcode: impl Into<String>,
        args: Vec<Vec<u8>>,
        codec: ReplyCodec,
        seq: SequenceNumber,
    ) -> Self {
        Self {
            opcode: opcode.into(),
            args,
            codec,
            seq,
            response: ResponseSlot::new(),
        }
    }

    /// Creates the one-shot ASKING probe prepended to redirected pipelines
    ///
    /// The probe is never part of a batch's result set; its sequence number
    /// is a placeholder.
    pub fn asking_probe() -> Self {
        Self::new("ASKING", Vec::new(), ReplyCodec::Verbatim, 0)
    }

    /// Returns the command opcode
    pub fn opcode(&self) -> &str {
        &self.opcode
    }

    /// Returns the command arguments
    pub fn args(&self) -> &[Vec<u8>] {
        &self.args
    }

    /// Returns the enqueue-time sequence number
    pub fn seq(&self) -> SequenceNumber {
        self.seq
    }

    /// Returns the response slot
    pub fn response(&self) -> &ResponseSlot {
        &self.response
    }

    /// Decodes a raw reply with the command's codec and delivers it
    pub fn complete_raw(&self, raw: RawReply) {
        self.response.complete(self.codec.decode(raw));
    }

    /// Delivers a failure into the response slot
    pub fn fail(&self, err: ClusterError) {
        self.response.complete(Err(err));
    }
}

//! Transport contracts for the pool and the executor
//!
//! The wire protocol lives outside this crate. The pool and the executor
//! drive connections exclusively through the [`NodeConnection`] and
//! [`ConnectionFactory`] traits defined here; the concrete transport (TCP,
//! TLS, an in-process test double) supplies the implementations.

use crate::command::{Command, Reply};
use crate::error::ClusterError;
use crate::types::NodeAddress;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::oneshot;

/// An ordered list of commands sent to one node as a single frame
///
/// Sending the whole frame at once preserves pipelining: the server sees the
/// commands back to back and replies in order.
#[derive(Debug, Clone, Default)]
pub struct PipelineFrame {
    commands: Vec<Arc<Command>>,
}

impl PipelineFrame {
    /// Creates a frame from the given commands
    pub fn new(commands: Vec<Arc<Command>>) -> Self {
        Self { commands }
    }

    /// Returns the commands in send order
    pub fn commands(&self) -> &[Arc<Command>] {
        &self.commands
    }

    /// Returns true if the frame carries no commands
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Returns the number of commands in the frame
    pub fn len(&self) -> usize {
        self.commands.len()
    }
}

/// Completion side of a pipeline's response future
///
/// The transport keeps this while replies stream in, delivering each reply
/// into its command's response slot, and resolves it once when the frame is
/// fully answered or when a frame-level failure (redirect, loading, server
/// error, lost connection) ends the exchange.
#[derive(Debug)]
pub struct ResponseSender {
    tx: oneshot::Sender<Result<()>>,
}

impl ResponseSender {
    /// Resolves the paired [`ResponseHandle`]
    pub fn complete(self, result: Result<()>) {
        // The receiver may have been dropped by a cancelled attempt.
        let _ = self.tx.send(result);
    }
}

/// Caller side of a pipeline's response future
///
/// Independent of pool occupancy: the connection goes back to its entry
/// right after the write flushes, and the handle resolves whenever the
/// replies arrive.
#[derive(Debug)]
pub struct ResponseHandle {
    rx: oneshot::Receiver<Result<()>>,
}

impl ResponseHandle {
    /// Creates a connected sender/handle pair
    pub fn channel() -> (ResponseSender, ResponseHandle) {
        let (tx, rx) = oneshot::channel();
        (ResponseSender { tx }, ResponseHandle { rx })
    }

    /// Waits for the frame to be fully answered
    pub async fn wait(self) -> Result<()> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(ClusterError::Internal {
                component: "ResponseHandle".to_string(),
                details: "response channel closed before completion".to_string(),
            }),
        }
    }
}

/// A live connection to one cluster node
///
/// Implementations must release their resources when dropped; the pool
/// discards unhealthy connections by dropping them without calling
/// [`close`](NodeConnection::close).
#[async_trait]
pub trait NodeConnection: Send + 'static {
    /// The remote endpoint this connection is attached to
    fn address(&self) -> &NodeAddress;

    /// Writes a pipeline frame and returns once the write has flushed
    ///
    /// An `Err` means the frame never reached the server ([`ClusterError::WriteFailed`]).
    /// An `Ok` carries the handle that resolves when the replies arrive.
    async fn send_pipeline(&mut self, frame: PipelineFrame) -> Result<ResponseHandle>;

    /// Authenticates against a password-protected endpoint
    async fn authenticate(&mut self, password: &str) -> Result<()>;

    /// Issues a PING and returns the reply
    async fn ping(&mut self) -> Result<Reply>;

    /// Returns true while the connection is usable
    fn is_healthy(&self) -> bool;

    /// Closes the connection; idempotent
    async fn close(&mut self);
}

/// Opens connections to cluster nodes
///
/// The pool calls this for acquisition misses, warm-up, and reconnection
/// probes. Implementations own their connect timeout.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// The connection type this factory produces
    type Connection: NodeConnection;

    /// Attempts to open a connection to the given node
    async fn open(&self, address: &NodeAddress) -> Result<Self::Connection>;
}

//! Command batch accumulation
//!
//! A [`CommandBatch`] collects commands from any number of producers and
//! partitions them by destination slot. Each slot gets a [`SlotBucket`]
//! holding the ordered sub-queue the executor later pipelines to the slot's
//! owner. Sequence numbers are assigned globally at enqueue time so the
//! final result list can be restored to enqueue order no matter how the
//! slots interleave.

use crate::command::{Command, ReplyCodec};
use crate::connection::PipelineFrame;
use crate::error::ClusterError;
use crate::types::{SequenceNumber, SlotId};
use crate::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// The per-slot sub-queue of a batch
///
/// The read-only flag starts true and latches false the first time a write
/// command lands in the bucket; it decides whether the executor may target
/// a replica.
#[derive(Debug)]
pub struct SlotBucket {
    slot: SlotId,
    read_only: AtomicBool,
    commands: Mutex<Vec<Arc<Command>>>,
}

impl SlotBucket {
    fn new(slot: SlotId) -> Self {
        Self {
            slot,
            read_only: AtomicBool::new(true),
            commands: Mutex::new(Vec::new()),
        }
    }

    /// Returns the slot this bucket belongs to
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Returns true while every command in the bucket is read-only
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    fn latch_write(&self) {
        self.read_only.store(false, Ordering::SeqCst);
    }

    fn push(&self, command: Arc<Command>) {
        self.commands.lock().expect("bucket poisoned").push(command);
    }

    /// Returns the bucket's commands in enqueue order
    pub fn commands(&self) -> Vec<Arc<Command>> {
        self.commands.lock().expect("bucket poisoned").clone()
    }

    /// Builds the wire frame for one attempt
    ///
    /// Commands whose response already latched on an earlier attempt are
    /// filtered out; when `ask` is set the one-shot ASKING probe is
    /// prepended so the target honors the transient redirect.
    pub fn build_frame(&self, ask: bool) -> PipelineFrame {
        let pending: Vec<Arc<Command>> = self
            .commands
            .lock()
            .expect("bucket poisoned")
            .iter()
            .filter(|c| !c.response().is_success())
            .cloned()
            .collect();
        if pending.is_empty() {
            return PipelineFrame::default();
        }
        let mut frame = Vec::with_capacity(pending.len() + 1);
        if ask {
            frame.push(Arc::new(Command::asking_probe()));
        }
        frame.extend(pending);
        PipelineFrame::new(frame)
    }

    /// Clears error state from every command, leaving successes latched
    ///
    /// Called before re-dispatching after a redirect or a loading reply.
    pub fn clear_errors(&self) {
        for command in self.commands.lock().expect("bucket poisoned").iter() {
            command.response().clear_error();
        }
    }
}

/// Accumulates commands for one batch execution
///
/// Enqueue may run from multiple producers until the batch executes; the
/// executed transition is a single compare-and-swap and happens exactly
/// once.
#[derive(Debug, Default)]
pub struct CommandBatch {
    buckets: Mutex<HashMap<SlotId, Arc<SlotBucket>>>,
    executed: AtomicBool,
    next_seq: AtomicU64,
}

impl CommandBatch {
    /// Creates an empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a command for the given slot
    ///
    /// Returns the sequence number that positions the command's reply in
    /// the final result list. Fails with
    /// [`ClusterError::BatchAlreadyExecuted`] once the batch has executed.
    pub fn enqueue(
        &self,
        read_only: bool,
        slot: SlotId,
        codec: ReplyCodec,
        opcode: impl Into<String>,
        args: Vec<Vec<u8>>,
    ) -> Result<SequenceNumber> {
        if self.executed.load(Ordering::SeqCst) {
            return Err(ClusterError::BatchAlreadyExecuted);
        }
        let bucket = {
            let mut buckets = self.buckets.lock().expect("batch poisoned");
            Arc::clone(
                buckets
                    .entry(slot)
                    .or_insert_with(|| Arc::new(SlotBucket::new(slot))),
            )
        };
        if !read_only {
            bucket.latch_write();
        }
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        bucket.push(Arc::new(Command::new(opcode, args, codec, seq)));
        Ok(seq)
    }

    /// Returns the number of queued commands
    pub fn len(&self) -> usize {
        self.next_seq.load(Ordering::SeqCst) as usize
    }

    /// Returns true if nothing has been queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Transitions the batch to the executed state
    ///
    /// Exactly one caller wins; everyone else gets
    /// [`ClusterError::BatchAlreadyExecuted`].
    pub(crate) fn mark_executed(&self) -> Result<()> {
        if self
            .executed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            Ok(())
        } else {
            Err(ClusterError::BatchAlreadyExecuted)
        }
    }

    /// Returns every bucket of the batch
    pub(crate) fn buckets(&self) -> Vec<Arc<SlotBucket>> {
        self.buckets
            .lock()
            .expect("batch poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Collects all replies, restored to enqueue order
    ///
    /// Every command must hold a successful reply; anything else is an
    /// internal error because the join only completes after all slots
    /// succeed.
    pub(crate) fn collect_ordered(&self) -> Result<Vec<crate::command::Reply>> {
        let buckets = self.buckets();
        let mut replies: Vec<(SequenceNumber, crate::command::Reply)> =
            Vec::with_capacity(self.len());
        for bucket in &buckets {
            for command in bucket.commands() {
                match command.response().peek() {
                    Some(Ok(reply)) => replies.push((command.seq(), reply)),
                    Some(Err(e)) => {
                        return Err(ClusterError::Internal {
                            component: "CommandBatch".to_string(),
                            details: format!(
                                "command {} completed exceptionally after join: {}",
                                command.seq(),
                                e
                            ),
                        })
                    }
                    None => {
                        return Err(ClusterError::Internal {
                            component: "CommandBatch".to_string(),
                            details: format!("command {} has no reply after join", command.seq()),
                        })
                    }
                }
            }
        }
        replies.sort_by_key(|(seq, _)| *seq);
        Ok(replies.into_iter().map(|(_, reply)| reply).collect())
    }
}

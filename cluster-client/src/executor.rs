//! Slot-partitioned batch execution
//!
//! [`BatchExecutor::execute`] fans a batch's slot buckets out to concurrent
//! per-slot state machines. Each machine runs an explicit attempt loop:
//! acquire a connection, write the pipeline, await the replies. A retry
//! window gates pre-response progress, a response timer takes over once the
//! write flushes, MOVED/ASK redirects re-route without consuming retry
//! budget, and the first fatal failure from any slot cancels its peers.
//! Results come back in enqueue order regardless of slot interleaving.

use crate::batch::{CommandBatch, SlotBucket};
use crate::command::Reply;
use crate::connection::{ConnectionFactory, NodeConnection, ResponseHandle};
use crate::error::ClusterError;
use crate::metrics::{BatchMetrics, BatchMetricsSnapshot};
use crate::router::{NodeRouter, NodeSource, Redirect};
use crate::types::{ClusterConfig, NodeAddress};
use crate::Result;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinSet;

/// Gate that refuses new work once shutdown begins and lets the caller
/// wait for in-flight slot executions to drain
#[derive(Debug, Default)]
pub struct ShutdownLatch {
    closed: AtomicBool,
    active: AtomicUsize,
    drained: Notify,
}

impl ShutdownLatch {
    /// Creates an open latch
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a unit of in-flight work
    ///
    /// Fails with [`ClusterError::Shutdown`] once the latch has closed. The
    /// returned guard deregisters on drop, on every exit path.
    pub fn enter(self: &Arc<Self>) -> Result<ShutdownGuard> {
        self.active.fetch_add(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            self.leave();
            return Err(ClusterError::Shutdown);
        }
        Ok(ShutdownGuard {
            latch: Arc::clone(self),
        })
    }

    /// Returns true once shutdown has begun
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closes the latch and waits for in-flight work to drain
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        loop {
            let notified = self.drained.notified();
            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn leave(&self) {
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }
}

/// Registration held while a slot execution is in flight
#[derive(Debug)]
pub struct ShutdownGuard {
    latch: Arc<ShutdownLatch>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.latch.leave();
    }
}

struct SlotContext<F: ConnectionFactory> {
    router: Arc<dyn NodeRouter<F>>,
    config: Arc<ClusterConfig>,
    latch: Arc<ShutdownLatch>,
    metrics: Arc<BatchMetrics>,
}

/// What one slot attempt produced
enum AttemptOutcome {
    /// Every command in the bucket holds its reply
    Completed,
    /// The cluster redirected the bucket; re-dispatch at the same attempt
    Redirected(NodeSource),
    /// The target is loading its dataset; retry the same source in place
    NodeLoading,
    /// The attempt failed; the cause (when one was captured) feeds the
    /// final operation-timeout
    Failed(Option<ClusterError>),
    /// Non-recoverable; terminates the whole batch
    Fatal(ClusterError),
}

/// Executes command batches against a routed cluster
pub struct BatchExecutor<F: ConnectionFactory> {
    router: Arc<dyn NodeRouter<F>>,
    config: Arc<ClusterConfig>,
    latch: Arc<ShutdownLatch>,
    metrics: Arc<BatchMetrics>,
}

impl<F: ConnectionFactory> Clone for BatchExecutor<F> {
    fn clone(&self) -> Self {
        Self {
            router: Arc::clone(&self.router),
            config: Arc::clone(&self.config),
            latch: Arc::clone(&self.latch),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl<F: ConnectionFactory> BatchExecutor<F> {
    /// Creates an executor over the given router
    pub fn new(router: Arc<dyn NodeRouter<F>>, config: ClusterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            router,
            config: Arc::new(config),
            latch: Arc::new(ShutdownLatch::new()),
            metrics: Arc::new(BatchMetrics::new()),
        })
    }

    /// Returns the executor's configuration
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Takes a point-in-time copy of the executor counters
    pub fn metrics(&self) -> BatchMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Refuses new batches and waits for in-flight slots to drain
    ///
    /// Pools are shut down separately by their owner; this only stops the
    /// executor's own work.
    pub async fn shutdown(&self) {
        self.latch.shutdown().await;
        tracing::info!("batch executor drained");
    }

    /// Executes the batch and returns the replies in enqueue order
    ///
    /// The batch transitions to the executed state exactly once; a second
    /// submission fails with [`ClusterError::BatchAlreadyExecuted`]. The
    /// first fatal failure from any slot terminates the join; peer slots
    /// are cancelled at their next suspension point. Dropping the returned
    /// future cancels every in-flight slot the same way.
    pub async fn execute(&self, batch: &CommandBatch) -> Result<Vec<Reply>> {
        batch.mark_executed()?;
        self.metrics.record_batch();

        let buckets = batch.buckets();
        if buckets.is_empty() {
            return Ok(Vec::new());
        }
        tracing::debug!(
            "executing batch of {} commands across {} slots",
            batch.len(),
            buckets.len()
        );

        let mut slots: JoinSet<Result<()>> = JoinSet::new();
        for bucket in buckets {
            let ctx = SlotContext {
                router: Arc::clone(&self.router),
                config: Arc::clone(&self.config),
                latch: Arc::clone(&self.latch),
                metrics: Arc::clone(&self.metrics),
            };
            slots.spawn(execute_slot(ctx, bucket));
        }

        let mut first_failure: Option<ClusterError> = None;
        while let Some(joined) = slots.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if first_failure.is_none() {
                        first_failure = Some(e);
                        slots.abort_all();
                    }
                }
                Err(join_err) if join_err.is_cancelled() => {}
                Err(join_err) => {
                    if first_failure.is_none() {
                        first_failure = Some(ClusterError::Internal {
                            component: "BatchExecutor".to_string(),
                            details: join_err.to_string(),
                        });
                        slots.abort_all();
                    }
                }
            }
        }

        if let Some(e) = first_failure {
            self.metrics.record_batch_failure();
            tracing::debug!("batch failed: {}", e);
            return Err(e);
        }
        batch.collect_ordered()
    }
}

/// Drives one slot bucket to completion
///
/// The attempt counter is explicit: redirects and loading replies re-enter
/// at the same attempt, while window expiries, write failures, and response
/// timeouts consume budget until `retry_attempts` is exhausted.
async fn execute_slot<F: ConnectionFactory>(
    ctx: SlotContext<F>,
    bucket: Arc<SlotBucket>,
) -> Result<()> {
    let _shutdown = ctx.latch.enter()?;
    let slot = bucket.slot();
    let mut source = NodeSource::for_slot(slot);
    let mut attempt: u32 = 0;
    let mut last_cause: Option<ClusterError> = None;

    loop {
        match run_attempt(&ctx, &bucket, &source).await {
            AttemptOutcome::Completed => return Ok(()),
            AttemptOutcome::Redirected(next) => {
                bucket.clear_errors();
                ctx.metrics.record_redirect();
                tracing::debug!("slot {} redirected to {:?}", slot, next.address);
                source = next;
            }
            AttemptOutcome::NodeLoading => {
                bucket.clear_errors();
                tracing::debug!("slot {} target is loading, re-dispatching", slot);
            }
            AttemptOutcome::Failed(cause) => {
                if let Some(cause) = cause {
                    tracing::debug!("slot {} attempt {} failed: {}", slot, attempt, cause);
                    last_cause = Some(cause);
                }
                if attempt >= ctx.config.retry_attempts {
                    return Err(ClusterError::OperationTimeout {
                        slot,
                        attempts: attempt + 1,
                        cause: last_cause.map(Box::new),
                    });
                }
                attempt += 1;
                ctx.metrics.record_retry();
                if source.redirect == Redirect::Ask {
                    // An ASK hint is spent with its attempt; fall back to
                    // the slot owner.
                    source = NodeSource::for_slot(slot);
                }
            }
            AttemptOutcome::Fatal(e) => return Err(e),
        }
    }
}

/// Runs one (acquire, write, await) attempt for a bucket
async fn run_attempt<F: ConnectionFactory>(
    ctx: &SlotContext<F>,
    bucket: &SlotBucket,
    source: &NodeSource,
) -> AttemptOutcome {
    let retry_window = tokio::time::sleep(ctx.config.retry_window());
    tokio::pin!(retry_window);

    let send_phase = send_pipeline_phase(ctx, bucket, source);
    tokio::pin!(send_phase);

    // Pre-response progress races the retry window. If the window fires
    // first the in-flight sub-future is dropped, which releases any
    // connection slot it held.
    let sent = tokio::select! {
        res = &mut send_phase => res,
        _ = &mut retry_window => return AttemptOutcome::Failed(None),
    };

    let (handle, address) = match sent {
        Ok(Some(pair)) => pair,
        Ok(None) => return AttemptOutcome::Completed,
        Err(e @ ClusterError::Shutdown) => return AttemptOutcome::Fatal(e),
        Err(e) => {
            // Acquisition and write failures progress on the retry timer,
            // not immediately; the cause is kept for the final error.
            retry_window.as_mut().await;
            return AttemptOutcome::Failed(Some(e));
        }
    };

    // The write flushed: the retry window no longer applies and the
    // response timer takes over. The connection is already back in its
    // pool; replies arrive on the channel regardless of pool occupancy.
    match tokio::time::timeout(ctx.config.response_timeout(), handle.wait()).await {
        Ok(Ok(())) => AttemptOutcome::Completed,
        Ok(Err(ClusterError::Moved { slot, address })) => {
            AttemptOutcome::Redirected(NodeSource::moved(slot, address))
        }
        Ok(Err(ClusterError::Ask { slot, address })) => {
            AttemptOutcome::Redirected(NodeSource::ask(slot, address))
        }
        Ok(Err(ClusterError::Loading)) => AttemptOutcome::NodeLoading,
        Ok(Err(e)) => AttemptOutcome::Fatal(e),
        Err(_) => AttemptOutcome::Failed(Some(ClusterError::ResponseTimeout {
            address,
            timeout_ms: ctx.config.response_timeout_ms,
        })),
    }
}

/// Acquires a connection, writes the bucket's pipeline, and releases the
/// connection once the write has flushed
///
/// Returns `Ok(None)` when every command already latched a reply on an
/// earlier attempt and there is nothing left to send.
async fn send_pipeline_phase<F: ConnectionFactory>(
    ctx: &SlotContext<F>,
    bucket: &SlotBucket,
    source: &NodeSource,
) -> Result<Option<(ResponseHandle, NodeAddress)>> {
    let pool = ctx.router.pool_for(source)?;
    let mut conn = match &source.address {
        Some(address) => pool.acquire_at(address).await?,
        None if bucket.is_read_only() => pool.acquire_read().await?,
        None => pool.acquire_write().await?,
    };

    let frame = bucket.build_frame(source.redirect == Redirect::Ask);
    if frame.is_empty() {
        return Ok(None);
    }

    let address = conn.address().clone();
    let handle = conn.send_pipeline(frame).await.map_err(|e| match e {
        e @ ClusterError::WriteFailed { .. } => e,
        other => ClusterError::WriteFailed {
            address: address.clone(),
            details: other.to_string(),
        },
    })?;
    drop(conn);
    Ok(Some((handle, address)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_latch_enter_and_drain() {
        let latch = Arc::new(ShutdownLatch::new());
        let guard = latch.enter().unwrap();
        assert!(!latch.is_closed());

        let waiter = {
            let latch = Arc::clone(&latch);
            tokio::spawn(async move { latch.shutdown().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert!(latch.is_closed());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("shutdown should drain once the guard drops")
            .unwrap();
    }

    #[tokio::test]
    async fn test_latch_rejects_entry_after_shutdown() {
        let latch = Arc::new(ShutdownLatch::new());
        latch.shutdown().await;
        assert!(matches!(latch.enter(), Err(ClusterError::Shutdown)));
    }

    #[tokio::test]
    async fn test_latch_shutdown_with_no_work_returns_immediately() {
        let latch = Arc::new(ShutdownLatch::new());
        tokio::time::timeout(Duration::from_millis(100), latch.shutdown())
            .await
            .expect("empty latch must not block");
    }
}

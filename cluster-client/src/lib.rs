//! Q-Cluster-KV Client Core
//!
//! The correctness-critical core of a clustered key-value-store client: a
//! slot-partitioned command-batch executor and a per-node connection pool
//! with failure detection and reconnection.
//!
//! # Features
//!
//! - Batch accumulation partitioned by keyspace slot, with results restored
//!   to enqueue order after the scatter-gather completes
//! - At-least-once retry under per-attempt deadlines, with MOVED/ASK
//!   cluster redirects handled without consuming retry budget
//! - Bounded per-node connection reuse with round-robin balancing and
//!   parallel warm-up
//! - Health-based quarantine: entries freeze after consecutive connection
//!   failures and rejoin only after a reconnection probe (open, AUTH, PING)
//!   verifies the endpoint
//! - Graceful shutdown that drains in-flight work
//!
//! The wire protocol and the topology manager live outside this crate and
//! plug in through the [`NodeConnection`], [`ConnectionFactory`], and
//! [`NodeRouter`] traits.
//!
//! # Example
//!
//! ```ignore
//! use q_cluster_kv_client::{
//!     BatchExecutor, ClusterConfig, CommandBatch, ConnectionPool, NodeRole,
//!     NoopEvents, ReplyCodec, StaticRouter,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let factory = Arc::new(MyTransport::new());
//!     let config = ClusterConfig::default().with_retry_attempts(2);
//!
//!     let pool = Arc::new(ConnectionPool::new(
//!         factory,
//!         Arc::new(config.clone()),
//!         Arc::new(NoopEvents),
//!     ));
//!     pool.add_node("node1:7000".into(), NodeRole::Master);
//!     pool.init_connections().await?;
//!
//!     let executor = BatchExecutor::new(Arc::new(StaticRouter::new(pool)), config)?;
//!
//!     let batch = CommandBatch::new();
//!     batch.enqueue(false, 0, ReplyCodec::Verbatim, "SET", vec![b"k".to_vec(), b"v".to_vec()])?;
//!     batch.enqueue(true, 0, ReplyCodec::Utf8, "GET", vec![b"k".to_vec()])?;
//!
//!     let replies = executor.execute(&batch).await?;
//!     println!("{:?}", replies);
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod command;
pub mod connection;
pub mod error;
pub mod events;
pub mod executor;
pub mod metrics;
pub mod pool;
pub mod router;
pub mod types;

pub use batch::{CommandBatch, SlotBucket};
pub use command::{Command, RawReply, Reply, ReplyCodec, ResponseSlot};
pub use connection::{
    ConnectionFactory, NodeConnection, PipelineFrame, ResponseHandle, ResponseSender,
};
pub use error::ClusterError;
pub use events::{ClusterEvents, NoopEvents};
pub use executor::{BatchExecutor, ShutdownGuard, ShutdownLatch};
pub use metrics::{BatchMetrics, BatchMetricsSnapshot, PoolMetrics, PoolMetricsSnapshot};
pub use pool::{ConnectionEntry, ConnectionPool, EntryState, PooledConnection, PoolState};
pub use router::{NodeRouter, NodeSource, Redirect, StaticRouter};
pub use types::{
    ClusterConfig, FreezeReason, LogConfig, LogFormat, LogLevel, NodeAddress, NodeRole,
    SequenceNumber, SlotId,
};

/// Result type alias using ClusterError
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Initializes logging based on configuration
///
/// Respects `RUST_LOG` when set; otherwise falls back to the configured
/// level. Call once at process start.
pub fn init_logging(log_config: &LogConfig) {
    use tracing_subscriber::fmt::format::FmtSpan;
    use tracing_subscriber::EnvFilter;

    let level_filter = match log_config.level {
        LogLevel::Trace => "trace",
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_filter));

    match log_config.format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .json()
                .with_span_events(FmtSpan::CLOSE)
                .with_current_span(true)
                .with_thread_ids(log_config.include_thread_ids)
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_span_events(FmtSpan::CLOSE)
                .with_thread_ids(log_config.include_thread_ids)
                .init();
        }
    }
}

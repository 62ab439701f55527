//! Error types for the Q-Cluster-KV client core
//!
//! This module defines the error hierarchy for the batch executor and the
//! connection pool, together with the classification helpers the retry
//! machinery relies on.

use crate::types::{NodeAddress, SlotId};
use thiserror::Error;

/// The main error type for the client core
///
/// Covers connection, pool, write, and timeout failures, the cluster
/// redirection signals, and programmer errors. The redirection variants
/// (`Moved`, `Ask`, `Loading`) are recovered internally by the executor and
/// never escape a batch execution.
#[derive(Error, Debug, Clone)]
pub enum ClusterError {
    // Programmer errors
    /// The batch was submitted after it had already executed
    #[error("Batch has already been executed")]
    BatchAlreadyExecuted,

    /// A configuration parameter is out of range
    #[error("Invalid configuration: {parameter} {details}")]
    InvalidConfig {
        /// The offending parameter
        parameter: String,
        /// What is wrong with it
        details: String,
    },

    // Lifecycle errors
    /// The client is shutting down; no further acquisition is possible
    #[error("Client is shutting down")]
    Shutdown,

    // Connection errors
    /// Connection attempt timed out
    #[error("Connection timeout to {address} after {timeout_ms}ms")]
    ConnectionTimeout {
        /// The node that failed to connect
        address: NodeAddress,
        /// The timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Connection was refused by the node
    #[error("Connection refused by {address}")]
    ConnectionRefused {
        /// The node that refused the connection
        address: NodeAddress,
    },

    /// Connection could not be established or was lost
    #[error("Connection to {address} failed: {details}")]
    ConnectionFailed {
        /// The node the connection targeted
        address: NodeAddress,
        /// Details about the failure
        details: String,
    },

    /// No entry in the pool could supply a connection
    #[error("Connection pool exhausted (frozen: {frozen:?}, saturated: {saturated:?})")]
    PoolExhausted {
        /// Hosts skipped because they are frozen
        frozen: Vec<String>,
        /// Hosts skipped because they are at their connection cap
        saturated: Vec<String>,
    },

    /// The address is not part of the pool
    #[error("Unknown node: {address}")]
    UnknownNode {
        /// The address that could not be resolved
        address: NodeAddress,
    },

    /// Pool warm-up aborted because one connection could not be opened
    #[error("Warm-up of {address} failed: {details}")]
    WarmupFailed {
        /// The entry being warmed
        address: NodeAddress,
        /// The failure that aborted warm-up
        details: String,
    },

    // Wire errors
    /// I/O failure before the server acknowledged the write
    #[error("Write to {address} failed: {details}")]
    WriteFailed {
        /// The node the pipeline targeted
        address: NodeAddress,
        /// Details about the failure
        details: String,
    },

    /// The server did not reply within the response timeout
    #[error("No response from {address} within {timeout_ms}ms")]
    ResponseTimeout {
        /// The node the pipeline targeted
        address: NodeAddress,
        /// The response timeout in milliseconds
        timeout_ms: u64,
    },

    /// The attempt budget was exhausted before any response arrived
    #[error("Slot {slot} gave up after {attempts} attempts")]
    OperationTimeout {
        /// The slot whose sub-queue could not be executed
        slot: SlotId,
        /// Number of attempts consumed
        attempts: u32,
        /// The last captured per-attempt cause, if any
        #[source]
        cause: Option<Box<ClusterError>>,
    },

    // Cluster redirection signals (internal; recovered by the executor)
    /// Permanent redirect: the slot has moved to another node
    #[error("MOVED slot {slot} to {address}")]
    Moved {
        /// The slot that moved
        slot: SlotId,
        /// The node that now owns the slot
        address: NodeAddress,
    },

    /// Transient redirect during resharding, valid for the next attempt only
    #[error("ASK slot {slot} at {address}")]
    Ask {
        /// The slot being migrated
        slot: SlotId,
        /// The node to ask
        address: NodeAddress,
    },

    /// The node is still loading its dataset
    #[error("Node is loading its dataset")]
    Loading,

    // Server-side errors
    /// An error reply passed through from the wire unchanged
    #[error("Server error: {message}")]
    ServerError {
        /// The server's error message
        message: String,
    },

    /// Authentication was rejected during connection setup or probing
    ///
    /// Not retryable: a rejected credential does not heal on its own. The
    /// reconnection probe still re-arms after it, as after any probe
    /// failure.
    #[error("Authentication failed: {reason}")]
    AuthenticationFailed {
        /// The reason for the rejection
        reason: String,
    },

    /// A reconnection probe got something other than PONG back
    #[error("Probe of {address} rejected: {reply}")]
    ProbeRejected {
        /// The quarantined node being probed
        address: NodeAddress,
        /// The reply that failed the PONG check
        reply: String,
    },

    /// A reply could not be decoded into the requested shape
    #[error("Failed to decode reply: {details}")]
    DecodeFailed {
        /// What went wrong during decoding
        details: String,
    },

    // Internal errors
    /// Internal invariant violation
    #[error("Internal error in {component}: {details}")]
    Internal {
        /// The component where the error occurred
        component: String,
        /// Details about the internal error
        details: String,
    },
}

impl ClusterError {
    /// Returns true if this error consumes retry budget and may succeed on
    /// a later attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClusterError::ConnectionTimeout { .. }
                | ClusterError::ConnectionRefused { .. }
                | ClusterError::ConnectionFailed { .. }
                | ClusterError::PoolExhausted { .. }
                | ClusterError::WriteFailed { .. }
                | ClusterError::ResponseTimeout { .. }
        )
    }

    /// Returns true if this error is a cluster redirection hint
    pub fn is_redirect(&self) -> bool {
        matches!(self, ClusterError::Moved { .. } | ClusterError::Ask { .. })
    }

    /// Returns true if this error is recovered in place without consuming
    /// retry budget
    pub fn is_recoverable_in_place(&self) -> bool {
        self.is_redirect() || matches!(self, ClusterError::Loading)
    }

    /// Returns true if this error is a connection-level failure
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            ClusterError::ConnectionTimeout { .. }
                | ClusterError::ConnectionRefused { .. }
                | ClusterError::ConnectionFailed { .. }
        )
    }
}

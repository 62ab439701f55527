//! Core data types for the Q-Cluster-KV client core
//!
//! This module defines the fundamental identifiers, node descriptors, and
//! configuration types used by the batch executor and the connection pool.

use crate::error::ClusterError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Keyspace partition identifier
///
/// Every key hashes to exactly one slot, and every slot is owned by exactly
/// one master node at any topology epoch.
pub type SlotId = u16;

/// Monotonic per-batch sequence number assigned at enqueue time
///
/// Governs the ordering of the final result list, independent of the order
/// in which slots finish executing.
pub type SequenceNumber = u64;

/// Network address of a cluster node (`host:port`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddress(String);

impl NodeAddress {
    /// Creates a new node address
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    /// Returns the address as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeAddress {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeAddress {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Role of a node within its shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    /// Master node; accepts reads and writes
    Master,
    /// Replica node; accepts reads only
    Replica,
}

/// Why a connection entry is excluded from acquisition
///
/// An entry with no freeze reason is live. The reason is set together with
/// the frozen state, so a frozen entry always carries one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FreezeReason {
    /// Quarantined after repeated connection failures; a reconnection probe
    /// is in flight and is the only path back to the live state
    Reconnect,
    /// The client is shutting down, or the entry is administratively frozen
    /// pending a topology handover
    System,
    /// Frozen by an operator
    Manual,
}

/// Configuration for the batch executor and the connection pools
///
/// Timeouts follow a three-timer model: the retry window gates pre-response
/// progress (connection acquisition plus write), the response timeout gates
/// server-reply latency once a write has flushed, and the reconnect timeout
/// paces reconnection probes for quarantined entries.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Number of additional attempts after the first one fails (>= 0)
    pub retry_attempts: u32,
    /// Base retry interval; the effective attempt window is
    /// `retry_interval_ms * retry_interval_multiplier` milliseconds
    pub retry_interval_ms: u64,
    /// Multiplier applied to `retry_interval_ms` to form the attempt window
    pub retry_interval_multiplier: u64,
    /// How long to wait for server replies after a successful write
    pub response_timeout_ms: u64,
    /// Delay between reconnection probes for a quarantined entry
    pub reconnect_timeout_ms: u64,
    /// Consecutive connection failures that trip quarantine
    pub failed_attempts_threshold: u32,
    /// Idle connections opened per entry during warm-up
    pub min_idle_per_entry: u32,
    /// Upper bound on connections per entry (idle + in use)
    pub max_connections_per_entry: u32,
    /// Password for endpoints that require authentication
    pub password: Option<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_interval_ms: 15,
            retry_interval_multiplier: 100,
            response_timeout_ms: 3000,
            reconnect_timeout_ms: 3000,
            failed_attempts_threshold: 5,
            min_idle_per_entry: 1,
            max_connections_per_entry: 10,
            password: None,
        }
    }
}

impl ClusterConfig {
    /// Sets the retry attempt budget
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Sets the base retry interval in milliseconds
    pub fn with_retry_interval(mut self, interval_ms: u64) -> Self {
        self.retry_interval_ms = interval_ms;
        self
    }

    /// Sets the retry interval multiplier
    pub fn with_retry_interval_multiplier(mut self, multiplier: u64) -> Self {
        self.retry_interval_multiplier = multiplier;
        self
    }

    /// Sets the response timeout in milliseconds
    pub fn with_response_timeout(mut self, timeout_ms: u64) -> Self {
        self.response_timeout_ms = timeout_ms;
        self
    }

    /// Sets the reconnection probe interval in milliseconds
    pub fn with_reconnect_timeout(mut self, timeout_ms: u64) -> Self {
        self.reconnect_timeout_ms = timeout_ms;
        self
    }

    /// Sets the consecutive-failure threshold that trips quarantine
    pub fn with_failed_attempts_threshold(mut self, threshold: u32) -> Self {
        self.failed_attempts_threshold = threshold;
        self
    }

    /// Sets the per-entry warm-up target
    pub fn with_min_idle_per_entry(mut self, min_idle: u32) -> Self {
        self.min_idle_per_entry = min_idle;
        self
    }

    /// Sets the per-entry connection cap
    pub fn with_max_connections_per_entry(mut self, max: u32) -> Self {
        self.max_connections_per_entry = max;
        self
    }

    /// Sets the password used for AUTH during connection setup and probing
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Validates the configuration
    ///
    /// Rejects zero-valued timers and caps, and a warm-up target that could
    /// never fit under the connection cap.
    pub fn validate(&self) -> Result<()> {
        if self.retry_interval_ms == 0 {
            return Err(ClusterError::InvalidConfig {
                parameter: "retry_interval_ms".to_string(),
                details: "must be greater than zero".to_string(),
            });
        }
        if self.retry_interval_multiplier == 0 {
            return Err(ClusterError::InvalidConfig {
                parameter: "retry_interval_multiplier".to_string(),
                details: "must be greater than zero".to_string(),
            });
        }
        if self.response_timeout_ms == 0 {
            return Err(ClusterError::InvalidConfig {
                parameter: "response_timeout_ms".to_string(),
                details: "must be greater than zero".to_string(),
            });
        }
        if self.reconnect_timeout_ms == 0 {
            return Err(ClusterError::InvalidConfig {
                parameter: "reconnect_timeout_ms".to_string(),
                details: "must be greater than zero".to_string(),
            });
        }
        if self.failed_attempts_threshold == 0 {
            return Err(ClusterError::InvalidConfig {
                parameter: "failed_attempts_threshold".to_string(),
                details: "must be greater than zero".to_string(),
            });
        }
        if self.max_connections_per_entry == 0 {
            return Err(ClusterError::InvalidConfig {
                parameter: "max_connections_per_entry".to_string(),
                details: "must be greater than zero".to_string(),
            });
        }
        if self.min_idle_per_entry > self.max_connections_per_entry {
            return Err(ClusterError::InvalidConfig {
                parameter: "min_idle_per_entry".to_string(),
                details: format!(
                    "must not exceed max_connections_per_entry ({})",
                    self.max_connections_per_entry
                ),
            });
        }
        Ok(())
    }

    /// The attempt window gating connection acquisition and the write
    pub fn retry_window(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms * self.retry_interval_multiplier)
    }

    /// The server-reply deadline armed after a successful write
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// The delay between reconnection probes
    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_timeout_ms)
    }
}

/// Log verbosity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    /// Trace-level logging (very verbose)
    Trace,
    /// Debug-level logging
    Debug,
    /// Info-level logging
    Info,
    /// Warning-level logging
    Warn,
    /// Error-level logging only
    Error,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogFormat {
    /// Human-readable text output
    Text,
    /// Structured JSON output
    Json,
}

/// Logging configuration consumed by [`crate::init_logging`]
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum level to emit
    pub level: LogLevel,
    /// Output format
    pub format: LogFormat,
    /// Whether to include thread IDs in log records
    pub include_thread_ids: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Text,
            include_thread_ids: false,
        }
    }
}

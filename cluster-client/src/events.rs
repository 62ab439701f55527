//! Cluster event observers
//!
//! The pool reports health transitions through this trait: a `disconnect`
//! when an entry enters quarantine, and `slave_down` / `slave_up` so the
//! topology manager can take a replica out of and back into rotation.
//! Observers are synchronous and fire-and-forget; they must not block.

use crate::types::NodeAddress;

/// Observer for connection-pool health transitions
pub trait ClusterEvents: Send + Sync {
    /// An entry entered quarantine after `failed_attempts` consecutive
    /// connection failures
    fn disconnect(&self, _address: &NodeAddress, _failed_attempts: u32) {}

    /// A replica entry was taken out of rotation
    fn slave_down(&self, _address: &NodeAddress) {}

    /// A replica entry passed its reconnection probe and is back in rotation
    fn slave_up(&self, _address: &NodeAddress) {}
}

/// An observer that ignores every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEvents;

impl ClusterEvents for NoopEvents {}

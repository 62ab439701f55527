//! Slot routing contract
//!
//! The topology manager lives outside this crate; the executor only needs
//! a way to turn a [`NodeSource`] into a [`ConnectionPool`]. Routers must
//! honor explicit addresses carried by MOVED/ASK redirects, which supersede
//! the slot-owner mapping.

use crate::connection::ConnectionFactory;
use crate::pool::ConnectionPool;
use crate::types::{NodeAddress, SlotId};
use crate::Result;
use std::sync::Arc;

/// The kind of redirect a routing hint carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redirect {
    /// No redirect; route by slot ownership
    None,
    /// Permanent redirect; the topology changed
    Moved,
    /// One-shot redirect during live resharding; the next wire frame must
    /// lead with an ASKING probe
    Ask,
}

/// Routing hint the executor hands to the router for each attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSource {
    /// The slot being executed
    pub slot: SlotId,
    /// Explicit target address from a redirect, if any
    pub address: Option<NodeAddress>,
    /// How the address came to be
    pub redirect: Redirect,
}

impl NodeSource {
    /// A plain slot-owner lookup
    pub fn for_slot(slot: SlotId) -> Self {
        Self {
            slot,
            address: None,
            redirect: Redirect::None,
        }
    }

    /// A permanent redirect to the slot's new owner
    pub fn moved(slot: SlotId, address: NodeAddress) -> Self {
        Self {
            slot,
            address: Some(address),
            redirect: Redirect::Moved,
        }
    }

    /// A one-shot redirect valid for the next attempt only
    pub fn ask(slot: SlotId, address: NodeAddress) -> Self {
        Self {
            slot,
            address: Some(address),
            redirect: Redirect::Ask,
        }
    }
}

/// Resolves routing hints to connection pools
pub trait NodeRouter<F: ConnectionFactory>: Send + Sync {
    /// Returns the pool serving the given source
    ///
    /// When the source carries an explicit address, the returned pool must
    /// contain an entry for it.
    fn pool_for(&self, source: &NodeSource) -> Result<Arc<ConnectionPool<F>>>;
}

/// A router for single-shard topologies: every slot maps to the same pool
///
/// Redirect address overrides resolve inside the pool, which holds an entry
/// per endpoint.
pub struct StaticRouter<F: ConnectionFactory> {
    pool: Arc<ConnectionPool<F>>,
}

impl<F: ConnectionFactory> StaticRouter<F> {
    /// Creates a router serving everything from one pool
    pub fn new(pool: Arc<ConnectionPool<F>>) -> Self {
        Self { pool }
    }

    /// Returns the backing pool
    pub fn pool(&self) -> &Arc<ConnectionPool<F>> {
        &self.pool
    }
}

impl<F: ConnectionFactory> NodeRouter<F> for StaticRouter<F> {
    fn pool_for(&self, _source: &NodeSource) -> Result<Arc<ConnectionPool<F>>> {
        Ok(Arc::clone(&self.pool))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_source_constructors() {
        let plain = NodeSource::for_slot(12);
        assert_eq!(plain.slot, 12);
        assert!(plain.address.is_none());
        assert_eq!(plain.redirect, Redirect::None);

        let moved = NodeSource::moved(12, NodeAddress::from("node2:7000"));
        assert_eq!(moved.redirect, Redirect::Moved);
        assert_eq!(moved.address, Some(NodeAddress::from("node2:7000")));

        let ask = NodeSource::ask(12, NodeAddress::from("node3:7000"));
        assert_eq!(ask.redirect, Redirect::Ask);
    }
}

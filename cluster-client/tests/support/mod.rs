//! In-process mock cluster for integration tests
//!
//! Each mock node carries a script of actions consumed one per received
//! pipeline frame: echo the commands back, redirect them, stay silent,
//! fail the write, and so on. Once the script runs dry a node echoes.

#![allow(dead_code)]

use async_trait::async_trait;
use q_cluster_kv_client::{
    ClusterConfig, ClusterError, ClusterEvents, ConnectionFactory, ConnectionPool, NodeAddress,
    NodeConnection, NodeRole, NodeRouter, NodeSource, PipelineFrame, RawReply, Reply,
    ResponseHandle, ResponseSender, Result, SlotId,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Connect timeout reported by scripted open timeouts
pub const CONNECT_TIMEOUT_MS: u64 = 100;

/// What a node does with the next pipeline frame it receives
#[derive(Debug)]
pub enum NodeAction {
    /// Reply to each command with its first argument (or `OK`)
    Echo,
    /// Fail the frame with a MOVED redirect
    Moved { slot: SlotId, to: NodeAddress },
    /// Fail the frame with an ASK redirect
    Ask { slot: SlotId, to: NodeAddress },
    /// Fail the frame with a loading reply
    Loading,
    /// Accept the write but never answer
    Silent,
    /// Fail the write before it reaches the server
    FailWrite,
    /// Fail the frame with a server error
    ServerError(String),
}

/// One scripted endpoint of the mock cluster
#[derive(Debug)]
pub struct MockNode {
    address: NodeAddress,
    script: Mutex<VecDeque<NodeAction>>,
    open_failures: AtomicU32,
    open_timeouts: AtomicU32,
    auth_failures: AtomicU32,
    ping_failures: AtomicU32,
    opened: AtomicU32,
    pings: AtomicU32,
    auths: Mutex<Vec<String>>,
    frames: Mutex<Vec<Vec<String>>>,
    parked: Mutex<Vec<ResponseSender>>,
}

impl MockNode {
    fn new(address: NodeAddress) -> Self {
        Self {
            address,
            script: Mutex::new(VecDeque::new()),
            open_failures: AtomicU32::new(0),
            open_timeouts: AtomicU32::new(0),
            auth_failures: AtomicU32::new(0),
            ping_failures: AtomicU32::new(0),
            opened: AtomicU32::new(0),
            pings: AtomicU32::new(0),
            auths: Mutex::new(Vec::new()),
            frames: Mutex::new(Vec::new()),
            parked: Mutex::new(Vec::new()),
        }
    }

    /// Queues actions consumed one per received frame
    pub fn script(&self, actions: Vec<NodeAction>) {
        self.script.lock().unwrap().extend(actions);
    }

    /// Makes the next `n` connection attempts fail with a refusal
    pub fn fail_opens(&self, n: u32) {
        self.open_failures.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` connection attempts fail with a connect timeout
    pub fn time_out_opens(&self, n: u32) {
        self.open_timeouts.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` AUTH attempts fail
    pub fn fail_auths(&self, n: u32) {
        self.auth_failures.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` pings fail
    pub fn fail_pings(&self, n: u32) {
        self.ping_failures.store(n, Ordering::SeqCst);
    }

    /// Opcode lists of every frame the node received, in arrival order
    pub fn frames(&self) -> Vec<Vec<String>> {
        self.frames.lock().unwrap().clone()
    }

    /// Number of connections opened to this node
    pub fn opened(&self) -> u32 {
        self.opened.load(Ordering::SeqCst)
    }

    /// Number of pings answered
    pub fn pings(&self) -> u32 {
        self.pings.load(Ordering::SeqCst)
    }

    /// Passwords seen by AUTH, in arrival order
    pub fn auths(&self) -> Vec<String> {
        self.auths.lock().unwrap().clone()
    }
}

/// Factory handing out connections to scripted mock nodes
///
/// Nodes are created on first contact; grab them with [`node`](Self::node)
/// to script behaviors and inspect traffic.
#[derive(Clone, Default)]
pub struct MockCluster {
    nodes: Arc<Mutex<HashMap<NodeAddress, Arc<MockNode>>>>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the node at `addr`, creating it if needed
    pub fn node(&self, addr: &str) -> Arc<MockNode> {
        let address = NodeAddress::from(addr);
        Arc::clone(
            self.nodes
                .lock()
                .unwrap()
                .entry(address.clone())
                .or_insert_with(|| Arc::new(MockNode::new(address))),
        )
    }
}

#[async_trait]
impl ConnectionFactory for MockCluster {
    type Connection = MockConnection;

    async fn open(&self, address: &NodeAddress) -> Result<MockConnection> {
        let node = self.node(address.as_str());
        let timeouts = node.open_timeouts.load(Ordering::SeqCst);
        if timeouts > 0 {
            node.open_timeouts.store(timeouts - 1, Ordering::SeqCst);
            return Err(ClusterError::ConnectionTimeout {
                address: address.clone(),
                timeout_ms: CONNECT_TIMEOUT_MS,
            });
        }
        let remaining = node.open_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            node.open_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ClusterError::ConnectionRefused {
                address: address.clone(),
            });
        }
        node.opened.fetch_add(1, Ordering::SeqCst);
        Ok(MockConnection {
            address: address.clone(),
            node,
        })
    }
}

#[derive(Debug)]
pub struct MockConnection {
    address: NodeAddress,
    node: Arc<MockNode>,
}

#[async_trait]
impl NodeConnection for MockConnection {
    fn address(&self) -> &NodeAddress {
        &self.address
    }

    async fn send_pipeline(&mut self, frame: PipelineFrame) -> Result<ResponseHandle> {
        let action = self
            .node
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(NodeAction::Echo);

        if let NodeAction::FailWrite = action {
            return Err(ClusterError::WriteFailed {
                address: self.address.clone(),
                details: "injected write failure".to_string(),
            });
        }

        self.node.frames.lock().unwrap().push(
            frame
                .commands()
                .iter()
                .map(|c| c.opcode().to_string())
                .collect(),
        );

        let (tx, rx) = ResponseHandle::channel();
        match action {
            NodeAction::Echo => {
                for cmd in frame.commands() {
                    let reply = if cmd.opcode() == "ASKING" {
                        RawReply::Status("OK".to_string())
                    } else if let Some(arg) = cmd.args().first() {
                        RawReply::Bulk(arg.clone())
                    } else {
                        RawReply::Status("OK".to_string())
                    };
                    cmd.complete_raw(reply);
                }
                tx.complete(Ok(()));
            }
            NodeAction::Moved { slot, to } => {
                for cmd in frame.commands() {
                    cmd.fail(ClusterError::ServerError {
                        message: format!("MOVED {} {}", slot, to),
                    });
                }
                tx.complete(Err(ClusterError::Moved { slot, address: to }));
            }
            NodeAction::Ask { slot, to } => {
                for cmd in frame.commands() {
                    cmd.fail(ClusterError::ServerError {
                        message: format!("ASK {} {}", slot, to),
                    });
                }
                tx.complete(Err(ClusterError::Ask { slot, address: to }));
            }
            NodeAction::Loading => {
                for cmd in frame.commands() {
                    cmd.fail(ClusterError::ServerError {
                        message: "LOADING dataset in memory".to_string(),
                    });
                }
                tx.complete(Err(ClusterError::Loading));
            }
            NodeAction::Silent => {
                // Keep the sender alive so the response future pends
                // instead of erroring out.
                self.node.parked.lock().unwrap().push(tx);
            }
            NodeAction::ServerError(message) => {
                tx.complete(Err(ClusterError::ServerError { message }));
            }
            NodeAction::FailWrite => unreachable!("handled above"),
        }
        Ok(rx)
    }

    async fn authenticate(&mut self, password: &str) -> Result<()> {
        self.node.auths.lock().unwrap().push(password.to_string());
        let remaining = self.node.auth_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.node.auth_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ClusterError::AuthenticationFailed {
                reason: "injected auth rejection".to_string(),
            });
        }
        Ok(())
    }

    async fn ping(&mut self) -> Result<Reply> {
        let remaining = self.node.ping_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.node.ping_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ClusterError::ConnectionFailed {
                address: self.address.clone(),
                details: "injected ping failure".to_string(),
            });
        }
        self.node.pings.fetch_add(1, Ordering::SeqCst);
        Ok(Reply::Status("PONG".to_string()))
    }

    fn is_healthy(&self) -> bool {
        true
    }

    async fn close(&mut self) {}
}

/// Observer that records pool health events in arrival order
#[derive(Default)]
pub struct RecordingEvents {
    log: Mutex<Vec<String>>,
}

impl RecordingEvents {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl ClusterEvents for RecordingEvents {
    fn disconnect(&self, address: &NodeAddress, failed_attempts: u32) {
        self.log
            .lock()
            .unwrap()
            .push(format!("disconnect {} after {}", address, failed_attempts));
    }

    fn slave_down(&self, address: &NodeAddress) {
        self.log.lock().unwrap().push(format!("slave_down {}", address));
    }

    fn slave_up(&self, address: &NodeAddress) {
        self.log.lock().unwrap().push(format!("slave_up {}", address));
    }
}

/// Router mapping individual slots to dedicated pools, with a default
pub struct SlotMapRouter {
    pools: HashMap<SlotId, Arc<ConnectionPool<MockCluster>>>,
    default: Arc<ConnectionPool<MockCluster>>,
}

impl SlotMapRouter {
    pub fn new(default: Arc<ConnectionPool<MockCluster>>) -> Self {
        Self {
            pools: HashMap::new(),
            default,
        }
    }

    pub fn map_slot(mut self, slot: SlotId, pool: Arc<ConnectionPool<MockCluster>>) -> Self {
        self.pools.insert(slot, pool);
        self
    }
}

impl NodeRouter<MockCluster> for SlotMapRouter {
    fn pool_for(&self, source: &NodeSource) -> Result<Arc<ConnectionPool<MockCluster>>> {
        Ok(self
            .pools
            .get(&source.slot)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.default)))
    }
}

/// Builds a pool over the given cluster with one entry per `(addr, role)`
pub fn pool_with_nodes(
    cluster: &MockCluster,
    config: &ClusterConfig,
    events: Arc<dyn ClusterEvents>,
    nodes: &[(&str, NodeRole)],
) -> Arc<ConnectionPool<MockCluster>> {
    let pool = Arc::new(ConnectionPool::new(
        Arc::new(cluster.clone()),
        Arc::new(config.clone()),
        events,
    ));
    for (addr, role) in nodes {
        pool.add_node(NodeAddress::from(*addr), *role);
    }
    pool
}

/// A small, fast configuration for scripted tests
pub fn fast_config() -> ClusterConfig {
    ClusterConfig::default()
        .with_retry_interval(10)
        .with_retry_interval_multiplier(10)
        .with_response_timeout(100)
        .with_reconnect_timeout(100)
        .with_failed_attempts_threshold(2)
        .with_min_idle_per_entry(1)
        .with_max_connections_per_entry(4)
}

//! Per-node connection pooling with failure detection and reconnection
//!
//! A [`ConnectionPool`] owns one [`ConnectionEntry`] per remote endpoint.
//! Entries hand out connections under a per-entry cap, count consecutive
//! connection failures, and freeze themselves once the failure threshold is
//! hit. A frozen entry is excluded from acquisition until its reconnection
//! probe (open, optional AUTH, PING) verifies the endpoint, refills the
//! warm-up target, and clears the freeze.

use crate::command::Reply;
use crate::connection::{ConnectionFactory, NodeConnection};
use crate::error::ClusterError;
use crate::events::ClusterEvents;
use crate::metrics::{PoolMetrics, PoolMetricsSnapshot};
use crate::types::{ClusterConfig, FreezeReason, NodeAddress, NodeRole};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinSet;

/// Cap on outstanding connection requests during warm-up
const WARMUP_CONCURRENCY: usize = 50;

#[derive(Debug, Default)]
struct FreezeState {
    reason: Option<FreezeReason>,
    since: Option<DateTime<Utc>>,
}

/// Point-in-time view of one entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryState {
    /// The entry's endpoint
    pub address: String,
    /// The entry's role
    pub role: NodeRole,
    /// Idle connections currently parked in the entry
    pub idle: u32,
    /// Reserved connection slots
    pub in_use: u32,
    /// Consecutive connection failures since the last success
    pub failed_attempts: u32,
    /// Why the entry is frozen, if it is
    pub freeze_reason: Option<FreezeReason>,
    /// When the entry froze, if it is frozen
    pub frozen_since: Option<DateTime<Utc>>,
}

/// Point-in-time view of a pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolState {
    /// One snapshot per entry
    pub entries: Vec<EntryState>,
}

/// Tracks one remote endpoint: its idle connections, reservation count,
/// failure counter, and freeze state
///
/// Counter mutations are individual atomic operations; readers may observe
/// stale values, but the counters only grow between resets, so the freeze
/// threshold transition cannot be missed.
#[derive(Debug)]
pub struct ConnectionEntry<C> {
    address: NodeAddress,
    role: NodeRole,
    max_connections: u32,
    failed_threshold: u32,
    available: Mutex<Vec<C>>,
    in_use: AtomicU32,
    failed_attempts: AtomicU32,
    freeze: Mutex<FreezeState>,
}

impl<C: NodeConnection> ConnectionEntry<C> {
    /// Creates a live entry for the given endpoint
    pub fn new(address: NodeAddress, role: NodeRole, config: &ClusterConfig) -> Self {
        Self {
            address,
            role,
            max_connections: config.max_connections_per_entry,
            failed_threshold: config.failed_attempts_threshold,
            available: Mutex::new(Vec::new()),
            in_use: AtomicU32::new(0),
            failed_attempts: AtomicU32::new(0),
            freeze: Mutex::new(FreezeState::default()),
        }
    }

    /// Returns the entry's endpoint
    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    /// Returns the entry's role
    pub fn role(&self) -> NodeRole {
        self.role
    }

    /// Atomically reserves a connection slot
    ///
    /// Fails without any state change when the failure counter has reached
    /// the freeze threshold or the entry is at its connection cap.
    pub fn try_acquire(&self) -> bool {
        if self.failed_attempts.load(Ordering::SeqCst) >= self.failed_threshold {
            return false;
        }
        self.in_use
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max_connections).then_some(n + 1)
            })
            .is_ok()
    }

    /// Removes one idle connection, if any
    ///
    /// Does not touch the reservation count; the slot was already reserved
    /// by [`try_acquire`](Self::try_acquire).
    pub fn poll(&self) -> Option<C> {
        self.available.lock().expect("entry poisoned").pop()
    }

    /// Returns a connection to the idle set if it is still healthy,
    /// discarding it otherwise
    pub fn release(&self, conn: C) {
        if conn.is_healthy() {
            self.available.lock().expect("entry poisoned").push(conn);
        } else {
            tracing::debug!("discarding unhealthy connection to {}", self.address);
        }
    }

    /// Gives back a reserved connection slot
    pub fn release_slot(&self) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
    }

    /// Increments the consecutive-failure counter, returning the new value
    pub fn inc_failed(&self) -> u32 {
        self.failed_attempts.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Resets the consecutive-failure counter
    pub fn reset_failed(&self) {
        self.failed_attempts.store(0, Ordering::SeqCst);
    }

    /// Returns the consecutive-failure counter
    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts.load(Ordering::SeqCst)
    }

    /// Returns the failure threshold that trips quarantine
    pub fn failed_threshold(&self) -> u32 {
        self.failed_threshold
    }

    /// Freezes the entry for the given reason
    ///
    /// Returns true only for the caller that performed the transition; an
    /// already frozen entry is left untouched.
    pub fn freeze(&self, reason: FreezeReason) -> bool {
        let mut freeze = self.freeze.lock().expect("entry poisoned");
        if freeze.reason.is_some() {
            return false;
        }
        freeze.reason = Some(reason);
        freeze.since = Some(Utc::now());
        true
    }

    /// Freezes the entry, replacing any existing reason
    ///
    /// Used by shutdown to supersede a reconnect freeze; the in-flight
    /// probe observes the changed reason and exits without unfreezing.
    pub fn freeze_override(&self, reason: FreezeReason) {
        let mut freeze = self.freeze.lock().expect("entry poisoned");
        if freeze.reason != Some(reason) {
            freeze.reason = Some(reason);
            freeze.since = Some(Utc::now());
        }
    }

    /// Clears the freeze unconditionally, returning the previous reason
    pub fn unfreeze(&self) -> Option<FreezeReason> {
        let mut freeze = self.freeze.lock().expect("entry poisoned");
        freeze.since = None;
        freeze.reason.take()
    }

    /// Clears the freeze only if the current reason matches
    ///
    /// Returns true if the entry transitioned back to live.
    pub fn unfreeze_if(&self, reason: FreezeReason) -> bool {
        let mut freeze = self.freeze.lock().expect("entry poisoned");
        if freeze.reason == Some(reason) {
            freeze.reason = None;
            freeze.since = None;
            true
        } else {
            false
        }
    }

    /// Returns true while the entry is frozen
    pub fn is_frozen(&self) -> bool {
        self.freeze.lock().expect("entry poisoned").reason.is_some()
    }

    /// Returns the freeze reason, if frozen
    pub fn freeze_reason(&self) -> Option<FreezeReason> {
        self.freeze.lock().expect("entry poisoned").reason
    }

    /// Returns true while the entry is frozen for reconnection
    pub fn is_reconnecting(&self) -> bool {
        self.freeze_reason() == Some(FreezeReason::Reconnect)
    }

    /// Returns true if acquisition may consider this entry
    ///
    /// A master under a `System` freeze stays acquirable: it must keep
    /// accepting routed writes until the topology handover completes.
    pub fn acquirable(&self) -> bool {
        match self.freeze_reason() {
            None => true,
            Some(FreezeReason::System) => self.role == NodeRole::Master,
            Some(_) => false,
        }
    }

    /// Returns the number of idle connections
    pub fn idle_count(&self) -> u32 {
        self.available.lock().expect("entry poisoned").len() as u32
    }

    /// Returns the number of reserved connection slots
    pub fn in_use_count(&self) -> u32 {
        self.in_use.load(Ordering::SeqCst)
    }

    /// Takes a point-in-time snapshot of the entry
    pub fn snapshot(&self) -> EntryState {
        let freeze = self.freeze.lock().expect("entry poisoned");
        EntryState {
            address: self.address.to_string(),
            role: self.role,
            idle: self.idle_count(),
            in_use: self.in_use.load(Ordering::SeqCst),
            failed_attempts: self.failed_attempts.load(Ordering::SeqCst),
            freeze_reason: freeze.reason,
            frozen_since: freeze.since,
        }
    }
}

/// A reserved connection slot that has not produced a connection yet
///
/// Acquisition can be cancelled at any await point (the executor's retry
/// window does exactly that); the reservation gives the slot back on drop
/// unless it was adopted into a [`PooledConnection`].
#[derive(Debug)]
struct SlotReservation<C: NodeConnection> {
    entry: Option<Arc<ConnectionEntry<C>>>,
}

impl<C: NodeConnection> SlotReservation<C> {
    fn new(entry: Arc<ConnectionEntry<C>>) -> Self {
        Self { entry: Some(entry) }
    }

    fn entry(&self) -> Arc<ConnectionEntry<C>> {
        Arc::clone(self.entry.as_ref().expect("reservation already defused"))
    }

    fn defuse(mut self) -> Arc<ConnectionEntry<C>> {
        self.entry.take().expect("reservation already defused")
    }
}

impl<C: NodeConnection> Drop for SlotReservation<C> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            entry.release_slot();
        }
    }
}

/// A connection checked out of a pool
///
/// Dropping the guard gives the reserved slot back and parks the
/// connection in its entry's idle set if it is still healthy. This holds on
/// every exit path, including cancellation mid-attempt.
#[derive(Debug)]
pub struct PooledConnection<C: NodeConnection> {
    conn: Option<C>,
    entry: Arc<ConnectionEntry<C>>,
}

impl<C: NodeConnection> PooledConnection<C> {
    fn adopt(conn: C, reservation: SlotReservation<C>) -> Self {
        Self {
            conn: Some(conn),
            entry: reservation.defuse(),
        }
    }

    /// Returns the entry this connection belongs to
    pub fn entry(&self) -> &Arc<ConnectionEntry<C>> {
        &self.entry
    }
}

impl<C: NodeConnection> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.conn.as_ref().expect("connection already released")
    }
}

impl<C: NodeConnection> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().expect("connection already released")
    }
}

impl<C: NodeConnection> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        // Slot first, connection second: the idle set plus the reservation
        // count never exceeds the cap at any observation point. The freeze
        // state is intentionally not re-checked here.
        self.entry.release_slot();
        if let Some(conn) = self.conn.take() {
            self.entry.release(conn);
        }
    }
}

/// A collection of connection entries with load balancing, warm-up, and
/// health-based quarantine
pub struct ConnectionPool<F: ConnectionFactory> {
    entries: RwLock<Vec<Arc<ConnectionEntry<F::Connection>>>>,
    factory: Arc<F>,
    config: Arc<ClusterConfig>,
    events: Arc<dyn ClusterEvents>,
    metrics: Arc<PoolMetrics>,
    balance_cursor: AtomicUsize,
    shut_down: AtomicBool,
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Creates an empty pool
    pub fn new(factory: Arc<F>, config: Arc<ClusterConfig>, events: Arc<dyn ClusterEvents>) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            factory,
            config,
            events,
            metrics: Arc::new(PoolMetrics::new()),
            balance_cursor: AtomicUsize::new(0),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Registers an endpoint with the pool
    pub fn add_node(&self, address: NodeAddress, role: NodeRole) -> Arc<ConnectionEntry<F::Connection>> {
        let entry = Arc::new(ConnectionEntry::new(address, role, &self.config));
        self.entries
            .write()
            .expect("pool entries poisoned")
            .push(Arc::clone(&entry));
        entry
    }

    /// Removes an endpoint from the pool, returning its entry
    ///
    /// In-flight guards keep their entry alive until released; the entry is
    /// simply no longer offered to new acquisitions.
    pub fn remove_node(&self, address: &NodeAddress) -> Option<Arc<ConnectionEntry<F::Connection>>> {
        let mut entries = self.entries.write().expect("pool entries poisoned");
        let idx = entries.iter().position(|e| e.address() == address)?;
        Some(entries.remove(idx))
    }

    /// Looks up an entry by address
    pub fn entry_at(&self, address: &NodeAddress) -> Option<Arc<ConnectionEntry<F::Connection>>> {
        self.entries
            .read()
            .expect("pool entries poisoned")
            .iter()
            .find(|e| e.address() == address)
            .cloned()
    }

    fn entries_snapshot(&self) -> Vec<Arc<ConnectionEntry<F::Connection>>> {
        self.entries.read().expect("pool entries poisoned").clone()
    }

    fn entries_with_role(&self, role: NodeRole) -> Vec<Arc<ConnectionEntry<F::Connection>>> {
        self.entries_snapshot()
            .into_iter()
            .filter(|e| e.role() == role)
            .collect()
    }

    fn rotated(
        &self,
        mut entries: Vec<Arc<ConnectionEntry<F::Connection>>>,
    ) -> Vec<Arc<ConnectionEntry<F::Connection>>> {
        if entries.len() > 1 {
            let start = self.balance_cursor.fetch_add(1, Ordering::SeqCst) % entries.len();
            entries.rotate_left(start);
        }
        entries
    }

    /// Opens the warm-up target of idle connections for every entry
    ///
    /// Connections are opened in parallel with at most
    /// [`WARMUP_CONCURRENCY`] outstanding requests; a single failure aborts
    /// warm-up with a structured error.
    pub async fn init_connections(&self) -> Result<()> {
        for entry in self.entries_snapshot() {
            warm_up_entry(&self.factory, &self.config, &entry, false).await?;
        }
        Ok(())
    }

    /// Acquires a connection to a master entry
    pub async fn acquire_write(&self) -> Result<PooledConnection<F::Connection>> {
        self.ensure_live()?;
        let candidates = self.rotated(self.entries_with_role(NodeRole::Master));
        self.acquire_from(candidates).await
    }

    /// Acquires a connection for a read-only pipeline
    ///
    /// Replicas are preferred; masters serve as the fallback when no
    /// replica is eligible.
    pub async fn acquire_read(&self) -> Result<PooledConnection<F::Connection>> {
        self.ensure_live()?;
        let mut candidates = self.rotated(self.entries_with_role(NodeRole::Replica));
        candidates.extend(self.rotated(self.entries_with_role(NodeRole::Master)));
        self.acquire_from(candidates).await
    }

    /// Acquires a connection to an explicit endpoint
    ///
    /// Used for MOVED/ASK address overrides, where the redirect supersedes
    /// role-based selection.
    pub async fn acquire_at(&self, address: &NodeAddress) -> Result<PooledConnection<F::Connection>> {
        self.ensure_live()?;
        let entry = self.entry_at(address).ok_or_else(|| ClusterError::UnknownNode {
            address: address.clone(),
        })?;
        self.acquire_entry(&entry).await
    }

    /// Acquires a connection from one specific entry
    pub async fn acquire_entry(
        &self,
        entry: &Arc<ConnectionEntry<F::Connection>>,
    ) -> Result<PooledConnection<F::Connection>> {
        self.ensure_live()?;
        if !entry.acquirable() {
            return Err(ClusterError::PoolExhausted {
                frozen: vec![entry.address().to_string()],
                saturated: vec![],
            });
        }
        if !entry.try_acquire() {
            return Err(ClusterError::PoolExhausted {
                frozen: vec![],
                saturated: vec![entry.address().to_string()],
            });
        }
        self.connect_entry(SlotReservation::new(Arc::clone(entry))).await
    }

    /// Takes a point-in-time snapshot of every entry
    pub fn state(&self) -> PoolState {
        PoolState {
            entries: self.entries_snapshot().iter().map(|e| e.snapshot()).collect(),
        }
    }

    /// Takes a point-in-time copy of the pool counters
    pub fn metrics(&self) -> PoolMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Freezes every entry and closes all idle connections
    ///
    /// New acquisitions fail with [`ClusterError::Shutdown`]; in-flight
    /// reconnection probes observe the `System` reason and exit.
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        for entry in self.entries_snapshot() {
            entry.freeze_override(FreezeReason::System);
            while let Some(mut conn) = entry.poll() {
                conn.close().await;
            }
        }
        tracing::info!("connection pool shut down");
    }

    fn ensure_live(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            Err(ClusterError::Shutdown)
        } else {
            Ok(())
        }
    }

    async fn acquire_from(
        &self,
        candidates: Vec<Arc<ConnectionEntry<F::Connection>>>,
    ) -> Result<PooledConnection<F::Connection>> {
        let mut frozen = Vec::new();
        let mut saturated = Vec::new();
        for entry in candidates {
            if !entry.acquirable() {
                frozen.push(entry.address().to_string());
                continue;
            }
            if !entry.try_acquire() {
                saturated.push(entry.address().to_string());
                continue;
            }
            return self.connect_entry(SlotReservation::new(entry)).await;
        }
        Err(ClusterError::PoolExhausted { frozen, saturated })
    }

    /// Turns a reserved slot into a live connection
    ///
    /// On failure or cancellation at any await point the reservation's drop
    /// gives the slot back.
    async fn connect_entry(
        &self,
        reservation: SlotReservation<F::Connection>,
    ) -> Result<PooledConnection<F::Connection>> {
        let entry = reservation.entry();
        while let Some(conn) = entry.poll() {
            if conn.is_healthy() {
                return Ok(PooledConnection::adopt(conn, reservation));
            }
            tracing::debug!("dropping stale idle connection to {}", entry.address());
        }
        let conn = self.open_connection(&entry).await?;
        Ok(PooledConnection::adopt(conn, reservation))
    }

    async fn open_connection(
        &self,
        entry: &Arc<ConnectionEntry<F::Connection>>,
    ) -> Result<F::Connection> {
        match self.factory.open(entry.address()).await {
            Ok(conn) => {
                entry.reset_failed();
                self.metrics.record_open();
                Ok(conn)
            }
            Err(e) => {
                self.metrics.record_open_failure();
                let failures = entry.inc_failed();
                tracing::debug!(
                    "connection to {} failed ({} consecutive): {}",
                    entry.address(),
                    failures,
                    e
                );
                if failures == entry.failed_threshold() {
                    self.quarantine(entry, failures);
                }
                Err(e)
            }
        }
    }

    /// Freezes the entry for reconnection and schedules its probe
    ///
    /// Only the caller that performed the freeze transition schedules a
    /// probe, so at most one probe exists per entry at any instant.
    fn quarantine(&self, entry: &Arc<ConnectionEntry<F::Connection>>, failures: u32) {
        if !entry.freeze(FreezeReason::Reconnect) {
            return;
        }
        self.metrics.record_quarantine();
        tracing::warn!(
            "{} quarantined after {} consecutive connection failures",
            entry.address(),
            failures
        );
        if entry.role() == NodeRole::Replica {
            self.events.slave_down(entry.address());
        }
        self.events.disconnect(entry.address(), failures);

        let entry = Arc::clone(entry);
        let factory = Arc::clone(&self.factory);
        let config = Arc::clone(&self.config);
        let events = Arc::clone(&self.events);
        tokio::spawn(async move {
            reconnect_probe(entry, factory, config, events).await;
        });
    }
}

enum ProbeStatus {
    /// The endpoint answered PONG
    Verified,
    /// The entry is no longer frozen for reconnection
    Aborted,
}

/// Self-rearming reconnection probe
///
/// Exits only when a probe succeeds or when the entry stops being frozen
/// for reconnection (external unfreeze or shutdown superseding the reason).
async fn reconnect_probe<F: ConnectionFactory>(
    entry: Arc<ConnectionEntry<F::Connection>>,
    factory: Arc<F>,
    config: Arc<ClusterConfig>,
    events: Arc<dyn ClusterEvents>,
) {
    loop {
        tokio::time::sleep(config.reconnect_timeout()).await;
        if !entry.is_reconnecting() {
            return;
        }
        match probe_once::<F>(&entry, &factory, &config).await {
            Ok(ProbeStatus::Verified) => {
                entry.reset_failed();
                if let Err(e) = warm_up_entry(&factory, &config, &entry, true).await {
                    tracing::warn!("warm-up after probe of {} failed: {}", entry.address(), e);
                    continue;
                }
                if entry.unfreeze_if(FreezeReason::Reconnect) {
                    if entry.role() == NodeRole::Replica {
                        events.slave_up(entry.address());
                    }
                    tracing::info!("{} back in rotation", entry.address());
                }
                return;
            }
            Ok(ProbeStatus::Aborted) => return,
            Err(e) => {
                tracing::debug!("probe of {} failed: {}", entry.address(), e);
            }
        }
    }
}

async fn probe_once<F: ConnectionFactory>(
    entry: &ConnectionEntry<F::Connection>,
    factory: &F,
    config: &ClusterConfig,
) -> Result<ProbeStatus> {
    let mut conn = factory.open(entry.address()).await?;
    let outcome = probe_steps(entry, &mut conn, config).await;
    // The probe connection never joins the pool.
    conn.close().await;
    outcome
}

async fn probe_steps<C: NodeConnection>(
    entry: &ConnectionEntry<C>,
    conn: &mut C,
    config: &ClusterConfig,
) -> Result<ProbeStatus> {
    if !entry.is_reconnecting() {
        return Ok(ProbeStatus::Aborted);
    }
    if let Some(password) = &config.password {
        conn.authenticate(password).await?;
    }
    if !entry.is_reconnecting() {
        return Ok(ProbeStatus::Aborted);
    }
    match conn.ping().await? {
        Reply::Status(s) if s == "PONG" => Ok(ProbeStatus::Verified),
        other => Err(ClusterError::ProbeRejected {
            address: entry.address().clone(),
            reply: format!("{:?}", other),
        }),
    }
}

/// Opens idle connections for one entry up to the warm-up target
async fn warm_up_entry<F: ConnectionFactory>(
    factory: &Arc<F>,
    config: &ClusterConfig,
    entry: &Arc<ConnectionEntry<F::Connection>>,
    bypass_freeze: bool,
) -> Result<()> {
    if !bypass_freeze && entry.is_frozen() {
        return Ok(());
    }
    let target = config.min_idle_per_entry as usize;
    let mut remaining = target.saturating_sub(entry.idle_count() as usize);
    let mut in_flight = 0usize;
    let mut join: JoinSet<Result<F::Connection>> = JoinSet::new();
    loop {
        while remaining > 0 && in_flight < WARMUP_CONCURRENCY {
            let factory = Arc::clone(factory);
            let address = entry.address().clone();
            join.spawn(async move { factory.open(&address).await });
            remaining -= 1;
            in_flight += 1;
        }
        match join.join_next().await {
            None => return Ok(()),
            Some(Ok(Ok(conn))) => {
                in_flight -= 1;
                entry.release(conn);
            }
            Some(Ok(Err(e))) => {
                join.abort_all();
                return Err(ClusterError::WarmupFailed {
                    address: entry.address().clone(),
                    details: e.to_string(),
                });
            }
            Some(Err(e)) => {
                join.abort_all();
                return Err(ClusterError::Internal {
                    component: "warm_up".to_string(),
                    details: e.to_string(),
                });
            }
        }
    }
}

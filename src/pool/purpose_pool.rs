//! Per-purpose connection pool
//!
//! A `Pool` owns a bounded set of managed connections and a FIFO queue of
//! callers waiting for one:
//! - `acquire` selects an eligible connection, expands the pool, or queues
//! - `release` hands the connection straight to the oldest waiter
//! - background tasks check connections out before touching them
//!
//! The state lock is a `std::sync::Mutex` and is never held across an await.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::connection::{next_connection_id, ConnectionMetrics, ConnectionOptions, ManagedConnection};
use super::error::{PoolError, PoolResult};
use super::events::EventBus;
use super::selector::Selector;
use crate::config::PoolConfig;
use crate::purpose::Purpose;
use crate::store::{Command, Connector, Reply};

/// Lifetime counters for a pool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections created (warm-up, expansion, replacement, recovery)
    pub total_created: u64,

    /// Connections closed and removed
    pub total_destroyed: u64,

    /// Connections created on demand by `acquire`
    pub expansions: u64,

    /// Idle connections evicted by maintenance
    pub contractions: u64,

    /// Unhealthy connections swapped for fresh ones
    pub replacements: u64,

    /// Connection attempts that failed
    pub failed_creations: u64,

    /// Waiters that gave up after `acquire_timeout`
    pub acquire_timeouts: u64,

    /// Acquisitions refused because the wait queue was full
    pub saturated_rejections: u64,

    /// Connections handed directly to a waiter on release
    pub direct_handoffs: u64,

    /// Commands run on connections that have since been removed
    pub retired_commands: u64,

    /// Errors recorded on connections that have since been removed
    pub retired_errors: u64,
}

/// Point-in-time view of a pool
#[derive(Debug, Clone)]
pub struct PoolSnapshot {
    pub purpose: Purpose,
    pub min_connections: usize,
    pub max_connections: usize,
    pub connections: Vec<ConnectionMetrics>,
    pub waiting: usize,
    pub pending_creates: usize,
    pub stats: PoolStats,
}

struct Waiter {
    id: u64,
    sender: oneshot::Sender<PoolResult<Arc<ManagedConnection>>>,
    enqueued_at: Instant,
}

#[derive(Default)]
struct PoolState {
    connections: Vec<Arc<ManagedConnection>>,
    waiters: VecDeque<Waiter>,
    /// Slots reserved for connections being created outside the lock
    pending_creates: usize,
    next_waiter_id: u64,
    stats: PoolStats,
    closed: bool,
}

impl PoolState {
    fn position(&self, conn: &Arc<ManagedConnection>) -> Option<usize> {
        self.connections.iter().position(|c| Arc::ptr_eq(c, conn))
    }

    fn remove(&mut self, conn: &Arc<ManagedConnection>) -> bool {
        match self.position(conn) {
            Some(idx) => {
                let removed = self.connections.remove(idx);
                self.retire(&removed);
                true
            }
            None => false,
        }
    }

    fn retire(&mut self, conn: &ManagedConnection) {
        let metrics = conn.metrics();
        self.stats.retired_commands += metrics.command_count;
        self.stats.retired_errors += metrics.error_count;
        self.stats.total_destroyed += 1;
    }
}

/// A slot reserved for a connection being created outside the lock
///
/// Dropping it unsettled, e.g. when the creating future is cancelled, gives
/// the slot back.
struct SlotReservation<'a> {
    pool: &'a Pool,
    held: bool,
}

impl<'a> SlotReservation<'a> {
    /// Wrap a slot already counted in `pending_creates`
    fn taken(pool: &'a Pool) -> Self {
        Self { pool, held: true }
    }

    /// Give the slot up under the caller's lock
    fn settle(mut self, state: &mut PoolState) {
        state.pending_creates -= 1;
        self.held = false;
    }
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        if self.held {
            self.pool.lock_state().pending_creates -= 1;
        }
    }
}

enum Plan {
    Ready(Arc<ManagedConnection>),
    Expand,
    Wait(u64, oneshot::Receiver<PoolResult<Arc<ManagedConnection>>>),
}

/// Connection pool for one purpose
pub struct Pool {
    purpose: Purpose,
    config: PoolConfig,
    options: ConnectionOptions,
    connector: Arc<dyn Connector>,
    selector: Selector,
    events: EventBus,
    state: Mutex<PoolState>,
}

impl Pool {
    pub fn new(
        purpose: Purpose,
        config: PoolConfig,
        options: ConnectionOptions,
        overload_ceiling: u64,
        connector: Arc<dyn Connector>,
        events: EventBus,
    ) -> Self {
        let selector = Selector::new(config.load_balancing_strategy, overload_ceiling);
        Self {
            purpose,
            config,
            options,
            connector,
            selector,
            events,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn purpose(&self) -> Purpose {
        self.purpose
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Number of pooled connections
    pub fn len(&self) -> usize {
        self.lock_state().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of callers queued for a connection
    pub fn waiting(&self) -> usize {
        self.lock_state().waiters.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    pub fn stats(&self) -> PoolStats {
        self.lock_state().stats.clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        // A panic while holding the lock leaves plain data behind; keep going
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Get exclusive use of a connection
    ///
    /// Picks an eligible connection, otherwise grows the pool up to
    /// `max_connections`, otherwise waits in FIFO order for a release.
    pub async fn acquire(self: &Arc<Self>) -> PoolResult<Lease> {
        let plan = {
            let mut state = self.lock_state();
            if state.closed {
                return Err(PoolError::Shutdown);
            }

            let candidates: Vec<ConnectionMetrics> =
                state.connections.iter().map(|c| c.metrics()).collect();

            let selected = self
                .selector
                .select(&candidates)
                .map(|idx| Arc::clone(&state.connections[idx]))
                .filter(|conn| conn.try_checkout());

            if let Some(conn) = selected {
                Plan::Ready(conn)
            } else if state.connections.len() + state.pending_creates < self.config.max_connections {
                state.pending_creates += 1;
                Plan::Expand
            } else if state.waiters.len() >= self.config.max_queue_size {
                state.stats.saturated_rejections += 1;
                warn!(
                    purpose = %self.purpose,
                    waiting = state.waiters.len(),
                    "Acquisition queue full"
                );
                return Err(PoolError::PoolSaturated {
                    purpose: self.purpose,
                    capacity: self.config.max_queue_size,
                });
            } else {
                let (sender, receiver) = oneshot::channel();
                let id = state.next_waiter_id;
                state.next_waiter_id += 1;
                state.waiters.push_back(Waiter {
                    id,
                    sender,
                    enqueued_at: Instant::now(),
                });
                debug!(
                    purpose = %self.purpose,
                    waiter_id = id,
                    queue_len = state.waiters.len(),
                    "No connection available, queueing caller"
                );
                Plan::Wait(id, receiver)
            }
        };

        match plan {
            Plan::Ready(conn) => Ok(Lease::new(Arc::clone(self), conn)),
            Plan::Expand => self.expand(SlotReservation::taken(self)).await,
            Plan::Wait(id, receiver) => self.wait_for(id, receiver).await,
        }
    }

    async fn expand(self: &Arc<Self>, slot: SlotReservation<'_>) -> PoolResult<Lease> {
        let result = self.open_connection().await;

        let conn = {
            let mut state = self.lock_state();
            slot.settle(&mut state);

            match result {
                Ok(conn) if !state.closed => {
                    conn.try_checkout();
                    state.connections.push(Arc::clone(&conn));
                    state.stats.total_created += 1;
                    state.stats.expansions += 1;
                    info!(
                        purpose = %self.purpose,
                        connection_id = conn.id(),
                        size = state.connections.len(),
                        "Expanded pool"
                    );
                    return Ok(Lease::new(Arc::clone(self), conn));
                }
                Ok(conn) => conn,
                Err(e) => {
                    state.stats.failed_creations += 1;
                    warn!(purpose = %self.purpose, error = %e, "Pool expansion failed");
                    return Err(e);
                }
            }
        };

        // Shut down while connecting
        conn.close().await;
        Err(PoolError::Shutdown)
    }

    async fn wait_for(
        self: &Arc<Self>,
        waiter_id: u64,
        receiver: oneshot::Receiver<PoolResult<Arc<ManagedConnection>>>,
    ) -> PoolResult<Lease> {
        let timeout = self.config.acquire_timeout();
        let mut pending = PendingAcquire {
            pool: Arc::clone(self),
            waiter_id,
            receiver,
            settled: false,
        };

        match tokio::time::timeout(timeout, &mut pending.receiver).await {
            Ok(Ok(result)) => {
                pending.settled = true;
                result.map(|conn| Lease::new(Arc::clone(self), conn))
            }
            Ok(Err(_)) => {
                pending.settled = true;
                Err(PoolError::Shutdown)
            }
            Err(_) => {
                // Dropping the pending acquisition dequeues it
                drop(pending);
                self.lock_state().stats.acquire_timeouts += 1;
                debug!(
                    purpose = %self.purpose,
                    waiter_id = waiter_id,
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "Acquisition timed out"
                );
                Err(PoolError::AcquisitionTimeout {
                    purpose: self.purpose,
                    waited: timeout,
                })
            }
        }
    }

    /// Return a connection
    ///
    /// A healthy pooled connection goes straight to the oldest waiter and stays
    /// checked out. Otherwise it becomes selectable again.
    pub(crate) fn release(&self, conn: Arc<ManagedConnection>) {
        let mut state = self.lock_state();

        if !state.closed && conn.is_healthy() && state.position(&conn).is_some() {
            while let Some(waiter) = state.waiters.pop_front() {
                let waited = waiter.enqueued_at.elapsed();
                match waiter.sender.send(Ok(Arc::clone(&conn))) {
                    Ok(()) => {
                        state.stats.direct_handoffs += 1;
                        debug!(
                            purpose = %self.purpose,
                            connection_id = conn.id(),
                            waiter_id = waiter.id,
                            waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                            "Handed connection to waiter"
                        );
                        return;
                    }
                    // Waiter went away without dequeuing itself
                    Err(_) => continue,
                }
            }
        }

        conn.checkin();
    }

    fn abandon_waiter(&self, waiter_id: u64) {
        self.lock_state().waiters.retain(|w| w.id != waiter_id);
    }

    async fn open_connection(&self) -> PoolResult<Arc<ManagedConnection>> {
        ManagedConnection::connect(
            next_connection_id(),
            self.purpose,
            self.connector.as_ref(),
            self.options.clone(),
            self.events.clone(),
        )
        .await
        .map(Arc::new)
    }

    /// Insert a freshly created connection into its reserved slot and offer
    /// it to waiters
    async fn adopt(&self, conn: Arc<ManagedConnection>, slot: SlotReservation<'_>) {
        let adopted = {
            let mut state = self.lock_state();
            slot.settle(&mut state);
            if state.closed {
                false
            } else {
                conn.try_checkout();
                state.connections.push(Arc::clone(&conn));
                state.stats.total_created += 1;
                true
            }
        };

        if adopted {
            self.release(conn);
        } else {
            conn.close().await;
        }
    }

    fn reserve_slot(&self, limit: usize) -> Option<SlotReservation<'_>> {
        let mut state = self.lock_state();
        if state.closed || state.connections.len() + state.pending_creates >= limit {
            return None;
        }
        state.pending_creates += 1;
        Some(SlotReservation::taken(self))
    }

    fn failed_creation(&self, slot: SlotReservation<'_>) {
        let mut state = self.lock_state();
        slot.settle(&mut state);
        state.stats.failed_creations += 1;
    }

    /// Create connections until the pool holds `min_connections`
    ///
    /// Returns the number created, or the first creation error.
    pub async fn ensure_min(&self) -> PoolResult<usize> {
        let mut created = 0;
        while let Some(slot) = self.reserve_slot(self.config.min_connections) {
            match self.open_connection().await {
                Ok(conn) => {
                    self.adopt(conn, slot).await;
                    created += 1;
                }
                Err(e) => {
                    self.failed_creation(slot);
                    return Err(e);
                }
            }
        }

        if created > 0 {
            debug!(purpose = %self.purpose, created = created, size = self.len(), "Pool topped up");
        }
        Ok(created)
    }

    /// Check out every idle connection for probing
    pub(crate) fn checkout_idle(&self) -> Vec<Arc<ManagedConnection>> {
        let state = self.lock_state();
        state
            .connections
            .iter()
            .filter(|c| c.try_checkout())
            .cloned()
            .collect()
    }

    /// Swap a checked-out connection for a new one of the same purpose
    pub(crate) async fn replace(&self, old: Arc<ManagedConnection>) -> PoolResult<()> {
        let removed = {
            let mut state = self.lock_state();
            if state.closed {
                false
            } else {
                let removed = state.remove(&old);
                if removed {
                    state.pending_creates += 1;
                }
                removed
            }
        };

        let slot = removed.then(|| SlotReservation::taken(self));

        old.close().await;
        let Some(slot) = slot else {
            return Ok(());
        };

        match self.open_connection().await {
            Ok(conn) => {
                info!(
                    purpose = %self.purpose,
                    old_connection_id = old.id(),
                    new_connection_id = conn.id(),
                    "Replaced unhealthy connection"
                );
                self.lock_state().stats.replacements += 1;
                self.adopt(conn, slot).await;
                Ok(())
            }
            Err(e) => {
                self.failed_creation(slot);
                Err(e)
            }
        }
    }

    /// Evict idle connections above the floor, oldest idle first
    ///
    /// Returns the number of evicted connections.
    pub async fn evict_idle(&self) -> usize {
        let evicted: Vec<Arc<ManagedConnection>> = {
            let mut state = self.lock_state();
            let surplus = state.connections.len().saturating_sub(self.config.min_connections);
            if state.closed || surplus == 0 {
                return 0;
            }

            let idle_timeout = self.config.idle_timeout();
            let mut candidates: Vec<(Instant, Arc<ManagedConnection>)> = state
                .connections
                .iter()
                .filter(|c| !c.is_busy() && c.is_idle(idle_timeout))
                .map(|c| (c.metrics().last_used_at, Arc::clone(c)))
                .collect();
            candidates.sort_by_key(|(last_used, _)| *last_used);
            candidates.truncate(surplus);

            for (_, conn) in &candidates {
                state.remove(conn);
            }
            state.stats.contractions += candidates.len() as u64;

            candidates.into_iter().map(|(_, c)| c).collect()
        };

        for conn in &evicted {
            conn.close().await;
        }

        if !evicted.is_empty() {
            info!(
                purpose = %self.purpose,
                evicted = evicted.len(),
                remaining = self.len(),
                "Evicted idle connections"
            );
        }
        evicted.len()
    }

    /// Reconnect after an outage
    ///
    /// Pings every idle connection that still looks healthy, since it may
    /// have died unnoticed, and drops the unhealthy ones. Then creates fresh
    /// connections up to the floor (at least one, to prove the store is
    /// reachable). Succeeds if a new connection answers a ping.
    pub async fn recover(self: &Arc<Self>) -> PoolResult<usize> {
        if self.is_closed() {
            return Err(PoolError::Shutdown);
        }

        let idle: Vec<Arc<ManagedConnection>> = {
            let state = self.lock_state();
            state
                .connections
                .iter()
                .filter(|c| c.is_healthy() && c.try_checkout())
                .cloned()
                .collect()
        };
        for conn in idle {
            // Released on drop, to a waiter if still healthy
            let lease = Lease::new(Arc::clone(self), conn);
            if let Err(e) = lease.ping().await {
                debug!(
                    purpose = %self.purpose,
                    connection_id = lease.id(),
                    error = %e,
                    "Idle connection failed recovery ping"
                );
            }
        }

        let dead: Vec<Arc<ManagedConnection>> = {
            let mut state = self.lock_state();
            if state.closed {
                return Err(PoolError::Shutdown);
            }
            let dead: Vec<_> = state
                .connections
                .iter()
                .filter(|c| !c.is_healthy() && !c.is_busy())
                .cloned()
                .collect();
            for conn in &dead {
                state.remove(conn);
            }
            dead
        };
        for conn in dead {
            conn.close().await;
        }

        // Prove connectivity even if the pool is already full
        let fresh = self.open_connection().await.map_err(|e| {
            self.lock_state().stats.failed_creations += 1;
            e
        })?;
        fresh.ping().await?;

        let mut created = 0;
        if let Some(slot) = self.reserve_slot(self.config.max_connections) {
            self.adopt(fresh, slot).await;
            created += 1;
        } else {
            fresh.close().await;
        }

        match self.ensure_min().await {
            Ok(n) => created += n,
            Err(e) => warn!(purpose = %self.purpose, error = %e, "Partial recovery"),
        }

        Ok(created)
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.lock_state();
        PoolSnapshot {
            purpose: self.purpose,
            min_connections: self.config.min_connections,
            max_connections: self.config.max_connections,
            connections: state.connections.iter().map(|c| c.metrics()).collect(),
            waiting: state.waiters.len(),
            pending_creates: state.pending_creates,
            stats: state.stats.clone(),
        }
    }

    /// Reject every waiter and close every connection. Idempotent.
    pub async fn shutdown(&self) {
        let (connections, waiters) = {
            let mut state = self.lock_state();
            if state.closed {
                return;
            }
            state.closed = true;
            let connections = std::mem::take(&mut state.connections);
            for conn in &connections {
                state.retire(conn);
            }
            (connections, std::mem::take(&mut state.waiters))
        };

        let rejected = waiters.len();
        for waiter in waiters {
            let _ = waiter.sender.send(Err(PoolError::Shutdown));
        }

        let closed = connections.len();
        for conn in connections {
            conn.close().await;
        }

        info!(
            purpose = %self.purpose,
            closed = closed,
            rejected_waiters = rejected,
            "Pool shut down"
        );
    }
}

/// A queued acquisition. Dropping it before it settles dequeues the waiter
/// and returns any connection that was handed over in the meantime.
struct PendingAcquire {
    pool: Arc<Pool>,
    waiter_id: u64,
    receiver: oneshot::Receiver<PoolResult<Arc<ManagedConnection>>>,
    settled: bool,
}

impl Drop for PendingAcquire {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        // Once dequeued no release can resolve us, so the channel is final
        self.pool.abandon_waiter(self.waiter_id);
        if let Ok(Ok(conn)) = self.receiver.try_recv() {
            self.pool.release(conn);
        }
    }
}

/// Exclusive use of a pooled connection. Released on drop.
pub struct Lease {
    pool: Arc<Pool>,
    conn: Arc<ManagedConnection>,
}

impl Lease {
    fn new(pool: Arc<Pool>, conn: Arc<ManagedConnection>) -> Self {
        Self { pool, conn }
    }

    pub fn connection(&self) -> &Arc<ManagedConnection> {
        &self.conn
    }

    pub fn id(&self) -> u64 {
        self.conn.id()
    }

    pub fn purpose(&self) -> Purpose {
        self.pool.purpose()
    }

    pub async fn execute(&self, command: &Command) -> PoolResult<Reply> {
        self.conn.execute_command(command).await
    }

    pub async fn ping(&self) -> PoolResult<()> {
        self.conn.ping().await
    }

    /// Give the connection back now
    pub fn release(self) {}
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.pool.release(Arc::clone(&self.conn));
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("purpose", &self.pool.purpose())
            .field("connection", &self.conn)
            .finish()
    }
}

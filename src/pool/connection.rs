//! Managed connections to the backing store
//!
//! A `ManagedConnection` wraps one transport and records:
//! - Command, error and latency counters used for load balancing
//! - Health, flipped off by connection-level failures or close
//! - A checked-out flag so background tasks never touch a connection in use

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::error::{PoolError, PoolResult};
use super::events::{EventBus, PoolEvent};
use crate::purpose::Purpose;
use crate::store::{Command, Connector, Reply, StoreError, Transport};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-wide unique connection id
pub(crate) fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Per-connection settings derived from the store and selector configuration
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Bound on establishing the transport
    pub connect_timeout: Duration,

    /// Bound on a single command round-trip
    pub command_timeout: Duration,

    /// Weight of one recorded error in the utilization score
    pub error_weight: u64,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(2),
            error_weight: 1,
        }
    }
}

/// Read-only snapshot of one connection
#[derive(Debug, Clone)]
pub struct ConnectionMetrics {
    pub id: u64,
    pub purpose: Purpose,
    pub created_at: Instant,
    pub last_used_at: Instant,
    pub command_count: u64,
    pub error_count: u64,
    pub pending_ops: u32,
    pub average_latency: Duration,
    /// `pending_ops + error_count * error_weight`, lower is better
    pub utilization_score: u64,
    pub is_healthy: bool,
    pub busy: bool,
}

/// One pooled connection and its usage counters
pub struct ManagedConnection {
    id: u64,
    purpose: Purpose,
    created_at: Instant,
    last_used_at: RwLock<Instant>,
    command_count: AtomicU64,
    error_count: AtomicU64,
    latency_sum_micros: AtomicU64,
    pending_ops: AtomicU32,
    healthy: AtomicBool,
    busy: AtomicBool,
    transport: Mutex<Option<Box<dyn Transport>>>,
    options: ConnectionOptions,
    events: EventBus,
}

impl ManagedConnection {
    /// Establish a new connection for `purpose`
    pub async fn connect(
        id: u64,
        purpose: Purpose,
        connector: &dyn Connector,
        options: ConnectionOptions,
        events: EventBus,
    ) -> PoolResult<Self> {
        debug!(
            purpose = %purpose,
            connection_id = id,
            target = %connector.describe(),
            "Creating new connection"
        );

        let transport = tokio::time::timeout(options.connect_timeout, connector.connect(purpose))
            .await
            .map_err(|_| PoolError::ConnectionCreation {
                purpose,
                source: StoreError::Connect(format!(
                    "timed out after {:?}",
                    options.connect_timeout
                )),
            })?
            .map_err(|source| PoolError::ConnectionCreation { purpose, source })?;

        let now = Instant::now();
        let conn = Self {
            id,
            purpose,
            created_at: now,
            last_used_at: RwLock::new(now),
            command_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            latency_sum_micros: AtomicU64::new(0),
            pending_ops: AtomicU32::new(0),
            healthy: AtomicBool::new(true),
            busy: AtomicBool::new(false),
            transport: Mutex::new(Some(transport)),
            options,
            events,
        };

        conn.events.publish(PoolEvent::Connected {
            purpose,
            connection_id: id,
        });

        Ok(conn)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn purpose(&self) -> Purpose {
        self.purpose
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Run one command, updating usage counters
    ///
    /// Errors are counted before being returned. A connection-level failure
    /// also marks the connection unhealthy.
    pub async fn execute_command(&self, command: &Command) -> PoolResult<Reply> {
        let pending = PendingOp::new(&self.pending_ops);
        let start = Instant::now();

        let result = {
            let mut transport = self.transport.lock().await;
            match transport.as_mut() {
                None => Err(StoreError::Disconnected("connection closed".to_string())),
                Some(transport) => {
                    match tokio::time::timeout(self.options.command_timeout, transport.execute(command))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(StoreError::Timeout(self.options.command_timeout)),
                    }
                }
            }
        };

        let latency = start.elapsed();
        drop(pending);
        self.mark_used();
        self.command_count.fetch_add(1, Ordering::Relaxed);
        self.latency_sum_micros
            .fetch_add(u64::try_from(latency.as_micros()).unwrap_or(u64::MAX), Ordering::Relaxed);

        match result {
            Ok(reply) => Ok(reply),
            Err(err) => {
                self.error_count.fetch_add(1, Ordering::Relaxed);

                if err.is_connection_level() {
                    self.mark_unhealthy(&err.to_string());
                } else {
                    debug!(
                        purpose = %self.purpose,
                        connection_id = self.id,
                        command = command.name(),
                        error = %err,
                        "Command failed"
                    );
                }

                Err(match err {
                    StoreError::Timeout(timeout) => PoolError::CommandTimeout {
                        purpose: self.purpose,
                        command: command.name(),
                        timeout,
                    },
                    source => PoolError::CommandExecution {
                        purpose: self.purpose,
                        command: command.name(),
                        source,
                    },
                })
            }
        }
    }

    /// Lightweight liveness check
    pub async fn ping(&self) -> PoolResult<()> {
        match self.execute_command(&Command::Ping).await? {
            Reply::Pong => Ok(()),
            other => Err(PoolError::HealthCheckFailure {
                purpose: self.purpose,
                connection_id: self.id,
                reason: format!("unexpected ping reply: {:?}", other),
            }),
        }
    }

    /// Snapshot of the connection's counters
    pub fn metrics(&self) -> ConnectionMetrics {
        let command_count = self.command_count.load(Ordering::Relaxed);
        let error_count = self.error_count.load(Ordering::Relaxed);
        let pending_ops = self.pending_ops.load(Ordering::Acquire);
        let latency_sum = self.latency_sum_micros.load(Ordering::Relaxed);

        let average_latency = if command_count == 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(latency_sum / command_count)
        };

        ConnectionMetrics {
            id: self.id,
            purpose: self.purpose,
            created_at: self.created_at,
            last_used_at: self.last_used_at(),
            command_count,
            error_count,
            pending_ops,
            average_latency,
            utilization_score: pending_ops as u64
                + error_count.saturating_mul(self.options.error_weight),
            is_healthy: self.is_healthy(),
            busy: self.is_busy(),
        }
    }

    /// Whether the connection has not been used for longer than `threshold`
    pub fn is_idle(&self, threshold: Duration) -> bool {
        self.last_used_at().elapsed() > threshold
    }

    /// Close the transport. Idempotent.
    pub async fn close(&self) {
        let transport = self.transport.lock().await.take();
        self.healthy.store(false, Ordering::Release);

        if let Some(mut transport) = transport {
            transport.close().await;
            info!(
                purpose = %self.purpose,
                connection_id = self.id,
                commands = self.command_count.load(Ordering::Relaxed),
                age_secs = self.created_at.elapsed().as_secs(),
                "Closed connection"
            );
            self.events.publish(PoolEvent::Closed {
                purpose: self.purpose,
                connection_id: self.id,
            });
        }
    }

    fn last_used_at(&self) -> Instant {
        self.last_used_at
            .read()
            .map(|t| *t)
            .unwrap_or(self.created_at)
    }

    fn mark_used(&self) {
        if let Ok(mut last) = self.last_used_at.write() {
            *last = Instant::now();
        }
    }

    fn mark_unhealthy(&self, reason: &str) {
        if self.healthy.swap(false, Ordering::AcqRel) {
            warn!(
                purpose = %self.purpose,
                connection_id = self.id,
                reason = %reason,
                "Connection lost"
            );
            self.events.publish(PoolEvent::ConnectionLost {
                purpose: self.purpose,
                connection_id: self.id,
                reason: reason.to_string(),
            });
        }
    }

    /// Mark as checked out. Returns false if it already was.
    pub(crate) fn try_checkout(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn checkin(&self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// Counts one in-flight command, including one whose caller was cancelled
struct PendingOp<'a>(&'a AtomicU32);

impl<'a> PendingOp<'a> {
    fn new(counter: &'a AtomicU32) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for PendingOp<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for ManagedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedConnection")
            .field("id", &self.id)
            .field("purpose", &self.purpose)
            .field("healthy", &self.is_healthy())
            .field("busy", &self.is_busy())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryConnector, MemoryStore};
    use std::sync::Arc;

    async fn open(store: &Arc<MemoryStore>, events: EventBus) -> ManagedConnection {
        let connector = MemoryConnector::new(Arc::clone(store));
        ManagedConnection::connect(
            next_connection_id(),
            Purpose::Cache,
            &connector,
            ConnectionOptions::default(),
            events,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_connect_publishes_event() {
        let store = MemoryStore::new();
        let events = EventBus::new(8);
        let mut rx = events.subscribe();

        let conn = open(&store, events).await;
        assert!(conn.is_healthy());
        assert!(!conn.is_busy());
        assert_eq!(
            rx.recv().await.unwrap(),
            PoolEvent::Connected {
                purpose: Purpose::Cache,
                connection_id: conn.id()
            }
        );
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let store = MemoryStore::new();
        store.set_refuse_connections(true);
        let connector = MemoryConnector::new(Arc::clone(&store));

        let err = ManagedConnection::connect(
            1,
            Purpose::Queue,
            &connector,
            ConnectionOptions::default(),
            EventBus::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PoolError::ConnectionCreation { purpose: Purpose::Queue, .. }));
    }

    #[tokio::test]
    async fn test_execute_updates_counters() {
        let store = MemoryStore::new();
        let conn = open(&store, EventBus::default()).await;

        conn.execute_command(&Command::set("k", "v")).await.unwrap();
        conn.ping().await.unwrap();

        store.fail_next_commands(2);
        assert!(conn.execute_command(&Command::get("k")).await.is_err());
        assert!(conn.ping().await.is_err());

        let metrics = conn.metrics();
        assert_eq!(metrics.command_count, 4);
        assert_eq!(metrics.error_count, 2);
        assert_eq!(metrics.pending_ops, 0);
        assert_eq!(metrics.utilization_score, 2);
        // Command-level failures leave the connection healthy
        assert!(metrics.is_healthy);
    }

    #[tokio::test]
    async fn test_disconnect_marks_unhealthy() {
        let store = MemoryStore::new();
        let events = EventBus::new(8);
        let conn = open(&store, events.clone()).await;
        let mut rx = events.subscribe();

        store.disconnect_all();
        let err = conn.ping().await.unwrap_err();
        assert!(err.is_connection_level());
        assert!(!conn.is_healthy());
        assert!(matches!(rx.recv().await.unwrap(), PoolEvent::ConnectionLost { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_timeout() {
        let store = MemoryStore::new();
        store.set_latency(Duration::from_secs(10));
        let connector = MemoryConnector::new(Arc::clone(&store));
        let options = ConnectionOptions {
            command_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let conn = ManagedConnection::connect(1, Purpose::Cache, &connector, options, EventBus::default())
            .await
            .unwrap();

        let err = conn.ping().await.unwrap_err();
        assert!(matches!(err, PoolError::CommandTimeout { command: "PING", .. }));
        assert_eq!(conn.metrics().error_count, 1);
    }

    #[tokio::test]
    async fn test_cancelled_command_clears_pending_ops() {
        let store = MemoryStore::new();
        let conn = open(&store, EventBus::default()).await;
        store.set_latency(Duration::from_millis(500));

        let cancelled = tokio::time::timeout(Duration::from_millis(20), conn.execute_command(&Command::get("k"))).await;
        assert!(cancelled.is_err());

        let metrics = conn.metrics();
        assert_eq!(metrics.pending_ops, 0);
        assert_eq!(metrics.utilization_score, 0);
        assert!(conn.is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_is_idle() {
        let store = MemoryStore::new();
        let conn = open(&store, EventBus::default()).await;

        assert!(!conn.is_idle(Duration::from_millis(100)));
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(conn.is_idle(Duration::from_millis(100)));

        conn.ping().await.unwrap();
        assert!(!conn.is_idle(Duration::from_millis(100)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let store = MemoryStore::new();
        let conn = open(&store, EventBus::default()).await;

        conn.close().await;
        conn.close().await;
        assert!(!conn.is_healthy());
        assert!(conn.ping().await.is_err());
    }

    #[test]
    fn test_checkout_flag() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let store = MemoryStore::new();
        let conn = rt.block_on(open(&store, EventBus::default()));

        assert!(conn.try_checkout());
        assert!(!conn.try_checkout());
        conn.checkin();
        assert!(conn.try_checkout());
    }
}

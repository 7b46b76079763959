//! The pool manager facade
//!
//! `PoolManager` is the only entry point callers need. It owns one pool per
//! purpose plus the background tasks that keep them healthy, and routes each
//! command through recovery admission, the circuit breaker and the pool.

use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::circuit::{circuit_key, CircuitBreaker, CircuitBreakerConfig};
use super::connection::ConnectionOptions;
use super::error::{PoolError, PoolResult};
use super::events::{EventBus, PoolEvent};
use super::health::HealthMonitor;
use super::maintainer::PoolMaintainer;
use super::metrics::{MetricsCollector, PoolMetrics};
use super::purpose_pool::{Lease, Pool};
use super::recovery::{Admission, QueuedOperation, RecoveryOrchestrator, RecoveryOutcome, RecoveryStatus};
use crate::config::Config;
use crate::purpose::{Purpose, PurposeMap};
use crate::store::{Command, Connector, Reply};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Initializing,
    Running,
    ShutDown,
}

struct Inner {
    config: Config,
    events: EventBus,
    pools: PurposeMap<Arc<Pool>>,
    circuit_breaker: CircuitBreaker,
    recovery: RecoveryOrchestrator,
    metrics: Arc<MetricsCollector>,
    lifecycle: Mutex<Lifecycle>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    recovery_requests: mpsc::UnboundedSender<Purpose>,
    recovery_inbox: Mutex<Option<mpsc::UnboundedReceiver<Purpose>>>,
}

/// Pooled, fault-tolerant access to the backing store
///
/// Construct one at application start, call [`initialize`](Self::initialize)
/// before use and [`shutdown`](Self::shutdown) on the way out.
pub struct PoolManager {
    inner: Arc<Inner>,
}

impl PoolManager {
    pub fn new(config: Config, connector: Arc<dyn Connector>) -> Self {
        let events = EventBus::new(config.event_channel_capacity);
        let options = ConnectionOptions {
            connect_timeout: std::time::Duration::from_millis(config.store.connect_timeout_ms),
            command_timeout: std::time::Duration::from_millis(config.store.command_timeout_ms),
            error_weight: config.selector.error_weight,
        };

        let pools = config.pools.map(|purpose, pool_config| {
            Arc::new(Pool::new(
                purpose,
                pool_config.clone(),
                options.clone(),
                config.selector.overload_ceiling,
                Arc::clone(&connector),
                events.clone(),
            ))
        });

        let metrics = Arc::new(MetricsCollector::new(pools.clone(), config.metrics_interval()));
        let circuit_breaker = CircuitBreaker::new(CircuitBreakerConfig::from(&config.circuit_breaker));
        let recovery = RecoveryOrchestrator::new(config.recovery.clone(), events.clone());
        let (recovery_requests, recovery_inbox) = mpsc::unbounded_channel();

        debug!(target_store = %connector.describe(), "Pool manager created");

        Self {
            inner: Arc::new(Inner {
                config,
                events,
                pools,
                circuit_breaker,
                recovery,
                metrics,
                lifecycle: Mutex::new(Lifecycle::Created),
                tasks: Mutex::new(Vec::new()),
                recovery_requests,
                recovery_inbox: Mutex::new(Some(recovery_inbox)),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Warm every pool to its minimum and start background tasks
    ///
    /// Calling it again while running logs a warning and does nothing.
    pub async fn initialize(&self) -> PoolResult<()> {
        {
            let mut lifecycle = self.inner.lifecycle();
            match *lifecycle {
                Lifecycle::Created => *lifecycle = Lifecycle::Initializing,
                Lifecycle::Initializing | Lifecycle::Running => {
                    warn!("Pool manager already initialized");
                    return Ok(());
                }
                Lifecycle::ShutDown => return Err(PoolError::Shutdown),
            }
        }

        if let Err(e) = self.warm_up().await {
            error!(error = %e, "Pool manager initialization failed");
            for (_, pool) in self.inner.pools.iter() {
                pool.shutdown().await;
            }
            *self.inner.lifecycle() = Lifecycle::ShutDown;
            return Err(e);
        }

        let mut handles = Vec::new();
        let recovery_tx = self.inner.recovery_requests.clone();
        for (_, pool) in self.inner.pools.iter() {
            let monitor = Arc::new(HealthMonitor::new(Arc::clone(pool), recovery_tx.clone()));
            handles.push(monitor.start());
        }

        let maintainer = PoolMaintainer::new(
            self.inner.pools.iter().map(|(_, pool)| Arc::clone(pool)).collect(),
            self.inner.config.maintenance_interval(),
        );
        handles.push(Arc::new(maintainer).start());
        handles.push(Arc::clone(&self.inner.metrics).start());

        let inbox = self.inner.recovery_inbox.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(inbox) = inbox {
            handles.push(Inner::start_listener(&self.inner, inbox));
        }

        self.inner.tasks().extend(handles);

        // Shutdown may have raced with warm-up
        let mut lifecycle = self.inner.lifecycle();
        if *lifecycle == Lifecycle::ShutDown {
            drop(lifecycle);
            self.inner.abort_tasks();
            return Err(PoolError::Shutdown);
        }
        *lifecycle = Lifecycle::Running;

        let total: usize = self.inner.pools.iter().map(|(_, pool)| pool.len()).sum();
        info!(pools = Purpose::ALL.len(), connections = total, "Pool manager initialized");
        Ok(())
    }

    async fn warm_up(&self) -> PoolResult<()> {
        self.inner
            .config
            .validate()
            .map_err(PoolError::InvalidConfig)?;

        for (purpose, pool) in self.inner.pools.iter() {
            let created = pool.ensure_min().await?;
            debug!(purpose = %purpose, created = created, "Pool warmed up");
        }
        Ok(())
    }

    /// Run one command for `purpose`
    ///
    /// Command failures surface as `CommandExecution`/`CommandTimeout`.
    /// Connection-level failures start recovery and the command waits for it;
    /// if recovery gives up or its queue is full the caller gets
    /// `RecoveryExhausted`.
    pub async fn execute_command(&self, purpose: Purpose, command: Command) -> PoolResult<Reply> {
        self.inner.ensure_running()?;

        let mut command = match self.inner.recovery.admit(purpose, command).await? {
            Admission::Proceed(command) => command,
            Admission::Queued(receiver) => return Inner::await_replay(receiver).await,
        };

        loop {
            match self.inner.run_command(purpose, &command).await {
                Err(e) if e.is_connection_level() => {
                    debug!(
                        purpose = %purpose,
                        command = command.name(),
                        error = %e,
                        "Connection-level failure, deferring to recovery"
                    );
                    Inner::start_recovery(&self.inner, purpose).await;

                    command = match self.inner.recovery.admit(purpose, command).await? {
                        Admission::Queued(receiver) => return Inner::await_replay(receiver).await,
                        // Recovery already finished; try again
                        Admission::Proceed(command) => command,
                    };
                }
                result => return result,
            }
        }
    }

    /// Borrow a connection for several commands
    pub async fn acquire(&self, purpose: Purpose) -> PoolResult<Lease> {
        self.inner.ensure_running()?;
        self.inner.pools.get(purpose).acquire().await
    }

    /// Aggregate metrics across every pool
    pub fn pool_metrics(&self) -> PoolMetrics {
        self.inner.metrics.collect()
    }

    /// Metrics for a single purpose
    pub fn pool_metrics_for(&self, purpose: Purpose) -> PoolMetrics {
        self.inner.metrics.collect_for(purpose)
    }

    pub fn pool(&self, purpose: Purpose) -> &Arc<Pool> {
        self.inner.pools.get(purpose)
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.inner.circuit_breaker
    }

    pub async fn recovery_status(&self, purpose: Purpose) -> RecoveryStatus {
        self.inner.recovery.status(purpose).await
    }

    /// Put a degraded purpose back into service
    pub async fn reset_recovery(&self, purpose: Purpose) -> bool {
        self.inner.recovery.reset(purpose).await
    }

    /// Subscribe to connection lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        *self.inner.lifecycle() == Lifecycle::Running
    }

    /// Stop background tasks, reject waiters and close every connection
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        {
            let mut lifecycle = self.inner.lifecycle();
            if *lifecycle == Lifecycle::ShutDown {
                debug!("Pool manager already shut down");
                return;
            }
            *lifecycle = Lifecycle::ShutDown;
        }

        info!("Shutting down pool manager");
        self.inner.abort_tasks();
        self.inner.recovery.shutdown().await;

        for (_, pool) in self.inner.pools.iter() {
            pool.shutdown().await;
        }
        info!("Pool manager shut down");
    }
}

impl Drop for PoolManager {
    fn drop(&mut self) {
        // Background tasks hold the inner state; stop them so it can be freed
        self.inner.abort_tasks();
    }
}

impl Inner {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn abort_tasks(&self) {
        for handle in self.tasks().drain(..) {
            handle.abort();
        }
    }

    fn ensure_running(&self) -> PoolResult<()> {
        match *self.lifecycle() {
            Lifecycle::Running => Ok(()),
            Lifecycle::ShutDown => Err(PoolError::Shutdown),
            Lifecycle::Created | Lifecycle::Initializing => Err(PoolError::NotInitialized),
        }
    }

    /// Circuit check, acquire, execute, release
    ///
    /// If the caller is cancelled midway the circuit permit is dropped
    /// unreported, which frees a half-open trial slot.
    async fn run_command(&self, purpose: Purpose, command: &Command) -> PoolResult<Reply> {
        let permit = self
            .circuit_breaker
            .permit(&circuit_key(purpose, command))
            .await?;

        let lease = match self.pools.get(purpose).acquire().await {
            Ok(lease) => lease,
            Err(e) => {
                if e.counts_as_failure() {
                    permit.failure().await;
                } else {
                    permit.abandon().await;
                }
                return Err(e);
            }
        };

        let result = lease.execute(command).await;
        drop(lease);

        match &result {
            Ok(_) => permit.success().await,
            Err(e) if e.counts_as_failure() => permit.failure().await,
            Err(_) => permit.abandon().await,
        }
        result
    }

    async fn await_replay(receiver: tokio::sync::oneshot::Receiver<PoolResult<Reply>>) -> PoolResult<Reply> {
        receiver.await.unwrap_or(Err(PoolError::Shutdown))
    }

    /// Start a reconnection sequence for `purpose` unless one is running
    async fn start_recovery(inner: &Arc<Inner>, purpose: Purpose) {
        if !inner.recovery.begin(purpose).await {
            return;
        }

        let task_inner = Arc::clone(inner);
        let handle = tokio::spawn(async move {
            let pool = Arc::clone(task_inner.pools.get(purpose));
            let max_attempts = pool.config().retry_attempts;

            loop {
                let outcome = task_inner
                    .recovery
                    .run(purpose, max_attempts, || {
                        let pool = Arc::clone(&pool);
                        async move { pool.recover().await }
                    })
                    .await;

                let RecoveryOutcome::Recovered { replay, .. } = outcome else {
                    break;
                };
                let Some(unfinished) = task_inner.replay(purpose, replay).await else {
                    break;
                };
                if !task_inner.recovery.resume(purpose, unfinished).await {
                    break;
                }
            }
        });

        let mut tasks = inner.tasks();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    /// Run queued operations one by one in submission order
    ///
    /// Stops at the first connection-level failure and returns that
    /// operation with the rest, so they wait for another recovery instead
    /// of surfacing the outage.
    async fn replay(&self, purpose: Purpose, replay: Vec<QueuedOperation>) -> Option<Vec<QueuedOperation>> {
        let mut ops = replay.into_iter();
        while let Some(op) = ops.next() {
            let waited = op.enqueued_at.elapsed();
            let result = self.run_command(purpose, &op.command).await;

            if let Err(e) = &result {
                if e.is_connection_level() {
                    warn!(
                        purpose = %purpose,
                        command = op.command.name(),
                        error = %e,
                        "Replay hit a lost connection"
                    );
                    let mut unfinished = vec![op];
                    unfinished.extend(ops);
                    return Some(unfinished);
                }
            }

            debug!(
                purpose = %purpose,
                command = op.command.name(),
                waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                ok = result.is_ok(),
                "Replayed queued operation"
            );
            let _ = op.responder.send(result);
        }
        None
    }

    /// Route recovery requests from health monitors and log connection events
    fn start_listener(inner: &Arc<Inner>, mut inbox: mpsc::UnboundedReceiver<Purpose>) -> JoinHandle<()> {
        let inner = Arc::clone(inner);
        let mut events = inner.events.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    request = inbox.recv() => match request {
                        Some(purpose) => Inner::start_recovery(&inner, purpose).await,
                        None => break,
                    },
                    event = events.recv() => match event {
                        Ok(PoolEvent::ConnectionLost { purpose, connection_id, reason }) => {
                            debug!(
                                purpose = %purpose,
                                connection_id = connection_id,
                                reason = %reason,
                                "Connection lost event"
                            );
                        }
                        Ok(event) => debug!(event = ?event, "Pool event"),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped = skipped, "Event listener lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryConnector, MemoryStore};

    fn create_manager(store: &Arc<MemoryStore>) -> PoolManager {
        PoolManager::new(Config::default(), Arc::new(MemoryConnector::new(Arc::clone(store))))
    }

    #[tokio::test]
    async fn test_requires_initialize() {
        let store = MemoryStore::new();
        let manager = create_manager(&store);

        let err = manager.execute_command(Purpose::Cache, Command::get("k")).await.unwrap_err();
        assert!(matches!(err, PoolError::NotInitialized));
        assert!(matches!(manager.acquire(Purpose::Cache).await, Err(PoolError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_initialize_warms_pools_once() {
        let store = MemoryStore::new();
        let manager = create_manager(&store);

        manager.initialize().await.unwrap();
        manager.initialize().await.unwrap();

        for purpose in Purpose::ALL {
            assert_eq!(
                manager.pool(purpose).len(),
                manager.config().pool(purpose).min_connections
            );
        }
        assert_eq!(store.connect_count(), 2 + 2 + 3 + 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let store = MemoryStore::new();
        let mut config = Config::default();
        config.pools.metrics.min_connections = 9;
        let manager = PoolManager::new(config, Arc::new(MemoryConnector::new(store)));

        assert!(matches!(manager.initialize().await, Err(PoolError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_execute_round_trip() {
        let store = MemoryStore::new();
        let manager = create_manager(&store);
        manager.initialize().await.unwrap();

        manager
            .execute_command(Purpose::Session, Command::hset("session:1", "user", "ada"))
            .await
            .unwrap();
        let reply = manager
            .execute_command(Purpose::Session, Command::hget("session:1", "user"))
            .await
            .unwrap();
        assert_eq!(reply.as_bytes().map(|b| b.as_ref()), Some(&b"ada"[..]));

        manager.shutdown().await;
        assert!(matches!(
            manager.execute_command(Purpose::Session, Command::Ping).await,
            Err(PoolError::Shutdown)
        ));
        assert!(matches!(manager.initialize().await, Err(PoolError::Shutdown)));
    }

    #[tokio::test]
    async fn test_command_failure_surfaces_and_counts() {
        let store = MemoryStore::new();
        let manager = create_manager(&store);
        manager.initialize().await.unwrap();

        store.fail_next_commands(1);
        let err = manager.execute_command(Purpose::Cache, Command::get("k")).await.unwrap_err();
        assert!(matches!(err, PoolError::CommandExecution { command: "GET", .. }));

        let stats = manager.circuit_breaker().stats("cache:GET").await.unwrap();
        assert_eq!(stats.failure_count, 1);
        assert_eq!(manager.recovery_status(Purpose::Cache).await, RecoveryStatus::Healthy);

        manager.execute_command(Purpose::Cache, Command::get("k")).await.unwrap();
        let stats = manager.circuit_breaker().stats("cache:GET").await.unwrap();
        assert_eq!(stats.failure_count, 0);
        manager.shutdown().await;
    }
}

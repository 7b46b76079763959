//! Integration tests for the pool manager
//!
//! These tests drive the pools, circuit breaker and recovery together
//! against the in-process store, including injected outages.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use storepool::config::{Config, PoolConfig};
use storepool::pool::{
    CircuitState, ConnectionOptions, EventBus, ExhaustionCause, HealthMonitor, Pool, PoolError,
    PoolEvent, PoolMaintainer, PoolManager, RecoveryStatus, Strategy,
};
use storepool::store::{Command, MemoryConnector, MemoryStore, Reply};
use storepool::Purpose;

fn pool_config(min: usize, max: usize) -> PoolConfig {
    PoolConfig {
        min_connections: min,
        max_connections: max,
        acquire_timeout_ms: 1_000,
        idle_timeout_ms: 60_000,
        health_check_interval_ms: 60_000,
        retry_attempts: 100,
        load_balancing_strategy: Strategy::LeastConnections,
        max_queue_size: 64,
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.pools.queue = pool_config(1, 1);
    config.pools.session = pool_config(1, 2);
    config.pools.cache = pool_config(2, 5);
    config.pools.metrics = pool_config(1, 2);
    config.circuit_breaker.failure_threshold = 5;
    config.circuit_breaker.timeout_ms = 200;
    config.recovery.initial_delay_ms = 10;
    config.recovery.max_delay_ms = 40;
    config.recovery.jitter_ms = 0;
    config.maintenance_interval_ms = 60_000;
    config
}

async fn start_manager(config: Config) -> (Arc<MemoryStore>, PoolManager) {
    let store = MemoryStore::new();
    let manager = PoolManager::new(config, Arc::new(MemoryConnector::new(Arc::clone(&store))));
    manager.initialize().await.unwrap();
    (store, manager)
}

async fn wait_for_status(manager: &PoolManager, purpose: Purpose, expected: RecoveryStatus) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while manager.recovery_status(purpose).await != expected {
        assert!(Instant::now() < deadline, "timed out waiting for {:?}", expected);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

#[tokio::test]
async fn test_pool_size_stays_within_bounds() {
    let store = MemoryStore::new();
    let mut config = pool_config(2, 4);
    config.idle_timeout_ms = 50;
    let pool = Arc::new(Pool::new(
        Purpose::Cache,
        config,
        ConnectionOptions::default(),
        100,
        Arc::new(MemoryConnector::new(Arc::clone(&store))),
        EventBus::default(),
    ));
    pool.ensure_min().await.unwrap();
    assert_eq!(pool.len(), 2);

    // Expansion stops at the ceiling
    let mut leases = Vec::new();
    for _ in 0..4 {
        leases.push(pool.acquire().await.unwrap());
        assert!(pool.len() >= 2 && pool.len() <= 4);
    }
    drop(leases);

    // Replacement preserves size
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let monitor = HealthMonitor::new(Arc::clone(&pool), tx);
    store.disconnect_all();
    let report = monitor.check_pool().await;
    assert_eq!(report.replaced, 4);
    assert_eq!(pool.len(), 4);

    // Eviction stops at the floor
    tokio::time::sleep(Duration::from_millis(80)).await;
    let maintainer = PoolMaintainer::new(vec![Arc::clone(&pool)], Duration::from_secs(60));
    for _ in 0..3 {
        maintainer.run_once().await;
        assert_eq!(pool.len(), 2);
    }
}

#[tokio::test]
async fn test_double_shutdown_empties_every_pool() {
    let (_store, manager) = start_manager(test_config()).await;
    assert_eq!(manager.pool(Purpose::Cache).len(), 2);

    manager.shutdown().await;
    manager.shutdown().await;

    for purpose in Purpose::ALL {
        assert_eq!(manager.pool(purpose).len(), 0);
    }
    assert!(!manager.is_running());
}

#[tokio::test]
async fn test_shutdown_rejects_queued_waiters() {
    let (_store, manager) = start_manager(test_config()).await;
    let manager = Arc::new(manager);

    let _held = manager.acquire(Purpose::Queue).await.unwrap();
    let waiting = Arc::clone(&manager);
    let waiter = tokio::spawn(async move { waiting.acquire(Purpose::Queue).await.map(|l| l.id()) });
    while manager.pool(Purpose::Queue).waiting() == 0 {
        tokio::task::yield_now().await;
    }

    manager.shutdown().await;
    assert!(matches!(waiter.await.unwrap(), Err(PoolError::Shutdown)));
}

#[tokio::test]
async fn test_acquire_timeout_when_exhausted() {
    let mut config = test_config();
    config.pools.queue.acquire_timeout_ms = 100;
    let (_store, manager) = start_manager(config).await;

    let held = manager.acquire(Purpose::Queue).await.unwrap();

    let started = Instant::now();
    let err = manager.acquire(Purpose::Queue).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, PoolError::AcquisitionTimeout { purpose: Purpose::Queue, .. }));
    assert!(elapsed >= Duration::from_millis(90), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(600), "elapsed {:?}", elapsed);

    // The held connection is unaffected and still usable
    assert_eq!(held.execute(&Command::Ping).await.unwrap(), Reply::Pong);
    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquire_expands_before_queueing() {
    let (_store, manager) = start_manager(test_config()).await;
    let manager = Arc::new(manager);
    assert_eq!(manager.pool(Purpose::Cache).len(), 2);

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.acquire(Purpose::Cache).await })
        })
        .collect();

    let mut leases = Vec::new();
    for handle in handles {
        leases.push(handle.await.unwrap().unwrap());
    }

    let ids: HashSet<u64> = leases.iter().map(|l| l.id()).collect();
    assert_eq!(ids.len(), 5);
    assert_eq!(manager.pool(Purpose::Cache).len(), 5);
    assert_eq!(manager.pool(Purpose::Cache).stats().acquire_timeouts, 0);

    let metrics = manager.pool_metrics_for(Purpose::Cache);
    assert_eq!(metrics.connections.active, 5);
    assert_eq!(metrics.scaling.pool_expansions, 3);

    drop(leases);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_circuit_breaker_fast_fails() {
    let mut config = test_config();
    config.circuit_breaker.failure_threshold = 3;
    let (store, manager) = start_manager(config).await;

    store.fail_next_commands(3);
    for _ in 0..3 {
        let err = manager.execute_command(Purpose::Cache, Command::get("k")).await.unwrap_err();
        assert!(matches!(err, PoolError::CommandExecution { .. }));
    }
    assert_eq!(manager.circuit_breaker().state("cache:GET").await.name(), "OPEN");

    // Rejected without reaching the store
    let commands_before = store.command_count();
    let err = manager.execute_command(Purpose::Cache, Command::get("k")).await.unwrap_err();
    assert!(matches!(err, PoolError::CircuitOpen { .. }));
    assert_eq!(store.command_count(), commands_before);

    // Other operation classes are unaffected
    manager.execute_command(Purpose::Cache, Command::set("k", "v")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(250)).await;

    let reply = manager.execute_command(Purpose::Cache, Command::get("k")).await.unwrap();
    assert_eq!(reply, Reply::Bulk("v".into()));
    assert_eq!(manager.circuit_breaker().state("cache:GET").await, CircuitState::Closed);
    assert_eq!(
        manager.circuit_breaker().stats("cache:GET").await.unwrap().failure_count,
        0
    );
    manager.shutdown().await;
}

#[tokio::test]
async fn test_operations_during_recovery_replay_in_order() {
    let (store, manager) = start_manager(test_config()).await;
    let manager = Arc::new(manager);
    let mut events = manager.subscribe();

    store.disconnect_all();
    store.set_refuse_connections(true);

    let mut handles = Vec::new();
    for (n, value) in ["a", "b", "c"].into_iter().enumerate() {
        let m = Arc::clone(&manager);
        handles.push(tokio::spawn(async move {
            m.execute_command(Purpose::Queue, Command::lpush("jobs", value)).await
        }));
        wait_for_status(&manager, Purpose::Queue, RecoveryStatus::Recovering { queued: n + 1 }).await;
    }

    store.set_refuse_connections(false);

    // Replayed once each, in submission order
    let mut lengths = Vec::new();
    for handle in handles {
        lengths.push(handle.await.unwrap().unwrap());
    }
    assert_eq!(lengths, vec![Reply::Int(1), Reply::Int(2), Reply::Int(3)]);
    assert_eq!(manager.recovery_status(Purpose::Queue).await, RecoveryStatus::Healthy);

    for expected in ["a", "b", "c"] {
        let reply = manager.execute_command(Purpose::Queue, Command::rpop("jobs")).await.unwrap();
        assert_eq!(reply, Reply::Bulk(expected.into()));
    }
    assert_eq!(
        manager.execute_command(Purpose::Queue, Command::llen("jobs")).await.unwrap(),
        Reply::Int(0)
    );

    let mut seen_started = false;
    let mut seen_recovered = false;
    while let Ok(event) = events.try_recv() {
        match event {
            PoolEvent::RecoveryStarted { purpose: Purpose::Queue } => seen_started = true,
            PoolEvent::Recovered { purpose: Purpose::Queue, .. } => seen_recovered = true,
            _ => {}
        }
    }
    assert!(seen_started && seen_recovered);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_exhausted_recovery_degrades_purpose() {
    let mut config = test_config();
    config.pools.session.retry_attempts = 2;
    let (store, manager) = start_manager(config).await;

    store.disconnect_all();
    store.set_refuse_connections(true);

    let err = manager
        .execute_command(Purpose::Session, Command::hget("s:1", "user"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PoolError::RecoveryExhausted {
            purpose: Purpose::Session,
            cause: ExhaustionCause::AttemptsExhausted { attempts: 2 },
        }
    ));
    assert_eq!(
        manager.recovery_status(Purpose::Session).await,
        RecoveryStatus::Degraded { attempts: 2 }
    );

    // Fails fast while degraded, even once the store is back
    store.set_refuse_connections(false);
    let connects_before = store.connect_count();
    let started = Instant::now();
    let err = manager
        .execute_command(Purpose::Session, Command::hget("s:1", "user"))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::RecoveryExhausted { .. }));
    assert!(started.elapsed() < Duration::from_millis(50));
    assert_eq!(store.connect_count(), connects_before);

    // Other purposes keep working
    manager.execute_command(Purpose::Cache, Command::Ping).await.unwrap();

    assert!(manager.reset_recovery(Purpose::Session).await);
    let reply = manager
        .execute_command(Purpose::Session, Command::hget("s:1", "user"))
        .await
        .unwrap();
    assert_eq!(reply, Reply::Nil);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_full_recovery_queue_rejects() {
    let mut config = test_config();
    config.recovery.max_queue_size = 1;
    let (store, manager) = start_manager(config).await;
    let manager = Arc::new(manager);

    store.disconnect_all();
    store.set_refuse_connections(true);

    let m = Arc::clone(&manager);
    let queued = tokio::spawn(async move { m.execute_command(Purpose::Queue, Command::llen("jobs")).await });
    wait_for_status(&manager, Purpose::Queue, RecoveryStatus::Recovering { queued: 1 }).await;

    let err = manager
        .execute_command(Purpose::Queue, Command::llen("jobs"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PoolError::RecoveryExhausted {
            cause: ExhaustionCause::QueueFull { capacity: 1 },
            ..
        }
    ));

    store.set_refuse_connections(false);
    assert_eq!(queued.await.unwrap().unwrap(), Reply::Int(0));
    manager.shutdown().await;
}

#[tokio::test]
async fn test_metrics_snapshot_json() {
    let (_store, manager) = start_manager(test_config()).await;

    for n in 0..10 {
        manager
            .execute_command(Purpose::Metrics, Command::incr(format!("counter:{}", n % 2)))
            .await
            .unwrap();
    }

    let metrics = manager.pool_metrics();
    assert_eq!(metrics.total_pools, 4);
    assert_eq!(metrics.connections.total, 1 + 1 + 2 + 1);
    assert_eq!(metrics.connections.idle, 5);
    assert_eq!(metrics.performance.error_rate, 0.0);
    assert_eq!(metrics.scaling.current_capacity, 1 + 2 + 5 + 2);

    let json = serde_json::to_value(&metrics).unwrap();
    assert_eq!(json["totalPools"], 4);
    assert_eq!(json["connections"]["total"], 5);
    assert!(json["performance"]["averageLatencyMs"].is_number());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_cancelled_trial_call_reopens_trial_slot() {
    let mut config = test_config();
    config.circuit_breaker.failure_threshold = 1;
    config.circuit_breaker.timeout_ms = 50;
    let (store, manager) = start_manager(config).await;

    store.fail_next_commands(1);
    assert!(manager.execute_command(Purpose::Cache, Command::get("k")).await.is_err());
    assert_eq!(manager.circuit_breaker().state("cache:GET").await.name(), "OPEN");
    tokio::time::sleep(Duration::from_millis(80)).await;

    // The trial call is abandoned by its caller mid-flight
    store.set_latency(Duration::from_millis(500));
    let cancelled = tokio::time::timeout(
        Duration::from_millis(30),
        manager.execute_command(Purpose::Cache, Command::get("k")),
    )
    .await;
    assert!(cancelled.is_err());
    store.set_latency(Duration::ZERO);

    let reply = manager.execute_command(Purpose::Cache, Command::get("k")).await.unwrap();
    assert_eq!(reply, Reply::Nil);
    assert_eq!(manager.circuit_breaker().state("cache:GET").await, CircuitState::Closed);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_cancelled_command_releases_connection() {
    let (store, manager) = start_manager(test_config()).await;

    store.set_latency(Duration::from_millis(200));
    let cancelled = tokio::time::timeout(
        Duration::from_millis(20),
        manager.execute_command(Purpose::Queue, Command::llen("jobs")),
    )
    .await;
    assert!(cancelled.is_err());
    store.set_latency(Duration::ZERO);

    // The only queue connection is free and carries no phantom load
    let pool = manager.pool(Purpose::Queue);
    let snapshot = pool.snapshot();
    assert_eq!(snapshot.connections.len(), 1);
    assert!(!snapshot.connections[0].busy);
    assert_eq!(snapshot.connections[0].pending_ops, 0);

    let reply = manager.execute_command(Purpose::Queue, Command::llen("jobs")).await.unwrap();
    assert_eq!(reply, Reply::Int(0));
    assert_eq!(pool.stats().acquire_timeouts, 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_replay_skips_connections_that_died_unused() {
    let (store, manager) = start_manager(test_config()).await;
    let manager = Arc::new(manager);
    assert_eq!(manager.pool(Purpose::Cache).len(), 2);

    manager
        .execute_command(Purpose::Cache, Command::set("k", "v"))
        .await
        .unwrap();

    store.disconnect_all();
    store.set_refuse_connections(true);

    let m = Arc::clone(&manager);
    let queued = tokio::spawn(async move { m.execute_command(Purpose::Cache, Command::get("k")).await });
    wait_for_status(&manager, Purpose::Cache, RecoveryStatus::Recovering { queued: 1 }).await;

    store.set_refuse_connections(false);

    let reply = queued.await.unwrap().unwrap();
    assert_eq!(reply, Reply::Bulk("v".into()));
    assert_eq!(manager.recovery_status(Purpose::Cache).await, RecoveryStatus::Healthy);

    let snapshot = manager.pool(Purpose::Cache).snapshot();
    assert_eq!(snapshot.connections.len(), 2);
    assert!(snapshot.connections.iter().all(|c| c.is_healthy));

    manager.shutdown().await;
}

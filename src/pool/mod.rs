//! Connection pooling and fault tolerance
//!
//! This module provides:
//! - Per-purpose connection pools with load-balanced selection
//! - Health checking and idle eviction background tasks
//! - Circuit breakers per operation class
//! - Backoff-driven recovery that replays operations queued during an outage
//! - The `PoolManager` facade tying them together

pub mod circuit;
pub mod connection;
pub mod error;
pub mod events;
pub mod health;
pub mod maintainer;
pub mod manager;
pub mod metrics;
pub mod purpose_pool;
pub mod recovery;
pub mod selector;

pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitPermit, CircuitState, CircuitStats};
pub use connection::{ConnectionMetrics, ConnectionOptions, ManagedConnection};
pub use error::{ExhaustionCause, PoolError, PoolResult};
pub use events::{EventBus, PoolEvent};
pub use health::{HealthMonitor, HealthReport};
pub use maintainer::PoolMaintainer;
pub use manager::PoolManager;
pub use metrics::{MetricsCollector, PoolMetrics};
pub use purpose_pool::{Lease, Pool, PoolSnapshot, PoolStats};
pub use recovery::{RecoveryOrchestrator, RecoveryStatus};
pub use selector::{Selector, Strategy};

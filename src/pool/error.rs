//! Error taxonomy for pool operations

use std::fmt;
use std::time::Duration;

use crate::purpose::Purpose;
use crate::store::StoreError;

/// Why a recovering purpose refused an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExhaustionCause {
    /// The recovery replay queue is full
    QueueFull { capacity: usize },
    /// Reconnection gave up after this many attempts
    AttemptsExhausted { attempts: u32 },
}

impl fmt::Display for ExhaustionCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExhaustionCause::QueueFull { capacity } => {
                write!(f, "recovery queue full ({} operations)", capacity)
            }
            ExhaustionCause::AttemptsExhausted { attempts } => {
                write!(f, "gave up after {} reconnect attempts", attempts)
            }
        }
    }
}

/// Error types for pool operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    #[error("Failed to create {purpose} connection: {source}")]
    ConnectionCreation {
        purpose: Purpose,
        #[source]
        source: StoreError,
    },

    #[error("Timed out after {waited:?} waiting for a {purpose} connection")]
    AcquisitionTimeout { purpose: Purpose, waited: Duration },

    #[error("Acquisition queue for {purpose} is full ({capacity} waiters)")]
    PoolSaturated { purpose: Purpose, capacity: usize },

    #[error("Circuit breaker is open for {key}, retry in {retry_in:?}")]
    CircuitOpen { key: String, retry_in: Duration },

    #[error("{command} failed on {purpose} connection: {source}")]
    CommandExecution {
        purpose: Purpose,
        command: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("{command} on {purpose} connection timed out after {timeout:?}")]
    CommandTimeout {
        purpose: Purpose,
        command: &'static str,
        timeout: Duration,
    },

    #[error("Health check failed for {purpose} connection {connection_id}: {reason}")]
    HealthCheckFailure {
        purpose: Purpose,
        connection_id: u64,
        reason: String,
    },

    #[error("Purpose {purpose} is degraded: {cause}")]
    RecoveryExhausted {
        purpose: Purpose,
        cause: ExhaustionCause,
    },

    #[error("Pool manager has not been initialized")]
    NotInitialized,

    #[error("Pool manager is shut down")]
    Shutdown,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PoolError {
    /// Whether the failure means the store itself is unreachable, as opposed to
    /// a single command going wrong
    pub fn is_connection_level(&self) -> bool {
        match self {
            PoolError::ConnectionCreation { .. } => true,
            PoolError::CommandExecution { source, .. } => source.is_connection_level(),
            _ => false,
        }
    }

    /// Whether the failure should count against the circuit breaker
    pub fn counts_as_failure(&self) -> bool {
        matches!(
            self,
            PoolError::CommandExecution { .. }
                | PoolError::CommandTimeout { .. }
                | PoolError::ConnectionCreation { .. }
        )
    }
}

pub type PoolResult<T> = Result<T, PoolError>;

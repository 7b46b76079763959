//! Circuit breaker implementation for fault tolerance
//!
//! One circuit per operation class (`"{purpose}:{COMMAND}"`), three states:
//! - Closed: Normal operation, calls are allowed
//! - Open: The store keeps failing, calls are rejected without running
//! - HalfOpen: Exactly one trial call is allowed through
//!
//! Circuits are created lazily on first use and live for the process lifetime.
//! A half-open trial is handed out as a [`CircuitPermit`]; dropping the permit
//! without reporting an outcome frees the trial slot. A trial that is never
//! reported at all expires after the open timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::error::{PoolError, PoolResult};
use crate::config::CircuitBreakerSettings;
use crate::purpose::Purpose;
use crate::store::Command;

/// Circuit key for one operation class
pub fn circuit_key(purpose: Purpose, command: &Command) -> String {
    format!("{}:{}", purpose, command.name())
}

/// Circuit breaker states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - calls are allowed
    Closed,

    /// Store has failed - calls are rejected
    Open {
        /// When the circuit may admit a trial call
        retry_at: Instant,

        /// Consecutive failures that opened the circuit
        failure_count: u32,
    },

    /// Testing recovery - one trial call at a time
    HalfOpen {
        /// Whether the trial call has been admitted and not yet reported
        trial_in_flight: bool,
    },
}

impl CircuitState {
    /// Get a human-readable state name
    pub fn name(&self) -> &str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open { .. } => "OPEN",
            CircuitState::HalfOpen { .. } => "HALF_OPEN",
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: u32,

    /// How long to stay open before admitting a trial call
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
        }
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            timeout: Duration::from_millis(settings.timeout_ms),
        }
    }
}

/// Per-key circuit state and statistics
struct Circuit {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    total_requests: u64,
    total_rejections: u64,
    total_successes: u64,
    total_failures: u64,
    open_count: u64,
    last_transition: Instant,
    /// Id and admission time of the in-flight half-open trial
    trial: Option<(u64, Instant)>,
    next_trial_id: u64,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            total_requests: 0,
            total_rejections: 0,
            total_successes: 0,
            total_failures: 0,
            open_count: 0,
            last_transition: Instant::now(),
            trial: None,
            next_trial_id: 0,
        }
    }

    fn begin_trial(&mut self, now: Instant) -> u64 {
        let id = self.next_trial_id;
        self.next_trial_id += 1;
        self.state = CircuitState::HalfOpen {
            trial_in_flight: true,
        };
        self.trial = Some((id, now));
        id
    }

    /// Check if a call is allowed, moving Open to HalfOpen once the timeout passed
    ///
    /// Returns the trial id when the call is the half-open trial.
    fn check(&mut self, key: &str, config: &CircuitBreakerConfig) -> PoolResult<Option<u64>> {
        self.total_requests += 1;
        let now = Instant::now();

        let outcome = match self.state.clone() {
            CircuitState::Closed => Ok(None),

            CircuitState::Open { retry_at, .. } => {
                if now >= retry_at {
                    info!(key = %key, "Circuit transitioning from OPEN to HALF_OPEN");
                    self.last_transition = now;
                    Ok(Some(self.begin_trial(now)))
                } else {
                    Err(retry_at.saturating_duration_since(now))
                }
            }

            CircuitState::HalfOpen { trial_in_flight } => match self.trial {
                Some((_, started)) if trial_in_flight && now < started + config.timeout => {
                    Err(started + config.timeout - now)
                }
                Some((id, _)) if trial_in_flight => {
                    warn!(key = %key, trial_id = id, "Trial call never reported, admitting another");
                    Ok(Some(self.begin_trial(now)))
                }
                _ => Ok(Some(self.begin_trial(now))),
            },
        };

        match outcome {
            Ok(trial) => Ok(trial),
            Err(retry_in) => {
                self.total_rejections += 1;
                Err(PoolError::CircuitOpen {
                    key: key.to_string(),
                    retry_in,
                })
            }
        }
    }

    fn record_success(&mut self, key: &str) {
        self.total_successes += 1;
        self.failure_count = 0;

        if let CircuitState::HalfOpen { .. } = self.state {
            info!(key = %key, "Circuit transitioning from HALF_OPEN to CLOSED");
            self.transition_to_closed();
        }
    }

    fn record_failure(&mut self, key: &str, config: &CircuitBreakerConfig) {
        self.total_failures += 1;
        self.failure_count += 1;
        self.last_failure = Some(Instant::now());

        match &self.state {
            CircuitState::Closed => {
                debug!(
                    key = %key,
                    failure_count = self.failure_count,
                    threshold = config.failure_threshold,
                    "Call failed in CLOSED state"
                );

                if self.failure_count >= config.failure_threshold {
                    warn!(
                        key = %key,
                        failure_count = self.failure_count,
                        "Circuit transitioning from CLOSED to OPEN"
                    );
                    self.transition_to_open(config.timeout);
                }
            }

            CircuitState::Open { .. } => {
                debug!(key = %key, "Call failed in OPEN state");
            }

            CircuitState::HalfOpen { .. } => {
                warn!(key = %key, "Trial call failed - reopening circuit");
                self.transition_to_open(config.timeout);
            }
        }
    }

    /// Free the trial slot; with `id`, only if that trial is still the current one
    fn abandon_trial(&mut self, id: Option<u64>) {
        let current = self.trial.map(|(trial_id, _)| trial_id);
        if id.is_some() && id != current {
            return;
        }
        if let CircuitState::HalfOpen { trial_in_flight: true } = self.state {
            self.state = CircuitState::HalfOpen {
                trial_in_flight: false,
            };
            self.trial = None;
        }
    }

    fn transition_to_closed(&mut self) {
        self.state = CircuitState::Closed;
        self.trial = None;
        self.failure_count = 0;
        self.last_transition = Instant::now();
    }

    fn transition_to_open(&mut self, timeout: Duration) {
        let now = Instant::now();
        self.state = CircuitState::Open {
            retry_at: now + timeout,
            failure_count: self.failure_count,
        };
        self.trial = None;
        self.open_count += 1;
        self.last_transition = now;
    }

    fn stats(&self) -> CircuitStats {
        CircuitStats {
            state: self.state.clone(),
            failure_count: self.failure_count,
            last_failure: self.last_failure,
            total_requests: self.total_requests,
            total_rejections: self.total_rejections,
            total_successes: self.total_successes,
            total_failures: self.total_failures,
            error_rate: if self.total_successes + self.total_failures == 0 {
                0.0
            } else {
                self.total_failures as f64 / (self.total_successes + self.total_failures) as f64
            },
            open_count: self.open_count,
            time_in_state: self.last_transition.elapsed(),
        }
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone)]
pub struct CircuitStats {
    /// Current state
    pub state: CircuitState,

    /// Consecutive failures since the last success
    pub failure_count: u32,

    pub last_failure: Option<Instant>,

    /// Calls checked against the circuit
    pub total_requests: u64,

    /// Calls rejected without running
    pub total_rejections: u64,

    pub total_successes: u64,

    pub total_failures: u64,

    /// Failures over reported outcomes
    pub error_rate: f64,

    /// Number of times the circuit has opened
    pub open_count: u64,

    /// Time since last state transition
    pub time_in_state: Duration,
}

/// Circuit breaker manager for all operation classes
#[derive(Clone)]
pub struct CircuitBreaker {
    circuits: Arc<RwLock<HashMap<String, Circuit>>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    /// Create a new circuit breaker manager
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            circuits: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Check if a call is allowed for `key`
    ///
    /// Fails with `CircuitOpen` while open, and while a half-open trial is
    /// already in flight.
    pub async fn check_circuit(&self, key: &str) -> PoolResult<()> {
        self.permit(key).await.map(CircuitPermit::forget)
    }

    /// Admit a call for `key`, returning a permit to report its outcome on
    ///
    /// Dropping the permit unreported releases a half-open trial slot.
    pub async fn permit(&self, key: &str) -> PoolResult<CircuitPermit> {
        let trial = {
            let mut circuits = self.circuits.write().await;
            circuits
                .entry(key.to_string())
                .or_insert_with(Circuit::new)
                .check(key, &self.config)?
        };
        Ok(CircuitPermit {
            breaker: self.clone(),
            key: key.to_string(),
            trial,
            settled: false,
        })
    }

    /// Record a successful call; always clears the failure count
    pub async fn record_success(&self, key: &str) {
        let mut circuits = self.circuits.write().await;
        if let Some(circuit) = circuits.get_mut(key) {
            circuit.record_success(key);
        }
    }

    /// Record a failed call
    pub async fn record_failure(&self, key: &str) {
        let mut circuits = self.circuits.write().await;
        circuits
            .entry(key.to_string())
            .or_insert_with(Circuit::new)
            .record_failure(key, &self.config);
    }

    /// Release the half-open trial slot for a call that never reached the store
    pub async fn abandon_trial(&self, key: &str) {
        let mut circuits = self.circuits.write().await;
        if let Some(circuit) = circuits.get_mut(key) {
            circuit.abandon_trial(None);
        }
    }

    fn abandon_trial_id(&self, key: &str, id: u64) -> bool {
        match self.circuits.try_write() {
            Ok(mut circuits) => {
                if let Some(circuit) = circuits.get_mut(key) {
                    circuit.abandon_trial(Some(id));
                }
                true
            }
            Err(_) => false,
        }
    }

    /// Get the current state of a circuit
    pub async fn state(&self, key: &str) -> CircuitState {
        let circuits = self.circuits.read().await;
        circuits
            .get(key)
            .map(|c| c.state.clone())
            .unwrap_or(CircuitState::Closed)
    }

    /// Get statistics for a circuit
    pub async fn stats(&self, key: &str) -> Option<CircuitStats> {
        let circuits = self.circuits.read().await;
        circuits.get(key).map(Circuit::stats)
    }

    /// Get statistics for all circuits
    pub async fn all_stats(&self) -> HashMap<String, CircuitStats> {
        let circuits = self.circuits.read().await;
        circuits
            .iter()
            .map(|(key, circuit)| (key.clone(), circuit.stats()))
            .collect()
    }

    /// Manually reset a circuit to closed state
    pub async fn reset(&self, key: &str) {
        let mut circuits = self.circuits.write().await;
        if let Some(circuit) = circuits.get_mut(key) {
            info!(key = %key, "Manually resetting circuit to CLOSED");
            circuit.transition_to_closed();
        }
    }
}

/// An admitted call on one circuit
///
/// Report the outcome with [`success`](Self::success),
/// [`failure`](Self::failure) or [`abandon`](Self::abandon).
#[must_use = "an unreported permit frees its trial slot when dropped"]
pub struct CircuitPermit {
    breaker: CircuitBreaker,
    key: String,
    trial: Option<u64>,
    settled: bool,
}

impl CircuitPermit {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether this call is the half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial.is_some()
    }

    pub async fn success(mut self) {
        self.breaker.record_success(&self.key).await;
        self.settled = true;
    }

    pub async fn failure(mut self) {
        self.breaker.record_failure(&self.key).await;
        self.settled = true;
    }

    /// The call never reached the store
    pub async fn abandon(mut self) {
        if let Some(id) = self.trial {
            let mut circuits = self.breaker.circuits.write().await;
            if let Some(circuit) = circuits.get_mut(&self.key) {
                circuit.abandon_trial(Some(id));
            }
        }
        self.settled = true;
    }

    fn forget(mut self) {
        self.settled = true;
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        let Some(id) = self.trial.filter(|_| !self.settled) else {
            return;
        };
        if self.breaker.abandon_trial_id(&self.key, id) {
            return;
        }
        // Lock is contended; release the slot from a task
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let breaker = self.breaker.clone();
            let key = std::mem::take(&mut self.key);
            handle.spawn(async move {
                let mut circuits = breaker.circuits.write().await;
                if let Some(circuit) = circuits.get_mut(&key) {
                    circuit.abandon_trial(Some(id));
                }
            });
        }
    }
}

impl std::fmt::Debug for CircuitPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitPermit")
            .field("key", &self.key)
            .field("trial", &self.trial)
            .finish()
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

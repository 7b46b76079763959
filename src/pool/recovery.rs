//! Reconnection with exponential backoff
//!
//! When a purpose loses its connection to the store it enters `Recovering`:
//! new operations are held in a bounded FIFO queue while a single
//! reconnection sequence runs. On success the queue is handed back for replay
//! in submission order. On exhaustion the purpose is `Degraded` and every
//! call fails fast until an operator resets it.

use rand::Rng;
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::error::{ExhaustionCause, PoolError, PoolResult};
use super::events::{EventBus, PoolEvent};
use crate::config::RecoverySettings;
use crate::purpose::{Purpose, PurposeMap};
use crate::store::{Command, Reply};

/// An operation held back while its purpose reconnects
#[derive(Debug)]
pub struct QueuedOperation {
    pub command: Command,
    pub responder: oneshot::Sender<PoolResult<Reply>>,
    pub enqueued_at: Instant,
}

/// Outcome of `admit`
#[derive(Debug)]
pub enum Admission {
    /// The purpose is healthy; run the command now
    Proceed(Command),
    /// The command was queued; its result arrives on the receiver
    Queued(oneshot::Receiver<PoolResult<Reply>>),
}

/// Outcome of a reconnection sequence
#[derive(Debug)]
pub enum RecoveryOutcome {
    /// Reconnected; the drained queue in submission order
    Recovered {
        attempts: u32,
        replay: Vec<QueuedOperation>,
    },
    /// Gave up; the purpose is now degraded
    Exhausted { attempts: u32 },
    /// The orchestrator was shut down mid-sequence
    Cancelled,
}

/// Public view of a purpose's recovery state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryStatus {
    Healthy,
    Recovering { queued: usize },
    Degraded { attempts: u32 },
}

#[derive(Debug, Default)]
enum PurposeState {
    #[default]
    Healthy,
    Recovering {
        queue: VecDeque<QueuedOperation>,
    },
    Degraded {
        attempts: u32,
    },
}

/// Backoff schedule for one reconnection sequence
#[derive(Debug, Clone)]
pub struct RecoveryContext {
    /// Attempt about to run, starting at 1
    pub attempt: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_attempts: u32,
    pub jitter: Duration,
}

impl RecoveryContext {
    pub fn new(settings: &RecoverySettings, max_attempts: u32) -> Self {
        Self {
            attempt: 1,
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            backoff_multiplier: settings.backoff_multiplier,
            max_attempts,
            jitter: Duration::from_millis(settings.jitter_ms),
        }
    }

    /// `min(initial * multiplier^(attempt-1), max)` without jitter
    pub fn base_delay(&self) -> Duration {
        let exponent = self.attempt.saturating_sub(1) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(scaled)
        }
    }

    /// Base delay plus `random(0, jitter)`
    pub fn delay(&self) -> Duration {
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        self.base_delay() + jitter
    }

    pub fn exhausted(&self) -> bool {
        self.attempt > self.max_attempts
    }
}

/// Tracks recovery state for every purpose
pub struct RecoveryOrchestrator {
    settings: RecoverySettings,
    states: Mutex<PurposeMap<PurposeState>>,
    events: EventBus,
    shut_down: std::sync::atomic::AtomicBool,
}

impl RecoveryOrchestrator {
    pub fn new(settings: RecoverySettings, events: EventBus) -> Self {
        Self {
            settings,
            states: Mutex::new(PurposeMap::default()),
            events,
            shut_down: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Decide whether an operation runs now, waits for recovery, or fails
    pub async fn admit(&self, purpose: Purpose, command: Command) -> PoolResult<Admission> {
        if self.is_shut_down() {
            return Err(PoolError::Shutdown);
        }

        let mut states = self.states.lock().await;
        match states.get_mut(purpose) {
            PurposeState::Healthy => Ok(Admission::Proceed(command)),

            PurposeState::Recovering { queue } => {
                if queue.len() >= self.settings.max_queue_size {
                    warn!(
                        purpose = %purpose,
                        capacity = self.settings.max_queue_size,
                        "Recovery queue full, rejecting operation"
                    );
                    return Err(PoolError::RecoveryExhausted {
                        purpose,
                        cause: ExhaustionCause::QueueFull {
                            capacity: self.settings.max_queue_size,
                        },
                    });
                }

                let (responder, receiver) = oneshot::channel();
                debug!(
                    purpose = %purpose,
                    command = command.name(),
                    position = queue.len(),
                    "Queued operation during recovery"
                );
                queue.push_back(QueuedOperation {
                    command,
                    responder,
                    enqueued_at: Instant::now(),
                });
                Ok(Admission::Queued(receiver))
            }

            PurposeState::Degraded { attempts } => Err(PoolError::RecoveryExhausted {
                purpose,
                cause: ExhaustionCause::AttemptsExhausted {
                    attempts: *attempts,
                },
            }),
        }
    }

    /// Move a healthy purpose into recovery
    ///
    /// Returns true only for the call that started the sequence.
    pub async fn begin(&self, purpose: Purpose) -> bool {
        if self.is_shut_down() {
            return false;
        }

        let mut states = self.states.lock().await;
        let state = states.get_mut(purpose);
        if !matches!(state, PurposeState::Healthy) {
            return false;
        }

        *state = PurposeState::Recovering {
            queue: VecDeque::new(),
        };
        warn!(purpose = %purpose, "Connection lost, entering recovery");
        self.events.publish(PoolEvent::RecoveryStarted { purpose });
        true
    }

    /// Drive reconnection attempts for a purpose that `begin` moved into recovery
    pub async fn run<F, Fut>(&self, purpose: Purpose, max_attempts: u32, mut reconnect: F) -> RecoveryOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PoolResult<usize>>,
    {
        let mut ctx = RecoveryContext::new(&self.settings, max_attempts);

        while !ctx.exhausted() {
            let delay = ctx.delay();
            debug!(
                purpose = %purpose,
                attempt = ctx.attempt,
                max_attempts = ctx.max_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Waiting before reconnect attempt"
            );
            tokio::time::sleep(delay).await;

            if self.is_shut_down() {
                return RecoveryOutcome::Cancelled;
            }

            match reconnect().await {
                Ok(created) => {
                    let replay = self.finish_recovered(purpose).await;
                    info!(
                        purpose = %purpose,
                        attempts = ctx.attempt,
                        created = created,
                        replaying = replay.len(),
                        "Reconnected to store"
                    );
                    self.events.publish(PoolEvent::Recovered {
                        purpose,
                        attempts: ctx.attempt,
                    });
                    return RecoveryOutcome::Recovered {
                        attempts: ctx.attempt,
                        replay,
                    };
                }
                Err(e) => {
                    warn!(
                        purpose = %purpose,
                        attempt = ctx.attempt,
                        error = %e,
                        "Reconnect attempt failed"
                    );
                }
            }

            ctx.attempt += 1;
        }

        self.finish_degraded(purpose, max_attempts).await;
        RecoveryOutcome::Exhausted {
            attempts: max_attempts,
        }
    }

    async fn finish_recovered(&self, purpose: Purpose) -> Vec<QueuedOperation> {
        let mut states = self.states.lock().await;
        match std::mem::take(states.get_mut(purpose)) {
            PurposeState::Recovering { queue } => queue.into_iter().collect(),
            _ => Vec::new(),
        }
    }

    async fn finish_degraded(&self, purpose: Purpose, attempts: u32) {
        let queue = {
            let mut states = self.states.lock().await;
            let previous = std::mem::replace(states.get_mut(purpose), PurposeState::Degraded { attempts });
            match previous {
                PurposeState::Recovering { queue } => queue,
                _ => VecDeque::new(),
            }
        };

        error!(
            purpose = %purpose,
            attempts = attempts,
            rejected = queue.len(),
            "Recovery exhausted, purpose degraded"
        );
        for op in queue {
            let _ = op.responder.send(Err(PoolError::RecoveryExhausted {
                purpose,
                cause: ExhaustionCause::AttemptsExhausted { attempts },
            }));
        }
        self.events.publish(PoolEvent::Degraded { purpose, attempts });
    }

    pub async fn status(&self, purpose: Purpose) -> RecoveryStatus {
        let states = self.states.lock().await;
        match states.get(purpose) {
            PurposeState::Healthy => RecoveryStatus::Healthy,
            PurposeState::Recovering { queue } => RecoveryStatus::Recovering { queued: queue.len() },
            PurposeState::Degraded { attempts } => RecoveryStatus::Degraded { attempts: *attempts },
        }
    }

    /// Return a degraded purpose to service. Returns whether it was degraded.
    pub async fn reset(&self, purpose: Purpose) -> bool {
        let mut states = self.states.lock().await;
        let state = states.get_mut(purpose);
        if let PurposeState::Degraded { .. } = state {
            *state = PurposeState::Healthy;
            info!(purpose = %purpose, "Recovery state reset");
            true
        } else {
            false
        }
    }

    /// Put operations whose replay hit another outage back at the head of
    /// the queue
    ///
    /// Returns true if this call moved the purpose back into recovery, in
    /// which case the caller must drive `run` again. Operations are
    /// rejected if the purpose is degraded or the orchestrator shut down.
    pub async fn resume(&self, purpose: Purpose, ops: Vec<QueuedOperation>) -> bool {
        if self.is_shut_down() {
            for op in ops {
                let _ = op.responder.send(Err(PoolError::Shutdown));
            }
            return false;
        }

        let mut states = self.states.lock().await;
        let state = states.get_mut(purpose);
        match state {
            PurposeState::Healthy => {
                warn!(purpose = %purpose, requeued = ops.len(), "Connection lost during replay, re-entering recovery");
                *state = PurposeState::Recovering { queue: ops.into() };
                self.events.publish(PoolEvent::RecoveryStarted { purpose });
                true
            }
            PurposeState::Recovering { queue } => {
                debug!(purpose = %purpose, requeued = ops.len(), "Requeued operations ahead of a running recovery");
                for op in ops.into_iter().rev() {
                    queue.push_front(op);
                }
                false
            }
            PurposeState::Degraded { attempts } => {
                let attempts = *attempts;
                for op in ops {
                    let _ = op.responder.send(Err(PoolError::RecoveryExhausted {
                        purpose,
                        cause: ExhaustionCause::AttemptsExhausted { attempts },
                    }));
                }
                false
            }
        }
    }

    /// Reject every queued operation and refuse new ones
    pub async fn shutdown(&self) {
        self.shut_down.store(true, std::sync::atomic::Ordering::Release);

        let mut states = self.states.lock().await;
        for purpose in Purpose::ALL {
            if let PurposeState::Recovering { queue } = std::mem::take(states.get_mut(purpose)) {
                for op in queue {
                    let _ = op.responder.send(Err(PoolError::Shutdown));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn settings(jitter_ms: u64) -> RecoverySettings {
        RecoverySettings {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            jitter_ms,
            max_queue_size: 2,
        }
    }

    fn queued(key: &str) -> (QueuedOperation, oneshot::Receiver<PoolResult<Reply>>) {
        let (responder, receiver) = oneshot::channel();
        let op = QueuedOperation {
            command: Command::get(key),
            responder,
            enqueued_at: Instant::now(),
        };
        (op, receiver)
    }

    #[tokio::test]
    async fn test_resume_reenters_recovery() {
        let recovery = RecoveryOrchestrator::new(settings(0), EventBus::default());
        let (op, _rx) = queued("a");

        assert!(recovery.resume(Purpose::Cache, vec![op]).await);
        assert_eq!(recovery.status(Purpose::Cache).await, RecoveryStatus::Recovering { queued: 1 });
        // Already recovering, so no second sequence
        assert!(!recovery.begin(Purpose::Cache).await);
    }

    #[tokio::test]
    async fn test_resume_puts_operations_ahead_of_queue() {
        let recovery = RecoveryOrchestrator::new(settings(0), EventBus::default());
        assert!(recovery.begin(Purpose::Cache).await);
        let _late = recovery.admit(Purpose::Cache, Command::get("c")).await.unwrap();

        let (a, _rx_a) = queued("a");
        let (b, _rx_b) = queued("b");
        assert!(!recovery.resume(Purpose::Cache, vec![a, b]).await);

        let outcome = recovery.run(Purpose::Cache, 1, || async { Ok(1) }).await;
        match outcome {
            RecoveryOutcome::Recovered { replay, .. } => {
                let keys: Vec<String> = replay.iter().map(|op| op.command.to_string()).collect();
                assert_eq!(keys, vec!["GET a", "GET b", "GET c"]);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_resume_rejects_when_degraded() {
        let recovery = RecoveryOrchestrator::new(settings(0), EventBus::default());
        assert!(recovery.begin(Purpose::Cache).await);
        recovery.finish_degraded(Purpose::Cache, 3).await;

        let (op, rx) = queued("a");
        assert!(!recovery.resume(Purpose::Cache, vec![op]).await);
        assert!(matches!(
            rx.await.unwrap(),
            Err(PoolError::RecoveryExhausted {
                cause: ExhaustionCause::AttemptsExhausted { attempts: 3 },
                ..
            })
        ));
    }

    #[test]
    fn test_backoff_schedule() {
        let mut ctx = RecoveryContext::new(&settings(0), 10);
        let delays: Vec<u64> = (0..6)
            .map(|_| {
                let d = u64::try_from(ctx.delay().as_millis()).unwrap();
                ctx.attempt += 1;
                d
            })
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
    }

    #[test]
    fn test_jitter_bounds() {
        let ctx = RecoveryContext::new(&settings(50), 3);
        for _ in 0..100 {
            let d = ctx.delay();
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(150));
        }
    }

    #[tokio::test]
    async fn test_healthy_admits_directly() {
        let recovery = RecoveryOrchestrator::new(settings(0), EventBus::default());
        let admission = recovery.admit(Purpose::Cache, Command::get("k")).await.unwrap();
        assert!(matches!(admission, Admission::Proceed(Command::Get { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_replays_in_order() {
        let events = EventBus::new(16);
        let mut rx = events.subscribe();
        let recovery = RecoveryOrchestrator::new(settings(0), events);

        assert!(recovery.begin(Purpose::Queue).await);
        assert!(!recovery.begin(Purpose::Queue).await);

        let mut receivers = Vec::new();
        for key in ["a", "b"] {
            match recovery.admit(Purpose::Queue, Command::get(key)).await.unwrap() {
                Admission::Queued(rx) => receivers.push(rx),
                Admission::Proceed(_) => panic!("should queue while recovering"),
            }
        }

        // Bounded queue
        let err = recovery.admit(Purpose::Queue, Command::get("c")).await.unwrap_err();
        assert!(matches!(
            err,
            PoolError::RecoveryExhausted {
                cause: ExhaustionCause::QueueFull { capacity: 2 },
                ..
            }
        ));
        assert_eq!(recovery.status(Purpose::Queue).await, RecoveryStatus::Recovering { queued: 2 });

        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let outcome = recovery
            .run(Purpose::Queue, 5, move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(PoolError::Shutdown)
                    } else {
                        Ok(1)
                    }
                }
            })
            .await;

        match outcome {
            RecoveryOutcome::Recovered { attempts, replay } => {
                assert_eq!(attempts, 3);
                let keys: Vec<String> = replay.iter().map(|op| op.command.to_string()).collect();
                assert_eq!(keys, vec!["GET a".to_string(), "GET b".to_string()]);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(recovery.status(Purpose::Queue).await, RecoveryStatus::Healthy);

        assert_eq!(rx.recv().await.unwrap(), PoolEvent::RecoveryStarted { purpose: Purpose::Queue });
        assert_eq!(
            rx.recv().await.unwrap(),
            PoolEvent::Recovered {
                purpose: Purpose::Queue,
                attempts: 3
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_degrades_and_fails_fast() {
        let recovery = RecoveryOrchestrator::new(settings(0), EventBus::default());
        recovery.begin(Purpose::Session).await;

        let queued = match recovery.admit(Purpose::Session, Command::get("s")).await.unwrap() {
            Admission::Queued(rx) => rx,
            Admission::Proceed(_) => panic!("should queue while recovering"),
        };

        let outcome = recovery
            .run(Purpose::Session, 3, || async { Err(PoolError::Shutdown) })
            .await;
        assert!(matches!(outcome, RecoveryOutcome::Exhausted { attempts: 3 }));

        let result = queued.await.unwrap();
        assert!(matches!(result, Err(PoolError::RecoveryExhausted { .. })));

        let err = recovery.admit(Purpose::Session, Command::get("s")).await.unwrap_err();
        assert!(matches!(
            err,
            PoolError::RecoveryExhausted {
                cause: ExhaustionCause::AttemptsExhausted { attempts: 3 },
                ..
            }
        ));
        // Degraded purposes do not start new sequences on their own
        assert!(!recovery.begin(Purpose::Session).await);

        assert!(recovery.reset(Purpose::Session).await);
        assert!(matches!(
            recovery.admit(Purpose::Session, Command::get("s")).await.unwrap(),
            Admission::Proceed(_)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_queue() {
        let recovery = RecoveryOrchestrator::new(settings(0), EventBus::default());
        recovery.begin(Purpose::Cache).await;
        let queued = match recovery.admit(Purpose::Cache, Command::get("k")).await.unwrap() {
            Admission::Queued(rx) => rx,
            Admission::Proceed(_) => panic!("should queue while recovering"),
        };

        recovery.shutdown().await;

        assert!(matches!(queued.await.unwrap(), Err(PoolError::Shutdown)));
        assert!(matches!(
            recovery.admit(Purpose::Cache, Command::get("k")).await,
            Err(PoolError::Shutdown)
        ));
    }
}

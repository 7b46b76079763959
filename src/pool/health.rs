//! Background health checking for one pool

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::purpose_pool::Pool;
use crate::purpose::Purpose;

/// Outcome of one health check cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    /// Connections pinged
    pub checked: usize,
    /// Connections that failed the ping and were swapped out
    pub replaced: usize,
    /// Replacements or top-ups that could not create a connection
    pub failed_creations: usize,
    /// Connections created to restore the floor
    pub topped_up: usize,
}

/// Periodically pings every idle connection of one pool
///
/// Failed connections are replaced in place. Connection creation failures are
/// reported on the recovery channel and retried on the next cycle.
pub struct HealthMonitor {
    pool: Arc<Pool>,
    interval: Duration,
    recovery_requests: mpsc::UnboundedSender<Purpose>,
}

impl HealthMonitor {
    pub fn new(pool: Arc<Pool>, recovery_requests: mpsc::UnboundedSender<Purpose>) -> Self {
        let interval = pool.config().health_check_interval();
        Self {
            pool,
            interval,
            recovery_requests,
        }
    }

    /// Start the health check background task
    /// Returns a task handle that runs until aborted
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                purpose = %self.pool.purpose(),
                interval_ms = u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX),
                "Health monitor started"
            );

            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; the pool was just warmed
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if self.pool.is_closed() {
                    break;
                }

                let start = Instant::now();
                let report = self.check_pool().await;
                debug!(
                    purpose = %self.pool.purpose(),
                    checked = report.checked,
                    replaced = report.replaced,
                    elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "Health check cycle completed"
                );
            }
        })
    }

    /// Run one health check cycle
    pub async fn check_pool(&self) -> HealthReport {
        let purpose = self.pool.purpose();
        let mut report = HealthReport::default();

        // Busy connections are skipped; they are in use by a caller
        for conn in self.pool.checkout_idle() {
            report.checked += 1;

            match conn.ping().await {
                Ok(()) => self.pool.release(conn),
                Err(e) => {
                    warn!(
                        purpose = %purpose,
                        connection_id = conn.id(),
                        error = %e,
                        "Health check failed, replacing connection"
                    );
                    match self.pool.replace(conn).await {
                        Ok(()) => report.replaced += 1,
                        Err(e) => {
                            error!(purpose = %purpose, error = %e, "Failed to replace connection");
                            report.failed_creations += 1;
                        }
                    }
                }
            }
        }

        if report.failed_creations == 0 && self.pool.len() < self.pool.config().min_connections {
            match self.pool.ensure_min().await {
                Ok(created) => report.topped_up = created,
                Err(e) => {
                    error!(purpose = %purpose, error = %e, "Failed to restore minimum pool size");
                    report.failed_creations += 1;
                }
            }
        }

        if report.failed_creations > 0 && self.recovery_requests.send(purpose).is_err() {
            debug!(purpose = %purpose, "Recovery channel closed");
        }

        report
    }
}

//! Aggregated pool metrics
//!
//! `PoolMetrics` is the snapshot handed to dashboards and alerting; it
//! serializes to camelCase JSON. The `MetricsCollector` samples pools on an
//! interval to derive command throughput.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::purpose_pool::{Pool, PoolSnapshot};
use crate::purpose::{Purpose, PurposeMap};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionCounts {
    pub total: usize,
    /// Checked out by a caller or background task
    pub active: usize,
    /// Healthy and available
    pub idle: usize,
    /// Marked unhealthy, awaiting replacement
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub average_latency_ms: f64,
    pub commands_per_second: f64,
    /// Failed commands over all commands, 0.0 to 1.0
    pub error_rate: f64,
    pub utilization_percentage: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingMetrics {
    pub auto_scale_events: u64,
    pub pool_expansions: u64,
    pub pool_contractions: u64,
    /// Sum of `max_connections` over the reported pools
    pub current_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolMetrics {
    pub timestamp: DateTime<Utc>,
    pub total_pools: usize,
    pub connections: ConnectionCounts,
    pub performance: PerformanceMetrics,
    pub scaling: ScalingMetrics,
}

impl PoolMetrics {
    /// Aggregate pool snapshots into one report
    pub fn aggregate(snapshots: &[PoolSnapshot], commands_per_second: f64) -> Self {
        let mut connections = ConnectionCounts::default();
        let mut scaling = ScalingMetrics::default();
        let mut total_commands = 0u64;
        let mut total_errors = 0u64;
        let mut latency_weighted_micros = 0f64;
        let mut live_commands = 0u64;

        for snapshot in snapshots {
            for conn in &snapshot.connections {
                connections.total += 1;
                if !conn.is_healthy {
                    connections.failed += 1;
                } else if conn.busy {
                    connections.active += 1;
                } else {
                    connections.idle += 1;
                }

                live_commands += conn.command_count;
                latency_weighted_micros += conn.average_latency.as_micros() as f64 * conn.command_count as f64;
                total_commands += conn.command_count;
                total_errors += conn.error_count;
            }

            total_commands += snapshot.stats.retired_commands;
            total_errors += snapshot.stats.retired_errors;
            scaling.pool_expansions += snapshot.stats.expansions;
            scaling.pool_contractions += snapshot.stats.contractions;
            scaling.current_capacity += snapshot.max_connections;
        }
        scaling.auto_scale_events = scaling.pool_expansions + scaling.pool_contractions;

        let average_latency_ms = if live_commands == 0 {
            0.0
        } else {
            latency_weighted_micros / live_commands as f64 / 1_000.0
        };
        let error_rate = if total_commands == 0 {
            0.0
        } else {
            total_errors as f64 / total_commands as f64
        };
        let utilization_percentage = if connections.total == 0 {
            0.0
        } else {
            connections.active as f64 / connections.total as f64 * 100.0
        };

        Self {
            timestamp: Utc::now(),
            total_pools: snapshots.len(),
            connections,
            performance: PerformanceMetrics {
                average_latency_ms,
                commands_per_second,
                error_rate,
                utilization_percentage,
            },
            scaling,
        }
    }
}

/// Lifetime command count of a pool, including removed connections
fn total_commands(snapshot: &PoolSnapshot) -> u64 {
    snapshot.stats.retired_commands + snapshot.connections.iter().map(|c| c.command_count).sum::<u64>()
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    commands: u64,
}

/// Samples every pool on an interval and tracks command throughput
pub struct MetricsCollector {
    pools: PurposeMap<Arc<Pool>>,
    interval: Duration,
    samples: Mutex<PurposeMap<Option<Sample>>>,
    rates: Mutex<PurposeMap<f64>>,
}

impl MetricsCollector {
    pub fn new(pools: PurposeMap<Arc<Pool>>, interval: Duration) -> Self {
        Self {
            pools,
            interval,
            samples: Mutex::new(PurposeMap::default()),
            rates: Mutex::new(PurposeMap::default()),
        }
    }

    /// Start background sampling task
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                self.sample();
            }
        })
    }

    /// Take one sample of every pool and update command rates
    pub fn sample(&self) {
        let now = Instant::now();
        let mut samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        let mut rates = self.rates.lock().unwrap_or_else(|e| e.into_inner());

        for (purpose, pool) in self.pools.iter() {
            let commands = total_commands(&pool.snapshot());
            let current = Sample { at: now, commands };

            if let Some(previous) = samples.get(purpose) {
                let elapsed = now.saturating_duration_since(previous.at).as_secs_f64();
                if elapsed > 0.0 {
                    let rate = commands.saturating_sub(previous.commands) as f64 / elapsed;
                    *rates.get_mut(purpose) = rate;
                }
            }
            *samples.get_mut(purpose) = Some(current);
        }

        debug!(
            queue = rates.queue,
            session = rates.session,
            cache = rates.cache,
            metrics = rates.metrics,
            "Sampled command rates"
        );
    }

    /// Commands per second over the last sampling window
    pub fn commands_per_second(&self, purpose: Purpose) -> f64 {
        *self.rates.lock().unwrap_or_else(|e| e.into_inner()).get(purpose)
    }

    /// Metrics across every pool
    pub fn collect(&self) -> PoolMetrics {
        let snapshots: Vec<PoolSnapshot> = self.pools.iter().map(|(_, pool)| pool.snapshot()).collect();
        let rate = Purpose::ALL.iter().map(|p| self.commands_per_second(*p)).sum();
        PoolMetrics::aggregate(&snapshots, rate)
    }

    /// Metrics for one purpose
    pub fn collect_for(&self, purpose: Purpose) -> PoolMetrics {
        let snapshot = self.pools.get(purpose).snapshot();
        PoolMetrics::aggregate(&[snapshot], self.commands_per_second(purpose))
    }
}

use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::connection::ConnectionMetrics;

/// Load balancing strategy selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Lowest utilization score
    #[default]
    LeastConnections,
    /// Lowest average command latency
    LeastLatency,
    /// Fixed cyclical order over eligible connections
    RoundRobin,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Strategy::LeastConnections => "least-connections",
            Strategy::LeastLatency => "least-latency",
            Strategy::RoundRobin => "round-robin",
        })
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "least-connections" => Ok(Strategy::LeastConnections),
            "least-latency" => Ok(Strategy::LeastLatency),
            "round-robin" => Ok(Strategy::RoundRobin),
            other => Err(format!("unknown load balancing strategy: {}", other)),
        }
    }
}

/// Picks the best connection of a pool
///
/// Only connections that are healthy, not checked out and below the overload
/// ceiling are eligible.
#[derive(Debug)]
pub struct Selector {
    strategy: Strategy,
    overload_ceiling: u64,
    /// Counter for round-robin
    counter: AtomicUsize,
}

impl Selector {
    pub fn new(strategy: Strategy, overload_ceiling: u64) -> Self {
        Self {
            strategy,
            overload_ceiling,
            counter: AtomicUsize::new(0),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Select a connection using the configured strategy
    /// Returns the index of the chosen candidate
    pub fn select(&self, candidates: &[ConnectionMetrics]) -> Option<usize> {
        let eligible = candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| self.is_eligible(c));

        match self.strategy {
            Strategy::LeastConnections => eligible
                .min_by(|(_, a), (_, b)| {
                    a.utilization_score
                        .cmp(&b.utilization_score)
                        .then_with(|| oldest_first(a, b))
                })
                .map(|(idx, _)| idx),

            Strategy::LeastLatency => eligible
                .min_by(|(_, a), (_, b)| {
                    a.average_latency
                        .cmp(&b.average_latency)
                        .then_with(|| oldest_first(a, b))
                })
                .map(|(idx, _)| idx),

            Strategy::RoundRobin => {
                let mut ordered: Vec<(usize, &ConnectionMetrics)> = eligible.collect();
                if ordered.is_empty() {
                    return None;
                }
                ordered.sort_by(|(_, a), (_, b)| oldest_first(a, b));
                let index = self.counter.fetch_add(1, Ordering::Relaxed) % ordered.len();
                Some(ordered[index].0)
            }
        }
    }

    fn is_eligible(&self, candidate: &ConnectionMetrics) -> bool {
        candidate.is_healthy && !candidate.busy && candidate.utilization_score < self.overload_ceiling
    }
}

/// Tie-break: earliest creation, then lowest id
fn oldest_first(a: &ConnectionMetrics, b: &ConnectionMetrics) -> CmpOrdering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| a.id.cmp(&b.id))
}

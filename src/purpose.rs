//! Connection purposes and the exhaustive per-purpose table
//!
//! Every pooled connection is tagged with the reason it exists. Each purpose
//! owns exactly one pool and one pool configuration, so lookups go through
//! [`PurposeMap`], which has a field per purpose and can never miss one.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Usage category selecting which pool a request targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Purpose {
    /// Work queues (LPUSH/RPOP traffic)
    Queue,
    /// User session records
    Session,
    /// Read-through cache entries
    Cache,
    /// Counters and gauges
    Metrics,
}

impl Purpose {
    /// All purposes in declaration order
    pub const ALL: [Purpose; 4] = [
        Purpose::Queue,
        Purpose::Session,
        Purpose::Cache,
        Purpose::Metrics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::Queue => "queue",
            Purpose::Session => "session",
            Purpose::Cache => "cache",
            Purpose::Metrics => "metrics",
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Purpose {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queue" => Ok(Purpose::Queue),
            "session" => Ok(Purpose::Session),
            "cache" => Ok(Purpose::Cache),
            "metrics" => Ok(Purpose::Metrics),
            other => Err(format!("unknown purpose: {}", other)),
        }
    }
}

/// A value for every [`Purpose`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PurposeMap<T> {
    pub queue: T,
    pub session: T,
    pub cache: T,
    pub metrics: T,
}

impl<T> PurposeMap<T> {
    /// Build a table by calling `f` once per purpose
    pub fn from_fn(mut f: impl FnMut(Purpose) -> T) -> Self {
        Self {
            queue: f(Purpose::Queue),
            session: f(Purpose::Session),
            cache: f(Purpose::Cache),
            metrics: f(Purpose::Metrics),
        }
    }

    pub fn get(&self, purpose: Purpose) -> &T {
        match purpose {
            Purpose::Queue => &self.queue,
            Purpose::Session => &self.session,
            Purpose::Cache => &self.cache,
            Purpose::Metrics => &self.metrics,
        }
    }

    pub fn get_mut(&mut self, purpose: Purpose) -> &mut T {
        match purpose {
            Purpose::Queue => &mut self.queue,
            Purpose::Session => &mut self.session,
            Purpose::Cache => &mut self.cache,
            Purpose::Metrics => &mut self.metrics,
        }
    }

    /// Iterate `(purpose, value)` pairs in [`Purpose::ALL`] order
    pub fn iter(&self) -> impl Iterator<Item = (Purpose, &T)> {
        Purpose::ALL.into_iter().map(move |p| (p, self.get(p)))
    }

    pub fn map<U>(&self, mut f: impl FnMut(Purpose, &T) -> U) -> PurposeMap<U> {
        PurposeMap::from_fn(|p| f(p, self.get(p)))
    }
}

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::pool::selector::Strategy;
use crate::purpose::{Purpose, PurposeMap};

/// Pool configuration for one purpose
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Floor maintained at all times
    pub min_connections: usize,

    /// Ceiling for expansion
    pub max_connections: usize,

    /// Max wait in the acquisition queue
    pub acquire_timeout_ms: u64,

    /// Idle time after which a connection above the floor is evicted
    pub idle_timeout_ms: u64,

    /// Ping cadence
    pub health_check_interval_ms: u64,

    /// Reconnect attempts before the purpose is marked degraded
    pub retry_attempts: u32,

    /// Connection selection policy
    #[serde(default)]
    pub load_balancing_strategy: Strategy,

    /// Max callers waiting for a connection
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
}

fn default_max_queue_size() -> usize {
    1024
}

impl PoolConfig {
    fn with_bounds(min_connections: usize, max_connections: usize) -> Self {
        Self {
            min_connections,
            max_connections,
            acquire_timeout_ms: 5_000,
            idle_timeout_ms: 300_000,
            health_check_interval_ms: 30_000,
            retry_attempts: 5,
            load_balancing_strategy: Strategy::LeastConnections,
            max_queue_size: default_max_queue_size(),
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Check the `0 < min <= max` invariant and non-zero timings
    pub fn validate(&self, purpose: Purpose) -> std::result::Result<(), String> {
        if self.min_connections == 0 {
            return Err(format!("{}: min_connections must be greater than 0", purpose));
        }
        if self.min_connections > self.max_connections {
            return Err(format!(
                "{}: min_connections ({}) must not exceed max_connections ({})",
                purpose, self.min_connections, self.max_connections
            ));
        }
        if self.acquire_timeout_ms == 0 {
            return Err(format!("{}: acquire_timeout_ms must be greater than 0", purpose));
        }
        if self.health_check_interval_ms == 0 {
            return Err(format!("{}: health_check_interval_ms must be greater than 0", purpose));
        }
        if self.retry_attempts == 0 {
            return Err(format!("{}: retry_attempts must be greater than 0", purpose));
        }
        Ok(())
    }
}

/// Default pool sizing per purpose
pub fn default_pools() -> PurposeMap<PoolConfig> {
    PurposeMap {
        queue: PoolConfig::with_bounds(2, 10),
        session: PoolConfig::with_bounds(2, 8),
        cache: PoolConfig::with_bounds(3, 15),
        metrics: PoolConfig::with_bounds(1, 4),
    }
}

/// Backing store connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store address (`memory://` selects the in-process store)
    #[serde(default = "default_store_url")]
    pub url: String,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

fn default_store_url() -> String {
    "memory://".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_command_timeout_ms() -> u64 {
    2_000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            connect_timeout_ms: default_connect_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

/// Connection selection tuning shared by all pools
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// Score added per recorded connection error
    #[serde(default = "default_error_weight")]
    pub error_weight: u64,

    /// Connections scoring at or above this are skipped
    #[serde(default = "default_overload_ceiling")]
    pub overload_ceiling: u64,
}

fn default_error_weight() -> u64 {
    1
}

fn default_overload_ceiling() -> u64 {
    100
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            error_weight: default_error_weight(),
            overload_ceiling: default_overload_ceiling(),
        }
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long an open circuit rejects calls
    #[serde(default = "default_circuit_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_circuit_timeout_ms() -> u64 {
    30_000
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            timeout_ms: default_circuit_timeout_ms(),
        }
    }
}

/// Reconnection backoff settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoverySettings {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Upper bound of the random delay added to each attempt
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,

    /// Operations held while a purpose reconnects
    #[serde(default = "default_recovery_queue_size")]
    pub max_queue_size: usize,
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter_ms() -> u64 {
    100
}

fn default_recovery_queue_size() -> usize {
    1000
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_ms: default_jitter_ms(),
            max_queue_size: default_recovery_queue_size(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Pool settings, one entry per purpose
    #[serde(default = "default_pools")]
    pub pools: PurposeMap<PoolConfig>,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub selector: SelectorConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,

    #[serde(default)]
    pub recovery: RecoverySettings,

    /// Idle eviction cadence
    #[serde(default = "default_maintenance_interval_ms")]
    pub maintenance_interval_ms: u64,

    /// Metrics sampling cadence
    #[serde(default = "default_metrics_interval_ms")]
    pub metrics_interval_ms: u64,

    /// Buffered connection events per subscriber
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

fn default_maintenance_interval_ms() -> u64 {
    60_000
}

fn default_metrics_interval_ms() -> u64 {
    10_000
}

fn default_event_channel_capacity() -> usize {
    256
}

impl Config {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self {
            pools: default_pools(),
            store: StoreConfig::default(),
            selector: SelectorConfig::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            recovery: RecoverySettings::default(),
            maintenance_interval_ms: default_maintenance_interval_ms(),
            metrics_interval_ms: default_metrics_interval_ms(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }

    pub fn pool(&self, purpose: Purpose) -> &PoolConfig {
        self.pools.get(purpose)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }

    /// Validate every pool and global setting
    pub fn validate(&self) -> std::result::Result<(), String> {
        for (purpose, pool) in self.pools.iter() {
            pool.validate(purpose)?;
        }
        if self.maintenance_interval_ms == 0 {
            return Err("maintenance_interval_ms must be greater than 0".to_string());
        }
        if self.metrics_interval_ms == 0 {
            return Err("metrics_interval_ms must be greater than 0".to_string());
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err("circuit_breaker.failure_threshold must be greater than 0".to_string());
        }
        if self.recovery.backoff_multiplier < 1.0 {
            return Err("recovery.backoff_multiplier must be at least 1.0".to_string());
        }
        if self.recovery.initial_delay_ms > self.recovery.max_delay_ms {
            return Err("recovery.initial_delay_ms must not exceed recovery.max_delay_ms".to_string());
        }
        if self.selector.overload_ceiling == 0 {
            return Err("selector.overload_ceiling must be greater than 0".to_string());
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config = serde_yaml::from_str(&content)
        .context("Failed to parse YAML configuration")?;

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    Ok(config)
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{} has an invalid value {:?}: {}", name, raw, e)),
        Err(_) => Ok(None),
    }
}

/// Load configuration from environment variables
///
/// Starts from defaults and applies:
/// - STOREPOOL_URL
/// - STOREPOOL_CONNECT_TIMEOUT_MS / STOREPOOL_COMMAND_TIMEOUT_MS
/// - STOREPOOL_STRATEGY (applied to every purpose)
/// - STOREPOOL_<PURPOSE>_MIN / STOREPOOL_<PURPOSE>_MAX
/// - STOREPOOL_MAINTENANCE_INTERVAL_MS / STOREPOOL_METRICS_INTERVAL_MS
/// - STOREPOOL_CIRCUIT_THRESHOLD / STOREPOOL_CIRCUIT_TIMEOUT_MS
pub fn load_from_env() -> Result<Config> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let mut config = Config::new();

    if let Ok(url) = std::env::var("STOREPOOL_URL") {
        config.store.url = url;
    }
    if let Some(ms) = env_parse("STOREPOOL_CONNECT_TIMEOUT_MS")? {
        config.store.connect_timeout_ms = ms;
    }
    if let Some(ms) = env_parse("STOREPOOL_COMMAND_TIMEOUT_MS")? {
        config.store.command_timeout_ms = ms;
    }

    if let Some(strategy) = env_parse::<Strategy>("STOREPOOL_STRATEGY")? {
        for purpose in Purpose::ALL {
            config.pools.get_mut(purpose).load_balancing_strategy = strategy;
        }
    }

    for purpose in Purpose::ALL {
        let prefix = format!("STOREPOOL_{}", purpose.as_str().to_ascii_uppercase());
        let pool = config.pools.get_mut(purpose);
        if let Some(min) = env_parse(&format!("{}_MIN", prefix))? {
            pool.min_connections = min;
        }
        if let Some(max) = env_parse(&format!("{}_MAX", prefix))? {
            pool.max_connections = max;
        }
    }

    if let Some(ms) = env_parse("STOREPOOL_MAINTENANCE_INTERVAL_MS")? {
        config.maintenance_interval_ms = ms;
    }
    if let Some(ms) = env_parse("STOREPOOL_METRICS_INTERVAL_MS")? {
        config.metrics_interval_ms = ms;
    }
    if let Some(threshold) = env_parse("STOREPOOL_CIRCUIT_THRESHOLD")? {
        config.circuit_breaker.failure_threshold = threshold;
    }
    if let Some(ms) = env_parse("STOREPOOL_CIRCUIT_TIMEOUT_MS")? {
        config.circuit_breaker.timeout_ms = ms;
    }

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    Ok(config)
}

/// Load configuration from file or environment
///
/// Reads the YAML file when a path is given, otherwise falls back to
/// environment variables on top of defaults.
pub fn load_config(config_path: Option<&str>) -> Result<Config> {
    match config_path {
        Some(path) => load_from_yaml(path),
        None => load_from_env(),
    }
}

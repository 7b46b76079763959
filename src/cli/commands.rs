use anyhow::{Context, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::Config;
use crate::pool::{PoolError, PoolManager};
use crate::purpose::Purpose;
use crate::store::Command;

/// Print the effective configuration after validation
pub fn cmd_check_config(config: &Config) -> Result<()> {
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    println!("Configuration OK");
    println!("Store: {}", config.store.url);
    println!();
    println!(
        "{:<10} {:>5} {:>5} {:>10} {:>10} {:>8}  {}",
        "PURPOSE", "MIN", "MAX", "ACQUIRE", "IDLE", "RETRIES", "STRATEGY"
    );
    for (purpose, pool) in config.pools.iter() {
        println!(
            "{:<10} {:>5} {:>5} {:>8}ms {:>8}ms {:>8}  {}",
            purpose,
            pool.min_connections,
            pool.max_connections,
            pool.acquire_timeout_ms,
            pool.idle_timeout_ms,
            pool.retry_attempts,
            pool.load_balancing_strategy
        );
    }
    println!();
    println!(
        "Circuit breaker: threshold={} timeout={}ms",
        config.circuit_breaker.failure_threshold, config.circuit_breaker.timeout_ms
    );
    println!(
        "Recovery: initial={}ms max={}ms multiplier={} jitter={}ms queue={}",
        config.recovery.initial_delay_ms,
        config.recovery.max_delay_ms,
        config.recovery.backoff_multiplier,
        config.recovery.jitter_ms,
        config.recovery.max_queue_size
    );

    Ok(())
}

/// Outcome of a simulation run
#[derive(Debug, Clone, Default)]
pub struct SimulationReport {
    pub succeeded: u64,
    pub failed: u64,
    pub circuit_rejections: u64,
    pub elapsed: Duration,
}

impl SimulationReport {
    pub fn ops_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            (self.succeeded + self.failed) as f64 / secs
        }
    }
}

/// Representative command for operation `n` of a purpose
fn workload(purpose: Purpose, worker: usize, n: u64) -> Command {
    match purpose {
        Purpose::Queue => {
            if n % 2 == 0 {
                Command::lpush("sim:jobs", format!("job-{}-{}", worker, n))
            } else {
                Command::rpop("sim:jobs")
            }
        }
        Purpose::Session => {
            let key = format!("sim:session:{}", worker);
            if n % 3 == 0 {
                Command::hset(key, "seen", n.to_string())
            } else {
                Command::hget(key, "seen")
            }
        }
        Purpose::Cache => {
            let key = format!("sim:cache:{}", n % 64);
            if n % 4 == 0 {
                Command::set_ex(key, format!("value-{}", n), Duration::from_secs(60))
            } else {
                Command::get(key)
            }
        }
        Purpose::Metrics => Command::incr(format!("sim:counter:{}", worker % 4)),
    }
}

/// Run `operations` commands on `concurrency` workers against one purpose
pub async fn cmd_simulate(
    manager: Arc<PoolManager>,
    purpose: Purpose,
    operations: u64,
    concurrency: usize,
) -> Result<SimulationReport> {
    let concurrency = concurrency.max(1);
    info!(
        purpose = %purpose,
        operations = operations,
        concurrency = concurrency,
        "Starting simulation"
    );

    let next_op = Arc::new(AtomicU64::new(0));
    let succeeded = Arc::new(AtomicU64::new(0));
    let failed = Arc::new(AtomicU64::new(0));
    let rejected = Arc::new(AtomicU64::new(0));
    let start = Instant::now();

    let mut workers = Vec::with_capacity(concurrency);
    for worker in 0..concurrency {
        let manager = Arc::clone(&manager);
        let next_op = Arc::clone(&next_op);
        let succeeded = Arc::clone(&succeeded);
        let failed = Arc::clone(&failed);
        let rejected = Arc::clone(&rejected);

        workers.push(tokio::spawn(async move {
            loop {
                let n = next_op.fetch_add(1, Ordering::Relaxed);
                if n >= operations {
                    break;
                }
                match manager.execute_command(purpose, workload(purpose, worker, n)).await {
                    Ok(_) => {
                        succeeded.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(PoolError::CircuitOpen { .. }) => {
                        rejected.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        debug!(worker = worker, error = %e, "Simulated operation failed");
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }));
    }

    for worker in workers {
        worker.await.context("Simulation worker panicked")?;
    }

    let report = SimulationReport {
        succeeded: succeeded.load(Ordering::Relaxed),
        failed: failed.load(Ordering::Relaxed),
        circuit_rejections: rejected.load(Ordering::Relaxed),
        elapsed: start.elapsed(),
    };

    println!("Simulation finished for {}", purpose);
    println!("  Succeeded:          {}", report.succeeded);
    println!("  Failed:             {}", report.failed);
    println!("  Circuit rejections: {}", report.circuit_rejections);
    println!(
        "  Elapsed:            {:.2}s ({:.0} ops/s)",
        report.elapsed.as_secs_f64(),
        report.ops_per_second()
    );

    Ok(report)
}

/// Print a metrics snapshot, for every pool or one purpose
pub fn cmd_metrics(manager: &PoolManager, purpose: Option<Purpose>) -> Result<()> {
    let metrics = match purpose {
        Some(purpose) => manager.pool_metrics_for(purpose),
        None => manager.pool_metrics(),
    };
    let json = serde_json::to_string_pretty(&metrics).context("Failed to serialize metrics")?;
    println!("{}", json);
    Ok(())
}

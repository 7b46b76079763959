use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::purpose_pool::Pool;

/// Background idle eviction for every pool
pub struct PoolMaintainer {
    pools: Vec<Arc<Pool>>,
    interval: Duration,
}

impl PoolMaintainer {
    pub fn new(pools: Vec<Arc<Pool>>, interval: Duration) -> Self {
        Self { pools, interval }
    }

    /// Start background maintenance task
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_ms = u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX),
                pools = self.pools.len(),
                "Pool maintainer started"
            );

            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let evicted = self.run_once().await;
                debug!(evicted = evicted, "Maintenance cycle completed");
            }
        })
    }

    /// Evict idle connections above each pool's floor
    ///
    /// Returns the total number of evicted connections.
    pub async fn run_once(&self) -> usize {
        let mut evicted = 0;
        for pool in &self.pools {
            if pool.is_closed() {
                continue;
            }
            evicted += pool.evict_idle().await;
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::pool::connection::ConnectionOptions;
    use crate::pool::events::EventBus;
    use crate::pool::selector::Strategy;
    use crate::purpose::Purpose;
    use crate::store::{MemoryConnector, MemoryStore};

    fn create_pool(store: &Arc<MemoryStore>, purpose: Purpose, min: usize, max: usize) -> Arc<Pool> {
        let config = PoolConfig {
            min_connections: min,
            max_connections: max,
            acquire_timeout_ms: 100,
            idle_timeout_ms: 500,
            health_check_interval_ms: 1_000,
            retry_attempts: 3,
            load_balancing_strategy: Strategy::RoundRobin,
            max_queue_size: 8,
        };
        Arc::new(Pool::new(
            purpose,
            config,
            ConnectionOptions::default(),
            100,
            Arc::new(MemoryConnector::new(Arc::clone(store))),
            EventBus::default(),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_once_shrinks_every_pool_to_floor() {
        let store = MemoryStore::new();
        let cache = create_pool(&store, Purpose::Cache, 1, 4);
        let queue = create_pool(&store, Purpose::Queue, 2, 3);

        for pool in [&cache, &queue] {
            let mut leases = Vec::new();
            for _ in 0..pool.config().max_connections {
                leases.push(pool.acquire().await.unwrap());
            }
        }
        assert_eq!(cache.len(), 4);
        assert_eq!(queue.len(), 3);

        let maintainer = PoolMaintainer::new(vec![Arc::clone(&cache), Arc::clone(&queue)], Duration::from_secs(1));

        // Nothing is idle yet
        assert_eq!(maintainer.run_once().await, 0);

        tokio::time::advance(Duration::from_millis(600)).await;
        assert_eq!(maintainer.run_once().await, 4);
        assert_eq!(cache.len(), 1);
        assert_eq!(queue.len(), 2);

        tokio::time::advance(Duration::from_millis(600)).await;
        assert_eq!(maintainer.run_once().await, 0);
        assert_eq!(cache.stats().contractions, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_task_evicts() {
        let store = MemoryStore::new();
        let pool = create_pool(&store, Purpose::Metrics, 1, 3);
        {
            let _a = pool.acquire().await.unwrap();
            let _b = pool.acquire().await.unwrap();
            let _c = pool.acquire().await.unwrap();
        }

        let handle = Arc::new(PoolMaintainer::new(vec![Arc::clone(&pool)], Duration::from_secs(1))).start();
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        assert_eq!(pool.len(), 1);
        handle.abort();
    }
}

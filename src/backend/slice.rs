use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::SliceConfig;

use super::conn::{BackendAddr, PooledConn};
use super::pool::{ConnPool, PoolStats};
use super::{ConnectionError, Role};

/// One shard unit: a master pool plus optional slave and statistic-slave
/// pools, with round-robin selection inside each replica group.
pub struct Slice {
    name: String,
    master: Arc<ConnPool>,
    slaves: Vec<Arc<ConnPool>>,
    statistic_slaves: Vec<Arc<ConnPool>>,
    slave_counter: AtomicUsize,
    statistic_counter: AtomicUsize,
}

impl Slice {
    pub fn from_config(config: &SliceConfig) -> Self {
        let idle_timeout = Duration::from_secs(config.idle_timeout_s);
        let make_pool = |addr: &str| {
            ConnPool::new(
                BackendAddr {
                    addr: addr.to_string(),
                    user: config.user_name.clone(),
                    password: config.password.clone(),
                    database: None,
                },
                config.capacity,
                idle_timeout,
            )
        };

        Self {
            name: config.name.clone(),
            master: make_pool(&config.master),
            slaves: config.slaves.iter().map(|a| make_pool(a)).collect(),
            statistic_slaves: config
                .statistic_slaves
                .iter()
                .map(|a| make_pool(a))
                .collect(),
            slave_counter: AtomicUsize::new(0),
            statistic_counter: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn select(&self, pools: &[Arc<ConnPool>], counter: &AtomicUsize) -> Option<Arc<ConnPool>> {
        if pools.is_empty() {
            return None;
        }
        let idx = counter.fetch_add(1, Ordering::Relaxed) % pools.len();
        Some(pools[idx].clone())
    }

    /// Acquire a connection for the given role; replica roles fall back to
    /// the master when no replica pool exists.
    pub async fn acquire(&self, role: Role) -> Result<PooledConn, ConnectionError> {
        let pool = match role {
            Role::Master => self.master.clone(),
            Role::Slave => self
                .select(&self.slaves, &self.slave_counter)
                .unwrap_or_else(|| self.master.clone()),
            Role::StatisticSlave => self
                .select(&self.statistic_slaves, &self.statistic_counter)
                .or_else(|| self.select(&self.slaves, &self.slave_counter))
                .unwrap_or_else(|| self.master.clone()),
        };
        pool.acquire().await
    }

    pub fn master(&self) -> &Arc<ConnPool> {
        &self.master
    }

    pub fn slaves(&self) -> &[Arc<ConnPool>] {
        &self.slaves
    }

    pub fn statistic_slaves(&self) -> &[Arc<ConnPool>] {
        &self.statistic_slaves
    }

    pub async fn stats(&self, role: Role) -> Vec<(String, PoolStats, bool)> {
        let pools: Vec<&Arc<ConnPool>> = match role {
            Role::Master => vec![&self.master],
            Role::Slave => self.slaves.iter().collect(),
            Role::StatisticSlave => self.statistic_slaves.iter().collect(),
        };
        let mut out = Vec::with_capacity(pools.len());
        for pool in pools {
            out.push((pool.addr().to_string(), pool.stats().await, pool.is_up()));
        }
        out
    }

    /// Total connections currently checked out across every pool
    pub fn in_use(&self) -> i64 {
        self.master.in_use()
            + self.slaves.iter().map(|p| p.in_use()).sum::<i64>()
            + self.statistic_slaves.iter().map(|p| p.in_use()).sum::<i64>()
    }

    /// Drop all idle connections. With `delay`, wait for checked-out
    /// connections to drain (bounded) so in-flight sessions finish naturally.
    pub async fn close(&self, delay: bool) {
        if delay {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
            while self.in_use() > 0 {
                if tokio::time::Instant::now() >= deadline {
                    warn!(slice = %self.name, in_use = self.in_use(), "close deadline reached with connections still in use");
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
        self.master.close_all().await;
        for pool in &self.slaves {
            pool.close_all().await;
        }
        for pool in &self.statistic_slaves {
            pool.close_all().await;
        }
        debug!(slice = %self.name, "slice pools closed");
    }
}

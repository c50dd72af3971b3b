//! Backend latency percentile aggregation.
//!
//! Samples flow through a bounded channel per namespace; a full channel
//! turns sampling off until the next aggregation tick drains it, so a
//! slow aggregator can never queue unbounded memory behind the hot path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

/// Capacity of each namespace's sample channel
pub const SQL_EXEC_TIME_SIZE: usize = 5000;

/// Send deadline before sampling is switched off
const SEND_TIMEOUT: Duration = Duration::from_millis(1);

/// One latency sample from a backend round trip
#[derive(Debug, Clone)]
pub struct ExecTimeRecord {
    pub slice: String,
    pub backend_addr: String,
    pub exec_time_us: i64,
}

/// Computed percentiles per backend address, micros
#[derive(Debug, Clone, Default)]
pub struct PercentileSnapshot {
    pub p99_max: HashMap<String, i64>,
    pub p99_avg: HashMap<String, i64>,
    pub p95_max: HashMap<String, i64>,
    pub p95_avg: HashMap<String, i64>,
}

struct SqlResponse {
    sender: mpsc::Sender<ExecTimeRecord>,
    receiver: Mutex<mpsc::Receiver<ExecTimeRecord>>,
    /// Sampling gate; cleared on overflow, re-armed by each aggregation
    sampling: AtomicBool,
    snapshot: Mutex<PercentileSnapshot>,
}

impl SqlResponse {
    fn new() -> Self {
        let (sender, receiver) = mpsc::channel(SQL_EXEC_TIME_SIZE);
        Self {
            sender,
            receiver: Mutex::new(receiver),
            sampling: AtomicBool::new(true),
            snapshot: Mutex::new(PercentileSnapshot::default()),
        }
    }
}

/// Registry of per-namespace percentile aggregators
pub struct SqlResponseRegistry {
    responses: DashMap<String, Arc<SqlResponse>>,
}

impl SqlResponseRegistry {
    pub fn new() -> Self {
        Self {
            responses: DashMap::new(),
        }
    }

    /// Ensure a namespace has an aggregator (idempotent)
    pub fn ensure(&self, namespace: &str) {
        self.responses
            .entry(namespace.to_string())
            .or_insert_with(|| Arc::new(SqlResponse::new()));
    }

    /// Record one backend latency sample
    pub async fn record(&self, namespace: &str, record: ExecTimeRecord) {
        let response = match self.responses.get(namespace) {
            Some(r) => r.clone(),
            None => return,
        };
        if !response.sampling.load(Ordering::Relaxed) {
            return;
        }

        match tokio::time::timeout(SEND_TIMEOUT, response.sender.send(record)).await {
            Ok(Ok(())) => {}
            _ => {
                response.sampling.store(false, Ordering::Relaxed);
                debug!(namespace, "latency sampling suspended until next tick");
            }
        }
    }

    /// Drain every namespace's channel, compute percentiles, re-arm sampling
    pub fn aggregate(&self) {
        for entry in self.responses.iter() {
            let response = entry.value().clone();
            let mut samples: Vec<ExecTimeRecord> = Vec::new();
            {
                let mut receiver = response.receiver.lock();
                while samples.len() < SQL_EXEC_TIME_SIZE {
                    match receiver.try_recv() {
                        Ok(record) => samples.push(record),
                        Err(_) => break,
                    }
                }
            }

            let mut snapshot = PercentileSnapshot::default();
            let mut by_addr: HashMap<String, Vec<i64>> = HashMap::new();
            for sample in samples {
                by_addr
                    .entry(sample.backend_addr)
                    .or_default()
                    .push(sample.exec_time_us);
            }

            for (addr, mut times) in by_addr {
                times.sort_unstable();
                let n = times.len();
                let p99_idx = (n - 1) * 99 / 100;
                let p95_idx = (n - 1) * 95 / 100;
                snapshot.p99_max.insert(addr.clone(), times[p99_idx]);
                snapshot.p95_max.insert(addr.clone(), times[p95_idx]);

                let p99_count = (n * 99 / 100).max(1);
                let p95_count = (n * 95 / 100).max(1);
                let p99_sum: i64 = times[..p99_count].iter().sum();
                let p95_sum: i64 = times[..p95_count].iter().sum();
                snapshot.p99_avg.insert(addr.clone(), p99_sum / p99_count as i64);
                snapshot.p95_avg.insert(addr, p95_sum / p95_count as i64);
            }

            *response.snapshot.lock() = snapshot;
            response.sampling.store(true, Ordering::Relaxed);
        }
    }

    /// Latest computed percentiles for one namespace
    pub fn snapshot(&self, namespace: &str) -> Option<PercentileSnapshot> {
        self.responses
            .get(namespace)
            .map(|r| r.snapshot.lock().clone())
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.responses.iter().map(|e| e.key().clone()).collect()
    }

    pub fn remove(&self, namespace: &str) {
        self.responses.remove(namespace);
    }
}

impl Default for SqlResponseRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(addr: &str, us: i64) -> ExecTimeRecord {
        ExecTimeRecord {
            slice: "slice-0".to_string(),
            backend_addr: addr.to_string(),
            exec_time_us: us,
        }
    }

    #[tokio::test]
    async fn aggregates_percentiles_per_addr() {
        let registry = SqlResponseRegistry::new();
        registry.ensure("ns1");

        for us in 1..=100 {
            registry.record("ns1", record("db1:3306", us)).await;
        }
        registry.aggregate();

        let snapshot = registry.snapshot("ns1").unwrap();
        assert_eq!(snapshot.p99_max["db1:3306"], 99);
        assert_eq!(snapshot.p95_max["db1:3306"], 95);
        assert!(snapshot.p99_avg["db1:3306"] <= snapshot.p99_max["db1:3306"]);
    }

    #[tokio::test]
    async fn overflow_suspends_sampling_until_tick() {
        let registry = SqlResponseRegistry::new();
        registry.ensure("ns1");

        for us in 0..(SQL_EXEC_TIME_SIZE as i64 + 10) {
            registry.record("ns1", record("db1:3306", us)).await;
        }
        let response = registry.responses.get("ns1").unwrap().clone();
        assert!(!response.sampling.load(Ordering::Relaxed));

        registry.aggregate();
        assert!(response.sampling.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn unknown_namespace_is_ignored() {
        let registry = SqlResponseRegistry::new();
        registry.record("missing", record("db1:3306", 5)).await;
        assert!(registry.snapshot("missing").is_none());
    }
}

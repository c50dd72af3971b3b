use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tracing::debug;

use super::conn::{BackendAddr, PooledConn};
use super::ConnectionError;

/// Gauges exported for one pool instance
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub capacity: i64,
    pub in_use: i64,
    pub idle: i64,
    pub wait: i64,
    pub active: i64,
}

/// Bounded connection pool for a single backend instance.
///
/// Capacity is enforced with a semaphore; the permit travels inside the
/// checked-out connection so a drop anywhere releases the slot.
pub struct ConnPool {
    backend: BackendAddr,
    capacity: usize,
    idle_timeout: Duration,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<PooledConn>>,
    in_use: AtomicI64,
    wait: AtomicI64,
    active: AtomicI64,
    /// Instance up/down status, flipped by connect failures and health checks
    up: AtomicBool,
}

impl ConnPool {
    pub fn new(backend: BackendAddr, capacity: usize, idle_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            backend,
            capacity,
            idle_timeout,
            semaphore: Arc::new(Semaphore::new(capacity)),
            idle: Mutex::new(VecDeque::new()),
            in_use: AtomicI64::new(0),
            wait: AtomicI64::new(0),
            active: AtomicI64::new(0),
            up: AtomicBool::new(true),
        })
    }

    pub fn addr(&self) -> &str {
        &self.backend.addr
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Relaxed)
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::Relaxed);
    }

    /// Check out a connection, dialing a new one when no idle conn is fresh
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConn, ConnectionError> {
        self.wait.fetch_add(1, Ordering::Relaxed);
        let permit = self.semaphore.clone().acquire_owned().await;
        self.wait.fetch_sub(1, Ordering::Relaxed);
        let permit = permit.map_err(|_| ConnectionError::Disconnected)?;

        {
            let mut idle = self.idle.lock().await;
            while let Some(mut conn) = idle.pop_front() {
                if conn.idle_for() > self.idle_timeout {
                    debug!(addr = %self.backend.addr, "idle connection expired, discarding");
                    self.active.fetch_sub(1, Ordering::Relaxed);
                    continue;
                }
                conn.touch();
                conn.home = Some(self.clone());
                conn.permit = Some(permit);
                self.in_use.fetch_add(1, Ordering::Relaxed);
                return Ok(conn);
            }
        }

        let mut conn = match PooledConn::connect(&self.backend).await {
            Ok(conn) => conn,
            Err(e) => {
                self.up.store(false, Ordering::Relaxed);
                return Err(e);
            }
        };
        self.up.store(true, Ordering::Relaxed);
        conn.home = Some(self.clone());
        conn.permit = Some(permit);
        self.in_use.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
        Ok(conn)
    }

    /// Return a connection; closed connections are dropped
    pub(super) async fn put(self: &Arc<Self>, mut conn: PooledConn) {
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        conn.permit = None;

        if conn.is_closed() {
            self.active.fetch_sub(1, Ordering::Relaxed);
            return;
        }

        let mut idle = self.idle.lock().await;
        if idle.len() >= self.capacity {
            self.active.fetch_sub(1, Ordering::Relaxed);
            return;
        }
        idle.push_back(conn);
    }

    /// Settle counters for a checked-out conn that was dropped instead of
    /// recycled
    pub(super) fn note_dropped(&self) {
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    pub async fn close_all(&self) {
        let mut idle = self.idle.lock().await;
        let drained = idle.len() as i64;
        idle.clear();
        self.active.fetch_sub(drained, Ordering::Relaxed);
    }

    pub fn in_use(&self) -> i64 {
        self.in_use.load(Ordering::Relaxed)
    }

    pub async fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity as i64,
            in_use: self.in_use.load(Ordering::Relaxed),
            idle: self.idle.lock().await.len() as i64,
            wait: self.wait.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
        }
    }
}

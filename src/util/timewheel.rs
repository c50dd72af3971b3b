use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

/// Idle-session timeout registry.
///
/// A session re-registers itself after every successful read; if the timer
/// fires before the next registration or removal, the stored callback runs
/// (closing the session and unblocking its pending read). Re-registering
/// under the same key supersedes the previous timer via a generation bump.
pub struct TimeoutWheel {
    entries: Arc<DashMap<u64, u64>>,
    generation: AtomicU64,
}

impl TimeoutWheel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Arc::new(DashMap::new()),
            generation: AtomicU64::new(1),
        })
    }

    /// Arm (or re-arm) the timer for `key`
    pub fn add<F>(&self, duration: Duration, key: u64, on_fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(key, generation);

        let entries = self.entries.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            // only fire if this registration is still the live one
            let fired = entries
                .remove_if(&key, |_, current| *current == generation)
                .is_some();
            if fired {
                debug!(key, "session timeout fired");
                on_fire();
            }
        });
    }

    /// Disarm the timer for `key`
    pub fn remove(&self, key: u64) {
        self.entries.remove(&key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test(start_paused = true)]
    async fn fires_after_duration() {
        let wheel = TimeoutWheel::new();
        let fired = Arc::new(AtomicBool::new(false));

        let flag = fired.clone();
        wheel.add(Duration::from_secs(5), 1, move || {
            flag.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;
        assert!(fired.load(Ordering::SeqCst));
        assert!(wheel.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn remove_disarms() {
        let wheel = TimeoutWheel::new();
        let fired = Arc::new(AtomicBool::new(false));

        let flag = fired.clone();
        wheel.add(Duration::from_secs(5), 1, move || {
            flag.store(true, Ordering::SeqCst);
        });
        wheel.remove(1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_supersedes_previous_timer() {
        let wheel = TimeoutWheel::new();
        let fired = Arc::new(AtomicBool::new(false));

        let flag = fired.clone();
        wheel.add(Duration::from_secs(5), 1, move || {
            flag.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(3)).await;
        let flag = fired.clone();
        wheel.add(Duration::from_secs(5), 1, move || {
            flag.store(true, Ordering::SeqCst);
        });

        // first timer's deadline passes without firing
        tokio::time::sleep(Duration::from_secs(3)).await;
        tokio::task::yield_now().await;
        assert!(!fired.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_secs(3)).await;
        tokio::task::yield_now().await;
        assert!(fired.load(Ordering::SeqCst));
    }
}

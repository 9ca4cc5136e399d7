//! Fine-grained per-key async locks with idle reclamation.
//!
//! Channel load/unload must be exclusive per channel key without holding
//! one big lock across every channel. Entries are created on first use
//! and a background loop reclaims the ones nobody has touched for a
//! while.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::debug;

const DEFAULT_CLEAN_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(300);

struct Entry {
    lock: Arc<AsyncMutex<()>>,
    last_used: Instant,
}

struct Inner {
    entries: Mutex<HashMap<String, Entry>>,
    gc_handle: Mutex<Option<JoinHandle<()>>>,
    clean_interval: Duration,
    idle_ttl: Duration,
}

#[derive(Clone)]
pub struct KeyLock {
    inner: Arc<Inner>,
}

impl KeyLock {
    pub fn new() -> Self {
        Self::with_policy(DEFAULT_CLEAN_INTERVAL, DEFAULT_IDLE_TTL)
    }

    pub fn with_policy(clean_interval: Duration, idle_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                gc_handle: Mutex::new(None),
                clean_interval,
                idle_ttl,
            }),
        }
    }

    /// Acquire the lock for `key`, creating the entry on first use.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut entries = self.inner.entries.lock();
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                lock: Arc::new(AsyncMutex::new(())),
                last_used: Instant::now(),
            });
            entry.last_used = Instant::now();
            Arc::clone(&entry.lock)
        };
        lock.lock_owned().await
    }

    /// Start the background reclamation loop.
    pub fn start_clean_loop(&self) {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.clean_interval);
            loop {
                ticker.tick().await;
                let mut entries = inner.entries.lock();
                let before = entries.len();
                entries.retain(|_, entry| {
                    // Entries still referenced by a waiter are never
                    // reclaimed regardless of age.
                    Arc::strong_count(&entry.lock) > 1
                        || entry.last_used.elapsed() < inner.idle_ttl
                });
                let removed = before - entries.len();
                if removed > 0 {
                    debug!(removed, "reclaimed idle key locks");
                }
            }
        });
        *self.inner.gc_handle.lock() = Some(handle);
    }

    /// Stop the reclamation loop.
    pub fn stop_clean_loop(&self) {
        if let Some(handle) = self.inner.gc_handle.lock().take() {
            handle.abort();
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }
}

impl Default for KeyLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = KeyLock::new();
        let guard = locks.lock("room-1#1").await;

        let locks2 = locks.clone();
        let second = tokio::spawn(async move {
            let _guard = locks2.lock("room-1#1").await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), second)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn different_keys_do_not_contend() {
        let locks = KeyLock::new();
        let _a = locks.lock("a").await;
        let _b = locks.lock("b").await;
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn idle_entries_are_reclaimed() {
        let locks = KeyLock::with_policy(Duration::from_millis(20), Duration::from_millis(10));
        drop(locks.lock("gone").await);
        let held = locks.lock("held").await;

        locks.start_clean_loop();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(locks.len(), 1);
        drop(held);
        locks.stop_clean_loop();
    }
}

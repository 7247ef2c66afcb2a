//! Rate-limit state, keyed by a configurable identifier with per-key
//! windows. The storage backend is a pluggable collaborator; the default
//! keeps fixed windows in process memory with periodic eviction.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Entries untouched for this long are evicted on the next sweep.
const STALE_AFTER: Duration = Duration::from_secs(300);

/// How often the runtime sweeps stale keys out of the stores.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Storage backend for per-key request counting.
pub trait RateLimitStore: Send + Sync {
    /// Count one request against `key`'s current window and return the new
    /// count within that window.
    fn increment(&self, key: &str, window: Duration, now: Instant) -> u64;

    /// Drop state that can no longer affect a decision. Invoked
    /// periodically by the runtime; backends without local state ignore it.
    fn sweep(&self, _now: Instant) {}
}

#[derive(Debug)]
struct Window {
    started: Instant,
    count: u64,
    last_access: Instant,
}

/// Fixed-window in-memory store.
#[derive(Default)]
pub struct MemoryRateLimitStore {
    windows: DashMap<String, Window>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

impl RateLimitStore for MemoryRateLimitStore {
    fn increment(&self, key: &str, window: Duration, now: Instant) -> u64 {
        // Fast path without allocation when the key exists.
        if let Some(mut entry) = self.windows.get_mut(key) {
            if now.duration_since(entry.started) >= window {
                entry.started = now;
                entry.count = 0;
            }
            entry.count += 1;
            entry.last_access = now;
            return entry.count;
        }
        self.windows
            .entry(key.to_string())
            .and_modify(|w| {
                w.count += 1;
                w.last_access = now;
            })
            .or_insert(Window {
                started: now,
                count: 1,
                last_access: now,
            })
            .count
    }

    /// Drop windows that have not been touched recently.
    fn sweep(&self, now: Instant) {
        self.windows
            .retain(|_, w| now.duration_since(w.last_access) < STALE_AFTER);
    }
}

/// Periodic stale-key eviction across every rate-limit store in the
/// engine, owned and cancelled by the runtime like the other timers.
pub fn spawn_store_sweep(
    stores: Vec<Arc<dyn RateLimitStore>>,
    tracker: &TaskTracker,
    cancel: CancellationToken,
) {
    if stores.is_empty() {
        return;
    }
    tracker.spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(SWEEP_INTERVAL) => {
                    let now = Instant::now();
                    for store in &stores {
                        store.sweep(now);
                    }
                }
                _ = cancel.cancelled() => return,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_within_window() {
        let store = MemoryRateLimitStore::new();
        let now = Instant::now();
        let window = Duration::from_secs(10);
        assert_eq!(store.increment("k", window, now), 1);
        assert_eq!(store.increment("k", window, now), 2);
        assert_eq!(store.increment("other", window, now), 1);
    }

    #[test]
    fn test_window_resets() {
        let store = MemoryRateLimitStore::new();
        let start = Instant::now();
        let window = Duration::from_secs(10);
        store.increment("k", window, start);
        store.increment("k", window, start);
        let later = start + Duration::from_secs(11);
        assert_eq!(store.increment("k", window, later), 1);
    }

    #[test]
    fn test_sweep_drops_stale_keys() {
        let store = MemoryRateLimitStore::new();
        let start = Instant::now();
        store.increment("k", Duration::from_secs(1), start);
        store.sweep(start + Duration::from_secs(301));
        assert!(store.is_empty());
    }
}

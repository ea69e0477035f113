use std::cmp::{max, min};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use tokio::time::Instant;

use super::{CacheKey, PlatformCache};

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: bool,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: bool, ttl: Duration, now: Instant) -> Self {
        let expires_at = (!ttl.is_zero()).then(|| now + ttl);
        Self { value, expires_at }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Adaptive replacement state
///
/// `recent` and `frequent` hold live entries (T1 and T2), the ghost lists
/// hold keys recently evicted from each (B1 and B2). `target` is the
/// adaptive size goal for `recent`.
struct State {
    capacity: usize,
    target: usize,
    recent: LruCache<CacheKey, Entry>,
    frequent: LruCache<CacheKey, Entry>,
    recent_ghosts: LruCache<CacheKey, ()>,
    frequent_ghosts: LruCache<CacheKey, ()>,
}

impl State {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            target: 0,
            recent: LruCache::unbounded(),
            frequent: LruCache::unbounded(),
            recent_ghosts: LruCache::unbounded(),
            frequent_ghosts: LruCache::unbounded(),
        }
    }

    fn len(&self) -> usize {
        self.recent.len() + self.frequent.len()
    }

    fn get(&mut self, key: &CacheKey, now: Instant) -> Option<bool> {
        if let Some(entry) = self.recent.pop(key) {
            if entry.is_expired(now) {
                return None;
            }
            self.frequent.put(key.clone(), entry);
            return Some(entry.value);
        }

        let entry = *self.frequent.get(key)?;
        if entry.is_expired(now) {
            self.frequent.pop(key);
            return None;
        }
        Some(entry.value)
    }

    fn set(&mut self, key: CacheKey, entry: Entry) {
        if self.recent.contains(&key) {
            self.recent.put(key, entry);
            return;
        }
        if self.frequent.contains(&key) {
            self.frequent.put(key, entry);
            return;
        }

        if self.recent_ghosts.contains(&key) {
            let delta = max(self.frequent_ghosts.len() / self.recent_ghosts.len(), 1);
            self.target = min(self.capacity, self.target + delta);
            self.replace(false);
            self.recent_ghosts.pop(&key);
            self.frequent.put(key, entry);
            return;
        }

        if self.frequent_ghosts.contains(&key) {
            let delta = max(self.recent_ghosts.len() / self.frequent_ghosts.len(), 1);
            self.target = self.target.saturating_sub(delta);
            self.replace(true);
            self.frequent_ghosts.pop(&key);
            self.frequent.put(key, entry);
            return;
        }

        let recent_total = self.recent.len() + self.recent_ghosts.len();
        let total = recent_total + self.frequent.len() + self.frequent_ghosts.len();
        if recent_total >= self.capacity {
            if self.recent.len() < self.capacity {
                self.recent_ghosts.pop_lru();
                self.replace(false);
            } else {
                self.recent.pop_lru();
            }
        } else if total >= self.capacity {
            if total >= 2 * self.capacity {
                self.frequent_ghosts.pop_lru();
            }
            self.replace(false);
        }

        self.recent.put(key, entry);
    }

    /// Evicts one live entry into its ghost list when the cache is full
    fn replace(&mut self, hit_frequent_ghost: bool) {
        if self.len() < self.capacity {
            return;
        }

        let recent = self.recent.len();
        let from_recent = recent > 0
            && (recent > self.target || (hit_frequent_ghost && recent == self.target));

        if from_recent || self.frequent.is_empty() {
            if let Some((key, _)) = self.recent.pop_lru() {
                self.recent_ghosts.put(key, ());
            }
        } else if let Some((key, _)) = self.frequent.pop_lru() {
            self.frequent_ghosts.put(key, ());
        }
    }
}

/// Process-local cache with adaptive replacement eviction
///
/// Holds at most `capacity` live entries. Keys read more than once are
/// protected from being flushed by a scan of one-shot lookups.
pub struct AdaptiveCache {
    state: Mutex<State>,
}

impl AdaptiveCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State::new(max(capacity, 1))),
        }
    }

    /// Number of live entries, including expired ones not yet reclaimed
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // State is always consistent between calls, a panic elsewhere cannot
        // leave it half-updated.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl PlatformCache for AdaptiveCache {
    async fn get(&self, key: &CacheKey) -> Option<bool> {
        self.lock().get(key, Instant::now())
    }

    async fn set(&self, key: &CacheKey, value: bool, ttl: Duration) {
        let entry = Entry::new(value, ttl, Instant::now());
        self.lock().set(key.clone(), entry);
    }
}

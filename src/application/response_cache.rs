use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_MAX_SIZE: usize = 1000;
const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);

/// Content-keyed memoization of engine responses. Identical prompts within
/// the TTL window reuse the stored response instead of spending a rate-limit
/// token. Capacity-bounded with LRU eviction by last access time.
pub struct ResponseCache {
    state: Mutex<CacheState>,
    max_size: usize,
    ttl: Duration,
}

struct CacheState {
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

struct CacheEntry {
    response: String,
    created_at: Instant,
    accessed_at: Instant,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate_percent: f64,
}

impl ResponseCache {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            max_size: if max_size == 0 { DEFAULT_MAX_SIZE } else { max_size },
            ttl: if ttl.is_zero() { DEFAULT_TTL } else { ttl },
        }
    }

    fn hash_key(prompt: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(prompt.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Returns the cached response for an identical prompt. Expired entries
    /// count as misses and are removed on access.
    pub fn get(&self, prompt: &str) -> Option<String> {
        let key = Self::hash_key(prompt);
        let mut state = self.state.lock().expect("cache state poisoned");

        match state.entries.get(&key) {
            None => {
                state.misses += 1;
                None
            }
            Some(entry) if entry.created_at.elapsed() > self.ttl => {
                state.entries.remove(&key);
                state.misses += 1;
                None
            }
            Some(_) => {
                let entry = state.entries.get_mut(&key).expect("entry just checked");
                entry.accessed_at = Instant::now();
                let response = entry.response.clone();
                state.hits += 1;
                debug!(key = %&key[..16], "response cache hit");
                Some(response)
            }
        }
    }

    pub fn set(&self, prompt: &str, response: &str) {
        let key = Self::hash_key(prompt);
        let mut state = self.state.lock().expect("cache state poisoned");

        if state.entries.len() >= self.max_size && !state.entries.contains_key(&key) {
            if let Some(oldest) = state
                .entries
                .iter()
                .min_by_key(|(_, e)| e.accessed_at)
                .map(|(k, _)| k.clone())
            {
                state.entries.remove(&oldest);
                state.evictions += 1;
                debug!(key = %&oldest[..16], "evicted cache entry");
            }
        }

        let now = Instant::now();
        state.entries.insert(
            key,
            CacheEntry {
                response: response.to_string(),
                created_at: now,
                accessed_at: now,
            },
        );
    }

    /// Removes expired entries; returns how many were purged.
    pub fn sweep(&self) -> usize {
        let mut state = self.state.lock().expect("cache state poisoned");
        let ttl = self.ttl;
        let before = state.entries.len();
        state.entries.retain(|_, e| e.created_at.elapsed() <= ttl);
        let purged = before - state.entries.len();
        if purged > 0 {
            debug!(purged, remaining = state.entries.len(), "swept expired cache entries");
        }
        purged
    }

    /// Runs the expiry sweep on a fixed interval until the task is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                cache.sweep();
            }
        })
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock().expect("cache state poisoned");
        let total = state.hits + state.misses;
        let hit_rate_percent = if total > 0 {
            state.hits as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        CacheStats {
            size: state.entries.len(),
            max_size: self.max_size,
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            hit_rate_percent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_then_hit() {
        let cache = ResponseCache::new(10, Duration::from_secs(60));
        assert!(cache.get("prompt-a").is_none());
        cache.set("prompt-a", "response-a");
        assert_eq!(cache.get("prompt-a").as_deref(), Some("response-a"));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate_percent - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn distinct_prompts_do_not_collide() {
        let cache = ResponseCache::new(10, Duration::from_secs(60));
        cache.set("prompt-a", "response-a");
        cache.set("prompt-b", "response-b");
        assert_eq!(cache.get("prompt-a").as_deref(), Some("response-a"));
        assert_eq!(cache.get("prompt-b").as_deref(), Some("response-b"));
    }

    #[test]
    fn at_capacity_evicts_exactly_the_least_recently_accessed() {
        let cache = ResponseCache::new(2, Duration::from_secs(60));
        cache.set("a", "1");
        std::thread::sleep(Duration::from_millis(5));
        cache.set("b", "2");
        std::thread::sleep(Duration::from_millis(5));
        // Touch "a" so "b" becomes the oldest by access time.
        assert!(cache.get("a").is_some());
        std::thread::sleep(Duration::from_millis(5));

        cache.set("c", "3");
        assert_eq!(cache.stats().evictions, 1);
        assert!(cache.get("b").is_none(), "oldest-access entry evicted");
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn expired_entries_are_misses() {
        let cache = ResponseCache::new(10, Duration::from_millis(10));
        cache.set("a", "1");
        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.get("a").is_none());
        assert_eq!(cache.stats().size, 0, "expired entry removed on access");
    }

    #[test]
    fn sweep_purges_expired_entries() {
        let cache = ResponseCache::new(10, Duration::from_millis(10));
        cache.set("a", "1");
        cache.set("b", "2");
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.sweep(), 2);
        assert_eq!(cache.stats().size, 0);
    }

    #[test]
    fn overwriting_existing_key_does_not_evict() {
        let cache = ResponseCache::new(2, Duration::from_secs(60));
        cache.set("a", "1");
        cache.set("b", "2");
        cache.set("a", "1-updated");
        assert_eq!(cache.stats().evictions, 0);
        assert_eq!(cache.get("a").as_deref(), Some("1-updated"));
        assert_eq!(cache.get("b").as_deref(), Some("2"));
    }
}

//! Response cache
//!
//! Concurrent TTL cache from request fingerprint to a finished
//! [`FinalResult`]. Reads and writes go through `DashMap` shards; expiry
//! sweeps are serialized by their own mutex.

use crate::types::FinalResult;
use dashmap::DashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
struct CacheEntry {
    inserted_at: Instant,
    result: FinalResult,
}

#[derive(Debug)]
pub struct ResponseCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
    max_entries: usize,
    sweep_lock: Mutex<()>,
}

impl ResponseCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            max_entries,
            sweep_lock: Mutex::new(()),
        }
    }

    pub fn get(&self, fingerprint: &str) -> Option<FinalResult> {
        let ttl = self.ttl;
        {
            let entry = self.entries.get(fingerprint)?;
            if entry.inserted_at.elapsed() < ttl {
                return Some(entry.result.clone());
            }
        }
        // a concurrent put may have replaced the expired entry by now
        self.entries.remove_if(fingerprint, |_, entry| entry.inserted_at.elapsed() >= ttl);
        None
    }

    pub fn put(&self, fingerprint: String, result: FinalResult) {
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(&fingerprint) {
            self.sweep_expired();
            if self.entries.len() >= self.max_entries {
                debug!("Response cache full, not caching {}", fingerprint);
                return;
            }
        }
        self.entries.insert(
            fingerprint,
            CacheEntry {
                inserted_at: Instant::now(),
                result,
            },
        );
    }

    /// Remove expired entries; concurrent callers wait for the running sweep.
    pub fn sweep_expired(&self) -> usize {
        let _guard = self.sweep_lock.lock().unwrap_or_else(|p| p.into_inner());
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, entry| entry.inserted_at.elapsed() < ttl);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!("Swept {} expired cache entries", removed);
        }
        removed
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

    fn result(sql: &str) -> FinalResult {
        let mut r = FinalResult::ambiguous(Vec::new());
        r.ambiguous = false;
        r.sql = Some(sql.to_string());
        r
    }

    #[test]
    fn test_put_and_get() {
        let cache = ResponseCache::new(Duration::from_secs(60), 10);
        cache.put("k".into(), result("SELECT 1"));
        assert_eq!(cache.get("k").unwrap().sql.as_deref(), Some("SELECT 1"));
        assert!(cache.get("other").is_none());
    }

    #[test]
    fn test_expired_entries_are_dropped() {
        let cache = ResponseCache::new(Duration::ZERO, 10);
        cache.put("k".into(), result("SELECT 1"));
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());

        cache.put("k2".into(), result("SELECT 2"));
        assert_eq!(cache.sweep_expired(), 1);
    }

    #[test]
    fn test_expiry_never_removes_a_fresh_replacement() {
        let cache = std::sync::Arc::new(ResponseCache::new(Duration::from_millis(50), 10));
        let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let (cache, stop) = (cache.clone(), stop.clone());
                std::thread::spawn(move || {
                    while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                        cache.get("k");
                    }
                })
            })
            .collect();

        for round in 0..8 {
            cache.put("k".into(), result("stale"));
            std::thread::sleep(Duration::from_millis(60));
            cache.put("k".into(), result("fresh"));
            assert_eq!(
                cache.get("k").and_then(|r| r.sql),
                Some("fresh".to_string()),
                "fresh entry lost in round {}",
                round
            );
        }

        stop.store(true, std::sync::atomic::Ordering::Relaxed);
        for r in readers {
            r.join().unwrap();
        }
    }

    #[test]
    fn test_capacity_is_bounded() {
        let cache = ResponseCache::new(Duration::from_secs(60), 2);
        cache.put("a".into(), result("1"));
        cache.put("b".into(), result("2"));
        cache.put("c".into(), result("3"));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("c").is_none());

        cache.put("a".into(), result("updated"));
        assert_eq!(cache.get("a").unwrap().sql.as_deref(), Some("updated"));
    }

    #[test]
    fn test_concurrent_access() {
        let cache = std::sync::Arc::new(ResponseCache::new(Duration::from_secs(60), 1000));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for j in 0..50 {
                        let key = format!("{}-{}", i, j);
                        cache.put(key.clone(), result("x"));
                        assert!(cache.get(&key).is_some());
                        cache.sweep_expired();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.len(), 400);
    }
}

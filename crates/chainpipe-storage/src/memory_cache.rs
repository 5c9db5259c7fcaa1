//! In-process TTL cache.
//!
//! Bounded by entry count. Entries are indexed by expiry, so a full cache
//! evicts the entry closest to expiry in O(log n). Each write also sweeps
//! a small batch of already expired entries off the front of the index.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chainpipe_core::{CacheError, KvCache};

const DEFAULT_CAPACITY: usize = 1_000_000;

/// Expired entries removed per write.
const SWEEP_BATCH: usize = 64;

struct Entry {
    value: Vec<u8>,
    expires: Instant,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    by_expiry: BTreeSet<(Instant, String)>,
}

impl Inner {
    fn remove(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key) {
            self.by_expiry.remove(&(entry.expires, key.to_string()));
        }
    }

    /// Drop up to `limit` expired entries. Returns how many were dropped.
    fn sweep(&mut self, now: Instant, limit: usize) -> usize {
        let mut swept = 0;
        while swept < limit {
            match self.by_expiry.first() {
                Some((expires, _)) if *expires <= now => {}
                _ => break,
            }
            if let Some((_, key)) = self.by_expiry.pop_first() {
                self.entries.remove(&key);
                swept += 1;
            }
        }
        swept
    }

    fn evict_soonest(&mut self) {
        if let Some((_, key)) = self.by_expiry.pop_first() {
            self.entries.remove(&key);
        }
    }
}

pub struct MemoryCache {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.inner.lock().unwrap().sweep(Instant::now(), usize::MAX)
    }
}

#[async_trait]
impl KvCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut inner = self.inner.lock().unwrap();
        let expired = match inner.entries.get(key) {
            Some(entry) if entry.expires > Instant::now() => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            inner.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let now = Instant::now();
        let expires = now + ttl;
        let mut inner = self.inner.lock().unwrap();
        inner.sweep(now, SWEEP_BATCH);
        inner.remove(key);
        if inner.entries.len() >= self.capacity {
            inner.evict_soonest();
        }
        inner.by_expiry.insert((expires, key.to_string()));
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires,
            },
        );
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_expire() {
        let cache = MemoryCache::new();
        cache.set("k", b"1", Duration::from_millis(30)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(b"1".to_vec()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn capacity_evicts_soonest_expiry() {
        let cache = MemoryCache::with_capacity(2);
        cache.set("short", b"1", Duration::from_secs(1)).await.unwrap();
        cache.set("long", b"1", Duration::from_secs(60)).await.unwrap();
        cache.set("new", b"1", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.len(), 2);
        assert!(cache.get("short").await.unwrap().is_none());
        assert!(cache.get("long").await.unwrap().is_some());
        assert!(cache.get("new").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn overwrite_moves_the_expiry() {
        let cache = MemoryCache::with_capacity(2);
        cache.set("a", b"1", Duration::from_secs(1)).await.unwrap();
        cache.set("b", b"1", Duration::from_secs(30)).await.unwrap();
        // "a" now outlives "b", so "b" is the one to go.
        cache.set("a", b"2", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.len(), 2);
        cache.set("c", b"1", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.len(), 2);
        assert!(cache.get("b").await.unwrap().is_none());
        assert_eq!(cache.get("a").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn writes_sweep_expired_entries() {
        let cache = MemoryCache::with_capacity(10_000);
        for i in 0..100 {
            cache
                .set(&format!("old-{i}"), b"1", Duration::from_millis(10))
                .await
                .unwrap();
        }
        cache.set("live", b"1", Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        cache.set("fresh", b"1", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.len(), 100 + 2 - SWEEP_BATCH);
        assert_eq!(cache.purge_expired(), 100 - SWEEP_BATCH);
        assert_eq!(cache.len(), 2);
        assert!(cache.get("live").await.unwrap().is_some());
    }
}

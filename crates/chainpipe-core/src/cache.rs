//! Best-effort dedup cache over an external key-value cache.
//!
//! The cache only suppresses re-emission after restarts or replays. It is not
//! a correctness mechanism: consumers dedupe on `dedup_key` themselves, and
//! any cache failure is treated as a miss.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::CacheError;

/// Minimal get / set-with-ttl cache interface.
#[async_trait]
pub trait KvCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError>;

    /// Reachability probe used at bootstrap.
    async fn ping(&self) -> Result<(), CacheError>;
}

/// Dedup view over a shared [`KvCache`].
#[derive(Clone)]
pub struct DedupCache {
    backend: Arc<dyn KvCache>,
    namespace: String,
    ttl: Duration,
    errors: Arc<AtomicU64>,
}

impl DedupCache {
    pub fn new(backend: Arc<dyn KvCache>, ttl: Duration) -> Self {
        Self {
            backend,
            namespace: "dedup".into(),
            ttl,
            errors: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of cache operations that failed and were downgraded.
    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    fn key(&self, dedup_key: &str) -> String {
        format!("{}:{dedup_key}", self.namespace)
    }

    /// Raw lookup. Failures are counted and returned.
    pub async fn check(&self, dedup_key: &str) -> Result<bool, CacheError> {
        let result = self.backend.get(&self.key(dedup_key)).await.map(|hit| hit.is_some());
        if result.is_err() {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// `true` only if the cache positively knows the key. Errors → `false`.
    pub async fn seen(&self, dedup_key: &str) -> bool {
        match self.check(dedup_key).await {
            Ok(hit) => hit,
            Err(e) => {
                tracing::debug!(error = %e, "dedup lookup failed, treating as miss");
                false
            }
        }
    }

    /// Record the key with the default ttl. Failures are counted and returned.
    pub async fn try_mark(&self, dedup_key: &str) -> Result<(), CacheError> {
        self.try_mark_with_ttl(dedup_key, self.ttl).await
    }

    pub async fn try_mark_with_ttl(&self, dedup_key: &str, ttl: Duration) -> Result<(), CacheError> {
        let result = self.backend.set(&self.key(dedup_key), b"1", ttl).await;
        if result.is_err() {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Record the key with the default ttl. Errors are swallowed.
    pub async fn mark(&self, dedup_key: &str) {
        self.mark_with_ttl(dedup_key, self.ttl).await
    }

    pub async fn mark_with_ttl(&self, dedup_key: &str, ttl: Duration) {
        if let Err(e) = self.try_mark_with_ttl(dedup_key, ttl).await {
            tracing::debug!(error = %e, "dedup mark failed");
        }
    }
}

impl std::fmt::Debug for DedupCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupCache")
            .field("namespace", &self.namespace)
            .field("ttl", &self.ttl)
            .finish()
    }
}

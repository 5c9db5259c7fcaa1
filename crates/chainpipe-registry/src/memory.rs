//! In-memory watchable registry.
//!
//! Suitable for testing and for embedding chainpipe behind another admin
//! layer. Thread-safe via `Arc<RwLock<Inner>>`; watchers are fed through a
//! `tokio::sync::broadcast` channel.

use std::collections::BTreeMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, RwLock,
};

use async_trait::async_trait;
use bytes::Bytes;
use chainpipe_core::{
    ConfigChange, ConfigStore, ConfigWatchStream, RegistryEntry, RegistrySnapshot, SourceConfig,
    StoreError,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const DEFAULT_WATCH_CAPACITY: usize = 1024;

type Change = Result<ConfigChange, StoreError>;

#[derive(Default)]
struct Inner {
    entries: BTreeMap<String, RegistryEntry>,
    revision: u64,
}

#[derive(Clone)]
pub struct MemoryConfigStore {
    inner: Arc<RwLock<Inner>>,
    changes: broadcast::Sender<Change>,
    available: Arc<AtomicBool>,
}

impl Default for MemoryConfigStore {
    fn default() -> Self {
        Self::with_watch_capacity(DEFAULT_WATCH_CAPACITY)
    }
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A watcher that falls more than `capacity` changes behind gets
    /// [`StoreError::Lagged`].
    pub fn with_watch_capacity(capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            changes,
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Store `value` under `key`. Every put is a new revision, even when the
    /// value is unchanged. Returns the revision.
    pub fn put(&self, key: impl Into<String>, value: impl Into<Bytes>) -> u64 {
        let mut inner = self.inner.write().unwrap();
        inner.revision += 1;
        let entry = RegistryEntry {
            key: key.into(),
            revision: inner.revision,
            value: value.into(),
        };
        inner.entries.insert(entry.key.clone(), entry.clone());
        let _ = self.changes.send(Ok(ConfigChange::Put(entry)));
        inner.revision
    }

    /// Serialize `config` as JSON and store it under its id.
    pub fn put_config(&self, config: &SourceConfig) -> u64 {
        let value = serde_json::to_vec(config).unwrap_or_default();
        self.put(config.id.clone(), value)
    }

    /// Remove `key`. Returns the revision, or `None` if it did not exist.
    pub fn delete(&self, key: &str) -> Option<u64> {
        let mut inner = self.inner.write().unwrap();
        inner.entries.remove(key)?;
        inner.revision += 1;
        let _ = self.changes.send(Ok(ConfigChange::Delete {
            key: key.to_string(),
            revision: inner.revision,
        }));
        Some(inner.revision)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Simulate losing the backing store: `list` fails, new watches fail
    /// immediately and live watches receive an error.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if !available {
            let _ = self
                .changes
                .send(Err(StoreError::Unavailable("registry connection lost".into())));
        }
    }

    fn unavailable() -> StoreError {
        StoreError::Unavailable("registry connection lost".into())
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn list(&self) -> Result<RegistrySnapshot, StoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        let inner = self.inner.read().unwrap();
        Ok(RegistrySnapshot {
            revision: inner.revision,
            entries: inner.entries.values().cloned().collect(),
        })
    }

    fn watch(&self, cancel: CancellationToken) -> ConfigWatchStream {
        if !self.available.load(Ordering::SeqCst) {
            return Box::pin(futures::stream::once(async { Err(Self::unavailable()) }));
        }
        // Subscribe now so changes made after this call are never missed.
        let rx = self.changes.subscribe();
        Box::pin(futures::stream::unfold((rx, cancel), |(mut rx, cancel)| async move {
            let item = tokio::select! {
                _ = cancel.cancelled() => return None,
                item = rx.recv() => item,
            };
            match item {
                Ok(change) => Some((change, (rx, cancel))),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    Some((Err(StoreError::Lagged { missed }), (rx, cancel)))
                }
                Err(broadcast::error::RecvError::Closed) => None,
            }
        }))
    }
}

//! Read-only client over the watchable source registry.

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

use crate::error::{ConfigError, StoreError};
use crate::source::SourceConfig;

/// One registry entry: a source id and its serialized definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub key: String,
    /// Store-wide monotonic revision of the last write to this key.
    pub revision: u64,
    pub value: Bytes,
}

impl RegistryEntry {
    pub fn parse(&self) -> Result<SourceConfig, ConfigError> {
        SourceConfig::parse(&self.key, &self.value)
    }
}

/// Full view of the registry at one revision.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    pub revision: u64,
    pub entries: Vec<RegistryEntry>,
}

/// A change observed on the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigChange {
    Put(RegistryEntry),
    Delete { key: String, revision: u64 },
}

impl ConfigChange {
    pub fn key(&self) -> &str {
        match self {
            Self::Put(entry) => &entry.key,
            Self::Delete { key, .. } => key,
        }
    }

    pub fn revision(&self) -> u64 {
        match self {
            Self::Put(entry) => entry.revision,
            Self::Delete { revision, .. } => *revision,
        }
    }
}

pub type ConfigWatchStream = Pin<Box<dyn Stream<Item = Result<ConfigChange, StoreError>> + Send>>;

/// Registry of source definitions.
///
/// `watch` never drops a change silently: if it cannot keep up or loses its
/// transport it yields an error, and the caller is expected to re-`list` and
/// re-`watch` after a backoff.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn list(&self) -> Result<RegistrySnapshot, StoreError>;

    /// Stream of changes after the moment of the call. Ends when `cancel`
    /// fires.
    fn watch(&self, cancel: CancellationToken) -> ConfigWatchStream;
}

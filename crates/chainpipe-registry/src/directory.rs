//! Directory-backed registry: one file per source.
//!
//! `<dir>/<id>.json`, `<dir>/<id>.yaml` or `<dir>/<id>.yml`; the file stem
//! is the registry key. `watch` polls the directory and diffs by content
//! hash and modification time. A rewrite with identical content but a newer
//! mtime is reported as a `Put` (a re-touch).

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use chainpipe_core::{
    ConfigChange, ConfigStore, ConfigWatchStream, RegistryEntry, RegistrySnapshot, StoreError,
};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const EXTENSIONS: [&str; 3] = ["json", "yaml", "yml"];

#[derive(Debug, Clone, PartialEq, Eq)]
struct FileStamp {
    hash: Vec<u8>,
    modified: Option<SystemTime>,
    revision: u64,
}

#[derive(Debug, Default)]
struct ScanState {
    revision: u64,
    known: HashMap<String, FileStamp>,
}

struct ScannedFile {
    value: Bytes,
    modified: Option<SystemTime>,
}

#[derive(Clone)]
pub struct DirectoryConfigStore {
    dir: PathBuf,
    poll_interval: Duration,
    state: Arc<Mutex<ScanState>>,
}

impl DirectoryConfigStore {
    pub fn new(dir: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            poll_interval,
            state: Arc::new(Mutex::new(ScanState::default())),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Read every definition file in the directory.
    async fn scan(&self) -> Result<BTreeMap<String, ScannedFile>, StoreError> {
        let unavailable =
            |e: std::io::Error| StoreError::Unavailable(format!("{}: {e}", self.dir.display()));

        let mut files = BTreeMap::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await.map_err(unavailable)?;
        let mut paths = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(unavailable)? {
            paths.push(entry.path());
        }
        paths.sort();

        for path in paths {
            let Some(key) = definition_key(&path) else {
                continue;
            };
            if files.contains_key(&key) {
                warn!(path = %path.display(), %key, "duplicate source definition ignored");
                continue;
            }
            // A file removed between listing and reading is simply gone.
            let value = match tokio::fs::read(&path).await {
                Ok(v) => v,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(unavailable(e)),
            };
            let modified = tokio::fs::metadata(&path)
                .await
                .ok()
                .and_then(|m| m.modified().ok());
            files.insert(
                key,
                ScannedFile {
                    value: Bytes::from(value),
                    modified,
                },
            );
        }
        Ok(files)
    }

    /// Fold a scan into the known state. Returns the changes and the full
    /// entry list at the new revision.
    fn apply(&self, scanned: BTreeMap<String, ScannedFile>) -> (Vec<ConfigChange>, RegistrySnapshot) {
        let mut state = self.state.lock().unwrap();
        let mut changes = Vec::new();
        let mut entries = Vec::with_capacity(scanned.len());

        let gone: Vec<String> = state
            .known
            .keys()
            .filter(|k| !scanned.contains_key(*k))
            .cloned()
            .collect();
        for key in gone {
            state.known.remove(&key);
            state.revision += 1;
            changes.push(ConfigChange::Delete {
                key,
                revision: state.revision,
            });
        }

        for (key, file) in scanned {
            let hash = Sha256::digest(&file.value).to_vec();
            let revision = match state.known.get(&key) {
                Some(stamp) if stamp.hash == hash && stamp.modified == file.modified => stamp.revision,
                _ => {
                    state.revision += 1;
                    let revision = state.revision;
                    state.known.insert(
                        key.clone(),
                        FileStamp {
                            hash,
                            modified: file.modified,
                            revision,
                        },
                    );
                    changes.push(ConfigChange::Put(RegistryEntry {
                        key: key.clone(),
                        revision,
                        value: file.value.clone(),
                    }));
                    revision
                }
            };
            entries.push(RegistryEntry {
                key,
                revision,
                value: file.value,
            });
        }

        let snapshot = RegistrySnapshot {
            revision: state.revision,
            entries,
        };
        (changes, snapshot)
    }
}

fn definition_key(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?;
    if !EXTENSIONS.contains(&ext) {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.is_empty() || stem.starts_with('.') {
        return None;
    }
    Some(stem.to_string())
}

#[async_trait]
impl ConfigStore for DirectoryConfigStore {
    async fn list(&self) -> Result<RegistrySnapshot, StoreError> {
        let scanned = self.scan().await?;
        let (_, snapshot) = self.apply(scanned);
        Ok(snapshot)
    }

    fn watch(&self, cancel: CancellationToken) -> ConfigWatchStream {
        struct Poll {
            store: DirectoryConfigStore,
            cancel: CancellationToken,
            pending: VecDeque<Result<ConfigChange, StoreError>>,
        }

        let init = Poll {
            store: self.clone(),
            cancel,
            pending: VecDeque::new(),
        };

        Box::pin(futures::stream::unfold(init, |mut poll| async move {
            loop {
                if let Some(item) = poll.pending.pop_front() {
                    return Some((item, poll));
                }
                tokio::select! {
                    _ = poll.cancel.cancelled() => return None,
                    _ = tokio::time::sleep(poll.store.poll_interval) => {}
                }
                match poll.store.scan().await {
                    Ok(scanned) => {
                        let (changes, _) = poll.store.apply(scanned);
                        if !changes.is_empty() {
                            debug!(dir = %poll.store.dir.display(), count = changes.len(), "registry changes");
                        }
                        poll.pending.extend(changes.into_iter().map(Ok));
                    }
                    Err(e) => poll.pending.push_back(Err(e)),
                }
            }
        }))
    }
}

//! File-backed checkpoint store: one JSON document per source.
//!
//! Writes go to a temporary sibling file which is then renamed over the
//! target, so a crash mid-write never leaves a truncated checkpoint.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chainpipe_core::{Checkpoint, CheckpointError, CheckpointStore};
use tracing::debug;

pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Open (creating if needed) a checkpoint directory.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, source_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(source_id)))
    }
}

/// Source ids made of `[A-Za-z0-9._-]` map to themselves; anything else is
/// hex-encoded so every id has a distinct, portable file name.
fn file_stem(source_id: &str) -> String {
    let safe = !source_id.is_empty()
        && !source_id.starts_with('.')
        && source_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if safe {
        source_id.to_string()
    } else {
        format!("x-{}", hex::encode(source_id))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, source_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = self.path_for(source_id);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let checkpoint: Checkpoint =
            serde_json::from_slice(&raw).map_err(|e| CheckpointError::Corrupt {
                source_id: source_id.to_string(),
                reason: e.to_string(),
            })?;
        if checkpoint.source_id != source_id {
            return Err(CheckpointError::Corrupt {
                source_id: source_id.to_string(),
                reason: format!("file belongs to '{}'", checkpoint.source_id),
            });
        }
        Ok(Some(checkpoint))
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let path = self.path_for(&checkpoint.source_id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(checkpoint)
            .map_err(|e| CheckpointError::Storage(e.to_string()))?;

        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(source_id = %checkpoint.source_id, position = %checkpoint.position, "checkpoint written");
        Ok(())
    }

    async fn delete(&self, source_id: &str) -> Result<(), CheckpointError> {
        match tokio::fs::remove_file(self.path_for(source_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

//! Checkpoint manager: persists a source's position for crash recovery.
//!
//! A checkpoint stores the last position whose events are known to be on the
//! bus. On restart the worker resumes after it instead of reprocessing from
//! the configured start position. Writes happen every N records or T
//! seconds, whichever comes first, never per record.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::CheckpointError;
use crate::event::Position;

/// A persisted checkpoint for one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub source_id: String,
    /// Last successfully processed position.
    pub position: Position,
    pub updated_at: DateTime<Utc>,
}

/// Storage for checkpoints.
///
/// Implementations include [`MemoryCheckpointStore`] here and the file and
/// SQLite stores in `chainpipe-storage`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, source_id: &str) -> Result<Option<Checkpoint>, CheckpointError>;

    /// Save (upsert) a checkpoint.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    /// Delete a checkpoint; called only when the source definition is deleted.
    async fn delete(&self, source_id: &str) -> Result<(), CheckpointError>;
}

/// Write cadence for [`CheckpointManager`].
#[derive(Debug, Clone, Copy)]
pub struct CheckpointCadence {
    /// Save after this many processed records.
    pub every_records: u64,
    /// Save after this much time with unsaved progress.
    pub every: Duration,
}

impl Default for CheckpointCadence {
    fn default() -> Self {
        Self {
            every_records: 100,
            every: Duration::from_secs(5),
        }
    }
}

/// Manages checkpoint reads/writes for one source.
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    source_id: String,
    cadence: CheckpointCadence,
    /// Records processed since the last save.
    counter: u64,
    last_save: Instant,
    /// Last position written to the store.
    saved: Option<Position>,
}

impl CheckpointManager {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        source_id: impl Into<String>,
        cadence: CheckpointCadence,
    ) -> Self {
        Self {
            store,
            source_id: source_id.into(),
            cadence,
            counter: 0,
            last_save: Instant::now(),
            saved: None,
        }
    }

    /// Load the saved checkpoint (returns `None` if none exists).
    pub async fn load(&mut self) -> Result<Option<Checkpoint>, CheckpointError> {
        let cp = self.store.load(&self.source_id).await?;
        self.saved = cp.as_ref().map(|c| c.position);
        Ok(cp)
    }

    /// Count one processed record.
    pub fn record(&mut self) {
        self.counter += 1;
    }

    /// `true` when the cadence says a save is due.
    pub fn is_due(&self) -> bool {
        self.counter > 0
            && (self.counter >= self.cadence.every_records
                || self.last_save.elapsed() >= self.cadence.every)
    }

    /// Save `position` if the cadence says so. Returns whether a write happened.
    pub async fn maybe_save(&mut self, position: Option<Position>) -> Result<bool, CheckpointError> {
        if !self.is_due() {
            return Ok(false);
        }
        self.flush(position).await
    }

    /// Save immediately (used on stop). No-op when nothing advanced.
    pub async fn flush(&mut self, position: Option<Position>) -> Result<bool, CheckpointError> {
        let Some(position) = position else {
            return Ok(false);
        };
        if self.saved.is_some_and(|saved| saved >= position) {
            self.counter = 0;
            self.last_save = Instant::now();
            return Ok(false);
        }
        let cp = Checkpoint {
            source_id: self.source_id.clone(),
            position,
            updated_at: Utc::now(),
        };
        self.store.save(&cp).await?;
        self.saved = Some(position);
        self.counter = 0;
        self.last_save = Instant::now();
        tracing::debug!(source_id = %self.source_id, %position, "checkpoint saved");
        Ok(true)
    }

    pub fn saved_position(&self) -> Option<Position> {
        self.saved
    }
}

// ─── In-memory store (for testing) ────────────────────────────────────────────

/// In-memory checkpoint store for tests and ephemeral pipelines.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    data: Mutex<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, source_id: &str) -> Option<Checkpoint> {
        self.data.lock().unwrap().get(source_id).cloned()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, source_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.data.lock().unwrap().get(source_id).cloned())
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        self.data
            .lock()
            .unwrap()
            .insert(checkpoint.source_id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn delete(&self, source_id: &str) -> Result<(), CheckpointError> {
        self.data.lock().unwrap().remove(source_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(every_records: u64, every: Duration) -> (Arc<MemoryCheckpointStore>, CheckpointManager) {
        let store = Arc::new(MemoryCheckpointStore::new());
        let mgr = CheckpointManager::new(
            store.clone(),
            "chainA-main",
            CheckpointCadence { every_records, every },
        );
        (store, mgr)
    }

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let (store, mut mgr) = manager(10, Duration::from_secs(60));
        assert!(mgr.load().await.unwrap().is_none());

        mgr.record();
        assert!(mgr.flush(Some(Position::new(1000, 3))).await.unwrap());

        let cp = store.get("chainA-main").unwrap();
        assert_eq!(cp.position, Position::new(1000, 3));
        assert_eq!(mgr.load().await.unwrap().unwrap().position, Position::new(1000, 3));
    }

    #[tokio::test]
    async fn saves_every_n_records() {
        let (store, mut mgr) = manager(5, Duration::from_secs(3600));

        for i in 1..=4 {
            mgr.record();
            assert!(!mgr.maybe_save(Some(Position::new(i, 0))).await.unwrap());
        }
        assert!(store.get("chainA-main").is_none());

        mgr.record();
        assert!(mgr.maybe_save(Some(Position::new(5, 0))).await.unwrap());
        assert_eq!(store.get("chainA-main").unwrap().position, Position::new(5, 0));
    }

    #[tokio::test]
    async fn saves_after_interval() {
        let (store, mut mgr) = manager(1_000, Duration::from_millis(20));
        mgr.record();
        assert!(!mgr.maybe_save(Some(Position::new(1, 0))).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(mgr.maybe_save(Some(Position::new(1, 0))).await.unwrap());
        assert!(store.get("chainA-main").is_some());
    }

    #[tokio::test]
    async fn never_moves_backwards() {
        let (store, mut mgr) = manager(1, Duration::from_secs(60));
        mgr.record();
        mgr.flush(Some(Position::new(10, 0))).await.unwrap();
        mgr.record();
        assert!(!mgr.flush(Some(Position::new(9, 0))).await.unwrap());
        assert_eq!(store.get("chainA-main").unwrap().position, Position::new(10, 0));
    }

    #[tokio::test]
    async fn flush_without_position_is_noop() {
        let (store, mut mgr) = manager(1, Duration::from_secs(60));
        mgr.record();
        assert!(!mgr.flush(None).await.unwrap());
        assert!(store.get("chainA-main").is_none());
    }
}

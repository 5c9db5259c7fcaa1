//! Dedup cache and checkpoint manager running over the storage backends.

use std::sync::Arc;
use std::time::Duration;

use chainpipe_core::{
    CheckpointCadence, CheckpointManager, CheckpointStore, DedupCache, KvCache, Position,
};
use chainpipe_storage::{FileCheckpointStore, MemoryCache};

#[tokio::test]
async fn dedup_over_memory_cache() {
    let backend: Arc<dyn KvCache> = Arc::new(MemoryCache::with_capacity(16));
    let dedup = DedupCache::new(backend, Duration::from_secs(60));

    assert!(!dedup.seen("chainA-main:100:0").await);
    dedup.mark("chainA-main:100:0").await;
    assert!(dedup.seen("chainA-main:100:0").await);
    assert_eq!(dedup.error_count(), 0);
}

#[tokio::test]
async fn manager_resumes_from_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn CheckpointStore> =
        Arc::new(FileCheckpointStore::open(dir.path()).await.unwrap());

    let cadence = CheckpointCadence {
        every_records: 2,
        every: Duration::from_secs(3600),
    };
    let mut mgr = CheckpointManager::new(store.clone(), "chainA-main", cadence);
    assert!(mgr.load().await.unwrap().is_none());

    mgr.record();
    assert!(!mgr.maybe_save(Some(Position::new(10, 0))).await.unwrap());
    mgr.record();
    assert!(mgr.maybe_save(Some(Position::new(11, 2))).await.unwrap());

    let mut restarted = CheckpointManager::new(store, "chainA-main", cadence);
    let cp = restarted.load().await.unwrap().unwrap();
    assert_eq!(cp.position, Position::new(11, 2));
    assert_eq!(restarted.saved_position(), Some(Position::new(11, 2)));
}

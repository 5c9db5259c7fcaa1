use std::time::Duration;

use chainpipe_core::{ConfigChange, ConfigStore, StoreError};
use chainpipe_registry::DirectoryConfigStore;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

const POLL: Duration = Duration::from_millis(20);

async fn next_change(
    watch: &mut chainpipe_core::ConfigWatchStream,
) -> Result<ConfigChange, StoreError> {
    tokio::time::timeout(Duration::from_secs(5), watch.next())
        .await
        .expect("watch timed out")
        .expect("watch ended")
}

#[tokio::test]
async fn lists_json_and_yaml_definitions() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("chainA-main.json"),
        r#"{"chain_type":"evm","endpoint":"wss://node.example"}"#,
    )
    .unwrap();
    std::fs::write(
        dir.path().join("osmo.yaml"),
        "chain_type: cosmos\nendpoint: wss://rpc.osmo.example/websocket\nenabled: false\n",
    )
    .unwrap();
    std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

    let store = DirectoryConfigStore::new(dir.path(), POLL);
    let snap = store.list().await.unwrap();
    assert_eq!(snap.entries.len(), 2);

    let configs: Vec<_> = snap.entries.iter().map(|e| e.parse().unwrap()).collect();
    assert_eq!(configs[0].id, "chainA-main");
    assert_eq!(configs[1].id, "osmo");
    assert!(!configs[1].enabled);
}

#[tokio::test]
async fn watch_reports_put_and_delete() {
    let dir = tempfile::tempdir().unwrap();
    let store = DirectoryConfigStore::new(dir.path(), POLL);
    assert!(store.list().await.unwrap().entries.is_empty());

    let cancel = CancellationToken::new();
    let mut watch = store.watch(cancel.clone());

    let path = dir.path().join("a.json");
    std::fs::write(&path, r#"{"chain_type":"evm","endpoint":"wss://a"}"#).unwrap();
    let put = next_change(&mut watch).await.unwrap();
    let first_rev = put.revision();
    assert!(matches!(&put, ConfigChange::Put(e) if e.key == "a"));

    std::fs::write(&path, r#"{"chain_type":"evm","endpoint":"wss://b"}"#).unwrap();
    // A poll may observe the file mid-write; wait for the final content.
    loop {
        let changed = next_change(&mut watch).await.unwrap();
        assert!(changed.revision() > first_rev);
        match changed {
            ConfigChange::Put(e) => {
                if e.parse().map(|c| c.endpoint == "wss://b").unwrap_or(false) {
                    break;
                }
            }
            other => panic!("expected put, got {other:?}"),
        }
    }

    std::fs::remove_file(&path).unwrap();
    let deleted = next_change(&mut watch).await.unwrap();
    assert!(matches!(deleted, ConfigChange::Delete { ref key, .. } if key == "a"));

    cancel.cancel();
    assert!(tokio::time::timeout(Duration::from_secs(1), watch.next())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn list_then_watch_does_not_repeat_entries() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.json"), r#"{"chain_type":"evm","endpoint":"wss://a"}"#).unwrap();
    let store = DirectoryConfigStore::new(dir.path(), POLL);
    store.list().await.unwrap();

    let mut watch = store.watch(CancellationToken::new());
    std::fs::write(dir.path().join("b.json"), r#"{"chain_type":"evm","endpoint":"wss://b"}"#).unwrap();
    let change = next_change(&mut watch).await.unwrap();
    assert_eq!(change.key(), "b");
}

#[tokio::test]
async fn missing_directory_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let store = DirectoryConfigStore::new(dir.path().join("nope"), POLL);
    assert!(matches!(store.list().await, Err(StoreError::Unavailable(_))));

    let mut watch = store.watch(CancellationToken::new());
    assert!(matches!(next_change(&mut watch).await, Err(StoreError::Unavailable(_))));
}

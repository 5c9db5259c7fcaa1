//! Fleet behaviour of the supervisor against in-memory infrastructure.

mod common;

use std::time::Duration;

use chainpipe_core::{
    CheckpointStore, PipelineError, Position, RestartPolicy, WorkerStatus,
};
use common::{eventually, fast_config, sequences, source, tick, Harness, Parts, WAIT};
use serde_json::json;

#[tokio::test]
async fn converges_to_one_worker_per_enabled_source() {
    let parts = Parts::default();
    parts.store.put_config(&source("a", "test"));
    parts.store.put_config(&source("b", "test"));
    parts.store.put_config(&source("off", "test").disabled());
    let h = parts.start();

    h.running("a").await;
    h.running("b").await;
    let off = h
        .handle
        .wait_for_status("off", WorkerStatus::Stopped, WAIT)
        .await
        .unwrap();
    assert_eq!(off.chain_type, "test");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.connector.connect_count("a"), 1);
    assert_eq!(h.connector.connect_count("b"), 1);
    assert_eq!(h.connector.connect_count("off"), 0);

    let snapshot = h.handle.snapshot();
    assert_eq!(snapshot.count(WorkerStatus::Running), 2);
    assert!(snapshot.generated_at.is_some());

    let parts = h.stop().await;
    assert!(!parts.connector.is_connected("a"));
}

#[tokio::test]
async fn evm_source_publishes_events_to_the_bus() {
    let h = Harness::start();
    h.store.put(
        "chainA-main",
        r#"{"id":"chainA-main","chain_type":"evm","endpoint":"wss://node.example","enabled":true}"#,
    );
    h.running("chainA-main").await;

    let log = json!({
        "address": "0xd8da6bf26964af9d7eed9e03e53415d37aa96045",
        "topics": ["0x00000000000000000000000000000000000000000000000000000000000000aa"],
        "data": "0x",
        "blockNumber": "0x10",
        "logIndex": "0x1"
    });
    assert!(h.connector.push_json("chainA-main", &log));
    assert!(h.bus.wait_for(1, WAIT).await);

    let events = h.bus.events_for("chainA-main");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].source_id, "chainA-main");
    assert_eq!(events[0].event_type, "evm.log");
    assert_eq!(events[0].position, Position::new(16, 1));
    assert_eq!(h.bus.messages()[0].topic, "chainpipe.events.evm");
    h.stop().await;
}

#[tokio::test]
async fn unknown_chain_type_fails_only_that_source() {
    let parts = Parts::default();
    parts.store.put_config(&source("good", "test"));
    parts.store.put_config(&source("alien", "unknown-vm"));
    let h = parts.start();

    let alien = h
        .handle
        .wait_for_status("alien", WorkerStatus::Failed, WAIT)
        .await
        .unwrap();
    assert!(alien.last_error.unwrap().contains("unknown-vm"));
    h.running("good").await;

    assert!(h.connector.push_json("good", &tick(1, 0)));
    assert!(h.bus.wait_for(1, WAIT).await);
    assert_eq!(h.handle.state("good").unwrap().status, WorkerStatus::Running);
    h.stop().await;
}

#[tokio::test]
async fn crash_loop_marks_failed_until_retouched() {
    let parts = Parts::default();
    parts.connector.set_failing("flaky", true);
    parts.store.put_config(&source("flaky", "test"));
    parts.store.put_config(&source("steady", "test"));
    let h = parts.start();

    let failed = h
        .handle
        .wait_for_status("flaky", WorkerStatus::Failed, WAIT)
        .await
        .unwrap();
    assert!(failed.last_error.unwrap().contains("connection refused"));
    assert!(failed.restart_count >= 5);

    // No automatic restarts once failed.
    let attempts = h.connector.connect_count("flaky");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.connector.connect_count("flaky"), attempts);
    h.running("steady").await;

    // Writing the definition again lifts the failure.
    h.connector.set_failing("flaky", false);
    h.store.put_config(&source("flaky", "test"));
    h.running("flaky").await;
    assert!(h.connector.connect_count("flaky") > attempts);
    assert_eq!(h.handle.state("flaky").unwrap().restart_count, 0);
    h.stop().await;
}

#[tokio::test]
async fn delete_stops_worker_and_its_events() {
    let h = Harness::start();
    h.store.put_config(&source("gone", "test"));
    h.running("gone").await;

    assert!(h.connector.push_json("gone", &tick(1, 0)));
    assert!(h.bus.wait_for(1, WAIT).await);

    h.store.delete("gone");
    assert!(h
        .handle
        .wait_until(WAIT, |s| s.get("gone").is_none())
        .await
        .is_some());
    assert!(!h.connector.is_connected("gone"));
    assert!(!h.connector.push_json("gone", &tick(2, 0)));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.bus.events_for("gone").len(), 1);
    assert!(h.checkpoints.load("gone").await.unwrap().is_none());
    h.stop().await;
}

#[tokio::test]
async fn changed_definition_restarts_the_worker() {
    let h = Harness::start();
    h.store.put_config(&source("a", "test"));
    h.running("a").await;
    assert_eq!(h.connector.connect_count("a"), 1);

    // Same content, new revision: nothing to restart.
    h.store.put_config(&source("a", "test"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.connector.connect_count("a"), 1);

    let mut moved = source("a", "test");
    moved.endpoint = "wss://other.example".into();
    h.store.put_config(&moved);
    assert!(eventually(|| h.connector.connect_count("a") == 2).await);
    h.running("a").await;

    // Disabling stops it.
    h.store.put_config(&moved.clone().disabled());
    h.handle
        .wait_for_status("a", WorkerStatus::Stopped, WAIT)
        .await
        .unwrap();
    assert!(!h.connector.is_connected("a"));
    h.stop().await;
}

#[tokio::test]
async fn invalid_definition_fails_only_that_source() {
    let h = Harness::start();
    h.store.put_config(&source("ok", "test"));
    h.store.put("broken", "{ this is not a source");
    h.store.put("mismatch", r#"{"id":"other","chain_type":"test","endpoint":"wss://x"}"#);

    let broken = h
        .handle
        .wait_for_status("broken", WorkerStatus::Failed, WAIT)
        .await
        .unwrap();
    assert!(broken.last_error.is_some());
    let mismatch = h
        .handle
        .wait_for_status("mismatch", WorkerStatus::Failed, WAIT)
        .await
        .unwrap();
    assert!(mismatch.last_error.unwrap().contains("other"));
    h.running("ok").await;

    // Fixing the definition starts it.
    h.store.put_config(&source("broken", "test"));
    h.running("broken").await;
    h.stop().await;
}

#[tokio::test]
async fn short_bus_outage_loses_nothing() {
    let h = Harness::start();
    h.store.put_config(&source("a", "test"));
    h.store.put_config(&source("b", "test"));
    h.running("a").await;
    h.running("b").await;

    h.bus.set_available(false);
    for seq in 1..=20 {
        assert!(h.connector.push_json("a", &tick(seq, 0)));
        assert!(h.connector.push_json("b", &tick(seq, 1)));
    }
    h.handle
        .wait_until(WAIT, |s| s.get("a").is_some_and(|w| w.degraded))
        .await
        .unwrap();
    assert!(h.bus.is_empty());

    h.bus.set_available(true);
    assert!(h.bus.wait_for(40, WAIT).await);
    for id in ["a", "b"] {
        assert_eq!(sequences(&h.bus, id), (1..=20).collect::<Vec<_>>(), "order for {id}");
    }
    h.handle
        .wait_until(WAIT, |s| s.degraded().count() == 0)
        .await
        .unwrap();
    h.stop().await;
}

#[tokio::test]
async fn redefinition_during_bus_outage_republishes_abandoned_events() {
    let h = Harness::start();
    h.store.put_config(&source("a", "test"));
    h.running("a").await;

    h.bus.set_available(false);
    for seq in 1..=3 {
        assert!(h.connector.push_json("a", &tick(seq, 0)));
    }
    h.handle
        .wait_until(WAIT, |s| {
            s.get("a")
                .is_some_and(|w| w.position == Some(Position::new(3, 0)))
        })
        .await
        .unwrap();

    // The old worker cannot drain its lane and abandons the buffered events.
    let mut moved = source("a", "test");
    moved.endpoint = "wss://other.example".into();
    h.store.put_config(&moved);
    assert!(eventually(|| h.connector.connect_count("a") == 2).await);
    assert!(h.connector.wait_connected("a", WAIT).await);
    assert_eq!(h.connector.last_resume("a"), None);
    assert!(h.checkpoints.get("a").is_none());
    assert!(h.cache.is_empty());

    // The source replays them on the new connection.
    for seq in 1..=3 {
        assert!(h.connector.push_json("a", &tick(seq, 0)));
    }
    h.bus.set_available(true);
    assert!(h.bus.wait_for(3, WAIT).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sequences(&h.bus, "a"), vec![1, 2, 3]);
    assert_eq!(h.handle.state("a").unwrap().duplicates_skipped, 0);
    h.stop().await;
}

#[tokio::test]
async fn resumes_after_the_checkpoint() {
    let parts = Parts::default();
    parts.store.put_config(&source("a", "test"));
    let h = parts.start();
    h.running("a").await;
    for seq in 1..=3 {
        h.connector.push_json("a", &tick(seq, 0));
    }
    assert!(h.bus.wait_for(3, WAIT).await);
    let parts = h.stop().await;
    assert_eq!(
        parts.checkpoints.get("a").unwrap().position,
        Position::new(3, 0)
    );

    // A fresh cache, so only the checkpoint prevents re-publishing.
    let parts = Parts {
        cache: std::sync::Arc::new(chainpipe_storage::MemoryCache::new()),
        ..parts
    };
    let h = parts.start();
    h.running("a").await;
    assert_eq!(h.connector.last_resume("a"), Some(Position::new(3, 0)));

    // A connector that replays history re-sends old records.
    for seq in 2..=5 {
        h.connector.push_json("a", &tick(seq, 0));
    }
    assert!(h.bus.wait_for(5, WAIT).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sequences(&h.bus, "a"), vec![1, 2, 3, 4, 5]);
    h.stop().await;
}

#[tokio::test]
async fn start_position_skips_older_records() {
    let h = Harness::start();
    h.store.put_config(&source("a", "test").with_start_position(10));
    h.running("a").await;
    for seq in [8, 9, 10, 11] {
        h.connector.push_json("a", &tick(seq, 0));
    }
    assert!(h.bus.wait_for(2, WAIT).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sequences(&h.bus, "a"), vec![10, 11]);
    h.stop().await;
}

#[tokio::test]
async fn duplicates_and_bad_records_are_skipped() {
    let h = Harness::start();
    h.store.put_config(&source("a", "test"));
    h.running("a").await;

    h.connector.push_json("a", &tick(1, 0));
    h.connector.push_json("a", &json!({ "garbage": true }));
    h.connector.push("a", chainpipe_core::RawRecord::new("not json at all"));
    h.connector.push_json("a", &tick(2, 0));
    // Keys are recorded once the bus has acknowledged them.
    assert!(h.bus.wait_for(2, WAIT).await);
    assert!(eventually(|| h.cache.len() == 2).await);
    // The source re-sends a record it already delivered.
    h.connector.push_json("a", &tick(2, 0));
    h.connector.push_json("a", &tick(3, 0));
    assert!(h.bus.wait_for(3, WAIT).await);

    let snapshot = h
        .handle
        .wait_until(WAIT, |s| {
            s.get("a").is_some_and(|w| {
                w.decode_errors == 2 && w.duplicates_skipped == 1 && w.events_published == 3
            })
        })
        .await
        .unwrap();
    assert_eq!(snapshot.get("a").unwrap().position, Some(Position::new(3, 0)));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sequences(&h.bus, "a"), vec![1, 2, 3]);
    h.stop().await;
}

#[tokio::test]
async fn panicking_worker_is_restarted() {
    let h = Harness::start();
    h.store.put_config(&source("a", "test"));
    h.running("a").await;

    h.connector.push_json("a", &tick(1, 0));
    assert!(h.bus.wait_for(1, WAIT).await);
    h.connector.push_json("a", &json!({ "panic": true }));

    assert!(eventually(|| h.connector.connect_count("a") >= 2).await);
    h.running("a").await;
    let state = h.handle.state("a").unwrap();
    assert!(state.last_error.unwrap().contains("decoder exploded"));
    assert!(state.restart_count >= 1);

    h.connector.push_json("a", &tick(2, 0));
    assert!(h.bus.wait_for(2, WAIT).await);
    h.stop().await;
}

#[tokio::test]
async fn registry_unreachable_at_boot_is_fatal() {
    let parts = Parts::default();
    parts.store.set_available(false);
    let supervisor = parts.supervisor(fast_config());
    let err = supervisor
        .run(tokio_util::sync::CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Registry(_)));
}

#[tokio::test]
async fn watch_failure_relists_and_catches_up() {
    let h = Harness::start();
    h.store.put_config(&source("a", "test"));
    h.running("a").await;

    h.store.set_available(false);
    h.store.put_config(&source("b", "test"));
    h.store.delete("a");
    tokio::time::sleep(Duration::from_millis(50)).await;
    // Workers keep running while the registry is away.
    assert_eq!(h.handle.state("a").unwrap().status, WorkerStatus::Running);

    h.store.set_available(true);
    h.running("b").await;
    assert!(h
        .handle
        .wait_until(WAIT, |s| s.get("a").is_none())
        .await
        .is_some());
    h.stop().await;
}

#[tokio::test]
async fn crash_window_counts_reconnects() {
    let parts = Parts::default();
    parts.store.put_config(&source("a", "test"));
    let mut config = fast_config();
    config.restart = RestartPolicy {
        max_restarts: 2,
        window: Duration::from_secs(60),
    };
    let h = parts.start_with(config);
    h.running("a").await;

    // Each dropped connection counts against the window.
    for round in 1..=3u32 {
        assert!(h.connector.wait_connected("a", WAIT).await);
        h.connector.disconnect("a");
        if round < 3 {
            assert!(eventually(|| h.connector.connect_count("a") == round + 1).await);
        }
    }
    h.handle
        .wait_for_status("a", WorkerStatus::Failed, WAIT)
        .await
        .unwrap();
    h.stop().await;
}

#[tokio::test]
async fn shutdown_stops_every_worker_and_keeps_failures() {
    let parts = Parts::default();
    parts.store.put_config(&source("a", "test"));
    parts.store.put_config(&source("b", "test"));
    parts.store.put_config(&source("alien", "unknown-vm"));
    let h = parts.start();
    h.running("a").await;
    h.running("b").await;
    h.handle
        .wait_for_status("alien", WorkerStatus::Failed, WAIT)
        .await
        .unwrap();
    h.connector.push_json("a", &tick(7, 0));
    assert!(h.bus.wait_for(1, WAIT).await);

    let handle = h.handle.clone();
    let parts = h.stop().await;

    let snapshot = handle.snapshot();
    assert_eq!(snapshot.count(WorkerStatus::Stopped), 2);
    assert_eq!(snapshot.get("alien").unwrap().status, WorkerStatus::Failed);
    assert!(!parts.connector.is_connected("a"));
    assert!(!parts.connector.is_connected("b"));
    assert_eq!(parts.checkpoints.get("a").unwrap().position, Position::new(7, 0));
    assert!(parts.checkpoints.get("b").is_none());
}

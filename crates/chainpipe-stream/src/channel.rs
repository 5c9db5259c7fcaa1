//! In-process connector driven through a handle.
//!
//! Each source that connects gets its own unbounded channel. Callers push
//! records, inject disconnects, or make connects fail, which makes the
//! connector the main driver for runtime tests and for embedding chainpipe
//! behind another ingestion front-end.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chainpipe_core::{ConnectError, Position, RawRecord, RawRecordStream, SourceConfig, SourceConnector};
use futures::channel::mpsc;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

type Sender = mpsc::UnboundedSender<Result<RawRecord, ConnectError>>;

#[derive(Default)]
struct Inner {
    senders: HashMap<String, Sender>,
    failing: HashSet<String>,
    fail_all: bool,
    connects: HashMap<String, u32>,
    resumes: HashMap<String, Option<Position>>,
}

#[derive(Clone, Default)]
pub struct ChannelConnector {
    inner: Arc<Mutex<Inner>>,
}

impl ChannelConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every connect attempt for `source_id` fail (or succeed again).
    pub fn set_failing(&self, source_id: &str, failing: bool) {
        let mut inner = self.inner.lock().unwrap();
        if failing {
            inner.failing.insert(source_id.to_string());
        } else {
            inner.failing.remove(source_id);
        }
    }

    pub fn set_fail_all(&self, failing: bool) {
        self.inner.lock().unwrap().fail_all = failing;
    }

    /// Push one record to `source_id`'s live connection.
    /// Returns `false` if the source is not connected.
    pub fn push(&self, source_id: &str, record: RawRecord) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.senders.get(source_id) {
            Some(tx) => tx.unbounded_send(Ok(record)).is_ok(),
            None => false,
        }
    }

    pub fn push_json(&self, source_id: &str, value: &serde_json::Value) -> bool {
        self.push(source_id, RawRecord::from_json(value))
    }

    /// Drop the live connection with a `Closed` error.
    pub fn disconnect(&self, source_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(tx) = inner.senders.remove(source_id) {
            let _ = tx.unbounded_send(Err(ConnectError::Closed {
                endpoint: format!("channel://{source_id}"),
            }));
        }
    }

    pub fn is_connected(&self, source_id: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .senders
            .get(source_id)
            .is_some_and(|tx| !tx.is_closed())
    }

    pub fn connect_count(&self, source_id: &str) -> u32 {
        self.inner
            .lock()
            .unwrap()
            .connects
            .get(source_id)
            .copied()
            .unwrap_or(0)
    }

    /// `resume_after` passed on the most recent connect.
    pub fn last_resume(&self, source_id: &str) -> Option<Position> {
        self.inner
            .lock()
            .unwrap()
            .resumes
            .get(source_id)
            .copied()
            .flatten()
    }

    /// Poll until `source_id` is connected or `timeout` elapses.
    pub async fn wait_connected(&self, source_id: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_connected(source_id) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl SourceConnector for ChannelConnector {
    async fn connect(
        &self,
        source: &SourceConfig,
        resume_after: Option<Position>,
        cancel: CancellationToken,
    ) -> Result<RawRecordStream, ConnectError> {
        let mut inner = self.inner.lock().unwrap();
        *inner.connects.entry(source.id.clone()).or_default() += 1;
        inner.resumes.insert(source.id.clone(), resume_after);

        if inner.fail_all || inner.failing.contains(&source.id) {
            return Err(ConnectError::Failed {
                endpoint: source.endpoint.clone(),
                reason: "connection refused".into(),
            });
        }

        let (tx, rx) = mpsc::unbounded();
        inner.senders.insert(source.id.clone(), tx);
        Ok(Box::pin(rx.take_until(cancel.cancelled_owned())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_reaches_connected_stream() {
        let conn = ChannelConnector::new();
        let src = SourceConfig::new("a", "test", "ws://local");
        assert!(!conn.push("a", RawRecord::new("x")));

        let mut stream = conn.connect(&src, Some(Position::new(5, 0)), CancellationToken::new()).await.unwrap();
        assert!(conn.push("a", RawRecord::new("x")));
        assert_eq!(&stream.next().await.unwrap().unwrap().payload[..], b"x");
        assert_eq!(conn.last_resume("a"), Some(Position::new(5, 0)));
        assert_eq!(conn.connect_count("a"), 1);
    }

    #[tokio::test]
    async fn injected_failures() {
        let conn = ChannelConnector::new();
        let src = SourceConfig::new("a", "test", "ws://local");
        conn.set_failing("a", true);
        assert!(conn.connect(&src, None, CancellationToken::new()).await.is_err());
        conn.set_failing("a", false);

        let mut stream = conn.connect(&src, None, CancellationToken::new()).await.unwrap();
        conn.disconnect("a");
        assert!(matches!(stream.next().await, Some(Err(ConnectError::Closed { .. }))));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn dropped_stream_reports_disconnected() {
        let conn = ChannelConnector::new();
        let src = SourceConfig::new("a", "test", "ws://local");
        let stream = conn.connect(&src, None, CancellationToken::new()).await.unwrap();
        assert!(conn.is_connected("a"));
        drop(stream);
        assert!(!conn.is_connected("a"));
    }
}

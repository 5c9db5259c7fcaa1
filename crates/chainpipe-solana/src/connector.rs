//! `SolanaWsConnector`: `logsSubscribe` over the Solana PubSub WebSocket.
//!
//! Notifications carry a slot but no index, so the connector numbers them
//! within each slot in arrival order. `logsSubscribe` has no history;
//! resume positions are only used by the worker to skip processed records.

use async_trait::async_trait;
use chainpipe_core::{ConnectError, Position, RawRecord, RawRecordStream, SourceConfig, SourceConnector};
use chainpipe_stream::{emit, notification_result, spawn_record_stream, RecordSender, SessionConfig, WsSession};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Default)]
pub struct SolanaWsConnector {
    session: SessionConfig,
}

impl SolanaWsConnector {
    pub fn new(session: SessionConfig) -> Self {
        Self { session }
    }
}

/// `logsSubscribe` filter: `{"mentions": [..]}` from `options.mentions`, else `"all"`.
pub fn build_logs_filter(source: &SourceConfig) -> Value {
    let mentions = source.option_strings("mentions");
    if mentions.is_empty() {
        json!("all")
    } else {
        json!({ "mentions": mentions })
    }
}

#[async_trait]
impl SourceConnector for SolanaWsConnector {
    async fn connect(
        &self,
        source: &SourceConfig,
        resume_after: Option<Position>,
        cancel: CancellationToken,
    ) -> Result<RawRecordStream, ConnectError> {
        let mut session = WsSession::connect(source, self.session).await?;
        let commitment = source
            .options
            .get("commitment")
            .and_then(Value::as_str)
            .unwrap_or("confirmed")
            .to_string();
        let subscription = session
            .request(
                "logsSubscribe",
                json!([build_logs_filter(source), { "commitment": commitment }]),
            )
            .await?;
        info!(source_id = %source.id, subscription = %subscription, "logsSubscribe active");
        if let Some(pos) = resume_after {
            debug!(source_id = %source.id, position = %pos, "no history replay on logsSubscribe");
        }

        Ok(spawn_record_stream(cancel, move |tx| run(session, tx)))
    }
}

/// Numbers notifications within a slot.
#[derive(Debug, Default)]
pub struct SlotCounter {
    slot: Option<u64>,
    next: u32,
}

impl SlotCounter {
    pub fn next_index(&mut self, slot: u64) -> u32 {
        if self.slot != Some(slot) {
            self.slot = Some(slot);
            self.next = 0;
        }
        let index = self.next;
        self.next = self.next.saturating_add(1);
        index
    }
}

/// Turn a `logsNotification` result into a decoder record.
pub fn annotate(result: &Value, counter: &mut SlotCounter) -> Option<Value> {
    let slot = result["context"]["slot"].as_u64()?;
    let value = result.get("value")?;
    Some(json!({
        "slot": slot,
        "index": counter.next_index(slot),
        "signature": value["signature"],
        "err": value["err"],
        "logs": value.get("logs").cloned().unwrap_or_else(|| json!([])),
    }))
}

async fn run(mut session: WsSession, mut tx: RecordSender) -> Result<(), ConnectError> {
    let mut counter = SlotCounter::default();
    loop {
        let message = session.next_json().await?;
        let Some(result) = notification_result(&message, "logsNotification") else {
            continue;
        };
        let Some(record) = annotate(result, &mut counter) else {
            continue;
        };
        if !emit(&mut tx, RawRecord::from_json(&record)).await {
            return Ok(());
        }
    }
}

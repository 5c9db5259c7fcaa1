//! `CometWsConnector`: subscribes to CometBFT transaction events.
//!
//! Each `tendermint/event/Tx` notification is flattened into one raw record
//! per ABCI event. The position index packs the transaction's index within
//! its block and the event's index within the transaction
//! (`tx_index << 16 | event_i`) so positions are stable across reconnects.
//!
//! The CometBFT WebSocket has no history: resume positions are only used by
//! the worker to skip already-processed events.

use async_trait::async_trait;
use chainpipe_core::{ConnectError, Position, RawRecord, RawRecordStream, SourceConfig, SourceConnector};
use chainpipe_stream::{emit, spawn_record_stream, RecordSender, SessionConfig, WsSession};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_QUERY: &str = "tm.event='Tx'";

#[derive(Debug, Clone, Default)]
pub struct CometWsConnector {
    session: SessionConfig,
}

impl CometWsConnector {
    pub fn new(session: SessionConfig) -> Self {
        Self { session }
    }
}

#[async_trait]
impl SourceConnector for CometWsConnector {
    async fn connect(
        &self,
        source: &SourceConfig,
        resume_after: Option<Position>,
        cancel: CancellationToken,
    ) -> Result<RawRecordStream, ConnectError> {
        let mut session = WsSession::connect(source, self.session).await?;
        let query = source
            .options
            .get("query")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_QUERY)
            .to_string();
        session.request("subscribe", json!({ "query": query })).await?;
        info!(source_id = %source.id, %query, "CometBFT subscription active");
        if let Some(pos) = resume_after {
            debug!(source_id = %source.id, position = %pos, "no history replay on CometBFT WebSocket");
        }

        let base64 = source
            .options
            .get("base64_attributes")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let source_id = source.id.clone();
        Ok(spawn_record_stream(cancel, move |tx| run(session, source_id, base64, tx)))
    }
}

async fn run(
    mut session: WsSession,
    source_id: String,
    base64: bool,
    mut tx: RecordSender,
) -> Result<(), ConnectError> {
    loop {
        let message = session.next_json().await?;
        if let Some(err) = message.get("error") {
            return Err(ConnectError::Rpc {
                endpoint: session.endpoint().to_string(),
                message: err.to_string(),
            });
        }
        for record in flatten_tx_events(&message, base64) {
            if !emit(&mut tx, RawRecord::from_json(&record)).await {
                return Ok(());
            }
        }
        debug!(%source_id, "tx notification processed");
    }
}

/// Flatten one CometBFT `Tx` notification into per-event records.
/// Messages that are not `Tx` events yield nothing.
pub fn flatten_tx_events(message: &Value, base64: bool) -> Vec<Value> {
    let Some(result) = message.get("result") else {
        return Vec::new();
    };
    let data = &result["data"];
    if data["type"].as_str() != Some("tendermint/event/Tx") {
        return Vec::new();
    }
    let tx_result = &data["value"]["TxResult"];
    let Some(height) = tx_result.get("height").cloned() else {
        return Vec::new();
    };
    let tx_index = tx_result["index"].as_u64().unwrap_or(0);
    let tx_hash = result["events"]["tx.hash"][0].as_str().map(String::from);
    let Some(events) = tx_result["result"]["events"].as_array() else {
        return Vec::new();
    };
    if tx_index > 0xFFFF {
        warn!(tx_index, "transaction index exceeds position packing range");
        return Vec::new();
    }

    events
        .iter()
        .enumerate()
        .take(0x1_0000)
        .map(|(i, event)| {
            json!({
                "height": height,
                "tx_hash": tx_hash,
                "tx_index": tx_index,
                "event_index": (tx_index << 16) | i as u64,
                "type": event["type"],
                "attributes": event.get("attributes").cloned().unwrap_or_else(|| json!([])),
                "base64": base64,
            })
        })
        .collect()
}

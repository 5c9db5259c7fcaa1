//! `EvmWsConnector`: streams logs over an Ethereum JSON-RPC WebSocket.
//!
//! The live `eth_subscribe("logs", filter)` subscription is opened first so
//! that nothing is missed while catching up. If a resume or start block is
//! known, history from that block to the current head is then back-filled
//! with `eth_getLogs` in bounded ranges. Live notifications that arrived
//! during the back-fill and are not newer than its last log are dropped.

use async_trait::async_trait;
use chainpipe_core::{ConnectError, Position, RawRecord, RawRecordStream, SourceConfig, SourceConnector};
use chainpipe_stream::{emit, notification_result, spawn_record_stream, RecordSender, SessionConfig, WsSession};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::decoder::log_position;
use crate::quantity::{parse_quantity, to_quantity};

const DEFAULT_BACKFILL_BATCH: u64 = 1_000;

#[derive(Debug, Clone)]
pub struct EvmWsConnector {
    session: SessionConfig,
    backfill_batch: u64,
}

impl Default for EvmWsConnector {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            backfill_batch: DEFAULT_BACKFILL_BATCH,
        }
    }
}

impl EvmWsConnector {
    pub fn new(session: SessionConfig) -> Self {
        Self {
            session,
            ..Self::default()
        }
    }

    /// Maximum block span of one `eth_getLogs` call.
    pub fn with_backfill_batch(mut self, blocks: u64) -> Self {
        self.backfill_batch = blocks.max(1);
        self
    }
}

/// Log filter from `options.addresses` and `options.topics`.
pub fn build_log_filter(source: &SourceConfig) -> Map<String, Value> {
    let mut filter = Map::new();
    let addresses = source.option_strings("addresses");
    if !addresses.is_empty() {
        filter.insert("address".into(), json!(addresses));
    }
    if let Some(topics) = source.options.get("topics") {
        filter.insert("topics".into(), topics.clone());
    }
    filter
}

#[async_trait]
impl SourceConnector for EvmWsConnector {
    async fn connect(
        &self,
        source: &SourceConfig,
        resume_after: Option<Position>,
        cancel: CancellationToken,
    ) -> Result<RawRecordStream, ConnectError> {
        let mut session = WsSession::connect(source, self.session).await?;
        let filter = build_log_filter(source);

        let subscription = session
            .request("eth_subscribe", json!(["logs", Value::Object(filter.clone())]))
            .await?;
        info!(source_id = %source.id, subscription = %subscription, "eth_subscribe logs active");

        // Resume inside the checkpointed block: later logs in it may be unseen.
        let from_block = resume_after.map(|p| p.sequence).or(source.start_position);
        let batch = source.option_u64("backfill_batch").unwrap_or(self.backfill_batch).max(1);
        let source_id = source.id.clone();

        Ok(spawn_record_stream(cancel, move |tx| {
            run(session, source_id, filter, from_block, batch, tx)
        }))
    }
}

async fn run(
    mut session: WsSession,
    source_id: String,
    filter: Map<String, Value>,
    from_block: Option<u64>,
    batch: u64,
    mut tx: RecordSender,
) -> Result<(), ConnectError> {
    let mut high_water = None;
    if let Some(from) = from_block {
        match backfill(&mut session, &source_id, &filter, from, batch, &mut tx).await? {
            Backfill::Done(last) => high_water = last,
            Backfill::ReceiverGone => return Ok(()),
        }
    }

    loop {
        let message = session.next_json().await?;
        let Some(log) = notification_result(&message, "eth_subscription") else {
            continue;
        };
        if let (Some(high), Ok(pos)) = (high_water, log_position(log)) {
            if pos <= high {
                debug!(%source_id, position = %pos, "dropping live log already back-filled");
                continue;
            }
        }
        if !emit(&mut tx, RawRecord::from_json(log)).await {
            return Ok(());
        }
    }
}

enum Backfill {
    Done(Option<Position>),
    ReceiverGone,
}

async fn backfill(
    session: &mut WsSession,
    source_id: &str,
    filter: &Map<String, Value>,
    from: u64,
    batch: u64,
    tx: &mut RecordSender,
) -> Result<Backfill, ConnectError> {
    let head_value = session.request("eth_blockNumber", json!([])).await?;
    let head = parse_quantity(&head_value).ok_or_else(|| ConnectError::Rpc {
        endpoint: session.endpoint().to_string(),
        message: format!("invalid eth_blockNumber result {head_value}"),
    })?;
    if from > head {
        return Ok(Backfill::Done(None));
    }
    info!(%source_id, from, head, "back-filling logs");

    let mut last = None;
    let mut start = from;
    while start <= head {
        let end = start.saturating_add(batch - 1).min(head);
        let mut range = filter.clone();
        range.insert("fromBlock".into(), json!(to_quantity(start)));
        range.insert("toBlock".into(), json!(to_quantity(end)));

        let logs = session.request("eth_getLogs", json!([Value::Object(range)])).await?;
        let logs = logs.as_array().cloned().unwrap_or_default();
        debug!(%source_id, start, end, count = logs.len(), "eth_getLogs");
        for log in &logs {
            if let Ok(pos) = log_position(log) {
                last = last.max(Some(pos));
            }
            if !emit(tx, RawRecord::from_json(log)).await {
                return Ok(Backfill::ReceiverGone);
            }
        }
        start = end + 1;
    }
    Ok(Backfill::Done(last))
}

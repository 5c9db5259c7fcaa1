//! Fallback connector: every text frame is one raw record.

use async_trait::async_trait;
use chainpipe_core::{ConnectError, Position, RawRecord, RawRecordStream, SourceConfig, SourceConnector};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::pump::{emit, spawn_record_stream, RecordSender};
use crate::session::{SessionConfig, WsSession};

/// Connector for feeds that push one self-describing JSON document per
/// frame. If `options.subscribe` is set it is sent once after connecting
/// (a string verbatim, anything else as JSON).
#[derive(Debug, Clone, Default)]
pub struct JsonLinesWsConnector {
    session: SessionConfig,
}

impl JsonLinesWsConnector {
    pub fn new(session: SessionConfig) -> Self {
        Self { session }
    }
}

#[async_trait]
impl SourceConnector for JsonLinesWsConnector {
    async fn connect(
        &self,
        source: &SourceConfig,
        _resume_after: Option<Position>,
        cancel: CancellationToken,
    ) -> Result<RawRecordStream, ConnectError> {
        let mut session = WsSession::connect(source, self.session).await?;
        if let Some(subscribe) = source.options.get("subscribe") {
            let text = match subscribe {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            session.send_text(text).await?;
        }
        Ok(spawn_record_stream(cancel, move |tx| forward_frames(session, tx)))
    }
}

async fn forward_frames(mut session: WsSession, mut tx: RecordSender) -> Result<(), ConnectError> {
    loop {
        let text = session.next_text().await?;
        if !emit(&mut tx, RawRecord::new(text.into_bytes())).await {
            return Ok(());
        }
    }
}

//! Bus message shape and the `EventBus` trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::PublishError;
use crate::event::{NormalizedEvent, Position};

/// Header carrying the idempotency key on every message.
pub const DEDUP_KEY_HEADER: &str = "dedup_key";

/// One message ready for the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusMessage {
    pub topic: String,
    /// Partition key. Always the source id so per-source order holds.
    pub key: String,
    pub dedup_key: String,
    pub position: Position,
    /// JSON-encoded [`NormalizedEvent`].
    pub payload: Vec<u8>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl BusMessage {
    /// Encode `event` for `topic`.
    pub fn from_event(topic: impl Into<String>, event: &NormalizedEvent) -> Result<Self, PublishError> {
        let payload = serde_json::to_vec(event).map_err(|e| PublishError::Encode(e.to_string()))?;
        let mut headers = BTreeMap::new();
        headers.insert(DEDUP_KEY_HEADER.to_string(), event.dedup_key.clone());
        headers.insert("event_type".to_string(), event.event_type.clone());
        headers.insert("chain_type".to_string(), event.chain_type.clone());
        Ok(Self {
            topic: topic.into(),
            key: event.source_id.clone(),
            dedup_key: event.dedup_key.clone(),
            position: event.position,
            payload,
            headers,
        })
    }

    /// Decode the payload back into the event.
    pub fn event(&self) -> Result<NormalizedEvent, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// Acknowledgement from the bus.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BusAck {
    pub partition: Option<i32>,
    pub offset: Option<i64>,
}

/// A durable, per-topic ordered log.
///
/// Shared by every publisher lane, so implementations must be safe under
/// concurrent use.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn send(&self, message: &BusMessage) -> Result<BusAck, PublishError>;

    /// Reachability probe used at bootstrap.
    async fn ping(&self) -> Result<(), PublishError>;

    fn name(&self) -> &str;
}

/// Renders topic names from a template such as `chainpipe.events.{chain_type}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicTemplate(pub String);

impl Default for TopicTemplate {
    fn default() -> Self {
        Self("chainpipe.events.{chain_type}".into())
    }
}

impl TopicTemplate {
    pub fn render(&self, event: &NormalizedEvent) -> String {
        self.0
            .replace("{chain_type}", &event.chain_type)
            .replace("{source_id}", &event.source_id)
    }
}

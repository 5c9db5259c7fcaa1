//! Raw records, positions, and the normalized event shape.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Location of a record inside its source: block / height / slot plus an
/// index within it. Ordered lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub sequence: u64,
    pub index: u32,
}

impl Position {
    pub const fn new(sequence: u64, index: u32) -> Self {
        Self { sequence, index }
    }

    /// First position of `sequence`; everything at or after it is newer.
    pub const fn start_of(sequence: u64) -> Self {
        Self { sequence, index: 0 }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.sequence, self.index)
    }
}

/// One record exactly as a connector received it.
#[derive(Debug, Clone)]
pub struct RawRecord {
    /// Chain-native payload, usually a JSON document.
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

impl RawRecord {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Self {
        Self::new(value.to_string().into_bytes())
    }
}

/// Structured, insertion-ordered key/value payload.
pub type EventPayload = IndexMap<String, serde_json::Value>;

/// The canonical decoded representation of one raw record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub source_id: String,
    pub chain_type: String,
    pub position: Position,
    /// Dotted event type, e.g. `"evm.erc20.transfer"`.
    pub event_type: String,
    pub payload: EventPayload,
    /// Idempotency key; a pure function of `(source_id, position)`.
    pub dedup_key: String,
    pub ingested_at: DateTime<Utc>,
}

impl NormalizedEvent {
    /// Build an event, deriving the dedup key from `(source_id, position)`.
    pub fn new(
        source_id: impl Into<String>,
        chain_type: impl Into<String>,
        position: Position,
        event_type: impl Into<String>,
        payload: EventPayload,
        ingested_at: DateTime<Utc>,
    ) -> Self {
        let source_id = source_id.into();
        let dedup_key = dedup_key(&source_id, position);
        Self {
            source_id,
            chain_type: chain_type.into(),
            position,
            event_type: event_type.into(),
            payload,
            dedup_key,
            ingested_at,
        }
    }
}

/// `hex(sha256(source_id || 0x00 || sequence_be || index_be))`.
pub fn dedup_key(source_id: &str, position: Position) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(position.sequence.to_be_bytes());
    hasher.update(position.index.to_be_bytes());
    hex::encode(hasher.finalize())
}

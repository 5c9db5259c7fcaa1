//! `CosmosEventDecoder`: decodes one flattened ABCI event.
//!
//! ## Record format
//! ```json
//! {"height": "1200", "tx_hash": "AB12..", "tx_index": 0, "event_index": 3,
//!  "type": "wasm", "attributes": [{"key": "action", "value": "transfer"}]}
//! ```
//! `attributes` may also be a plain object. When `base64` is `true`, keys
//! and values are base64-encoded (CometBFT 0.34 and older).
//!
//! CosmWasm contracts emit a `wasm` event whose `action` attribute names the
//! operation; those become `cosmos.wasm.<action>`, everything else
//! `cosmos.<type>`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chainpipe_core::{DecodeContext, DecodeError, Decoder, EventPayload, NormalizedEvent, Position};
use serde_json::{json, Map, Value};

pub const CHAIN_TYPE: &str = "cosmos";

#[derive(Debug, Default, Clone)]
pub struct CosmosEventDecoder;

impl CosmosEventDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for CosmosEventDecoder {
    fn decode(&self, ctx: &DecodeContext<'_>, payload: &[u8]) -> Result<NormalizedEvent, DecodeError> {
        let record: Value = serde_json::from_slice(payload)?;

        let height = record
            .get("height")
            .ok_or_else(|| DecodeError::missing("height"))?;
        let height = parse_u64(height).ok_or_else(|| DecodeError::failed("invalid height"))?;
        let event_index = record
            .get("event_index")
            .ok_or_else(|| DecodeError::missing("event_index"))?;
        let event_index = parse_u64(event_index)
            .and_then(|i| u32::try_from(i).ok())
            .ok_or_else(|| DecodeError::failed("invalid event_index"))?;
        let kind = record
            .get("type")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| DecodeError::missing("type"))?;

        let base64 = record.get("base64").and_then(Value::as_bool).unwrap_or(false);
        let attributes = match record.get("attributes") {
            Some(attrs) => parse_attributes(attrs, base64)?,
            None => Map::new(),
        };

        let event_type = match (kind, attributes.get("action").and_then(Value::as_str)) {
            ("wasm", Some(action)) if !action.is_empty() => format!("cosmos.wasm.{action}"),
            _ => format!("cosmos.{kind}"),
        };

        let mut payload = EventPayload::new();
        payload.insert("height".into(), json!(height));
        if let Some(tx_hash) = record.get("tx_hash").and_then(Value::as_str) {
            payload.insert("tx_hash".into(), json!(tx_hash));
        }
        if let Some(tx_index) = record.get("tx_index").and_then(parse_u64) {
            payload.insert("tx_index".into(), json!(tx_index));
        }
        payload.insert("type".into(), json!(kind));
        if let Some(contract) = attributes.get("_contract_address") {
            payload.insert("contract".into(), contract.clone());
        }
        payload.insert("attributes".into(), Value::Object(attributes));

        Ok(NormalizedEvent::new(
            ctx.source_id,
            ctx.chain_type,
            Position::new(height, event_index),
            event_type,
            payload,
            ctx.received_at,
        ))
    }
}

fn parse_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

// ─── Attribute parsing ────────────────────────────────────────────────────────

/// Parse ABCI attributes into a name→value map.
///
/// Accepts two formats:
/// 1. Array of `{"key": "...", "value": "..."}` objects (standard ABCI JSON)
/// 2. Object map `{"fieldName": "value"}`
///
/// Repeated keys keep the last value.
pub fn parse_attributes(attrs: &Value, base64: bool) -> Result<Map<String, Value>, DecodeError> {
    let text = |v: &Value| -> Result<String, DecodeError> {
        let s = match v {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        if base64 {
            let bytes = STANDARD
                .decode(s.as_bytes())
                .map_err(|e| DecodeError::failed(format!("invalid base64 attribute: {e}")))?;
            String::from_utf8(bytes).map_err(|_| DecodeError::failed("attribute is not UTF-8"))
        } else {
            Ok(s)
        }
    };

    let mut map = Map::new();
    match attrs {
        Value::Array(items) => {
            for item in items {
                let key = item
                    .get("key")
                    .ok_or_else(|| DecodeError::failed("missing 'key' in attribute"))?;
                let value = item.get("value").unwrap_or(&Value::Null);
                map.insert(text(key)?, Value::String(text(value)?));
            }
        }
        Value::Object(obj) => {
            for (k, v) in obj {
                let key = if base64 { text(&Value::String(k.clone()))? } else { k.clone() };
                map.insert(key, Value::String(text(v)?));
            }
        }
        _ => return Err(DecodeError::failed("attributes must be a JSON array or object")),
    }
    Ok(map)
}

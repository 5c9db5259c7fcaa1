//! `SolanaLogsDecoder`: decodes one transaction's log messages.
//!
//! Input is the `value` of a `logsNotification` annotated with its slot and
//! its index within the slot:
//! ```json
//! {"slot": 250000000, "index": 4, "signature": "5h..", "err": null,
//!  "logs": ["Program TokenkegQ.. invoke [1]", "Program log: Instruction: Transfer", ..]}
//! ```
//!
//! Anchor programs emit events as `Program data: <base64>` lines; the first
//! 8 bytes are the event discriminator (`sha256("event:<Name>")[..8]`).

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chainpipe_core::{DecodeContext, DecodeError, Decoder, EventPayload, NormalizedEvent, Position};
use serde_json::{json, Value};

pub const CHAIN_TYPE: &str = "solana";

const INSTRUCTION_PREFIX: &str = "Program log: Instruction: ";
const DATA_PREFIX: &str = "Program data: ";

#[derive(Debug, Default, Clone)]
pub struct SolanaLogsDecoder;

impl SolanaLogsDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for SolanaLogsDecoder {
    fn decode(&self, ctx: &DecodeContext<'_>, payload: &[u8]) -> Result<NormalizedEvent, DecodeError> {
        let record: Value = serde_json::from_slice(payload)?;
        let slot = record
            .get("slot")
            .ok_or_else(|| DecodeError::missing("slot"))?
            .as_u64()
            .ok_or_else(|| DecodeError::failed("invalid slot"))?;
        let index = record
            .get("index")
            .ok_or_else(|| DecodeError::missing("index"))?
            .as_u64()
            .and_then(|i| u32::try_from(i).ok())
            .ok_or_else(|| DecodeError::failed("invalid index"))?;
        let logs: Vec<&str> = record
            .get("logs")
            .and_then(Value::as_array)
            .ok_or_else(|| DecodeError::missing("logs"))?
            .iter()
            .filter_map(Value::as_str)
            .collect();
        let err = record.get("err").cloned().unwrap_or(Value::Null);

        let summary = summarize(&logs);
        let event_type = if !err.is_null() {
            "solana.tx_failed".to_string()
        } else if let Some(first) = summary.instructions.first() {
            format!("solana.instruction.{first}")
        } else {
            "solana.logs".to_string()
        };

        let mut payload = EventPayload::new();
        if let Some(sig) = record.get("signature").and_then(Value::as_str) {
            payload.insert("signature".into(), json!(sig));
        }
        payload.insert("slot".into(), json!(slot));
        payload.insert("err".into(), err);
        payload.insert("programs".into(), json!(summary.programs));
        payload.insert("instructions".into(), json!(summary.instructions));
        if !summary.program_data.is_empty() {
            payload.insert("program_data".into(), Value::Array(summary.program_data));
        }
        payload.insert("logs".into(), json!(logs));

        Ok(NormalizedEvent::new(
            ctx.source_id,
            ctx.chain_type,
            Position::new(slot, index),
            event_type,
            payload,
            ctx.received_at,
        ))
    }
}

#[derive(Debug, Default)]
struct LogSummary {
    /// Invoked program ids, first-seen order.
    programs: Vec<String>,
    instructions: Vec<String>,
    program_data: Vec<Value>,
}

fn summarize(logs: &[&str]) -> LogSummary {
    let mut summary = LogSummary::default();
    for line in logs {
        if let Some(name) = line.strip_prefix(INSTRUCTION_PREFIX) {
            let name = name.trim();
            if !name.is_empty() {
                summary.instructions.push(name.to_string());
            }
        } else if let Some(data) = line.strip_prefix(DATA_PREFIX) {
            summary.program_data.push(program_data(data.trim()));
        } else if let Some(rest) = line.strip_prefix("Program ") {
            let mut parts = rest.split_whitespace();
            if let (Some(program), Some("invoke")) = (parts.next(), parts.next()) {
                if !summary.programs.iter().any(|p| p == program) {
                    summary.programs.push(program.to_string());
                }
            }
        }
    }
    summary
}

fn program_data(encoded: &str) -> Value {
    match STANDARD.decode(encoded) {
        Ok(bytes) if bytes.len() >= 8 => json!({
            "discriminator": hex::encode(&bytes[..8]),
            "data": encoded,
        }),
        _ => json!({ "data": encoded }),
    }
}

//! `EvmLogDecoder`: decodes one EVM log into a [`NormalizedEvent`].
//!
//! Accepts a bare log object (as returned by `eth_getLogs`) or a whole
//! `eth_subscription` notification. ERC-20 `Transfer` / `Approval` and
//! ERC-721 `Transfer` are decoded into named fields; every other log is
//! emitted as `evm.log` with its raw topics and data.

use alloy_primitives::{Address, B256, U256};
use chainpipe_core::{DecodeContext, DecodeError, Decoder, EventPayload, NormalizedEvent, Position};
use serde_json::{json, Value};

use crate::quantity::parse_quantity;
use crate::topics::{approval_topic, transfer_topic};

pub const CHAIN_TYPE: &str = "evm";

#[derive(Debug, Default, Clone)]
pub struct EvmLogDecoder;

impl EvmLogDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for EvmLogDecoder {
    fn decode(&self, ctx: &DecodeContext<'_>, payload: &[u8]) -> Result<NormalizedEvent, DecodeError> {
        let value: Value = serde_json::from_slice(payload)?;
        let log = match subscription_result(&value) {
            Some(result) => result,
            None => &value,
        };
        if !log.is_object() {
            return Err(DecodeError::failed("log must be a JSON object"));
        }

        if log.get("removed").and_then(Value::as_bool).unwrap_or(false) {
            return Err(DecodeError::Ignored {
                reason: "log removed by reorg".into(),
            });
        }

        let position = log_position(log)?;
        let contract = parse_address(required_str(log, "address")?, "address")?;
        let topics = parse_topics(log)?;
        let data = parse_data(log)?;

        let mut payload = EventPayload::new();
        payload.insert("contract".into(), json!(contract.to_checksum(None)));
        payload.insert("block_number".into(), json!(position.sequence));
        payload.insert("log_index".into(), json!(position.index));
        if let Some(tx) = log.get("transactionHash").and_then(Value::as_str) {
            payload.insert("tx_hash".into(), json!(tx));
        }
        if let Some(block_hash) = log.get("blockHash").and_then(Value::as_str) {
            payload.insert("block_hash".into(), json!(block_hash));
        }

        let event_type = decode_known(&topics, &data, &mut payload)?.unwrap_or_else(|| {
            payload.insert(
                "topics".into(),
                json!(topics.iter().map(|t| format!("{t:#x}")).collect::<Vec<_>>()),
            );
            payload.insert("data".into(), json!(format!("0x{}", hex::encode(&data))));
            "evm.log"
        });

        Ok(NormalizedEvent::new(
            ctx.source_id,
            ctx.chain_type,
            position,
            event_type,
            payload,
            ctx.received_at,
        ))
    }
}

/// `params.result` of an `eth_subscription` notification, if `value` is one.
fn subscription_result(value: &Value) -> Option<&Value> {
    if value.get("method")?.as_str()? != "eth_subscription" {
        return None;
    }
    value.get("params")?.get("result")
}

/// `(blockNumber, logIndex)` of a log object.
pub fn log_position(log: &Value) -> Result<Position, DecodeError> {
    let block = log
        .get("blockNumber")
        .ok_or_else(|| DecodeError::missing("blockNumber"))?;
    let block = parse_quantity(block).ok_or_else(|| DecodeError::failed("invalid blockNumber"))?;
    let index = log
        .get("logIndex")
        .ok_or_else(|| DecodeError::missing("logIndex"))?;
    let index = parse_quantity(index)
        .and_then(|i| u32::try_from(i).ok())
        .ok_or_else(|| DecodeError::failed("invalid logIndex"))?;
    Ok(Position::new(block, index))
}

fn required_str<'a>(log: &'a Value, field: &str) -> Result<&'a str, DecodeError> {
    log.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| DecodeError::missing(field))
}

fn parse_address(s: &str, field: &str) -> Result<Address, DecodeError> {
    s.parse::<Address>()
        .map_err(|e| DecodeError::failed(format!("invalid {field} {s:?}: {e}")))
}

fn parse_topics(log: &Value) -> Result<Vec<B256>, DecodeError> {
    let topics = log
        .get("topics")
        .and_then(Value::as_array)
        .ok_or_else(|| DecodeError::missing("topics"))?;
    topics
        .iter()
        .map(|t| {
            t.as_str()
                .and_then(|s| s.parse::<B256>().ok())
                .ok_or_else(|| DecodeError::failed(format!("invalid topic {t}")))
        })
        .collect()
}

fn parse_data(log: &Value) -> Result<Vec<u8>, DecodeError> {
    let data = log.get("data").and_then(Value::as_str).unwrap_or("0x");
    hex::decode(data.strip_prefix("0x").unwrap_or(data))
        .map_err(|e| DecodeError::failed(format!("invalid data hex: {e}")))
}

fn word_address(topic: &B256) -> String {
    Address::from_word(*topic).to_checksum(None)
}

fn word_uint(word: &[u8]) -> String {
    U256::from_be_slice(word).to_string()
}

/// Decode well-known events into `payload`. Returns `None` for unknown logs.
fn decode_known(
    topics: &[B256],
    data: &[u8],
    payload: &mut EventPayload,
) -> Result<Option<&'static str>, DecodeError> {
    let Some(topic0) = topics.first() else {
        return Ok(None);
    };

    if *topic0 == transfer_topic() {
        match (topics.len(), data.len()) {
            // ERC-20: value in data
            (3, 32) => {
                payload.insert("from".into(), json!(word_address(&topics[1])));
                payload.insert("to".into(), json!(word_address(&topics[2])));
                payload.insert("value".into(), json!(word_uint(data)));
                return Ok(Some("evm.erc20.transfer"));
            }
            // ERC-721: token id indexed
            (4, 0) => {
                payload.insert("from".into(), json!(word_address(&topics[1])));
                payload.insert("to".into(), json!(word_address(&topics[2])));
                payload.insert("token_id".into(), json!(word_uint(topics[3].as_slice())));
                return Ok(Some("evm.erc721.transfer"));
            }
            (3, _) => return Err(DecodeError::failed("Transfer data must be one 32-byte word")),
            _ => return Ok(None),
        }
    }

    if *topic0 == approval_topic() && topics.len() == 3 {
        if data.len() != 32 {
            return Err(DecodeError::failed("Approval data must be one 32-byte word"));
        }
        payload.insert("owner".into(), json!(word_address(&topics[1])));
        payload.insert("spender".into(), json!(word_address(&topics[2])));
        payload.insert("value".into(), json!(word_uint(data)));
        return Ok(Some("evm.erc20.approval"));
    }

    Ok(None)
}

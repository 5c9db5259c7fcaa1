//! The `Decoder` trait and the chain-type → decoder registry.
//!
//! Decoders are registered once at bootstrap, including decoders contributed
//! by third-party crates for new chain types. There is no runtime code
//! loading: the registry is a plain map of `Arc<dyn Decoder>`.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::DecodeError;
use crate::event::{NormalizedEvent, RawRecord};

/// Context passed to every decode call.
#[derive(Debug, Clone)]
pub struct DecodeContext<'a> {
    pub source_id: &'a str,
    pub chain_type: &'a str,
    /// Receive time of the raw record; becomes `ingested_at`.
    pub received_at: DateTime<Utc>,
}

impl<'a> DecodeContext<'a> {
    pub fn new(source_id: &'a str, chain_type: &'a str, received_at: DateTime<Utc>) -> Self {
        Self {
            source_id,
            chain_type,
            received_at,
        }
    }
}

/// Turns one chain-native record into a [`NormalizedEvent`].
///
/// Implementations must be deterministic: decoding the same payload for the
/// same source always yields the same position and therefore the same
/// dedup key.
pub trait Decoder: Send + Sync {
    fn decode(&self, ctx: &DecodeContext<'_>, payload: &[u8]) -> Result<NormalizedEvent, DecodeError>;
}

/// Closures can be registered directly.
impl<F> Decoder for F
where
    F: Fn(&DecodeContext<'_>, &[u8]) -> Result<NormalizedEvent, DecodeError> + Send + Sync,
{
    fn decode(&self, ctx: &DecodeContext<'_>, payload: &[u8]) -> Result<NormalizedEvent, DecodeError> {
        self(ctx, payload)
    }
}

/// Map from chain type to decoder.
#[derive(Clone, Default)]
pub struct DecoderRegistry {
    decoders: BTreeMap<String, Arc<dyn Decoder>>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `decoder` for `chain_type`, replacing any previous one.
    pub fn register(&mut self, chain_type: impl Into<String>, decoder: Arc<dyn Decoder>) -> &mut Self {
        let chain_type = chain_type.into();
        if self.decoders.insert(chain_type.clone(), decoder).is_some() {
            tracing::warn!(%chain_type, "decoder replaced");
        }
        self
    }

    pub fn get(&self, chain_type: &str) -> Option<Arc<dyn Decoder>> {
        self.decoders.get(chain_type).cloned()
    }

    pub fn contains(&self, chain_type: &str) -> bool {
        self.decoders.contains_key(chain_type)
    }

    pub fn chain_types(&self) -> impl Iterator<Item = &str> {
        self.decoders.keys().map(String::as_str)
    }

    /// Decode `raw` with the decoder registered for `chain_type`.
    pub fn decode(
        &self,
        source_id: &str,
        chain_type: &str,
        raw: &RawRecord,
    ) -> Result<NormalizedEvent, DecodeError> {
        let decoder = self
            .decoders
            .get(chain_type)
            .ok_or_else(|| DecodeError::UnknownDecoder {
                chain_type: chain_type.to_string(),
            })?;
        let ctx = DecodeContext::new(source_id, chain_type, raw.received_at);
        decoder.decode(&ctx, &raw.payload)
    }
}

impl std::fmt::Debug for DecoderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderRegistry")
            .field("chain_types", &self.decoders.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventPayload, Position};

    fn counter_decoder(ctx: &DecodeContext<'_>, payload: &[u8]) -> Result<NormalizedEvent, DecodeError> {
        let n: u64 = std::str::from_utf8(payload)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| DecodeError::failed("not a number"))?;
        Ok(NormalizedEvent::new(
            ctx.source_id,
            ctx.chain_type,
            Position::new(n, 0),
            "test.tick",
            EventPayload::new(),
            ctx.received_at,
        ))
    }

    #[test]
    fn closure_registration_and_decode() {
        let mut reg = DecoderRegistry::new();
        reg.register("ticker", Arc::new(counter_decoder));

        let event = reg.decode("src", "ticker", &RawRecord::new("42")).unwrap();
        assert_eq!(event.position, Position::new(42, 0));
        assert_eq!(event.source_id, "src");
    }

    #[test]
    fn unknown_chain_type() {
        let reg = DecoderRegistry::new();
        let err = reg.decode("src", "unknown-vm", &RawRecord::new("1")).unwrap_err();
        assert_eq!(
            err,
            DecodeError::UnknownDecoder {
                chain_type: "unknown-vm".into()
            }
        );
    }

    #[test]
    fn malformed_record_is_decode_failed() {
        let mut reg = DecoderRegistry::new();
        reg.register("ticker", Arc::new(counter_decoder));
        let err = reg.decode("src", "ticker", &RawRecord::new("nope")).unwrap_err();
        assert!(err.is_failure());
    }

    #[test]
    fn same_record_twice_same_key() {
        let mut reg = DecoderRegistry::new();
        reg.register("ticker", Arc::new(counter_decoder));
        let raw = RawRecord::new("7");
        let a = reg.decode("src", "ticker", &raw).unwrap();
        let b = reg.decode("src", "ticker", &RawRecord::new("7")).unwrap();
        assert_eq!(a.dedup_key, b.dedup_key);
    }
}

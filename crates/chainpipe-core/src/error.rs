//! Error taxonomy for the chainpipe pipeline.
//!
//! Every class maps to one isolation policy: per-source errors stay inside
//! the owning worker, only [`PipelineError`] can stop the process.

use thiserror::Error;

/// A source definition could not be parsed or validated.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid source definition '{id}': {reason}")]
    Parse { id: String, reason: String },

    #[error("source key '{key}' holds a definition for id '{id}'")]
    IdMismatch { key: String, id: String },

    #[error("invalid field '{field}' in source '{id}': {reason}")]
    InvalidField {
        id: String,
        field: &'static str,
        reason: String,
    },

    #[error("credential reference '{reference}' could not be resolved: {reason}")]
    Credential { reference: String, reason: String },
}

/// Failure to open or keep a connection to a source endpoint.
#[derive(Debug, Error, Clone)]
pub enum ConnectError {
    #[error("connection to {endpoint} failed: {reason}")]
    Failed { endpoint: String, reason: String },

    #[error("connection to {endpoint} closed")]
    Closed { endpoint: String },

    #[error("endpoint {endpoint} returned an RPC error: {message}")]
    Rpc { endpoint: String, message: String },

    #[error("timed out after {ms}ms waiting for {endpoint}")]
    Timeout { endpoint: String, ms: u64 },

    #[error("no connector for chain type '{chain_type}'")]
    NoConnector { chain_type: String },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors produced while turning one raw record into a [`NormalizedEvent`].
///
/// [`NormalizedEvent`]: crate::event::NormalizedEvent
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("no decoder registered for chain type '{chain_type}'")]
    UnknownDecoder { chain_type: String },

    #[error("decode failed: {reason}")]
    DecodeFailed { reason: String },

    #[error("missing required field: {field}")]
    MissingField { field: String },

    /// A well-formed record that carries no event (e.g. a reorged log).
    #[error("record ignored: {reason}")]
    Ignored { reason: String },
}

impl DecodeError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::DecodeFailed {
            reason: reason.into(),
        }
    }

    pub fn missing(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    /// `true` for errors that should be counted as decode failures.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::DecodeFailed { .. } | Self::MissingField { .. })
    }
}

impl From<serde_json::Error> for DecodeError {
    fn from(e: serde_json::Error) -> Self {
        Self::failed(format!("invalid JSON: {e}"))
    }
}

/// The external dedup cache could not be reached.
#[derive(Debug, Error, Clone)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    #[error("cache backend error: {0}")]
    Backend(String),
}

/// The bus rejected or could not receive a message.
#[derive(Debug, Error, Clone)]
pub enum PublishError {
    #[error("bus unreachable: {0}")]
    Unreachable(String),

    #[error("bus rejected message for topic {topic}: {reason}")]
    Rejected { topic: String, reason: String },

    #[error("failed to encode event: {0}")]
    Encode(String),

    #[error("publisher lane for '{source_id}' is closed")]
    Closed { source_id: String },
}

impl PublishError {
    /// Transient errors are retried by the publisher lane.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Rejected { .. })
    }
}

/// Errors from the source registry backing store.
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("registry unavailable: {0}")]
    Unavailable(String),

    #[error("watch lagged behind by {missed} changes")]
    Lagged { missed: u64 },

    #[error("registry watch closed")]
    Closed,
}

/// Errors from checkpoint persistence.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt checkpoint for '{source_id}': {reason}")]
    Corrupt { source_id: String, reason: String },
}

/// Process-level failures. Only these terminate the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("registry unreachable during bootstrap: {0}")]
    Registry(#[source] StoreError),

    #[error("bus unreachable during bootstrap: {0}")]
    Bus(#[source] PublishError),

    #[error("cache unreachable during bootstrap: {0}")]
    Cache(#[source] CacheError),

    #[error("checkpoint store unavailable: {0}")]
    Checkpoint(#[source] CheckpointError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_error_classification() {
        assert!(DecodeError::failed("bad").is_failure());
        assert!(DecodeError::missing("topics").is_failure());
        assert!(!DecodeError::Ignored {
            reason: "removed".into()
        }
        .is_failure());
        assert!(!DecodeError::UnknownDecoder {
            chain_type: "x".into()
        }
        .is_failure());
    }

    #[test]
    fn publish_error_retryable() {
        assert!(PublishError::Unreachable("down".into()).is_retryable());
        assert!(!PublishError::Encode("nan".into()).is_retryable());
        assert!(!PublishError::Closed {
            source_id: "a".into()
        }
        .is_retryable());
    }
}

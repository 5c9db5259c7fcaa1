//! `SourceConnector`: abstraction over a source's long-lived connection.
//!
//! Each chain family provides a connector that yields [`RawRecord`]s. The
//! worker owns one connection at a time and reconnects through the same
//! trait after a failure.

use async_trait::async_trait;
use futures::Stream;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::ConnectError;
use crate::event::{Position, RawRecord};
use crate::source::SourceConfig;

/// A stream of raw records from one connection. Ends (or yields an error)
/// when the connection is lost.
pub type RawRecordStream = Pin<Box<dyn Stream<Item = Result<RawRecord, ConnectError>> + Send>>;

/// Opens connections for one chain type.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Connect and start streaming.
    ///
    /// `resume_after` is the last position already processed; connectors that
    /// can replay history should start strictly after it. `cancel` ends the
    /// stream and closes the connection.
    async fn connect(
        &self,
        source: &SourceConfig,
        resume_after: Option<Position>,
        cancel: CancellationToken,
    ) -> Result<RawRecordStream, ConnectError>;
}

/// Map from chain type to connector, with an optional fallback for chain
/// types that only register a decoder.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    connectors: BTreeMap<String, Arc<dyn SourceConnector>>,
    fallback: Option<Arc<dyn SourceConnector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        chain_type: impl Into<String>,
        connector: Arc<dyn SourceConnector>,
    ) -> &mut Self {
        self.connectors.insert(chain_type.into(), connector);
        self
    }

    pub fn with_fallback(&mut self, connector: Arc<dyn SourceConnector>) -> &mut Self {
        self.fallback = Some(connector);
        self
    }

    pub fn get(&self, chain_type: &str) -> Result<Arc<dyn SourceConnector>, ConnectError> {
        self.connectors
            .get(chain_type)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| ConnectError::NoConnector {
                chain_type: chain_type.to_string(),
            })
    }

    pub fn chain_types(&self) -> impl Iterator<Item = &str> {
        self.connectors.keys().map(String::as_str)
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }
}

impl std::fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorRegistry")
            .field("chain_types", &self.connectors.keys().collect::<Vec<_>>())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

//! Dependencies shared by every worker.

use std::sync::Arc;

use chainpipe_bus::Publisher;
use chainpipe_core::{CheckpointStore, ConnectorRegistry, DecoderRegistry, DedupCache};
use chainpipe_observability::PipelineMetrics;

/// Everything a worker needs besides its own source definition.
///
/// Built once at bootstrap; cloning only bumps reference counts.
#[derive(Clone)]
pub struct PipelineContext {
    pub decoders: Arc<DecoderRegistry>,
    pub connectors: Arc<ConnectorRegistry>,
    pub publisher: Publisher,
    pub dedup: DedupCache,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub metrics: PipelineMetrics,
}

impl PipelineContext {
    pub fn new(
        decoders: DecoderRegistry,
        connectors: ConnectorRegistry,
        publisher: Publisher,
        dedup: DedupCache,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            decoders: Arc::new(decoders),
            connectors: Arc::new(connectors),
            publisher,
            dedup,
            checkpoints,
            metrics: PipelineMetrics::global(),
        }
    }

    pub fn with_metrics(mut self, metrics: PipelineMetrics) -> Self {
        self.metrics = metrics;
        self
    }
}

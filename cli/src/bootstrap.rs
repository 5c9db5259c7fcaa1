//! Builds the pipeline from an [`AppConfig`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chainpipe_bus::{JsonlFileBus, MemoryBus, Publisher};
use chainpipe_core::{
    CheckpointStore, ConfigStore, ConnectorRegistry, DecoderRegistry, DedupCache, EventBus,
    KvCache, MemoryCheckpointStore, PipelineError,
};
use chainpipe_cosmos::{CometWsConnector, CosmosEventDecoder};
use chainpipe_evm::{EvmLogDecoder, EvmWsConnector};
use chainpipe_registry::DirectoryConfigStore;
use chainpipe_runtime::{PipelineContext, Supervisor};
use chainpipe_solana::{SolanaLogsDecoder, SolanaWsConnector};
use chainpipe_storage::{FileCheckpointStore, MemoryCache};
use chainpipe_stream::JsonLinesWsConnector;
use tracing::info;

use crate::config::{AppConfig, BusKind, CacheKind, CheckpointKind};

/// Every built-in decoder, keyed by chain type.
pub fn decoders() -> DecoderRegistry {
    let mut registry = DecoderRegistry::new();
    registry
        .register(chainpipe_evm::CHAIN_TYPE, Arc::new(EvmLogDecoder::new()))
        .register(chainpipe_cosmos::CHAIN_TYPE, Arc::new(CosmosEventDecoder::new()))
        .register(chainpipe_solana::CHAIN_TYPE, Arc::new(SolanaLogsDecoder::new()));
    registry
}

/// Dedicated connectors per chain type, JSON-lines WebSocket for the rest.
pub fn connectors(config: &AppConfig) -> ConnectorRegistry {
    let session = config.session_config();
    let evm = EvmWsConnector::new(session)
        .with_backfill_batch(config.connectors.evm_backfill_batch);

    let mut registry = ConnectorRegistry::new();
    registry
        .register(chainpipe_evm::CHAIN_TYPE, Arc::new(evm))
        .register(chainpipe_cosmos::CHAIN_TYPE, Arc::new(CometWsConnector::new(session)))
        .register(chainpipe_solana::CHAIN_TYPE, Arc::new(SolanaWsConnector::new(session)))
        .with_fallback(Arc::new(JsonLinesWsConnector::new(session)));
    registry
}

pub fn registry(config: &AppConfig) -> Arc<dyn ConfigStore> {
    Arc::new(DirectoryConfigStore::new(
        &config.registry.path,
        Duration::from_millis(config.registry.poll_interval_ms),
    ))
}

pub async fn bus(config: &AppConfig) -> Result<Arc<dyn EventBus>> {
    let bus: Arc<dyn EventBus> = match config.bus.kind {
        BusKind::Memory => Arc::new(MemoryBus::new()),
        BusKind::Jsonl => Arc::new(
            JsonlFileBus::open(&config.bus.dir)
                .await
                .with_context(|| format!("opening jsonl bus in {}", config.bus.dir.display()))?,
        ),
        BusKind::Kafka => kafka_bus(config)?,
    };
    Ok(bus)
}

#[cfg(feature = "kafka")]
fn kafka_bus(config: &AppConfig) -> Result<Arc<dyn EventBus>> {
    let Some(kafka) = config.bus.kafka.clone() else {
        bail!("bus.kind is kafka but bus.kafka is not configured");
    };
    Ok(Arc::new(
        chainpipe_bus::KafkaBus::new(kafka).context("creating kafka producer")?,
    ))
}

#[cfg(not(feature = "kafka"))]
fn kafka_bus(_config: &AppConfig) -> Result<Arc<dyn EventBus>> {
    bail!("bus.kind is kafka but chainpipe was built without the `kafka` feature")
}

/// The dedup cache backend and the checkpoint store.
///
/// When both use SQLite with the same file they share one connection pool.
pub async fn storage(config: &AppConfig) -> Result<(Arc<dyn KvCache>, Arc<dyn CheckpointStore>)> {
    #[cfg(feature = "sqlite")]
    let mut shared: Option<(std::path::PathBuf, chainpipe_storage::SqliteStorage)> = None;

    let cache: Arc<dyn KvCache> = match config.cache.kind {
        CacheKind::Memory => Arc::new(MemoryCache::with_capacity(config.cache.capacity)),
        #[cfg(feature = "sqlite")]
        CacheKind::Sqlite => {
            let db = open_sqlite(&config.cache.path).await?;
            shared = Some((config.cache.path.clone(), db.clone()));
            Arc::new(db)
        }
        #[cfg(not(feature = "sqlite"))]
        CacheKind::Sqlite => bail!("cache.kind is sqlite but chainpipe was built without the `sqlite` feature"),
    };

    let checkpoints: Arc<dyn CheckpointStore> = match config.checkpoints.kind {
        CheckpointKind::Memory => Arc::new(MemoryCheckpointStore::new()),
        CheckpointKind::File => Arc::new(
            FileCheckpointStore::open(&config.checkpoints.path)
                .await
                .with_context(|| {
                    format!("opening checkpoint directory {}", config.checkpoints.path.display())
                })?,
        ),
        #[cfg(feature = "sqlite")]
        CheckpointKind::Sqlite => match shared {
            Some((path, db)) if path == config.checkpoints.path => Arc::new(db),
            _ => Arc::new(open_sqlite(&config.checkpoints.path).await?),
        },
        #[cfg(not(feature = "sqlite"))]
        CheckpointKind::Sqlite => {
            bail!("checkpoints.kind is sqlite but chainpipe was built without the `sqlite` feature")
        }
    };

    Ok((cache, checkpoints))
}

#[cfg(feature = "sqlite")]
async fn open_sqlite(path: &std::path::Path) -> Result<chainpipe_storage::SqliteStorage> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let display = path.display().to_string();
    chainpipe_storage::SqliteStorage::open(&display)
        .await
        .with_context(|| format!("opening sqlite database {display}"))
}

/// A supervisor ready to run.
pub struct Pipeline {
    pub supervisor: Supervisor,
    pub bus: Arc<dyn EventBus>,
}

/// Open every backend and verify the bus and cache answer.
///
/// The registry is checked by [`Supervisor::run`], which fails if it cannot
/// list the sources.
pub async fn pipeline(config: &AppConfig) -> Result<Pipeline> {
    let store = registry(config);
    let bus = bus(config).await?;
    bus.ping()
        .await
        .map_err(PipelineError::Bus)
        .with_context(|| format!("bus '{}'", bus.name()))?;

    let (cache, checkpoints) = storage(config).await?;
    cache.ping().await.map_err(PipelineError::Cache)?;

    let dedup = DedupCache::new(cache.clone(), Duration::from_secs(config.cache.dedup_ttl_secs));
    let publisher = Publisher::new(bus.clone(), config.publisher_config());
    let ctx = PipelineContext::new(decoders(), connectors(config), publisher, dedup, checkpoints);

    info!(
        registry = %config.registry.path.display(),
        bus = bus.name(),
        cache = ?config.cache.kind,
        checkpoints = ?config.checkpoints.kind,
        "pipeline assembled"
    );
    let supervisor = Supervisor::new(store, ctx, config.supervisor_config());
    Ok(Pipeline { supervisor, bus })
}

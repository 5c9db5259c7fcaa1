//! In-memory fleet used by the runtime integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chainpipe_bus::{MemoryBus, Publisher, PublisherConfig};
use chainpipe_core::{
    BackoffConfig, CheckpointCadence, ConnectorRegistry, DecodeContext, DecodeError,
    DecoderRegistry, DedupCache, EventPayload, MemoryCheckpointStore, NormalizedEvent,
    PipelineError, Position, RestartPolicy, SourceConfig, TopicTemplate,
};
use chainpipe_evm::EvmLogDecoder;
use chainpipe_registry::MemoryConfigStore;
use chainpipe_runtime::{PipelineContext, Supervisor, SupervisorConfig, SupervisorHandle, WorkerConfig};
use chainpipe_storage::MemoryCache;
use chainpipe_stream::ChannelConnector;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const WAIT: Duration = Duration::from_secs(5);

/// `{"seq": n, "idx": i}` → `test.tick` at `(n, i)`.
/// `{"panic": true}` panics; anything without `seq` is a decode error.
pub fn test_decoder(ctx: &DecodeContext<'_>, payload: &[u8]) -> Result<NormalizedEvent, DecodeError> {
    let value: serde_json::Value = serde_json::from_slice(payload)?;
    if value.get("panic").and_then(|v| v.as_bool()) == Some(true) {
        panic!("decoder exploded");
    }
    let seq = value
        .get("seq")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| DecodeError::missing("seq"))?;
    let idx = value.get("idx").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
    let mut body = EventPayload::new();
    body.insert("seq".into(), json!(seq));
    Ok(NormalizedEvent::new(
        ctx.source_id,
        ctx.chain_type,
        Position::new(seq, idx),
        "test.tick",
        body,
        ctx.received_at,
    ))
}

pub fn fast_retry() -> BackoffConfig {
    BackoffConfig {
        initial: Duration::from_millis(10),
        max: Duration::from_millis(40),
        multiplier: 2.0,
        jitter: 0.0,
    }
}

pub fn fast_config() -> SupervisorConfig {
    SupervisorConfig {
        restart: RestartPolicy {
            max_restarts: 5,
            window: Duration::from_secs(60),
        },
        stop_timeout: Duration::from_secs(2),
        shutdown_timeout: Duration::from_secs(3),
        watch_retry: fast_retry(),
        worker: WorkerConfig {
            retry: fast_retry(),
            stable_after: Duration::from_secs(30),
            checkpoint: CheckpointCadence {
                every_records: 1,
                every: Duration::from_millis(50),
            },
            heartbeat_interval: Duration::from_millis(20),
            drain_timeout: Duration::from_secs(1),
        },
    }
}

pub fn fast_publisher() -> PublisherConfig {
    PublisherConfig {
        buffer_capacity: 64,
        staleness: Duration::from_millis(100),
        retry: fast_retry(),
        topic: TopicTemplate::default(),
    }
}

pub fn source(id: &str, chain_type: &str) -> SourceConfig {
    SourceConfig::new(id, chain_type, "wss://node.example")
}

pub fn tick(seq: u64, idx: u32) -> serde_json::Value {
    json!({ "seq": seq, "idx": idx })
}

pub struct Harness {
    pub store: MemoryConfigStore,
    pub connector: ChannelConnector,
    pub bus: Arc<MemoryBus>,
    pub checkpoints: Arc<MemoryCheckpointStore>,
    pub cache: Arc<MemoryCache>,
    pub handle: SupervisorHandle,
    pub shutdown: CancellationToken,
    pub task: JoinHandle<Result<(), PipelineError>>,
}

pub struct Parts {
    pub store: MemoryConfigStore,
    pub connector: ChannelConnector,
    pub bus: Arc<MemoryBus>,
    pub checkpoints: Arc<MemoryCheckpointStore>,
    pub cache: Arc<MemoryCache>,
}

impl Default for Parts {
    fn default() -> Self {
        Self {
            store: MemoryConfigStore::new(),
            connector: ChannelConnector::new(),
            bus: Arc::new(MemoryBus::new()),
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
            cache: Arc::new(MemoryCache::new()),
        }
    }
}

impl Parts {
    pub fn supervisor(&self, config: SupervisorConfig) -> Supervisor {
        let ctx = self.context(fast_publisher());
        Supervisor::new(Arc::new(self.store.clone()), ctx, config)
    }

    pub fn context(&self, publisher: PublisherConfig) -> PipelineContext {
        let mut decoders = DecoderRegistry::new();
        decoders
            .register("test", Arc::new(test_decoder))
            .register(chainpipe_evm::CHAIN_TYPE, Arc::new(EvmLogDecoder::new()));

        let mut connectors = ConnectorRegistry::new();
        connectors.with_fallback(Arc::new(self.connector.clone()));

        let publisher = Publisher::new(self.bus.clone(), publisher);
        let dedup = DedupCache::new(self.cache.clone(), Duration::from_secs(3600));
        PipelineContext::new(decoders, connectors, publisher, dedup, self.checkpoints.clone())
    }

    pub fn start(self) -> Harness {
        self.start_with(fast_config())
    }

    pub fn start_with(self, config: SupervisorConfig) -> Harness {
        let supervisor = self.supervisor(config);
        let handle = supervisor.handle();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(supervisor.run(shutdown.clone()));
        Harness {
            store: self.store,
            connector: self.connector,
            bus: self.bus,
            checkpoints: self.checkpoints,
            cache: self.cache,
            handle,
            shutdown,
            task,
        }
    }
}

impl Harness {
    pub fn start() -> Self {
        Parts::default().start()
    }

    /// Shut the supervisor down and hand back the shared parts.
    pub async fn stop(self) -> Parts {
        self.shutdown.cancel();
        self.task.await.unwrap().unwrap();
        Parts {
            store: self.store,
            connector: self.connector,
            bus: self.bus,
            checkpoints: self.checkpoints,
            cache: self.cache,
        }
    }

    pub async fn running(&self, source_id: &str) {
        assert!(
            self.handle
                .wait_for_status(source_id, chainpipe_core::WorkerStatus::Running, WAIT)
                .await
                .is_some(),
            "{source_id} never reached running: {:?}",
            self.handle.state(source_id)
        );
        assert!(self.connector.wait_connected(source_id, WAIT).await);
    }
}

/// Poll `condition` until it holds or [`WAIT`] elapses.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn sequences(bus: &MemoryBus, source_id: &str) -> Vec<u64> {
    bus.events_for(source_id)
        .iter()
        .map(|e| e.position.sequence)
        .collect()
}

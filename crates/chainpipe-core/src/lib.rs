//! # chainpipe-core
//!
//! Core traits, types, and policies shared across all chainpipe crates.
//! Decoders, connectors, registry and bus backends, and the runtime are all
//! built on the interfaces defined here.

pub mod bus;
pub mod cache;
pub mod checkpoint;
pub mod config_store;
pub mod connector;
pub mod decoder;
pub mod error;
pub mod event;
pub mod policy;
pub mod source;
pub mod state;

pub use bus::{BusAck, BusMessage, EventBus, TopicTemplate, DEDUP_KEY_HEADER};
pub use cache::{DedupCache, KvCache};
pub use checkpoint::{
    Checkpoint, CheckpointCadence, CheckpointManager, CheckpointStore, MemoryCheckpointStore,
};
pub use config_store::{ConfigChange, ConfigStore, ConfigWatchStream, RegistryEntry, RegistrySnapshot};
pub use connector::{ConnectorRegistry, RawRecordStream, SourceConnector};
pub use decoder::{DecodeContext, Decoder, DecoderRegistry};
pub use error::{
    CacheError, CheckpointError, ConfigError, ConnectError, DecodeError, PipelineError,
    PublishError, StoreError,
};
pub use event::{dedup_key, EventPayload, NormalizedEvent, Position, RawRecord};
pub use policy::{Backoff, BackoffConfig, RestartPolicy, RestartWindow};
pub use source::{CredentialRef, SourceConfig};
pub use state::{HealthSnapshot, WorkerState, WorkerStatus};

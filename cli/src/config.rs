//! Bootstrap configuration.
//!
//! Read once at startup from YAML. Every section has defaults, so an empty
//! file (or no file at all) gives a local development setup: sources from
//! `./sources`, events appended under `./data/bus`, checkpoints and the dedup
//! cache in `./data/chainpipe.db`.
//!
//! Durations are plain integers with a `_ms` or `_secs` suffix.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chainpipe_bus::PublisherConfig;
use chainpipe_core::{BackoffConfig, CheckpointCadence, RestartPolicy, TopicTemplate};
use chainpipe_observability::LogConfig;
use chainpipe_runtime::{SupervisorConfig, WorkerConfig};
use chainpipe_stream::SessionConfig;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub registry: RegistrySection,
    pub bus: BusSection,
    pub cache: CacheSection,
    pub checkpoints: CheckpointSection,
    pub supervisor: SupervisorSection,
    pub worker: WorkerSection,
    pub publisher: PublisherSection,
    pub connectors: ConnectorSection,
    pub logging: LogConfig,
    pub health: HealthSection,
}

impl AppConfig {
    /// Load from `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("loading config file {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        // An empty document deserializes as unit, not as an empty map.
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(raw).context("invalid YAML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.publisher.buffer_capacity == 0 {
            bail!("publisher.buffer_capacity must be at least 1");
        }
        if self.supervisor.max_restarts == 0 {
            bail!("supervisor.max_restarts must be at least 1");
        }
        if self.cache.dedup_ttl_secs == 0 {
            bail!("cache.dedup_ttl_secs must be positive");
        }
        if self.connectors.backlog_limit == 0 {
            bail!("connectors.backlog_limit must be at least 1");
        }
        if self.worker.checkpoint_every_records == 0 {
            bail!("worker.checkpoint_every_records must be at least 1");
        }
        for (name, retry) in [
            ("worker.retry", &self.worker.retry),
            ("publisher.retry", &self.publisher.retry),
            ("supervisor.watch_retry", &self.supervisor.watch_retry),
        ] {
            if retry.multiplier < 1.0 {
                bail!("{name}.multiplier must be >= 1.0");
            }
            if !(0.0..=1.0).contains(&retry.jitter) {
                bail!("{name}.jitter must be within 0.0..=1.0");
            }
        }
        Ok(())
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            restart: RestartPolicy {
                max_restarts: self.supervisor.max_restarts,
                window: ms(self.supervisor.restart_window_ms),
            },
            stop_timeout: ms(self.supervisor.stop_timeout_ms),
            shutdown_timeout: ms(self.supervisor.shutdown_timeout_ms),
            watch_retry: self.supervisor.watch_retry.to_backoff(),
            worker: self.worker_config(),
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        let w = &self.worker;
        WorkerConfig {
            retry: w.retry.to_backoff(),
            stable_after: ms(w.stable_after_ms),
            checkpoint: CheckpointCadence {
                every_records: w.checkpoint_every_records,
                every: ms(w.checkpoint_interval_ms),
            },
            heartbeat_interval: ms(w.heartbeat_ms),
            drain_timeout: ms(w.drain_timeout_ms),
        }
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            buffer_capacity: self.publisher.buffer_capacity,
            staleness: ms(self.publisher.staleness_ms),
            retry: self.publisher.retry.to_backoff(),
            topic: TopicTemplate(self.bus.topic.clone()),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            connect_timeout: ms(self.connectors.connect_timeout_ms),
            request_timeout: ms(self.connectors.request_timeout_ms),
            backlog_limit: self.connectors.backlog_limit,
        }
    }
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

// ─── Sections ────────────────────────────────────────────────────────────────

/// Directory of source definitions, one file per source.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    pub path: PathBuf,
    pub poll_interval_ms: u64,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./sources"),
            poll_interval_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusKind {
    /// In-process only. Events are lost on exit.
    Memory,
    /// Append-only `<dir>/<topic>.jsonl` files.
    Jsonl,
    /// Requires the `kafka` feature.
    Kafka,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusSection {
    pub kind: BusKind,
    /// Topic template; `{chain_type}` and `{source_id}` are substituted.
    pub topic: String,
    /// Output directory for the `jsonl` bus.
    pub dir: PathBuf,
    #[cfg(feature = "kafka")]
    pub kafka: Option<chainpipe_bus::KafkaConfig>,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            kind: BusKind::Jsonl,
            topic: TopicTemplate::default().0,
            dir: PathBuf::from("./data/bus"),
            #[cfg(feature = "kafka")]
            kafka: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKind {
    Memory,
    /// Requires the `sqlite` feature.
    Sqlite,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub kind: CacheKind,
    /// Entry bound for the memory cache.
    pub capacity: usize,
    /// Database file for the sqlite cache.
    pub path: PathBuf,
    pub dedup_ttl_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            kind: if cfg!(feature = "sqlite") {
                CacheKind::Sqlite
            } else {
                CacheKind::Memory
            },
            capacity: 1_000_000,
            path: PathBuf::from("./data/chainpipe.db"),
            dedup_ttl_secs: 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    /// Not persisted across restarts.
    Memory,
    /// One JSON file per source under `path`.
    File,
    /// Requires the `sqlite` feature. `path` is the database file.
    Sqlite,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CheckpointSection {
    pub kind: CheckpointKind,
    pub path: PathBuf,
}

impl Default for CheckpointSection {
    fn default() -> Self {
        if cfg!(feature = "sqlite") {
            Self {
                kind: CheckpointKind::Sqlite,
                path: PathBuf::from("./data/chainpipe.db"),
            }
        } else {
            Self {
                kind: CheckpointKind::File,
                path: PathBuf::from("./data/checkpoints"),
            }
        }
    }
}

/// Backoff settings as they appear in YAML.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        let b = BackoffConfig::default();
        Self {
            initial_ms: b.initial.as_millis() as u64,
            max_ms: b.max.as_millis() as u64,
            multiplier: b.multiplier,
            jitter: b.jitter,
        }
    }
}

impl RetrySection {
    pub fn to_backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial: ms(self.initial_ms),
            max: ms(self.max_ms),
            multiplier: self.multiplier,
            jitter: self.jitter,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    /// Restarts tolerated within `restart_window_ms` before a source is
    /// marked failed.
    pub max_restarts: u32,
    pub restart_window_ms: u64,
    pub stop_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub watch_retry: RetrySection,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        let d = SupervisorConfig::default();
        Self {
            max_restarts: d.restart.max_restarts,
            restart_window_ms: d.restart.window.as_millis() as u64,
            stop_timeout_ms: d.stop_timeout.as_millis() as u64,
            shutdown_timeout_ms: d.shutdown_timeout.as_millis() as u64,
            watch_retry: RetrySection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub retry: RetrySection,
    /// A connection that lived this long resets the retry backoff.
    pub stable_after_ms: u64,
    pub checkpoint_every_records: u64,
    pub checkpoint_interval_ms: u64,
    pub heartbeat_ms: u64,
    pub drain_timeout_ms: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        let d = WorkerConfig::default();
        Self {
            retry: RetrySection::default(),
            stable_after_ms: d.stable_after.as_millis() as u64,
            checkpoint_every_records: d.checkpoint.every_records,
            checkpoint_interval_ms: d.checkpoint.every.as_millis() as u64,
            heartbeat_ms: d.heartbeat_interval.as_millis() as u64,
            drain_timeout_ms: d.drain_timeout.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublisherSection {
    /// Per-source buffer; a full buffer pauses that source's worker.
    pub buffer_capacity: usize,
    /// Undelivered for this long → the source is reported degraded.
    pub staleness_ms: u64,
    pub retry: RetrySection,
}

impl Default for PublisherSection {
    fn default() -> Self {
        let d = PublisherConfig::default();
        Self {
            buffer_capacity: d.buffer_capacity,
            staleness_ms: d.staleness.as_millis() as u64,
            retry: RetrySection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectorSection {
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// Notifications a session may queue while a request is in flight.
    pub backlog_limit: usize,
    /// Block span per `eth_getLogs` call while back-filling.
    pub evm_backfill_batch: u64,
}

impl Default for ConnectorSection {
    fn default() -> Self {
        let d = SessionConfig::default();
        Self {
            connect_timeout_ms: d.connect_timeout.as_millis() as u64,
            request_timeout_ms: d.request_timeout.as_millis() as u64,
            backlog_limit: d.backlog_limit,
            evm_backfill_batch: 1_000,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    /// Serve `/health/*` on this address; disabled when unset.
    pub listen: Option<SocketAddr>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        let config = AppConfig::from_yaml("").unwrap();
        assert_eq!(config.registry.path, PathBuf::from("./sources"));
        assert_eq!(config.bus.kind, BusKind::Jsonl);
        assert_eq!(config.bus.topic, "chainpipe.events.{chain_type}");
        assert!(config.health.listen.is_none());

        let sup = config.supervisor_config();
        assert_eq!(sup.restart.max_restarts, 5);
        assert_eq!(sup.restart.window, Duration::from_secs(60));
        assert_eq!(sup.stop_timeout, Duration::from_secs(10));
        assert_eq!(config.publisher_config().buffer_capacity, 1024);
        assert_eq!(config.worker_config().checkpoint.every_records, 100);
    }

    #[test]
    fn sections_override_defaults() {
        let yaml = r#"
registry:
  path: /etc/chainpipe/sources
  poll_interval_ms: 500
bus:
  kind: memory
  topic: "raw.{source_id}"
cache:
  kind: memory
  capacity: 10
  dedup_ttl_secs: 60
checkpoints:
  kind: file
  path: /var/lib/chainpipe/checkpoints
supervisor:
  max_restarts: 3
  restart_window_ms: 30000
worker:
  heartbeat_ms: 250
  retry:
    initial_ms: 100
    max_ms: 1000
    multiplier: 3.0
    jitter: 0.0
publisher:
  buffer_capacity: 16
  staleness_ms: 5000
logging:
  level: debug
  json: true
  components:
    chainpipe-runtime: trace
health:
  listen: 127.0.0.1:9100
"#;
        let config = AppConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.registry.poll_interval_ms, 500);
        assert_eq!(config.bus.kind, BusKind::Memory);
        assert_eq!(config.cache.kind, CacheKind::Memory);
        assert_eq!(config.cache.capacity, 10);
        assert_eq!(config.checkpoints.kind, CheckpointKind::File);

        let sup = config.supervisor_config();
        assert_eq!(sup.restart.max_restarts, 3);
        assert_eq!(sup.restart.window, Duration::from_secs(30));
        assert_eq!(sup.worker.heartbeat_interval, Duration::from_millis(250));
        assert_eq!(sup.worker.retry.multiplier, 3.0);
        // Unset fields in a section keep their defaults.
        assert_eq!(sup.worker.drain_timeout, WorkerConfig::default().drain_timeout);

        let publisher = config.publisher_config();
        assert_eq!(publisher.buffer_capacity, 16);
        assert_eq!(publisher.staleness, Duration::from_secs(5));
        assert_eq!(publisher.topic.0, "raw.{source_id}");

        assert!(config.logging.json);
        assert_eq!(config.logging.directives(), "debug,chainpipe_runtime=trace");
        assert_eq!(config.health.listen.unwrap().port(), 9100);
    }

    #[test]
    fn rejects_invalid_values() {
        let err = AppConfig::from_yaml("publisher:\n  buffer_capacity: 0\n").unwrap_err();
        assert!(err.to_string().contains("buffer_capacity"));

        let err = AppConfig::from_yaml("worker:\n  retry:\n    jitter: 2.0\n").unwrap_err();
        assert!(err.to_string().contains("worker.retry.jitter"));

        let err = AppConfig::from_yaml("connectors:\n  backlog_limit: 0\n").unwrap_err();
        assert!(err.to_string().contains("backlog_limit"));

        assert!(AppConfig::from_yaml("bus:\n  kind: carrier-pigeon\n").is_err());
    }

    #[test]
    fn backlog_limit_reaches_sessions() {
        let config = AppConfig::from_yaml("connectors:\n  backlog_limit: 250\n").unwrap();
        assert_eq!(config.session_config().backlog_limit, 250);
        assert_eq!(AppConfig::default().session_config().backlog_limit, 10_000);
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = AppConfig::load(Some(Path::new("/nonexistent/chainpipe.yaml"))).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/chainpipe.yaml"));
        assert!(AppConfig::load(None).is_ok());
    }
}

//! Kafka backend over an `rdkafka` [`FutureProducer`].
//!
//! The message key is the source id, so a topic's partitioning keeps every
//! source's events in order. The producer runs with idempotence on and
//! `acks=all`; the `dedup_key` header lets consumers drop the duplicates
//! that at-least-once delivery still allows across process restarts.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chainpipe_core::{BusAck, BusMessage, EventBus, PublishError};
use rdkafka::config::ClientConfig;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// `bootstrap.servers`, e.g. `"localhost:9092"`.
    pub brokers: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
    /// Extra librdkafka properties; applied last so they can override the
    /// defaults above.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

fn default_client_id() -> String {
    "chainpipe".into()
}

fn default_message_timeout_ms() -> u64 {
    30_000
}

impl KafkaConfig {
    pub fn new(brokers: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            client_id: default_client_id(),
            message_timeout_ms: default_message_timeout_ms(),
            properties: BTreeMap::new(),
        }
    }

    fn client_config(&self) -> ClientConfig {
        let mut cfg = ClientConfig::new();
        cfg.set("bootstrap.servers", &self.brokers)
            .set("client.id", &self.client_id)
            .set("message.timeout.ms", self.message_timeout_ms.to_string())
            .set("enable.idempotence", "true")
            .set("acks", "all");
        for (k, v) in &self.properties {
            cfg.set(k, v);
        }
        cfg
    }
}

pub struct KafkaBus {
    producer: FutureProducer,
    config: KafkaConfig,
}

impl KafkaBus {
    pub fn new(config: KafkaConfig) -> Result<Self, PublishError> {
        let producer: FutureProducer = config
            .client_config()
            .create()
            .map_err(|e| PublishError::Unreachable(format!("kafka producer: {e}")))?;
        Ok(Self { producer, config })
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.message_timeout_ms)
    }
}

fn map_error(topic: &str, e: KafkaError) -> PublishError {
    match e.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::MessageSizeTooLarge
            | RDKafkaErrorCode::InvalidMessage
            | RDKafkaErrorCode::TopicAuthorizationFailed,
        ) => PublishError::Rejected {
            topic: topic.to_string(),
            reason: e.to_string(),
        },
        _ => PublishError::Unreachable(e.to_string()),
    }
}

#[async_trait]
impl EventBus for KafkaBus {
    async fn send(&self, message: &BusMessage) -> Result<BusAck, PublishError> {
        let mut headers = OwnedHeaders::new();
        for (key, value) in &message.headers {
            headers = headers.insert(Header {
                key,
                value: Some(value.as_bytes()),
            });
        }
        let record = FutureRecord::to(&message.topic)
            .key(&message.key)
            .payload(&message.payload)
            .headers(headers);

        let (partition, offset) = self
            .producer
            .send(record, self.timeout())
            .await
            .map_err(|(e, _)| map_error(&message.topic, e))?;

        debug!(topic = %message.topic, partition, offset, "kafka ack");
        Ok(BusAck {
            partition: Some(partition),
            offset: Some(offset),
        })
    }

    async fn ping(&self) -> Result<(), PublishError> {
        let producer = self.producer.clone();
        let timeout = self.timeout();
        tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(None, timeout)
                .map(|_| ())
                .map_err(|e| PublishError::Unreachable(e.to_string()))
        })
        .await
        .map_err(|e| PublishError::Unreachable(e.to_string()))?
    }

    fn name(&self) -> &str {
        "kafka"
    }
}

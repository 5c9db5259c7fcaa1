//! Append-only JSON-lines bus: one `<dir>/<topic>.jsonl` file per topic.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chainpipe_core::{BusAck, BusMessage, EventBus, Position, PublishError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// One line of a topic file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonlRecord {
    pub key: String,
    pub dedup_key: String,
    pub position: Position,
    pub headers: BTreeMap<String, String>,
    pub event: serde_json::Value,
}

struct TopicFile {
    file: File,
    lines: i64,
}

pub struct JsonlFileBus {
    dir: PathBuf,
    topics: Mutex<HashMap<String, TopicFile>>,
}

impl JsonlFileBus {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, PublishError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| PublishError::Unreachable(format!("{}: {e}", dir.display())))?;
        Ok(Self {
            dir,
            topics: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn topic_path(&self, topic: &str) -> PathBuf {
        let name: String = topic
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.dir.join(format!("{name}.jsonl"))
    }

    async fn open_topic(&self, topic: &str) -> Result<TopicFile, PublishError> {
        let path = self.topic_path(topic);
        let lines = match tokio::fs::read(&path).await {
            Ok(existing) => existing.iter().filter(|b| **b == b'\n').count() as i64,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(PublishError::Unreachable(e.to_string())),
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| PublishError::Unreachable(format!("{}: {e}", path.display())))?;
        Ok(TopicFile { file, lines })
    }
}

#[async_trait]
impl EventBus for JsonlFileBus {
    async fn send(&self, message: &BusMessage) -> Result<BusAck, PublishError> {
        let event: serde_json::Value = serde_json::from_slice(&message.payload)
            .map_err(|e| PublishError::Encode(e.to_string()))?;
        let record = JsonlRecord {
            key: message.key.clone(),
            dedup_key: message.dedup_key.clone(),
            position: message.position,
            headers: message.headers.clone(),
            event,
        };
        let mut line = serde_json::to_vec(&record).map_err(|e| PublishError::Encode(e.to_string()))?;
        line.push(b'\n');

        let mut topics = self.topics.lock().await;
        if !topics.contains_key(&message.topic) {
            let opened = self.open_topic(&message.topic).await?;
            topics.insert(message.topic.clone(), opened);
        }
        let Some(topic) = topics.get_mut(&message.topic) else {
            return Err(PublishError::Unreachable(format!("topic {} not open", message.topic)));
        };

        let write = async {
            topic.file.write_all(&line).await?;
            topic.file.flush().await
        };
        if let Err(e) = write.await {
            // Reopen on the next send; a partial line is possible on disk full.
            topics.remove(&message.topic);
            return Err(PublishError::Unreachable(e.to_string()));
        }
        let offset = topic.lines;
        topic.lines += 1;
        Ok(BusAck {
            partition: None,
            offset: Some(offset),
        })
    }

    async fn ping(&self) -> Result<(), PublishError> {
        let meta = tokio::fs::metadata(&self.dir)
            .await
            .map_err(|e| PublishError::Unreachable(format!("{}: {e}", self.dir.display())))?;
        if meta.permissions().readonly() {
            return Err(PublishError::Unreachable(format!(
                "{} is read-only",
                self.dir.display()
            )));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "jsonl"
    }
}

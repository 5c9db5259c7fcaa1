//! In-process bus for tests and embedding.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chainpipe_core::{BusAck, BusMessage, EventBus, NormalizedEvent, PublishError};
use tokio::sync::Notify;

/// Records every acknowledged message in order.
///
/// `set_available(false)` makes every send fail with
/// [`PublishError::Unreachable`] until it is switched back on.
#[derive(Default)]
pub struct MemoryBus {
    messages: Mutex<Vec<BusMessage>>,
    unavailable: AtomicBool,
    attempts: AtomicU64,
    notify: Notify,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Send attempts, failed ones included.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn messages(&self) -> Vec<BusMessage> {
        self.messages.lock().unwrap().clone()
    }

    /// Decoded events published for `source_id`, in bus order.
    pub fn events_for(&self, source_id: &str) -> Vec<NormalizedEvent> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.key == source_id)
            .filter_map(|m| m.event().ok())
            .collect()
    }

    /// Wait until at least `count` messages are on the bus.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                if self.len() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn send(&self, message: &BusMessage) -> Result<BusAck, PublishError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PublishError::Unreachable("memory bus switched off".into()));
        }
        let offset = {
            let mut messages = self.messages.lock().unwrap();
            messages.push(message.clone());
            messages.len() as i64 - 1
        };
        self.notify.notify_waiters();
        Ok(BusAck {
            partition: Some(0),
            offset: Some(offset),
        })
    }

    async fn ping(&self) -> Result<(), PublishError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PublishError::Unreachable("memory bus switched off".into()));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

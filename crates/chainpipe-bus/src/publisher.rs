//! Publisher: per-source lanes between workers and the bus.
//!
//! Each lane owns a bounded buffer and a single delivery task, so events of
//! one source reach the bus in the order they were published. When the bus
//! is down the delivery task retries the head message with backoff and the
//! buffer fills; once full, [`Lane::publish`] waits, which pushes back on
//! the worker instead of dropping. A lane that cannot deliver for longer
//! than the staleness bound raises its `degraded` flag.
//!
//! A lane opened with [`Publisher::lane_with_dedup`] records each event's
//! `dedup_key` only after the bus acknowledged it. Events abandoned in the
//! buffer stay unmarked and are published again when replayed.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chainpipe_core::{
    Backoff, BackoffConfig, BusMessage, DedupCache, EventBus, NormalizedEvent, Position,
    PublishError, TopicTemplate,
};
use chainpipe_observability::PipelineMetrics;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Events buffered per source before `publish` blocks.
    pub buffer_capacity: usize,
    /// Undeliverable for this long → lane reports degraded.
    pub staleness: Duration,
    pub retry: BackoffConfig,
    pub topic: TopicTemplate,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 1024,
            staleness: Duration::from_secs(60),
            retry: BackoffConfig::default(),
            topic: TopicTemplate::default(),
        }
    }
}

/// Shared by every worker. Cheap to clone.
#[derive(Clone)]
pub struct Publisher {
    bus: Arc<dyn EventBus>,
    config: PublisherConfig,
    metrics: PipelineMetrics,
    /// Cancelling this stops every lane's delivery task at once.
    force: CancellationToken,
}

impl Publisher {
    pub fn new(bus: Arc<dyn EventBus>, config: PublisherConfig) -> Self {
        Self {
            bus,
            config,
            metrics: PipelineMetrics::global(),
            force: CancellationToken::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: PipelineMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Open a lane for `source_id` and spawn its delivery task.
    pub fn lane(&self, source_id: impl Into<String>) -> Lane {
        self.open(source_id.into(), None)
    }

    /// Like [`lane`](Self::lane), and mark every acknowledged event in `dedup`.
    pub fn lane_with_dedup(&self, source_id: impl Into<String>, dedup: DedupCache) -> Lane {
        self.open(source_id.into(), Some(dedup))
    }

    fn open(&self, source_id: String, dedup: Option<DedupCache>) -> Lane {
        let (tx, rx) = mpsc::channel(self.config.buffer_capacity.max(1));
        let (degraded_tx, degraded_rx) = watch::channel(false);
        let shared = Arc::new(LaneShared::default());
        let force = self.force.child_token();

        let task = tokio::spawn(deliver(Delivery {
            source_id: source_id.clone(),
            rx,
            bus: self.bus.clone(),
            shared: shared.clone(),
            degraded: degraded_tx,
            retry: self.config.retry,
            staleness: self.config.staleness,
            metrics: self.metrics.clone(),
            dedup,
            force: force.clone(),
        }));

        Lane {
            source_id,
            topic: self.config.topic.clone(),
            tx: Some(tx),
            shared,
            degraded: degraded_rx,
            force,
            task: Some(task),
        }
    }

    /// Stop every lane immediately, abandoning buffered events.
    pub fn force_stop(&self) {
        self.force.cancel();
    }
}

#[derive(Default)]
struct LaneShared {
    /// Events accepted by `publish` and not yet acknowledged.
    pending: AtomicUsize,
    published: AtomicU64,
    acked: Mutex<Option<Position>>,
}

struct Pending {
    message: BusMessage,
    enqueued_at: Instant,
}

/// One source's ordered path to the bus.
pub struct Lane {
    source_id: String,
    topic: TopicTemplate,
    tx: Option<mpsc::Sender<Pending>>,
    shared: Arc<LaneShared>,
    degraded: watch::Receiver<bool>,
    force: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Lane {
    /// Enqueue `event` for delivery. Waits while the buffer is full.
    ///
    /// `Ok` means the lane accepted the event; the bus acknowledgement is
    /// reflected later in [`acked_position`](Self::acked_position).
    pub async fn publish(&self, event: &NormalizedEvent) -> Result<(), PublishError> {
        let message = BusMessage::from_event(self.topic.render(event), event)?;
        let Some(tx) = &self.tx else {
            return Err(self.closed());
        };
        // Counted only once a slot is held, so a cancelled wait leaves no trace.
        let permit = tx.reserve().await.map_err(|_| self.closed())?;
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        permit.send(Pending {
            message,
            enqueued_at: Instant::now(),
        });
        Ok(())
    }

    fn closed(&self) -> PublishError {
        PublishError::Closed {
            source_id: self.source_id.clone(),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    /// Position of the last event the bus acknowledged.
    pub fn acked_position(&self) -> Option<Position> {
        *self.shared.acked.lock().unwrap()
    }

    pub fn published(&self) -> u64 {
        self.shared.published.load(Ordering::SeqCst)
    }

    pub fn is_degraded(&self) -> bool {
        *self.degraded.borrow()
    }

    /// Receiver that changes whenever the degraded flag flips.
    pub fn degraded_watch(&self) -> watch::Receiver<bool> {
        self.degraded.clone()
    }

    /// Stop accepting events and give the delivery task up to `timeout` to
    /// drain the buffer, then stop it. Returns how many events were left
    /// undelivered. Later `publish` calls fail with `Closed`.
    pub async fn close(&mut self, timeout: Duration) -> usize {
        self.tx.take();
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(timeout, &mut task).await.is_err() {
                self.force.cancel();
                let _ = task.await;
            }
        }
        let left = self.pending();
        if left > 0 {
            warn!(source_id = %self.source_id, left, "lane closed with undelivered events");
        }
        left
    }
}

impl Drop for Lane {
    /// A lane dropped without [`close`](Lane::close) abandons its buffer, so
    /// nothing is published for the source after its worker is gone.
    fn drop(&mut self) {
        self.tx.take();
        self.force.cancel();
    }
}

struct Delivery {
    source_id: String,
    rx: mpsc::Receiver<Pending>,
    bus: Arc<dyn EventBus>,
    shared: Arc<LaneShared>,
    degraded: watch::Sender<bool>,
    retry: BackoffConfig,
    staleness: Duration,
    metrics: PipelineMetrics,
    dedup: Option<DedupCache>,
    force: CancellationToken,
}

async fn deliver(mut d: Delivery) {
    loop {
        let next = tokio::select! {
            biased;
            _ = d.force.cancelled() => break,
            next = d.rx.recv() => next,
        };
        let Some(item) = next else {
            break;
        };
        if !deliver_one(&mut d, item).await {
            break;
        }
    }
    debug!(source_id = %d.source_id, "lane delivery task finished");
}

/// Retry until acknowledged. Returns `false` when force-stopped.
async fn deliver_one(d: &mut Delivery, item: Pending) -> bool {
    let mut backoff = Backoff::new(d.retry);
    let mut failing_since: Option<Instant> = None;

    loop {
        let result = tokio::select! {
            biased;
            _ = d.force.cancelled() => return false,
            r = d.bus.send(&item.message) => r,
        };

        match result {
            Ok(_ack) => {
                if let Some(dedup) = &d.dedup {
                    if let Err(e) = dedup.try_mark(&item.message.dedup_key).await {
                        d.metrics.record_cache_errors(1);
                        debug!(source_id = %d.source_id, error = %e, "dedup mark failed");
                    }
                }
                d.shared.pending.fetch_sub(1, Ordering::SeqCst);
                d.shared.published.fetch_add(1, Ordering::SeqCst);
                *d.shared.acked.lock().unwrap() = Some(item.message.position);
                d.metrics.record_publish_latency(
                    item.enqueued_at.elapsed().as_secs_f64() * 1000.0,
                    &d.source_id,
                );
                if *d.degraded.borrow() {
                    d.degraded.send_replace(false);
                    info!(source_id = %d.source_id, "bus reachable again, lane recovered");
                }
                return true;
            }
            Err(e) => {
                let since = *failing_since.get_or_insert_with(Instant::now);
                let delay = backoff.next_delay();
                d.metrics.record_publish_retry(&d.source_id);
                if e.is_retryable() {
                    warn!(
                        source_id = %d.source_id,
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "bus send failed, retrying"
                    );
                } else {
                    error!(
                        source_id = %d.source_id,
                        attempt = backoff.attempt(),
                        error = %e,
                        "bus send failed with a non-transient error, retrying"
                    );
                }

                // Wake up at the staleness deadline even if the backoff is longer.
                let mut sleep_for = delay;
                if !*d.degraded.borrow() {
                    sleep_for = sleep_for.min(d.staleness.saturating_sub(since.elapsed()));
                }
                tokio::select! {
                    biased;
                    _ = d.force.cancelled() => return false,
                    _ = tokio::time::sleep(sleep_for) => {}
                }
                if !*d.degraded.borrow() && since.elapsed() >= d.staleness {
                    d.degraded.send_replace(true);
                    warn!(
                        source_id = %d.source_id,
                        outage_ms = since.elapsed().as_millis() as u64,
                        "bus outage exceeded staleness bound, lane degraded"
                    );
                }
            }
        }
    }
}

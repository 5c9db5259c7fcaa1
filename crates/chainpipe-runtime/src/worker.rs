//! `SourceWorker`: owns one source's connection from connect to stop.
//!
//! # Lifecycle
//! 1. Check that the chain type has a decoder and a connector. Missing
//!    either is fatal for this source only.
//! 2. Load the checkpoint; otherwise begin at the configured start position.
//! 3. Connect. On failure wait with exponential backoff and retry.
//! 4. Stream: decode → dedup → publish → advance position, saving the
//!    checkpoint every N records or T seconds. The lane marks a record's
//!    dedup key once the bus acknowledged it.
//! 5. On cancellation: drop the connection, drain the publisher lane,
//!    flush the checkpoint and exit.
//!
//! Everything the supervisor learns about the worker arrives as a
//! [`StatusReport`] on the report channel.

use std::time::{Duration, Instant};

use chainpipe_bus::Lane;
use chainpipe_core::{
    Backoff, BackoffConfig, CheckpointCadence, CheckpointManager, ConnectError, DecodeError,
    Position, RawRecord, RawRecordStream, SourceConfig, SourceConnector,
};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::PipelineContext;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Reconnect backoff.
    pub retry: BackoffConfig,
    /// A connection that lived this long and delivered what it produced
    /// resets the reconnect backoff.
    pub stable_after: Duration,
    pub checkpoint: CheckpointCadence,
    pub heartbeat_interval: Duration,
    /// Time the publisher lane gets to drain on stop.
    pub drain_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            retry: BackoffConfig::default(),
            stable_after: Duration::from_secs(30),
            checkpoint: CheckpointCadence::default(),
            heartbeat_interval: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// Counters carried by heartbeats.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub position: Option<Position>,
    pub events_published: u64,
    pub decode_errors: u64,
    pub duplicates_skipped: u64,
    pub degraded: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReportKind {
    Running,
    Backoff { error: String, attempt: u32, delay: Duration },
    Heartbeat(WorkerStats),
    /// Unrecoverable for this source; the worker has exited.
    Failed { error: String },
    /// The worker task panicked. Sent by the supervisor's monitor task.
    Crashed { error: String },
    Stopped(WorkerStats),
}

/// Message from a worker (or its monitor) to the supervisor.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub source_id: String,
    /// Distinguishes a restarted worker from its predecessor.
    pub generation: u64,
    pub kind: ReportKind,
}

pub type ReportSender = mpsc::UnboundedSender<StatusReport>;

enum StreamEnd {
    Cancelled,
    Lost(Option<ConnectError>),
}

pub struct SourceWorker {
    source: SourceConfig,
    generation: u64,
    ctx: PipelineContext,
    config: WorkerConfig,
    reports: ReportSender,
    cancel: CancellationToken,
    stats: WorkerStats,
    /// Records at or before this position were already processed.
    resume_after: Option<Position>,
    /// Events accepted by the lane over the worker's lifetime.
    enqueued: u64,
}

impl SourceWorker {
    pub fn new(
        source: SourceConfig,
        generation: u64,
        ctx: PipelineContext,
        config: WorkerConfig,
        reports: ReportSender,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            generation,
            ctx,
            config,
            reports,
            cancel,
            stats: WorkerStats::default(),
            resume_after: None,
            enqueued: 0,
        }
    }

    fn report(&self, kind: ReportKind) {
        // The supervisor outlives its workers; a closed channel only
        // happens during teardown.
        let _ = self.reports.send(StatusReport {
            source_id: self.source.id.clone(),
            generation: self.generation,
            kind,
        });
    }

    /// Run until cancelled or failed.
    pub async fn run(mut self) {
        let id = self.source.id.clone();
        let chain_type = self.source.chain_type.clone();

        if !self.ctx.decoders.contains(&chain_type) {
            let err = DecodeError::UnknownDecoder {
                chain_type: chain_type.clone(),
            };
            warn!(source_id = %id, %chain_type, "no decoder registered, source failed");
            self.report(ReportKind::Failed {
                error: err.to_string(),
            });
            return;
        }
        let connector = match self.ctx.connectors.get(&chain_type) {
            Ok(c) => c,
            Err(e) => {
                warn!(source_id = %id, %chain_type, error = %e, "no connector, source failed");
                self.report(ReportKind::Failed {
                    error: e.to_string(),
                });
                return;
            }
        };

        let lane = self
            .ctx
            .publisher
            .lane_with_dedup(id.clone(), self.ctx.dedup.clone());
        let mut checkpoints =
            CheckpointManager::new(self.ctx.checkpoints.clone(), id.clone(), self.config.checkpoint);

        if self.load_checkpoint(&mut checkpoints).await {
            self.stream_loop(connector, &lane, &mut checkpoints).await;
        }

        let stats = self.shutdown(lane, &mut checkpoints).await;
        self.report(ReportKind::Stopped(stats));
        info!(source_id = %id, "worker stopped");
    }

    /// Returns `false` if cancelled before a checkpoint could be read.
    async fn load_checkpoint(&mut self, checkpoints: &mut CheckpointManager) -> bool {
        let mut backoff = Backoff::new(self.config.retry);
        loop {
            match checkpoints.load().await {
                Ok(Some(cp)) => {
                    info!(source_id = %self.source.id, position = %cp.position, "resuming from checkpoint");
                    self.resume_after = Some(cp.position);
                    self.stats.position = Some(cp.position);
                    return true;
                }
                Ok(None) => {
                    debug!(
                        source_id = %self.source.id,
                        start_position = ?self.source.start_position,
                        "no checkpoint, starting from configured position"
                    );
                    return true;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(source_id = %self.source.id, error = %e, "checkpoint load failed");
                    self.report(ReportKind::Backoff {
                        error: e.to_string(),
                        attempt: backoff.attempt(),
                        delay,
                    });
                    if !self.sleep(delay).await {
                        return false;
                    }
                }
            }
        }
    }

    /// Sleep unless cancelled. Returns `false` if cancelled.
    async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn stream_loop(
        &mut self,
        connector: Arc<dyn SourceConnector>,
        lane: &Lane,
        checkpoints: &mut CheckpointManager,
    ) {
        let mut backoff = Backoff::new(self.config.retry);

        loop {
            let resume = self.stats.position;
            self.resume_after = resume;
            let connect = connector.connect(&self.source, resume, self.cancel.child_token());
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => return,
                r = connect => r,
            };

            let error = match connected {
                Ok(stream) => {
                    info!(
                        source_id = %self.source.id,
                        chain_type = %self.source.chain_type,
                        resume_after = ?resume,
                        "source connected"
                    );
                    self.report(ReportKind::Running);
                    let connected_at = Instant::now();
                    let enqueued_at_connect = self.enqueued;
                    let published_at_connect = lane.published();

                    match self.consume(stream, lane, checkpoints).await {
                        StreamEnd::Cancelled => return,
                        StreamEnd::Lost(error) => {
                            let quiet = self.enqueued == enqueued_at_connect;
                            let delivered = lane.published() > published_at_connect;
                            if connected_at.elapsed() >= self.config.stable_after
                                && !lane.is_degraded()
                                && (quiet || delivered)
                            {
                                backoff.reset();
                            }
                            error.map(|e| e.to_string()).unwrap_or_else(|| "stream ended".into())
                        }
                    }
                }
                Err(e @ (ConnectError::NoConnector { .. } | ConnectError::Config(_))) => {
                    warn!(source_id = %self.source.id, error = %e, "unusable source definition");
                    self.report(ReportKind::Failed {
                        error: e.to_string(),
                    });
                    return;
                }
                Err(e) => e.to_string(),
            };

            let delay = backoff.next_delay();
            warn!(
                source_id = %self.source.id,
                attempt = backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "connection lost, backing off"
            );
            self.ctx.metrics.record_restart(&self.source.id, "reconnect");
            self.report(ReportKind::Backoff {
                error,
                attempt: backoff.attempt(),
                delay,
            });
            if !self.sleep(delay).await {
                return;
            }
        }
    }

    async fn consume(
        &mut self,
        mut stream: RawRecordStream,
        lane: &Lane,
        checkpoints: &mut CheckpointManager,
    ) -> StreamEnd {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut degraded = lane.degraded_watch();

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return StreamEnd::Cancelled,
                _ = heartbeat.tick() => {
                    self.save_checkpoint(lane, checkpoints).await;
                    self.heartbeat(lane);
                }
                Ok(()) = degraded.changed() => self.heartbeat(lane),
                item = stream.next() => match item {
                    None => return StreamEnd::Lost(None),
                    Some(Err(e)) => return StreamEnd::Lost(Some(e)),
                    Some(Ok(raw)) => {
                        if !self.handle_record(raw, lane).await {
                            return StreamEnd::Cancelled;
                        }
                        checkpoints.record();
                        self.save_checkpoint(lane, checkpoints).await;
                    }
                },
            }
        }
    }

    /// Decode, dedup and publish one record. Returns `false` if cancelled
    /// while waiting on a full lane.
    async fn handle_record(&mut self, raw: RawRecord, lane: &Lane) -> bool {
        let id = self.source.id.as_str();
        let chain_type = self.source.chain_type.as_str();
        self.ctx.metrics.record_received(id, chain_type);

        let event = match self.ctx.decoders.decode(id, chain_type, &raw) {
            Ok(event) => event,
            Err(DecodeError::Ignored { reason }) => {
                debug!(source_id = %id, %reason, "record ignored");
                return true;
            }
            Err(e) => {
                self.stats.decode_errors += 1;
                self.ctx.metrics.record_decode_error(chain_type, decode_error_kind(&e));
                warn!(source_id = %id, error = %e, "skipping undecodable record");
                return true;
            }
        };

        if self.resume_after.is_some_and(|resume| event.position <= resume) {
            debug!(source_id = %id, position = %event.position, "already processed, skipping");
            return true;
        }
        if self.resume_after.is_none()
            && self
                .source
                .start_position
                .is_some_and(|start| event.position.sequence < start)
        {
            return true;
        }

        let seen = match self.ctx.dedup.check(&event.dedup_key).await {
            Ok(hit) => hit,
            Err(e) => {
                self.ctx.metrics.record_cache_errors(1);
                debug!(source_id = %id, error = %e, "dedup lookup failed, treating as miss");
                false
            }
        };
        if seen {
            self.stats.duplicates_skipped += 1;
            self.ctx.metrics.record_duplicate(id);
            self.advance(event.position);
            return true;
        }

        let published = tokio::select! {
            _ = self.cancel.cancelled() => return false,
            r = lane.publish(&event) => r,
        };
        if let Err(e) = published {
            // Only a force-stopped publisher closes lanes.
            warn!(source_id = %id, error = %e, "publisher lane closed");
            return false;
        }
        self.enqueued += 1;
        self.advance(event.position);
        true
    }

    fn advance(&mut self, position: Position) {
        if self.stats.position.map_or(true, |p| position > p) {
            self.stats.position = Some(position);
        }
    }

    /// Last position that is safe to persist: everything handed to the lane
    /// if it is empty, otherwise only what the bus acknowledged.
    fn safe_position(&self, lane: &Lane) -> Option<Position> {
        if lane.pending() == 0 {
            self.stats.position
        } else {
            lane.acked_position()
        }
    }

    async fn save_checkpoint(&self, lane: &Lane, checkpoints: &mut CheckpointManager) {
        if let Err(e) = checkpoints.maybe_save(self.safe_position(lane)).await {
            warn!(source_id = %self.source.id, error = %e, "checkpoint save failed");
        }
    }

    fn snapshot(&self, lane: &Lane) -> WorkerStats {
        WorkerStats {
            events_published: lane.published(),
            degraded: lane.is_degraded(),
            ..self.stats.clone()
        }
    }

    fn heartbeat(&self, lane: &Lane) {
        self.report(ReportKind::Heartbeat(self.snapshot(lane)));
    }

    async fn shutdown(&mut self, mut lane: Lane, checkpoints: &mut CheckpointManager) -> WorkerStats {
        let pending = lane.pending();
        if pending > 0 {
            debug!(source_id = %self.source.id, pending, "draining publisher lane");
        }
        lane.close(self.config.drain_timeout).await;

        let position = self.safe_position(&lane);
        if let Err(e) = checkpoints.flush(position).await {
            warn!(source_id = %self.source.id, error = %e, "final checkpoint flush failed");
        }
        self.snapshot(&lane)
    }
}

fn decode_error_kind(e: &DecodeError) -> &'static str {
    match e {
        DecodeError::UnknownDecoder { .. } => "unknown_decoder",
        DecodeError::DecodeFailed { .. } => "decode_failed",
        DecodeError::MissingField { .. } => "missing_field",
        DecodeError::Ignored { .. } => "ignored",
    }
}

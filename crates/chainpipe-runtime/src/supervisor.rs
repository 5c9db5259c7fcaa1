//! Supervisor: keeps the set of running workers equal to the registry.
//!
//! A single task owns every worker handle and every [`WorkerState`]. It
//! reacts to three inputs, one at a time:
//!
//! ```text
//! ConfigStore::watch ──► Put / Delete ─┐
//! workers ───────────► StatusReport ──┼──► Supervisor loop ──► HealthSnapshot (watch)
//! restart timers ────► RestartDue ────┘
//! ```
//!
//! Reconnects and crashes of a source are counted in a rolling window.
//! Exceeding the policy marks the source `failed`; it stays down until its
//! definition is written again.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chainpipe_core::{
    BackoffConfig, ConfigChange, ConfigStore, ConfigWatchStream, HealthSnapshot, PipelineError,
    RegistryEntry, RegistrySnapshot, RestartPolicy, RestartWindow, SourceConfig, WorkerState,
    WorkerStatus,
};
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::PipelineContext;
use crate::worker::{ReportKind, SourceWorker, StatusReport, WorkerConfig, WorkerStats};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub restart: RestartPolicy,
    /// Grace period for one worker to stop before it is aborted.
    pub stop_timeout: Duration,
    /// Grace period for the whole fleet on process shutdown.
    pub shutdown_timeout: Duration,
    /// Backoff between registry re-list attempts after a watch failure.
    pub watch_retry: BackoffConfig,
    pub worker: WorkerConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart: RestartPolicy::default(),
            stop_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(30),
            watch_retry: BackoffConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

/// Read side of the supervisor, safe to hand to HTTP handlers and tests.
#[derive(Clone)]
pub struct SupervisorHandle {
    health: watch::Receiver<HealthSnapshot>,
}

impl SupervisorHandle {
    pub fn snapshot(&self) -> HealthSnapshot {
        self.health.borrow().clone()
    }

    pub fn state(&self, source_id: &str) -> Option<WorkerState> {
        self.health.borrow().sources.get(source_id).cloned()
    }

    /// Wait until `pred` holds for the current snapshot, or `timeout`.
    pub async fn wait_until<F>(&self, timeout: Duration, mut pred: F) -> Option<HealthSnapshot>
    where
        F: FnMut(&HealthSnapshot) -> bool,
    {
        let mut rx = self.health.clone();
        tokio::time::timeout(timeout, async move {
            match rx.wait_for(|s| pred(s)).await {
                Ok(snapshot) => Some(snapshot.clone()),
                Err(_) => None,
            }
        })
        .await
        .ok()
        .flatten()
    }

    /// Wait for `source_id` to reach `status`.
    pub async fn wait_for_status(
        &self,
        source_id: &str,
        status: WorkerStatus,
        timeout: Duration,
    ) -> Option<WorkerState> {
        self.wait_until(timeout, |s| s.get(source_id).is_some_and(|w| w.status == status))
            .await
            .and_then(|s| s.get(source_id).cloned())
    }
}

/// A running worker and the means to stop it.
struct WorkerSlot {
    config: SourceConfig,
    generation: u64,
    cancel: CancellationToken,
    abort: AbortHandle,
    /// Finishes when the worker task does.
    monitor: JoinHandle<()>,
}

/// What the supervisor knows about one registry key.
struct SourceEntry {
    revision: u64,
    /// `None` when the stored definition does not parse.
    config: Option<SourceConfig>,
    window: RestartWindow,
}

/// Sent by a timer when a crashed worker may be started again.
struct RestartDue {
    source_id: String,
    revision: u64,
}

pub struct Supervisor {
    store: Arc<dyn ConfigStore>,
    ctx: PipelineContext,
    config: SupervisorConfig,
    entries: HashMap<String, SourceEntry>,
    workers: HashMap<String, WorkerSlot>,
    states: BTreeMap<String, WorkerState>,
    next_generation: u64,
    reports_tx: mpsc::UnboundedSender<StatusReport>,
    reports_rx: mpsc::UnboundedReceiver<StatusReport>,
    restart_tx: mpsc::UnboundedSender<RestartDue>,
    restart_rx: mpsc::UnboundedReceiver<RestartDue>,
    health: watch::Sender<HealthSnapshot>,
}

impl Supervisor {
    pub fn new(store: Arc<dyn ConfigStore>, ctx: PipelineContext, config: SupervisorConfig) -> Self {
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let (restart_tx, restart_rx) = mpsc::unbounded_channel();
        let (health, _) = watch::channel(HealthSnapshot::default());
        Self {
            store,
            ctx,
            config,
            entries: HashMap::new(),
            workers: HashMap::new(),
            states: BTreeMap::new(),
            next_generation: 0,
            reports_tx,
            reports_rx,
            restart_tx,
            restart_rx,
            health,
        }
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            health: self.health.subscribe(),
        }
    }

    /// Run until `shutdown` fires. Fails only if the registry cannot be
    /// listed at startup.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), PipelineError> {
        let watch_cancel = shutdown.child_token();
        // Subscribe before listing so nothing written in between is missed.
        let mut changes = self.store.watch(watch_cancel.clone());
        let snapshot = self.store.list().await.map_err(PipelineError::Registry)?;
        info!(
            sources = snapshot.entries.len(),
            revision = snapshot.revision,
            "registry loaded"
        );
        self.reconcile(snapshot).await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(report) = self.reports_rx.recv() => self.on_report(report).await,
                Some(due) = self.restart_rx.recv() => self.on_restart_due(due),
                change = changes.next() => match change {
                    Some(Ok(change)) => self.apply_change(change).await,
                    Some(Err(e)) => {
                        warn!(error = %e, "registry watch failed, re-listing");
                        match self.rewatch(&shutdown, &watch_cancel).await {
                            Some(stream) => changes = stream,
                            None => break,
                        }
                    }
                    None => {
                        if shutdown.is_cancelled() {
                            break;
                        }
                        warn!("registry watch ended, re-listing");
                        match self.rewatch(&shutdown, &watch_cancel).await {
                            Some(stream) => changes = stream,
                            None => break,
                        }
                    }
                },
            }
        }

        watch_cancel.cancel();
        self.shutdown_all().await;
        Ok(())
    }

    /// Back off, re-subscribe and re-list until the registry answers.
    /// Returns `None` if shutdown fired first.
    async fn rewatch(
        &mut self,
        shutdown: &CancellationToken,
        watch_cancel: &CancellationToken,
    ) -> Option<ConfigWatchStream> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let delay = self.config.watch_retry.delay(attempt);
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
            let stream = self.store.watch(watch_cancel.clone());
            match self.store.list().await {
                Ok(snapshot) => {
                    info!(attempt, revision = snapshot.revision, "registry watch re-established");
                    self.reconcile(snapshot).await;
                    return Some(stream);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "registry re-list failed");
                    // Reports keep flowing while the registry is down.
                    while let Ok(report) = self.reports_rx.try_recv() {
                        self.on_report(report).await;
                    }
                }
            }
        }
    }

    /// Bring the fleet in line with a full registry listing.
    async fn reconcile(&mut self, snapshot: RegistrySnapshot) {
        let present: Vec<String> = snapshot.entries.iter().map(|e| e.key.clone()).collect();
        for entry in snapshot.entries {
            self.apply_put(entry).await;
        }
        let gone: Vec<String> = self
            .entries
            .keys()
            .filter(|k| !present.contains(k))
            .cloned()
            .collect();
        for key in gone {
            self.apply_delete(&key, snapshot.revision).await;
        }
        self.publish_health();
    }

    async fn apply_change(&mut self, change: ConfigChange) {
        match change {
            ConfigChange::Put(entry) => self.apply_put(entry).await,
            ConfigChange::Delete { key, revision } => self.apply_delete(&key, revision).await,
        }
        self.publish_health();
    }

    async fn apply_put(&mut self, entry: RegistryEntry) {
        if let Some(known) = self.entries.get(&entry.key) {
            if entry.revision <= known.revision {
                debug!(source_id = %entry.key, revision = entry.revision, "stale registry entry ignored");
                return;
            }
        }

        let parsed = entry.parse();
        let key = entry.key.clone();
        let policy = self.config.restart;
        let known = self.entries.entry(key.clone()).or_insert_with(|| SourceEntry {
            revision: 0,
            config: None,
            window: RestartWindow::new(policy),
        });
        known.revision = entry.revision;
        // Any write re-touches the source.
        known.window.clear();

        let config = match parsed {
            Ok(config) => config,
            Err(e) => {
                warn!(source_id = %key, error = %e, "invalid source definition");
                known.config = None;
                self.stop_worker(&key).await;
                let chain_type = self
                    .states
                    .get(&key)
                    .map(|s| s.chain_type.clone())
                    .unwrap_or_default();
                let mut state = WorkerState::new(&key, chain_type, WorkerStatus::Failed);
                state.last_error = Some(e.to_string());
                self.states.insert(key, state);
                return;
            }
        };
        known.config = Some(config.clone());

        if let Some(slot) = self.workers.get(&key) {
            if slot.config == config {
                debug!(source_id = %key, revision = entry.revision, "definition unchanged");
                return;
            }
            info!(source_id = %key, revision = entry.revision, "definition changed, restarting worker");
            self.stop_worker(&key).await;
        }

        if config.enabled {
            self.start_worker(config);
        } else {
            info!(source_id = %key, "source disabled");
            self.set_stopped(&key, &config.chain_type);
        }
    }

    async fn apply_delete(&mut self, key: &str, revision: u64) {
        let Some(known) = self.entries.get(key) else {
            return;
        };
        if revision != 0 && revision < known.revision {
            debug!(source_id = %key, revision, "stale delete ignored");
            return;
        }
        info!(source_id = %key, "source deleted");
        self.stop_worker(key).await;
        self.entries.remove(key);
        self.states.remove(key);
        if let Err(e) = self.ctx.checkpoints.delete(key).await {
            warn!(source_id = %key, error = %e, "failed to delete checkpoint");
        }
    }

    fn set_stopped(&mut self, key: &str, chain_type: &str) {
        let state = self
            .states
            .entry(key.to_string())
            .or_insert_with(|| WorkerState::new(key, chain_type, WorkerStatus::Stopped));
        state.chain_type = chain_type.to_string();
        state.status = WorkerStatus::Stopped;
        state.degraded = false;
    }

    fn start_worker(&mut self, config: SourceConfig) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let id = config.id.clone();

        let restart_count = self
            .entries
            .get_mut(&id)
            .map(|e| e.window.count())
            .unwrap_or(0);
        let state = self
            .states
            .entry(id.clone())
            .or_insert_with(|| WorkerState::new(&id, &config.chain_type, WorkerStatus::Starting));
        state.chain_type = config.chain_type.clone();
        state.status = WorkerStatus::Starting;
        state.restart_count = restart_count;
        state.degraded = false;

        let cancel = CancellationToken::new();
        let worker = SourceWorker::new(
            config.clone(),
            generation,
            self.ctx.clone(),
            self.config.worker.clone(),
            self.reports_tx.clone(),
            cancel.clone(),
        );
        let task = tokio::spawn(worker.run());
        let abort = task.abort_handle();

        let reports = self.reports_tx.clone();
        let source_id = id.clone();
        let monitor = tokio::spawn(async move {
            if let Err(e) = task.await {
                if e.is_panic() {
                    let error = panic_message(e.into_panic());
                    let _ = reports.send(StatusReport {
                        source_id,
                        generation,
                        kind: ReportKind::Crashed { error },
                    });
                }
            }
        });

        debug!(source_id = %id, generation, chain_type = %config.chain_type, "worker started");
        self.workers.insert(
            id,
            WorkerSlot {
                config,
                generation,
                cancel,
                abort,
                monitor,
            },
        );
    }

    /// Request → wait (bounded) → force.
    async fn stop_worker(&mut self, key: &str) {
        let Some(slot) = self.workers.remove(key) else {
            return;
        };
        let chain_type = slot.config.chain_type.clone();
        stop_slot(key, slot, self.config.stop_timeout).await;
        // Drain what the worker said on its way out.
        while let Ok(report) = self.reports_rx.try_recv() {
            if report.source_id != key {
                self.on_report_inner(report).await;
            } else if let ReportKind::Stopped(stats) = report.kind {
                if let Some(state) = self.states.get_mut(key) {
                    apply_stats(state, &stats);
                }
            }
        }
        self.set_stopped(key, &chain_type);
    }

    async fn on_report(&mut self, report: StatusReport) {
        self.on_report_inner(report).await;
        self.publish_health();
    }

    async fn on_report_inner(&mut self, report: StatusReport) {
        let current = self
            .workers
            .get(&report.source_id)
            .map(|slot| slot.generation);
        if current != Some(report.generation) {
            debug!(
                source_id = %report.source_id,
                generation = report.generation,
                "report from a retired worker ignored"
            );
            return;
        }
        let key = report.source_id;

        match report.kind {
            ReportKind::Running => {
                if let Some(state) = self.states.get_mut(&key) {
                    state.status = WorkerStatus::Running;
                    state.last_heartbeat = Some(Utc::now());
                }
            }
            ReportKind::Heartbeat(stats) => {
                if let Some(state) = self.states.get_mut(&key) {
                    apply_stats(state, &stats);
                    state.last_heartbeat = Some(Utc::now());
                }
            }
            ReportKind::Backoff { error, attempt, delay } => {
                debug!(source_id = %key, attempt, delay_ms = delay.as_millis() as u64, "worker backing off");
                let (exceeded, count) = self.record_restart(&key);
                if let Some(state) = self.states.get_mut(&key) {
                    state.status = WorkerStatus::Backoff;
                    state.last_error = Some(error.clone());
                    state.restart_count = count;
                }
                if exceeded {
                    self.fail_source(&key, error).await;
                }
            }
            ReportKind::Failed { error } => {
                self.fail_source(&key, error).await;
            }
            ReportKind::Crashed { error } => {
                error!(source_id = %key, error = %error, "worker crashed");
                self.ctx.metrics.record_restart(&key, "crash");
                if let Some(slot) = self.workers.remove(&key) {
                    slot.cancel.cancel();
                }
                let (exceeded, count) = self.record_restart(&key);
                if let Some(state) = self.states.get_mut(&key) {
                    state.status = WorkerStatus::Backoff;
                    state.last_error = Some(format!("worker crashed: {error}"));
                    state.restart_count = count;
                }
                if exceeded {
                    self.fail_source(&key, format!("worker crashed: {error}")).await;
                } else {
                    self.schedule_restart(&key, count);
                }
            }
            ReportKind::Stopped(stats) => {
                if let Some(state) = self.states.get_mut(&key) {
                    apply_stats(state, &stats);
                }
            }
        }
    }

    /// Returns (threshold exceeded, restarts in window).
    fn record_restart(&mut self, key: &str) -> (bool, u32) {
        match self.entries.get_mut(key) {
            Some(entry) => {
                let exceeded = entry.window.record();
                (exceeded, entry.window.count())
            }
            None => (false, 0),
        }
    }

    async fn fail_source(&mut self, key: &str, error: String) {
        error!(source_id = %key, error = %error, "source failed, automatic restarts halted");
        if let Some(slot) = self.workers.remove(key) {
            stop_slot(key, slot, self.config.stop_timeout).await;
        }
        if let Some(state) = self.states.get_mut(key) {
            state.status = WorkerStatus::Failed;
            state.last_error = Some(error);
            state.degraded = false;
        }
    }

    fn schedule_restart(&self, key: &str, attempt: u32) {
        let Some(revision) = self.entries.get(key).map(|e| e.revision) else {
            return;
        };
        let delay = self.config.worker.retry.delay(attempt.max(1));
        let tx = self.restart_tx.clone();
        let source_id = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(RestartDue { source_id, revision });
        });
    }

    fn on_restart_due(&mut self, due: RestartDue) {
        let Some(entry) = self.entries.get(&due.source_id) else {
            return;
        };
        if entry.revision != due.revision || self.workers.contains_key(&due.source_id) {
            return;
        }
        let failed = self
            .states
            .get(&due.source_id)
            .is_some_and(|s| s.status == WorkerStatus::Failed);
        match &entry.config {
            Some(config) if config.enabled && !failed => {
                info!(source_id = %due.source_id, "restarting crashed worker");
                let config = config.clone();
                self.start_worker(config);
                self.publish_health();
            }
            _ => {}
        }
    }

    async fn shutdown_all(&mut self) {
        info!(workers = self.workers.len(), "shutting down workers");
        let slots: Vec<(String, WorkerSlot)> = self.workers.drain().collect();
        for (_, slot) in &slots {
            slot.cancel.cancel();
        }

        let timeout = self.config.shutdown_timeout;
        let mut stragglers = Vec::new();
        let waits = slots.into_iter().map(|(key, mut slot)| async move {
            match tokio::time::timeout(timeout, &mut slot.monitor).await {
                Ok(_) => None,
                Err(_) => Some((key, slot)),
            }
        });
        for leftover in futures::future::join_all(waits).await.into_iter().flatten() {
            stragglers.push(leftover);
        }
        for (key, slot) in stragglers {
            warn!(source_id = %key, "worker did not stop in time, aborting");
            slot.abort.abort();
            let _ = slot.monitor.await;
        }
        self.ctx.publisher.force_stop();

        while let Ok(report) = self.reports_rx.try_recv() {
            if let ReportKind::Stopped(stats) = report.kind {
                if let Some(state) = self.states.get_mut(&report.source_id) {
                    apply_stats(state, &stats);
                }
            }
        }
        for state in self.states.values_mut() {
            if state.status != WorkerStatus::Failed {
                state.status = WorkerStatus::Stopped;
            }
        }
        self.publish_health();
        info!("all workers stopped");
    }

    fn publish_health(&self) {
        self.health.send_replace(HealthSnapshot {
            generated_at: Some(Utc::now()),
            sources: self.states.clone(),
        });
    }
}

async fn stop_slot(key: &str, mut slot: WorkerSlot, timeout: Duration) {
    slot.cancel.cancel();
    if tokio::time::timeout(timeout, &mut slot.monitor).await.is_err() {
        warn!(source_id = %key, timeout_ms = timeout.as_millis() as u64, "worker did not stop in time, aborting");
        slot.abort.abort();
        let _ = slot.monitor.await;
    }
}

fn apply_stats(state: &mut WorkerState, stats: &WorkerStats) {
    state.position = stats.position.or(state.position);
    state.events_published = stats.events_published;
    state.decode_errors = stats.decode_errors;
    state.duplicates_skipped = stats.duplicates_skipped;
    state.degraded = stats.degraded;
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with a non-string payload".into()
    }
}

//! Keel engine: the level-triggered loop tying transport, stores, differ,
//! scheduler and status reporting together.
//!
//! Every trigger (desired-state message, observed change, retry becoming due,
//! periodic resync) marks the engine dirty; a pass then diffs the *current*
//! desired and observed snapshots and submits the result to the scheduler.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant as StdInstant};

use keel_apply::{diff, ApplyExecutor, DiffSummary};
use keel_core::{Action, ClusterApi, DesiredStateSnapshot, ObservedSnapshot, ResourceDescriptor, WatchFilter};
use keel_sched::{Pass, SchedulerEvent, TaskScheduler};
use keel_store::{DesiredHandle, DesiredStateStore, ObservedChange, ObservedHandle, ObservedStateWatcher, StoreError};
use keel_transport::{Connector, DesiredMessage, LinkState, Transport, TransportEvent, TransportHandle};
use metrics::{counter, gauge, histogram};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub mod config;
pub mod events;
pub mod reporter;

pub use config::{AgentConfig, ConfigError, EngineConfig, EventsConfig};
pub use events::{EventForwarder, EventSink};
pub use reporter::{ReporterConfig, StatusReporter, StatusSink};

pub const RESYNC_ON_STALE: &str = "stale-generation";
pub const RESYNC_ON_STALE_FULL: &str = "stale-full";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("control plane unreachable after {attempts} attempts: {reason}")]
    TransportExhausted { attempts: u32, reason: String },
    #[error("scheduler stopped unexpectedly")]
    SchedulerClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Reconciling,
}

/// Externally visible engine progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    pub phase: Phase,
    pub passes: u64,
    pub desired_generation: u64,
    pub awaiting_full: bool,
    /// Resync requests issued by the engine itself (stale deltas or snapshots).
    pub resync_requests: u64,
    pub halted_kinds: usize,
}

/// Everything the engine drives, constructed by the caller.
pub struct EngineParts {
    pub transport: TransportHandle,
    pub transport_events: mpsc::Receiver<TransportEvent>,
    pub watcher: ObservedStateWatcher,
    pub observed_changes: mpsc::Receiver<ObservedChange>,
    pub scheduler: TaskScheduler,
    pub scheduler_events: mpsc::UnboundedReceiver<SchedulerEvent>,
    pub store: DesiredStateStore,
    pub desired: DesiredHandle,
    pub reporter: StatusReporter,
    /// What the watcher covers; desired resources outside it are held back.
    pub filters: Vec<WatchFilter>,
    pub events: Option<EventForwarder>,
}

impl EngineParts {
    /// Wire every component from a validated configuration.
    pub fn build(api: Arc<dyn ClusterApi>, connector: Arc<dyn Connector>, cfg: &AgentConfig) -> Self {
        let (transport, transport_events) = Transport::spawn(connector, cfg.transport());
        let (watcher, observed_changes) = ObservedStateWatcher::spawn(Arc::clone(&api), cfg.watcher());
        let events = cfg.event_filter().map(|f| {
            EventForwarder::spawn(Arc::clone(&api), Arc::new(transport.clone()), f.kind, cfg.watch.backoff)
        });
        let executor = ApplyExecutor::new(api, cfg.apply_timeout());
        let (scheduler, scheduler_events) = TaskScheduler::spawn(Arc::new(executor), cfg.scheduler.clone());
        let (store, desired) = DesiredStateStore::new();
        let reporter = StatusReporter::new(Arc::new(transport.clone()), cfg.reporter.clone());
        Self {
            transport,
            transport_events,
            watcher,
            observed_changes,
            scheduler,
            scheduler_events,
            store,
            desired,
            reporter,
            filters: cfg.watch.kinds.clone(),
            events,
        }
    }
}

pub struct ReconciliationEngine {
    cfg: EngineConfig,
    flush_every: Duration,
    transport: TransportHandle,
    transport_events: mpsc::Receiver<TransportEvent>,
    watcher: ObservedStateWatcher,
    events: Option<EventForwarder>,
    observed: ObservedHandle,
    observed_changes: mpsc::Receiver<ObservedChange>,
    scheduler: TaskScheduler,
    scheduler_events: mpsc::UnboundedReceiver<SchedulerEvent>,
    store: DesiredStateStore,
    desired: DesiredHandle,
    reporter: StatusReporter,
    filters: Vec<WatchFilter>,
    kinds: Vec<String>,
    awaiting_full: bool,
    stale_full_requested: bool,
    due: Option<Instant>,
    stats: EngineStats,
    stats_tx: watch::Sender<EngineStats>,
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

impl ReconciliationEngine {
    pub fn new(cfg: EngineConfig, reporter_cfg: &ReporterConfig, parts: EngineParts) -> Self {
        let stats = EngineStats {
            phase: Phase::Idle,
            passes: 0,
            desired_generation: 0,
            awaiting_full: true,
            resync_requests: 0,
            halted_kinds: 0,
        };
        let (stats_tx, _) = watch::channel(stats.clone());
        let observed = parts.watcher.handle();
        let mut kinds: Vec<String> = parts.filters.iter().map(|f| f.kind.clone()).collect();
        kinds.sort();
        kinds.dedup();
        Self {
            cfg,
            flush_every: Duration::from_millis(reporter_cfg.coalesce_ms.max(1)),
            transport: parts.transport,
            transport_events: parts.transport_events,
            watcher: parts.watcher,
            events: parts.events,
            observed,
            observed_changes: parts.observed_changes,
            scheduler: parts.scheduler,
            scheduler_events: parts.scheduler_events,
            store: parts.store,
            desired: parts.desired,
            reporter: parts.reporter,
            filters: parts.filters,
            kinds,
            awaiting_full: true,
            stale_full_requested: false,
            due: None,
            stats,
            stats_tx,
        }
    }

    /// Build the engine and all of its components from configuration.
    pub fn from_config(api: Arc<dyn ClusterApi>, connector: Arc<dyn Connector>, cfg: &AgentConfig) -> Self {
        Self::new(cfg.engine.clone(), &cfg.reporter, EngineParts::build(api, connector, cfg))
    }

    pub fn stats(&self) -> watch::Receiver<EngineStats> { self.stats_tx.subscribe() }
    pub fn desired(&self) -> DesiredHandle { self.desired.clone() }
    pub fn observed(&self) -> ObservedHandle { self.observed.clone() }

    /// Run until `shutdown` resolves or the control plane stays unreachable
    /// past the initial connect budget. Pending status is flushed on the way out.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<(), EngineError> {
        tokio::pin!(shutdown);
        let period = Duration::from_secs(self.cfg.resync_interval_secs.max(1));
        let mut resync = tokio::time::interval_at(Instant::now() + period, period);
        let mut flush = tokio::time::interval(self.flush_every);
        info!(kinds = ?self.kinds, "reconciliation engine started");

        let result = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break Ok(());
                }
                ev = self.transport_events.recv() => match ev {
                    Some(ev) => {
                        if let Err(e) = self.on_transport(ev) { break Err(e); }
                    }
                    None => {
                        warn!("transport stopped");
                        break Ok(());
                    }
                },
                Some(change) = self.observed_changes.recv() => self.on_observed(change),
                ev = self.scheduler_events.recv() => match ev {
                    Some(ev) => self.on_scheduler(ev),
                    None => break Err(EngineError::SchedulerClosed),
                },
                _ = resync.tick() => {
                    self.due = None;
                    if let Err(e) = self.reconcile(true).await { break Err(e); }
                }
                _ = sleep_until(self.due) => {
                    self.due = None;
                    if let Err(e) = self.reconcile(false).await { break Err(e); }
                }
                _ = flush.tick() => { self.reporter.flush(); }
            }
        };
        self.stop().await;
        result
    }

    async fn stop(self) {
        let ReconciliationEngine { scheduler, mut scheduler_events, mut reporter, transport, watcher, events, .. } = self;
        drop(events);
        drop(watcher);
        scheduler.shutdown().await;
        while let Ok(ev) = scheduler_events.try_recv() {
            apply_scheduler_event(&mut reporter, ev);
        }
        let flushed = reporter.flush();
        transport.shutdown();
        let mut state = transport.subscribe_state();
        let _ = tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| *s == LinkState::Stopped)).await;
        info!(flushed, "reconciliation engine stopped");
    }

    fn publish_stats(&mut self) {
        self.stats.desired_generation = self.store.generation();
        self.stats.awaiting_full = self.awaiting_full;
        gauge!("engine_awaiting_full", if self.awaiting_full { 1.0 } else { 0.0 });
        self.stats_tx.send_replace(self.stats.clone());
    }

    fn mark_dirty(&mut self) {
        if self.due.is_none() {
            self.due = Some(Instant::now() + Duration::from_millis(self.cfg.debounce_ms));
        }
    }

    fn on_transport(&mut self, ev: TransportEvent) -> Result<(), EngineError> {
        match ev {
            TransportEvent::Connected { session } => {
                // The transport has already asked for a full snapshot on this session.
                self.awaiting_full = true;
                self.stale_full_requested = false;
                info!(session, "connected; awaiting full snapshot");
            }
            TransportEvent::Disconnected { session, reason } => {
                info!(session, %reason, "disconnected; reconciling against last known desired state");
            }
            TransportEvent::Exhausted { attempts, reason } => {
                return Err(EngineError::TransportExhausted { attempts, reason });
            }
            TransportEvent::Desired(DesiredMessage::Full(snapshot)) => match self.store.apply_full(snapshot) {
                Ok(generation) => {
                    self.awaiting_full = false;
                    self.stale_full_requested = false;
                    debug!(generation, "full snapshot applied");
                    self.mark_dirty();
                }
                Err(e) if self.awaiting_full && !self.stale_full_requested => {
                    info!(error = %e, "full snapshot older than local state; requesting another");
                    self.transport.request_resync(RESYNC_ON_STALE_FULL);
                    self.stale_full_requested = true;
                    self.stats.resync_requests += 1;
                }
                Err(e) => warn!(error = %e, "ignoring full snapshot"),
            },
            TransportEvent::Desired(DesiredMessage::Delta(delta)) => {
                if self.awaiting_full {
                    counter!("desired_delta_ignored_total", 1u64);
                    debug!(generation = delta.generation, "ignoring delta while awaiting full snapshot");
                } else {
                    match self.store.apply_delta(delta) {
                        Ok(_) => self.mark_dirty(),
                        Err(StoreError::StaleGeneration { current, base }) => {
                            info!(current, base, "stale delta; requesting full resync");
                            self.transport.request_resync(RESYNC_ON_STALE);
                            self.awaiting_full = true;
                            self.stats.resync_requests += 1;
                        }
                    }
                }
            }
        }
        self.publish_stats();
        Ok(())
    }

    fn on_observed(&mut self, change: ObservedChange) {
        match &change {
            ObservedChange::Failed { kind, reason } => warn!(kind = %kind, %reason, "kind halted"),
            ObservedChange::Relisted { kind, count } => debug!(kind = %kind, count, "kind relisted"),
            _ => {}
        }
        self.mark_dirty();
    }

    fn on_scheduler(&mut self, ev: SchedulerEvent) {
        if matches!(ev, SchedulerEvent::RetryDue(_)) {
            self.mark_dirty();
        }
        if let SchedulerEvent::Cancelled(d) = &ev {
            if self.store.current().contains(d) {
                return;
            }
        }
        apply_scheduler_event(&mut self.reporter, ev);
    }

    /// One pass: diff current desired and observed state and submit the tasks.
    async fn reconcile(&mut self, resync: bool) -> Result<(), EngineError> {
        if !self.store.is_primed() {
            debug!("no desired state yet; skipping pass");
            return Ok(());
        }
        let observed = self.observed.current();
        if !self.observed.is_synced(self.kinds.iter()) {
            debug!("initial lists incomplete; skipping pass");
            return Ok(());
        }
        let t0 = StdInstant::now();
        self.stats.phase = Phase::Reconciling;
        let desired = self.store.current();
        let pruned = self.reporter.retain(|d| {
            desired.contains(d) || observed.resources.get(d).is_some_and(|o| o.is_managed())
        });
        if pruned > 0 {
            debug!(pruned, "dropped status for descriptors no longer desired or managed");
        }
        let tasks = diff(&desired, &observed);
        let summary = DiffSummary::of(&tasks);

        let mut runnable = Vec::with_capacity(tasks.len());
        let mut held: BTreeMap<ResourceDescriptor, String> = BTreeMap::new();
        for task in tasks {
            if let Some(reason) = self.hold_reason(&task.descriptor, &observed) {
                held.insert(task.descriptor.clone(), reason);
                continue;
            }
            if task.action == Action::NoOp {
                if let Some(generation) = task.generation() {
                    self.reporter.converged(&task.descriptor, generation);
                }
            }
            runnable.push(task);
        }
        self.report_held(&desired, &held);

        let pass = Pass { tasks: runnable, desired: Arc::clone(&desired), resync };
        self.scheduler.submit(pass).await.map_err(|_| EngineError::SchedulerClosed)?;

        self.stats.passes += 1;
        self.stats.phase = Phase::Idle;
        self.stats.halted_kinds = observed.failed.len();
        counter!("reconcile_passes_total", 1u64);
        histogram!("reconcile_pass_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(
            generation = desired.generation,
            resync,
            creates = summary.creates,
            updates = summary.updates,
            deletes = summary.deletes,
            noops = summary.noops,
            held = held.len(),
            "reconciliation pass"
        );
        self.publish_stats();
        Ok(())
    }

    fn hold_reason(&self, d: &ResourceDescriptor, observed: &ObservedSnapshot) -> Option<String> {
        if let Some(reason) = observed.failed.get(&d.kind) {
            return Some(format!("watch for {} halted: {}", d.kind, reason));
        }
        let filters: Vec<&WatchFilter> = self.filters.iter().filter(|f| f.kind == d.kind).collect();
        if filters.is_empty() {
            return Some(format!("kind {} is not watched", d.kind));
        }
        if filters.iter().any(|f| f.namespace.is_none() || f.namespace == d.namespace) {
            return None;
        }
        let scopes: Vec<&str> = filters.iter().filter_map(|f| f.namespace.as_deref()).collect();
        Some(format!("outside watched namespace {}", scopes.join(",")))
    }

    fn report_held(&mut self, desired: &DesiredStateSnapshot, held: &BTreeMap<ResourceDescriptor, String>) {
        for (d, reason) in held {
            if let Some(spec) = desired.get(d) {
                self.reporter.degraded(d, spec.generation, reason);
            }
        }
    }
}

fn apply_scheduler_event(reporter: &mut StatusReporter, ev: SchedulerEvent) {
    match ev {
        SchedulerEvent::Dispatched { descriptor, generation, attempt, .. } => {
            reporter.dispatched(&descriptor, generation, attempt)
        }
        SchedulerEvent::Outcome(outcome) => reporter.record(&outcome),
        SchedulerEvent::Cancelled(d) => reporter.forget(&d),
        SchedulerEvent::RetryDue(_) => {}
    }
}

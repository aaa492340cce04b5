//! Keel scheduler: dispatches reconciliation tasks onto worker lanes keyed by
//! descriptor, retries retryable failures with backoff and escalates them to
//! `Fatal` once the attempt budget is spent.
//!
//! A single dispatcher task owns all per-descriptor state. A descriptor is
//! always routed to the same lane and never has more than one task queued or
//! running, so calls for one descriptor never overlap.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use keel_apply::ApplyExecutor;
use keel_core::{
    Action, BackoffConfig, DesiredStateSnapshot, LanePlanner, OutcomeResult, ReconciliationTask, ResourceDescriptor,
    TaskOutcome,
};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of worker lanes, i.e. cross-descriptor concurrency.
    pub workers: usize,
    pub lane_queue: usize,
    pub retry: BackoffConfig,
    /// Attempts before a retryable failure escalates to `Fatal`.
    pub max_attempts: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            lane_queue: 64,
            retry: BackoffConfig { base_ms: 500, multiplier: 2.0, cap_ms: 30_000, jitter: 0.2 },
            max_attempts: 6,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.workers == 0 { return Err("workers must be > 0".into()); }
        if self.lane_queue == 0 { return Err("lane_queue must be > 0".into()); }
        if self.max_attempts == 0 { return Err("max_attempts must be > 0".into()); }
        self.retry.validate().map_err(|e| format!("retry: {}", e))
    }
}

/// Executes one attempt of a task.
#[async_trait]
pub trait TaskRunner: Send + Sync + 'static {
    async fn run(&self, task: &ReconciliationTask, attempt: u32) -> TaskOutcome;
}

#[async_trait]
impl TaskRunner for ApplyExecutor {
    async fn run(&self, task: &ReconciliationTask, attempt: u32) -> TaskOutcome { self.apply(task, attempt).await }
}

/// Tasks derived by one reconciliation pass.
#[derive(Debug, Clone)]
pub struct Pass {
    pub tasks: Vec<ReconciliationTask>,
    /// Desired state the pass was computed from; pending retries for
    /// descriptors missing from it are cancelled.
    pub desired: Arc<DesiredStateSnapshot>,
    /// Periodic resync: re-dispatches work that previously ended `Fatal`.
    pub resync: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    Dispatched { descriptor: ResourceDescriptor, action: Action, generation: Option<u64>, attempt: u32 },
    /// Result of one attempt. A `Retryable` result is followed by another attempt.
    Outcome(TaskOutcome),
    /// A backoff elapsed and the task was handed to its lane again.
    RetryDue(ResourceDescriptor),
    /// A pending retry was dropped because the descriptor left desired state
    /// or its work is no longer needed.
    Cancelled(ResourceDescriptor),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler stopped")]
    Closed,
}

enum Command {
    Submit(Pass),
    Shutdown,
}

struct Job {
    task: ReconciliationTask,
    attempt: u32,
}

struct Done {
    task: ReconciliationTask,
    outcome: TaskOutcome,
}

enum Slot {
    Running { task: ReconciliationTask, attempt: u32, next: Option<ReconciliationTask> },
    Waiting { task: ReconciliationTask, attempt: u32, timer: (Instant, u64) },
}

pub struct TaskScheduler {
    cmd_tx: mpsc::Sender<Command>,
    join: Option<JoinHandle<()>>,
}

impl TaskScheduler {
    /// Start the dispatcher and its lanes. Events are delivered on an
    /// unbounded channel so the dispatcher never waits on its consumer.
    pub fn spawn(runner: Arc<dyn TaskRunner>, cfg: SchedulerConfig) -> (Self, mpsc::UnboundedReceiver<SchedulerEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let workers = cfg.workers.max(1);
        let mut lanes = Vec::with_capacity(workers);
        let mut lane_joins = Vec::with_capacity(workers);
        for idx in 0..workers {
            let (tx, rx) = mpsc::channel(cfg.lane_queue.max(1));
            lanes.push(tx);
            lane_joins.push(tokio::spawn(lane(idx, Arc::clone(&runner), rx, done_tx.clone())));
        }
        let dispatcher = Dispatcher {
            planner: LanePlanner::new(workers),
            lanes,
            slots: HashMap::new(),
            timers: BTreeMap::new(),
            timer_seq: 0,
            fatal: HashMap::new(),
            ev_tx,
            cfg,
        };
        let join = tokio::spawn(dispatcher.run(cmd_rx, done_rx, lane_joins));
        info!(workers, "scheduler started");
        (Self { cmd_tx, join: Some(join) }, ev_rx)
    }

    pub async fn submit(&self, pass: Pass) -> Result<(), SchedulerError> {
        self.cmd_tx.send(Command::Submit(pass)).await.map_err(|_| SchedulerError::Closed)
    }

    /// Stop accepting work, let lanes finish what they hold and wait for them.
    pub async fn shutdown(mut self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() { join.abort(); }
    }
}

async fn lane(
    idx: usize,
    runner: Arc<dyn TaskRunner>,
    mut rx: mpsc::Receiver<Job>,
    done: mpsc::UnboundedSender<Done>,
) {
    while let Some(job) = rx.recv().await {
        let outcome = runner.run(&job.task, job.attempt).await;
        if done.send(Done { task: job.task, outcome }).is_err() {
            break;
        }
    }
    debug!(lane = idx, "lane stopped");
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

struct Dispatcher {
    planner: LanePlanner,
    lanes: Vec<mpsc::Sender<Job>>,
    slots: HashMap<ResourceDescriptor, Slot>,
    timers: BTreeMap<(Instant, u64), ResourceDescriptor>,
    timer_seq: u64,
    /// Work that ended `Fatal`, suppressed until a resync pass or new generation.
    fatal: HashMap<ResourceDescriptor, (Action, Option<u64>)>,
    ev_tx: mpsc::UnboundedSender<SchedulerEvent>,
    cfg: SchedulerConfig,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut done_rx: mpsc::UnboundedReceiver<Done>,
        lane_joins: Vec<JoinHandle<()>>,
    ) {
        loop {
            let next_due = self.timers.keys().next().map(|(at, _)| *at);
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Submit(pass)) => self.submit(pass).await,
                    Some(Command::Shutdown) | None => break,
                },
                Some(done) = done_rx.recv() => self.complete(done).await,
                _ = sleep_until(next_due) => self.fire_due().await,
            }
            gauge!("sched_inflight", self.running() as f64);
            gauge!("sched_retry_pending", self.timers.len() as f64);
        }
        self.lanes.clear();
        for j in lane_joins {
            let _ = j.await;
        }
        info!("scheduler stopped");
    }

    fn running(&self) -> usize { self.slots.values().filter(|s| matches!(s, Slot::Running { .. })).count() }

    fn emit(&self, ev: SchedulerEvent) { let _ = self.ev_tx.send(ev); }

    async fn submit(&mut self, pass: Pass) {
        self.cancel_removed(&pass.desired);
        for task in pass.tasks {
            if task.action == Action::NoOp {
                self.settle(&task);
                continue;
            }
            let work = (task.action, task.generation());
            if let Some(prev) = self.fatal.get(&task.descriptor) {
                if *prev == work && !pass.resync {
                    debug!(descriptor = %task.descriptor, action = %task.action, "suppressing work that failed permanently");
                    continue;
                }
            }
            self.fatal.remove(&task.descriptor);
            match self.slots.get_mut(&task.descriptor) {
                None => self.dispatch(task, 1).await,
                Some(Slot::Running { task: cur, next, .. }) => {
                    if cur.same_work(&task) {
                        *next = None;
                    } else if next.as_ref().map_or(true, |n| !n.same_work(&task)) {
                        debug!(descriptor = %task.descriptor, action = %task.action, "queued behind in-flight task");
                        *next = Some(task);
                    }
                }
                Some(Slot::Waiting { task: cur, .. }) => {
                    if !cur.same_work(&task) {
                        self.drop_waiting(&task.descriptor);
                        self.dispatch(task, 1).await;
                    }
                }
            }
        }
    }

    /// A NoOp means the descriptor already matches desired state; pending work for it is moot.
    fn settle(&mut self, task: &ReconciliationTask) {
        self.fatal.remove(&task.descriptor);
        match self.slots.get_mut(&task.descriptor) {
            Some(Slot::Waiting { .. }) => {
                self.drop_waiting(&task.descriptor);
                self.emit(SchedulerEvent::Cancelled(task.descriptor.clone()));
            }
            Some(Slot::Running { next, .. }) => *next = None,
            None => {}
        }
    }

    fn cancel_removed(&mut self, desired: &DesiredStateSnapshot) {
        let before = self.fatal.len();
        self.fatal.retain(|d, (action, _)| *action == Action::Delete || desired.contains(d));
        if self.fatal.len() < before {
            debug!(pruned = before - self.fatal.len(), "forgot permanent failures for descriptors removed from desired state");
        }
        gauge!("sched_fatal_suppressed", self.fatal.len() as f64);
        let stale: Vec<ResourceDescriptor> = self
            .slots
            .iter()
            .filter_map(|(d, slot)| match slot {
                Slot::Waiting { task, .. } if task.action != Action::Delete && !desired.contains(d) => Some(d.clone()),
                _ => None,
            })
            .collect();
        for d in stale {
            info!(descriptor = %d, "cancelling retry for descriptor removed from desired state");
            self.drop_waiting(&d);
            self.emit(SchedulerEvent::Cancelled(d));
        }
        for (d, slot) in self.slots.iter_mut() {
            if let Slot::Running { next, .. } = slot {
                if next.as_ref().is_some_and(|n| n.action != Action::Delete && !desired.contains(d)) {
                    *next = None;
                }
            }
        }
    }

    fn drop_waiting(&mut self, d: &ResourceDescriptor) {
        if let Some(Slot::Waiting { timer, .. }) = self.slots.remove(d) {
            self.timers.remove(&timer);
        }
    }

    async fn dispatch(&mut self, task: ReconciliationTask, attempt: u32) {
        let d = task.descriptor.clone();
        self.emit(SchedulerEvent::Dispatched {
            descriptor: d.clone(),
            action: task.action,
            generation: task.generation(),
            attempt,
        });
        debug!(descriptor = %d, action = %task.action, attempt, "dispatching");
        let lane = self.planner.lane(&d);
        self.slots.insert(d.clone(), Slot::Running { task: task.clone(), attempt, next: None });
        if self.lanes[lane].send(Job { task, attempt }).await.is_err() {
            error!(descriptor = %d, lane, "lane closed; dropping task");
            self.slots.remove(&d);
        }
    }

    async fn complete(&mut self, done: Done) {
        let d = done.task.descriptor.clone();
        let (attempt, next) = match self.slots.remove(&d) {
            Some(Slot::Running { attempt, next, .. }) => (attempt, next),
            other => {
                // Should not happen: only running tasks reach a lane.
                warn!(descriptor = %d, "completion for a descriptor that was not running");
                if let Some(slot) = other { self.slots.insert(d.clone(), slot); }
                (done.outcome.attempt, None)
            }
        };
        let mut outcome = done.outcome;
        if let OutcomeResult::Retryable(reason) = &outcome.result {
            if attempt >= self.cfg.max_attempts {
                warn!(descriptor = %d, attempt, %reason, "retries exhausted");
                outcome.result = OutcomeResult::Fatal(format!("retries exhausted after {} attempts: {}", attempt, reason));
            }
        }

        match &outcome.result {
            OutcomeResult::Converged => {
                self.fatal.remove(&d);
            }
            OutcomeResult::Fatal(_) => {
                self.fatal.insert(d.clone(), (done.task.action, done.task.generation()));
            }
            OutcomeResult::Retryable(_) if next.is_none() => {
                let delay = self.cfg.retry.delay(attempt.saturating_sub(1));
                let at = Instant::now() + delay;
                self.timer_seq += 1;
                let timer = (at, self.timer_seq);
                self.timers.insert(timer, d.clone());
                counter!("sched_retries_total", 1u64);
                debug!(descriptor = %d, attempt, delay_ms = delay.as_millis() as u64, "retry scheduled");
                self.slots.insert(d.clone(), Slot::Waiting { task: done.task, attempt: attempt + 1, timer });
            }
            // Newer work superseded the failed task; it starts afresh below.
            OutcomeResult::Retryable(_) => {}
        }
        self.emit(SchedulerEvent::Outcome(outcome));
        if let Some(next) = next {
            self.dispatch(next, 1).await;
        }
    }

    async fn fire_due(&mut self) {
        let now = Instant::now();
        let due: Vec<(Instant, u64)> = self.timers.range(..=(now, u64::MAX)).map(|(k, _)| *k).collect();
        for key in due {
            let Some(d) = self.timers.remove(&key) else { continue };
            if let Some(Slot::Waiting { task, attempt, .. }) = self.slots.remove(&d) {
                self.dispatch(task, attempt).await;
                self.emit(SchedulerEvent::RetryDue(d));
            }
        }
    }
}

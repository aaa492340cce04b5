//! Folds task outcomes into per-descriptor convergence status and publishes
//! changes upstream, coalesced per descriptor between flushes.
//!
//! A status counts as published only once the sink accepts it. Reports the
//! sink refuses, or that the bounded queue evicts, stay unsent and are queued
//! again on the next flush.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use keel_core::{Action, ConvergenceStatus, Health, OutcomeResult, ResourceDescriptor, TaskOutcome};
use keel_store::Coalescer;
use keel_transport::TransportHandle;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Where status reports go. Must not block.
pub trait StatusSink: Send + Sync {
    fn publish(&self, status: ConvergenceStatus) -> bool;
}

impl StatusSink for TransportHandle {
    fn publish(&self, status: ConvergenceStatus) -> bool { TransportHandle::publish(self, status) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReporterConfig {
    /// Consecutive retryable attempts after which health becomes `Degraded`.
    pub degraded_after: u32,
    /// Flush period; changes to one descriptor within it collapse to the latest.
    pub coalesce_ms: u64,
    pub capacity: usize,
}

impl Default for ReporterConfig {
    fn default() -> Self { Self { degraded_after: 3, coalesce_ms: 250, capacity: 4096 } }
}

impl ReporterConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.degraded_after == 0 { return Err("degraded_after must be > 0".into()); }
        if self.coalesce_ms == 0 { return Err("coalesce_ms must be > 0".into()); }
        if self.capacity == 0 { return Err("capacity must be > 0".into()); }
        Ok(())
    }
}

pub struct StatusReporter {
    cfg: ReporterConfig,
    sink: Arc<dyn StatusSink>,
    last: HashMap<ResourceDescriptor, ConvergenceStatus>,
    published: HashMap<ResourceDescriptor, ConvergenceStatus>,
    unsent: HashMap<ResourceDescriptor, ConvergenceStatus>,
    pending: Coalescer<ResourceDescriptor, ConvergenceStatus>,
}

impl StatusReporter {
    pub fn new(sink: Arc<dyn StatusSink>, cfg: ReporterConfig) -> Self {
        let pending = Coalescer::with_capacity(cfg.capacity);
        Self { cfg, sink, last: HashMap::new(), published: HashMap::new(), unsent: HashMap::new(), pending }
    }

    pub fn status(&self, d: &ResourceDescriptor) -> Option<&ConvergenceStatus> { self.last.get(d) }
    pub fn pending(&self) -> usize { self.pending.len() }
    pub fn tracked(&self) -> usize { self.last.len() }

    /// A task for `d` was handed to a lane. A retry past the degraded threshold stays `Degraded`.
    pub fn dispatched(&mut self, d: &ResourceDescriptor, generation: Option<u64>, attempt: u32) {
        let degraded_after = self.cfg.degraded_after;
        self.update(d, |prev| {
            let still_degraded =
                prev.filter(|p| attempt > 1 && p.health == Health::Degraded && p.desired_generation == generation);
            let (health, reason) = match still_degraded {
                Some(p) => (Health::Degraded, p.reason.clone()),
                None if attempt > degraded_after => (Health::Degraded, None),
                None => (Health::Progressing, None),
            };
            ConvergenceStatus {
                descriptor: d.clone(),
                desired_generation: generation,
                last_applied_generation: prev.and_then(|p| p.last_applied_generation),
                health,
                attempt,
                reason,
                timestamp: Utc::now(),
            }
        });
    }

    pub fn record(&mut self, outcome: &TaskOutcome) {
        let d = &outcome.descriptor;
        let (health, reason) = match &outcome.result {
            OutcomeResult::Converged => (Health::Converged, None),
            OutcomeResult::Retryable(r) if outcome.attempt >= self.cfg.degraded_after => (Health::Degraded, Some(r.clone())),
            OutcomeResult::Retryable(r) => (Health::Progressing, Some(r.clone())),
            OutcomeResult::Fatal(r) => (Health::Failed, Some(r.clone())),
        };
        let applied = matches!(outcome.result, OutcomeResult::Converged);
        self.update(d, |prev| ConvergenceStatus {
            descriptor: d.clone(),
            desired_generation: outcome.generation,
            last_applied_generation: if applied { outcome.generation } else { prev.and_then(|p| p.last_applied_generation) },
            health,
            attempt: outcome.attempt,
            reason,
            timestamp: outcome.last_attempt,
        });
        if applied && outcome.action == Action::Delete {
            // Gone from the cluster and from desired state; keep only the pending report.
            self.forget(d);
        }
    }

    /// The descriptor already matches desired state.
    pub fn converged(&mut self, d: &ResourceDescriptor, generation: u64) {
        self.update(d, |prev| ConvergenceStatus {
            descriptor: d.clone(),
            desired_generation: Some(generation),
            last_applied_generation: Some(generation),
            health: Health::Converged,
            attempt: prev.filter(|p| p.health == Health::Converged).map_or(0, |p| p.attempt),
            reason: None,
            timestamp: Utc::now(),
        });
    }

    /// Reconciliation of `d` is on hold, e.g. because its kind cannot be watched.
    pub fn degraded(&mut self, d: &ResourceDescriptor, generation: u64, reason: &str) {
        self.update(d, |prev| ConvergenceStatus {
            descriptor: d.clone(),
            desired_generation: Some(generation),
            last_applied_generation: prev.and_then(|p| p.last_applied_generation),
            health: Health::Degraded,
            attempt: prev.map_or(0, |p| p.attempt),
            reason: Some(reason.to_string()),
            timestamp: Utc::now(),
        });
    }

    /// Stop tracking `d`. A report not yet published still goes out on a later flush.
    pub fn forget(&mut self, d: &ResourceDescriptor) {
        self.last.remove(d);
        self.published.remove(d);
    }

    /// Drop state for descriptors `keep` rejects, along with any report still owed for them.
    pub fn retain(&mut self, keep: impl Fn(&ResourceDescriptor) -> bool) -> usize {
        let gone: Vec<ResourceDescriptor> = self.last.keys().filter(|d| !keep(d)).cloned().collect();
        for d in &gone {
            self.last.remove(d);
            self.published.remove(d);
            self.unsent.remove(d);
            self.pending.remove(d);
        }
        gone.len()
    }

    /// Publish every coalesced change. Returns how many reports the sink accepted.
    pub fn flush(&mut self) -> usize {
        let mut sent = 0;
        let mut refused = 0;
        for status in self.pending.drain_ready() {
            let d = status.descriptor.clone();
            if self.published.get(&d).is_some_and(|p| p.same_state(&status)) {
                self.unsent.remove(&d);
                continue;
            }
            if !self.sink.publish(status.clone()) {
                refused += 1;
                continue;
            }
            counter!("status_published_total", 1u64);
            sent += 1;
            self.unsent.remove(&d);
            if self.last.contains_key(&d) {
                self.published.insert(d, status);
            }
        }
        // Whatever is still owed, refused or evicted, goes out next time.
        let owed: Vec<ConvergenceStatus> = self.unsent.values().cloned().collect();
        for status in owed {
            self.enqueue(status);
        }
        if refused > 0 { debug!(refused, "status sink refused reports; retrying on next flush"); }
        if sent > 0 { debug!(reports = sent, "status flushed"); }
        sent
    }

    fn update(&mut self, d: &ResourceDescriptor, next: impl FnOnce(Option<&ConvergenceStatus>) -> ConvergenceStatus) {
        let status = next(self.last.get(d));
        if self.last.get(d).is_some_and(|p| p.same_state(&status)) {
            return;
        }
        self.last.insert(d.clone(), status.clone());
        if self.published.get(d).is_some_and(|p| p.same_state(&status)) {
            // Back to what upstream already has.
            self.unsent.remove(d);
            self.pending.remove(d);
            return;
        }
        self.unsent.insert(d.clone(), status.clone());
        self.enqueue(status);
    }

    fn enqueue(&mut self, status: ConvergenceStatus) {
        let before = self.pending.dropped();
        self.pending.push(status.descriptor.clone(), status);
        let evicted = self.pending.dropped() - before;
        if evicted > 0 {
            counter!("status_coalesce_dropped_total", evicted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ConvergenceStatus>>);

    impl StatusSink for Recorder {
        fn publish(&self, status: ConvergenceStatus) -> bool {
            self.0.lock().unwrap().push(status);
            true
        }
    }

    impl Recorder {
        fn take(&self) -> Vec<(String, Health, u32)> {
            self.0.lock().unwrap().drain(..).map(|s| (s.descriptor.name, s.health, s.attempt)).collect()
        }
    }

    fn cm(name: &str) -> ResourceDescriptor { ResourceDescriptor::namespaced("v1/ConfigMap", "default", name) }

    fn outcome(name: &str, result: OutcomeResult, attempt: u32) -> TaskOutcome {
        TaskOutcome {
            descriptor: cm(name),
            action: Action::Update,
            generation: Some(2),
            result,
            attempt,
            last_attempt: Utc::now(),
        }
    }

    fn reporter() -> (StatusReporter, Arc<Recorder>) {
        let rec = Arc::new(Recorder::default());
        (StatusReporter::new(rec.clone(), ReporterConfig::default()), rec)
    }

    #[test]
    fn health_follows_outcomes() {
        let (mut r, rec) = reporter();
        r.record(&outcome("a", OutcomeResult::Retryable("conflict".into()), 1));
        r.flush();
        r.record(&outcome("a", OutcomeResult::Retryable("conflict".into()), 3));
        r.flush();
        r.record(&outcome("a", OutcomeResult::Fatal("forbidden".into()), 4));
        r.flush();
        r.record(&outcome("a", OutcomeResult::Converged, 5));
        r.flush();
        assert_eq!(
            rec.take(),
            vec![
                ("a".into(), Health::Progressing, 1),
                ("a".into(), Health::Degraded, 3),
                ("a".into(), Health::Failed, 4),
                ("a".into(), Health::Converged, 5),
            ]
        );
        assert_eq!(r.status(&cm("a")).unwrap().last_applied_generation, Some(2));
    }

    #[test]
    fn rapid_changes_collapse_to_latest() {
        let (mut r, rec) = reporter();
        r.dispatched(&cm("a"), Some(2), 1);
        r.record(&outcome("a", OutcomeResult::Retryable("conflict".into()), 1));
        r.dispatched(&cm("a"), Some(2), 2);
        r.record(&outcome("a", OutcomeResult::Converged, 2));
        r.dispatched(&cm("b"), Some(2), 1);
        assert_eq!(r.pending(), 2);
        r.flush();
        assert_eq!(rec.take(), vec![("a".into(), Health::Converged, 2), ("b".into(), Health::Progressing, 1)]);
    }

    #[test]
    fn unchanged_state_is_not_republished() {
        let (mut r, rec) = reporter();
        r.converged(&cm("a"), 1);
        r.flush();
        r.converged(&cm("a"), 1);
        r.flush();
        assert_eq!(rec.take().len(), 1);
    }

    #[test]
    fn completed_delete_is_reported_then_forgotten() {
        let (mut r, rec) = reporter();
        r.converged(&cm("a"), 1);
        r.flush();
        let mut o = outcome("a", OutcomeResult::Converged, 1);
        o.action = Action::Delete;
        o.generation = None;
        r.record(&o);
        assert!(r.status(&cm("a")).is_none());
        r.flush();
        let sent = rec.take();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].1, Health::Converged);
    }

    #[test]
    fn retry_dispatch_past_threshold_stays_degraded() {
        let (mut r, rec) = reporter();
        r.record(&outcome("a", OutcomeResult::Retryable("conflict".into()), 3));
        r.dispatched(&cm("a"), Some(2), 4);
        let s = r.status(&cm("a")).unwrap();
        assert_eq!((s.health, s.attempt), (Health::Degraded, 4));
        assert_eq!(s.reason.as_deref(), Some("conflict"));
        r.flush();
        assert_eq!(rec.take(), vec![("a".into(), Health::Degraded, 4)]);

        // A new generation starts over.
        r.dispatched(&cm("a"), Some(3), 1);
        assert_eq!(r.status(&cm("a")).unwrap().health, Health::Progressing);
    }

    #[test]
    fn evicted_reports_are_sent_on_a_later_flush() {
        let rec = Arc::new(Recorder::default());
        let mut r = StatusReporter::new(rec.clone(), ReporterConfig { capacity: 2, ..ReporterConfig::default() });
        for name in ["a", "b", "c"] { r.converged(&cm(name), 1); }
        assert_eq!(r.flush(), 2);
        for name in ["a", "b", "c"] { r.converged(&cm(name), 1); }
        assert_eq!(r.flush(), 1);
        assert_eq!(r.flush(), 0);
        let mut names: Vec<String> = rec.take().into_iter().map(|(n, _, _)| n).collect();
        names.sort();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    struct Flaky { accept: AtomicBool, inner: Recorder }

    impl StatusSink for Flaky {
        fn publish(&self, status: ConvergenceStatus) -> bool {
            self.accept.load(Ordering::SeqCst) && self.inner.publish(status)
        }
    }

    #[test]
    fn refused_reports_are_retried() {
        let sink = Arc::new(Flaky { accept: AtomicBool::new(false), inner: Recorder::default() });
        let mut r = StatusReporter::new(sink.clone(), ReporterConfig::default());
        r.converged(&cm("a"), 1);
        assert_eq!(r.flush(), 0);
        r.converged(&cm("a"), 1);
        sink.accept.store(true, Ordering::SeqCst);
        assert_eq!(r.flush(), 1);
        assert_eq!(sink.inner.take(), vec![("a".into(), Health::Converged, 0)]);
        assert_eq!(r.flush(), 0);
    }

    #[test]
    fn retain_drops_descriptors_that_left_desired_state() {
        let (mut r, rec) = reporter();
        r.converged(&cm("a"), 1);
        r.converged(&cm("b"), 1);
        r.flush();
        r.degraded(&cm("b"), 2, "watch forbidden");
        assert_eq!(r.retain(|d| d.name == "a"), 1);
        assert_eq!(r.tracked(), 1);
        assert!(r.status(&cm("b")).is_none());
        rec.take();
        assert_eq!(r.flush(), 0);
    }

    #[test]
    fn degraded_keeps_last_applied_generation() {
        let (mut r, _) = reporter();
        r.converged(&cm("a"), 1);
        r.degraded(&cm("a"), 2, "watch forbidden");
        let s = r.status(&cm("a")).unwrap();
        assert_eq!((s.health, s.desired_generation, s.last_applied_generation), (Health::Degraded, Some(2), Some(1)));
        assert_eq!(s.reason.as_deref(), Some("watch forbidden"));
    }
}

//! Pure diff between desired and observed state.

use std::cmp::Reverse;

use keel_core::{Action, DesiredStateSnapshot, ObservedSnapshot, ReconciliationTask};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
    pub noops: usize,
}

impl DiffSummary {
    pub fn of(tasks: &[ReconciliationTask]) -> Self {
        let mut s = DiffSummary::default();
        for t in tasks {
            match t.action {
                Action::Create => s.creates += 1,
                Action::Update => s.updates += 1,
                Action::Delete => s.deletes += 1,
                Action::NoOp => s.noops += 1,
            }
        }
        s
    }

    pub fn is_converged(&self) -> bool { self.creates + self.updates + self.deletes == 0 }
}

/// Tasks that require a cluster call.
pub fn actionable(tasks: &[ReconciliationTask]) -> impl Iterator<Item = &ReconciliationTask> {
    tasks.iter().filter(|t| t.action != Action::NoOp)
}

/// Compute the ordered task list converging `observed` onto `desired`.
///
/// - desired, not observed: Create
/// - desired, observed at another applied generation: Update expecting the observed version
/// - desired, observed at the same applied generation: NoOp
/// - observed and managed by the agent, not desired: Delete expecting the observed version
///
/// Order: Creates, Updates, Deletes, then NoOps. Creates and updates run
/// parents first (ascending priority), deletes children first (descending);
/// ties fall back to the descriptor's natural order.
pub fn diff(desired: &DesiredStateSnapshot, observed: &ObservedSnapshot) -> Vec<ReconciliationTask> {
    let mut creates = Vec::new();
    let mut updates = Vec::new();
    let mut deletes = Vec::new();
    let mut noops = Vec::new();

    for (d, spec) in &desired.resources {
        let prio = spec.order_hint.unwrap_or_else(|| d.default_priority());
        match observed.get(d) {
            None => creates.push((prio, ReconciliationTask::create(d.clone(), spec.clone()))),
            Some(o) if o.applied_generation == Some(spec.generation) => {
                noops.push(ReconciliationTask::noop(d.clone(), spec.clone()))
            }
            Some(o) => updates.push((prio, ReconciliationTask::update(d.clone(), spec.clone(), o.version.clone()))),
        }
    }

    for (d, o) in &observed.resources {
        if o.is_managed() && !desired.contains(d) {
            deletes.push((d.default_priority(), ReconciliationTask::delete(d.clone(), o.version.clone())));
        }
    }

    creates.sort_by(|(pa, a), (pb, b)| pa.cmp(pb).then_with(|| a.descriptor.cmp(&b.descriptor)));
    updates.sort_by(|(pa, a), (pb, b)| pa.cmp(pb).then_with(|| a.descriptor.cmp(&b.descriptor)));
    deletes.sort_by_key(|(p, t)| (Reverse(*p), t.descriptor.clone()));
    noops.sort_by(|a, b| a.descriptor.cmp(&b.descriptor));

    let mut out = Vec::with_capacity(creates.len() + updates.len() + deletes.len() + noops.len());
    out.extend(creates.into_iter().map(|(_, t)| t));
    out.extend(updates.into_iter().map(|(_, t)| t));
    out.extend(deletes.into_iter().map(|(_, t)| t));
    out.extend(noops);
    out
}

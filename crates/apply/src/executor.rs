//! Executes one reconciliation task against the cluster API.
//!
//! Every attempt reads the live object first, so a replayed task whose
//! effect already landed reports `Converged` instead of repeating the write.

use std::sync::Arc;
use std::time::{Duration, Instant};

use keel_core::{
    Action, ClusterApi, ClusterError, DesiredSpec, ObservedResource, OutcomeResult, ReconciliationTask,
    ResourceVersion, TaskOutcome,
};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

/// Map a cluster error into an outcome for the given action.
pub fn classify(action: Action, err: &ClusterError) -> OutcomeResult {
    match err {
        ClusterError::NotFound(_) if action == Action::Delete => OutcomeResult::Converged,
        ClusterError::PermissionDenied(_) | ClusterError::MalformedSpec(_) => OutcomeResult::Fatal(err.to_string()),
        ClusterError::VersionConflict(_)
        | ClusterError::AlreadyExists(_)
        | ClusterError::NotFound(_)
        | ClusterError::TransientNetwork(_)
        | ClusterError::ResumeTokenExpired => OutcomeResult::Retryable(err.to_string()),
    }
}

#[derive(Clone)]
pub struct ApplyExecutor {
    api: Arc<dyn ClusterApi>,
    timeout: Duration,
}

impl ApplyExecutor {
    pub fn new(api: Arc<dyn ClusterApi>, timeout: Duration) -> Self { Self { api, timeout } }

    pub fn timeout(&self) -> Duration { self.timeout }

    /// Carry out `task`. `attempt` is one-based; attempts after the first
    /// refresh the expected version from the live object.
    pub async fn apply(&self, task: &ReconciliationTask, attempt: u32) -> TaskOutcome {
        counter!("apply_attempts", 1u64);
        let t0 = Instant::now();
        let result = match tokio::time::timeout(self.timeout, self.run(task, attempt)).await {
            Ok(Ok(())) => OutcomeResult::Converged,
            Ok(Err(e)) => classify(task.action, &e),
            Err(_) => OutcomeResult::Retryable(format!("timed out after {}ms", self.timeout.as_millis())),
        };
        histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &result {
            OutcomeResult::Converged => {
                counter!("apply_ok", 1u64);
                debug!(descriptor = %task.descriptor, action = %task.action, attempt, "task converged");
            }
            OutcomeResult::Retryable(reason) => {
                counter!("apply_err", 1u64);
                info!(descriptor = %task.descriptor, action = %task.action, attempt, %reason, "task will retry");
            }
            OutcomeResult::Fatal(reason) => {
                counter!("apply_err", 1u64);
                warn!(descriptor = %task.descriptor, action = %task.action, attempt, %reason, "task failed permanently");
            }
        }
        TaskOutcome::for_task(task, result, attempt)
    }

    async fn run(&self, task: &ReconciliationTask, attempt: u32) -> Result<(), ClusterError> {
        let d = &task.descriptor;
        match task.action {
            Action::NoOp => Ok(()),
            Action::Create => {
                let spec = desired_of(task)?;
                match self.api.get(d).await? {
                    None => self.api.create(d, spec).await.map(drop),
                    Some(cur) if already_applied(&cur, spec) => Ok(()),
                    // Someone created it in the meantime; take it over at its current version.
                    Some(cur) => self.api.update(d, spec, &cur.version).await.map(drop),
                }
            }
            Action::Update => {
                let spec = desired_of(task)?;
                let Some(cur) = self.api.get(d).await? else {
                    return Err(ClusterError::NotFound(d.to_string()));
                };
                if already_applied(&cur, spec) {
                    return Ok(());
                }
                if attempt > 1 && replaced_by_foreign_owner(task, &cur) {
                    // Adoption is decided by a fresh diff, never by a retry.
                    return Err(ClusterError::VersionConflict(format!("{} was replaced by an unmanaged object", d)));
                }
                let expected = expected_for(task, attempt, &cur);
                self.api.update(d, spec, &expected).await.map(drop)
            }
            Action::Delete => {
                let Some(cur) = self.api.get(d).await? else { return Ok(()) };
                if !cur.is_managed() {
                    info!(descriptor = %d, version = %cur.version, "object is no longer managed; leaving it in place");
                    return Ok(());
                }
                let expected = expected_for(task, attempt, &cur);
                self.api.delete(d, Some(&expected)).await
            }
        }
    }
}

fn desired_of(task: &ReconciliationTask) -> Result<&DesiredSpec, ClusterError> {
    task.desired
        .as_ref()
        .ok_or_else(|| ClusterError::MalformedSpec(format!("{} task for {} carries no payload", task.action, task.descriptor)))
}

fn already_applied(cur: &ObservedResource, spec: &DesiredSpec) -> bool {
    cur.applied_generation == Some(spec.generation)
}

fn replaced_by_foreign_owner(task: &ReconciliationTask, cur: &ObservedResource) -> bool {
    !cur.is_managed() && task.expected_version.as_ref().is_some_and(|v| *v != cur.version)
}

fn expected_for(task: &ReconciliationTask, attempt: u32, cur: &ObservedResource) -> ResourceVersion {
    match (&task.expected_version, attempt) {
        (Some(v), 0 | 1) => v.clone(),
        _ => cur.version.clone(),
    }
}

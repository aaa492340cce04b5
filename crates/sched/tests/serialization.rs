use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use keel_apply::ApplyExecutor;
use keel_core::memory::MemoryCluster;
use keel_core::prelude::*;
use keel_core::{BackoffConfig, ClusterApi};
use keel_sched::{Pass, SchedulerConfig, SchedulerEvent, TaskScheduler};

fn cm(i: usize) -> ResourceDescriptor { ResourceDescriptor::namespaced("v1/ConfigMap", "load", format!("cm-{:02}", i)) }

fn pass_at(gen: u64, n: usize) -> Pass {
    let mut desired = DesiredStateSnapshot::new(gen);
    let mut tasks = Vec::new();
    for i in 0..n {
        let spec = DesiredSpec::new(gen, serde_json::json!({"data": {"gen": gen.to_string()}}));
        desired = desired.with(cm(i), spec.clone());
        tasks.push(ReconciliationTask::create(cm(i), spec));
    }
    Pass { tasks, desired: Arc::new(desired), resync: false }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn no_descriptor_ever_sees_overlapping_calls() {
    let cluster = Arc::new(MemoryCluster::new().with_latency(Duration::from_millis(15)));
    let exec = ApplyExecutor::new(cluster.clone() as Arc<dyn ClusterApi>, Duration::from_secs(5));
    let cfg = SchedulerConfig {
        workers: 3,
        retry: BackoffConfig { base_ms: 5, multiplier: 2.0, cap_ms: 20, jitter: 0.0 },
        ..Default::default()
    };
    let (sched, mut rx) = TaskScheduler::spawn(Arc::new(exec), cfg);

    let n = 12;
    for gen in 1..=3 {
        sched.submit(pass_at(gen, n)).await.unwrap();
    }

    let mut done = HashSet::new();
    while done.len() < n {
        let ev = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await.unwrap().unwrap();
        if let SchedulerEvent::Outcome(o) = ev {
            if o.result == OutcomeResult::Converged && o.generation == Some(3) {
                done.insert(o.descriptor);
            }
        }
    }

    assert_eq!(cluster.max_concurrent_per_descriptor(), 1);
    for i in 0..n {
        assert_eq!(cluster.object(&cm(i)).unwrap().applied_generation, Some(3));
    }
    sched.shutdown().await;
}

//! Forwards cluster events upstream as they happen.
//!
//! Events present at (re)list time are history and are skipped; only
//! events applied while the watch is open are forwarded.

use std::sync::Arc;

use futures::StreamExt;
use keel_core::{BackoffConfig, ClusterApi, ClusterEvent};
use keel_store::{watch_kind, KindEvent};
use keel_transport::TransportHandle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub trait EventSink: Send + Sync {
    fn publish_event(&self, event: ClusterEvent) -> bool;
}

impl EventSink for TransportHandle {
    fn publish_event(&self, event: ClusterEvent) -> bool { TransportHandle::publish_event(self, event) }
}

/// Background event watch. Dropping it stops forwarding.
pub struct EventForwarder {
    task: JoinHandle<()>,
}

impl EventForwarder {
    pub fn spawn(api: Arc<dyn ClusterApi>, sink: Arc<dyn EventSink>, kind: String, backoff: BackoffConfig) -> Self {
        let task = tokio::spawn(async move {
            info!(kind = %kind, "forwarding cluster events");
            let stream = watch_kind(api, kind.clone(), backoff);
            futures::pin_mut!(stream);
            while let Some(ev) = stream.next().await {
                match ev {
                    KindEvent::Relisted { items, .. } => debug!(kind = %kind, skipped = items.len(), "event watch (re)listed"),
                    KindEvent::Applied(o) => {
                        let event = ClusterEvent::from_observed(&o);
                        if !sink.publish_event(event) {
                            debug!(event = %o.descriptor, "event not forwarded");
                        }
                    }
                    KindEvent::Deleted(_) => {}
                    KindEvent::Fatal { reason, .. } => warn!(kind = %kind, %reason, "event watch halted"),
                }
            }
        });
        Self { task }
    }
}

impl Drop for EventForwarder {
    fn drop(&mut self) { self.task.abort(); }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::memory::MemoryCluster;
    use keel_core::ResourceDescriptor;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Collect(Mutex<Vec<ClusterEvent>>);

    impl EventSink for Collect {
        fn publish_event(&self, event: ClusterEvent) -> bool {
            self.0.lock().unwrap().push(event);
            true
        }
    }

    fn event(name: &str) -> ResourceDescriptor { ResourceDescriptor::namespaced("v1/Event", "default", name) }

    fn body(reason: &str) -> serde_json::Value {
        serde_json::json!({"involvedObject": {"kind": "Pod", "name": "web-0"}, "reason": reason, "type": "Normal", "count": 1})
    }

    #[tokio::test]
    async fn forwards_live_events_and_skips_history() {
        let c = Arc::new(MemoryCluster::new());
        c.put_external(&event("old"), body("Pulled"));
        let sink = Arc::new(Collect::default());
        let backoff = BackoffConfig { base_ms: 5, multiplier: 2.0, cap_ms: 20, jitter: 0.0 };
        let _fwd = EventForwarder::spawn(c.clone() as Arc<dyn ClusterApi>, sink.clone(), "v1/Event".into(), backoff);

        let mut tries = 0;
        let seen = loop {
            tries += 1;
            c.put_external(&event("new"), body(&format!("Started-{}", tries)));
            tokio::time::sleep(Duration::from_millis(20)).await;
            let got = sink.0.lock().unwrap().clone();
            if !got.is_empty() { break got; }
            assert!(tries < 100, "no event forwarded");
        };
        assert!(seen.iter().all(|e| e.name == "new"));
        assert!(seen[0].reason.starts_with("Started-"));
        assert_eq!(seen[0].involved_name, "web-0");
    }
}

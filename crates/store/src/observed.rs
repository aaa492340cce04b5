//! Observed-state mirror and the per-kind watch loops feeding it.
//!
//! Each watched kind runs [`watch_kind`], a restartable stream that lists,
//! watches from the list's resume token, resumes after transient failures and
//! re-lists when the token expires. A single ingest task owns the
//! [`ObservedMirror`], applies events in batches and swaps immutable
//! snapshots for readers.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::{Stream, StreamExt};
use keel_core::{
    Backoff, BackoffConfig, ClusterApi, ClusterError, ObservedResource, ObservedSnapshot, ResourceDescriptor,
    ResourceVersion, WatchEvent,
};
use metrics::{counter, gauge};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const INGEST_BATCH: usize = 256;

/// Item of a per-kind watch sequence; also the mirror's input.
#[derive(Debug, Clone, PartialEq)]
pub enum KindEvent {
    /// Complete current contents of a kind after a (re)list.
    Relisted { kind: String, items: Vec<ObservedResource> },
    Applied(ObservedResource),
    Deleted(ResourceDescriptor),
    /// Permanent watch failure (authorization and the like).
    Fatal { kind: String, reason: String },
}

/// Change notification for the engine. Delivery is lossy; the engine
/// re-reads the whole snapshot on every notification.
#[derive(Debug, Clone, PartialEq)]
pub enum ObservedChange {
    Upserted(ResourceDescriptor),
    Deleted(ResourceDescriptor),
    Relisted { kind: String, count: usize },
    Failed { kind: String, reason: String },
}

impl From<&KindEvent> for ObservedChange {
    fn from(ev: &KindEvent) -> Self {
        match ev {
            KindEvent::Relisted { kind, items } => ObservedChange::Relisted { kind: kind.clone(), count: items.len() },
            KindEvent::Applied(o) => ObservedChange::Upserted(o.descriptor.clone()),
            KindEvent::Deleted(d) => ObservedChange::Deleted(d.clone()),
            KindEvent::Fatal { kind, reason } => ObservedChange::Failed { kind: kind.clone(), reason: reason.clone() },
        }
    }
}

/// Authoritative in-memory mirror. Owned by exactly one writer.
#[derive(Default)]
pub struct ObservedMirror {
    epoch: u64,
    resources: BTreeMap<ResourceDescriptor, ObservedResource>,
    synced: BTreeSet<String>,
    failed: BTreeMap<String, String>,
}

impl ObservedMirror {
    pub fn new() -> Self { Self::default() }
    pub fn len(&self) -> usize { self.resources.len() }
    pub fn is_empty(&self) -> bool { self.resources.is_empty() }

    /// Apply one event; returns whether the mirror changed.
    pub fn apply(&mut self, ev: KindEvent) -> bool {
        match ev {
            KindEvent::Relisted { kind, items } => {
                self.resources.retain(|d, _| d.kind != kind);
                for o in items {
                    self.resources.insert(o.descriptor.clone(), o);
                }
                self.failed.remove(&kind);
                self.synced.insert(kind);
                true
            }
            KindEvent::Applied(o) => {
                if let Some(existing) = self.resources.get(&o.descriptor) {
                    if existing.version == o.version { return false; }
                }
                self.resources.insert(o.descriptor.clone(), o);
                true
            }
            KindEvent::Deleted(d) => self.resources.remove(&d).is_some(),
            KindEvent::Fatal { kind, reason } => {
                self.failed.insert(kind, reason);
                true
            }
        }
    }

    /// Bump the epoch and produce an immutable copy.
    pub fn freeze(&mut self) -> Arc<ObservedSnapshot> {
        self.epoch = self.epoch.saturating_add(1);
        Arc::new(ObservedSnapshot {
            epoch: self.epoch,
            resources: self.resources.clone(),
            synced: self.synced.clone(),
            failed: self.failed.clone(),
        })
    }
}

/// Read side: current snapshot plus epoch notifications.
#[derive(Clone)]
pub struct ObservedHandle {
    snap: Arc<ArcSwap<ObservedSnapshot>>,
    epoch_rx: watch::Receiver<u64>,
}

impl ObservedHandle {
    pub fn current(&self) -> Arc<ObservedSnapshot> { self.snap.load_full() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }

    /// Every listed kind has completed its initial list.
    pub fn is_synced<'a>(&self, kinds: impl IntoIterator<Item = &'a String>) -> bool {
        let snap = self.snap.load();
        kinds.into_iter().all(|k| snap.synced.contains(k) || snap.failed.contains_key(k))
    }
}

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub kinds: Vec<String>,
    pub backoff: BackoffConfig,
    /// Capacity of the ingest and notification queues.
    pub queue_cap: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self { Self { kinds: Vec::new(), backoff: BackoffConfig::default(), queue_cap: 2048 } }
}

/// Running watch loops plus the ingest task. Dropping it stops them.
pub struct ObservedStateWatcher {
    handle: ObservedHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl ObservedStateWatcher {
    /// Spawn one watch loop per kind and the ingest task. Returns the watcher and
    /// the change-notification receiver for the engine.
    pub fn spawn(api: Arc<dyn ClusterApi>, cfg: WatcherConfig) -> (Self, mpsc::Receiver<ObservedChange>) {
        let cap = cfg.queue_cap.max(1);
        let (ingest_tx, mut ingest_rx) = mpsc::channel::<KindEvent>(cap);
        let (change_tx, change_rx) = mpsc::channel::<ObservedChange>(cap);
        let snap = Arc::new(ArcSwap::from_pointee(ObservedSnapshot::default()));
        let (epoch_tx, epoch_rx) = watch::channel(0u64);
        let mut tasks = Vec::with_capacity(cfg.kinds.len() + 1);

        for kind in cfg.kinds.iter().cloned() {
            let api = Arc::clone(&api);
            let tx = ingest_tx.clone();
            let backoff = cfg.backoff;
            tasks.push(tokio::spawn(async move {
                let stream = watch_kind(api, kind.clone(), backoff);
                futures::pin_mut!(stream);
                while let Some(ev) = stream.next().await {
                    if tx.send(ev).await.is_err() { break; }
                }
                debug!(kind = %kind, "watch loop stopped");
            }));
        }
        drop(ingest_tx);

        let snap_w = Arc::clone(&snap);
        tasks.push(tokio::spawn(async move {
            let mut mirror = ObservedMirror::new();
            while let Some(first) = ingest_rx.recv().await {
                let mut batch = vec![first];
                while batch.len() < INGEST_BATCH {
                    match ingest_rx.try_recv() {
                        Ok(ev) => batch.push(ev),
                        Err(_) => break,
                    }
                }
                let mut changes = Vec::with_capacity(batch.len());
                for ev in batch {
                    let change = ObservedChange::from(&ev);
                    if mirror.apply(ev) { changes.push(change); }
                }
                if changes.is_empty() { continue; }
                let next = mirror.freeze();
                let epoch = next.epoch;
                gauge!("observed_resources", next.len() as f64);
                snap_w.store(next);
                let _ = epoch_tx.send(epoch);
                for c in changes {
                    // The engine re-reads the full snapshot, so a full queue loses nothing.
                    if let Err(mpsc::error::TrySendError::Closed(_)) = change_tx.try_send(c) { break; }
                }
            }
            info!("observed ingest loop stopped");
        }));

        (Self { handle: ObservedHandle { snap, epoch_rx }, tasks }, change_rx)
    }

    pub fn handle(&self) -> ObservedHandle { self.handle.clone() }
    pub fn snapshot(&self) -> Arc<ObservedSnapshot> { self.handle.current() }
}

impl Drop for ObservedStateWatcher {
    fn drop(&mut self) {
        for t in &self.tasks { t.abort(); }
    }
}

/// Infinite, restartable sequence of events for one kind.
///
/// list -> watch(resume token) -> on transient error back off and resume,
/// on `ResumeTokenExpired` re-list, on a permanent error yield `Fatal`,
/// wait out the backoff ceiling and start over with a fresh list.
pub fn watch_kind(
    api: Arc<dyn ClusterApi>,
    kind: String,
    backoff_cfg: BackoffConfig,
) -> impl Stream<Item = KindEvent> + Send + 'static {
    async_stream::stream! {
        let mut backoff = Backoff::new(backoff_cfg);
        let mut resume: Option<ResourceVersion> = None;
        let mut relist = true;
        loop {
            if relist {
                match api.list(&kind).await {
                    Ok(page) => {
                        counter!("watch_relist_total", 1u64);
                        info!(kind = %kind, items = page.items.len(), version = ?page.version, "listed");
                        resume = page.version;
                        relist = false;
                        yield KindEvent::Relisted { kind: kind.clone(), items: page.items };
                    }
                    Err(e) if e.is_permanent() => {
                        error!(kind = %kind, error = %e, "list failed permanently");
                        yield KindEvent::Fatal { kind: kind.clone(), reason: e.to_string() };
                        tokio::time::sleep(Duration::from_millis(backoff_cfg.cap_ms)).await;
                        continue;
                    }
                    Err(e) => {
                        let delay = backoff.next_delay();
                        warn!(kind = %kind, error = %e, delay_ms = delay.as_millis() as u64, "list failed; backing off");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                }
            }

            let mut stream = match api.watch(&kind, resume.as_ref()).await {
                Ok(s) => s,
                Err(ClusterError::ResumeTokenExpired) => {
                    info!(kind = %kind, "resume token expired; re-listing");
                    relist = true;
                    continue;
                }
                Err(e) if e.is_permanent() => {
                    error!(kind = %kind, error = %e, "watch failed permanently");
                    yield KindEvent::Fatal { kind: kind.clone(), reason: e.to_string() };
                    tokio::time::sleep(Duration::from_millis(backoff_cfg.cap_ms)).await;
                    relist = true;
                    continue;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(kind = %kind, error = %e, delay_ms = delay.as_millis() as u64, "watch open failed; backing off");
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let mut delivered = false;
            loop {
                match stream.next().await {
                    Some(Ok(ev)) => {
                        delivered = true;
                        backoff.reset();
                        resume = Some(ev.version().clone());
                        match ev {
                            WatchEvent::Applied(o) => { yield KindEvent::Applied(o); }
                            WatchEvent::Deleted { descriptor, .. } => { yield KindEvent::Deleted(descriptor); }
                            WatchEvent::Bookmark(_) => {}
                        }
                    }
                    Some(Err(ClusterError::ResumeTokenExpired)) => {
                        info!(kind = %kind, "watch reported expired token; re-listing");
                        relist = true;
                        break;
                    }
                    Some(Err(e)) if e.is_permanent() => {
                        error!(kind = %kind, error = %e, "watch failed permanently");
                        yield KindEvent::Fatal { kind: kind.clone(), reason: e.to_string() };
                        tokio::time::sleep(Duration::from_millis(backoff_cfg.cap_ms)).await;
                        relist = true;
                        break;
                    }
                    Some(Err(e)) => {
                        counter!("watch_errors_total", 1u64);
                        let delay = backoff.next_delay();
                        warn!(kind = %kind, error = %e, delay_ms = delay.as_millis() as u64, "watch channel failed; resuming");
                        tokio::time::sleep(delay).await;
                        break;
                    }
                    None => {
                        debug!(kind = %kind, "watch closed by server; reopening");
                        if !delivered { tokio::time::sleep(backoff.next_delay()).await; }
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn obs(name: &str, rv: &str) -> ObservedResource {
        ObservedResource {
            descriptor: ResourceDescriptor::namespaced("v1/ConfigMap", "default", name),
            spec: serde_json::json!({}),
            version: ResourceVersion::new(rv),
            applied_generation: Some(1),
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn relist_replaces_only_that_kind() {
        let mut m = ObservedMirror::new();
        let other = ObservedResource {
            descriptor: ResourceDescriptor::cluster("v1/Namespace", "prod"),
            ..obs("x", "1")
        };
        m.apply(KindEvent::Applied(other));
        m.apply(KindEvent::Applied(obs("stale", "2")));
        m.apply(KindEvent::Relisted { kind: "v1/ConfigMap".into(), items: vec![obs("fresh", "3")] });
        let snap = m.freeze();
        assert_eq!(snap.len(), 2);
        assert!(snap.get(&ResourceDescriptor::namespaced("v1/ConfigMap", "default", "fresh")).is_some());
        assert!(snap.get(&ResourceDescriptor::cluster("v1/Namespace", "prod")).is_some());
        assert!(snap.synced.contains("v1/ConfigMap"));
    }

    #[test]
    fn duplicate_versions_do_not_count_as_changes() {
        let mut m = ObservedMirror::new();
        assert!(m.apply(KindEvent::Applied(obs("a", "5"))));
        assert!(!m.apply(KindEvent::Applied(obs("a", "5"))));
        assert!(m.apply(KindEvent::Applied(obs("a", "6"))));
        assert!(m.apply(KindEvent::Deleted(obs("a", "6").descriptor)));
        assert!(!m.apply(KindEvent::Deleted(obs("a", "6").descriptor)));
    }

    #[test]
    fn fatal_marks_kind_and_relist_clears_it() {
        let mut m = ObservedMirror::new();
        m.apply(KindEvent::Fatal { kind: "v1/Secret".into(), reason: "forbidden".into() });
        assert_eq!(m.freeze().failed.get("v1/Secret").map(String::as_str), Some("forbidden"));
        m.apply(KindEvent::Relisted { kind: "v1/Secret".into(), items: vec![] });
        let snap = m.freeze();
        assert!(snap.failed.is_empty());
        assert_eq!(snap.epoch, 2);
    }
}

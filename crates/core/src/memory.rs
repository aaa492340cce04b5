//! In-memory cluster with resource versions, resumable watches and fault
//! injection. Backs every test suite in the workspace and local dry runs.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde_json::Value as Json;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

use crate::{
    stamp_payload, ClusterApi, ClusterError, DesiredSpec, ListPage, ObservedResource, ResourceDescriptor,
    ResourceVersion, WatchEvent, WatchStream,
};

const LOG_CAP: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Get,
    Create,
    Update,
    Delete,
    List,
    Watch,
}

#[derive(Debug)]
struct Fault {
    op: Op,
    descriptor: Option<ResourceDescriptor>,
    kind: Option<String>,
    err: ClusterError,
}

#[derive(Debug, Clone)]
enum Bus {
    Event(u64, WatchEvent),
    Break(ClusterError),
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<ResourceDescriptor, Json>,
    rv: u64,
    log: VecDeque<(u64, WatchEvent)>,
    /// Resume tokens below this version are expired.
    floor: u64,
    faults: VecDeque<Fault>,
    calls: HashMap<Op, usize>,
    in_flight: HashMap<ResourceDescriptor, u32>,
    max_in_flight: u32,
}

pub struct MemoryCluster {
    inner: Mutex<Inner>,
    bus: broadcast::Sender<Bus>,
    latency: Duration,
}

impl Default for MemoryCluster {
    fn default() -> Self { Self::new() }
}

impl MemoryCluster {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(1024);
        Self { inner: Mutex::new(Inner::default()), bus, latency: Duration::ZERO }
    }

    /// Delay every mutating call, widening the window in which overlapping calls would show up.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail the next matching call with `err`. `descriptor: None` matches any target.
    pub fn inject(&self, op: Op, descriptor: Option<ResourceDescriptor>, err: ClusterError) {
        self.lock().faults.push_back(Fault { op, descriptor, kind: None, err });
    }

    /// Fail the next matching call touching `kind` (lists and watches included).
    pub fn inject_for_kind(&self, op: Op, kind: &str, err: ClusterError) {
        self.lock().faults.push_back(Fault { op, descriptor: None, kind: Some(kind.to_string()), err });
    }

    pub fn calls(&self, op: Op) -> usize { self.lock().calls.get(&op).copied().unwrap_or(0) }

    /// Highest number of overlapping mutating calls seen for any single descriptor.
    pub fn max_concurrent_per_descriptor(&self) -> u32 { self.lock().max_in_flight }

    pub fn object(&self, d: &ResourceDescriptor) -> Option<ObservedResource> {
        let inner = self.lock();
        inner.objects.get(d).and_then(|raw| ObservedResource::from_raw(&d.kind, raw, Utc::now()))
    }

    pub fn objects(&self) -> Vec<ObservedResource> {
        let inner = self.lock();
        inner
            .objects
            .iter()
            .filter_map(|(d, raw)| ObservedResource::from_raw(&d.kind, raw, Utc::now()))
            .collect()
    }

    pub fn len(&self) -> usize { self.lock().objects.len() }
    pub fn is_empty(&self) -> bool { self.lock().objects.is_empty() }
    pub fn current_version(&self) -> ResourceVersion { ResourceVersion::from(self.lock().rv) }

    /// Write an object as some other actor would: no ownership label, no generation stamp
    /// unless the caller puts them in `raw`.
    pub fn put_external(&self, d: &ResourceDescriptor, raw: Json) -> ResourceVersion {
        let mut raw = if raw.is_object() { raw } else { Json::Object(serde_json::Map::new()) };
        set_meta(&mut raw, "name", Json::String(d.name.clone()));
        if let Some(ns) = &d.namespace { set_meta(&mut raw, "namespace", Json::String(ns.clone())); }
        let mut inner = self.lock();
        ResourceVersion::from(self.commit(&mut inner, d, Some(raw)))
    }

    pub fn remove_external(&self, d: &ResourceDescriptor) -> bool {
        let mut inner = self.lock();
        if !inner.objects.contains_key(d) { return false; }
        self.commit(&mut inner, d, None);
        true
    }

    /// Drop the event history; resuming from any earlier token now fails.
    pub fn compact(&self) {
        let mut inner = self.lock();
        debug!(dropped = inner.log.len(), "event history compacted");
        inner.log.clear();
        inner.floor = inner.rv;
    }

    /// Terminate every open watch stream with `err`.
    pub fn break_watches(&self, err: ClusterError) {
        debug!(error = %err, "breaking open watches");
        let _ = self.bus.send(Bus::Break(err));
    }

    fn lock(&self) -> MutexGuard<'_, Inner> { self.inner.lock().unwrap_or_else(|e| e.into_inner()) }

    fn take_fault(&self, op: Op, d: Option<&ResourceDescriptor>, kind: &str) -> Option<ClusterError> {
        let mut inner = self.lock();
        *inner.calls.entry(op).or_insert(0) += 1;
        let idx = inner.faults.iter().position(|f| {
            f.op == op
                && (f.descriptor.is_none() || f.descriptor.as_ref() == d)
                && f.kind.as_deref().map_or(true, |k| k == kind)
        })?;
        let err = inner.faults.remove(idx).map(|f| f.err)?;
        debug!(?op, kind, descriptor = ?d.map(ToString::to_string), error = %err, "injected fault fired");
        Some(err)
    }

    fn enter(&self, d: &ResourceDescriptor) -> InFlight<'_> {
        let mut inner = self.lock();
        let n = inner.in_flight.entry(d.clone()).or_insert(0);
        *n += 1;
        let n = *n;
        inner.max_in_flight = inner.max_in_flight.max(n);
        InFlight { cluster: self, descriptor: d.clone() }
    }

    async fn pause(&self) {
        if !self.latency.is_zero() { tokio::time::sleep(self.latency).await; }
    }

    /// Bump the version, store or remove the object, log and broadcast the change.
    fn commit(&self, inner: &mut Inner, d: &ResourceDescriptor, raw: Option<Json>) -> u64 {
        inner.rv += 1;
        let rv = inner.rv;
        let ev = match raw {
            Some(mut raw) => {
                set_meta(&mut raw, "resourceVersion", Json::String(rv.to_string()));
                let obs = ObservedResource::from_raw(&d.kind, &raw, Utc::now());
                inner.objects.insert(d.clone(), raw);
                obs.map(WatchEvent::Applied)
            }
            None => {
                inner.objects.remove(d);
                Some(WatchEvent::Deleted { descriptor: d.clone(), version: ResourceVersion::from(rv) })
            }
        };
        if let Some(ev) = ev {
            inner.log.push_back((rv, ev.clone()));
            while inner.log.len() > LOG_CAP {
                if let Some((old, _)) = inner.log.pop_front() { inner.floor = old; }
            }
            let _ = self.bus.send(Bus::Event(rv, ev));
        }
        rv
    }
}

struct InFlight<'a> {
    cluster: &'a MemoryCluster,
    descriptor: ResourceDescriptor,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut inner = self.cluster.lock();
        if let Some(n) = inner.in_flight.get_mut(&self.descriptor) {
            *n = n.saturating_sub(1);
            if *n == 0 { inner.in_flight.remove(&self.descriptor); }
        }
    }
}

fn set_meta(raw: &mut Json, key: &str, value: Json) {
    if let Some(obj) = raw.as_object_mut() {
        let meta = obj.entry("metadata").or_insert_with(|| Json::Object(serde_json::Map::new()));
        if !meta.is_object() { *meta = Json::Object(serde_json::Map::new()); }
        if let Some(meta) = meta.as_object_mut() { meta.insert(key.to_string(), value); }
    }
}

fn event_kind(ev: &WatchEvent) -> Option<&str> {
    match ev {
        WatchEvent::Applied(o) => Some(&o.descriptor.kind),
        WatchEvent::Deleted { descriptor, .. } => Some(&descriptor.kind),
        WatchEvent::Bookmark(_) => None,
    }
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn get(&self, d: &ResourceDescriptor) -> Result<Option<ObservedResource>, ClusterError> {
        if let Some(e) = self.take_fault(Op::Get, Some(d), &d.kind) { return Err(e); }
        Ok(self.object(d))
    }

    async fn create(&self, d: &ResourceDescriptor, spec: &DesiredSpec) -> Result<ResourceVersion, ClusterError> {
        let _guard = self.enter(d);
        self.pause().await;
        if let Some(e) = self.take_fault(Op::Create, Some(d), &d.kind) { return Err(e); }
        let mut inner = self.lock();
        if inner.objects.contains_key(d) { return Err(ClusterError::AlreadyExists(d.to_string())); }
        let raw = stamp_payload(d, spec);
        Ok(ResourceVersion::from(self.commit(&mut inner, d, Some(raw))))
    }

    async fn update(
        &self,
        d: &ResourceDescriptor,
        spec: &DesiredSpec,
        expected: &ResourceVersion,
    ) -> Result<ResourceVersion, ClusterError> {
        let _guard = self.enter(d);
        self.pause().await;
        if let Some(e) = self.take_fault(Op::Update, Some(d), &d.kind) { return Err(e); }
        let mut inner = self.lock();
        let current = inner
            .objects
            .get(d)
            .and_then(|raw| raw.get("metadata")?.get("resourceVersion")?.as_str().map(|s| s.to_string()))
            .ok_or_else(|| ClusterError::NotFound(d.to_string()))?;
        if current != expected.as_str() {
            return Err(ClusterError::VersionConflict(format!("{}: expected {}, found {}", d, expected, current)));
        }
        let raw = stamp_payload(d, spec);
        Ok(ResourceVersion::from(self.commit(&mut inner, d, Some(raw))))
    }

    async fn delete(&self, d: &ResourceDescriptor, expected: Option<&ResourceVersion>) -> Result<(), ClusterError> {
        let _guard = self.enter(d);
        self.pause().await;
        if let Some(e) = self.take_fault(Op::Delete, Some(d), &d.kind) { return Err(e); }
        let mut inner = self.lock();
        let current = inner
            .objects
            .get(d)
            .and_then(|raw| raw.get("metadata")?.get("resourceVersion")?.as_str().map(|s| s.to_string()))
            .ok_or_else(|| ClusterError::NotFound(d.to_string()))?;
        if let Some(expected) = expected {
            if current != expected.as_str() {
                return Err(ClusterError::VersionConflict(format!("{}: expected {}, found {}", d, expected, current)));
            }
        }
        self.commit(&mut inner, d, None);
        Ok(())
    }

    async fn list(&self, kind: &str) -> Result<ListPage, ClusterError> {
        if let Some(e) = self.take_fault(Op::List, None, kind) { return Err(e); }
        let inner = self.lock();
        let now = Utc::now();
        let items = inner
            .objects
            .iter()
            .filter(|(d, _)| d.kind == kind)
            .filter_map(|(d, raw)| ObservedResource::from_raw(&d.kind, raw, now))
            .collect();
        Ok(ListPage { items, version: Some(ResourceVersion::from(inner.rv)) })
    }

    async fn watch(&self, kind: &str, resume: Option<&ResourceVersion>) -> Result<WatchStream, ClusterError> {
        if let Some(e) = self.take_fault(Op::Watch, None, kind) { return Err(e); }
        let inner = self.lock();
        let from = match resume {
            Some(v) => v
                .as_str()
                .parse::<u64>()
                .map_err(|_| ClusterError::MalformedSpec(format!("invalid resume token {}", v)))?,
            None => inner.rv,
        };
        if from < inner.floor { return Err(ClusterError::ResumeTokenExpired); }
        let backlog: VecDeque<(u64, WatchEvent)> = inner
            .log
            .iter()
            .filter(|(rv, ev)| *rv > from && event_kind(ev) == Some(kind))
            .cloned()
            .collect();
        // Subscribe under the lock so nothing committed after the backlog copy is missed.
        let rx = self.bus.subscribe();
        drop(inner);

        let kind = kind.to_string();
        let stream = futures::stream::unfold(
            (backlog, rx, from, kind, false),
            |(mut backlog, mut rx, mut last, kind, done)| async move {
                if done { return None; }
                if let Some((rv, ev)) = backlog.pop_front() {
                    last = rv;
                    return Some((Ok(ev), (backlog, rx, last, kind, false)));
                }
                loop {
                    match rx.recv().await {
                        Ok(Bus::Event(rv, ev)) => {
                            if rv <= last || event_kind(&ev) != Some(kind.as_str()) { continue; }
                            return Some((Ok(ev), (backlog, rx, rv, kind, false)));
                        }
                        Ok(Bus::Break(e)) => return Some((Err(e), (backlog, rx, last, kind, true))),
                        Err(RecvError::Lagged(n)) => {
                            let e = ClusterError::TransientNetwork(format!("watch lagged by {} events", n));
                            return Some((Err(e), (backlog, rx, last, kind, true)));
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            },
        );
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cm(name: &str) -> ResourceDescriptor { ResourceDescriptor::namespaced("v1/ConfigMap", "default", name) }

    #[tokio::test]
    async fn optimistic_concurrency_is_enforced() {
        let c = MemoryCluster::new();
        let d = cm("a");
        let v1 = c.create(&d, &DesiredSpec::new(1, serde_json::json!({"data": {"k": "x"}}))).await.unwrap();
        assert!(matches!(c.create(&d, &DesiredSpec::new(1, serde_json::json!({}))).await, Err(ClusterError::AlreadyExists(_))));
        let stale = ResourceVersion::new("0");
        let err = c.update(&d, &DesiredSpec::new(2, serde_json::json!({})), &stale).await.unwrap_err();
        assert!(matches!(err, ClusterError::VersionConflict(_)));
        let v2 = c.update(&d, &DesiredSpec::new(2, serde_json::json!({"data": {"k": "y"}})), &v1).await.unwrap();
        assert!(v2 > v1);
        assert_eq!(c.object(&d).unwrap().applied_generation, Some(2));
        assert!(matches!(c.delete(&d, Some(&v1)).await, Err(ClusterError::VersionConflict(_))));
        c.delete(&d, Some(&v2)).await.unwrap();
        assert!(matches!(c.delete(&d, None).await, Err(ClusterError::NotFound(_))));
    }

    #[tokio::test]
    async fn watch_resumes_from_token_and_expires_after_compaction() {
        let c = MemoryCluster::new();
        let page = c.list("v1/ConfigMap").await.unwrap();
        let token = page.version.unwrap();
        c.create(&cm("a"), &DesiredSpec::new(1, serde_json::json!({}))).await.unwrap();
        c.put_external(&ResourceDescriptor::cluster("v1/Namespace", "x"), serde_json::json!({}));
        c.create(&cm("b"), &DesiredSpec::new(1, serde_json::json!({}))).await.unwrap();

        let mut s = c.watch("v1/ConfigMap", Some(&token)).await.unwrap();
        let first = s.next().await.unwrap().unwrap();
        let second = s.next().await.unwrap().unwrap();
        match (first, second) {
            (WatchEvent::Applied(a), WatchEvent::Applied(b)) => {
                assert_eq!(a.descriptor.name, "a");
                assert_eq!(b.descriptor.name, "b");
            }
            other => panic!("unexpected events: {:?}", other),
        }

        c.compact();
        assert!(matches!(c.watch("v1/ConfigMap", Some(&token)).await, Err(ClusterError::ResumeTokenExpired)));
        assert!(c.watch("v1/ConfigMap", Some(&c.current_version())).await.is_ok());
    }

    #[tokio::test]
    async fn injected_faults_fire_once() {
        let c = MemoryCluster::new();
        let d = cm("a");
        c.inject(Op::Create, Some(d.clone()), ClusterError::TransientNetwork("boom".into()));
        assert!(c.create(&d, &DesiredSpec::new(1, serde_json::json!({}))).await.is_err());
        assert!(c.create(&d, &DesiredSpec::new(1, serde_json::json!({}))).await.is_ok());
        assert_eq!(c.calls(Op::Create), 2);
    }

    #[tokio::test]
    async fn kind_faults_only_hit_that_kind() {
        let c = MemoryCluster::new();
        c.inject_for_kind(Op::List, "v1/Secret", ClusterError::PermissionDenied("rbac".into()));
        assert!(c.list("v1/ConfigMap").await.is_ok());
        assert!(matches!(c.list("v1/Secret").await, Err(ClusterError::PermissionDenied(_))));
        assert!(c.list("v1/Secret").await.is_ok());
    }

    #[tokio::test]
    async fn broken_watch_surfaces_error_then_ends() {
        let c = MemoryCluster::new();
        let mut s = c.watch("v1/ConfigMap", None).await.unwrap();
        c.break_watches(ClusterError::TransientNetwork("reset".into()));
        assert!(matches!(s.next().await, Some(Err(ClusterError::TransientNetwork(_)))));
        assert!(s.next().await.is_none());
    }
}

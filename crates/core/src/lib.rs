//! Keel core types: descriptors, desired/observed state, tasks and outcomes.

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub mod backoff;
pub mod cluster;
pub mod error;
pub mod event;
pub mod memory;

pub use backoff::{Backoff, BackoffConfig};
pub use cluster::{ClusterApi, ListPage, WatchEvent, WatchFilter, WatchStream};
pub use error::ClusterError;
pub use event::ClusterEvent;

/// Label stamped on every object the agent creates or updates.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "keel";
/// Annotation carrying the desired generation last written to the object.
pub const GENERATION_ANNOTATION: &str = "keel.dev/generation";

/// Priority given to kinds that scope other objects (namespaces, CRDs).
pub const PARENT_PRIORITY: i32 = 0;
pub const DEFAULT_PRIORITY: i32 = 100;

/// Identity of a reconcilable unit. `kind` is a GVK key such as `v1/ConfigMap`
/// or `apps/v1/Deployment`; `namespace` is `None` for cluster-scoped objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceDescriptor {
    pub fn new(kind: impl Into<String>, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self { kind: kind.into(), namespace: namespace.map(|s| s.to_string()), name: name.into() }
    }

    pub fn cluster(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(kind, None, name)
    }

    pub fn namespaced(kind: impl Into<String>, namespace: &str, name: impl Into<String>) -> Self {
        Self::new(kind, Some(namespace), name)
    }

    /// Bare kind name without group/version, e.g. `Deployment`.
    pub fn kind_name(&self) -> &str {
        self.kind.rsplit('/').next().unwrap_or(&self.kind)
    }

    /// Dependency priority derived from the kind alone.
    pub fn default_priority(&self) -> i32 {
        match self.kind_name() {
            "Namespace" | "CustomResourceDefinition" => PARENT_PRIORITY,
            _ => DEFAULT_PRIORITY,
        }
    }
}

impl fmt::Display for ResourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Opaque optimistic-concurrency token issued by the cluster API.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceVersion(pub String);

impl ResourceVersion {
    pub fn new(v: impl Into<String>) -> Self { Self(v.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl From<u64> for ResourceVersion {
    fn from(v: u64) -> Self { Self(v.to_string()) }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl PartialOrd for ResourceVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

impl Ord for ResourceVersion {
    // Numeric when both sides parse, lexical otherwise.
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.0.parse::<u64>(), other.0.parse::<u64>()) {
            (Ok(a), Ok(b)) => a.cmp(&b),
            _ => self.0.cmp(&other.0),
        }
    }
}

/// Desired specification for one descriptor as dictated by the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredSpec {
    pub generation: u64,
    pub payload: Json,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_hint: Option<i32>,
}

impl DesiredSpec {
    pub fn new(generation: u64, payload: Json) -> Self {
        Self { generation, payload, order_hint: None }
    }
}

/// Full desired state at a given generation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DesiredStateSnapshot {
    pub generation: u64,
    pub resources: BTreeMap<ResourceDescriptor, DesiredSpec>,
}

impl DesiredStateSnapshot {
    pub fn new(generation: u64) -> Self { Self { generation, resources: BTreeMap::new() } }

    pub fn with(mut self, descriptor: ResourceDescriptor, spec: DesiredSpec) -> Self {
        self.resources.insert(descriptor, spec);
        self
    }

    pub fn get(&self, d: &ResourceDescriptor) -> Option<&DesiredSpec> { self.resources.get(d) }
    pub fn contains(&self, d: &ResourceDescriptor) -> bool { self.resources.contains_key(d) }
    pub fn len(&self) -> usize { self.resources.len() }
    pub fn is_empty(&self) -> bool { self.resources.is_empty() }
}

/// Incremental change built on top of `base_generation`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DesiredDelta {
    pub base_generation: u64,
    pub generation: u64,
    pub upserts: Vec<(ResourceDescriptor, DesiredSpec)>,
    pub removals: Vec<ResourceDescriptor>,
}

/// Live state of one object as last seen by the watcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedResource {
    pub descriptor: ResourceDescriptor,
    /// Object body with server-populated noise stripped.
    pub spec: Json,
    pub version: ResourceVersion,
    /// Generation stamped by the agent on its last successful write, if any.
    pub applied_generation: Option<u64>,
    pub observed_at: DateTime<Utc>,
}

impl ObservedResource {
    /// Build from a raw object body (`metadata.name`, `metadata.namespace`,
    /// `metadata.resourceVersion` and the generation annotation are read).
    pub fn from_raw(kind: &str, raw: &Json, observed_at: DateTime<Utc>) -> Option<Self> {
        let meta = raw.get("metadata")?;
        let name = meta.get("name").and_then(|v| v.as_str())?.to_string();
        let namespace = meta.get("namespace").and_then(|v| v.as_str()).map(|s| s.to_string());
        let version = meta.get("resourceVersion").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let applied_generation = meta
            .get("annotations")
            .and_then(|a| a.get(GENERATION_ANNOTATION))
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<u64>().ok());
        Some(Self {
            descriptor: ResourceDescriptor { kind: kind.to_string(), namespace, name },
            spec: strip_noisy(raw.clone()),
            version: ResourceVersion(version),
            applied_generation,
            observed_at,
        })
    }

    /// Objects carrying the generation annotation were written by the agent.
    pub fn is_managed(&self) -> bool { self.applied_generation.is_some() }
}

/// Point-in-time copy of the observed mirror.
#[derive(Debug, Clone, Default)]
pub struct ObservedSnapshot {
    pub epoch: u64,
    pub resources: BTreeMap<ResourceDescriptor, ObservedResource>,
    /// Kinds whose initial list has completed.
    pub synced: BTreeSet<String>,
    /// Kinds whose watch hit a permanent error, with the reason.
    pub failed: BTreeMap<String, String>,
}

impl ObservedSnapshot {
    pub fn get(&self, d: &ResourceDescriptor) -> Option<&ObservedResource> { self.resources.get(d) }
    pub fn len(&self) -> usize { self.resources.len() }
    pub fn is_empty(&self) -> bool { self.resources.is_empty() }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Action {
    Create,
    Update,
    Delete,
    NoOp,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::NoOp => "noop",
        };
        f.write_str(s)
    }
}

/// One corrective step derived by a reconciliation pass. Never mutated after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciliationTask {
    pub descriptor: ResourceDescriptor,
    pub action: Action,
    /// Version the object is expected to carry (Update/Delete).
    pub expected_version: Option<ResourceVersion>,
    /// Desired payload (Create/Update, and NoOp for status bookkeeping).
    pub desired: Option<DesiredSpec>,
}

impl ReconciliationTask {
    pub fn create(descriptor: ResourceDescriptor, desired: DesiredSpec) -> Self {
        Self { descriptor, action: Action::Create, expected_version: None, desired: Some(desired) }
    }

    pub fn update(descriptor: ResourceDescriptor, desired: DesiredSpec, expected: ResourceVersion) -> Self {
        Self { descriptor, action: Action::Update, expected_version: Some(expected), desired: Some(desired) }
    }

    pub fn delete(descriptor: ResourceDescriptor, expected: ResourceVersion) -> Self {
        Self { descriptor, action: Action::Delete, expected_version: Some(expected), desired: None }
    }

    pub fn noop(descriptor: ResourceDescriptor, desired: DesiredSpec) -> Self {
        Self { descriptor, action: Action::NoOp, expected_version: None, desired: Some(desired) }
    }

    pub fn generation(&self) -> Option<u64> { self.desired.as_ref().map(|d| d.generation) }

    /// Two tasks describe the same work when action and target generation match.
    pub fn same_work(&self, other: &Self) -> bool {
        self.descriptor == other.descriptor && self.action == other.action && self.generation() == other.generation()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeResult {
    Converged,
    Retryable(String),
    Fatal(String),
}

impl OutcomeResult {
    pub fn reason(&self) -> Option<&str> {
        match self {
            OutcomeResult::Converged => None,
            OutcomeResult::Retryable(r) | OutcomeResult::Fatal(r) => Some(r),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub descriptor: ResourceDescriptor,
    pub action: Action,
    pub generation: Option<u64>,
    pub result: OutcomeResult,
    pub attempt: u32,
    pub last_attempt: DateTime<Utc>,
}

impl TaskOutcome {
    pub fn for_task(task: &ReconciliationTask, result: OutcomeResult, attempt: u32) -> Self {
        Self {
            descriptor: task.descriptor.clone(),
            action: task.action,
            generation: task.generation(),
            result,
            attempt,
            last_attempt: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Health {
    Converged,
    Progressing,
    Degraded,
    Failed,
}

/// Per-descriptor rollup reported upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvergenceStatus {
    pub descriptor: ResourceDescriptor,
    pub desired_generation: Option<u64>,
    pub last_applied_generation: Option<u64>,
    pub health: Health,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ConvergenceStatus {
    /// Equal apart from the timestamp.
    pub fn same_state(&self, other: &Self) -> bool {
        self.descriptor == other.descriptor
            && self.desired_generation == other.desired_generation
            && self.last_applied_generation == other.last_applied_generation
            && self.health == other.health
            && self.attempt == other.attempt
            && self.reason == other.reason
    }
}

/// Routes descriptors onto a fixed set of worker lanes.
/// FNV-1a over the identity tuple keeps routing stable for the process lifetime.
#[derive(Debug, Clone, Copy)]
pub struct LanePlanner { lanes: usize }

impl LanePlanner {
    pub fn new(lanes: usize) -> Self { Self { lanes: lanes.max(1) } }
    pub fn lanes(&self) -> usize { self.lanes }

    pub fn lane(&self, d: &ResourceDescriptor) -> usize {
        let mut h: u64 = 0xcbf29ce484222325; // 64-bit FNV-1a offset
        let ns = d.namespace.as_deref().unwrap_or("");
        for part in [d.kind.as_bytes(), ns.as_bytes(), d.name.as_bytes()] {
            for b in part { h ^= *b as u64; h = h.wrapping_mul(0x100000001b3); }
            // separator so ("ab","c") and ("a","bc") differ
            h ^= 0xff;
            h = h.wrapping_mul(0x100000001b3);
        }
        (h % self.lanes as u64) as usize
    }
}

/// Drop server-populated fields that must not influence comparisons.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
            obj.remove("resourceVersion");
            obj.remove("generation");
            obj.remove("creationTimestamp");
            obj.remove("uid");
        }
    }
    if let Some(obj) = v.as_object_mut() { obj.remove("status"); }
    v
}

/// Desired payload with identity, ownership label and generation annotation applied.
pub fn stamp_payload(d: &ResourceDescriptor, spec: &DesiredSpec) -> Json {
    let mut v = match &spec.payload {
        Json::Object(_) => spec.payload.clone(),
        _ => Json::Object(serde_json::Map::new()),
    };
    if let Some(obj) = v.as_object_mut() {
        let meta = obj.entry("metadata").or_insert_with(|| Json::Object(serde_json::Map::new()));
        if !meta.is_object() { *meta = Json::Object(serde_json::Map::new()); }
        if let Some(meta) = meta.as_object_mut() {
            meta.insert("name".into(), Json::String(d.name.clone()));
            match &d.namespace {
                Some(ns) => { meta.insert("namespace".into(), Json::String(ns.clone())); }
                None => { meta.remove("namespace"); }
            }
            let labels = meta.entry("labels").or_insert_with(|| Json::Object(serde_json::Map::new()));
            if let Some(labels) = labels.as_object_mut() {
                labels.insert(MANAGED_BY_LABEL.into(), Json::String(MANAGED_BY_VALUE.into()));
            }
            let annos = meta.entry("annotations").or_insert_with(|| Json::Object(serde_json::Map::new()));
            if let Some(annos) = annos.as_object_mut() {
                annos.insert(GENERATION_ANNOTATION.into(), Json::String(spec.generation.to_string()));
            }
        }
    }
    v
}

pub mod prelude {
    pub use super::{
        Action, ConvergenceStatus, DesiredDelta, DesiredSpec, DesiredStateSnapshot, Health, ObservedResource,
        ObservedSnapshot, OutcomeResult, ReconciliationTask, ResourceDescriptor, ResourceVersion, TaskOutcome,
    };
}

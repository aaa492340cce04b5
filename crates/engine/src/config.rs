//! Agent configuration: one YAML document, validated once at startup and
//! split into the settings each component is constructed with.

use std::path::Path;
use std::time::Duration;

use keel_core::{BackoffConfig, WatchFilter};
use keel_sched::SchedulerConfig;
use keel_store::WatcherConfig;
use keel_transport::TransportConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::reporter::ReporterConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read { path: String, #[source] source: std::io::Error },
    #[error("parsing config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// `host:port`, optionally prefixed with `tcp://`.
    pub address: String,
    pub backoff: BackoffConfig,
    pub initial_connect_attempts: u32,
    pub connect_timeout_ms: u64,
    pub outbound_queue: usize,
    pub replay_buffer: usize,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        let t = TransportConfig::default();
        Self {
            address: t.endpoint,
            backoff: t.backoff,
            initial_connect_attempts: t.initial_connect_attempts,
            connect_timeout_ms: t.connect_timeout_ms,
            outbound_queue: t.outbound_queue,
            replay_buffer: t.replay_buffer,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub kinds: Vec<WatchFilter>,
    pub backoff: BackoffConfig,
    pub queue_cap: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            kinds: vec![WatchFilter::kind("v1/Namespace"), WatchFilter::kind("v1/ConfigMap")],
            backoff: BackoffConfig::default(),
            queue_cap: WatcherConfig::default().queue_cap,
        }
    }
}

/// Forwarding of cluster events (`v1/Event`) to the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub enabled: bool,
    pub kind: String,
    /// Limit forwarding to one namespace; all namespaces when unset.
    pub namespace: Option<String>,
}

impl Default for EventsConfig {
    fn default() -> Self { Self { enabled: true, kind: "v1/Event".into(), namespace: None } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplyConfig {
    /// Deadline for one executor call, including its read-before-write.
    pub timeout_ms: u64,
}

impl Default for ApplyConfig {
    fn default() -> Self { Self { timeout_ms: 10_000 } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Safety-net pass interval; also re-dispatches work that ended `Fatal`.
    pub resync_interval_secs: u64,
    /// Triggers arriving within this window share one pass.
    pub debounce_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self { Self { resync_interval_secs: 300, debounce_ms: 50 } }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Announced to the control plane; a random id is generated when unset.
    pub cluster_id: Option<String>,
    pub control_plane: ControlPlaneConfig,
    pub watch: WatchConfig,
    pub scheduler: SchedulerConfig,
    pub apply: ApplyConfig,
    pub reporter: ReporterConfig,
    pub engine: EngineConfig,
    pub events: EventsConfig,
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.display().to_string(), source })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Apply `KEEL_*` overrides for the knobs operators tune most.
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = lookup("KEEL_WORKERS").and_then(|s| s.parse().ok()) { self.scheduler.workers = v; }
        if let Some(v) = lookup("KEEL_RESYNC_SECS").and_then(|s| s.parse().ok()) { self.engine.resync_interval_secs = v; }
        if let Some(v) = lookup("KEEL_APPLY_TIMEOUT_MS").and_then(|s| s.parse().ok()) { self.apply.timeout_ms = v; }
        if let Some(v) = lookup("KEEL_FORWARD_EVENTS").and_then(|s| s.parse().ok()) { self.events.enabled = v; }
        self
    }

    /// Fill in the cluster id if none was configured.
    pub fn resolve_identity(mut self) -> Self {
        if self.cluster_id.as_deref().map_or(true, str::is_empty) {
            self.cluster_id = Some(uuid::Uuid::new_v4().to_string());
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |m: String| Err(ConfigError::Invalid(m));
        if self.control_plane.address.trim().is_empty() { return invalid("control_plane.address is empty".into()); }
        if self.control_plane.initial_connect_attempts == 0 {
            return invalid("control_plane.initial_connect_attempts must be > 0".into());
        }
        if self.control_plane.outbound_queue == 0 || self.control_plane.replay_buffer == 0 {
            return invalid("control_plane queues must be > 0".into());
        }
        if let Err(e) = self.control_plane.backoff.validate() { return invalid(format!("control_plane.backoff: {}", e)); }
        if self.watch.kinds.is_empty() { return invalid("watch.kinds is empty".into()); }
        let mut seen = std::collections::BTreeSet::new();
        for f in &self.watch.kinds {
            if f.kind.trim().is_empty() { return invalid("watch.kinds has an entry without kind".into()); }
            if !seen.insert(f.kind.as_str()) { return invalid(format!("watch.kinds lists {} twice", f.kind)); }
        }
        if let Err(e) = self.watch.backoff.validate() { return invalid(format!("watch.backoff: {}", e)); }
        if let Err(e) = self.scheduler.validate() { return invalid(format!("scheduler: {}", e)); }
        if self.apply.timeout_ms == 0 { return invalid("apply.timeout_ms must be > 0".into()); }
        if let Err(e) = self.reporter.validate() { return invalid(format!("reporter: {}", e)); }
        if self.engine.resync_interval_secs == 0 { return invalid("engine.resync_interval_secs must be > 0".into()); }
        if self.events.enabled {
            if self.events.kind.trim().is_empty() { return invalid("events.kind is empty".into()); }
            if seen.contains(self.events.kind.as_str()) {
                return invalid(format!("events.kind {} is also a reconciled kind", self.events.kind));
            }
        }
        Ok(())
    }

    pub fn kinds(&self) -> Vec<String> { self.watch.kinds.iter().map(|f| f.kind.clone()).collect() }

    /// Scope of the event watch, when forwarding is on.
    pub fn event_filter(&self) -> Option<WatchFilter> {
        if !self.events.enabled { return None; }
        let f = WatchFilter::kind(self.events.kind.clone()).unowned();
        Some(match &self.events.namespace {
            Some(ns) => f.in_namespace(ns.clone()),
            None => f,
        })
    }

    /// Every kind the cluster client must serve: reconciled kinds plus the event kind.
    pub fn cluster_filters(&self) -> Vec<WatchFilter> {
        self.watch.kinds.iter().cloned().chain(self.event_filter()).collect()
    }

    pub fn apply_timeout(&self) -> Duration { Duration::from_millis(self.apply.timeout_ms) }

    pub fn transport(&self) -> TransportConfig {
        let cp = &self.control_plane;
        TransportConfig {
            endpoint: cp.address.clone(),
            cluster: self.cluster_id.clone().unwrap_or_default(),
            backoff: cp.backoff,
            initial_connect_attempts: cp.initial_connect_attempts,
            connect_timeout_ms: cp.connect_timeout_ms,
            outbound_queue: cp.outbound_queue,
            replay_buffer: cp.replay_buffer,
            ..TransportConfig::default()
        }
    }

    pub fn watcher(&self) -> WatcherConfig {
        WatcherConfig { kinds: self.kinds(), backoff: self.watch.backoff, queue_cap: self.watch.queue_cap }
    }
}

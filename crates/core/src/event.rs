//! Cluster events (`v1/Event`) flattened into the report forwarded upstream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::ObservedResource;

/// What the control plane sees of one cluster event. Absent fields are empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterEvent {
    pub name: String,
    pub namespace: String,
    pub involved_kind: String,
    pub involved_name: String,
    pub reason: String,
    pub message: String,
    /// `Normal` or `Warning`.
    pub event_type: String,
    pub count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_timestamp: Option<DateTime<Utc>>,
}

fn text(v: &Json, path: &[&str]) -> String {
    path.iter()
        .try_fold(v, |v, key| v.get(*key))
        .and_then(Json::as_str)
        .unwrap_or_default()
        .to_string()
}

fn timestamp(v: &Json, key: &str) -> Option<DateTime<Utc>> {
    let raw = v.get(key)?.as_str()?;
    DateTime::parse_from_rfc3339(raw).ok().map(|t| t.with_timezone(&Utc))
}

impl ClusterEvent {
    pub fn from_observed(o: &ObservedResource) -> Self {
        let v = &o.spec;
        Self {
            name: o.descriptor.name.clone(),
            namespace: o.descriptor.namespace.clone().unwrap_or_default(),
            involved_kind: text(v, &["involvedObject", "kind"]),
            involved_name: text(v, &["involvedObject", "name"]),
            reason: text(v, &["reason"]),
            message: text(v, &["message"]),
            event_type: text(v, &["type"]),
            count: v.get("count").and_then(Json::as_u64).map_or(0, |c| c.min(u32::MAX as u64) as u32),
            first_timestamp: timestamp(v, "firstTimestamp"),
            last_timestamp: timestamp(v, "lastTimestamp"),
        }
    }
}

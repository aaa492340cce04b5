//! Control-plane wire protocol: one JSON object per line, tagged by `type`.

use keel_core::{ClusterEvent, ConvergenceStatus, DesiredDelta, DesiredSpec, DesiredStateSnapshot, ResourceDescriptor};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::TransportError;

/// One desired resource as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceEntry {
    #[serde(flatten)]
    pub descriptor: ResourceDescriptor,
    pub generation: u64,
    pub spec: Json,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_hint: Option<i32>,
}

impl ResourceEntry {
    fn into_parts(self) -> (ResourceDescriptor, DesiredSpec) {
        (self.descriptor, DesiredSpec { generation: self.generation, payload: self.spec, order_hint: self.order_hint })
    }
}

/// Frames sent by the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Inbound {
    #[serde(rename_all = "camelCase")]
    Full { generation: u64, resources: Vec<ResourceEntry> },
    #[serde(rename_all = "camelCase")]
    Delta {
        generation: u64,
        base_generation: u64,
        /// Added or changed resources.
        #[serde(default)]
        resources: Vec<ResourceEntry>,
        #[serde(default)]
        removals: Vec<ResourceDescriptor>,
    },
    /// Cumulative: every status frame up to and including `seq` was received.
    Ack { seq: u64 },
}

/// Frames sent by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Outbound {
    #[serde(rename_all = "camelCase")]
    Hello { cluster: String, agent_version: String },
    ResyncRequest { reason: String },
    Status { seq: u64, status: ConvergenceStatus },
    /// Forwarded cluster event. Best effort: never replayed or acknowledged.
    Event { event: ClusterEvent },
}

/// Desired-state update decoded from an inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum DesiredMessage {
    Full(DesiredStateSnapshot),
    Delta(DesiredDelta),
}

impl DesiredMessage {
    pub fn generation(&self) -> u64 {
        match self {
            DesiredMessage::Full(s) => s.generation,
            DesiredMessage::Delta(d) => d.generation,
        }
    }
}

impl Inbound {
    /// `None` for protocol-level frames (acks).
    pub fn into_desired(self) -> Option<DesiredMessage> {
        match self {
            Inbound::Full { generation, resources } => {
                let snap = resources.into_iter().fold(DesiredStateSnapshot::new(generation), |s, e| {
                    let (d, spec) = e.into_parts();
                    s.with(d, spec)
                });
                Some(DesiredMessage::Full(snap))
            }
            Inbound::Delta { generation, base_generation, resources, removals } => Some(DesiredMessage::Delta(DesiredDelta {
                base_generation,
                generation,
                upserts: resources.into_iter().map(ResourceEntry::into_parts).collect(),
                removals,
            })),
            Inbound::Ack { .. } => None,
        }
    }
}

pub fn encode(frame: &Outbound) -> Result<String, TransportError> {
    serde_json::to_string(frame).map_err(|e| TransportError::Codec(e.to_string()))
}

pub fn decode(line: &str) -> Result<Inbound, TransportError> {
    serde_json::from_str(line).map_err(|e| TransportError::Codec(e.to_string()))
}

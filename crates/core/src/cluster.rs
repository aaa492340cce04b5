//! Boundary to the cluster resource API: create/update/delete/list/watch
//! with optimistic-concurrency tokens.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::{ClusterError, DesiredSpec, ObservedResource, ResourceDescriptor, ResourceVersion};

/// Change reported by a watch channel.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Applied(ObservedResource),
    Deleted { descriptor: ResourceDescriptor, version: ResourceVersion },
    /// Progress marker; carries a resume token and nothing else.
    Bookmark(ResourceVersion),
}

impl WatchEvent {
    pub fn version(&self) -> &ResourceVersion {
        match self {
            WatchEvent::Applied(o) => &o.version,
            WatchEvent::Deleted { version, .. } => version,
            WatchEvent::Bookmark(v) => v,
        }
    }
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, ClusterError>>;

/// Per-kind scope of the list/watch calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchFilter {
    pub kind: String,
    #[serde(default)]
    pub namespace: Option<String>,
    /// Extra label selector, combined with the ownership selector.
    #[serde(default, alias = "label_selector")]
    pub label_selector: Option<String>,
    /// Cover every object of the kind, not only those carrying the ownership label.
    #[serde(default)]
    pub unowned: bool,
}

impl WatchFilter {
    pub fn kind(kind: impl Into<String>) -> Self {
        Self { kind: kind.into(), namespace: None, label_selector: None, unowned: false }
    }

    pub fn unowned(mut self) -> Self {
        self.unowned = true;
        self
    }

    pub fn in_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = Some(ns.into());
        self
    }
}

/// Result of a list call: current items plus the collection version to resume a watch from.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub items: Vec<ObservedResource>,
    pub version: Option<ResourceVersion>,
}

/// Primitives the reconciliation core needs from the cluster.
///
/// Writes stamp the descriptor identity, the ownership label and the
/// generation annotation onto the payload (see [`crate::stamp_payload`]).
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get(&self, descriptor: &ResourceDescriptor) -> Result<Option<ObservedResource>, ClusterError>;

    async fn create(&self, descriptor: &ResourceDescriptor, spec: &DesiredSpec) -> Result<ResourceVersion, ClusterError>;

    async fn update(
        &self,
        descriptor: &ResourceDescriptor,
        spec: &DesiredSpec,
        expected: &ResourceVersion,
    ) -> Result<ResourceVersion, ClusterError>;

    async fn delete(&self, descriptor: &ResourceDescriptor, expected: Option<&ResourceVersion>) -> Result<(), ClusterError>;

    async fn list(&self, kind: &str) -> Result<ListPage, ClusterError>;

    /// Open a watch for `kind`. With a resume token only changes newer than it are
    /// delivered; an expired token fails with [`ClusterError::ResumeTokenExpired`].
    async fn watch(&self, kind: &str, resume: Option<&ResourceVersion>) -> Result<WatchStream, ClusterError>;
}

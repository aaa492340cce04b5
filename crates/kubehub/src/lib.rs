//! Keel kubehub: the cluster API boundary implemented over kube-rs
//! (discovery, dynamic objects, list/watch with resume tokens).

#![forbid(unsafe_code)]

use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams, Preconditions, WatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info};

use keel_core::{
    stamp_payload, ClusterApi, ClusterError, DesiredSpec, ListPage, ObservedResource, ResourceDescriptor,
    ResourceVersion, WatchEvent, WatchFilter, WatchStream, MANAGED_BY_LABEL, MANAGED_BY_VALUE,
};

/// Server-side watch timeout; the watcher re-opens with its resume token afterwards.
const WATCH_TIMEOUT_SECS: u32 = 290;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Discover served resources (incl. CRDs) using kube Discovery.
pub async fn discover(client: Client) -> Result<Vec<(DiscoveredResource, ApiResource)>> {
    let discovery = Discovery::new(client).run().await.context("running API discovery")?;
    let mut out = Vec::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            let namespaced = matches!(caps.scope, Scope::Namespaced);
            let dr = DiscoveredResource {
                group: ar.group.clone(),
                version: ar.version.clone(),
                kind: ar.kind.clone(),
                namespaced,
            };
            out.push((dr, ar));
        }
    }
    out.sort_by(|(a, _), (b, _)| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
    Ok(out)
}

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() }),
        [group, version, kind] => Ok(GroupVersionKind { group: (*group).to_string(), version: (*version).to_string(), kind: (*kind).to_string() }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

/// Label selector for a kind: ownership label plus the filter's own selector.
/// Unowned filters carry only their own selector, if any.
pub fn selector_for(filter: Option<&WatchFilter>) -> Option<String> {
    let extra = filter.and_then(|f| f.label_selector.as_deref()).map(str::trim).filter(|s| !s.is_empty());
    if filter.is_some_and(|f| f.unowned) {
        return extra.map(str::to_string);
    }
    let owned = format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY_VALUE);
    Some(match extra {
        Some(extra) => format!("{},{}", owned, extra),
        None => owned,
    })
}

fn classify(e: kube::Error) -> ClusterError {
    counter!("kube_api_errors_total", 1u64);
    match e {
        kube::Error::Api(resp) if resp.reason == "AlreadyExists" => ClusterError::AlreadyExists(resp.message),
        kube::Error::Api(resp) => ClusterError::from_status(resp.code, resp.message),
        kube::Error::SerdeError(e) => ClusterError::MalformedSpec(e.to_string()),
        other => ClusterError::TransientNetwork(other.to_string()),
    }
}

fn to_observed(kind: &str, obj: &DynamicObject) -> Result<ObservedResource, ClusterError> {
    let raw = serde_json::to_value(obj).map_err(|e| ClusterError::MalformedSpec(e.to_string()))?;
    ObservedResource::from_raw(kind, &raw, Utc::now())
        .ok_or_else(|| ClusterError::MalformedSpec(format!("{} object without metadata.name", kind)))
}

fn to_object(
    ar: &ApiResource,
    d: &ResourceDescriptor,
    spec: &DesiredSpec,
    expected: Option<&ResourceVersion>,
) -> Result<DynamicObject, ClusterError> {
    let mut raw = stamp_payload(d, spec);
    if let Some(obj) = raw.as_object_mut() {
        obj.insert("apiVersion".into(), Json::String(ar.api_version.clone()));
        obj.insert("kind".into(), Json::String(ar.kind.clone()));
        if let (Some(rv), Some(meta)) = (expected, obj.get_mut("metadata").and_then(|m| m.as_object_mut())) {
            meta.insert("resourceVersion".into(), Json::String(rv.to_string()));
        }
    }
    serde_json::from_value(raw).map_err(|e| ClusterError::MalformedSpec(format!("{}: {}", d, e)))
}

/// kube-rs backed [`ClusterApi`]. Kinds are resolved once through discovery at construction.
pub struct KubeCluster {
    client: Client,
    filters: HashMap<String, WatchFilter>,
    resources: HashMap<String, (ApiResource, bool)>,
}

impl KubeCluster {
    /// Connect with the ambient kubeconfig / in-cluster credentials.
    pub async fn connect(filters: Vec<WatchFilter>) -> Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        Self::with_client(client, filters).await
    }

    /// Resolve every watched kind; fails when any of them is not served.
    pub async fn with_client(client: Client, filters: Vec<WatchFilter>) -> Result<Self> {
        let resources: HashMap<String, (ApiResource, bool)> = discover(client.clone())
            .await?
            .into_iter()
            .map(|(dr, ar)| (dr.gvk_key(), (ar, dr.namespaced)))
            .collect();
        for f in &filters {
            parse_gvk_key(&f.kind)?;
            if !resources.contains_key(&f.kind) {
                return Err(anyhow!("GVK not served by the cluster: {}", f.kind));
            }
        }
        info!(served = resources.len(), watched = filters.len(), "kube discovery complete");
        let filters = filters.into_iter().map(|f| (f.kind.clone(), f)).collect();
        Ok(Self { client, filters, resources })
    }

    fn resource(&self, kind: &str) -> Result<&(ApiResource, bool), ClusterError> {
        self.resources
            .get(kind)
            .ok_or_else(|| ClusterError::MalformedSpec(format!("kind {} is not served by the cluster", kind)))
    }

    fn object_api(&self, d: &ResourceDescriptor) -> Result<(Api<DynamicObject>, &ApiResource), ClusterError> {
        let (ar, namespaced) = self.resource(&d.kind)?;
        let api = match (namespaced, d.namespace.as_deref()) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, ar),
            (true, None) => return Err(ClusterError::MalformedSpec(format!("{}: namespace required for namespaced kind", d))),
            (false, _) => Api::all_with(self.client.clone(), ar),
        };
        Ok((api, ar))
    }

    fn collection_api(&self, kind: &str) -> Result<Api<DynamicObject>, ClusterError> {
        let (ar, namespaced) = self.resource(kind)?;
        let ns = self.filters.get(kind).and_then(|f| f.namespace.as_deref());
        Ok(match (namespaced, ns) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, ar),
            _ => Api::all_with(self.client.clone(), ar),
        })
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get(&self, d: &ResourceDescriptor) -> Result<Option<ObservedResource>, ClusterError> {
        let (api, _) = self.object_api(d)?;
        match api.get_opt(&d.name).await.map_err(classify)? {
            Some(obj) => Ok(Some(to_observed(&d.kind, &obj)?)),
            None => Ok(None),
        }
    }

    async fn create(&self, d: &ResourceDescriptor, spec: &DesiredSpec) -> Result<ResourceVersion, ClusterError> {
        let (api, ar) = self.object_api(d)?;
        let obj = to_object(ar, d, spec, None)?;
        let created = api.create(&PostParams::default(), &obj).await.map_err(classify)?;
        debug!(descriptor = %d, generation = spec.generation, "created");
        Ok(ResourceVersion::new(created.metadata.resource_version.unwrap_or_default()))
    }

    async fn update(
        &self,
        d: &ResourceDescriptor,
        spec: &DesiredSpec,
        expected: &ResourceVersion,
    ) -> Result<ResourceVersion, ClusterError> {
        let (api, ar) = self.object_api(d)?;
        let obj = to_object(ar, d, spec, Some(expected))?;
        // replace() carries metadata.resourceVersion, so the server rejects stale writes with 409
        let replaced = api.replace(&d.name, &PostParams::default(), &obj).await.map_err(classify)?;
        debug!(descriptor = %d, generation = spec.generation, "replaced");
        Ok(ResourceVersion::new(replaced.metadata.resource_version.unwrap_or_default()))
    }

    async fn delete(&self, d: &ResourceDescriptor, expected: Option<&ResourceVersion>) -> Result<(), ClusterError> {
        let (api, _) = self.object_api(d)?;
        let dp = DeleteParams {
            preconditions: expected.map(|rv| Preconditions { resource_version: Some(rv.to_string()), uid: None }),
            ..DeleteParams::default()
        };
        api.delete(&d.name, &dp).await.map_err(classify)?;
        debug!(descriptor = %d, "deleted");
        Ok(())
    }

    async fn list(&self, kind: &str) -> Result<ListPage, ClusterError> {
        let api = self.collection_api(kind)?;
        let lp = match selector_for(self.filters.get(kind)) {
            Some(sel) => ListParams::default().labels(&sel),
            None => ListParams::default(),
        };
        let list = api.list(&lp).await.map_err(classify)?;
        let items = list.items.iter().map(|o| to_observed(kind, o)).collect::<Result<Vec<_>, _>>()?;
        let version = list.metadata.resource_version.filter(|v| !v.is_empty()).map(ResourceVersion::new);
        Ok(ListPage { items, version })
    }

    async fn watch(&self, kind: &str, resume: Option<&ResourceVersion>) -> Result<WatchStream, ClusterError> {
        let api = self.collection_api(kind)?;
        let mut wp = WatchParams { bookmarks: true, ..WatchParams::default() }.timeout(WATCH_TIMEOUT_SECS);
        if let Some(sel) = selector_for(self.filters.get(kind)) {
            wp = wp.labels(&sel);
        }
        let rv = resume.map(|v| v.to_string()).unwrap_or_else(|| "0".to_string());
        let stream = api.watch(&wp, &rv).await.map_err(classify)?;
        let kind = kind.to_string();
        let mapped = stream.map(move |res| match res {
            Ok(kube::api::WatchEvent::Added(o)) | Ok(kube::api::WatchEvent::Modified(o)) => {
                to_observed(&kind, &o).map(WatchEvent::Applied)
            }
            Ok(kube::api::WatchEvent::Deleted(o)) => to_observed(&kind, &o)
                .map(|obs| WatchEvent::Deleted { descriptor: obs.descriptor, version: obs.version }),
            Ok(kube::api::WatchEvent::Bookmark(b)) => {
                Ok(WatchEvent::Bookmark(ResourceVersion::new(b.metadata.resource_version)))
            }
            Ok(kube::api::WatchEvent::Error(resp)) => Err(ClusterError::from_status(resp.code, resp.message)),
            Err(e) => Err(classify(e)),
        });
        Ok(mapped.boxed())
    }
}

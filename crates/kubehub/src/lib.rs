//! Convergence harness kube integration: object access and event subscription.
//!
//! Everything the harness does against a cluster goes through two seams:
//! `ObjectClient` (get/create/update/delete/list of dynamic objects) and `EventSource`
//! (a stream of notification events). `KubeObjectClient`/`KubeEventSource` talk to a
//! real API server; `mock::MemoryCluster` implements both in memory for tests.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use conv_core::{parse_uid, ApiError, ManagedResourceSnapshot, NotificationEvent, ObjectRef, ResourceKind, Uid};
use futures::stream::BoxStream;
use futures::{future, StreamExt};
use k8s_openapi::api::core::v1::Event;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind, ObjectMeta, TypeMeta},
    discovery::Discovery,
    runtime::watcher::{self, Event as WatchEvent},
    runtime::WatchStreamExt,
    Client,
};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tracing::{debug, info, warn};

pub mod mock;

pub use mock::MemoryCluster;

pub type EventStream = BoxStream<'static, NotificationEvent>;

/// CRUD over dynamic objects addressed by `ObjectRef`.
#[async_trait]
pub trait ObjectClient: Send + Sync {
    async fn get(&self, obj: &ObjectRef) -> Result<DynamicObject, ApiError>;
    async fn create(&self, kind: &ResourceKind, obj: &DynamicObject) -> Result<DynamicObject, ApiError>;
    /// Replace; rejected with `Conflict` when `metadata.resourceVersion` is stale.
    async fn update(&self, kind: &ResourceKind, obj: &DynamicObject) -> Result<DynamicObject, ApiError>;
    async fn delete(&self, obj: &ObjectRef) -> Result<(), ApiError>;
    /// `namespace = None` lists across all namespaces.
    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>, ApiError>;
}

#[async_trait]
impl<T: ObjectClient + ?Sized> ObjectClient for Arc<T> {
    async fn get(&self, obj: &ObjectRef) -> Result<DynamicObject, ApiError> { (**self).get(obj).await }
    async fn create(&self, kind: &ResourceKind, obj: &DynamicObject) -> Result<DynamicObject, ApiError> {
        (**self).create(kind, obj).await
    }
    async fn update(&self, kind: &ResourceKind, obj: &DynamicObject) -> Result<DynamicObject, ApiError> {
        (**self).update(kind, obj).await
    }
    async fn delete(&self, obj: &ObjectRef) -> Result<(), ApiError> { (**self).delete(obj).await }
    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>, ApiError> {
        (**self).list(kind, namespace, label_selector).await
    }
}

/// Stream of notification events from the cluster.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn subscribe(&self) -> Result<EventStream>;
}

// ---- object helpers ----

/// Build a dynamic object of `kind`. The namespace is dropped for cluster-scoped kinds.
pub fn new_object(kind: &ResourceKind, name: &str, namespace: Option<&str>, data: Json) -> DynamicObject {
    DynamicObject {
        types: Some(TypeMeta { api_version: kind.api_version(), kind: kind.kind.clone() }),
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: if kind.namespaced { namespace.map(|s| s.to_string()) } else { None },
            ..Default::default()
        },
        data,
    }
}

pub fn object_ref_of(kind: &ResourceKind, obj: &DynamicObject) -> Result<ObjectRef, ApiError> {
    let name = obj.metadata.name.as_deref().ok_or_else(|| ApiError::Other("object missing metadata.name".into()))?;
    Ok(ObjectRef::new(kind.clone(), name, obj.metadata.namespace.as_deref()))
}

pub fn uid_of(obj: &DynamicObject) -> Option<Uid> {
    obj.metadata.uid.as_deref().and_then(|u| parse_uid(u).ok())
}

pub fn to_json(obj: &DynamicObject) -> Result<Json> {
    serde_json::to_value(obj).context("serializing DynamicObject")
}

/// Decode the managed resource from its dynamic rendering.
pub fn snapshot_of(obj: &DynamicObject) -> Result<ManagedResourceSnapshot> {
    ManagedResourceSnapshot::from_json(&to_json(obj)?)
}

pub fn labels_of(obj: &DynamicObject) -> BTreeMap<String, String> {
    obj.metadata.labels.clone().unwrap_or_default()
}

// ---- label selectors ----

#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    Exists(String),
    NotExists(String),
}

/// Equality-based label selector (`a=b,c!=d,e,!f`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector(Vec<Requirement>);

impl LabelSelector {
    pub fn parse(s: &str) -> Result<Self> {
        let mut reqs = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let req = if let Some(key) = part.strip_prefix('!') {
                Requirement::NotExists(key.trim().to_string())
            } else if let Some((k, v)) = part.split_once("!=") {
                Requirement::NotEquals(k.trim().to_string(), v.trim().to_string())
            } else if let Some((k, v)) = part.split_once("==").or_else(|| part.split_once('=')) {
                Requirement::Equals(k.trim().to_string(), v.trim().to_string())
            } else {
                Requirement::Exists(part.to_string())
            };
            let key = match &req {
                Requirement::Equals(k, _) | Requirement::NotEquals(k, _) | Requirement::Exists(k) | Requirement::NotExists(k) => k,
            };
            if key.is_empty() || key.contains(char::is_whitespace) {
                return Err(anyhow!("invalid label selector term: {}", part));
            }
            reqs.push(req);
        }
        Ok(Self(reqs))
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|r| match r {
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            Requirement::NotEquals(k, v) => labels.get(k) != Some(v),
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::NotExists(k) => !labels.contains_key(k),
        })
    }
}

// ---- kube-rs implementation ----

pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("creating kube client from the current context")
}

/// `major.minor` of the API server, as the validator compares it.
pub async fn server_version(client: &Client) -> Result<String> {
    let info = client.apiserver_version().await.context("reading API server version")?;
    Ok(format!("{}.{}", info.major, info.minor.trim_end_matches('+')))
}

fn map_kube_error(e: kube::Error, what: &str) -> ApiError {
    counter!("api_errors_total", 1u64);
    match e {
        kube::Error::Api(ae) if ae.code == 404 => ApiError::NotFound(format!("{}: {}", what, ae.message)),
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            ApiError::AlreadyExists(format!("{}: {}", what, ae.message))
        }
        kube::Error::Api(ae) if ae.code == 409 => ApiError::Conflict(format!("{}: {}", what, ae.message)),
        other => ApiError::Other(format!("{}: {}", what, other)),
    }
}

/// Look up the exact version of a kind; the preferred version is not good enough
/// when the same kind is served under several versions.
async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<ApiResource> {
    let discovery = Discovery::new(client).filter(&[gvk.group.as_str()]).run().await?;
    for group in discovery.groups() {
        for (ar, _caps) in group.versioned_resources(&gvk.version) {
            if ar.kind == gvk.kind {
                return Ok(ar);
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

/// `ObjectClient` over a kube-rs `Client`. Discovery results are cached per GVK.
pub struct KubeObjectClient {
    client: Client,
    resources: Mutex<FxHashMap<String, ApiResource>>,
}

impl KubeObjectClient {
    pub fn new(client: Client) -> Self {
        Self { client, resources: Mutex::new(FxHashMap::default()) }
    }

    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(get_kube_client().await?))
    }

    pub fn client(&self) -> Client { self.client.clone() }

    async fn api_resource(&self, kind: &ResourceKind) -> Result<ApiResource, ApiError> {
        let key = kind.gvk_key();
        if let Some(ar) = self.resources.lock().unwrap_or_else(PoisonError::into_inner).get(&key) {
            return Ok(ar.clone());
        }
        let gvk = GroupVersionKind::gvk(&kind.group, &kind.version, &kind.kind);
        let ar = find_api_resource(self.client.clone(), &gvk)
            .await
            .map_err(|e| ApiError::Other(format!("discovery for {}: {:#}", key, e)))?;
        debug!(gvk = %key, plural = %ar.plural, "discovery cached");
        self.resources.lock().unwrap_or_else(PoisonError::into_inner).insert(key, ar.clone());
        Ok(ar)
    }

    async fn api(&self, kind: &ResourceKind, namespace: Option<&str>) -> Result<Api<DynamicObject>, ApiError> {
        let ar = self.api_resource(kind).await?;
        if !kind.namespaced {
            return Ok(Api::all_with(self.client.clone(), &ar));
        }
        match namespace {
            Some(ns) => Ok(Api::namespaced_with(self.client.clone(), ns, &ar)),
            None => Err(ApiError::Other(format!("namespace required for namespaced kind {}", kind))),
        }
    }
}

#[async_trait]
impl ObjectClient for KubeObjectClient {
    async fn get(&self, obj: &ObjectRef) -> Result<DynamicObject, ApiError> {
        let api = self.api(&obj.kind, obj.namespace.as_deref()).await?;
        api.get(&obj.name).await.map_err(|e| map_kube_error(e, &obj.to_string()))
    }

    async fn create(&self, kind: &ResourceKind, obj: &DynamicObject) -> Result<DynamicObject, ApiError> {
        let r = object_ref_of(kind, obj)?;
        let api = self.api(kind, r.namespace.as_deref()).await?;
        let created = api.create(&PostParams::default(), obj).await.map_err(|e| map_kube_error(e, &r.to_string()))?;
        debug!(object = %r, "created");
        Ok(created)
    }

    async fn update(&self, kind: &ResourceKind, obj: &DynamicObject) -> Result<DynamicObject, ApiError> {
        let r = object_ref_of(kind, obj)?;
        let api = self.api(kind, r.namespace.as_deref()).await?;
        api.replace(&r.name, &PostParams::default(), obj).await.map_err(|e| map_kube_error(e, &r.to_string()))
    }

    async fn delete(&self, obj: &ObjectRef) -> Result<(), ApiError> {
        let api = self.api(&obj.kind, obj.namespace.as_deref()).await?;
        api.delete(&obj.name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(|e| map_kube_error(e, &obj.to_string()))
    }

    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>, ApiError> {
        let ar = self.api_resource(kind).await?;
        let api: Api<DynamicObject> = match (kind.namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        };
        let mut lp = ListParams::default();
        if let Some(sel) = label_selector {
            lp = lp.labels(sel);
        }
        let list = api.list(&lp).await.map_err(|e| map_kube_error(e, &format!("list {}", kind)))?;
        Ok(list.items)
    }
}

// ---- events ----

fn notification_from(ev: &Event) -> Option<NotificationEvent> {
    let involved_uid = ev.involved_object.uid.as_deref().and_then(|u| parse_uid(u).ok())?;
    let reason = ev.reason.clone()?;
    let component = ev
        .source
        .as_ref()
        .and_then(|s| s.component.clone())
        .or_else(|| ev.reporting_component.clone())
        .unwrap_or_default();
    let timestamp = ev
        .last_timestamp
        .as_ref()
        .map(|t| t.0)
        .or_else(|| ev.event_time.as_ref().map(|t| t.0))
        .or_else(|| ev.metadata.creation_timestamp.as_ref().map(|t| t.0))
        .unwrap_or_else(chrono::Utc::now);
    Some(NotificationEvent { involved_uid, reason, component, timestamp })
}

/// Cluster-wide watch on `core/v1` Events.
pub struct KubeEventSource {
    client: Client,
}

impl KubeEventSource {
    pub fn new(client: Client) -> Self { Self { client } }
}

#[async_trait]
impl EventSource for KubeEventSource {
    async fn subscribe(&self) -> Result<EventStream> {
        let api: Api<Event> = Api::all(self.client.clone());
        let stream = watcher::watcher(api, watcher::Config::default())
            .default_backoff()
            .filter_map(|res| {
                future::ready(match res {
                    Ok(WatchEvent::Applied(e)) => Some(vec![e]),
                    Ok(WatchEvent::Restarted(list)) => {
                        debug!(count = list.len(), "event watch restart");
                        Some(list)
                    }
                    Ok(WatchEvent::Deleted(_)) => None,
                    Err(e) => {
                        warn!(error = %e, "event watch error; retrying with backoff");
                        None
                    }
                })
            })
            .flat_map(futures::stream::iter)
            .filter_map(|e| future::ready(notification_from(&e)));
        info!("event watcher started");
        Ok(stream.boxed())
    }
}

//! In-memory cluster for tests: optimistic concurrency, label selectors, version
//! conversion and conflict injection, plus an event channel.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use conv_core::{ApiError, NotificationEvent, ObjectRef, ResourceKind, Uid};
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::{DynamicObject, TypeMeta};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tokio::sync::broadcast;
use tracing::debug;

use crate::{labels_of, object_ref_of, EventSource, EventStream, LabelSelector, ObjectClient};

/// Converts the body (everything but metadata) of an object between two versions.
pub type Converter = Arc<dyn Fn(&Json, &str, &str) -> Json + Send + Sync>;

type Interference = Box<dyn FnOnce(&mut DynamicObject) + Send>;

/// Objects are keyed by group and kind, not version: every served version sees the
/// same object, converted on read when a converter is registered.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct Key {
    group: String,
    kind: String,
    namespace: Option<String>,
    name: String,
}

impl Key {
    fn of(obj: &ObjectRef) -> Self {
        Self {
            group: obj.kind.group.clone(),
            kind: obj.kind.kind.clone(),
            namespace: obj.namespace.clone(),
            name: obj.name.clone(),
        }
    }
}

struct Stored {
    version: String,
    obj: DynamicObject,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Stored>,
    next_rv: u64,
    writes: u64,
    interference: FxHashMap<Key, VecDeque<Option<Interference>>>,
    conversions: FxHashMap<(String, String), Converter>,
}

impl State {
    fn bump(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }

    fn render(&self, key: &Key, stored: &Stored, kind: &ResourceKind) -> DynamicObject {
        let mut out = stored.obj.clone();
        out.types = Some(TypeMeta { api_version: kind.api_version(), kind: kind.kind.clone() });
        if stored.version != kind.version {
            if let Some(conv) = self.conversions.get(&(key.group.clone(), key.kind.clone())) {
                out.data = (**conv)(&stored.obj.data, &stored.version, &kind.version);
            }
        }
        out
    }
}

/// Shared in-memory object store implementing `ObjectClient` and `EventSource`.
pub struct MemoryCluster {
    state: Mutex<State>,
    events: broadcast::Sender<NotificationEvent>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self { state: Mutex::new(State::default()), events }
    }
}

impl MemoryCluster {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish a notification event to every subscriber.
    pub fn emit(&self, involved_uid: Uid, reason: &str, component: &str) {
        let ev = NotificationEvent {
            involved_uid,
            reason: reason.to_string(),
            component: component.to_string(),
            timestamp: chrono::Utc::now(),
        };
        let _ = self.events.send(ev);
    }

    /// Reject the next update of `obj` with a conflict without touching it.
    pub fn fail_next_update_with_conflict(&self, obj: &ObjectRef) {
        self.lock().interference.entry(Key::of(obj)).or_default().push_back(None);
    }

    /// Before the next update of `obj` lands, apply `f` as a competing writer would
    /// (bumping the revision), so the pending update becomes stale.
    pub fn race_next_update(&self, obj: &ObjectRef, f: impl FnOnce(&mut DynamicObject) + Send + 'static) {
        self.lock().interference.entry(Key::of(obj)).or_default().push_back(Some(Box::new(f)));
    }

    pub fn register_conversion(&self, group: &str, kind: &str, conv: Converter) {
        self.lock().conversions.insert((group.to_string(), kind.to_string()), conv);
    }

    pub fn contains(&self, obj: &ObjectRef) -> bool {
        self.lock().objects.contains_key(&Key::of(obj))
    }

    pub fn len(&self) -> usize { self.lock().objects.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Number of successful creates and updates so far.
    pub fn write_count(&self) -> u64 { self.lock().writes }

    pub fn event_stream(&self) -> EventStream {
        let rx = self.events.subscribe();
        futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(ev) => return Some((ev, rx)),
                    Err(broadcast::error::RecvError::Lagged(n)) => debug!(skipped = n, "event subscriber lagged"),
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}

#[async_trait]
impl ObjectClient for MemoryCluster {
    async fn get(&self, obj: &ObjectRef) -> Result<DynamicObject, ApiError> {
        let st = self.lock();
        let key = Key::of(obj);
        let stored = st.objects.get(&key).ok_or_else(|| ApiError::NotFound(obj.to_string()))?;
        Ok(st.render(&key, stored, &obj.kind))
    }

    async fn create(&self, kind: &ResourceKind, obj: &DynamicObject) -> Result<DynamicObject, ApiError> {
        let r = object_ref_of(kind, obj)?;
        if kind.namespaced && r.namespace.is_none() {
            return Err(ApiError::Other(format!("namespace required for {}", r)));
        }
        let mut st = self.lock();
        let key = Key::of(&r);
        if st.objects.contains_key(&key) {
            return Err(ApiError::AlreadyExists(r.to_string()));
        }
        let mut o = obj.clone();
        o.metadata.namespace = r.namespace.clone();
        o.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        o.metadata.resource_version = Some(st.bump());
        o.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
        o.metadata.generation = Some(1);
        st.writes += 1;
        st.objects.insert(key.clone(), Stored { version: kind.version.clone(), obj: o });
        debug!(object = %r, "memory: created");
        let stored = st.objects.get(&key).ok_or_else(|| ApiError::Other("lost object after create".into()))?;
        Ok(st.render(&key, stored, kind))
    }

    async fn update(&self, kind: &ResourceKind, obj: &DynamicObject) -> Result<DynamicObject, ApiError> {
        let r = object_ref_of(kind, obj)?;
        let mut st = self.lock();
        let key = Key::of(&r);
        if !st.objects.contains_key(&key) {
            return Err(ApiError::NotFound(r.to_string()));
        }
        let interference = st.interference.get_mut(&key).and_then(|q| q.pop_front());
        match interference {
            Some(None) => return Err(ApiError::Conflict(format!("{}: injected conflict", r))),
            Some(Some(f)) => {
                let rv = st.bump();
                if let Some(stored) = st.objects.get_mut(&key) {
                    f(&mut stored.obj);
                    stored.obj.metadata.resource_version = Some(rv);
                }
                st.writes += 1;
            }
            None => {}
        }
        let rv = st.bump();
        let stored = st.objects.get_mut(&key).ok_or_else(|| ApiError::NotFound(r.to_string()))?;
        if let Some(sent) = obj.metadata.resource_version.as_deref() {
            if Some(sent) != stored.obj.metadata.resource_version.as_deref() {
                return Err(ApiError::Conflict(format!(
                    "{}: resourceVersion {} is stale (current {})",
                    r,
                    sent,
                    stored.obj.metadata.resource_version.as_deref().unwrap_or("")
                )));
            }
        }
        let mut o = obj.clone();
        o.metadata.namespace = r.namespace.clone();
        o.metadata.uid = stored.obj.metadata.uid.clone();
        o.metadata.creation_timestamp = stored.obj.metadata.creation_timestamp.clone();
        o.metadata.resource_version = Some(rv);
        let generation = stored.obj.metadata.generation.unwrap_or(1);
        let spec_changed = stored.obj.data.get("spec") != obj.data.get("spec") && stored.version == kind.version;
        o.metadata.generation = Some(if spec_changed { generation + 1 } else { generation });
        stored.version = kind.version.clone();
        stored.obj = o;
        st.writes += 1;
        debug!(object = %r, "memory: updated");
        let stored = st.objects.get(&key).ok_or_else(|| ApiError::NotFound(r.to_string()))?;
        Ok(st.render(&key, stored, kind))
    }

    async fn delete(&self, obj: &ObjectRef) -> Result<(), ApiError> {
        let mut st = self.lock();
        match st.objects.remove(&Key::of(obj)) {
            Some(_) => {
                debug!(object = %obj, "memory: deleted");
                Ok(())
            }
            None => Err(ApiError::NotFound(obj.to_string())),
        }
    }

    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>, ApiError> {
        let selector = match label_selector {
            Some(s) => LabelSelector::parse(s).map_err(|e| ApiError::Other(e.to_string()))?,
            None => LabelSelector::default(),
        };
        let st = self.lock();
        let out = st
            .objects
            .iter()
            .filter(|(k, _)| k.group == kind.group && k.kind == kind.kind)
            .filter(|(k, _)| !kind.namespaced || namespace.is_none() || k.namespace.as_deref() == namespace)
            .filter(|(_, s)| selector.matches(&labels_of(&s.obj)))
            .map(|(k, s)| st.render(k, s, kind))
            .collect();
        Ok(out)
    }
}

#[async_trait]
impl EventSource for MemoryCluster {
    async fn subscribe(&self) -> Result<EventStream> { Ok(self.event_stream()) }
}

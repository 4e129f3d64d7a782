//! Convergence harness core types: object identities, the managed resource model,
//! notification events and the error taxonomy shared by every crate.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub mod layout;

pub use layout::{ChildRole, DriverLayout};

/// Stable object identity (metadata.uid) in binary form.
pub type Uid = [u8; 16];

pub fn parse_uid(uid_str: &str) -> Result<Uid> {
    let u = uuid::Uuid::parse_str(uid_str).context("parsing metadata.uid as uuid")?;
    Ok(*u.as_bytes())
}

pub fn format_uid(uid: &Uid) -> String {
    uuid::Uuid::from_bytes(*uid).to_string()
}

/// A served Kubernetes resource kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespaced: bool,
}

impl ResourceKind {
    pub fn new(group: &str, version: &str, kind: &str, namespaced: bool) -> Self {
        Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string(), namespaced }
    }

    /// `v1/Kind` for the core group, `group/v1/Kind` otherwise.
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    pub fn with_version(&self, version: &str) -> Self {
        Self { version: version.to_string(), ..self.clone() }
    }

    pub fn secret() -> Self { Self::new("", "v1", "Secret", true) }
    pub fn service() -> Self { Self::new("", "v1", "Service", true) }
    pub fn service_account() -> Self { Self::new("", "v1", "ServiceAccount", true) }
    pub fn pod() -> Self { Self::new("", "v1", "Pod", true) }
    pub fn persistent_volume_claim() -> Self { Self::new("", "v1", "PersistentVolumeClaim", true) }
    pub fn persistent_volume() -> Self { Self::new("", "v1", "PersistentVolume", false) }
    pub fn role() -> Self { Self::new("rbac.authorization.k8s.io", "v1", "Role", true) }
    pub fn role_binding() -> Self { Self::new("rbac.authorization.k8s.io", "v1", "RoleBinding", true) }
    pub fn cluster_role() -> Self { Self::new("rbac.authorization.k8s.io", "v1", "ClusterRole", false) }
    pub fn cluster_role_binding() -> Self { Self::new("rbac.authorization.k8s.io", "v1", "ClusterRoleBinding", false) }
    pub fn stateful_set() -> Self { Self::new("apps", "v1", "StatefulSet", true) }
    pub fn daemon_set() -> Self { Self::new("apps", "v1", "DaemonSet", true) }
    pub fn deployment() -> Self { Self::new("apps", "v1", "Deployment", true) }
    pub fn csi_driver() -> Self { Self::new("storage.k8s.io", "v1", "CSIDriver", false) }
    pub fn storage_class() -> Self { Self::new("storage.k8s.io", "v1", "StorageClass", false) }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.gvk_key())
    }
}

/// Identity of an object the harness touches: kind + name + optional namespace.
/// Cluster-scoped kinds never carry a namespace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub kind: ResourceKind,
    pub name: String,
    pub namespace: Option<String>,
}

impl ObjectRef {
    pub fn new(kind: ResourceKind, name: impl Into<String>, namespace: Option<&str>) -> Self {
        let namespace = if kind.namespaced { namespace.map(|s| s.to_string()) } else { None };
        Self { kind, name: name.into(), namespace }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind.kind, self.name),
        }
    }
}

/// Identity of the custom resource under test. The name is opaque.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ManagedResourceRef {
    pub name: String,
    pub namespace: Option<String>,
}

impl ManagedResourceRef {
    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self { name: name.into(), namespace: None }
    }

    pub fn object_ref(&self, kind: &ResourceKind) -> ObjectRef {
        ObjectRef::new(kind.clone(), self.name.clone(), self.namespace.as_deref())
    }
}

impl fmt::Display for ManagedResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

// ---- status model ----

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Phase {
    #[default]
    Initializing,
    Running,
    Failed,
}

impl From<String> for Phase {
    fn from(s: String) -> Self {
        match s.as_str() {
            "Running" => Phase::Running,
            "Failed" => Phase::Failed,
            _ => Phase::Initializing,
        }
    }
}

impl From<Phase> for String {
    fn from(p: Phase) -> Self {
        match p {
            Phase::Initializing => String::new(),
            Phase::Running => "Running".into(),
            Phase::Failed => "Failed".into(),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Initializing => f.write_str("Initializing"),
            Phase::Running => f.write_str("Running"),
            Phase::Failed => f.write_str("Failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ConditionType {
    CertsReady,
    CertsVerified,
    DriverDeployed,
    Other(String),
}

impl From<String> for ConditionType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "CertsReady" => ConditionType::CertsReady,
            "CertsVerified" => ConditionType::CertsVerified,
            "DriverDeployed" => ConditionType::DriverDeployed,
            _ => ConditionType::Other(s),
        }
    }
}

impl From<ConditionType> for String {
    fn from(t: ConditionType) -> Self { t.to_string() }
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionType::CertsReady => f.write_str("CertsReady"),
            ConditionType::CertsVerified => f.write_str("CertsVerified"),
            ConditionType::DriverDeployed => f.write_str("DriverDeployed"),
            ConditionType::Other(s) => f.write_str(s),
        }
    }
}

impl FromStr for ConditionType {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> { Ok(s.to_string().into()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl From<String> for ConditionStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "True" => ConditionStatus::True,
            "False" => ConditionStatus::False,
            _ => ConditionStatus::Unknown,
        }
    }
}

impl From<ConditionStatus> for String {
    fn from(s: ConditionStatus) -> Self { s.to_string() }
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionStatus::True => f.write_str("True"),
            ConditionStatus::False => f.write_str("False"),
            ConditionStatus::Unknown => f.write_str("Unknown"),
        }
    }
}

impl FromStr for ConditionStatus {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "True" | "true" => Ok(ConditionStatus::True),
            "False" | "false" => Ok(ConditionStatus::False),
            "Unknown" | "unknown" => Ok(ConditionStatus::Unknown),
            other => Err(anyhow!("invalid condition status: {} (expect True, False or Unknown)", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Fields this model does not name, kept so status comparisons see everything.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Json>,
}

// ---- spec model ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMode {
    Lvm,
    Direct,
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceMode::Lvm => f.write_str("lvm"),
            DeviceMode::Direct => f.write_str("direct"),
        }
    }
}

impl FromStr for DeviceMode {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "lvm" => Ok(DeviceMode::Lvm),
            "direct" => Ok(DeviceMode::Direct),
            other => Err(anyhow!("invalid device mode: {} (expect lvm or direct)", other)),
        }
    }
}

/// Container resource requirements; quantities are kept as the API renders them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<BTreeMap<String, String>>,
}

impl ResourceRequirements {
    pub fn limits(cpu: &str, memory: &str) -> Self {
        let mut m = BTreeMap::new();
        m.insert("cpu".to_string(), cpu.to_string());
        m.insert("memory".to_string(), memory.to_string());
        Self { limits: Some(m), requests: None }
    }

    pub fn with_requests(mut self, cpu: &str, memory: &str) -> Self {
        let mut m = BTreeMap::new();
        m.insert("cpu".to_string(), cpu.to_string());
        m.insert("memory".to_string(), memory.to_string());
        self.requests = Some(m);
        self
    }
}

/// Desired state of the driver deployment. Only the fields scenarios edit are typed;
/// everything else rides along in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioner_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_registrar_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_mode: Option<DeviceMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pmem_percentage: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_driver_resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_driver_resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioner_resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_registrar_resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_cert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_controller_cert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_controller_key: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Json>,
}

impl DeploymentSpec {
    pub fn with_image(image: &str) -> Self {
        Self { image: Some(image.to_string()), ..Default::default() }
    }
}

/// Point-in-time read of the managed resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedResourceSnapshot {
    pub reference: ManagedResourceRef,
    pub spec: DeploymentSpec,
    pub status: ResourceStatus,
    pub uid: Uid,
    pub resource_version: String,
}

impl ManagedResourceSnapshot {
    /// Build a snapshot from the raw JSON rendering of the object.
    pub fn from_json(raw: &Json) -> Result<Self> {
        let meta = raw.get("metadata").ok_or_else(|| anyhow!("object missing metadata"))?;
        let name = meta
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("object missing metadata.name"))?
            .to_string();
        let namespace = meta.get("namespace").and_then(|v| v.as_str()).map(|s| s.to_string());
        let uid_str = meta
            .get("uid")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("object missing metadata.uid"))?;
        let uid = parse_uid(uid_str)?;
        let resource_version = meta.get("resourceVersion").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let spec = match raw.get("spec") {
            Some(s) if !s.is_null() => serde_json::from_value(s.clone()).context("decoding spec")?,
            _ => DeploymentSpec::default(),
        };
        let status = match raw.get("status") {
            Some(s) if !s.is_null() => serde_json::from_value(s.clone()).context("decoding status")?,
            _ => ResourceStatus::default(),
        };
        Ok(Self { reference: ManagedResourceRef { name, namespace }, spec, status, uid, resource_version })
    }

    pub fn condition_map(&self) -> BTreeMap<ConditionType, ConditionStatus> {
        self.status.conditions.iter().map(|c| (c.condition_type.clone(), c.status)).collect()
    }
}

/// A notification event as seen by the harness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub involved_uid: Uid,
    pub reason: String,
    pub component: String,
    pub timestamp: DateTime<Utc>,
}

/// Event reasons the operator emits for the managed resource.
pub mod reasons {
    pub const CREATED: &str = "Created";
    pub const RUNNING: &str = "Running";
    pub const FAILED: &str = "Failed";
}

// ---- errors ----

/// Errors surfaced by the object store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ApiError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("already_exists: {0}")]
    AlreadyExists(String),
    #[error("api: {0}")]
    Other(String),
}

impl ApiError {
    pub fn is_not_found(&self) -> bool { matches!(self, ApiError::NotFound(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, ApiError::Conflict(_)) }
    pub fn is_already_exists(&self) -> bool { matches!(self, ApiError::AlreadyExists(_)) }
}

/// Scenario-level failures. Transient and conflict failures never reach this type.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("{what}: terminal failure after {attempts} attempt(s): {message}")]
    Terminal { what: String, attempts: u32, message: String },
    #[error("{what}: timed out after {elapsed:?} ({attempts} attempt(s)); last error: {last}")]
    Timeout { what: String, elapsed: Duration, attempts: u32, last: String },
    #[error("{what}: failed after {elapsed:?} ({samples} sample(s)) while required to hold: {message}")]
    Unstable { what: String, elapsed: Duration, samples: u32, message: String },
    #[error("{kind}/{name} was not recovered within {elapsed:?}; last error: {last}")]
    RecoveryTimeout { kind: String, name: String, elapsed: Duration, last: String },
    #[error("condition set mismatch for {name}: {detail}")]
    ConditionMismatch { name: String, detail: String },
    #[error("scenario {scenario} exceeded its deadline of {deadline:?}")]
    Deadline { scenario: String, deadline: Duration },
    #[error("scenario {scenario}: illegal transition {from} -> {to}")]
    IllegalTransition { scenario: String, from: String, to: String },
    #[error("{0}")]
    Expectation(String),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("invalid object: {0}")]
    Invalid(String),
}

pub type HarnessResult<T> = std::result::Result<T, HarnessError>;

pub mod prelude {
    pub use super::{
        ApiError, ChildRole, Condition, ConditionStatus, ConditionType, DeploymentSpec, DeviceMode, DriverLayout,
        HarnessError, HarnessResult, ManagedResourceRef, ManagedResourceSnapshot, NotificationEvent, ObjectRef, Phase,
        ResourceKind, ResourceStatus, Uid,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(name: &str) -> Json {
        serde_json::json!({
            "apiVersion": "pmem-csi.intel.com/v1beta1",
            "kind": "Deployment",
            "metadata": {
                "name": name,
                "uid": "6f0c1a1e-4c53-4b7e-9a42-2d7b1f1c0a01",
                "resourceVersion": "42"
            },
            "spec": { "image": "unexisting/pmem-csi-driver", "deviceMode": "direct", "logLevel": 3, "kubeletDir": "/var/lib/kubelet" },
            "status": {
                "phase": "Running",
                "conditions": [
                    { "type": "CertsReady", "status": "True" },
                    { "type": "DriverDeployed", "status": "False", "reason": "waiting" }
                ],
                "lastUpdated": "2020-01-01T00:00:00Z"
            }
        })
    }

    #[test]
    fn snapshot_decodes_dotted_name_and_status() {
        let snap = ManagedResourceSnapshot::from_json(&raw("test.deployment.example.org")).unwrap();
        assert_eq!(snap.reference.name, "test.deployment.example.org");
        assert_eq!(snap.reference.namespace, None);
        assert_eq!(snap.resource_version, "42");
        assert_eq!(snap.status.phase, Phase::Running);
        assert_eq!(snap.spec.device_mode, Some(DeviceMode::Direct));
        assert_eq!(snap.spec.log_level, Some(3));
        assert!(snap.spec.extra.contains_key("kubeletDir"));
        assert!(snap.status.extra.contains_key("lastUpdated"));
        let m = snap.condition_map();
        assert_eq!(m.get(&ConditionType::CertsReady), Some(&ConditionStatus::True));
        assert_eq!(m.get(&ConditionType::DriverDeployed), Some(&ConditionStatus::False));
    }

    #[test]
    fn snapshot_without_status_is_initializing() {
        let mut v = raw("x");
        v.as_object_mut().unwrap().remove("status");
        let snap = ManagedResourceSnapshot::from_json(&v).unwrap();
        assert_eq!(snap.status.phase, Phase::Initializing);
        assert!(snap.status.conditions.is_empty());
    }

    #[test]
    fn snapshot_requires_uid() {
        let mut v = raw("x");
        v["metadata"].as_object_mut().unwrap().remove("uid");
        let e = ManagedResourceSnapshot::from_json(&v).unwrap_err().to_string();
        assert!(e.contains("metadata.uid"), "e={}", e);
    }

    #[test]
    fn spec_preserves_unknown_fields_on_reserialize() {
        let snap = ManagedResourceSnapshot::from_json(&raw("x")).unwrap();
        let back = serde_json::to_value(&snap.spec).unwrap();
        assert_eq!(back["kubeletDir"], "/var/lib/kubelet");
        assert_eq!(back["deviceMode"], "direct");
        assert!(back.get("pullPolicy").is_none());
    }

    #[test]
    fn phase_round_trips_empty_string() {
        assert_eq!(serde_json::to_value(Phase::Initializing).unwrap(), serde_json::json!(""));
        let p: Phase = serde_json::from_value(serde_json::json!("Failed")).unwrap();
        assert_eq!(p, Phase::Failed);
    }

    #[test]
    fn unknown_condition_type_is_kept() {
        let c: Condition = serde_json::from_value(serde_json::json!({"type": "Foo", "status": "Unknown"})).unwrap();
        assert_eq!(c.condition_type, ConditionType::Other("Foo".into()));
        assert_eq!(c.condition_type.to_string(), "Foo");
    }

    #[test]
    fn object_ref_drops_namespace_for_cluster_kinds() {
        let r = ObjectRef::new(ResourceKind::cluster_role(), "x", Some("ns"));
        assert_eq!(r.namespace, None);
        assert_eq!(r.to_string(), "ClusterRole/x");
        let r = ObjectRef::new(ResourceKind::secret(), "s", Some("ns"));
        assert_eq!(r.to_string(), "Secret/ns/s");
    }

    #[test]
    fn gvk_keys_match_core_and_grouped_forms() {
        assert_eq!(ResourceKind::secret().gvk_key(), "v1/Secret");
        assert_eq!(ResourceKind::daemon_set().gvk_key(), "apps/v1/DaemonSet");
        assert_eq!(ResourceKind::daemon_set().api_version(), "apps/v1");
    }

    #[test]
    fn uid_round_trip() {
        let s = "6f0c1a1e-4c53-4b7e-9a42-2d7b1f1c0a01";
        assert_eq!(format_uid(&parse_uid(s).unwrap()), s);
        assert!(parse_uid("not-a-uid").is_err());
    }
}

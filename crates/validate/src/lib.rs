//! Convergence harness validation.
//!
//! `validate_conditions` is a single-shot comparison of the status condition set.
//! `DeploymentValidator` is the seam for "is the driver deployed as desired";
//! `ChildSetValidator` is the bundled implementation that inspects the objects the
//! operator renders for one deployment.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use conv_core::{
    ApiError, ChildRole, ConditionStatus, ConditionType, DeploymentSpec, DriverLayout, HarnessError, HarnessResult,
    ManagedResourceRef, ManagedResourceSnapshot, ObjectRef, Phase, ResourceKind,
};
use conv_kubehub::{snapshot_of, ObjectClient};
use conv_poll::{eventually, PollConfig, PollError, Verdict};
use kube::core::DynamicObject;
use metrics::histogram;
use serde_json::Value as Json;
use tracing::{debug, info};

pub mod workload;

/// Compare the observed condition set against `expected`: same types, same statuses.
pub fn validate_conditions(
    snapshot: &ManagedResourceSnapshot,
    expected: &BTreeMap<ConditionType, ConditionStatus>,
) -> HarnessResult<()> {
    let observed = &snapshot.status.conditions;
    let mut problems = Vec::new();
    let mut seen = BTreeSet::new();
    for c in observed {
        if !seen.insert(c.condition_type.clone()) {
            problems.push(format!("duplicate condition {}", c.condition_type));
        }
    }
    if observed.len() != expected.len() {
        problems.push(format!("expected {} condition(s), got {}", expected.len(), observed.len()));
    }
    for c in observed {
        match expected.get(&c.condition_type) {
            None => problems.push(format!("unexpected condition {}={}", c.condition_type, c.status)),
            Some(want) if *want != c.status => {
                problems.push(format!("{}: expected {}, got {}", c.condition_type, want, c.status))
            }
            Some(_) => {}
        }
    }
    for t in expected.keys() {
        if !seen.contains(t) {
            problems.push(format!("missing condition {}", t));
        }
    }
    if problems.is_empty() {
        debug!(name = %snapshot.reference, count = observed.len(), "conditions match");
        Ok(())
    } else {
        Err(HarnessError::ConditionMismatch { name: snapshot.reference.to_string(), detail: problems.join("; ") })
    }
}

/// Why a driver deployment does not (yet) look as desired.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationFailure {
    #[error("{name}: phase {actual}, want Running{}", reason_suffix(.reason))]
    Phase { name: String, actual: Phase, reason: Option<String> },
    #[error("{0} does not exist")]
    Missing(ObjectRef),
    #[error("{object}: container {container} runs {actual:?}, want {expected}")]
    Image { object: ObjectRef, container: String, expected: String, actual: Option<String> },
    #[error("{object}: {field} is {actual}, want {expected}")]
    Field { object: ObjectRef, field: String, expected: String, actual: String },
    #[error("{object}: node selector {actual:?} does not include {expected:?}")]
    NodeSelector { object: ObjectRef, expected: BTreeMap<String, String>, actual: BTreeMap<String, String> },
    #[error("{object} was modified (revision {from} -> {to})")]
    Drift { object: ObjectRef, from: String, to: String },
    #[error("{0}")]
    Api(ApiError),
    #[error("decoding {name}: {message}")]
    Decode { name: String, message: String },
}

fn reason_suffix(reason: &Option<String>) -> String {
    reason.as_deref().map(|r| format!(" (reason: {})", r)).unwrap_or_default()
}

/// What a validation run checks against.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationRequest {
    /// `major.minor` of the API server, when known.
    pub cluster_version: Option<String>,
    /// Namespace the operator renders namespaced children into.
    pub namespace: String,
    pub resource: ManagedResourceRef,
    pub desired: DeploymentSpec,
    /// Children must not have been modified since the operator created them.
    pub initial_creation: bool,
    /// Phase `Failed` is pending instead of final, for callers that expect the
    /// operator to recover from it.
    pub tolerate_failed_phase: bool,
}

impl ValidationRequest {
    pub fn new(namespace: &str, resource: ManagedResourceRef, desired: DeploymentSpec) -> Self {
        Self {
            cluster_version: None,
            namespace: namespace.to_string(),
            resource,
            desired,
            initial_creation: false,
            tolerate_failed_phase: false,
        }
    }

    pub fn tolerating_failed_phase(mut self) -> Self {
        self.tolerate_failed_phase = true;
        self
    }

    pub fn layout(&self) -> DriverLayout { DriverLayout::new(&self.namespace) }
}

/// Last seen revision per child object; reports any change as drift.
#[derive(Debug, Clone, Default)]
pub struct RevisionTracker {
    seen: BTreeMap<String, String>,
}

impl RevisionTracker {
    pub fn new() -> Self { Self::default() }

    /// Record `revision` for `obj`. Returns the previous revision if it differs.
    pub fn observe(&mut self, obj: &ObjectRef, revision: &str) -> Option<String> {
        match self.seen.insert(obj.to_string(), revision.to_string()) {
            Some(prev) if prev != revision => Some(prev),
            _ => None,
        }
    }

    pub fn len(&self) -> usize { self.seen.len() }
    pub fn is_empty(&self) -> bool { self.seen.is_empty() }
}

/// Revision token that only moves when someone other than the workload controllers
/// changes the object: generation for workloads (status writes do not bump it),
/// resourceVersion for everything else.
pub fn revision_token(kind: &ResourceKind, obj: &DynamicObject) -> String {
    if workload::is_workload(kind) {
        if let Some(g) = obj.metadata.generation {
            return format!("g{}", g);
        }
    }
    format!("rv{}", obj.metadata.resource_version.as_deref().unwrap_or(""))
}

#[async_trait]
pub trait DeploymentValidator: Send + Sync {
    async fn check(
        &self,
        req: &ValidationRequest,
        revisions: Option<&mut RevisionTracker>,
    ) -> Result<(), Verdict<ValidationFailure>>;
}

/// Poll `validator` until it passes. A final failure aborts the wait.
pub async fn validate_eventually<V: DeploymentValidator + ?Sized>(
    validator: &V,
    req: &ValidationRequest,
    cfg: PollConfig,
) -> Result<(), PollError<ValidationFailure>> {
    let t0 = std::time::Instant::now();
    let what = format!("driver deployment {}", req.resource);
    eventually(&what, cfg, move || validator.check(req, None)).await?;
    histogram!("convergence_seconds", t0.elapsed().as_secs_f64());
    info!(name = %req.resource, took_ms = %t0.elapsed().as_millis(), "driver deployment validated");
    Ok(())
}

/// Validator over the children the operator renders, read through an `ObjectClient`.
pub struct ChildSetValidator<C> {
    client: C,
    resource_kind: ResourceKind,
}

impl<C: ObjectClient> ChildSetValidator<C> {
    /// `resource_kind` is the kind of the managed resource (the driver deployment CR).
    pub fn new(client: C, resource_kind: ResourceKind) -> Self {
        Self { client, resource_kind }
    }

    pub fn client(&self) -> &C { &self.client }

    async fn fetch(&self, obj: &ObjectRef) -> Result<DynamicObject, Verdict<ValidationFailure>> {
        match self.client.get(obj).await {
            Ok(o) => Ok(o),
            Err(e) if e.is_not_found() => Err(Verdict::Pending(ValidationFailure::Missing(obj.clone()))),
            Err(e) => Err(Verdict::Pending(ValidationFailure::Api(e))),
        }
    }

    fn check_driver_container(
        &self,
        req: &ValidationRequest,
        obj_ref: &ObjectRef,
        obj: &DynamicObject,
        role: ChildRole,
    ) -> Result<(), ValidationFailure> {
        let layout = req.layout();
        let container = workload::container(obj, &layout.driver_container);
        if let Some(want) = req.desired.image.as_deref() {
            let actual = container.and_then(|c| c.get("image")).and_then(Json::as_str);
            if actual != Some(want) {
                return Err(ValidationFailure::Image {
                    object: obj_ref.clone(),
                    container: layout.driver_container.clone(),
                    expected: want.to_string(),
                    actual: actual.map(str::to_string),
                });
            }
        }
        if let Some(want) = req.desired.pull_policy.as_deref() {
            let actual = container.and_then(|c| c.get("imagePullPolicy")).and_then(Json::as_str).unwrap_or("");
            if actual != want {
                return Err(ValidationFailure::Field {
                    object: obj_ref.clone(),
                    field: "imagePullPolicy".into(),
                    expected: want.to_string(),
                    actual: actual.to_string(),
                });
            }
        }
        let desired_resources = match role {
            ChildRole::ControllerDriver => req.desired.controller_driver_resources.as_ref(),
            _ => req.desired.node_driver_resources.as_ref(),
        };
        if let Some(want) = desired_resources {
            let want = serde_json::to_value(want).unwrap_or(Json::Null);
            let actual = container.and_then(|c| c.get("resources")).cloned().unwrap_or(Json::Null);
            if !workload::resources_match(&want, &actual) {
                return Err(ValidationFailure::Field {
                    object: obj_ref.clone(),
                    field: "resources".into(),
                    expected: want.to_string(),
                    actual: actual.to_string(),
                });
            }
        }
        Ok(())
    }

    fn check_node_selector(
        &self,
        req: &ValidationRequest,
        obj_ref: &ObjectRef,
        obj: &DynamicObject,
    ) -> Result<(), ValidationFailure> {
        let Some(want) = req.desired.node_selector.as_ref() else { return Ok(()) };
        let actual = workload::node_selector(obj);
        if want.iter().all(|(k, v)| actual.get(k) == Some(v)) {
            Ok(())
        } else {
            Err(ValidationFailure::NodeSelector { object: obj_ref.clone(), expected: want.clone(), actual })
        }
    }
}

/// Kind of a child as served by the cluster the request targets.
pub fn child_kind(req: &ValidationRequest, role: ChildRole) -> ResourceKind {
    let kind = role.kind();
    if role == ChildRole::CsiDriver && csi_driver_is_beta(req.cluster_version.as_deref()) {
        return kind.with_version("v1beta1");
    }
    kind
}

/// Reference of one child of the requested deployment.
pub fn child_ref(req: &ValidationRequest, role: ChildRole) -> ObjectRef {
    let layout = req.layout();
    ObjectRef::new(child_kind(req, role), layout.child_name(&req.resource, role), Some(&layout.namespace))
}

/// CSIDriver moved to storage.k8s.io/v1 in Kubernetes 1.18.
fn csi_driver_is_beta(cluster_version: Option<&str>) -> bool {
    let Some(v) = cluster_version else { return false };
    let mut parts = v.trim_start_matches('v').split('.');
    let major = parts.next().and_then(|s| s.parse::<u32>().ok());
    let minor = parts.next().and_then(|s| s.trim_end_matches('+').parse::<u32>().ok());
    matches!((major, minor), (Some(1), Some(m)) if m < 18)
}

#[async_trait]
impl<C: ObjectClient> DeploymentValidator for ChildSetValidator<C> {
    async fn check(
        &self,
        req: &ValidationRequest,
        mut revisions: Option<&mut RevisionTracker>,
    ) -> Result<(), Verdict<ValidationFailure>> {
        let cr = self.fetch(&req.resource.object_ref(&self.resource_kind)).await?;
        let snap = snapshot_of(&cr).map_err(|e| {
            Verdict::Pending(ValidationFailure::Decode { name: req.resource.to_string(), message: format!("{:#}", e) })
        })?;
        match snap.status.phase {
            Phase::Running => {}
            Phase::Failed if !req.tolerate_failed_phase => {
                return Err(Verdict::Final(ValidationFailure::Phase {
                    name: req.resource.to_string(),
                    actual: Phase::Failed,
                    reason: snap.status.reason.clone(),
                }))
            }
            other => {
                return Err(Verdict::Pending(ValidationFailure::Phase {
                    name: req.resource.to_string(),
                    actual: other,
                    reason: snap.status.reason.clone(),
                }))
            }
        }

        let mut drift = None;
        for role in ChildRole::ALL {
            let obj_ref = child_ref(req, role);
            let kind = obj_ref.kind.clone();
            let obj = self.fetch(&obj_ref).await?;
            match role {
                ChildRole::ControllerDriver | ChildRole::NodeDriver => {
                    self.check_driver_container(req, &obj_ref, &obj, role).map_err(Verdict::Pending)?;
                }
                _ => {}
            }
            if role == ChildRole::NodeDriver {
                self.check_node_selector(req, &obj_ref, &obj).map_err(Verdict::Pending)?;
            }
            let token = revision_token(&kind, &obj);
            if req.initial_creation && workload::is_workload(&kind) && token != "g1" {
                return Err(Verdict::Pending(ValidationFailure::Drift {
                    object: obj_ref,
                    from: "g1".into(),
                    to: token,
                }));
            }
            if let Some(tracker) = revisions.as_deref_mut() {
                if let Some(prev) = tracker.observe(&obj_ref, &token) {
                    drift.get_or_insert(ValidationFailure::Drift { object: obj_ref.clone(), from: prev, to: token });
                }
            }
        }
        if let Some(d) = drift {
            return Err(Verdict::Pending(d));
        }
        debug!(name = %req.resource, "driver deployment as desired");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conv_core::{Condition, ResourceStatus};
    use conv_kubehub::{new_object, MemoryCluster};
    use serde_json::json;
    use std::sync::Arc;

    fn snap(conds: &[(&str, &str)]) -> ManagedResourceSnapshot {
        ManagedResourceSnapshot {
            reference: ManagedResourceRef::cluster_scoped("d"),
            spec: DeploymentSpec::default(),
            status: ResourceStatus {
                phase: Phase::Running,
                conditions: conds
                    .iter()
                    .map(|(t, s)| Condition {
                        condition_type: t.to_string().into(),
                        status: s.to_string().into(),
                        reason: None,
                        last_update_time: None,
                    })
                    .collect(),
                ..Default::default()
            },
            uid: [0u8; 16],
            resource_version: "1".into(),
        }
    }

    fn expect(pairs: &[(ConditionType, ConditionStatus)]) -> BTreeMap<ConditionType, ConditionStatus> {
        pairs.iter().cloned().collect()
    }

    fn default_expected() -> BTreeMap<ConditionType, ConditionStatus> {
        expect(&[(ConditionType::CertsReady, ConditionStatus::True), (ConditionType::DriverDeployed, ConditionStatus::True)])
    }

    #[test]
    fn exact_condition_set_passes() {
        validate_conditions(&snap(&[("CertsReady", "True"), ("DriverDeployed", "True")]), &default_expected()).unwrap();
    }

    #[test]
    fn extra_condition_fails() {
        let err = validate_conditions(
            &snap(&[("CertsReady", "True"), ("CertsVerified", "True"), ("DriverDeployed", "True")]),
            &default_expected(),
        )
        .unwrap_err()
        .to_string();
        assert!(err.contains("unexpected condition CertsVerified"), "err={}", err);
    }

    #[test]
    fn missing_condition_fails() {
        let err = validate_conditions(&snap(&[("CertsReady", "True")]), &default_expected()).unwrap_err().to_string();
        assert!(err.contains("missing condition DriverDeployed"), "err={}", err);
    }

    #[test]
    fn status_mismatch_fails() {
        let err = validate_conditions(&snap(&[("CertsReady", "True"), ("DriverDeployed", "False")]), &default_expected())
            .unwrap_err()
            .to_string();
        assert!(err.contains("DriverDeployed: expected True, got False"), "err={}", err);
    }

    #[test]
    fn duplicate_types_fail_even_when_lengths_match() {
        let err = validate_conditions(&snap(&[("CertsReady", "True"), ("CertsReady", "True")]), &default_expected())
            .unwrap_err()
            .to_string();
        assert!(err.contains("duplicate condition CertsReady"), "err={}", err);
    }

    #[test]
    fn revision_tracker_reports_changes_only() {
        let mut t = RevisionTracker::new();
        let r = ObjectRef::new(ResourceKind::secret(), "s", Some("ns"));
        assert_eq!(t.observe(&r, "rv1"), None);
        assert_eq!(t.observe(&r, "rv1"), None);
        assert_eq!(t.observe(&r, "rv2"), Some("rv1".to_string()));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn csi_driver_version_follows_cluster_version() {
        assert!(csi_driver_is_beta(Some("1.17")));
        assert!(csi_driver_is_beta(Some("v1.16+")));
        assert!(!csi_driver_is_beta(Some("1.18")));
        assert!(!csi_driver_is_beta(None));
    }

    const CR_GROUP: &str = "pmem-csi.intel.com";

    fn cr_kind() -> ResourceKind { ResourceKind::new(CR_GROUP, "v1beta1", "Deployment", false) }

    async fn seed(cluster: &MemoryCluster, name: &str, phase: &str, image: &str) {
        let layout = DriverLayout::new("ns");
        let r = ManagedResourceRef::cluster_scoped(name);
        cluster
            .create(&cr_kind(), &new_object(&cr_kind(), name, None, json!({"spec": {"image": image}, "status": {"phase": phase}})))
            .await
            .unwrap();
        for (role, obj) in layout.children(&r) {
            let data = match role {
                ChildRole::ControllerDriver | ChildRole::NodeDriver => json!({"spec": {"template": {"spec": {
                    "containers": [{"name": "pmem-driver", "image": image}]
                }}}}),
                _ => json!({}),
            };
            cluster.create(&obj.kind, &new_object(&obj.kind, &obj.name, obj.namespace.as_deref(), data)).await.unwrap();
        }
    }

    fn request(name: &str, image: &str) -> ValidationRequest {
        ValidationRequest::new("ns", ManagedResourceRef::cluster_scoped(name), DeploymentSpec::with_image(image))
    }

    #[tokio::test]
    async fn child_set_validator_passes_on_complete_deployment() {
        let cluster = MemoryCluster::new();
        seed(&cluster, "d.x", "Running", "img:1").await;
        let v = ChildSetValidator::new(cluster.clone(), cr_kind());
        v.check(&request("d.x", "img:1"), None).await.unwrap();
    }

    #[tokio::test]
    async fn failed_phase_is_final_unless_tolerated() {
        let cluster = MemoryCluster::new();
        seed(&cluster, "d", "Failed", "img:1").await;
        let v = ChildSetValidator::new(cluster.clone(), cr_kind());
        assert!(v.check(&request("d", "img:1"), None).await.unwrap_err().is_final());
        let lenient = request("d", "img:1").tolerating_failed_phase();
        assert!(!v.check(&lenient, None).await.unwrap_err().is_final());
    }

    #[tokio::test]
    async fn missing_child_and_wrong_image_are_pending() {
        let cluster = MemoryCluster::new();
        seed(&cluster, "d", "Running", "img:1").await;
        let v = ChildSetValidator::new(cluster.clone(), cr_kind());
        let err = v.check(&request("d", "img:2"), None).await.unwrap_err();
        assert!(matches!(err, Verdict::Pending(ValidationFailure::Image { .. })), "{:?}", err);
        let secret = DriverLayout::new("ns").child(&ManagedResourceRef::cluster_scoped("d"), ChildRole::NodeSecret);
        cluster.delete(&secret).await.unwrap();
        let err = v.check(&request("d", "img:1"), None).await.unwrap_err();
        assert_eq!(err, Verdict::Pending(ValidationFailure::Missing(secret)));
    }

    #[tokio::test]
    async fn tracker_flags_modified_children() {
        let cluster = MemoryCluster::new();
        seed(&cluster, "d", "Running", "img:1").await;
        let v = ChildSetValidator::new(cluster.clone(), cr_kind());
        let mut tracker = RevisionTracker::new();
        v.check(&request("d", "img:1"), Some(&mut tracker)).await.unwrap();
        assert_eq!(tracker.len(), ChildRole::ALL.len());
        let svc = DriverLayout::new("ns").child(&ManagedResourceRef::cluster_scoped("d"), ChildRole::MetricsService);
        let mut obj = cluster.get(&svc).await.unwrap();
        obj.data["spec"] = json!({"ports": [{"port": 1111}]});
        cluster.update(&svc.kind, &obj).await.unwrap();
        let err = v.check(&request("d", "img:1"), Some(&mut tracker)).await.unwrap_err();
        assert!(matches!(err, Verdict::Pending(ValidationFailure::Drift { .. })), "{:?}", err);
    }

    #[tokio::test(start_paused = true)]
    async fn validate_eventually_aborts_on_failed_phase() {
        let cluster = MemoryCluster::new();
        seed(&cluster, "d", "Failed", "img:1").await;
        let v: Arc<dyn DeploymentValidator> = Arc::new(ChildSetValidator::new(cluster.clone(), cr_kind()));
        let err = validate_eventually(v.as_ref(), &request("d", "img:1"), PollConfig::short()).await.unwrap_err();
        assert!(err.is_terminal());
    }
}

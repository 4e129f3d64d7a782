//! A miniature cluster for scenario tests: the in-memory store plus a background task
//! that plays operator, kubelet, volume provisioner and garbage collector.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use conv_core::{
    reasons, ChildRole, DeploymentSpec, DeviceMode, DriverLayout, ManagedResourceRef, ObjectRef,
    ResourceKind, ResourceRequirements,
};
use conv_kubehub::{labels_of, new_object, snapshot_of, uid_of, MemoryCluster, ObjectClient};
use conv_poll::PollConfig;
use conv_scenario::config::{deployment_kind, Timeouts, CRD_GROUP};
use conv_scenario::{conversion, HarnessConfig, Orchestrator, ScaledDeploymentProcess};
use conv_validate::ChildSetValidator;
use kube::core::DynamicObject;
use serde_json::{json, Value as Json};
use tokio::task::JoinHandle;

pub const NS: &str = "pmem-csi";
pub const OPERATOR: &str = "pmem-csi-operator";
pub const OPERATOR_SELECTOR: &str = "app=pmem-csi-operator";
pub const OPERATOR_IMAGE: &str = "intel/pmem-csi-operator:canary";

const TICK: Duration = Duration::from_millis(10);
const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
const MODE_LABEL: &str = "pmem-csi.intel.com/mode";

pub fn config() -> HarnessConfig {
    HarnessConfig {
        namespace: NS.into(),
        operator_name: OPERATOR.into(),
        operator_selector: OPERATOR_SELECTOR.into(),
        case_deadline: Duration::from_secs(60),
        timeouts: Timeouts {
            short: PollConfig::new(Duration::from_secs(5), TICK),
            long: PollConfig::new(Duration::from_secs(10), TICK),
            steady: PollConfig::new(Duration::from_millis(300), Duration::from_millis(50)),
        },
        ..HarnessConfig::default()
    }
}

pub type MemOrchestrator = Orchestrator<Arc<MemoryCluster>>;

pub struct Harness {
    pub cluster: Arc<MemoryCluster>,
    pub orchestrator: MemOrchestrator,
    background: JoinHandle<()>,
}

impl Drop for Harness {
    fn drop(&mut self) { self.background.abort(); }
}

pub async fn harness() -> Harness { harness_with(config()).await }

pub async fn harness_with(cfg: HarnessConfig) -> Harness {
    let cluster = MemoryCluster::new();
    cluster.register_conversion(CRD_GROUP, "Deployment", conversion::converter());
    let dep = ResourceKind::deployment();
    cluster
        .create(&dep, &new_object(&dep, OPERATOR, Some(NS), json!({"spec": {"replicas": 1}})))
        .await
        .unwrap();
    let background = tokio::spawn(FakeControlPlane::new(cluster.clone()).run());

    let validator = Arc::new(ChildSetValidator::new(cluster.clone(), deployment_kind()));
    let process =
        Arc::new(ScaledDeploymentProcess::new(cluster.clone(), NS, OPERATOR, OPERATOR_SELECTOR, cfg.timeouts.long));
    let orchestrator = Orchestrator::new(cluster.clone(), cluster.clone(), validator, process, cfg);
    Harness { cluster, orchestrator, background }
}

fn operator_pod_ref() -> ObjectRef { ObjectRef::new(ResourceKind::pod(), format!("{}-0", OPERATOR), Some(NS)) }

struct FakeControlPlane {
    cluster: Arc<MemoryCluster>,
    layout: DriverLayout,
    /// uid -> last phase written, per managed resource.
    phases: BTreeMap<String, String>,
    /// Names of managed resources whose children exist.
    known: BTreeSet<String>,
}

impl FakeControlPlane {
    fn new(cluster: Arc<MemoryCluster>) -> Self {
        Self { cluster, layout: DriverLayout::new(NS), phases: BTreeMap::new(), known: BTreeSet::new() }
    }

    async fn run(mut self) {
        loop {
            self.tick().await;
            tokio::time::sleep(TICK).await;
        }
    }

    async fn tick(&mut self) {
        self.kubelet().await;
        let operator_up = self.operator_process().await;
        let crs = self.cluster.list(&deployment_kind(), None, None).await.unwrap_or_default();
        self.collect_garbage(&crs).await;
        if operator_up {
            for cr in &crs {
                self.reconcile(cr).await;
            }
        }
        self.provisioner(&crs).await;
    }

    /// Pods without a status start running and become ready.
    async fn kubelet(&self) {
        let pod = ResourceKind::pod();
        for mut p in self.cluster.list(&pod, None, None).await.unwrap_or_default() {
            if p.data.get("status").is_some() {
                continue;
            }
            p.data["status"] = json!({"phase": "Running", "conditions": [{"type": "Ready", "status": "True"}]});
            let _ = self.cluster.update(&pod, &p).await;
        }
    }

    /// Keeps an operator pod while the operator Deployment has replicas. Returns whether
    /// the operator is up.
    async fn operator_process(&self) -> bool {
        let dep = ObjectRef::new(ResourceKind::deployment(), OPERATOR, Some(NS));
        let replicas = match self.cluster.get(&dep).await {
            Ok(d) => conv_scenario::process::replicas_of(&d).unwrap_or(0),
            Err(_) => 0,
        };
        let pod = operator_pod_ref();
        let exists = self.cluster.contains(&pod);
        if replicas == 0 {
            if exists {
                let _ = self.cluster.delete(&pod).await;
            }
            return false;
        }
        if !exists {
            let mut p = new_object(
                &pod.kind,
                &pod.name,
                Some(NS),
                json!({"spec": {"containers": [{"name": "pmem-csi-operator", "image": OPERATOR_IMAGE}]}}),
            );
            p.metadata.labels = Some([("app".to_string(), OPERATOR.to_string())].into_iter().collect());
            let _ = self.cluster.create(&pod.kind, &p).await;
            return false;
        }
        true
    }

    async fn collect_garbage(&mut self, crs: &[DynamicObject]) {
        let live: BTreeSet<String> = crs.iter().filter_map(|c| c.metadata.name.clone()).collect();
        let gone: Vec<String> = self.known.difference(&live).cloned().collect();
        for name in gone {
            let resource = ManagedResourceRef::cluster_scoped(name.as_str());
            for (_, child) in self.layout.children(&resource) {
                let _ = self.cluster.delete(&child).await;
            }
            let selector = self.layout.node_pod_selector(&resource);
            for p in self.cluster.list(&ResourceKind::pod(), Some(NS), Some(&selector)).await.unwrap_or_default() {
                if let Some(n) = p.metadata.name.as_deref() {
                    let _ = self.cluster.delete(&ObjectRef::new(ResourceKind::pod(), n, Some(NS))).await;
                }
            }
            self.known.remove(&name);
        }
    }

    fn emit(&self, cr: &DynamicObject, reason: &str) {
        if let Some(uid) = uid_of(cr) {
            self.cluster.emit(uid, reason, OPERATOR);
        }
    }

    async fn write_status(&mut self, cr: &DynamicObject, status: Json) {
        let uid = cr.metadata.uid.clone().unwrap_or_default();
        if cr.data.get("status") == Some(&status) {
            return;
        }
        let mut updated = cr.clone();
        updated.data["status"] = status.clone();
        if self.cluster.update(&deployment_kind(), &updated).await.is_err() {
            return;
        }
        let phase = status["phase"].as_str().unwrap_or("").to_string();
        if self.phases.get(&uid) != Some(&phase) {
            match phase.as_str() {
                "Running" => self.emit(cr, reasons::RUNNING),
                "Failed" => self.emit(cr, reasons::FAILED),
                _ => {}
            }
            self.phases.insert(uid, phase);
        }
    }

    async fn reconcile(&mut self, cr: &DynamicObject) {
        let Ok(snap) = snapshot_of(cr) else { return };
        let uid = cr.metadata.uid.clone().unwrap_or_default();
        if !self.phases.contains_key(&uid) {
            self.phases.insert(uid.clone(), String::new());
            self.emit(cr, reasons::CREATED);
        }
        let name = snap.reference.name.clone();
        let resource = ManagedResourceRef::cluster_scoped(name.as_str());
        self.known.insert(name.clone());

        let secret = self.layout.child(&resource, ChildRole::RegistrySecret);
        if let Ok(existing) = self.cluster.get(&secret).await {
            if labels_of(&existing).get(MANAGED_BY).map(String::as_str) != Some(OPERATOR) {
                let status = json!({"phase": "Failed", "reason": format!("secret {} exists and is not ours", secret.name)});
                self.write_status(cr, status).await;
                return;
            }
        }

        let operator_image = OPERATOR_IMAGE.to_string();
        let spec = &snap.spec;
        for role in ChildRole::ALL {
            let child = self.layout.child(&resource, role);
            let body = render(role, spec, &resource, &self.layout, &operator_image);
            match self.cluster.get(&child).await {
                Ok(mut current) => {
                    if current.data != body {
                        current.data = body;
                        let _ = self.cluster.update(&child.kind, &current).await;
                    }
                }
                Err(e) if e.is_not_found() => {
                    let mut obj = new_object(&child.kind, &child.name, child.namespace.as_deref(), body);
                    obj.metadata.labels = Some(
                        [
                            (MANAGED_BY.to_string(), OPERATOR.to_string()),
                            (self.layout.instance_label.clone(), name.clone()),
                        ]
                        .into_iter()
                        .collect(),
                    );
                    let _ = self.cluster.create(&child.kind, &obj).await;
                }
                Err(_) => return,
            }
        }
        self.node_pods(&resource, spec.device_mode.unwrap_or(DeviceMode::Lvm)).await;

        let mut conditions = vec![
            json!({"type": "CertsReady", "status": "True"}),
            json!({"type": "DriverDeployed", "status": "True"}),
        ];
        if spec.ca_cert.is_some() {
            conditions.push(json!({"type": "CertsVerified", "status": "True"}));
        }
        self.write_status(cr, json!({"phase": "Running", "conditions": conditions})).await;
    }

    /// One node pod per deployment, replaced when the device mode changes.
    async fn node_pods(&self, resource: &ManagedResourceRef, mode: DeviceMode) {
        let pod = ResourceKind::pod();
        let selector = self.layout.node_pod_selector(resource);
        let current = self.cluster.list(&pod, Some(NS), Some(&selector)).await.unwrap_or_default();
        let mut have = false;
        for p in &current {
            let Some(n) = p.metadata.name.as_deref() else { continue };
            if labels_of(p).get(MODE_LABEL) == Some(&mode.to_string()) {
                have = true;
            } else {
                let _ = self.cluster.delete(&ObjectRef::new(pod.clone(), n, Some(NS))).await;
            }
        }
        if have {
            return;
        }
        let name = format!("{}-node-{}", DriverLayout::hyphened(&resource.name), mode);
        let mut p = new_object(
            &pod,
            &name,
            Some(NS),
            json!({"spec": {"containers": [{"name": self.layout.driver_container, "image": "driver"}]}}),
        );
        p.metadata.labels = Some(
            [
                (self.layout.component_label.clone(), "pmem-csi-node".to_string()),
                (self.layout.instance_label.clone(), resource.name.clone()),
                (MODE_LABEL.to_string(), mode.to_string()),
            ]
            .into_iter()
            .collect(),
        );
        let _ = self.cluster.create(&pod, &p).await;
    }

    /// Binds pending claims of classes served by a running driver deployment and
    /// reclaims volumes whose claim is gone.
    async fn provisioner(&self, crs: &[DynamicObject]) {
        let running: BTreeSet<String> = crs
            .iter()
            .filter(|c| c.data.get("status").and_then(|s| s.get("phase")).and_then(Json::as_str) == Some("Running"))
            .filter_map(|c| c.metadata.name.clone())
            .collect();
        let pvc_kind = ResourceKind::persistent_volume_claim();
        let pv_kind = ResourceKind::persistent_volume();
        for mut pvc in self.cluster.list(&pvc_kind, None, None).await.unwrap_or_default() {
            if pvc.data["spec"].get("volumeName").is_some() {
                continue;
            }
            let Some(class) = pvc.data["spec"]["storageClassName"].as_str().map(str::to_string) else { continue };
            let sc = ObjectRef::new(ResourceKind::storage_class(), class, None);
            let Ok(sc) = self.cluster.get(&sc).await else { continue };
            let provisioner = sc.data["provisioner"].as_str().unwrap_or("");
            if !running.contains(provisioner) {
                continue;
            }
            let volume = format!("pvc-{}", pvc.metadata.uid.clone().unwrap_or_default());
            let claim_ns = pvc.metadata.namespace.clone().unwrap_or_default();
            let claim_name = pvc.metadata.name.clone().unwrap_or_default();
            let pv = new_object(
                &pv_kind,
                &volume,
                None,
                json!({
                    "spec": {"claimRef": {"namespace": claim_ns, "name": claim_name}, "csi": {"driver": provisioner}},
                    "status": {"phase": "Bound"}
                }),
            );
            if self.cluster.create(&pv_kind, &pv).await.is_err() {
                continue;
            }
            pvc.data["spec"]["volumeName"] = json!(volume);
            pvc.data["status"] = json!({"phase": "Bound"});
            let _ = self.cluster.update(&pvc_kind, &pvc).await;
        }
        for pv in self.cluster.list(&pv_kind, None, None).await.unwrap_or_default() {
            let claim = &pv.data["spec"]["claimRef"];
            let (Some(ns), Some(name)) = (claim["namespace"].as_str(), claim["name"].as_str()) else { continue };
            if !self.cluster.contains(&ObjectRef::new(pvc_kind.clone(), name, Some(ns))) {
                if let Some(v) = pv.metadata.name.as_deref() {
                    let _ = self.cluster.delete(&ObjectRef::new(pv_kind.clone(), v, None)).await;
                }
            }
        }
    }
}

fn resources(r: Option<&ResourceRequirements>) -> Json {
    r.and_then(|r| serde_json::to_value(r).ok()).unwrap_or_else(|| json!({}))
}

/// What the operator renders for one child.
fn render(role: ChildRole, spec: &DeploymentSpec, resource: &ManagedResourceRef, layout: &DriverLayout, operator_image: &str) -> Json {
    let image = spec.image.clone().unwrap_or_else(|| operator_image.to_string());
    let pull = spec.pull_policy.clone().unwrap_or_else(|| "IfNotPresent".to_string());
    let mode = spec.device_mode.unwrap_or(DeviceMode::Lvm);
    let driver = |res: Option<&ResourceRequirements>, mode_arg: &str| {
        json!({
            "name": layout.driver_container,
            "image": image,
            "imagePullPolicy": pull,
            "command": ["/usr/local/bin/pmem-csi-driver", format!("-v={}", spec.log_level.unwrap_or(3)), mode_arg],
            "resources": resources(res),
        })
    };
    let child = |r: ChildRole| layout.child_name(resource, r);
    let pod_labels = |component: &str| json!({ layout.component_label.clone(): component, layout.instance_label.clone(): resource.name });
    let generated = "Z2VuZXJhdGVk";
    let tls = |cert: &Option<String>, key: &Option<String>| {
        json!({
            "type": "kubernetes.io/tls",
            "data": {
                "ca.crt": spec.ca_cert.clone().unwrap_or_else(|| generated.to_string()),
                "tls.crt": cert.clone().unwrap_or_else(|| generated.to_string()),
                "tls.key": key.clone().unwrap_or_else(|| generated.to_string()),
            }
        })
    };
    let service = |component: &str, port: u16| {
        json!({"spec": {"selector": pod_labels(component), "ports": [{"port": port, "targetPort": port}]}})
    };
    match role {
        ChildRole::RegistrySecret => tls(&spec.registry_cert, &spec.registry_key),
        ChildRole::NodeSecret => tls(&spec.node_controller_cert, &spec.node_controller_key),
        ChildRole::ServiceAccount => json!({}),
        ChildRole::ControllerService => service("pmem-csi-controller", 10000),
        ChildRole::MetricsService => service("pmem-csi-controller", 10010),
        ChildRole::ProvisionerRole => json!({
            "rules": [{"apiGroups": [""], "resources": ["endpoints"], "verbs": ["get", "watch", "list", "delete", "update", "create"]}]
        }),
        ChildRole::ProvisionerRoleBinding => json!({
            "subjects": [{"kind": "ServiceAccount", "name": child(ChildRole::ServiceAccount), "namespace": layout.namespace}],
            "roleRef": {"kind": "Role", "name": child(ChildRole::ProvisionerRole), "apiGroup": "rbac.authorization.k8s.io"}
        }),
        ChildRole::ProvisionerClusterRole => json!({
            "rules": [{"apiGroups": [""], "resources": ["persistentvolumes"], "verbs": ["get", "list", "watch", "create", "delete"]}]
        }),
        ChildRole::ProvisionerClusterRoleBinding => json!({
            "subjects": [{"kind": "ServiceAccount", "name": child(ChildRole::ServiceAccount), "namespace": layout.namespace}],
            "roleRef": {"kind": "ClusterRole", "name": child(ChildRole::ProvisionerClusterRole), "apiGroup": "rbac.authorization.k8s.io"}
        }),
        ChildRole::CsiDriver => json!({
            "spec": {"attachRequired": false, "podInfoOnMount": true, "volumeLifecycleModes": ["Persistent", "Ephemeral"]}
        }),
        ChildRole::ControllerDriver => json!({
            "spec": {
                "replicas": 1,
                "selector": {"matchLabels": pod_labels("pmem-csi-controller")},
                "template": {
                    "metadata": {"labels": pod_labels("pmem-csi-controller")},
                    "spec": {
                        "serviceAccountName": child(ChildRole::ServiceAccount),
                        "containers": [
                            driver(spec.controller_driver_resources.as_ref(), "-mode=controller"),
                            {
                                "name": "external-provisioner",
                                "image": spec.provisioner_image.clone().unwrap_or_else(|| "k8s.gcr.io/sig-storage/csi-provisioner".into()),
                                "resources": resources(spec.provisioner_resources.as_ref()),
                            }
                        ]
                    }
                }
            }
        }),
        ChildRole::NodeDriver => json!({
            "spec": {
                "selector": {"matchLabels": pod_labels("pmem-csi-node")},
                "template": {
                    "metadata": {"labels": pod_labels("pmem-csi-node")},
                    "spec": {
                        "nodeSelector": spec.node_selector.clone().unwrap_or_else(|| [("storage".to_string(), "pmem".to_string())].into()),
                        "containers": [
                            driver(spec.node_driver_resources.as_ref(), &format!("-deviceManager={}", mode)),
                            {
                                "name": "driver-registrar",
                                "image": spec.node_registrar_image.clone().unwrap_or_else(|| "k8s.gcr.io/sig-storage/csi-node-driver-registrar".into()),
                                "resources": resources(spec.node_registrar_resources.as_ref()),
                            }
                        ]
                    }
                }
            }
        }),
    }
}

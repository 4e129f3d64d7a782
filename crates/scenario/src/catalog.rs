//! The scenario catalog: every case as an explicit descriptor, and the body each kind
//! of descriptor runs.

use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Utc;
use conv_core::{
    reasons, ChildRole, DeploymentSpec, DeviceMode, DriverLayout, HarnessError, HarnessResult, ManagedResourceRef,
    Phase, ResourceKind, ResourceRequirements,
};
use conv_kubehub::{new_object, ObjectClient};
use conv_validate::ValidationRequest;
use kube::core::DynamicObject;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value as Json};
use tracing::info;

use crate::conversion;
use crate::fixtures::{create_eventually, Fixtures};
use crate::lifecycle::TestCase;
use crate::orchestrator::{default_conditions, verified_conditions, Orchestrator};
use crate::tls::{set_tls, TlsMaterial};
use crate::tracker::ScenarioState;

const RUNNING: [&str; 2] = [reasons::CREATED, reasons::RUNNING];

/// What happens after the device mode was switched away from `from`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AfterSwitch {
    /// Delete the volume provisioned before the switch.
    DeleteVolume,
    /// Switch back and mount the volume in an application pod.
    UseVolume,
}

impl AfterSwitch {
    pub fn label(&self) -> &'static str {
        match self {
            AfterSwitch::DeleteVolume => "delete volume",
            AfterSwitch::UseVolume => "use volume",
        }
    }
}

/// One spec field changed on a converged deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UpdateCase {
    LogLevel,
    Image,
    PullPolicy,
    NodeSelector,
    PmemPercentage,
    ProvisionerImage,
    ControllerResources,
    NodeResources,
    Tls,
}

impl UpdateCase {
    pub const ALL: [UpdateCase; 9] = [
        UpdateCase::LogLevel,
        UpdateCase::Image,
        UpdateCase::PullPolicy,
        UpdateCase::NodeSelector,
        UpdateCase::PmemPercentage,
        UpdateCase::ProvisionerImage,
        UpdateCase::ControllerResources,
        UpdateCase::NodeResources,
        UpdateCase::Tls,
    ];

    pub fn slug(&self) -> &'static str {
        match self {
            UpdateCase::LogLevel => "log-level",
            UpdateCase::Image => "image",
            UpdateCase::PullPolicy => "pull-policy",
            UpdateCase::NodeSelector => "node-selector",
            UpdateCase::PmemPercentage => "pmem-percentage",
            UpdateCase::ProvisionerImage => "provisioner-image",
            UpdateCase::ControllerResources => "controller-resources",
            UpdateCase::NodeResources => "node-resources",
            UpdateCase::Tls => "tls",
        }
    }

    /// Deployment before the update. Images are dummies so no pod ever starts.
    pub fn initial(&self, dummy_image: &str) -> DeploymentSpec {
        let mut spec = DeploymentSpec::with_image(dummy_image);
        spec.node_registrar_image = Some(dummy_image.to_string());
        spec.provisioner_image = Some(dummy_image.to_string());
        match self {
            UpdateCase::LogLevel => spec.log_level = Some(4),
            UpdateCase::PullPolicy => spec.pull_policy = Some("Never".into()),
            UpdateCase::PmemPercentage => spec.pmem_percentage = Some(50),
            UpdateCase::ControllerResources => {
                spec.controller_driver_resources = Some(ResourceRequirements::limits("100m", "50Mi"))
            }
            UpdateCase::NodeResources => spec.node_driver_resources = Some(ResourceRequirements::limits("100m", "50Mi")),
            _ => {}
        }
        spec
    }

    pub fn mutate(&self, spec: &mut DeploymentSpec, tls: Option<&TlsMaterial>) {
        match self {
            UpdateCase::LogLevel => spec.log_level = Some(spec.log_level.unwrap_or(3) + 1),
            UpdateCase::Image => spec.image = Some("still-unexisting/pmem-csi-driver".into()),
            UpdateCase::PullPolicy => spec.pull_policy = Some("Always".into()),
            UpdateCase::NodeSelector => {
                spec.node_selector = Some([("still-no-such-label".to_string(), "still-no-such-value".to_string())].into())
            }
            UpdateCase::PmemPercentage => spec.pmem_percentage = Some(spec.pmem_percentage.unwrap_or(100) / 2 + 10),
            UpdateCase::ProvisionerImage => spec.provisioner_image = Some("still-unexisting/csi-provisioner".into()),
            UpdateCase::ControllerResources => {
                spec.controller_driver_resources = Some(ResourceRequirements::limits("300m", "300Mi"))
            }
            UpdateCase::NodeResources => spec.node_driver_resources = Some(ResourceRequirements::limits("500m", "500Mi")),
            UpdateCase::Tls => {
                if let Some(m) = tls {
                    m.apply(spec)
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ScenarioKind {
    Deploy { explicit: bool },
    PrintedFields,
    DefaultImage,
    EditRunning,
    Multiple,
    DottedName,
    CustomCa,
    OperatorExit,
    Collision,
    SwitchMode { from: DeviceMode, to: DeviceMode, after: AfterSwitch },
    Update { case: UpdateCase, restart: bool },
    RecoverDeleted { role: ChildRole },
    RecoverConflict { role: ChildRole },
    Conversion { explicit: bool },
}

/// A named case and the driver deployment it creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScenarioDescriptor {
    pub name: String,
    pub resource: String,
    pub kind: ScenarioKind,
}

impl ScenarioDescriptor {
    pub fn new(name: impl Into<String>, resource: impl Into<String>, kind: ScenarioKind) -> Self {
        Self { name: name.into(), resource: resource.into(), kind }
    }

    /// Only the collision case may see its deployment fail.
    pub fn expects_failure(&self) -> bool { matches!(self.kind, ScenarioKind::Collision) }
}

impl fmt::Display for ScenarioDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{} ({})", self.name, self.resource) }
}

fn slug(label: &str) -> String { label.replace(' ', "-") }

/// Every case, in a stable order.
pub fn catalog() -> Vec<ScenarioDescriptor> {
    use ScenarioKind::*;
    let mut out = vec![
        ScenarioDescriptor::new("deployment/with defaults", "test-deployment-with-defaults", Deploy { explicit: false }),
        ScenarioDescriptor::new("deployment/with explicit values", "test-deployment-with-explicit", Deploy { explicit: true }),
        ScenarioDescriptor::new("deployment/get deployment shall list expected fields", "test-get-deployment-fields", PrintedFields),
        ScenarioDescriptor::new("deployment/driver image shall default to operator image", "test-deployment-driver-image", DefaultImage),
        ScenarioDescriptor::new("deployment/shall be able to edit running deployment", "test-deployment-update", EditRunning),
        ScenarioDescriptor::new("deployment/shall allow multiple deployments", "test-deployment", Multiple),
        ScenarioDescriptor::new("deployment/shall support dots in the name", "test.deployment.example.org", DottedName),
        ScenarioDescriptor::new(
            "deployment/shall be able to use custom CA certificates",
            "test-deployment-with-certificates",
            CustomCa,
        ),
        ScenarioDescriptor::new(
            "deployment/driver deployment shall be running even after operator exit",
            "test-deployment-operator-exit",
            OperatorExit,
        ),
        ScenarioDescriptor::new("deployment/shall recover from conflicts", "test-recover-from-conflicts", Collision),
    ];
    for (from, to) in [(DeviceMode::Lvm, DeviceMode::Direct), (DeviceMode::Direct, DeviceMode::Lvm)] {
        for after in [AfterSwitch::DeleteVolume, AfterSwitch::UseVolume] {
            let ctx = format!("{}-to-{}", from, to);
            out.push(ScenarioDescriptor::new(
                format!("switch device mode/{}/{}", ctx, after.label()),
                format!("{}-{}", ctx, slug(after.label())),
                SwitchMode { from, to, after },
            ));
        }
    }
    for case in UpdateCase::ALL {
        for restart in [false, true] {
            let when = if restart { "while stopped" } else { "while running" };
            out.push(ScenarioDescriptor::new(
                format!("updating/{}/{}", case.slug(), when),
                format!("update-{}", case.slug()),
                Update { case, restart },
            ));
        }
    }
    for role in ChildRole::ALL {
        out.push(ScenarioDescriptor::new(
            format!("recover/deleted sub-resources/{}", role.label()),
            format!("recover-{}", slug(role.label())),
            RecoverDeleted { role },
        ));
    }
    for (label, role) in [
        ("controller", ChildRole::ControllerDriver),
        ("node driver", ChildRole::NodeDriver),
        ("metrics service", ChildRole::MetricsService),
        ("controller service", ChildRole::ControllerService),
    ] {
        out.push(ScenarioDescriptor::new(
            format!("recover/conflicting update/{}", label),
            format!("recover-{}", slug(label)),
            RecoverConflict { role },
        ));
    }
    out.push(ScenarioDescriptor::new("conversion/with default values", "alpha-default-values", Conversion { explicit: false }));
    out.push(ScenarioDescriptor::new("conversion/with explicit values", "alpha-explicit-values", Conversion { explicit: true }));
    out
}

/// Cases whose name matches `filter`; all of them without one.
pub fn select(filter: Option<&Regex>) -> Vec<ScenarioDescriptor> {
    catalog().into_iter().filter(|d| filter.map_or(true, |re| re.is_match(&d.name))).collect()
}

// ---- printed columns ----

fn age(obj: &DynamicObject) -> String {
    let secs = obj
        .metadata
        .creation_timestamp
        .as_ref()
        .map(|t| (Utc::now() - t.0).num_seconds().max(0))
        .unwrap_or(0);
    if secs < 120 {
        format!("{}s", secs)
    } else {
        format!("{}m", secs / 60)
    }
}

/// The managed resource as a `kubectl get` row: name, device mode, node selector,
/// image, phase, age.
pub fn printed_row(obj: &DynamicObject) -> String {
    let spec = obj.data.get("spec");
    let text = |v: Option<&Json>| match v {
        Some(Json::String(s)) => s.clone(),
        Some(Json::Null) | None => "<none>".to_string(),
        Some(other) => other.to_string(),
    };
    let phase = obj.data.get("status").and_then(|s| s.get("phase")).and_then(Json::as_str).unwrap_or("");
    format!(
        "{}   {}   {}   {}   {}   {}",
        obj.metadata.name.as_deref().unwrap_or(""),
        text(spec.and_then(|s| s.get("deviceMode"))),
        text(spec.and_then(|s| s.get("nodeSelector"))),
        text(spec.and_then(|s| s.get("image"))),
        phase,
        age(obj),
    )
}

/// Pattern a printed row must match.
pub fn printed_row_pattern(
    name: &str,
    mode: DeviceMode,
    label: (&str, &str),
    image: &str,
    phase: Phase,
) -> Result<Regex, regex::Error> {
    Regex::new(&format!(
        r#"{}\s+{}\s+.*"?{}"?:"?{}"?.*\s+{}\s+{}\s+[0-9]+(s|m)"#,
        regex::escape(name),
        mode,
        regex::escape(label.0),
        regex::escape(label.1),
        regex::escape(image),
        phase,
    ))
}

// ---- bodies ----

impl<C: ObjectClient + Clone + 'static> Orchestrator<C> {
    fn base_spec(&self) -> DeploymentSpec { DeploymentSpec::with_image(&self.config.driver_image) }

    pub(crate) async fn execute(&self, case: &mut TestCase, desc: &ScenarioDescriptor) -> HarnessResult<()> {
        info!(case = %desc.name, deployment = %desc.resource, "running scenario");
        let name = desc.resource.as_str();
        match desc.kind {
            ScenarioKind::Deploy { explicit } => self.deploy(case, name, explicit).await,
            ScenarioKind::PrintedFields => self.printed_fields(case, name).await,
            ScenarioKind::DefaultImage => self.default_image(case, name).await,
            ScenarioKind::EditRunning => self.edit_running(case, name).await,
            ScenarioKind::Multiple => self.multiple(case, name).await,
            ScenarioKind::DottedName => {
                self.create_and_converge(case, name, &self.base_spec(), Some(&default_conditions()), &RUNNING)
                    .await
                    .map(|_| ())
            }
            ScenarioKind::CustomCa => {
                let mut spec = self.base_spec();
                set_tls(&mut spec)?;
                self.create_and_converge(case, name, &spec, Some(&verified_conditions()), &RUNNING).await.map(|_| ())
            }
            ScenarioKind::OperatorExit => self.operator_exit(case, name).await,
            ScenarioKind::Collision => self.collision(case, name).await,
            ScenarioKind::SwitchMode { from, to, after } => self.switch_device_mode(case, name, from, to, after).await,
            ScenarioKind::Update { case: update, restart } => self.update(case, name, update, restart).await,
            ScenarioKind::RecoverDeleted { role } => {
                let (req, _) = self.create_and_converge(case, name, &self.base_spec(), None, &[]).await?;
                self.recover_deleted(case, &req, role).await
            }
            ScenarioKind::RecoverConflict { role } => {
                let (req, _) = self.create_and_converge(case, name, &self.base_spec(), None, &[]).await?;
                self.recover_conflicting_update(case, &req, role).await
            }
            ScenarioKind::Conversion { explicit } => self.conversion(case, name, explicit).await,
        }
    }

    async fn deploy(&self, case: &mut TestCase, name: &str, explicit: bool) -> HarnessResult<()> {
        let spec = if explicit {
            DeploymentSpec {
                device_mode: Some(DeviceMode::Direct),
                pull_policy: Some("Never".into()),
                controller_driver_resources: Some(ResourceRequirements::limits("200m", "100Mi")),
                node_driver_resources: Some(ResourceRequirements::limits("500m", "500Mi")),
                provisioner_resources: Some(ResourceRequirements::limits("210m", "110Mi")),
                node_registrar_resources: Some(ResourceRequirements::limits("300m", "100Mi")),
                ..self.base_spec()
            }
        } else {
            self.base_spec()
        };
        self.create_and_converge(case, name, &spec, Some(&default_conditions()), &RUNNING).await?;
        Ok(())
    }

    async fn printed_fields(&self, case: &mut TestCase, name: &str) -> HarnessResult<()> {
        let label = ("storage", "unknown-node");
        let spec = DeploymentSpec {
            device_mode: Some(DeviceMode::Direct),
            pull_policy: Some("Never".into()),
            node_selector: Some([(label.0.to_string(), label.1.to_string())].into()),
            ..self.base_spec()
        };
        let (req, snap) = self.create_and_converge(case, name, &spec, None, &[]).await?;
        let obj = self.get_as(&req.resource, &crate::config::deployment_kind()).await?;
        let row = printed_row(&obj);
        let pattern = printed_row_pattern(name, DeviceMode::Direct, label, &self.config.driver_image, snap.status.phase)
            .map_err(|e| HarnessError::Invalid(format!("printed row pattern: {}", e)))?;
        if !pattern.is_match(&row) {
            return Err(HarnessError::Expectation(format!("fields mismatch: {:?} does not match {}", row, pattern)));
        }
        info!(row = %row, "printed fields");
        Ok(())
    }

    async fn default_image(&self, case: &mut TestCase, name: &str) -> HarnessResult<()> {
        let spec = DeploymentSpec { image: None, pmem_percentage: Some(50), ..self.base_spec() };
        let resource = self.create(case, name, &spec).await?;
        let operator_image = self.process.image().await?;
        info!(image = %operator_image, "expecting the operator image for the driver");
        let req = self.request(&resource, DeploymentSpec { image: Some(operator_image), ..spec });
        self.converge(case, &req, None, &[]).await?;
        Ok(())
    }

    async fn edit_running(&self, case: &mut TestCase, name: &str) -> HarnessResult<()> {
        let (req, _) = self.create_and_converge(case, name, &self.base_spec(), None, &[]).await?;
        let tls = TlsMaterial::generate()?;
        let edit = |spec: &mut DeploymentSpec| {
            spec.log_level = Some(spec.log_level.unwrap_or(3) + 1);
            spec.image = Some("test-driver-image".into());
            spec.pull_policy = Some("Never".into());
            spec.provisioner_image = Some("test-provisioner".into());
            spec.controller_driver_resources = Some(ResourceRequirements::limits("200m", "100Mi"));
            spec.node_driver_resources = Some(ResourceRequirements::limits("500m", "500Mi"));
            spec.provisioner_resources = Some(ResourceRequirements::limits("300m", "300Mi"));
            spec.node_registrar_resources = Some(ResourceRequirements::limits("100m", "200Mi"));
            tls.apply(spec);
        };
        let written = self.edit_spec(case, &req.resource, &edit).await?;
        self.converge(case, &self.request(&req.resource, written), None, &[]).await?;
        Ok(())
    }

    async fn multiple(&self, case: &mut TestCase, prefix: &str) -> HarnessResult<()> {
        for i in 1..=2 {
            let name = format!("{}-{}", prefix, i);
            let (_, snap) = self.create_and_converge(case, &name, &self.base_spec(), None, &RUNNING).await?;
            info!(deployment = %name, reasons = ?case.correlator().reasons(&snap.uid), "deployment converged");
        }
        Ok(())
    }

    async fn operator_exit(&self, case: &mut TestCase, name: &str) -> HarnessResult<()> {
        let (req, _) = self.create_and_converge(case, name, &self.base_spec(), Some(&default_conditions()), &[]).await?;
        self.stop_controller(case, &req.resource).await?;
        self.hold_steady(&req).await?;
        self.start_controller().await?;
        self.converge(case, &req, None, &[]).await?;
        Ok(())
    }

    /// A registry secret that someone else owns blocks the deployment until it is gone.
    async fn collision(&self, case: &mut TestCase, name: &str) -> HarnessResult<()> {
        let resource = ManagedResourceRef::cluster_scoped(name);
        let layout = DriverLayout::new(&self.config.namespace);
        let secret = layout.child(&resource, ChildRole::RegistrySecret);
        let b64 = |s: &str| STANDARD.encode(s.as_bytes());
        let obj = new_object(
            &ResourceKind::secret(),
            &secret.name,
            Some(&self.config.namespace),
            json!({
                "type": "kubernetes.io/tls",
                "data": {"ca.crt": b64("fake ca"), "tls.key": b64("fake key"), "tls.crt": b64("fake crt")}
            }),
        );
        create_eventually(&self.client, &secret.kind, &obj, false, self.config.timeouts.long).await?;
        {
            let client = self.client.clone();
            let secret = secret.clone();
            let cfg = self.config.timeouts.long;
            case.defer(
                format!("delete {}", secret),
                Box::pin(async move {
                    conv_inject::delete_eventually(&client, &secret, cfg).await?;
                    Ok(())
                }),
            );
        }

        let resource = self.create(case, name, &self.base_spec()).await?;
        case.advance(&resource, ScenarioState::Validating)?;
        self.wait_for_phase(&resource, Phase::Failed).await?;
        case.advance(&resource, ScenarioState::Failed)?;
        let snap = self.snapshot(&resource).await?;
        case.correlator()
            .expect_reasons(snap.uid, &[reasons::CREATED, reasons::FAILED], self.config.timeouts.short)
            .await?;

        conv_inject::delete_eventually(&self.client, &secret, self.config.timeouts.long).await?;
        let req = self.request(&resource, self.base_spec()).tolerating_failed_phase();
        self.converge(case, &req, None, &RUNNING).await?;
        Ok(())
    }

    async fn switch_device_mode(
        &self,
        case: &mut TestCase,
        name: &str,
        from: DeviceMode,
        to: DeviceMode,
        after: AfterSwitch,
    ) -> HarnessResult<()> {
        let spec = DeploymentSpec {
            device_mode: Some(from),
            pmem_percentage: Some(50),
            node_selector: Some([("feature.node.kubernetes.io/memory-nv.dax".to_string(), "true".to_string())].into()),
            ..Default::default()
        };
        let (req, _) = self.create_and_converge(case, name, &spec, None, &[]).await?;

        let sc = self.fixtures.create_storage_class("switch-mode-sc", name).await?;
        {
            let fixtures = Fixtures::new(self.client.clone(), self.config.timeouts.long);
            let sc = sc.clone();
            case.defer(format!("delete {}", sc), Box::pin(async move { fixtures.delete_storage_class(&sc).await }));
        }
        let ns = self.config.app_namespace.clone();
        let claim = self.fixtures.create_claim(&ns, "switch-mode-pvc", &sc.name).await?;
        {
            let fixtures = Fixtures::new(self.client.clone(), self.config.timeouts.long);
            let claim = claim.clone();
            case.defer(format!("delete {}", claim), Box::pin(async move { fixtures.delete_claim(&claim).await }));
        }
        let volume = self.fixtures.wait_claim_bound(&claim).await?;
        info!(claim = %claim, volume = %volume, "volume provisioned before the switch");

        let switched = self.switch_mode(case, &req.resource, to).await?;
        self.converge(case, &self.request(&req.resource, switched), None, &[]).await?;

        match after {
            AfterSwitch::DeleteVolume => {}
            AfterSwitch::UseVolume => {
                let back = self.switch_mode(case, &req.resource, from).await?;
                self.converge(case, &self.request(&req.resource, back), None, &[]).await?;
                let pod = self
                    .fixtures
                    .create_app_pod(&ns, "switch-mode-app", &self.config.app_image, &claim.name)
                    .await?;
                {
                    let fixtures = Fixtures::new(self.client.clone(), self.config.timeouts.long);
                    let pod = pod.clone();
                    case.defer(format!("delete {}", pod), Box::pin(async move { fixtures.delete_pod(&pod).await }));
                }
                self.fixtures.wait_pod_running(&pod).await?;
            }
        }
        self.fixtures.delete_claim(&claim).await
    }

    async fn update(&self, case: &mut TestCase, name: &str, update: UpdateCase, restart: bool) -> HarnessResult<()> {
        let spec = update.initial(&self.config.driver_image);
        let (req, snap) = self.create_and_converge(case, name, &spec, None, &[]).await?;
        if snap.spec != spec {
            return Err(HarnessError::Expectation(format!(
                "{}: spec modified by the operator: {:?} != {:?}",
                name, snap.spec, spec
            )));
        }
        if snap.status.phase != Phase::Running {
            return Err(HarnessError::Expectation(format!("{}: phase {:?}, want Running", name, snap.status.phase)));
        }
        let tls = match update {
            UpdateCase::Tls => Some(TlsMaterial::generate()?),
            _ => None,
        };
        if restart {
            self.stop_controller(case, &req.resource).await?;
        }
        let edit = |s: &mut DeploymentSpec| update.mutate(s, tls.as_ref());
        let written = self.edit_spec(case, &req.resource, &edit).await?;
        if restart {
            self.start_controller().await?;
        }
        self.converge(case, &self.request(&req.resource, written), None, &[]).await?;
        Ok(())
    }

    async fn conversion(&self, case: &mut TestCase, name: &str, explicit: bool) -> HarnessResult<()> {
        let mut spec = DeploymentSpec::with_image(&self.config.driver_image);
        if explicit {
            spec.node_driver_resources = Some(ResourceRequirements::limits("100m", "50Mi").with_requests("10m", "25Mi"));
            spec.controller_driver_resources =
                Some(ResourceRequirements::limits("200m", "100Mi").with_requests("20m", "50Mi"));
        }
        let alpha = alpha_view(&spec)?;
        let resource = self.create_alpha(case, name, alpha.clone()).await?;
        let beta = self.snapshot(&resource).await?;
        let req: ValidationRequest = self.request(&resource, beta.spec);
        self.converge(case, &req, None, &[]).await?;
        self.expect_conversion(&resource, &alpha).await
    }
}

/// A beta spec as the v1alpha1 API spells it.
pub fn alpha_view(spec: &DeploymentSpec) -> HarnessResult<Json> {
    let beta = serde_json::to_value(spec).map_err(|e| HarnessError::Invalid(e.to_string()))?;
    Ok(conversion::beta_to_alpha(&json!({ "spec": beta }))["spec"].clone())
}

/// Scenario names grouped by their top-level context.
pub fn contexts(descs: &[ScenarioDescriptor]) -> BTreeMap<String, usize> {
    let mut out = BTreeMap::new();
    for d in descs {
        let ctx = d.name.split('/').next().unwrap_or("").to_string();
        *out.entry(ctx).or_insert(0) += 1;
    }
    out
}

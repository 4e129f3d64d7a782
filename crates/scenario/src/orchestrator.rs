//! Scenario steps: create a driver deployment, wait for it to converge, disturb it,
//! and wait for it to converge again.
//!
//! Every step that changes what the operator sees moves the resource through the
//! scenario state machine, so a report shows how far a failed case got.

use std::collections::BTreeMap;
use std::sync::Arc;

use conv_core::{
    ChildRole, ConditionStatus, ConditionType, DeploymentSpec, DeviceMode, HarnessError, HarnessResult,
    ManagedResourceRef, ManagedResourceSnapshot, ObjectRef, Phase, ResourceKind,
};
use conv_inject::{delete_eventually, mutations, wait_gone, ConflictInjector};
use conv_kubehub::{new_object, snapshot_of, EventSource, ObjectClient};
use conv_poll::{consistently, eventually, Verdict};
use conv_validate::{
    child_ref, validate_conditions, validate_eventually, workload, DeploymentValidator, RevisionTracker,
    ValidationRequest,
};
use kube::core::DynamicObject;
use serde_json::{json, Value as Json};
use tracing::{info, warn};

use crate::catalog::ScenarioDescriptor;
use crate::config::{alpha_deployment_kind, deployment_kind, HarnessConfig};
use crate::conversion;
use crate::fixtures::{create_eventually, Fixtures};
use crate::lifecycle::{CaseReport, TestCase};
use crate::process::{pod_is_ready, ControllerProcess};
use crate::tracker::ScenarioState;

/// Condition set of a converged deployment without custom certificates.
pub fn default_conditions() -> BTreeMap<ConditionType, ConditionStatus> {
    [(ConditionType::CertsReady, ConditionStatus::True), (ConditionType::DriverDeployed, ConditionStatus::True)]
        .into_iter()
        .collect()
}

/// Condition set of a converged deployment with custom certificates.
pub fn verified_conditions() -> BTreeMap<ConditionType, ConditionStatus> {
    let mut c = default_conditions();
    c.insert(ConditionType::CertsVerified, ConditionStatus::True);
    c
}

pub struct Orchestrator<C> {
    pub(crate) client: C,
    events: Arc<dyn EventSource>,
    pub(crate) validator: Arc<dyn DeploymentValidator>,
    pub(crate) process: Arc<dyn ControllerProcess>,
    injector: ConflictInjector<C>,
    pub(crate) fixtures: Fixtures<C>,
    pub(crate) config: HarnessConfig,
    kind: ResourceKind,
}

impl<C: ObjectClient + Clone + 'static> Orchestrator<C> {
    pub fn new(
        client: C,
        events: Arc<dyn EventSource>,
        validator: Arc<dyn DeploymentValidator>,
        process: Arc<dyn ControllerProcess>,
        config: HarnessConfig,
    ) -> Self {
        Self {
            injector: ConflictInjector::new(client.clone()),
            fixtures: Fixtures::new(client.clone(), config.timeouts.long),
            client,
            events,
            validator,
            process,
            config,
            kind: deployment_kind(),
        }
    }

    pub fn config(&self) -> &HarnessConfig { &self.config }

    pub fn client(&self) -> &C { &self.client }

    /// Validation request for `resource` against this harness' cluster.
    pub fn request(&self, resource: &ManagedResourceRef, desired: DeploymentSpec) -> ValidationRequest {
        let mut req = ValidationRequest::new(&self.config.namespace, resource.clone(), desired);
        req.cluster_version = self.config.cluster_version.clone();
        req
    }

    /// Run one scenario under the case deadline. The cleanups run even when the
    /// deadline cut the body short.
    pub async fn run(&self, desc: &ScenarioDescriptor) -> CaseReport {
        let name = desc.name.as_str();
        let mut case =
            match TestCase::begin(name, &self.config.operator_component, &*self.events, desc.expects_failure()).await {
                Ok(c) => c,
                Err(e) => return CaseReport::aborted(name, &e),
            };
        let deadline = self.config.case_deadline;
        let outcome = match tokio::time::timeout(deadline, self.execute(&mut case, desc)).await {
            Ok(r) => r,
            Err(_) => {
                warn!(case = %name, ?deadline, "deadline exceeded; cleaning up");
                Err(HarnessError::Deadline { scenario: name.to_string(), deadline })
            }
        };
        case.finish(outcome).await
    }

    fn defer_delete(&self, case: &mut TestCase, obj: ObjectRef) {
        let client = self.client.clone();
        let cfg = self.config.timeouts.long;
        case.defer(
            format!("delete {}", obj),
            Box::pin(async move {
                delete_eventually(&client, &obj, cfg).await?;
                wait_gone(&client, &obj, cfg).await
            }),
        );
    }

    async fn create_as(
        &self,
        case: &mut TestCase,
        kind: &ResourceKind,
        name: &str,
        spec: Json,
    ) -> HarnessResult<ManagedResourceRef> {
        let obj = new_object(kind, name, None, json!({ "spec": spec }));
        create_eventually(&self.client, kind, &obj, false, self.config.timeouts.long).await?;
        let resource = ManagedResourceRef::cluster_scoped(name);
        self.defer_delete(case, resource.object_ref(&self.kind));
        case.track(&resource);
        info!(case = %case.name(), deployment = %name, version = %kind.version, "driver deployment created");
        Ok(resource)
    }

    /// Create the managed resource and schedule its deletion.
    pub async fn create(
        &self,
        case: &mut TestCase,
        name: &str,
        spec: &DeploymentSpec,
    ) -> HarnessResult<ManagedResourceRef> {
        let spec = serde_json::to_value(spec).map_err(|e| HarnessError::Invalid(format!("encoding spec: {}", e)))?;
        self.create_as(case, &self.kind, name, spec).await
    }

    /// Create the managed resource through the older API version.
    pub async fn create_alpha(&self, case: &mut TestCase, name: &str, spec: Json) -> HarnessResult<ManagedResourceRef> {
        self.create_as(case, &alpha_deployment_kind(), name, spec).await
    }

    pub async fn get_as(&self, resource: &ManagedResourceRef, kind: &ResourceKind) -> HarnessResult<DynamicObject> {
        self.get_ref(&resource.object_ref(kind)).await
    }

    pub async fn snapshot(&self, resource: &ManagedResourceRef) -> HarnessResult<ManagedResourceSnapshot> {
        let obj = self.get_as(resource, &self.kind).await?;
        snapshot_of(&obj).map_err(|e| HarnessError::Invalid(format!("{}: {:#}", resource, e)))
    }

    /// Wait for the validator, then check the condition set once and wait for the
    /// event reasons. Returns the converged snapshot.
    pub async fn converge(
        &self,
        case: &mut TestCase,
        req: &ValidationRequest,
        conditions: Option<&BTreeMap<ConditionType, ConditionStatus>>,
        reasons: &[&str],
    ) -> HarnessResult<ManagedResourceSnapshot> {
        case.advance(&req.resource, ScenarioState::Validating)?;
        if let Err(e) = validate_eventually(&*self.validator, req, self.config.timeouts.long).await {
            if e.is_terminal() {
                // Expectation: the edge is recorded, the terminal error below reports it.
                match case.advance(&req.resource, ScenarioState::Failed) {
                    Ok(()) | Err(HarnessError::Expectation(_)) => {}
                    Err(te) => warn!(deployment = %req.resource, error = %te, "failed phase not recorded"),
                }
            }
            return Err(e.into());
        }
        case.advance(&req.resource, ScenarioState::Converged)?;
        let snap = self.snapshot(&req.resource).await?;
        if let Some(expected) = conditions {
            validate_conditions(&snap, expected)?;
        }
        if !reasons.is_empty() {
            let seen = case.correlator().expect_reasons(snap.uid, reasons, self.config.timeouts.short).await?;
            info!(deployment = %req.resource, reasons = ?seen, "events observed");
        }
        Ok(snap)
    }

    /// Create `name` with `spec` and converge it.
    pub async fn create_and_converge(
        &self,
        case: &mut TestCase,
        name: &str,
        spec: &DeploymentSpec,
        conditions: Option<&BTreeMap<ConditionType, ConditionStatus>>,
        reasons: &[&str],
    ) -> HarnessResult<(ValidationRequest, ManagedResourceSnapshot)> {
        let resource = self.create(case, name, spec).await?;
        let req = self.request(&resource, spec.clone());
        let snap = self.converge(case, &req, conditions, reasons).await?;
        Ok((req, snap))
    }

    pub async fn wait_for_phase(&self, resource: &ManagedResourceRef, phase: Phase) -> HarnessResult<()> {
        let client = &self.client;
        let obj = resource.object_ref(&self.kind);
        let obj = &obj;
        eventually(&format!("{} in phase {}", resource, phase), self.config.timeouts.long, move || async move {
            let current = match client.get(obj).await.map_err(|e| e.to_string()).and_then(|o| {
                snapshot_of(&o).map_err(|e| format!("{:#}", e))
            }) {
                Ok(s) => s.status.phase,
                Err(e) => return Err(Verdict::Pending(e)),
            };
            if current == phase {
                Ok(())
            } else {
                Err(Verdict::Pending(format!("phase is {:?}", current)))
            }
        })
        .await?;
        info!(deployment = %resource, %phase, "phase reached");
        Ok(())
    }

    /// Mutating from `Converged`; edits while the operator is stopped stay `Disrupted`.
    fn enter_mutation(&self, case: &mut TestCase, resource: &ManagedResourceRef) -> HarnessResult<()> {
        match case.state(resource) {
            Some(ScenarioState::Disrupted) => Ok(()),
            _ => case.advance(resource, ScenarioState::Mutating),
        }
    }

    /// Apply `edit` to the stored spec, re-applying it on conflicts. Returns the
    /// spec as written. A stored spec that does not decode is never overwritten.
    pub async fn edit_spec(
        &self,
        case: &mut TestCase,
        resource: &ManagedResourceRef,
        edit: &(dyn Fn(&mut DeploymentSpec) + Send + Sync),
    ) -> HarnessResult<DeploymentSpec> {
        self.enter_mutation(case, resource)?;
        let mutate = |obj: &mut DynamicObject| -> Result<(), String> {
            let current = obj.data.get("spec").cloned().unwrap_or(Json::Null);
            let mut spec = serde_json::from_value::<DeploymentSpec>(current).map_err(|e| format!("undecodable spec: {}", e))?;
            edit(&mut spec);
            obj.data["spec"] = serde_json::to_value(&spec).map_err(|e| format!("cannot encode edited spec: {}", e))?;
            Ok(())
        };
        let obj = resource.object_ref(&self.kind);
        let written = self.injector.try_inject_mutation(&obj, &mutate, self.config.timeouts.long).await?;
        let snap = snapshot_of(&written).map_err(|e| HarnessError::Invalid(format!("{}: {:#}", resource, e)))?;
        info!(deployment = %resource, "spec edited");
        Ok(snap.spec)
    }

    /// Stop the operator. A restart is scheduled as cleanup in case the body never
    /// gets to `start_controller`.
    pub async fn stop_controller(&self, case: &mut TestCase, resource: &ManagedResourceRef) -> HarnessResult<()> {
        case.advance(resource, ScenarioState::Disrupted)?;
        let process = self.process.clone();
        case.defer("restart operator", Box::pin(async move { process.start().await }));
        self.process.stop().await?;
        info!(case = %case.name(), "operator stopped");
        Ok(())
    }

    pub async fn start_controller(&self) -> HarnessResult<()> {
        self.process.start().await?;
        info!("operator running again");
        Ok(())
    }

    /// Require the deployment to stay valid and unmodified for the stability window.
    pub async fn hold_steady(&self, req: &ValidationRequest) -> HarnessResult<u32> {
        let revisions = Arc::new(tokio::sync::Mutex::new(RevisionTracker::new()));
        let validator = &*self.validator;
        let what = format!("driver deployment {} steady", req.resource);
        let samples = consistently(&what, self.config.timeouts.steady, move || {
            let revisions = revisions.clone();
            async move {
                let mut tracker = revisions.lock().await;
                validator.check(req, Some(&mut *tracker)).await
            }
        })
        .await?;
        info!(deployment = %req.resource, samples, "driver deployment held steady");
        Ok(samples)
    }

    async fn node_pods(&self, selector: &str) -> Result<Vec<DynamicObject>, String> {
        self.client
            .list(&ResourceKind::pod(), Some(&self.config.namespace), Some(selector))
            .await
            .map_err(|e| e.to_string())
    }

    /// Switch the device mode and wait until every node driver pod was replaced by a
    /// running one.
    pub async fn switch_mode(
        &self,
        case: &mut TestCase,
        resource: &ManagedResourceRef,
        mode: DeviceMode,
    ) -> HarnessResult<DeploymentSpec> {
        let selector = self.request(resource, DeploymentSpec::default()).layout().node_pod_selector(resource);
        let this = self;
        let sel = selector.as_str();
        let before: Vec<String> =
            eventually(&format!("node driver pods of {}", resource), self.config.timeouts.long, move || async move {
                match this.node_pods(sel).await {
                    Ok(pods) if !pods.is_empty() => Ok(pods.iter().filter_map(|p| p.metadata.name.clone()).collect()),
                    Ok(_) => Err(Verdict::Pending("no node driver pod yet".to_string())),
                    Err(e) => Err(Verdict::Pending(e)),
                }
            })
            .await?;
        info!(deployment = %resource, %mode, pods = ?before, "switching device mode");
        let spec = self.edit_spec(case, resource, &move |s: &mut DeploymentSpec| s.device_mode = Some(mode)).await?;

        for name in &before {
            let pod = ObjectRef::new(ResourceKind::pod(), name.as_str(), Some(&self.config.namespace));
            wait_gone(&self.client, &pod, self.config.timeouts.long).await?;
        }
        let before = &before;
        eventually(&format!("node driver pods of {} restarted", resource), self.config.timeouts.long, move || async move {
            let pods = match this.node_pods(sel).await {
                Ok(p) => p,
                Err(e) => return Err(Verdict::Pending(e)),
            };
            let stale = pods.iter().filter(|p| p.metadata.name.as_ref().map_or(false, |n| before.contains(n))).count();
            let ready = pods.iter().filter(|p| pod_is_ready(p)).count();
            if !pods.is_empty() && stale == 0 && ready == pods.len() {
                Ok(())
            } else {
                Err(Verdict::Pending(format!("{} pod(s), {} ready, {} from before the switch", pods.len(), ready, stale)))
            }
        })
        .await?;
        Ok(spec)
    }

    /// Delete one child and wait for the operator to re-create it, then revalidate.
    pub async fn recover_deleted(
        &self,
        case: &mut TestCase,
        req: &ValidationRequest,
        role: ChildRole,
    ) -> HarnessResult<()> {
        let obj = child_ref(req, role);
        self.enter_mutation(case, &req.resource)?;
        self.injector
            .delete_and_expect_recovery(&obj, self.config.timeouts.long, self.config.timeouts.short)
            .await?;
        self.converge(case, req, None, &[]).await?;
        Ok(())
    }

    /// Overwrite one child with a conflicting change and wait until the operator put
    /// its own version back.
    pub async fn recover_conflicting_update(
        &self,
        case: &mut TestCase,
        req: &ValidationRequest,
        role: ChildRole,
    ) -> HarnessResult<()> {
        let mutation = mutations::for_role(role, &req.layout())
            .ok_or_else(|| HarnessError::Invalid(format!("no conflicting update for the {}", role.label())))?;
        let obj = child_ref(req, role);
        let baseline = workload::spec(&self.get_ref(&obj).await?);
        self.enter_mutation(case, &req.resource)?;
        let validator = &*self.validator;
        self.injector
            .mutate_and_expect_revert(
                &obj,
                &*mutation,
                self.config.timeouts.short,
                move || async move { validator.check(req, None).await },
                self.config.timeouts.long,
            )
            .await?;
        self.injector.expect_spec_restored(&obj, &baseline, self.config.timeouts.long).await?;
        self.converge(case, req, None, &[]).await?;
        Ok(())
    }

    async fn get_ref(&self, obj: &ObjectRef) -> HarnessResult<DynamicObject> {
        let client = &self.client;
        let found = eventually(&format!("get {}", obj), self.config.timeouts.short, move || async move {
            client.get(obj).await.map_err(Verdict::Pending)
        })
        .await?;
        Ok(found)
    }

    /// Read the resource through both versions and compare with what was created.
    pub async fn expect_conversion(&self, resource: &ManagedResourceRef, created: &Json) -> HarnessResult<()> {
        let alpha = self.get_as(resource, &alpha_deployment_kind()).await?;
        let beta = self.get_as(resource, &self.kind).await?;
        conversion::check_equivalence(created, &alpha, &beta)?;
        info!(deployment = %resource, "alpha and beta renderings agree");
        Ok(())
    }
}

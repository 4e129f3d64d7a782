//! Stopping and starting the operator by scaling its Deployment.

use async_trait::async_trait;
use conv_core::{HarnessError, HarnessResult, ObjectRef, ResourceKind};
use conv_kubehub::ObjectClient;
use conv_poll::{eventually, PollConfig, Verdict};
use kube::core::DynamicObject;
use serde_json::Value as Json;
use tracing::info;

/// Lifecycle control of the operator process.
#[async_trait]
pub trait ControllerProcess: Send + Sync {
    /// Stop the operator and wait until no instance is left.
    async fn stop(&self) -> HarnessResult<()>;
    /// Start the operator and wait until an instance is running and ready.
    async fn start(&self) -> HarnessResult<()>;
    /// Image the operator runs, which is also the default driver image.
    async fn image(&self) -> HarnessResult<String>;
}

/// The operator as a Deployment scaled between 0 and 1 replicas.
pub struct ScaledDeploymentProcess<C> {
    client: C,
    deployment: ObjectRef,
    namespace: String,
    pod_selector: String,
    cfg: PollConfig,
}

pub fn replicas_of(obj: &DynamicObject) -> Option<i64> {
    obj.data.get("spec")?.get("replicas")?.as_i64()
}

fn set_replicas(obj: &mut DynamicObject, replicas: i64) {
    if let Some(spec) = obj.data.get_mut("spec").and_then(Json::as_object_mut) {
        spec.insert("replicas".into(), Json::from(replicas));
    }
}

/// Running with every container ready.
pub fn pod_is_ready(pod: &DynamicObject) -> bool {
    let status = pod.data.get("status");
    let running = status.and_then(|s| s.get("phase")).and_then(Json::as_str) == Some("Running");
    let ready = status
        .and_then(|s| s.get("conditions"))
        .and_then(Json::as_array)
        .map(|cs| {
            cs.iter().any(|c| {
                c.get("type").and_then(Json::as_str) == Some("Ready")
                    && c.get("status").and_then(Json::as_str) == Some("True")
            })
        })
        .unwrap_or(false);
    running && ready
}

fn first_container_image(pod: &DynamicObject) -> Option<String> {
    pod.data.get("spec")?.get("containers")?.get(0)?.get("image")?.as_str().map(str::to_string)
}

impl<C: ObjectClient> ScaledDeploymentProcess<C> {
    pub fn new(client: C, namespace: &str, name: &str, pod_selector: &str, cfg: PollConfig) -> Self {
        Self {
            client,
            deployment: ObjectRef::new(ResourceKind::deployment(), name, Some(namespace)),
            namespace: namespace.to_string(),
            pod_selector: pod_selector.to_string(),
            cfg,
        }
    }

    /// Set spec.replicas, re-reading on conflicts.
    pub async fn scale(&self, replicas: i64) -> HarnessResult<()> {
        let client = &self.client;
        let dep = &self.deployment;
        eventually(&format!("scale {} to {}", dep, replicas), self.cfg, move || async move {
            let mut obj = match client.get(dep).await {
                Ok(o) => o,
                Err(e) => return Err(Verdict::Pending(e.to_string())),
            };
            if replicas_of(&obj) == Some(replicas) {
                return Ok(());
            }
            set_replicas(&mut obj, replicas);
            match client.update(&dep.kind, &obj).await {
                Ok(_) => Ok(()),
                Err(e) => Err(Verdict::Pending(format!("updating replicas: {}", e))),
            }
        })
        .await?;
        info!(deployment = %self.deployment, replicas, "operator scaled");
        Ok(())
    }

    async fn pods(&self) -> Result<Vec<DynamicObject>, String> {
        self.client
            .list(&ResourceKind::pod(), Some(&self.namespace), Some(&self.pod_selector))
            .await
            .map_err(|e| e.to_string())
    }

    pub async fn wait_gone(&self) -> HarnessResult<()> {
        let this = self;
        eventually(&format!("operator pods {} gone", self.pod_selector), self.cfg, move || async move {
            match this.pods().await {
                Ok(pods) if pods.is_empty() => Ok(()),
                Ok(pods) => Err(Verdict::Pending(format!("{} operator pod(s) left", pods.len()))),
                Err(e) => Err(Verdict::Pending(e)),
            }
        })
        .await?;
        info!(selector = %self.pod_selector, "operator pod deleted");
        Ok(())
    }

    pub async fn wait_ready(&self) -> HarnessResult<DynamicObject> {
        let this = self;
        let pod = eventually(&format!("operator pod {} ready", self.pod_selector), self.cfg, move || async move {
            match this.pods().await {
                Ok(pods) => match pods.into_iter().find(pod_is_ready) {
                    Some(p) => Ok(p),
                    None => Err(Verdict::Pending("no ready operator pod".to_string())),
                },
                Err(e) => Err(Verdict::Pending(e)),
            }
        })
        .await?;
        info!(pod = ?pod.metadata.name, "operator ready");
        Ok(pod)
    }
}

#[async_trait]
impl<C: ObjectClient> ControllerProcess for ScaledDeploymentProcess<C> {
    async fn stop(&self) -> HarnessResult<()> {
        self.scale(0).await?;
        self.wait_gone().await
    }

    async fn start(&self) -> HarnessResult<()> {
        self.scale(1).await?;
        self.wait_ready().await.map(|_| ())
    }

    async fn image(&self) -> HarnessResult<String> {
        let pod = self.wait_ready().await?;
        first_container_image(&pod)
            .ok_or_else(|| HarnessError::Invalid(format!("operator pod {:?} has no container image", pod.metadata.name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conv_kubehub::{new_object, MemoryCluster};
    use serde_json::json;
    use std::time::Duration;

    fn cfg() -> PollConfig { PollConfig::new(Duration::from_secs(5), Duration::from_millis(10)) }

    async fn seeded() -> std::sync::Arc<MemoryCluster> {
        let cluster = MemoryCluster::new();
        let kind = ResourceKind::deployment();
        cluster
            .create(&kind, &new_object(&kind, "pmem-csi-operator", Some("ops"), json!({"spec": {"replicas": 1}})))
            .await
            .unwrap();
        let pod = ResourceKind::pod();
        let mut p = new_object(
            &pod,
            "pmem-csi-operator-1",
            Some("ops"),
            json!({
                "spec": {"containers": [{"name": "operator", "image": "intel/pmem-csi-operator:v1"}]},
                "status": {"phase": "Running", "conditions": [{"type": "Ready", "status": "True"}]}
            }),
        );
        p.metadata.labels = Some([("app".to_string(), "pmem-csi-operator".to_string())].into_iter().collect());
        cluster.create(&pod, &p).await.unwrap();
        cluster
    }

    #[tokio::test]
    async fn scale_is_idempotent_and_survives_conflicts() {
        let cluster = seeded().await;
        let dep = ObjectRef::new(ResourceKind::deployment(), "pmem-csi-operator", Some("ops"));
        cluster.fail_next_update_with_conflict(&dep);
        let p = ScaledDeploymentProcess::new(cluster.clone(), "ops", "pmem-csi-operator", "app=pmem-csi-operator", cfg());
        p.scale(0).await.unwrap();
        p.scale(0).await.unwrap();
        assert_eq!(replicas_of(&cluster.get(&dep).await.unwrap()), Some(0));
    }

    #[tokio::test]
    async fn image_comes_from_the_ready_pod() {
        let cluster = seeded().await;
        let p = ScaledDeploymentProcess::new(cluster.clone(), "ops", "pmem-csi-operator", "app=pmem-csi-operator", cfg());
        assert_eq!(p.image().await.unwrap(), "intel/pmem-csi-operator:v1");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_times_out_while_a_pod_lingers() {
        let cluster = seeded().await;
        let p = ScaledDeploymentProcess::new(cluster.clone(), "ops", "pmem-csi-operator", "app=pmem-csi-operator", cfg());
        let err = p.stop().await.unwrap_err();
        assert!(matches!(err, HarnessError::Timeout { .. }), "{:?}", err);
    }

    #[test]
    fn readiness_needs_phase_and_condition() {
        let kind = ResourceKind::pod();
        let running = new_object(&kind, "p", Some("ns"), json!({"status": {"phase": "Running"}}));
        assert!(!pod_is_ready(&running));
        let ready = new_object(
            &kind,
            "p",
            Some("ns"),
            json!({"status": {"phase": "Running", "conditions": [{"type": "Ready", "status": "True"}]}}),
        );
        assert!(pod_is_ready(&ready));
    }
}

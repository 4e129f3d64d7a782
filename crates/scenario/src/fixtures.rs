//! Storage and application fixtures used around a device mode switch: a storage class
//! served by the driver under test, a volume claim, and a pod mounting it.

use conv_core::{ApiError, HarnessResult, ObjectRef, ResourceKind};
use conv_inject::{delete_eventually, wait_gone};
use conv_kubehub::{new_object, ObjectClient};
use conv_poll::{eventually, PollConfig, Verdict};
use kube::core::DynamicObject;
use serde_json::{json, Value as Json};
use tracing::info;

/// Create `obj`, retrying transient errors. With `exists_ok`, an existing object of
/// the same name counts as created.
pub async fn create_eventually<C: ObjectClient + ?Sized>(
    client: &C,
    kind: &ResourceKind,
    obj: &DynamicObject,
    exists_ok: bool,
    cfg: PollConfig,
) -> HarnessResult<Option<DynamicObject>> {
    let name = obj.metadata.name.clone().unwrap_or_default();
    let created = eventually(&format!("create {} {}", kind.kind, name), cfg, move || async move {
        match client.create(kind, obj).await {
            Ok(o) => Ok(Some(o)),
            Err(e) if e.is_already_exists() && exists_ok => Ok(None),
            Err(e @ ApiError::AlreadyExists(_)) => Err(Verdict::Final(e)),
            Err(e) => Err(Verdict::Pending(e)),
        }
    })
    .await?;
    info!(kind = %kind.kind, name = %name, "created");
    Ok(created)
}

pub struct Fixtures<C> {
    client: C,
    cfg: PollConfig,
}

impl<C: ObjectClient> Fixtures<C> {
    pub fn new(client: C, cfg: PollConfig) -> Self { Self { client, cfg } }

    /// Immediate binding, reclaim policy Delete. An existing class is reused.
    pub async fn create_storage_class(&self, name: &str, provisioner: &str) -> HarnessResult<ObjectRef> {
        let kind = ResourceKind::storage_class();
        let obj = new_object(
            &kind,
            name,
            None,
            json!({
                "provisioner": provisioner,
                "reclaimPolicy": "Delete",
                "volumeBindingMode": "Immediate",
                "parameters": {"eraseafter": "false"}
            }),
        );
        create_eventually(&self.client, &kind, &obj, true, self.cfg).await?;
        Ok(ObjectRef::new(kind, name, None))
    }

    pub async fn delete_storage_class(&self, class: &ObjectRef) -> HarnessResult<()> {
        delete_eventually(&self.client, class, self.cfg).await?;
        Ok(())
    }

    pub async fn create_claim(&self, namespace: &str, name: &str, storage_class: &str) -> HarnessResult<ObjectRef> {
        let kind = ResourceKind::persistent_volume_claim();
        let obj = new_object(
            &kind,
            name,
            Some(namespace),
            json!({
                "spec": {
                    "storageClassName": storage_class,
                    "accessModes": ["ReadWriteOnce"],
                    "resources": {"requests": {"storage": "2Gi"}}
                }
            }),
        );
        create_eventually(&self.client, &kind, &obj, false, self.cfg).await?;
        Ok(ObjectRef::new(kind, name, Some(namespace)))
    }

    /// Wait for the claim to be bound; returns the name of its volume.
    pub async fn wait_claim_bound(&self, claim: &ObjectRef) -> HarnessResult<String> {
        let client = &self.client;
        let volume = eventually(&format!("{} bound", claim), self.cfg, move || async move {
            let pvc = match client.get(claim).await {
                Ok(o) => o,
                Err(e) => return Err(Verdict::Pending(e.to_string())),
            };
            let phase = pvc.data.get("status").and_then(|s| s.get("phase")).and_then(Json::as_str).unwrap_or("");
            match (phase, volume_name(&pvc)) {
                ("Bound", Some(v)) => Ok(v),
                (phase, _) => Err(Verdict::Pending(format!("{} is {:?}", claim, phase))),
            }
        })
        .await?;
        info!(claim = %claim, volume = %volume, "claim bound");
        Ok(volume)
    }

    /// Delete the claim and wait until its volume is gone as well.
    pub async fn delete_claim(&self, claim: &ObjectRef) -> HarnessResult<()> {
        let volume = match self.client.get(claim).await {
            Ok(pvc) => volume_name(&pvc),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };
        delete_eventually(&self.client, claim, self.cfg).await?;
        if let Some(v) = volume {
            info!(claim = %claim, volume = %v, "waiting for volume deletion");
            wait_gone(&self.client, &ObjectRef::new(ResourceKind::persistent_volume(), v, None), self.cfg).await?;
        }
        Ok(())
    }

    /// A pod that sleeps with `claim` mounted.
    pub async fn create_app_pod(&self, namespace: &str, name: &str, image: &str, claim: &str) -> HarnessResult<ObjectRef> {
        let kind = ResourceKind::pod();
        let obj = new_object(
            &kind,
            name,
            Some(namespace),
            json!({
                "spec": {
                    "containers": [{
                        "name": "test-driver",
                        "image": image,
                        "imagePullPolicy": "IfNotPresent",
                        "command": ["sleep", "180"],
                        "volumeMounts": [{"name": "pmem-volume", "mountPath": "/data"}]
                    }],
                    "volumes": [{"name": "pmem-volume", "persistentVolumeClaim": {"claimName": claim}}]
                }
            }),
        );
        create_eventually(&self.client, &kind, &obj, false, self.cfg).await?;
        Ok(ObjectRef::new(kind, name, Some(namespace)))
    }

    pub async fn wait_pod_running(&self, pod: &ObjectRef) -> HarnessResult<()> {
        let client = &self.client;
        eventually(&format!("{} running", pod), self.cfg, move || async move {
            let p = match client.get(pod).await {
                Ok(o) => o,
                Err(e) => return Err(Verdict::Pending(e.to_string())),
            };
            match p.data.get("status").and_then(|s| s.get("phase")).and_then(Json::as_str) {
                Some("Running") => Ok(()),
                other => Err(Verdict::Pending(format!("{}: status {:?}", pod, other))),
            }
        })
        .await?;
        Ok(())
    }

    pub async fn delete_pod(&self, pod: &ObjectRef) -> HarnessResult<()> {
        delete_eventually(&self.client, pod, self.cfg).await?;
        Ok(())
    }
}

fn volume_name(pvc: &DynamicObject) -> Option<String> {
    pvc.data
        .get("spec")
        .and_then(|s| s.get("volumeName"))
        .and_then(Json::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use conv_kubehub::MemoryCluster;
    use std::time::Duration;

    fn cfg() -> PollConfig { PollConfig::new(Duration::from_secs(5), Duration::from_millis(10)) }

    #[tokio::test]
    async fn storage_class_tolerates_existing_and_missing() {
        let cluster = MemoryCluster::new();
        let f = Fixtures::new(cluster.clone(), cfg());
        let sc = f.create_storage_class("switch-mode-sc", "d").await.unwrap();
        f.create_storage_class("switch-mode-sc", "d").await.unwrap();
        assert_eq!(cluster.get(&sc).await.unwrap().data["provisioner"], json!("d"));
        f.delete_storage_class(&sc).await.unwrap();
        f.delete_storage_class(&sc).await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_claim_is_final() {
        let cluster = MemoryCluster::new();
        let f = Fixtures::new(cluster.clone(), cfg());
        f.create_claim("default", "pvc", "sc").await.unwrap();
        let err = f.create_claim("default", "pvc", "sc").await.unwrap_err();
        assert!(matches!(err, conv_core::HarnessError::Terminal { .. }), "{:?}", err);
    }

    #[tokio::test]
    async fn deleting_a_claim_waits_for_its_volume() {
        let cluster = MemoryCluster::new();
        let f = Fixtures::new(cluster.clone(), cfg());
        let claim = f.create_claim("default", "pvc", "sc").await.unwrap();
        let pv_kind = ResourceKind::persistent_volume();
        cluster.create(&pv_kind, &new_object(&pv_kind, "pv-1", None, json!({}))).await.unwrap();
        let mut pvc = cluster.get(&claim).await.unwrap();
        pvc.data["spec"]["volumeName"] = json!("pv-1");
        pvc.data["status"] = json!({"phase": "Bound"});
        cluster.update(&claim.kind, &pvc).await.unwrap();
        assert_eq!(f.wait_claim_bound(&claim).await.unwrap(), "pv-1");

        let provisioner = {
            let cluster = cluster.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                cluster.delete(&ObjectRef::new(ResourceKind::persistent_volume(), "pv-1", None)).await.unwrap();
            })
        };
        f.delete_claim(&claim).await.unwrap();
        assert!(!cluster.contains(&ObjectRef::new(ResourceKind::persistent_volume(), "pv-1", None)));
        provisioner.await.unwrap();
        // Already gone.
        f.delete_claim(&claim).await.unwrap();
    }
}

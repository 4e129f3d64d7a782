//! Names of the objects the operator renders for one managed resource.

use serde::{Deserialize, Serialize};

use crate::{ManagedResourceRef, ObjectRef, ResourceKind};

/// Operator-owned child objects of a driver deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChildRole {
    RegistrySecret,
    NodeSecret,
    ServiceAccount,
    ControllerService,
    MetricsService,
    ProvisionerRole,
    ProvisionerRoleBinding,
    ProvisionerClusterRole,
    ProvisionerClusterRoleBinding,
    CsiDriver,
    ControllerDriver,
    NodeDriver,
}

impl ChildRole {
    pub const ALL: [ChildRole; 12] = [
        ChildRole::RegistrySecret,
        ChildRole::NodeSecret,
        ChildRole::ServiceAccount,
        ChildRole::ControllerService,
        ChildRole::MetricsService,
        ChildRole::ProvisionerRole,
        ChildRole::ProvisionerRoleBinding,
        ChildRole::ProvisionerClusterRole,
        ChildRole::ProvisionerClusterRoleBinding,
        ChildRole::CsiDriver,
        ChildRole::ControllerDriver,
        ChildRole::NodeDriver,
    ];

    pub fn kind(&self) -> ResourceKind {
        match self {
            ChildRole::RegistrySecret | ChildRole::NodeSecret => ResourceKind::secret(),
            ChildRole::ServiceAccount => ResourceKind::service_account(),
            ChildRole::ControllerService | ChildRole::MetricsService => ResourceKind::service(),
            ChildRole::ProvisionerRole => ResourceKind::role(),
            ChildRole::ProvisionerRoleBinding => ResourceKind::role_binding(),
            ChildRole::ProvisionerClusterRole => ResourceKind::cluster_role(),
            ChildRole::ProvisionerClusterRoleBinding => ResourceKind::cluster_role_binding(),
            ChildRole::CsiDriver => ResourceKind::csi_driver(),
            ChildRole::ControllerDriver => ResourceKind::stateful_set(),
            ChildRole::NodeDriver => ResourceKind::daemon_set(),
        }
    }

    /// Human label, also used to build scenario and resource names.
    pub fn label(&self) -> &'static str {
        match self {
            ChildRole::RegistrySecret => "registry secret",
            ChildRole::NodeSecret => "node secret",
            ChildRole::ServiceAccount => "service account",
            ChildRole::ControllerService => "controller service",
            ChildRole::MetricsService => "metrics service",
            ChildRole::ProvisionerRole => "provisioner role",
            ChildRole::ProvisionerRoleBinding => "provisioner role binding",
            ChildRole::ProvisionerClusterRole => "provisioner cluster role",
            ChildRole::ProvisionerClusterRoleBinding => "provisioner cluster role binding",
            ChildRole::CsiDriver => "csi driver",
            ChildRole::ControllerDriver => "controller driver",
            ChildRole::NodeDriver => "node driver",
        }
    }

    fn suffix(&self) -> Option<&'static str> {
        match self {
            ChildRole::RegistrySecret => Some("registry-secrets"),
            ChildRole::NodeSecret => Some("node-secrets"),
            ChildRole::ServiceAccount => Some("controller"),
            ChildRole::ControllerService => Some("controller"),
            ChildRole::MetricsService => Some("metrics"),
            ChildRole::ProvisionerRole => Some("external-provisioner-cfg"),
            ChildRole::ProvisionerRoleBinding => Some("csi-provisioner-role-cfg"),
            ChildRole::ProvisionerClusterRole => Some("external-provisioner-runner"),
            ChildRole::ProvisionerClusterRoleBinding => Some("csi-provisioner-role"),
            ChildRole::CsiDriver => None,
            ChildRole::ControllerDriver => Some("controller"),
            ChildRole::NodeDriver => Some("node"),
        }
    }
}

/// Where and under which names the operator renders a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverLayout {
    /// Namespace of the namespaced child objects (the operator's namespace).
    pub namespace: String,
    /// Name of the driver container inside the controller and node workloads.
    pub driver_container: String,
    /// Label key carrying the component name on driver pods.
    pub component_label: String,
    /// Label key carrying the managed resource name on driver pods.
    pub instance_label: String,
}

impl DriverLayout {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            driver_container: "pmem-driver".to_string(),
            component_label: "app.kubernetes.io/name".to_string(),
            instance_label: "app.kubernetes.io/instance".to_string(),
        }
    }

    /// Derived object names replace dots with hyphens; the resource name itself is
    /// never split or interpreted.
    pub fn hyphened(name: &str) -> String {
        name.replace('.', "-")
    }

    pub fn child_name(&self, resource: &ManagedResourceRef, role: ChildRole) -> String {
        match role.suffix() {
            Some(suffix) => format!("{}-{}", Self::hyphened(&resource.name), suffix),
            None => resource.name.clone(),
        }
    }

    pub fn child(&self, resource: &ManagedResourceRef, role: ChildRole) -> ObjectRef {
        ObjectRef::new(role.kind(), self.child_name(resource, role), Some(&self.namespace))
    }

    pub fn children(&self, resource: &ManagedResourceRef) -> Vec<(ChildRole, ObjectRef)> {
        ChildRole::ALL.iter().map(|r| (*r, self.child(resource, *r))).collect()
    }

    /// Label selector matching the node driver pods of one deployment.
    pub fn node_pod_selector(&self, resource: &ManagedResourceRef) -> String {
        format!("{}=pmem-csi-node,{}={}", self.component_label, self.instance_label, resource.name)
    }

    /// Label selector matching the controller driver pods of one deployment.
    pub fn controller_pod_selector(&self, resource: &ManagedResourceRef) -> String {
        format!("{}=pmem-csi-controller,{}={}", self.component_label, self.instance_label, resource.name)
    }
}

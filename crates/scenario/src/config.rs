//! Harness settings. Everything has a default and can be overridden from the
//! environment; the CLI applies its flags on top.

use std::time::Duration;

use conv_core::ResourceKind;
use conv_poll::PollConfig;

/// Image that never starts; the scenarios only need the objects, not running drivers.
pub const DUMMY_DRIVER_IMAGE: &str = "unexisting/pmem-csi-driver";

pub const CRD_GROUP: &str = "pmem-csi.intel.com";

/// The managed resource kind, as stored.
pub fn deployment_kind() -> ResourceKind { ResourceKind::new(CRD_GROUP, "v1beta1", "Deployment", false) }

/// The older served version of the managed resource kind.
pub fn alpha_deployment_kind() -> ResourceKind { ResourceKind::new(CRD_GROUP, "v1alpha1", "Deployment", false) }

/// Poll horizons used by the scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub short: PollConfig,
    pub long: PollConfig,
    pub steady: PollConfig,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self { short: PollConfig::short(), long: PollConfig::long(), steady: PollConfig::steady() }
    }
}

impl Timeouts {
    /// Same horizons, every retry interval except the stability sampling replaced.
    pub fn with_interval(self, interval: Duration) -> Self {
        Self { short: self.short.with_interval(interval), long: self.long.with_interval(interval), steady: self.steady }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HarnessConfig {
    /// Namespace of the operator and of the namespaced driver objects.
    pub namespace: String,
    /// Name of the operator Deployment.
    pub operator_name: String,
    /// Source component of the operator's events.
    pub operator_component: String,
    /// Label selector of the operator pod.
    pub operator_selector: String,
    pub case_deadline: Duration,
    pub timeouts: Timeouts,
    pub driver_image: String,
    /// Image of the application pod that mounts a volume after a mode switch.
    pub app_image: String,
    /// Namespace of volume claims and application pods.
    pub app_namespace: String,
    /// `major.minor` of the API server; probed by the CLI when unset.
    pub cluster_version: Option<String>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            namespace: "default".into(),
            operator_name: "pmem-csi-operator".into(),
            operator_component: "pmem-csi-operator".into(),
            operator_selector: "app=pmem-csi-operator".into(),
            case_deadline: Duration::from_secs(300),
            timeouts: Timeouts::default(),
            driver_image: DUMMY_DRIVER_IMAGE.into(),
            app_image: "intel/pmem-csi-driver:canary".into(),
            app_namespace: "default".into(),
            cluster_version: None,
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

impl HarnessConfig {
    /// Defaults overridden by `CONV_*` environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(ns) = env_string("CONV_NAMESPACE") {
            cfg.namespace = ns;
        }
        if let Some(name) = env_string("CONV_OPERATOR_NAME") {
            cfg.operator_component = name.clone();
            cfg.operator_selector = format!("app={}", name);
            cfg.operator_name = name;
        }
        if let Some(c) = env_string("CONV_OPERATOR_COMPONENT") {
            cfg.operator_component = c;
        }
        if let Some(sel) = env_string("CONV_OPERATOR_SELECTOR") {
            cfg.operator_selector = sel;
        }
        if let Some(secs) = env_string("CONV_CASE_DEADLINE_SECS").and_then(|s| s.parse::<u64>().ok()) {
            cfg.case_deadline = Duration::from_secs(secs);
        }
        if let Some(ms) = env_string("CONV_POLL_INTERVAL_MS").and_then(|s| s.parse::<u64>().ok()).filter(|ms| *ms > 0) {
            cfg.timeouts = cfg.timeouts.with_interval(Duration::from_millis(ms));
        }
        if let Some(img) = env_string("CONV_DRIVER_IMAGE") {
            cfg.driver_image = img;
        }
        if let Some(img) = env_string("CONV_APP_IMAGE") {
            cfg.app_image = img;
        }
        if let Some(ns) = env_string("CONV_APP_NAMESPACE") {
            cfg.app_namespace = ns;
        }
        cfg.cluster_version = env_string("CONV_CLUSTER_VERSION");
        cfg
    }
}

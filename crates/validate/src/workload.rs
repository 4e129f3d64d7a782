//! Accessors for pod templates and services inside dynamic objects.

use std::collections::BTreeMap;

use conv_core::ResourceKind;
use kube::core::DynamicObject;
use serde_json::Value as Json;

/// StatefulSet, DaemonSet and Deployment: objects whose status is written by
/// the workload controllers.
pub fn is_workload(kind: &ResourceKind) -> bool {
    kind.group == "apps" && matches!(kind.kind.as_str(), "StatefulSet" | "DaemonSet" | "Deployment")
}

fn pod_spec(obj: &DynamicObject) -> Option<&Json> {
    obj.data.get("spec")?.get("template")?.get("spec")
}

fn pod_spec_mut(obj: &mut DynamicObject) -> Option<&mut Json> {
    obj.data.get_mut("spec")?.get_mut("template")?.get_mut("spec")
}

pub fn container<'a>(obj: &'a DynamicObject, name: &str) -> Option<&'a Json> {
    pod_spec(obj)?
        .get("containers")?
        .as_array()?
        .iter()
        .find(|c| c.get("name").and_then(Json::as_str) == Some(name))
}

pub fn container_mut<'a>(obj: &'a mut DynamicObject, name: &str) -> Option<&'a mut Json> {
    pod_spec_mut(obj)?
        .get_mut("containers")?
        .as_array_mut()?
        .iter_mut()
        .find(|c| c.get("name").and_then(Json::as_str) == Some(name))
}

pub fn node_selector(obj: &DynamicObject) -> BTreeMap<String, String> {
    pod_spec(obj)
        .and_then(|s| s.get("nodeSelector"))
        .and_then(Json::as_object)
        .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string()))).collect())
        .unwrap_or_default()
}

/// Compare resource requirements; a missing section equals an empty one.
pub fn resources_match(want: &Json, actual: &Json) -> bool {
    let section = |v: &Json, key: &str| -> BTreeMap<String, String> {
        v.get(key)
            .and_then(Json::as_object)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))).collect())
            .unwrap_or_default()
    };
    ["limits", "requests"].iter().all(|k| section(want, k) == section(actual, k))
}

/// Overwrite the command of container `name`. Returns false when it does not exist.
pub fn set_container_command(obj: &mut DynamicObject, name: &str, command: &[&str]) -> bool {
    match container_mut(obj, name).and_then(Json::as_object_mut) {
        Some(c) => {
            c.insert("command".to_string(), Json::from(command.to_vec()));
            true
        }
        None => false,
    }
}

/// Replace the port mapping of a Service with a single `port -> port` entry.
pub fn set_service_port(obj: &mut DynamicObject, port: u16) {
    let ports = serde_json::json!([{ "port": port, "targetPort": port }]);
    match obj.data.get_mut("spec").and_then(Json::as_object_mut) {
        Some(spec) => {
            spec.insert("ports".to_string(), ports);
        }
        None => {
            if let Some(root) = obj.data.as_object_mut() {
                root.insert("spec".to_string(), serde_json::json!({ "ports": ports }));
            }
        }
    }
}

pub fn spec(obj: &DynamicObject) -> Json {
    obj.data.get("spec").cloned().unwrap_or(Json::Null)
}

//! v1alpha1 <-> v1beta1 conversion of the driver Deployment and the checks that a
//! resource created through the old version reads back equivalently through both.

use std::sync::Arc;

use conv_core::{HarnessError, HarnessResult};
use conv_kubehub::mock::Converter;
use kube::core::DynamicObject;
use serde_json::{Map, Value as Json};

pub const ALPHA: &str = "v1alpha1";
pub const BETA: &str = "v1beta1";

/// Fields renamed between the versions, as (alpha, beta).
const RENAMED: [(&str, &str); 2] =
    [("controllerResources", "controllerDriverResources"), ("nodeResources", "nodeDriverResources")];

/// Fields that only exist in v1beta1.
const BETA_ONLY: [&str; 2] = ["provisionerResources", "nodeRegistrarResources"];

fn with_spec(data: &Json, f: impl FnOnce(&mut Map<String, Json>)) -> Json {
    let mut out = data.clone();
    if let Some(spec) = out.get_mut("spec").and_then(Json::as_object_mut) {
        f(spec);
    }
    out
}

pub fn alpha_to_beta(data: &Json) -> Json {
    with_spec(data, |spec| {
        for (alpha, beta) in RENAMED {
            if let Some(v) = spec.remove(alpha) {
                spec.insert(beta.to_string(), v);
            }
        }
    })
}

pub fn beta_to_alpha(data: &Json) -> Json {
    with_spec(data, |spec| {
        for field in BETA_ONLY {
            spec.remove(field);
        }
        for (alpha, beta) in RENAMED {
            if let Some(v) = spec.remove(beta) {
                spec.insert(alpha.to_string(), v);
            }
        }
    })
}

/// Converter for the in-memory cluster. Unknown version pairs pass through.
pub fn converter() -> Converter {
    Arc::new(|data: &Json, from: &str, to: &str| match (from, to) {
        (ALPHA, BETA) => alpha_to_beta(data),
        (BETA, ALPHA) => beta_to_alpha(data),
        _ => data.clone(),
    })
}

fn field<'a>(obj: &'a DynamicObject, path: &[&str]) -> &'a Json {
    let mut cur = &obj.data;
    for p in path {
        match cur.get(p) {
            Some(v) => cur = v,
            None => return &Json::Null,
        }
    }
    cur
}

/// Empty objects and absent fields compare equal.
fn normalized(v: &Json) -> Json {
    match v {
        Json::Object(m) if m.is_empty() => Json::Null,
        Json::Object(m) => Json::Object(
            m.iter().filter(|(_, v)| !v.is_null()).map(|(k, v)| (k.clone(), normalized(v))).collect(),
        ),
        other => other.clone(),
    }
}

/// `beta` must carry the renamed alpha fields of `created`; `alpha` read back must
/// have the spec it was created with and the same status as `beta`.
pub fn check_equivalence(created: &Json, alpha: &DynamicObject, beta: &DynamicObject) -> HarnessResult<()> {
    let mut problems = Vec::new();
    for (a, b) in RENAMED {
        let sent = normalized(created.get(a).unwrap_or(&Json::Null));
        let stored = normalized(field(beta, &["spec", b]));
        if sent != stored {
            problems.push(format!("{}: beta {} is {}, alpha sent {}", b, b, stored, sent));
        }
    }
    let alpha_spec = normalized(field(alpha, &["spec"]));
    if alpha_spec != normalized(created) {
        problems.push(format!("alpha spec {} differs from the created {}", alpha_spec, created));
    }
    let (alpha_status, beta_status) = (normalized(field(alpha, &["status"])), normalized(field(beta, &["status"])));
    if alpha_status != beta_status {
        problems.push(format!("alpha status {} differs from beta status {}", alpha_status, beta_status));
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(HarnessError::Expectation(format!("conversion mismatch: {}", problems.join("; "))))
    }
}

//! Fault injection against operator-owned objects.
//!
//! The injector deletes or rewrites a child object the way a careless administrator
//! would and then waits for the operator to put it back. Deletes are idempotent and
//! writes retry conflicts against the latest revision, so neither a second delete nor a
//! concurrent writer turns into a test failure.

#![forbid(unsafe_code)]

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use conv_core::{format_uid, ApiError, ChildRole, DriverLayout, HarnessError, HarnessResult, ObjectRef};
use conv_kubehub::{uid_of, ObjectClient};
use conv_poll::{eventually, PollConfig, PollError, Verdict};
use conv_validate::workload;
use kube::core::DynamicObject;
use metrics::counter;
use serde_json::Value as Json;
use tracing::{debug, info};

/// Immediate re-fetch-and-reapply rounds inside one write attempt.
const CONFLICT_RETRIES: u32 = 5;

pub type Mutation = Arc<dyn Fn(&mut DynamicObject) + Send + Sync>;

pub struct ConflictInjector<C> {
    client: C,
}

impl<C: ObjectClient> ConflictInjector<C> {
    pub fn new(client: C) -> Self { Self { client } }

    pub fn client(&self) -> &C { &self.client }

    /// Delete `obj`; NotFound counts as success and other errors are retried.
    pub async fn delete(&self, obj: &ObjectRef, cfg: PollConfig) -> Result<(), PollError<ApiError>> {
        delete_eventually(&self.client, obj, cfg).await
    }

    /// Delete `obj` and wait until the operator re-created it (a new uid under the same
    /// name). Returns the re-created object.
    pub async fn delete_and_expect_recovery(
        &self,
        obj: &ObjectRef,
        delete_cfg: PollConfig,
        recover_cfg: PollConfig,
    ) -> HarnessResult<DynamicObject> {
        let client = &self.client;
        let before = match client.get(obj).await {
            Ok(o) => uid_of(&o),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };
        self.delete(obj, delete_cfg).await?;
        let before = before.as_ref();
        let recovered = eventually(&format!("recover {}", obj), recover_cfg, move || async move {
            match client.get(obj).await {
                Ok(o) if before.is_some() && uid_of(&o).as_ref() == before => {
                    Err(Verdict::Pending(format!("{} still has the deleted uid", obj)))
                }
                Ok(o) => Ok(o),
                Err(e) => Err(Verdict::Pending(e.to_string())),
            }
        })
        .await
        .map_err(|e| match e {
            PollError::Timeout { elapsed, last, .. } => HarnessError::RecoveryTimeout {
                kind: obj.kind.kind.clone(),
                name: obj.name.clone(),
                elapsed,
                last: last.unwrap_or_else(|| "(no attempt completed)".to_string()),
            },
            other => other.into(),
        })?;
        counter!("objects_recovered_total", 1u64);
        info!(
            object = %obj,
            uid = %uid_of(&recovered).map(|u| format_uid(&u)).unwrap_or_default(),
            "recovered"
        );
        Ok(recovered)
    }

    /// Fetch, mutate and write `obj`. A conflict re-fetches the latest revision and
    /// re-applies `mutate` to it; stale writes never reach the caller.
    pub async fn inject_mutation(
        &self,
        obj: &ObjectRef,
        mutate: &(dyn Fn(&mut DynamicObject) + Send + Sync),
        cfg: PollConfig,
    ) -> HarnessResult<DynamicObject> {
        let infallible = |o: &mut DynamicObject| -> Result<(), String> {
            mutate(o);
            Ok(())
        };
        self.try_inject_mutation(obj, &infallible, cfg).await
    }

    /// `inject_mutation` for edits that can refuse an object. A refusal is final:
    /// nothing is written and the error names it.
    pub async fn try_inject_mutation(
        &self,
        obj: &ObjectRef,
        mutate: &(dyn Fn(&mut DynamicObject) -> Result<(), String> + Send + Sync),
        cfg: PollConfig,
    ) -> HarnessResult<DynamicObject> {
        let client = &self.client;
        let written = eventually(&format!("update {}", obj), cfg, move || async move {
            let mut conflicts = 0u32;
            loop {
                let mut latest = match client.get(obj).await {
                    Ok(o) => o,
                    Err(e) => return Err(Verdict::Pending(e.to_string())),
                };
                if let Err(e) = mutate(&mut latest) {
                    return Err(Verdict::Final(format!("cannot mutate {}: {}", obj, e)));
                }
                match client.update(&obj.kind, &latest).await {
                    Ok(o) => return Ok(o),
                    Err(e) if e.is_conflict() && conflicts < CONFLICT_RETRIES => {
                        conflicts += 1;
                        counter!("conflict_retries_total", 1u64);
                        debug!(object = %obj, conflicts, "conflict; re-applying mutation to the latest revision");
                    }
                    Err(e) => return Err(Verdict::Pending(e.to_string())),
                }
            }
        })
        .await?;
        info!(object = %obj, rv = ?written.metadata.resource_version, "mutation written");
        Ok(written)
    }

    /// `inject_mutation`, then poll `revert_probe` until the operator reconciled.
    pub async fn mutate_and_expect_revert<P, Fut, E>(
        &self,
        obj: &ObjectRef,
        mutate: &(dyn Fn(&mut DynamicObject) + Send + Sync),
        write_cfg: PollConfig,
        revert_probe: P,
        revert_cfg: PollConfig,
    ) -> HarnessResult<()>
    where
        P: FnMut() -> Fut,
        Fut: Future<Output = Result<(), Verdict<E>>>,
        E: fmt::Display,
    {
        self.inject_mutation(obj, mutate, write_cfg).await?;
        eventually(&format!("revert of {}", obj), revert_cfg, revert_probe).await?;
        counter!("objects_reverted_total", 1u64);
        info!(object = %obj, "operator reverted the mutation");
        Ok(())
    }

    /// Wait until the spec of `obj` equals `baseline` again.
    pub async fn expect_spec_restored(&self, obj: &ObjectRef, baseline: &Json, cfg: PollConfig) -> HarnessResult<()> {
        let client = &self.client;
        eventually(&format!("spec of {} restored", obj), cfg, move || async move {
            match client.get(obj).await {
                Ok(o) if workload::spec(&o) == *baseline => Ok(()),
                Ok(_) => Err(Verdict::Pending(SpecDiffers(obj.to_string()))),
                Err(e) => Err(Verdict::Pending(SpecDiffers(e.to_string()))),
            }
        })
        .await?;
        Ok(())
    }
}

/// Delete `obj`, retrying transient errors. An object that is already gone counts as
/// deleted, so deleting twice never fails.
pub async fn delete_eventually<C: ObjectClient + ?Sized>(
    client: &C,
    obj: &ObjectRef,
    cfg: PollConfig,
) -> Result<(), PollError<ApiError>> {
    eventually(&format!("delete {}", obj), cfg, move || async move {
        match client.delete(obj).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(object = %obj, "already gone");
                Ok(())
            }
            Err(e) => Err(Verdict::Pending(e)),
        }
    })
    .await?;
    info!(object = %obj, "deleted");
    Ok(())
}

/// Wait until `obj` no longer exists.
pub async fn wait_gone<C: ObjectClient + ?Sized>(client: &C, obj: &ObjectRef, cfg: PollConfig) -> HarnessResult<()> {
    eventually(&format!("{} gone", obj), cfg, move || async move {
        match client.get(obj).await {
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(Verdict::Pending(e.to_string())),
            Ok(_) => Err(Verdict::Pending(format!("{} still exists", obj))),
        }
    })
    .await?;
    Ok(())
}

#[derive(Debug)]
struct SpecDiffers(String);

impl fmt::Display for SpecDiffers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "spec still differs: {}", self.0)
    }
}

/// Mutations an administrator could plausibly make to operator-owned objects.
pub mod mutations {
    use super::*;

    pub const MALFORMED_COMMAND: [&str; 2] = ["malformed", "options"];
    pub const CONFLICTING_PORT: u16 = 1111;

    pub fn malformed_driver_command(container: &str) -> Mutation {
        let container = container.to_string();
        Arc::new(move |o: &mut DynamicObject| {
            if !workload::set_container_command(o, &container, &MALFORMED_COMMAND) {
                debug!(container = %container, "container not found; nothing mutated");
            }
        })
    }

    pub fn service_port(port: u16) -> Mutation {
        Arc::new(move |o: &mut DynamicObject| workload::set_service_port(o, port))
    }

    /// The stock conflicting update for a child role, if there is one.
    pub fn for_role(role: ChildRole, layout: &DriverLayout) -> Option<Mutation> {
        match role {
            ChildRole::ControllerDriver | ChildRole::NodeDriver => Some(malformed_driver_command(&layout.driver_container)),
            ChildRole::MetricsService | ChildRole::ControllerService => Some(service_port(CONFLICTING_PORT)),
            _ => None,
        }
    }
}

//! Test-case lifecycle: event subscription, per-resource state, and a LIFO stack of
//! cleanups that always runs.

use std::collections::BTreeMap;
use std::time::Instant;

use conv_core::{HarnessError, HarnessResult, ManagedResourceRef};
use conv_events::{CorrelatorHandle, EventCorrelator};
use conv_kubehub::EventSource;
use futures::future::BoxFuture;
use metrics::{counter, histogram};
use serde::Serialize;
use tracing::{info, warn};

use crate::tracker::{ScenarioState, ScenarioTracker};

pub type CleanupFuture = BoxFuture<'static, HarnessResult<()>>;

/// Deferred teardown steps, run last-in first-out.
#[derive(Default)]
pub struct CleanupStack {
    entries: Vec<(String, CleanupFuture)>,
}

impl CleanupStack {
    pub fn push(&mut self, label: impl Into<String>, step: CleanupFuture) {
        self.entries.push((label.into(), step));
    }

    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Run every step, newest first. A failing step does not stop the others.
    pub async fn unwind(&mut self) -> Vec<(String, HarnessError)> {
        let mut failures = Vec::new();
        while let Some((label, step)) = self.entries.pop() {
            match step.await {
                Ok(()) => info!(step = %label, "cleanup done"),
                Err(e) => {
                    warn!(step = %label, error = %e, "cleanup failed");
                    failures.push((label, e));
                }
            }
        }
        failures
    }
}

/// Outcome of one test case.
#[derive(Debug, Clone, Serialize)]
pub struct CaseReport {
    pub name: String,
    pub passed: bool,
    pub error: Option<String>,
    pub cleanup_errors: Vec<String>,
    pub elapsed_ms: u128,
    pub states: BTreeMap<String, Vec<ScenarioState>>,
}

impl CaseReport {
    /// A case that failed before its body could start.
    pub fn aborted(name: &str, error: &HarnessError) -> Self {
        counter!("cases_failed_total", 1u64);
        Self {
            name: name.to_string(),
            passed: false,
            error: Some(error.to_string()),
            cleanup_errors: Vec::new(),
            elapsed_ms: 0,
            states: BTreeMap::new(),
        }
    }
}

/// One running test case. Owns a fresh correlator and subscription; `finish` tears
/// everything down.
pub struct TestCase {
    name: String,
    expects_failure: bool,
    correlator: EventCorrelator,
    handle: Option<CorrelatorHandle>,
    cleanups: CleanupStack,
    trackers: BTreeMap<String, ScenarioTracker>,
    started: Instant,
}

impl TestCase {
    /// Subscribe to events and start correlating them for `component`.
    pub async fn begin(
        name: &str,
        component: &str,
        source: &dyn EventSource,
        expects_failure: bool,
    ) -> HarnessResult<Self> {
        let stream = source
            .subscribe()
            .await
            .map_err(|e| HarnessError::Expectation(format!("subscribing to events: {:#}", e)))?;
        let correlator = EventCorrelator::new(component);
        let handle = correlator.start(stream);
        info!(case = %name, "test case started");
        Ok(Self {
            name: name.to_string(),
            expects_failure,
            correlator,
            handle: Some(handle),
            cleanups: CleanupStack::default(),
            trackers: BTreeMap::new(),
            started: Instant::now(),
        })
    }

    pub fn name(&self) -> &str { &self.name }

    pub fn correlator(&self) -> &EventCorrelator { &self.correlator }

    pub fn defer(&mut self, label: impl Into<String>, step: CleanupFuture) { self.cleanups.push(label, step); }

    pub fn pending_cleanups(&self) -> usize { self.cleanups.len() }

    /// Start tracking `resource` in state `Created`.
    pub fn track(&mut self, resource: &ManagedResourceRef) {
        let t = ScenarioTracker::new(&self.name, &resource.name, self.expects_failure);
        self.trackers.insert(resource.name.clone(), t);
    }

    pub fn state(&self, resource: &ManagedResourceRef) -> Option<ScenarioState> {
        self.trackers.get(&resource.name).map(ScenarioTracker::state)
    }

    pub fn advance(&mut self, resource: &ManagedResourceRef, to: ScenarioState) -> HarnessResult<()> {
        match self.trackers.get_mut(&resource.name) {
            Some(t) => t.advance(to),
            None => Err(HarnessError::Expectation(format!("{}: {} is not tracked", self.name, resource))),
        }
    }

    /// Run the cleanups, stop the correlator, and report. `outcome` is the result of
    /// the body; a cleanup failure fails an otherwise passing case.
    pub async fn finish(mut self, outcome: HarnessResult<()>) -> CaseReport {
        let failures = self.cleanups.unwind().await;
        if let Some(h) = self.handle.take() {
            h.stop().await;
        }
        let error = match (&outcome, failures.first()) {
            (Err(e), _) => Some(e.to_string()),
            (Ok(()), Some((label, e))) => Some(format!("cleanup {}: {}", label, e)),
            (Ok(()), None) => None,
        };
        let passed = error.is_none();
        let elapsed = self.started.elapsed();
        histogram!("case_seconds", elapsed.as_secs_f64());
        if passed {
            counter!("cases_passed_total", 1u64);
            info!(case = %self.name, took_ms = %elapsed.as_millis(), "test case passed");
        } else {
            counter!("cases_failed_total", 1u64);
            warn!(case = %self.name, took_ms = %elapsed.as_millis(), error = ?error, "test case failed");
        }
        CaseReport {
            name: self.name.clone(),
            passed,
            error,
            cleanup_errors: failures.iter().map(|(l, e)| format!("{}: {}", l, e)).collect(),
            elapsed_ms: elapsed.as_millis(),
            states: self.trackers.iter().map(|(k, t)| (k.clone(), t.history().to_vec())).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conv_kubehub::MemoryCluster;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn cleanups_run_newest_first_and_all_of_them() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut stack = CleanupStack::default();
        for i in 0..3 {
            let order = order.clone();
            stack.push(
                format!("step {}", i),
                Box::pin(async move {
                    order.lock().unwrap().push(i);
                    if i == 1 {
                        Err(HarnessError::Expectation("boom".into()))
                    } else {
                        Ok(())
                    }
                }),
            );
        }
        let failures = stack.unwind().await;
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "step 1");
        assert!(stack.is_empty());
    }

    #[tokio::test]
    async fn finish_reports_body_error_and_runs_cleanups() {
        let cluster = MemoryCluster::new();
        let mut case = TestCase::begin("c", "pmem-csi-operator", &*cluster, false).await.unwrap();
        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        case.defer("mark", Box::pin(async move {
            *flag.lock().unwrap() = true;
            Ok(())
        }));
        let report = case.finish(Err(HarnessError::Expectation("body failed".into()))).await;
        assert!(!report.passed);
        assert_eq!(report.error.as_deref(), Some("body failed"));
        assert!(*ran.lock().unwrap());
    }

    #[tokio::test]
    async fn cleanup_failure_fails_a_passing_case() {
        let cluster = MemoryCluster::new();
        let mut case = TestCase::begin("c", "op", &*cluster, false).await.unwrap();
        case.defer("broken", Box::pin(async { Err(HarnessError::Expectation("nope".into())) }));
        let report = case.finish(Ok(())).await;
        assert!(!report.passed);
        assert_eq!(report.cleanup_errors, vec!["broken: nope".to_string()]);
    }

    #[tokio::test]
    async fn trackers_are_per_resource() {
        let cluster = MemoryCluster::new();
        let mut case = TestCase::begin("c", "op", &*cluster, false).await.unwrap();
        let a = ManagedResourceRef::cluster_scoped("a");
        let b = ManagedResourceRef::cluster_scoped("b");
        case.track(&a);
        case.track(&b);
        case.advance(&a, ScenarioState::Validating).unwrap();
        assert_eq!(case.state(&a), Some(ScenarioState::Validating));
        assert_eq!(case.state(&b), Some(ScenarioState::Created));
        assert!(case.advance(&ManagedResourceRef::cluster_scoped("c"), ScenarioState::Validating).is_err());
        let report = case.finish(Ok(())).await;
        assert_eq!(report.states["a"], vec![ScenarioState::Created, ScenarioState::Validating]);
    }
}

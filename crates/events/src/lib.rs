//! Event correlation: attribute operator notifications to the object that caused them.
//!
//! One `EventCorrelator` lives per test case. `start` spawns a single task that drains an
//! event stream into the ledger; `expect_reasons` polls the ledger with `eventually`.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use conv_core::{format_uid, NotificationEvent, Uid};
use conv_poll::{eventually, PollConfig, PollError, Verdict};
use futures::{Stream, StreamExt};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// UID -> distinct reasons observed. Grows monotonically until `reset`.
#[derive(Debug, Clone, Default)]
pub struct EventLedger {
    inner: Arc<RwLock<FxHashMap<Uid, BTreeSet<String>>>>,
}

impl EventLedger {
    pub fn new() -> Self { Self::default() }

    /// Returns true when the reason was not recorded for this uid before.
    pub fn record(&self, uid: Uid, reason: &str) -> bool {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(uid).or_default().insert(reason.to_string())
    }

    /// Snapshot of the reasons seen for `uid`; empty when none arrived yet.
    pub fn reasons(&self, uid: &Uid) -> BTreeSet<String> {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        map.get(uid).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn reset(&self) {
        self.inner.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

/// Expected reasons not (yet) present in the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingReasons {
    pub uid: Uid,
    pub missing: BTreeSet<String>,
    pub observed: BTreeSet<String>,
}

impl fmt::Display for MissingReasons {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "object {}: missing event reasons {:?}, observed {:?}",
            format_uid(&self.uid),
            self.missing,
            self.observed
        )
    }
}

impl std::error::Error for MissingReasons {}

/// Owns the ledger of one test case and filters events by the operator's identity.
#[derive(Debug, Clone)]
pub struct EventCorrelator {
    component: String,
    ledger: EventLedger,
}

impl EventCorrelator {
    pub fn new(component: impl Into<String>) -> Self {
        Self { component: component.into(), ledger: EventLedger::new() }
    }

    pub fn component(&self) -> &str { &self.component }

    pub fn ledger(&self) -> &EventLedger { &self.ledger }

    pub fn reasons(&self, uid: &Uid) -> BTreeSet<String> { self.ledger.reasons(uid) }

    /// Feed a single event. Returns false when the event was discarded.
    pub fn ingest(&self, ev: &NotificationEvent) -> bool {
        if ev.component != self.component {
            counter!("events_discarded_total", 1u64);
            return false;
        }
        counter!("events_ingested_total", 1u64);
        if self.ledger.record(ev.involved_uid, &ev.reason) {
            debug!(uid = %format_uid(&ev.involved_uid), reason = %ev.reason, "event: new reason");
        }
        true
    }

    /// Spawn the ingestion task. The task ends when the stream closes or the handle stops.
    pub fn start<S>(&self, stream: S) -> CorrelatorHandle
    where
        S: Stream<Item = NotificationEvent> + Send + 'static,
    {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let this = self.clone();
        let task = tokio::spawn(async move {
            let stream = stream.fuse();
            futures::pin_mut!(stream);
            info!(component = %this.component, "event correlator started");
            loop {
                tokio::select! {
                    _ = &mut stop_rx => {
                        debug!("event correlator stop requested");
                        break;
                    }
                    next = stream.next() => match next {
                        Some(ev) => { this.ingest(&ev); }
                        None => {
                            debug!("event stream closed");
                            break;
                        }
                    }
                }
            }
            info!(objects = this.ledger.len(), "event correlator stopped");
        });
        CorrelatorHandle { task: Some(task), stop: Some(stop_tx) }
    }

    /// Wait until every reason in `expected` was seen for `uid`. Extra reasons are fine.
    pub async fn expect_reasons(
        &self,
        uid: Uid,
        expected: &[&str],
        cfg: PollConfig,
    ) -> Result<BTreeSet<String>, PollError<MissingReasons>> {
        let what = format!("event reasons {:?} for {}", expected, format_uid(&uid));
        eventually(&what, cfg, || {
            let observed = self.ledger.reasons(&uid);
            let missing: BTreeSet<String> =
                expected.iter().filter(|r| !observed.contains(**r)).map(|r| r.to_string()).collect();
            async move {
                if missing.is_empty() {
                    Ok(observed)
                } else {
                    Err(Verdict::Pending(MissingReasons { uid, missing, observed }))
                }
            }
        })
        .await
    }
}

/// Scoped handle of the ingestion task. Dropping it without `stop` aborts the task.
#[derive(Debug)]
pub struct CorrelatorHandle {
    task: Option<JoinHandle<()>>,
    stop: Option<oneshot::Sender<()>>,
}

impl CorrelatorHandle {
    /// Terminate the task and wait for it. The ledger keeps its contents.
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map(|t| t.is_finished()).unwrap_or(true)
    }
}

impl Drop for CorrelatorHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

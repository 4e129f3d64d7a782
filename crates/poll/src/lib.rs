//! Bounded-retry polling: `eventually` and `consistently`.
//!
//! Both primitives re-query state directly at a fixed interval instead of waiting for
//! notifications, so a missed or delayed watch event never hides a satisfied condition.
//! Probe calls are sequential: the next call is scheduled only after the previous one
//! returned, and never earlier than one `interval` after the previous start.

#![forbid(unsafe_code)]

use std::fmt;
use std::future::Future;
use std::time::Duration;

use conv_core::HarnessError;
use metrics::counter;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Classification of a failed probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict<E> {
    /// Not satisfied yet; keep polling.
    Pending(E),
    /// Cannot become satisfied; stop polling now.
    Final(E),
}

impl<E> Verdict<E> {
    pub fn is_final(&self) -> bool { matches!(self, Verdict::Final(_)) }

    pub fn inner(&self) -> &E {
        match self { Verdict::Pending(e) | Verdict::Final(e) => e }
    }

    pub fn into_inner(self) -> E {
        match self { Verdict::Pending(e) | Verdict::Final(e) => e }
    }

    pub fn map<F, G: FnOnce(E) -> F>(self, f: G) -> Verdict<F> {
        match self {
            Verdict::Pending(e) => Verdict::Pending(f(e)),
            Verdict::Final(e) => Verdict::Final(f(e)),
        }
    }
}

/// Plain errors are transient unless the probe says otherwise.
impl<E> From<E> for Verdict<E> {
    fn from(e: E) -> Self { Verdict::Pending(e) }
}

impl<E: fmt::Display> fmt::Display for Verdict<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Pending(e) => write!(f, "{}", e),
            Verdict::Final(e) => write!(f, "final: {}", e),
        }
    }
}

/// Horizon and sampling interval of one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// `timeout` for `eventually`, `duration` for `consistently`.
    pub timeout: Duration,
    pub interval: Duration,
}

impl PollConfig {
    pub const fn new(timeout: Duration, interval: Duration) -> Self { Self { timeout, interval } }

    /// 2m at 1s: object lookups, event reasons, recovery of deleted objects.
    pub const fn short() -> Self { Self::new(Duration::from_secs(120), Duration::from_secs(1)) }

    /// 3m at 1s: deletions, scaling, pod lifecycle, failure phase.
    pub const fn long() -> Self { Self::new(Duration::from_secs(180), Duration::from_secs(1)) }

    /// 1m sampled every 20s: stability while the operator is absent.
    pub const fn steady() -> Self { Self::new(Duration::from_secs(60), Duration::from_secs(20)) }

    pub fn with_timeout(mut self, timeout: Duration) -> Self { self.timeout = timeout; self }

    pub fn with_interval(mut self, interval: Duration) -> Self { self.interval = interval; self }

    /// Apply `CONV_POLL_INTERVAL_MS` when set.
    pub fn with_env_interval(self) -> Self {
        match std::env::var("CONV_POLL_INTERVAL_MS").ok().and_then(|s| s.parse::<u64>().ok()) {
            Some(ms) if ms > 0 => self.with_interval(Duration::from_millis(ms)),
            _ => self,
        }
    }
}

/// Why a poll did not succeed.
#[derive(Debug)]
pub enum PollError<E> {
    /// The horizon elapsed without the probe succeeding.
    Timeout { what: String, elapsed: Duration, attempts: u32, last: Option<E> },
    /// The probe reported a final error.
    Terminal { what: String, attempts: u32, error: E },
    /// A `consistently` sample failed.
    Violated { what: String, elapsed: Duration, samples: u32, error: E },
    /// A `consistently` sample did not return within the whole duration.
    Stalled { what: String, elapsed: Duration },
}

impl<E> PollError<E> {
    pub fn what(&self) -> &str {
        match self {
            PollError::Timeout { what, .. }
            | PollError::Terminal { what, .. }
            | PollError::Violated { what, .. }
            | PollError::Stalled { what, .. } => what,
        }
    }

    /// The most recent probe error, if any attempt completed with one.
    pub fn last_error(&self) -> Option<&E> {
        match self {
            PollError::Timeout { last, .. } => last.as_ref(),
            PollError::Terminal { error, .. } | PollError::Violated { error, .. } => Some(error),
            PollError::Stalled { .. } => None,
        }
    }

    pub fn is_timeout(&self) -> bool { matches!(self, PollError::Timeout { .. }) }
    pub fn is_terminal(&self) -> bool { matches!(self, PollError::Terminal { .. }) }
}

impl<E: fmt::Display> fmt::Display for PollError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollError::Timeout { what, elapsed, attempts, last } => match last {
                Some(e) => write!(f, "{}: timed out after {:?} ({} attempt(s)); last error: {}", what, elapsed, attempts, e),
                None => write!(f, "{}: timed out after {:?} ({} attempt(s))", what, elapsed, attempts),
            },
            PollError::Terminal { what, attempts, error } => {
                write!(f, "{}: terminal failure after {} attempt(s): {}", what, attempts, error)
            }
            PollError::Violated { what, elapsed, samples, error } => {
                write!(f, "{}: failed after {:?} ({} sample(s)): {}", what, elapsed, samples, error)
            }
            PollError::Stalled { what, elapsed } => write!(f, "{}: probe stalled for {:?}", what, elapsed),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for PollError<E> {}

impl<E: fmt::Display> From<PollError<E>> for HarnessError {
    fn from(e: PollError<E>) -> Self {
        match e {
            PollError::Timeout { what, elapsed, attempts, last } => HarnessError::Timeout {
                what,
                elapsed,
                attempts,
                last: last.map(|e| e.to_string()).unwrap_or_else(|| "(no attempt completed)".to_string()),
            },
            PollError::Terminal { what, attempts, error } => {
                HarnessError::Terminal { what, attempts, message: error.to_string() }
            }
            PollError::Violated { what, elapsed, samples, error } => {
                HarnessError::Unstable { what, elapsed, samples, message: error.to_string() }
            }
            PollError::Stalled { what, elapsed } => {
                HarnessError::Unstable { what, elapsed, samples: 0, message: "probe stalled".to_string() }
            }
        }
    }
}

fn ticker(interval: Duration) -> tokio::time::Interval {
    let mut t = tokio::time::interval(interval.max(Duration::from_millis(1)));
    t.set_missed_tick_behavior(MissedTickBehavior::Delay);
    t
}

/// Poll `probe` until it succeeds, reports a final error, or `cfg.timeout` elapses.
///
/// The first call happens immediately. Pending errors are logged at debug level and
/// retried; the last one is returned on timeout for diagnosis.
pub async fn eventually<T, E, F, Fut>(what: &str, cfg: PollConfig, mut probe: F) -> Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Verdict<E>>>,
    E: fmt::Display,
{
    let start = Instant::now();
    let deadline = start + cfg.timeout;
    let mut ticks = ticker(cfg.interval);
    ticks.tick().await;
    let mut attempts = 0u32;
    let mut last: Option<E> = None;
    loop {
        attempts += 1;
        counter!("poll_attempts_total", 1u64);
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, probe()).await {
            Ok(Ok(v)) => {
                debug!(what, attempts, took_ms = %start.elapsed().as_millis(), "poll: satisfied");
                return Ok(v);
            }
            Ok(Err(Verdict::Final(error))) => {
                warn!(what, attempts, error = %error, "poll: final error, giving up");
                counter!("poll_terminal_total", 1u64);
                return Err(PollError::Terminal { what: what.to_string(), attempts, error });
            }
            Ok(Err(Verdict::Pending(error))) => {
                debug!(what, attempt = attempts, error = %error, "poll: not yet satisfied, will retry");
                last = Some(error);
            }
            Err(_) => {
                debug!(what, attempt = attempts, "poll: probe exceeded remaining budget");
                break;
            }
        }
        if Instant::now() >= deadline {
            break;
        }
        tokio::select! {
            biased;
            _ = tokio::time::sleep_until(deadline) => break,
            _ = ticks.tick() => {}
        }
    }
    counter!("poll_timeouts_total", 1u64);
    Err(PollError::Timeout { what: what.to_string(), elapsed: start.elapsed(), attempts, last })
}

/// Require `probe` to succeed at every sample for `cfg.timeout`. Fails on the first
/// failing sample without waiting out the remaining duration. Returns the number of
/// samples taken.
pub async fn consistently<E, F, Fut>(what: &str, cfg: PollConfig, mut probe: F) -> Result<u32, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), Verdict<E>>>,
    E: fmt::Display,
{
    let start = Instant::now();
    let end = start + cfg.timeout;
    let mut ticks = ticker(cfg.interval);
    ticks.tick().await;
    let mut samples = 0u32;
    loop {
        samples += 1;
        counter!("poll_samples_total", 1u64);
        match tokio::time::timeout(cfg.timeout.max(cfg.interval), probe()).await {
            Ok(Ok(())) => debug!(what, sample = samples, "poll: holds"),
            Ok(Err(Verdict::Final(error))) => {
                warn!(what, sample = samples, error = %error, "poll: final error while required to hold");
                return Err(PollError::Terminal { what: what.to_string(), attempts: samples, error });
            }
            Ok(Err(Verdict::Pending(error))) => {
                warn!(what, sample = samples, error = %error, "poll: violated");
                counter!("poll_violations_total", 1u64);
                return Err(PollError::Violated { what: what.to_string(), elapsed: start.elapsed(), samples, error });
            }
            Err(_) => return Err(PollError::Stalled { what: what.to_string(), elapsed: start.elapsed() }),
        }
        if Instant::now() >= end {
            break;
        }
        tokio::select! {
            biased;
            _ = tokio::time::sleep_until(end) => break,
            _ = ticks.tick() => {}
        }
    }
    debug!(what, samples, "poll: held for the whole duration");
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    const SECOND: Duration = Duration::from_secs(1);

    #[tokio::test(start_paused = true)]
    async fn eventually_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let t0 = Instant::now();
        let v = eventually("counter", PollConfig::new(10 * SECOND, SECOND), || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 { Err(Verdict::Pending(format!("only {}", n))) } else { Ok(n) }
            }
        })
        .await
        .unwrap();
        assert_eq!(v, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(t0.elapsed() >= 2 * SECOND && t0.elapsed() < 3 * SECOND, "elapsed {:?}", t0.elapsed());
    }

    #[tokio::test(start_paused = true)]
    async fn eventually_times_out_with_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let err = eventually::<(), String, _, _>("never", PollConfig::new(5 * SECOND, SECOND), || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                Err(Verdict::Pending(format!("attempt {}", n)))
            }
        })
        .await
        .unwrap_err();
        match &err {
            PollError::Timeout { attempts, last, elapsed, .. } => {
                assert_eq!(*attempts, calls.load(Ordering::SeqCst));
                assert!((5..=6).contains(attempts), "attempts {}", attempts);
                assert_eq!(last.as_deref(), Some(format!("attempt {}", attempts).as_str()));
                assert!(*elapsed <= 5 * SECOND + Duration::from_millis(10));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(err.to_string().contains("never: timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn final_error_aborts_immediately() {
        let t0 = Instant::now();
        let err = eventually::<(), &str, _, _>("phase", PollConfig::new(60 * SECOND, SECOND), || async {
            Err(Verdict::Final("phase Failed"))
        })
        .await
        .unwrap_err();
        assert!(err.is_terminal());
        assert!(t0.elapsed() < SECOND);
        assert_eq!(err.last_error(), Some(&"phase Failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn probe_starts_are_spaced_by_interval_and_never_overlap() {
        let starts: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
        let busy = Arc::new(AtomicU32::new(0));
        let (s, b) = (starts.clone(), busy.clone());
        let _ = eventually::<(), String, _, _>("spacing", PollConfig::new(10 * SECOND, 2 * SECOND), || {
            let (s, b) = (s.clone(), b.clone());
            async move {
                assert_eq!(b.fetch_add(1, Ordering::SeqCst), 0, "overlapping probe");
                s.lock().unwrap().push(Instant::now());
                tokio::time::sleep(Duration::from_millis(500)).await;
                b.fetch_sub(1, Ordering::SeqCst);
                Err(Verdict::Pending("no".to_string()))
            }
        })
        .await;
        let starts = starts.lock().unwrap();
        assert!(starts.len() >= 4);
        for w in starts.windows(2) {
            assert!(w[1] - w[0] >= 2 * SECOND, "probes too close: {:?}", w[1] - w[0]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn question_mark_converts_to_pending() {
        async fn lookup(n: u32) -> Result<u32, String> {
            if n < 2 { Err("missing".to_string()) } else { Ok(n) }
        }
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let v = eventually("lookup", PollConfig::new(10 * SECOND, SECOND), || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst);
                let v = lookup(n).await?;
                Ok::<_, Verdict<String>>(v)
            }
        })
        .await
        .unwrap();
        assert_eq!(v, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn consistently_fails_fast_on_first_bad_sample() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let t0 = Instant::now();
        let err = consistently("stable", PollConfig::steady(), || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 1 { Err(Verdict::Pending("drift")) } else { Ok(()) }
            }
        })
        .await
        .unwrap_err();
        match err {
            PollError::Violated { samples, error, .. } => {
                assert_eq!(samples, 2);
                assert_eq!(error, "drift");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(t0.elapsed() < 30 * SECOND, "did not fail fast: {:?}", t0.elapsed());
    }

    #[tokio::test(start_paused = true)]
    async fn consistently_samples_across_the_whole_duration() {
        let t0 = Instant::now();
        let samples = consistently::<String, _, _>("stable", PollConfig::steady(), || async { Ok(()) }).await.unwrap();
        assert_eq!(samples, 3);
        assert!(t0.elapsed() >= 60 * SECOND);
    }

    #[tokio::test(start_paused = true)]
    async fn consistently_reports_final_errors_as_terminal() {
        let err = consistently("stable", PollConfig::steady(), || async { Err(Verdict::Final("phase Failed")) })
            .await
            .unwrap_err();
        assert!(err.is_terminal());
    }

    #[test]
    fn harness_error_keeps_last_error() {
        let e: PollError<String> = PollError::Timeout {
            what: "recover Secret/ns/x".into(),
            elapsed: SECOND,
            attempts: 3,
            last: Some("not_found: x".into()),
        };
        let h: HarnessError = e.into();
        let s = h.to_string();
        assert!(s.contains("recover Secret/ns/x") && s.contains("not_found: x"), "s={}", s);
    }
}

//! Background drift detection.
//!
//! One worker per detector recomputes the plan on a fixed interval, caches the
//! latest result for status queries and notifies a broadcaster when the drift
//! picture changes. A tick is skipped while the previous check is running.

use crate::error::StatekeeperResult;
use crate::plan::Plan;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Anything that can produce a fresh, approval-stamped plan.
pub trait PlanSource: Send + Sync {
    fn current_plan(&self) -> StatekeeperResult<Plan>;

    /// Desired-state file the plan is computed from, for display.
    fn state_path(&self) -> PathBuf;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftLevel {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct DriftResult {
    pub checked_at: DateTime<Utc>,
    pub drifted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub state_path: PathBuf,
}

impl DriftResult {
    pub fn has_blocked(&self) -> bool {
        self.plan
            .as_ref()
            .map(|plan| plan.summary.has_blocked)
            .unwrap_or(false)
    }

    /// Severity used when this result is broadcast.
    pub fn level(&self) -> DriftLevel {
        if self.error.is_some() {
            DriftLevel::Warning
        } else if self.has_blocked() {
            DriftLevel::Critical
        } else if self.drifted {
            DriftLevel::Warning
        } else {
            DriftLevel::Info
        }
    }

    fn signature(&self) -> (bool, bool, bool) {
        (self.drifted, self.error.is_some(), self.has_blocked())
    }
}

/// Receives drift transitions; decouples the detector from any transport.
pub trait DriftBroadcaster: Send + Sync {
    fn notify_drift(&self, result: &DriftResult);
}

pub struct NoopBroadcaster;

impl DriftBroadcaster for NoopBroadcaster {
    fn notify_drift(&self, _result: &DriftResult) {}
}

/// Shortest interval the worker will tick at.
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

struct Worker {
    stop_tx: watch::Sender<bool>,
    /// Flips to true once the worker task and its in-flight check are done.
    exited: watch::Receiver<bool>,
}

pub struct DriftDetector {
    source: Arc<dyn PlanSource>,
    broadcaster: Arc<dyn DriftBroadcaster>,
    interval: Duration,
    checking: AtomicBool,
    /// Serialises periodic and manual checks so `last` is written in order.
    check_lock: Mutex<()>,
    last: Mutex<Option<DriftResult>>,
    worker: Mutex<Option<Worker>>,
}

/// Clears the checking flag even if the check panics.
struct CheckingGuard<'a>(&'a AtomicBool);

impl Drop for CheckingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl DriftDetector {
    pub fn new(
        source: Arc<dyn PlanSource>,
        broadcaster: Arc<dyn DriftBroadcaster>,
        interval: Duration,
    ) -> Self {
        if interval < MIN_INTERVAL {
            warn!(
                "drift interval {interval:?} too short; using {}s",
                MIN_INTERVAL.as_secs()
            );
        }
        Self {
            source,
            broadcaster,
            interval: interval.max(MIN_INTERVAL),
            checking: AtomicBool::new(false),
            check_lock: Mutex::new(()),
            last: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Launch the periodic worker. The first check runs immediately.
    /// Calling `start` on a running detector does nothing.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let (exited_tx, exited) = watch::channel(false);
        let detector = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(detector.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut in_flight: Option<JoinHandle<()>> = None;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if detector.checking.swap(true, Ordering::SeqCst) {
                            debug!("drift check still running; skipping tick");
                            continue;
                        }
                        let job = Arc::clone(&detector);
                        in_flight = Some(tokio::task::spawn_blocking(move || {
                            let _guard = CheckingGuard(&job.checking);
                            job.run_check();
                        }));
                    }
                    _ = stop_rx.changed() => break,
                }
            }

            if let Some(job) = in_flight.take() {
                if let Err(err) = job.await {
                    warn!("drift check ended abnormally: {err}");
                }
            }
            exited_tx.send_replace(true);
        });

        info!(
            "drift detector started (interval {}s)",
            self.interval.as_secs()
        );
        *slot = Some(Worker { stop_tx, exited });
    }

    /// Stop the worker and wait for it to exit. Safe to call repeatedly and
    /// concurrently: every caller returns only after the worker is gone.
    pub async fn stop(&self) {
        let mut exited = {
            let slot = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(worker) = slot.as_ref() else {
                return;
            };
            worker.stop_tx.send_replace(true);
            worker.exited.clone()
        };

        // A dropped sender means the task is gone too (it panicked).
        let _ = exited.wait_for(|done| *done).await;

        let mut slot = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        let finished = |worker: &Worker| {
            *worker.exited.borrow() || worker.exited.has_changed().is_err()
        };
        if slot.as_ref().is_some_and(finished) {
            *slot = None;
            info!("drift detector stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Run the pipeline now on the calling thread and return the result.
    pub fn check_now(&self) -> DriftResult {
        self.run_check()
    }

    /// The cached result of the most recent check, if any.
    pub fn last_result(&self) -> Option<DriftResult> {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn run_check(&self) -> DriftResult {
        let _serial = self.check_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let result = match self.source.current_plan() {
            Ok(plan) => DriftResult {
                checked_at: Utc::now(),
                drifted: plan.is_drifted(),
                plan: Some(plan),
                error: None,
                state_path: self.source.state_path(),
            },
            Err(err) => DriftResult {
                checked_at: Utc::now(),
                drifted: false,
                plan: None,
                error: Some(err.to_string()),
                state_path: self.source.state_path(),
            },
        };

        let previous = {
            let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
            let previous = last.as_ref().map(DriftResult::signature);
            *last = Some(result.clone());
            previous
        };

        if previous != Some(result.signature()) {
            match (&result.error, result.drifted) {
                (Some(err), _) => warn!("drift check failed: {err}"),
                (None, true) => warn!(
                    "drift detected against {}",
                    result.state_path.display()
                ),
                (None, false) => info!("drift cleared; live state matches desired state"),
            }
            self.broadcaster.notify_drift(&result);
        } else {
            debug!("drift check complete; no change (drifted={})", result.drifted);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StatekeeperError;
    use crate::plan::{PlanAction, PlanItem, ResourceKind, RiskLevel};
    use std::sync::atomic::AtomicUsize;

    #[derive(Clone, Copy)]
    enum Outcome {
        Clean,
        Drifted,
        Blocked,
        Failing,
    }

    struct ScriptedSource {
        outcome: Mutex<Outcome>,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(outcome: Outcome) -> Arc<Self> {
            Arc::new(Self {
                outcome: Mutex::new(outcome),
                calls: AtomicUsize::new(0),
            })
        }

        fn set(&self, outcome: Outcome) {
            *self.outcome.lock().unwrap() = outcome;
        }
    }

    impl PlanSource for ScriptedSource {
        fn current_plan(&self) -> StatekeeperResult<Plan> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let item = |action| PlanItem::new(ResourceKind::Dataset, "tank/a", action, RiskLevel::Low);
            match *self.outcome.lock().unwrap() {
                Outcome::Clean => Ok(Plan::from_items(vec![item(PlanAction::Nop)])),
                Outcome::Drifted => Ok(Plan::from_items(vec![item(PlanAction::Create)])),
                Outcome::Blocked => Ok(Plan::from_items(vec![item(PlanAction::Blocked)])),
                Outcome::Failing => Err(StatekeeperError::LiveRead {
                    subsystem: "pool",
                    reason: "zpool missing".into(),
                }),
            }
        }

        fn state_path(&self) -> PathBuf {
            PathBuf::from("/etc/statekeeper/state.yaml")
        }
    }

    #[derive(Default)]
    struct Recording {
        levels: Mutex<Vec<DriftLevel>>,
    }

    impl DriftBroadcaster for Recording {
        fn notify_drift(&self, result: &DriftResult) {
            self.levels.lock().unwrap().push(result.level());
        }
    }

    #[test]
    fn notifies_only_on_transitions() {
        let source = ScriptedSource::new(Outcome::Clean);
        let recording = Arc::new(Recording::default());
        let detector = DriftDetector::new(source.clone(), recording.clone(), Duration::from_secs(60));

        assert!(!detector.check_now().drifted);
        source.set(Outcome::Drifted);
        assert!(detector.check_now().drifted);
        detector.check_now();
        source.set(Outcome::Blocked);
        detector.check_now();
        source.set(Outcome::Failing);
        let failed = detector.check_now();
        assert!(failed.error.as_deref().unwrap().contains("zpool missing"));
        source.set(Outcome::Clean);
        detector.check_now();

        assert_eq!(
            *recording.levels.lock().unwrap(),
            vec![
                DriftLevel::Info,
                DriftLevel::Warning,
                DriftLevel::Critical,
                DriftLevel::Warning,
                DriftLevel::Info
            ]
        );
        let last = detector.last_result().unwrap();
        assert!(!last.drifted);
        assert!(last.error.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_checks_immediately_and_stop_is_idempotent() {
        let source = ScriptedSource::new(Outcome::Drifted);
        let detector = Arc::new(DriftDetector::new(
            source.clone(),
            Arc::new(NoopBroadcaster),
            Duration::from_secs(3600),
        ));

        detector.start();
        detector.start();
        assert!(detector.is_running());

        for _ in 0..200 {
            if detector.last_result().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let last = detector.last_result().unwrap();
        assert!(last.drifted);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        detector.stop().await;
        assert!(!detector.is_running());
        detector.stop().await;
    }

    struct SlowSource {
        delay: Duration,
        finished: AtomicUsize,
    }

    impl PlanSource for SlowSource {
        fn current_plan(&self) -> StatekeeperResult<Plan> {
            std::thread::sleep(self.delay);
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(Plan::from_items(Vec::new()))
        }

        fn state_path(&self) -> PathBuf {
            PathBuf::from("/etc/statekeeper/state.yaml")
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_stops_both_wait_for_the_in_flight_check() {
        let source = Arc::new(SlowSource {
            delay: Duration::from_millis(400),
            finished: AtomicUsize::new(0),
        });
        let detector = Arc::new(DriftDetector::new(
            source.clone(),
            Arc::new(NoopBroadcaster),
            Duration::from_secs(3600),
        ));
        detector.start();
        // Let the immediate first check get going.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let first = tokio::spawn({
            let detector = Arc::clone(&detector);
            async move { detector.stop().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        detector.stop().await;
        assert_eq!(source.finished.load(Ordering::SeqCst), 1);

        first.await.unwrap();
        assert!(!detector.is_running());
    }

    #[test]
    fn manual_and_periodic_checks_do_not_interleave() {
        let source = Arc::new(SlowSource {
            delay: Duration::from_millis(50),
            finished: AtomicUsize::new(0),
        });
        let detector = Arc::new(DriftDetector::new(
            source.clone(),
            Arc::new(NoopBroadcaster),
            Duration::from_secs(60),
        ));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let detector = Arc::clone(&detector);
                std::thread::spawn(move || detector.check_now().checked_at)
            })
            .collect();
        let mut stamps: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        stamps.sort();

        assert_eq!(source.finished.load(Ordering::SeqCst), 3);
        assert_eq!(detector.last_result().unwrap().checked_at, stamps[2]);
    }

    #[tokio::test]
    async fn zero_interval_is_clamped() {
        let detector = Arc::new(DriftDetector::new(
            ScriptedSource::new(Outcome::Clean),
            Arc::new(NoopBroadcaster),
            Duration::ZERO,
        ));
        assert_eq!(detector.interval, MIN_INTERVAL);
        detector.start();
        assert!(detector.is_running());
        detector.stop().await;
        assert!(!detector.is_running());
    }

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        let detector = DriftDetector::new(
            ScriptedSource::new(Outcome::Clean),
            Arc::new(NoopBroadcaster),
            Duration::from_secs(1),
        );
        detector.stop().await;
        assert!(!detector.is_running());
        assert!(detector.last_result().is_none());
    }
}

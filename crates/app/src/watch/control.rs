//! Lifecycle control of the pipeline.
//!
//! The control plane owns two locks. `lifecycle` serialises start and stop and
//! records which run is active; `status` holds the value returned by
//! [`ControlPlane::status`] so that readers never wait on a start or stop in
//! progress. When both are needed, `lifecycle` is always taken first.
//!
//! Every run is tagged with a generation. Updates from a run whose generation
//! is no longer current (for example one abandoned after a stop timeout) are
//! discarded.

use std::{
    sync::{
        Arc, Condvar, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use ml_core::Detector;
use tracing::{debug, info, warn};
use video_ingest::{FrameSource, SourceOpener};

use crate::watch::{
    config::PipelineConfig,
    data::{PipelineStatus, StartSummary},
    error::ControlError,
    multiplexer::StreamMultiplexer,
    pipeline::{PipelineEngine, RunOutcome},
    snapshots::SnapshotWriter,
    telemetry,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Phase {
    Idle,
    Running,
    Stopping,
}

struct ActiveRun {
    config: PipelineConfig,
    source: Arc<dyn FrameSource>,
    cancel: Arc<AtomicBool>,
}

struct Lifecycle {
    phase: Phase,
    generation: u64,
    active: Option<ActiveRun>,
}

struct StatusCell {
    generation: u64,
    status: PipelineStatus,
}

struct Shared {
    lifecycle: Mutex<Lifecycle>,
    idle: Condvar,
    status: Mutex<StatusCell>,
}

impl Shared {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        match self.lifecycle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn status(&self) -> MutexGuard<'_, StatusCell> {
        match self.status.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Report the run of `generation` as no longer running.
    ///
    /// Must happen before that run's source is released, so that `status`
    /// never shows a running pipeline on a released source.
    fn mark_stopped(&self, generation: u64, last_error: Option<String>) {
        let mut cell = self.status();
        if cell.generation == generation {
            cell.status.running = false;
            cell.status.source = None;
            if last_error.is_some() {
                cell.status.last_error = last_error;
            }
        }
    }

    /// Commit Idle and release the active source. Caller holds `lifecycle`.
    fn go_idle(&self, lifecycle: &mut Lifecycle, last_error: Option<String>) {
        if let Some(run) = lifecycle.active.as_ref() {
            run.cancel.store(true, Ordering::SeqCst);
        }
        self.mark_stopped(lifecycle.generation, last_error);
        if let Some(run) = lifecycle.active.take() {
            run.source.release();
        }
        lifecycle.phase = Phase::Idle;
        self.idle.notify_all();
    }
}

/// Handle given to the engine of one run.
pub(crate) struct EngineContext {
    shared: Arc<Shared>,
    generation: u64,
    cancel: Arc<AtomicBool>,
}

impl EngineContext {
    /// Run `commit` against the shared status while this run is still current.
    ///
    /// The currency check and `commit` happen under the status lock. Once a
    /// stop has set the cancel flag or the run has been superseded, nothing
    /// `commit` would do (publishing, snapshots, status) happens any more.
    pub(crate) fn commit<R>(&self, commit: impl FnOnce(&mut PipelineStatus) -> R) -> Option<R> {
        let mut cell = self.shared.status();
        if cell.generation != self.generation || self.cancel.load(Ordering::SeqCst) {
            return None;
        }
        Some(commit(&mut cell.status))
    }

    /// Report the end of the run and release `source`.
    pub(crate) fn finish(&self, outcome: &RunOutcome, source: &dyn FrameSource) {
        let mut lifecycle = self.shared.lifecycle();
        if lifecycle.generation != self.generation || lifecycle.phase == Phase::Idle {
            drop(lifecycle);
            source.release();
            debug!(generation = self.generation, "superseded pipeline run exited");
            return;
        }
        self.shared.go_idle(&mut lifecycle, outcome.last_error());
    }
}

pub(crate) struct ControlPlane {
    opener: Arc<dyn SourceOpener>,
    detector: Arc<dyn Detector>,
    multiplexer: Arc<StreamMultiplexer>,
    stop_timeout: Duration,
    shared: Arc<Shared>,
}

impl ControlPlane {
    pub(crate) fn new(
        opener: Arc<dyn SourceOpener>,
        detector: Arc<dyn Detector>,
        multiplexer: Arc<StreamMultiplexer>,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            opener,
            detector,
            multiplexer,
            stop_timeout,
            shared: Arc::new(Shared {
                lifecycle: Mutex::new(Lifecycle {
                    phase: Phase::Idle,
                    generation: 0,
                    active: None,
                }),
                idle: Condvar::new(),
                status: Mutex::new(StatusCell {
                    generation: 0,
                    status: PipelineStatus::default(),
                }),
            }),
        }
    }

    pub(crate) fn multiplexer(&self) -> &Arc<StreamMultiplexer> {
        &self.multiplexer
    }

    /// Open the configured source and launch a run.
    ///
    /// A stop still in flight is waited for, up to the stop timeout. Fails with
    /// [`ControlError::AlreadyRunning`] unless Idle after that. A source that
    /// cannot be opened leaves the pipeline Idle.
    pub(crate) fn start(&self, config: PipelineConfig) -> Result<StartSummary, ControlError> {
        validate(&config)?;
        let lifecycle = self.shared.lifecycle();
        let (mut lifecycle, _) = match self.shared.idle.wait_timeout_while(
            lifecycle,
            self.stop_timeout,
            |state| state.phase == Phase::Stopping,
        ) {
            Ok(result) => result,
            Err(poisoned) => poisoned.into_inner(),
        };
        if lifecycle.phase != Phase::Idle {
            return Err(ControlError::AlreadyRunning);
        }

        let opened_at = Instant::now();
        let source: Arc<dyn FrameSource> = self
            .opener
            .open(&config.source)
            .map(Arc::from)
            .map_err(|err| {
                warn!("failed to open {}: {err}", config.source);
                ControlError::SourceUnavailable {
                    descriptor: config.source.to_string(),
                    reason: err.to_string(),
                }
            })?;
        debug!(elapsed_ms = opened_at.elapsed().as_millis() as u64, "source opened");

        let writer = match SnapshotWriter::spawn(config.output_dir.clone()) {
            Ok(writer) => writer,
            Err(err) => {
                source.release();
                return Err(ControlError::Internal(format!(
                    "failed to spawn snapshot writer: {err}"
                )));
            }
        };

        self.detector.reset();
        let generation = lifecycle.generation + 1;
        let cancel = Arc::new(AtomicBool::new(false));
        {
            let mut cell = self.shared.status();
            cell.generation = generation;
            cell.status = PipelineStatus {
                running: true,
                source: Some(config.source.to_string()),
                ..PipelineStatus::default()
            };
        }

        let engine = PipelineEngine::new(
            config.clone(),
            source.clone(),
            self.detector.clone(),
            self.multiplexer.clone(),
            writer,
            EngineContext {
                shared: self.shared.clone(),
                generation,
                cancel: cancel.clone(),
            },
            cancel.clone(),
        );
        if let Err(err) = telemetry::spawn_thread("watch-pipeline", move || engine.run()) {
            source.release();
            let mut cell = self.shared.status();
            cell.status.running = false;
            cell.status.source = None;
            return Err(ControlError::Internal(format!(
                "failed to spawn pipeline thread: {err}"
            )));
        }

        lifecycle.generation = generation;
        lifecycle.phase = Phase::Running;
        let summary = StartSummary {
            source: config.source.to_string(),
            target_label: config.target_label.clone(),
            threshold: config.confidence_threshold,
            cooldown_secs: config.cooldown.as_secs_f64(),
        };
        lifecycle.active = Some(ActiveRun {
            config,
            source,
            cancel,
        });
        info!(source = %summary.source, generation, "pipeline run started");
        Ok(summary)
    }

    /// Stop the active run, if any, and wait for it to reach Idle.
    ///
    /// Returns `false` when nothing was running. If the run does not wind down
    /// within the stop timeout it is abandoned: the source is released, the
    /// pipeline is reported Idle and any later updates from it are ignored.
    pub(crate) fn stop(&self) -> Result<bool, ControlError> {
        let mut lifecycle = self.shared.lifecycle();
        match lifecycle.phase {
            Phase::Idle => return Ok(false),
            Phase::Running => {
                lifecycle.phase = Phase::Stopping;
                if let Some(run) = lifecycle.active.as_ref() {
                    run.cancel.store(true, Ordering::SeqCst);
                    self.shared.mark_stopped(lifecycle.generation, None);
                    run.source.release();
                }
                info!("stopping pipeline");
            }
            Phase::Stopping => {}
        }

        let generation = lifecycle.generation;
        let (mut lifecycle, _) = match self.shared.idle.wait_timeout_while(
            lifecycle,
            self.stop_timeout,
            |state| state.phase != Phase::Idle && state.generation == generation,
        ) {
            Ok(result) => result,
            Err(poisoned) => poisoned.into_inner(),
        };

        if lifecycle.phase != Phase::Idle && lifecycle.generation == generation {
            warn!(
                "pipeline did not stop within {:?}; abandoning run {generation}",
                self.stop_timeout
            );
            self.shared.go_idle(&mut lifecycle, None);
            lifecycle.generation += 1;
            self.shared.status().generation = lifecycle.generation;
        }
        Ok(true)
    }

    /// Copy of the current status. Never waits on start or stop.
    pub(crate) fn status(&self) -> PipelineStatus {
        self.shared.status().status.clone()
    }

    /// Configuration of the active run.
    pub(crate) fn active_config(&self) -> Result<PipelineConfig, ControlError> {
        self.shared
            .lifecycle()
            .active
            .as_ref()
            .map(|run| run.config.clone())
            .ok_or(ControlError::NotRunning)
    }

    #[cfg(test)]
    pub(crate) fn phase(&self) -> Phase {
        self.shared.lifecycle().phase
    }

    /// Block until Idle or `timeout` elapses; returns whether Idle was reached.
    pub(crate) fn wait_idle(&self, timeout: Duration) -> bool {
        let lifecycle = self.shared.lifecycle();
        let (lifecycle, _) = match self
            .shared
            .idle
            .wait_timeout_while(lifecycle, timeout, |state| state.phase != Phase::Idle)
        {
            Ok(result) => result,
            Err(poisoned) => poisoned.into_inner(),
        };
        lifecycle.phase == Phase::Idle
    }
}

fn validate(config: &PipelineConfig) -> Result<(), ControlError> {
    if !(0.0..=1.0).contains(&config.confidence_threshold) {
        return Err(ControlError::InvalidRequest(format!(
            "confidence threshold {} is outside 0..=1",
            config.confidence_threshold
        )));
    }
    if config.target_label.trim().is_empty() {
        return Err(ControlError::InvalidRequest(
            "target label must not be empty".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            mpsc,
        },
        thread,
    };

    use ml_core::Detection;
    use video_ingest::SourceDescriptor;

    use super::*;
    use crate::watch::{
        alert::AlertState,
        testing::{
            FnOpener, ScriptedDetector, clip_source, failing_opener, live_source, person,
            silent_source, single_source_opener,
        },
    };

    fn mux() -> Arc<StreamMultiplexer> {
        Arc::new(StreamMultiplexer::new(16, Duration::from_secs(10)))
    }

    fn config(dir: &tempfile::TempDir) -> PipelineConfig {
        PipelineConfig {
            source: SourceDescriptor::File {
                path: "sample.mp4".into(),
            },
            output_dir: dir.path().join("Intruder_Logs"),
            ..PipelineConfig::default()
        }
    }

    fn jpeg_count(dir: &std::path::Path) -> usize {
        std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "jpg"))
                    .count()
            })
            .unwrap_or(0)
    }

    #[test]
    fn clip_with_intruder_alerts_and_snapshots_once() {
        let dir = tempfile::tempdir().unwrap();
        let (source, releases) = clip_source(10, Duration::from_millis(10));
        let mux = mux();
        let subscription = mux.subscribe();
        let detector = Arc::new(ScriptedDetector::new(|sequence| {
            Ok(if (3..=5).contains(&sequence) {
                vec![person(0.91)]
            } else {
                Vec::new()
            })
        }));
        let control = ControlPlane::new(
            single_source_opener(source),
            detector.clone(),
            mux,
            Duration::from_secs(2),
        );

        let summary = control.start(config(&dir)).unwrap();
        assert_eq!(summary.source, "sample.mp4");
        assert_eq!(summary.target_label, "person");
        assert!(control.wait_idle(Duration::from_secs(5)));

        let alerts: Vec<(u64, AlertState)> = std::iter::from_fn(|| subscription.try_recv())
            .map(|packet| (packet.frame_number, packet.alert))
            .collect();
        let expected: Vec<(u64, AlertState)> = (1..=10)
            .map(|n| {
                let state = if (3..=5).contains(&n) {
                    AlertState::Alert
                } else {
                    AlertState::Monitoring
                };
                (n, state)
            })
            .collect();
        assert_eq!(alerts, expected);

        assert_eq!(jpeg_count(&dir.path().join("Intruder_Logs")), 1);
        let status = control.status();
        assert!(!status.running);
        assert_eq!(status.snapshots_taken, 1);
        assert_eq!(status.last_snapshot.as_ref().unwrap().confidence, 0.91);
        assert_eq!(status.alert, AlertState::Monitoring);
        assert_eq!(status.last_error.as_deref(), Some("video source ended"));
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert_eq!(detector.resets(), 1);
    }

    #[test]
    fn second_start_is_rejected_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let (source, _releases) = live_source(Duration::from_millis(10));
        let control = ControlPlane::new(
            single_source_opener(source),
            Arc::new(ScriptedDetector::quiet()),
            mux(),
            Duration::from_secs(2),
        );

        control.start(config(&dir)).unwrap();
        assert!(matches!(
            control.start(config(&dir)),
            Err(ControlError::AlreadyRunning)
        ));
        assert!(control.status().running);
        assert_eq!(
            control.active_config().unwrap().source,
            config(&dir).source
        );
        assert!(control.stop().unwrap());
        assert!(!control.status().running);
    }

    #[test]
    fn unavailable_source_leaves_pipeline_idle() {
        let dir = tempfile::tempdir().unwrap();
        let control = ControlPlane::new(
            failing_opener(),
            Arc::new(ScriptedDetector::quiet()),
            mux(),
            Duration::from_secs(2),
        );

        let err = control.start(config(&dir)).unwrap_err();
        assert!(matches!(err, ControlError::SourceUnavailable { .. }));
        assert_eq!(control.phase(), Phase::Idle);
        assert!(!control.status().running);
        assert!(matches!(
            control.active_config(),
            Err(ControlError::NotRunning)
        ));
    }

    #[test]
    fn stop_is_idempotent() {
        let control = ControlPlane::new(
            failing_opener(),
            Arc::new(ScriptedDetector::quiet()),
            mux(),
            Duration::from_secs(2),
        );
        assert!(!control.stop().unwrap());
        assert!(!control.stop().unwrap());
    }

    #[test]
    fn stop_interrupts_blocked_read() {
        let dir = tempfile::tempdir().unwrap();
        let (source, releases) = silent_source(Duration::from_secs(30));
        let control = ControlPlane::new(
            single_source_opener(source),
            Arc::new(ScriptedDetector::quiet()),
            mux(),
            Duration::from_secs(5),
        );
        control.start(config(&dir)).unwrap();
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        assert!(control.stop().unwrap());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(control.phase(), Phase::Idle);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert_eq!(control.status().last_error, None);
    }

    #[test]
    fn stalled_run_is_abandoned_and_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate_rx = Mutex::new(gate_rx);
        let blocked_once = AtomicBool::new(false);
        let detector = ScriptedDetector::new(move |_| {
            if !blocked_once.swap(true, Ordering::SeqCst) {
                let _ = gate_rx.lock().unwrap().recv();
            }
            Ok(Vec::<Detection>::new())
        });

        let opened = Arc::new(AtomicUsize::new(0));
        let opened_counter = opened.clone();
        let opener = FnOpener::new(move |_| {
            opened_counter.fetch_add(1, Ordering::SeqCst);
            let (source, _) = live_source(Duration::from_millis(10));
            Ok(Box::new(source) as Box<dyn FrameSource>)
        });
        let control = ControlPlane::new(
            Arc::new(opener),
            Arc::new(detector),
            mux(),
            Duration::from_millis(100),
        );

        control.start(config(&dir)).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(control.stop().unwrap());
        assert_eq!(control.phase(), Phase::Idle);
        assert!(!control.status().running);

        control.start(config(&dir)).unwrap();
        gate_tx.send(()).unwrap();
        thread::sleep(Duration::from_millis(100));

        let status = control.status();
        assert!(status.running);
        assert_eq!(control.phase(), Phase::Running);
        assert_eq!(opened.load(Ordering::SeqCst), 2);
        assert!(control.stop().unwrap());
    }

    #[test]
    fn abandoned_run_neither_publishes_nor_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate_rx = Mutex::new(gate_rx);
        let detector = ScriptedDetector::new(move |sequence| {
            if sequence == 1 {
                let _ = gate_rx.lock().unwrap().recv();
            }
            Ok(vec![person(0.9)])
        });
        let (source, _releases) = live_source(Duration::from_millis(10));
        let mux = mux();
        let subscription = mux.subscribe();
        let control = ControlPlane::new(
            single_source_opener(source),
            Arc::new(detector),
            mux,
            Duration::from_millis(100),
        );

        control.start(config(&dir)).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(control.stop().unwrap());
        assert_eq!(control.phase(), Phase::Idle);

        gate_tx.send(()).unwrap();
        thread::sleep(Duration::from_millis(150));

        assert!(subscription.try_recv().is_none());
        assert_eq!(jpeg_count(&dir.path().join("Intruder_Logs")), 0);
        let status = control.status();
        assert!(!status.running);
        assert_eq!(status.frames_processed, 0);
        assert_eq!(status.snapshots_taken, 0);
        assert_eq!(status.alert, AlertState::Monitoring);
    }

    #[test]
    fn status_never_reports_running_on_a_released_source() {
        let dir = tempfile::tempdir().unwrap();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate_rx = Mutex::new(gate_rx);
        let detector = ScriptedDetector::new(move |sequence| {
            if sequence == 3 {
                let _ = gate_rx.lock().unwrap().recv();
            }
            Ok(Vec::<Detection>::new())
        });
        let (source, releases) = live_source(Duration::from_millis(10));
        let control = Arc::new(ControlPlane::new(
            single_source_opener(source),
            Arc::new(detector),
            mux(),
            Duration::from_millis(300),
        ));

        control.start(config(&dir)).unwrap();
        thread::sleep(Duration::from_millis(100));
        assert!(control.status().running);

        let stopper = {
            let control = control.clone();
            thread::spawn(move || control.stop().unwrap())
        };
        let mut saw_release = false;
        while !stopper.is_finished() {
            let released = releases.load(Ordering::SeqCst) > 0;
            let status = control.status();
            if released {
                saw_release = true;
                assert!(!status.running, "running after release: {status:?}");
                assert_eq!(status.source, None);
            }
        }
        assert!(stopper.join().unwrap());
        gate_tx.send(()).unwrap();

        assert!(saw_release);
        assert_eq!(control.phase(), Phase::Idle);
        assert!(!control.status().running);
    }

    #[test]
    fn status_fields_change_together() {
        let dir = tempfile::tempdir().unwrap();
        let (source, _releases) = live_source(Duration::from_millis(5));
        let detector = ScriptedDetector::new(|sequence| {
            Ok(if sequence % 2 == 0 {
                vec![person(0.9)]
            } else {
                Vec::new()
            })
        });
        let control = Arc::new(ControlPlane::new(
            single_source_opener(source),
            Arc::new(detector),
            mux(),
            Duration::from_secs(2),
        ));

        let done = Arc::new(AtomicBool::new(false));
        let reader = {
            let control = control.clone();
            let done = done.clone();
            thread::spawn(move || {
                let mut observed = 0usize;
                while !done.load(Ordering::SeqCst) {
                    let status = control.status();
                    let frames = status.frames_processed;
                    if frames == 0 {
                        continue;
                    }
                    observed += 1;
                    assert_eq!(status.alert.is_alert(), frames % 2 == 0, "{status:?}");
                    if frames == 1 {
                        assert_eq!(status.fps, 0.0, "{status:?}");
                    } else {
                        assert!(status.fps > 0.0, "{status:?}");
                    }
                }
                observed
            })
        };

        control.start(config(&dir)).unwrap();
        thread::sleep(Duration::from_millis(200));
        assert!(control.stop().unwrap());
        thread::sleep(Duration::from_millis(20));
        done.store(true, Ordering::SeqCst);

        assert!(reader.join().unwrap() > 0);
        assert!(control.status().frames_processed >= 2);
    }

    #[test]
    fn rejects_invalid_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let control = ControlPlane::new(
            failing_opener(),
            Arc::new(ScriptedDetector::quiet()),
            mux(),
            Duration::from_secs(2),
        );
        let bad = PipelineConfig {
            confidence_threshold: 2.0,
            ..config(&dir)
        };
        assert!(matches!(
            control.start(bad),
            Err(ControlError::InvalidRequest(_))
        ));
    }

    #[test]
    fn concurrent_starts_admit_exactly_one() {
        let dir = tempfile::tempdir().unwrap();
        let opener = FnOpener::new(|_| {
            let (source, _) = live_source(Duration::from_millis(10));
            Ok(Box::new(source) as Box<dyn FrameSource>)
        });
        let control = Arc::new(ControlPlane::new(
            Arc::new(opener),
            Arc::new(ScriptedDetector::quiet()),
            mux(),
            Duration::from_secs(2),
        ));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let control = control.clone();
                let config = config(&dir);
                thread::spawn(move || control.start(config).is_ok())
            })
            .collect();
        let started = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(started, 1);
        assert!(control.stop().unwrap());
    }
}

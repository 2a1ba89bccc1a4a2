//! The per-frame processing loop of one pipeline run.
//!
//! Each iteration reads a frame, runs the detector, classifies the frame,
//! and draws the overlay before encoding it. The snapshot hand-off, the
//! publish and the status update are then committed together, and only while
//! the run is still current. The loop owns the source for the whole run; the
//! control plane releases it when the run ends.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Instant,
};

use actix_web::web::Bytes;
use chrono::Local;
use ml_core::Detector;
use tracing::{debug, error, info, info_span, warn};
use video_ingest::{CaptureError, Frame, FrameSource};

use crate::watch::{
    alert::{AlertRule, AlertState, state_for},
    annotation::{Overlay, annotate_frame, encode_jpeg, plain_frame},
    config::PipelineConfig,
    control::EngineContext,
    data::FramePacket,
    multiplexer::StreamMultiplexer,
    snapshots::SnapshotWriter,
    throttle::SnapshotThrottler,
};

/// Why a run ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum RunOutcome {
    /// Stop was requested or the source was released externally.
    Stopped,
    EndOfStream,
    Failed(String),
}

impl RunOutcome {
    pub(crate) fn last_error(&self) -> Option<String> {
        match self {
            RunOutcome::Stopped => None,
            RunOutcome::EndOfStream => Some("video source ended".to_string()),
            RunOutcome::Failed(reason) => Some(format!("video source failed: {reason}")),
        }
    }
}

pub(crate) struct PipelineEngine {
    config: PipelineConfig,
    source: Arc<dyn FrameSource>,
    detector: Arc<dyn Detector>,
    multiplexer: Arc<StreamMultiplexer>,
    rule: AlertRule,
    throttle: SnapshotThrottler,
    writer: SnapshotWriter,
    context: EngineContext,
    cancel: Arc<AtomicBool>,
    alert: AlertState,
}

impl PipelineEngine {
    pub(crate) fn new(
        config: PipelineConfig,
        source: Arc<dyn FrameSource>,
        detector: Arc<dyn Detector>,
        multiplexer: Arc<StreamMultiplexer>,
        writer: SnapshotWriter,
        context: EngineContext,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        let rule = AlertRule::new(config.target_label.clone(), config.confidence_threshold);
        let throttle = SnapshotThrottler::new(config.cooldown);
        Self {
            config,
            source,
            detector,
            multiplexer,
            rule,
            throttle,
            writer,
            context,
            cancel,
            alert: AlertState::Monitoring,
        }
    }

    /// Run until stopped or the source gives out, then hand control back.
    pub(crate) fn run(mut self) {
        let span = info_span!(
            "watch.pipeline",
            source = %self.config.source,
            target = %self.config.target_label,
            threshold = self.config.confidence_threshold,
            detector = self.detector.name(),
        );
        let _span_guard = span.enter();
        info!("pipeline started");

        let outcome = self.run_loop();
        match &outcome {
            RunOutcome::Stopped => info!("pipeline stopped"),
            RunOutcome::EndOfStream => info!("video source ended"),
            RunOutcome::Failed(reason) => error!("pipeline aborted: {reason}"),
        }

        self.writer.finish();
        self.context.finish(&outcome, self.source.as_ref());
    }

    fn run_loop(&mut self) -> RunOutcome {
        let mut last_frame_at: Option<Instant> = None;
        let mut consecutive_failures: u32 = 0;

        loop {
            if self.cancel.load(Ordering::SeqCst) {
                return RunOutcome::Stopped;
            }

            let read_started = Instant::now();
            let frame = match info_span!("capture.read").in_scope(|| self.source.read()) {
                Ok(frame) => {
                    consecutive_failures = 0;
                    frame
                }
                Err(_) if self.cancel.load(Ordering::SeqCst) => return RunOutcome::Stopped,
                Err(CaptureError::Released) => return RunOutcome::Stopped,
                Err(CaptureError::EndOfStream) => return RunOutcome::EndOfStream,
                Err(err) if err.is_transient() => {
                    consecutive_failures += 1;
                    metrics::counter!("watch_read_errors_total").increment(1);
                    if consecutive_failures > self.config.max_read_failures {
                        return RunOutcome::Failed(format!(
                            "{consecutive_failures} consecutive read failures, last: {err}"
                        ));
                    }
                    warn!("frame read failed ({consecutive_failures} in a row): {err}");
                    thread::sleep(self.config.read_backoff);
                    continue;
                }
                Err(err) => return RunOutcome::Failed(err.to_string()),
            };
            metrics::histogram!("watch_stage_latency_seconds", "stage" => "capture")
                .record(read_started.elapsed().as_secs_f64());

            let now = Instant::now();
            let fps = last_frame_at
                .map(|previous| {
                    let elapsed = now.duration_since(previous).as_secs_f32();
                    if elapsed > 0.0 { 1.0 / elapsed } else { 0.0 }
                })
                .unwrap_or(0.0);
            last_frame_at = Some(now);
            metrics::gauge!("watch_pipeline_fps").set(fps as f64);

            self.process_frame(frame, fps);
        }
    }

    fn process_frame(&mut self, frame: Frame, fps: f32) {
        let frame_span = info_span!("frame", frame = frame.sequence, fps);
        let _frame_guard = frame_span.enter();
        let frame_started = Instant::now();
        metrics::counter!("watch_frames_total").increment(1);

        let mut frame_error: Option<String> = None;
        let detect_started = Instant::now();
        let detections = info_span!("detect").in_scope(|| self.detector.detect(&frame));
        metrics::histogram!("watch_stage_latency_seconds", "stage" => "detect")
            .record(detect_started.elapsed().as_secs_f64());

        let annotate_started = Instant::now();
        let rendered = match detections {
            Ok(detections) => {
                let qualifying = self.rule.qualifying(&detections);
                let alert = state_for(&qualifying);
                let top_confidence = qualifying
                    .iter()
                    .map(|det| det.confidence)
                    .fold(0.0_f32, f32::max);
                debug!(
                    detections = detections.len(),
                    qualifying = qualifying.len(),
                    "frame classified"
                );
                info_span!("annotate")
                    .in_scope(|| {
                        annotate_frame(
                            &frame,
                            &Overlay {
                                detections: &qualifying,
                                alert,
                                fps,
                            },
                        )
                    })
                    .map(|image| (image, alert, top_confidence, true))
            }
            Err(err) => {
                metrics::counter!("watch_detection_errors_total").increment(1);
                warn!("detection failed on frame #{}: {err}", frame.sequence);
                frame_error = Some(format!("detection failed: {err}"));
                plain_frame(&frame).map(|image| (image, self.alert, 0.0, false))
            }
        };
        let (image, alert, top_confidence, annotated) = match rendered {
            Ok(rendered) => rendered,
            Err(err) => {
                self.skip_frame(format!("frame #{} dropped: {err}", frame.sequence));
                return;
            }
        };

        let jpeg = match info_span!("encode")
            .in_scope(|| encode_jpeg(&image, self.config.jpeg_quality))
        {
            Ok(jpeg) => Bytes::from(jpeg),
            Err(err) => {
                self.skip_frame(format!("frame #{} dropped: {err}", frame.sequence));
                return;
            }
        };
        metrics::histogram!("watch_stage_latency_seconds", "stage" => "render")
            .record(annotate_started.elapsed().as_secs_f64());

        if alert != self.alert {
            match alert {
                AlertState::Alert => warn!(
                    confidence = top_confidence,
                    "intruder detected ({} above {:.2})",
                    self.config.target_label,
                    self.config.confidence_threshold
                ),
                AlertState::Monitoring => info!("alert cleared"),
            }
            self.alert = alert;
        }
        if alert.is_alert() {
            metrics::counter!("watch_alert_frames_total").increment(1);
        }

        let committed = self.context.commit(|status| {
            if annotated && self.throttle.try_admit(alert, Instant::now()) {
                match self.writer.submit(jpeg.clone(), top_confidence, Local::now()) {
                    Ok(record) => {
                        debug!(file = %record.filename, "snapshot queued");
                        status.snapshots_taken += 1;
                        status.last_snapshot = Some(record);
                    }
                    Err(err) => {
                        error!("{err}");
                        frame_error = Some(err.to_string());
                    }
                }
            }

            let packet = Arc::new(FramePacket {
                jpeg,
                frame_number: frame.sequence,
                timestamp_ms: frame.timestamp_ms,
                fps,
                alert,
                annotated,
            });
            let publish_started = Instant::now();
            let delivered = info_span!("publish").in_scope(|| self.multiplexer.publish(packet));
            metrics::histogram!("watch_stage_latency_seconds", "stage" => "publish")
                .record(publish_started.elapsed().as_secs_f64());

            status.alert = alert;
            status.fps = fps;
            status.frames_processed += 1;
            if let Some(err) = frame_error {
                status.last_error = Some(err);
            }
            delivered
        });
        match committed {
            Some(delivered) => debug!(subscribers = delivered, "frame published"),
            None => debug!("run no longer current; frame discarded"),
        }
        metrics::histogram!("watch_stage_latency_seconds", "stage" => "total")
            .record(frame_started.elapsed().as_secs_f64());
    }

    fn skip_frame(&self, message: String) {
        warn!("{message}");
        self.context.commit(|status| status.last_error = Some(message));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::watch::{
        control::ControlPlane,
        testing::{ScriptedDetector, clip_source, person, single_source_opener},
    };

    fn config(output_dir: &std::path::Path) -> PipelineConfig {
        PipelineConfig {
            output_dir: output_dir.to_path_buf(),
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn detection_errors_keep_previous_alert_and_publish_plain_frames() {
        let dir = tempfile::tempdir().unwrap();
        let (source, _releases) = clip_source(4, Duration::from_millis(5));
        let detector = ScriptedDetector::new(|sequence| match sequence {
            2 => Ok(vec![person(0.9)]),
            3 => Err(ml_core::DetectionError::InvalidFrame("corrupt".into())),
            _ => Ok(Vec::new()),
        });
        let mux = Arc::new(StreamMultiplexer::new(16, Duration::from_secs(10)));
        let subscription = mux.subscribe();
        let control = ControlPlane::new(
            single_source_opener(source),
            Arc::new(detector),
            mux.clone(),
            Duration::from_secs(2),
        );

        control.start(config(dir.path())).unwrap();
        assert!(control.wait_idle(Duration::from_secs(5)));

        let packets: Vec<_> = std::iter::from_fn(|| subscription.try_recv()).collect();
        let states: Vec<_> = packets
            .iter()
            .map(|p| (p.frame_number, p.alert, p.annotated))
            .collect();
        assert_eq!(
            states,
            vec![
                (1, AlertState::Monitoring, true),
                (2, AlertState::Alert, true),
                (3, AlertState::Alert, false),
                (4, AlertState::Monitoring, true),
            ]
        );
        let status = control.status();
        assert_eq!(status.frames_processed, 4);
        assert_eq!(status.last_error.as_deref(), Some("video source ended"));
    }

    #[test]
    fn outcome_messages() {
        assert_eq!(RunOutcome::Stopped.last_error(), None);
        assert_eq!(
            RunOutcome::EndOfStream.last_error().as_deref(),
            Some("video source ended")
        );
        assert!(
            RunOutcome::Failed("boom".into())
                .last_error()
                .unwrap()
                .contains("boom")
        );
    }
}

//! Intruder watch service: capture, detect, alert, snapshot and stream.
//!
//! The module is split into focused submodules:
//! - `config`: CLI configuration parsing and per-run settings.
//! - `control`: Start/stop/status state machine around pipeline runs.
//! - `pipeline`: The per-frame capture → detect → annotate → publish loop.
//! - `alert` / `throttle`: Frame classification and snapshot rate limiting.
//! - `snapshots`: Background snapshot writer and snapshot directory lookups.
//! - `multiplexer`: Per-subscriber latest-wins fan-out of encoded frames.
//! - `annotation`: Drawing primitives and JPEG encoding.
//! - `server` / `monitor`: HTTP and terminal front ends.
//! - `preview`: Optional local window for the terminal front end.
//! - `telemetry`: Tracing subscriber, Prometheus recorder, thread spawning.

use std::sync::Arc;

use anyhow::Result;
use ml_core::{Detector, MotionDetector};
use tracing::info;
use video_ingest::SourceOpener;

pub(crate) use config::{PipelineArgs, WatchSettings};

mod alert;
mod annotation;
mod config;
mod control;
mod data;
mod error;
pub(crate) mod monitor;
mod multiplexer;
mod pipeline;
mod preview;
pub(crate) mod server;
mod snapshots;
pub(crate) mod telemetry;
mod throttle;

#[cfg(test)]
mod testing;

use config::DetectorChoice;
use control::ControlPlane;
use multiplexer::StreamMultiplexer;

/// Build the control plane with the capture backend and detector selected by `settings`.
pub(crate) fn build_control(settings: &WatchSettings) -> Result<Arc<ControlPlane>> {
    let detector = build_detector(&settings.detector)?;
    let multiplexer = Arc::new(StreamMultiplexer::new(
        settings.stream.queue_capacity,
        settings.stream.liveness_window,
    ));
    info!(
        detector = detector.name(),
        target = %settings.pipeline.target_label,
        threshold = settings.pipeline.confidence_threshold,
        "watch service configured"
    );
    Ok(Arc::new(ControlPlane::new(
        build_opener(settings),
        detector,
        multiplexer,
        settings.stop_timeout,
    )))
}

#[cfg(not(feature = "opencv"))]
fn build_opener(settings: &WatchSettings) -> Arc<dyn SourceOpener> {
    Arc::new(video_ingest::FfmpegOpener::new(settings.capture.clone()))
}

#[cfg(feature = "opencv")]
fn build_opener(settings: &WatchSettings) -> Arc<dyn SourceOpener> {
    Arc::new(video_ingest::OpencvOpener {
        target_size: (settings.capture.width, settings.capture.height),
        read_timeout: settings.capture.read_timeout,
        open_timeout: settings.capture.open_timeout,
    })
}

fn build_detector(choice: &DetectorChoice) -> Result<Arc<dyn Detector>> {
    match choice {
        DetectorChoice::Motion => Ok(Arc::new(MotionDetector::default())),
        DetectorChoice::Torch { model_path } => load_torch_detector(model_path),
    }
}

#[cfg(feature = "with-tch")]
fn load_torch_detector(model_path: &std::path::Path) -> Result<Arc<dyn Detector>> {
    use anyhow::Context;
    use ml_core::{detector::TorchDetector, tch::Device};

    let device = Device::cuda_if_available();
    let detector = TorchDetector::new(model_path, device, (640, 640))
        .with_context(|| format!("failed to load model {}", model_path.display()))?;
    info!("loaded TorchScript detector on {device:?}");
    Ok(Arc::new(detector))
}

#[cfg(not(feature = "with-tch"))]
fn load_torch_detector(_model_path: &std::path::Path) -> Result<Arc<dyn Detector>> {
    anyhow::bail!("the torch detector requires building with `--features with-tch`")
}

//! Configuration for the watch service.
//!
//! CLI flags are parsed by clap into [`PipelineArgs`] and validated once into
//! [`WatchSettings`]. Each `/start` request derives a fresh [`PipelineConfig`]
//! from those settings.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Result, anyhow, bail};
use clap::{Args, ValueEnum};
use ml_core::MOTION_LABEL;
use video_ingest::{FfmpegConfig, SourceDescriptor};

use crate::watch::{error::ControlError, snapshots::is_plain_file_name};

/// Default directory snapshots are written to.
pub(crate) const DEFAULT_SNAPSHOT_DIR: &str = "Intruder_Logs";
/// Directory `/start` resolves video file names in.
pub(crate) const DEFAULT_MEDIA_DIR: &str = "Demo Video";
/// Extensions listed by `/videos`.
pub(crate) const VIDEO_EXTENSIONS: [&str; 4] = ["mp4", "avi", "mov", "mkv"];

/// Immutable settings of a single pipeline run.
#[derive(Clone, Debug)]
pub(crate) struct PipelineConfig {
    pub(crate) source: SourceDescriptor,
    /// Minimum confidence a detection must exceed to count toward an alert.
    pub(crate) confidence_threshold: f32,
    pub(crate) target_label: String,
    /// Minimum spacing between two persisted snapshots.
    pub(crate) cooldown: Duration,
    pub(crate) output_dir: PathBuf,
    pub(crate) jpeg_quality: u8,
    /// Consecutive transient read failures tolerated before the run ends.
    pub(crate) max_read_failures: u32,
    pub(crate) read_backoff: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source: SourceDescriptor::Camera { index: 0 },
            confidence_threshold: 0.5,
            target_label: "person".to_string(),
            cooldown: Duration::from_secs(5),
            output_dir: PathBuf::from(DEFAULT_SNAPSHOT_DIR),
            jpeg_quality: 85,
            max_read_failures: 50,
            read_backoff: Duration::from_millis(100),
        }
    }
}

impl PipelineConfig {
    /// Copy of this configuration reading from `source`.
    pub(crate) fn with_source(&self, source: SourceDescriptor) -> Self {
        Self {
            source,
            ..self.clone()
        }
    }
}

/// Live stream fan-out knobs.
#[derive(Clone, Debug)]
pub(crate) struct StreamOptions {
    /// Packets buffered per subscriber; the oldest is dropped when full.
    pub(crate) queue_capacity: usize,
    /// How long a subscriber may leave a packet unread before eviction.
    pub(crate) liveness_window: Duration,
    /// Placeholder frame interval while no pipeline is running.
    pub(crate) idle_interval: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 2,
            liveness_window: Duration::from_secs(10),
            idle_interval: Duration::from_millis(100),
        }
    }
}

/// Optional telemetry knobs for tracing output.
#[derive(Clone, Debug, Default)]
pub(crate) struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub(crate) chrome_trace_path: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub(crate) enum DetectorKind {
    /// Background-subtraction motion detector.
    #[default]
    Motion,
    /// TorchScript YOLO export (requires the `with-tch` feature).
    Torch,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum DetectorChoice {
    Motion,
    Torch { model_path: PathBuf },
}

/// Everything the front ends need to build and drive the service.
#[derive(Clone, Debug)]
pub(crate) struct WatchSettings {
    /// Template for each run; the source is replaced per request.
    pub(crate) pipeline: PipelineConfig,
    pub(crate) camera_index: u32,
    pub(crate) media_dir: PathBuf,
    pub(crate) capture: FfmpegConfig,
    pub(crate) detector: DetectorChoice,
    pub(crate) stream: StreamOptions,
    pub(crate) stop_timeout: Duration,
    pub(crate) telemetry: TelemetryOptions,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            camera_index: 0,
            media_dir: PathBuf::from(DEFAULT_MEDIA_DIR),
            capture: FfmpegConfig::default(),
            detector: DetectorChoice::Motion,
            stream: StreamOptions::default(),
            stop_timeout: Duration::from_secs(5),
            telemetry: TelemetryOptions::default(),
        }
    }
}

impl WatchSettings {
    /// Resolve a `/start` request into a source descriptor.
    ///
    /// `kind` defaults to the camera. Videos must be named, by a plain file
    /// name resolved inside the media directory.
    pub(crate) fn resolve_source(
        &self,
        kind: Option<&str>,
        video_name: Option<&str>,
        camera_index: Option<u32>,
    ) -> Result<SourceDescriptor, ControlError> {
        match kind.unwrap_or("camera") {
            "camera" => Ok(SourceDescriptor::Camera {
                index: camera_index.unwrap_or(self.camera_index),
            }),
            "video" => {
                let Some(name) = video_name else {
                    return Err(ControlError::InvalidRequest(
                        "video_path is required when source is \"video\"".into(),
                    ));
                };
                if !is_plain_file_name(name) {
                    return Err(ControlError::InvalidRequest(format!(
                        "video_path must be a file name inside the media directory, got {name:?}"
                    )));
                }
                Ok(SourceDescriptor::File {
                    path: self.media_dir.join(name),
                })
            }
            other => Err(ControlError::InvalidRequest(format!(
                "unknown source {other:?}; expected \"camera\" or \"video\""
            ))),
        }
    }

    /// Playable files in the media directory, sorted by name.
    pub(crate) fn list_videos(&self) -> std::io::Result<Vec<String>> {
        list_videos_in(&self.media_dir)
    }
}

fn list_videos_in(dir: &Path) -> std::io::Result<Vec<String>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    let mut videos = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let playable = Path::new(&name)
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| VIDEO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
        if playable {
            videos.push(name);
        }
    }
    videos.sort();
    Ok(videos)
}

/// Pipeline flags shared by the `serve` and `run` subcommands.
#[derive(Debug, Default, Args)]
pub(crate) struct PipelineArgs {
    /// Camera device index used when the camera source is selected.
    #[arg(long = "camera-index", value_name = "N")]
    pub(crate) camera_index: Option<u32>,
    /// Capture width in pixels.
    #[arg(long = "width", value_name = "PX")]
    pub(crate) width: Option<i32>,
    /// Capture height in pixels.
    #[arg(long = "height", value_name = "PX")]
    pub(crate) height: Option<i32>,
    /// Confidence a detection must exceed to raise the alert (0-1).
    #[arg(long = "threshold", value_name = "CONF")]
    pub(crate) threshold: Option<f32>,
    /// Detection label that counts as an intruder.
    #[arg(long = "target-label", value_name = "LABEL")]
    pub(crate) target_label: Option<String>,
    /// Minimum seconds between two snapshots.
    #[arg(long = "cooldown-secs", value_name = "SECS")]
    pub(crate) cooldown_secs: Option<f64>,
    /// Directory snapshots are written to.
    #[arg(long = "snapshot-dir", value_name = "DIR")]
    pub(crate) snapshot_dir: Option<PathBuf>,
    /// Directory video files are served from.
    #[arg(long = "media-dir", value_name = "DIR")]
    pub(crate) media_dir: Option<PathBuf>,
    /// JPEG quality used for stream frames and snapshots (1-100).
    #[arg(long = "jpeg-quality", value_name = "QUALITY")]
    pub(crate) jpeg_quality: Option<u8>,
    /// Per-frame read deadline in milliseconds.
    #[arg(long = "read-timeout-ms", value_name = "MS")]
    pub(crate) read_timeout_ms: Option<u64>,
    /// Bound on how long `stop` waits for the pipeline to wind down.
    #[arg(long = "stop-timeout-ms", value_name = "MS")]
    pub(crate) stop_timeout_ms: Option<u64>,
    /// Packets buffered per stream subscriber.
    #[arg(long = "stream-queue", value_name = "N")]
    pub(crate) stream_queue: Option<usize>,
    /// Seconds a stream subscriber may stall before it is evicted.
    #[arg(long = "liveness-secs", value_name = "SECS")]
    pub(crate) liveness_secs: Option<u64>,
    /// ffmpeg binary used for decoding.
    #[arg(long = "ffmpeg", value_name = "PATH")]
    pub(crate) ffmpeg: Option<PathBuf>,
    /// Detector backend.
    #[arg(long = "detector", value_enum, default_value_t = DetectorKind::Motion)]
    pub(crate) detector: DetectorKind,
    /// TorchScript model path (torch detector only).
    #[arg(long = "model", value_name = "PATH")]
    pub(crate) model: Option<PathBuf>,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub(crate) chrome_trace: Option<PathBuf>,
}

impl TryFrom<PipelineArgs> for WatchSettings {
    type Error = anyhow::Error;

    fn try_from(args: PipelineArgs) -> Result<Self> {
        let defaults = WatchSettings::default();

        let width = args.width.unwrap_or(defaults.capture.width);
        let height = args.height.unwrap_or(defaults.capture.height);
        if width <= 0 || height <= 0 {
            bail!("Capture width and height must be positive integers");
        }

        let confidence_threshold = args
            .threshold
            .unwrap_or(defaults.pipeline.confidence_threshold);
        if !(0.0..=1.0).contains(&confidence_threshold) {
            bail!("--threshold must be between 0 and 1");
        }

        let target_label = args.target_label.unwrap_or_else(|| match args.detector {
            DetectorKind::Motion => MOTION_LABEL.to_string(),
            DetectorKind::Torch => defaults.pipeline.target_label.clone(),
        });
        if target_label.trim().is_empty() {
            bail!("--target-label must not be empty");
        }

        let cooldown = match args.cooldown_secs {
            Some(secs) if secs.is_finite() && secs >= 0.0 => Duration::from_secs_f64(secs),
            Some(_) => bail!("--cooldown-secs must be a non-negative number"),
            None => defaults.pipeline.cooldown,
        };

        let jpeg_quality = args.jpeg_quality.unwrap_or(defaults.pipeline.jpeg_quality);
        if !(1..=100).contains(&jpeg_quality) {
            bail!("--jpeg-quality must be an integer between 1 and 100");
        }

        let read_timeout = match args.read_timeout_ms {
            Some(0) => bail!("--read-timeout-ms must be at least 1"),
            Some(ms) => Duration::from_millis(ms),
            None => defaults.capture.read_timeout,
        };

        let stop_timeout = match args.stop_timeout_ms {
            Some(0) => bail!("--stop-timeout-ms must be at least 1"),
            Some(ms) => Duration::from_millis(ms),
            None => defaults.stop_timeout,
        };

        let queue_capacity = args.stream_queue.unwrap_or(defaults.stream.queue_capacity);
        if queue_capacity == 0 {
            bail!("--stream-queue must be at least 1");
        }

        let liveness_window = match args.liveness_secs {
            Some(0) => bail!("--liveness-secs must be at least 1"),
            Some(secs) => Duration::from_secs(secs),
            None => defaults.stream.liveness_window,
        };

        let detector = match args.detector {
            DetectorKind::Motion => {
                if args.model.is_some() {
                    bail!("--model is only used with --detector torch");
                }
                DetectorChoice::Motion
            }
            DetectorKind::Torch => DetectorChoice::Torch {
                model_path: args
                    .model
                    .ok_or_else(|| anyhow!("--detector torch requires --model <path>"))?,
            },
        };

        let capture = FfmpegConfig {
            binary: args.ffmpeg.unwrap_or(defaults.capture.binary),
            width,
            height,
            read_timeout,
            ..defaults.capture
        };

        Ok(Self {
            pipeline: PipelineConfig {
                confidence_threshold,
                target_label,
                cooldown,
                output_dir: args
                    .snapshot_dir
                    .unwrap_or(defaults.pipeline.output_dir),
                jpeg_quality,
                ..defaults.pipeline
            },
            camera_index: args.camera_index.unwrap_or(defaults.camera_index),
            media_dir: args.media_dir.unwrap_or(defaults.media_dir),
            capture,
            detector,
            stream: StreamOptions {
                queue_capacity,
                liveness_window,
                ..defaults.stream
            },
            stop_timeout,
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
            },
        })
    }
}

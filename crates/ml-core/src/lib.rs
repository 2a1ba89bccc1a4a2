//! Detection capability consumed by the watch pipeline.
//!
//! A [`Detector`] turns one [`Frame`] into an ordered list of [`Detection`]s.
//! The default implementation is a background-subtraction
//! [`MotionDetector`]; enable the `with-tch` feature for the TorchScript YOLO
//! detector.

#[cfg(feature = "with-tch")]
mod boxes;
#[cfg(feature = "with-tch")]
pub mod detector;
mod imaging;
#[cfg(feature = "with-tch")]
mod labels;
mod motion;

use thiserror::Error;
use video_ingest::Frame;

pub use imaging::{frame_to_luma, frame_to_rgb};
pub use motion::{MOTION_LABEL, MotionConfig, MotionDetector};

#[cfg(feature = "with-tch")]
pub use tch;

/// Single object instance reported by a detector.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub label: String,
    /// Confidence in `0.0..=1.0`.
    pub confidence: f32,
    /// `[x1, y1, x2, y2]` in frame pixel coordinates.
    pub bbox: [f32; 4],
}

#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("frame rejected by detector: {0}")]
    InvalidFrame(String),
    #[error("detector state lock poisoned")]
    Poisoned,
    #[error("inference failed: {0}")]
    Inference(#[from] anyhow::Error),
}

/// Object detector used once per frame by the pipeline.
///
/// Calls are not cancellable; a pipeline stop takes effect after `detect`
/// returns.
pub trait Detector: Send + Sync {
    /// Human-readable detector name for logs.
    fn name(&self) -> &str;

    fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, DetectionError>;

    /// Drop per-run state before a new source is attached.
    fn reset(&self) {}
}

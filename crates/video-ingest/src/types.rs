use std::{fmt, path::PathBuf, time::Duration};

use anyhow::Error;
use thiserror::Error;

/// Raw BGR frame captured from a video source.
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub timestamp_ms: i64,
    /// Per-source sequence number, starting at 1.
    pub sequence: u64,
    pub format: FrameFormat,
}

impl Frame {
    /// Expected buffer length for the frame's dimensions and format.
    pub fn expected_len(&self) -> usize {
        match self.format {
            FrameFormat::Bgr8 => (self.width.max(0) as usize) * (self.height.max(0) as usize) * 3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

/// Which physical source a pipeline run should read from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceDescriptor {
    Camera { index: u32 },
    File { path: PathBuf },
}

impl SourceDescriptor {
    /// Short kind label used in API responses (`camera` / `video`).
    pub fn kind(&self) -> &'static str {
        match self {
            SourceDescriptor::Camera { .. } => "camera",
            SourceDescriptor::File { .. } => "video",
        }
    }
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceDescriptor::Camera { index } => write!(f, "camera #{index}"),
            SourceDescriptor::File { path } => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}: {reason}")]
    Open { uri: String, reason: String },
    #[error("video source reached end of stream")]
    EndOfStream,
    #[error("video source was released")]
    Released,
    #[error("no frame within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Read(#[from] Error),
}

impl CaptureError {
    pub(crate) fn open(uri: impl Into<String>, reason: impl fmt::Display) -> Self {
        CaptureError::Open {
            uri: uri.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the caller may retry `read` on the same source.
    pub fn is_transient(&self) -> bool {
        matches!(self, CaptureError::Timeout(_) | CaptureError::Read(_))
    }
}

/// An opened frame source.
///
/// `read` and `release` take `&self` so that a control thread can release the
/// source while the pipeline thread is blocked inside `read`; the blocked call
/// must then return [`CaptureError::Released`] promptly.
pub trait FrameSource: Send + Sync {
    /// Block (bounded by the source's read timeout) for the next frame.
    fn read(&self) -> Result<Frame, CaptureError>;

    /// Release the underlying device or decoder. Idempotent.
    fn release(&self);

    /// Whether `release` has been called.
    fn is_released(&self) -> bool;
}

/// Opens [`FrameSource`]s for a [`SourceDescriptor`].
pub trait SourceOpener: Send + Sync {
    fn open(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn FrameSource>, CaptureError>;
}

//! Frame acquisition for live cameras and recorded files.
//!
//! Callers open a [`SourceDescriptor`] through a [`SourceOpener`] and pull
//! [`Frame`]s from the returned [`FrameSource`] without caring which kind of
//! input sits behind it. The default backend shells out to `ffmpeg`; the
//! `opencv` feature adds an OpenCV `VideoCapture` backend with the same
//! contract.

#[cfg(feature = "opencv")]
mod camera;
mod ffmpeg;
mod source;
mod types;

#[cfg(feature = "opencv")]
pub use camera::OpencvOpener;
pub use ffmpeg::{FfmpegConfig, FfmpegOpener};
pub use source::{ChannelSource, ReleaseHook};
pub use types::{CaptureError, Frame, FrameFormat, FrameSource, SourceDescriptor, SourceOpener};

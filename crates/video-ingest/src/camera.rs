//! OpenCV-backed capture, available with the `opencv` feature.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use anyhow::anyhow;
use chrono::Utc;
use crossbeam_channel::{Sender, bounded};
use opencv::{
    core::{self, MatTraitConstManual},
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait},
};
use tracing::{debug, warn};

use crate::{
    source::ChannelSource,
    types::{CaptureError, Frame, FrameFormat, FrameSource, SourceDescriptor, SourceOpener},
};

/// [`SourceOpener`] using OpenCV's `VideoCapture` for both cameras and files.
#[derive(Clone, Debug)]
pub struct OpencvOpener {
    pub target_size: (i32, i32),
    pub read_timeout: Duration,
    pub open_timeout: Duration,
}

impl Default for OpencvOpener {
    fn default() -> Self {
        Self {
            target_size: (640, 480),
            read_timeout: Duration::from_secs(2),
            open_timeout: Duration::from_secs(10),
        }
    }
}

impl SourceOpener for OpencvOpener {
    fn open(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn FrameSource>, CaptureError> {
        let label = descriptor.to_string();
        let (tx, rx) = bounded(2);
        let stop = Arc::new(AtomicBool::new(false));

        let loop_stop = stop.clone();
        let loop_descriptor = descriptor.clone();
        let target_size = self.target_size;
        thread::Builder::new()
            .name("opencv-capture".into())
            .spawn(move || {
                if let Err(err) = capture_loop(&loop_descriptor, target_size, &loop_stop, &tx) {
                    let _ = tx.send(Err(err));
                }
            })
            .map_err(|err| CaptureError::open(&label, format!("failed to spawn capture: {err}")))?;

        let source = ChannelSource::new(
            label,
            rx,
            self.read_timeout,
            Box::new(move || stop.store(true, Ordering::SeqCst)),
        )
        .prime(self.open_timeout)?;
        Ok(Box::new(source))
    }
}

/// Main capture loop executed on the background thread.
fn capture_loop(
    descriptor: &SourceDescriptor,
    target_size: (i32, i32),
    stop: &AtomicBool,
    tx: &Sender<Result<Frame, CaptureError>>,
) -> Result<(), CaptureError> {
    let mut cap = open_video_capture(descriptor)?;
    if matches!(descriptor, SourceDescriptor::Camera { .. }) {
        configure_camera(&mut cap, target_size, 30.0);
    }

    let mut frame = Mat::default();
    let mut scratch = Mat::default();
    let (target_w, target_h) = target_size;
    let mut sequence: u64 = 0;

    while !stop.load(Ordering::Relaxed) {
        let grabbed = cap
            .read(&mut frame)
            .map_err(|e| CaptureError::Read(anyhow!(e)))?;
        if !grabbed {
            let _ = tx.send(Err(CaptureError::EndOfStream));
            break;
        }

        let size = frame.size().map_err(|e| CaptureError::Read(anyhow!(e)))?;
        if size.width <= 0 {
            continue;
        }

        let working = if size.width != target_w || size.height != target_h {
            opencv::imgproc::resize(
                &frame,
                &mut scratch,
                core::Size {
                    width: target_w,
                    height: target_h,
                },
                0.0,
                0.0,
                opencv::imgproc::INTER_LINEAR,
            )
            .map_err(|e| CaptureError::Read(anyhow!(e)))?;
            &scratch
        } else {
            &frame
        };

        let data = working
            .data_bytes()
            .map_err(|e| CaptureError::Read(anyhow!(e)))?
            .to_vec();

        sequence += 1;
        if tx
            .send(Ok(Frame {
                data,
                width: target_w,
                height: target_h,
                timestamp_ms: Utc::now().timestamp_millis(),
                sequence,
                format: FrameFormat::Bgr8,
            }))
            .is_err()
        {
            break;
        }
    }

    let _ = cap.release();
    debug!(source = %descriptor, "opencv capture finished");
    Ok(())
}

/// Attempt to open a camera input by index or a file by path.
fn open_video_capture(descriptor: &SourceDescriptor) -> Result<VideoCapture, CaptureError> {
    let label = descriptor.to_string();
    match descriptor {
        SourceDescriptor::Camera { index } => {
            for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
                match VideoCapture::new(*index as i32, backend) {
                    Ok(cap) => {
                        if cap.is_opened().map_err(|e| CaptureError::Read(anyhow!(e)))? {
                            return Ok(cap);
                        }
                    }
                    Err(err) => {
                        warn!("failed to open {label} with backend {backend}: {err}");
                    }
                }
            }
        }
        SourceDescriptor::File { path } => {
            let path = path.to_string_lossy();
            match VideoCapture::from_file(&path, videoio::CAP_ANY) {
                Ok(cap) => {
                    if cap.is_opened().map_err(|e| CaptureError::Read(anyhow!(e)))? {
                        return Ok(cap);
                    }
                }
                Err(err) => {
                    warn!("failed to open {label}: {err}");
                }
            }
        }
    }

    Err(CaptureError::open(label, "no OpenCV backend could open the source"))
}

/// Apply common capture settings (resolution, fps, preferred pixel format).
fn configure_camera(cap: &mut VideoCapture, target_size: (i32, i32), fps: f64) {
    let mut fourcc_set = false;
    if let Ok(mjpg) = videoio::VideoWriter::fourcc('M', 'J', 'P', 'G') {
        if matches!(cap.set(videoio::CAP_PROP_FOURCC, mjpg as f64), Ok(true)) {
            fourcc_set = true;
        }
    }
    if !fourcc_set {
        if let Ok(yuyv) = videoio::VideoWriter::fourcc('Y', 'U', 'Y', 'V') {
            let _ = cap.set(videoio::CAP_PROP_FOURCC, yuyv as f64);
        }
    }
    let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, target_size.0 as f64);
    let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, target_size.1 as f64);
    let _ = cap.set(videoio::CAP_PROP_FPS, fps);
}

//! FFmpeg subprocess capture backend.
//!
//! Each source spawns `ffmpeg`, asks it for raw `bgr24` frames at a fixed
//! size on stdout, and slices the byte stream into frames on a reader thread.

use std::{
    io::{ErrorKind, Read},
    path::PathBuf,
    process::{Child, ChildStdout, Command, Stdio},
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use anyhow::anyhow;
use chrono::Utc;
use crossbeam_channel::{Sender, bounded};
use tracing::{debug, warn};

use crate::{
    source::ChannelSource,
    types::{CaptureError, Frame, FrameFormat, FrameSource, SourceDescriptor, SourceOpener},
};

const FRAME_QUEUE: usize = 2;

/// Settings shared by every source the opener creates.
#[derive(Clone, Debug)]
pub struct FfmpegConfig {
    /// Path or name of the `ffmpeg` executable.
    pub binary: PathBuf,
    pub width: i32,
    pub height: i32,
    /// Upper bound for a single `read` call.
    pub read_timeout: Duration,
    /// How long `open` waits for the first decoded frame.
    pub open_timeout: Duration,
    /// Pace file playback at the file's native frame rate.
    pub realtime_files: bool,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ffmpeg"),
            width: 640,
            height: 480,
            read_timeout: Duration::from_secs(2),
            open_timeout: Duration::from_secs(10),
            realtime_files: true,
        }
    }
}

/// [`SourceOpener`] that decodes cameras and files through `ffmpeg`.
#[derive(Clone, Debug, Default)]
pub struct FfmpegOpener {
    config: FfmpegConfig,
}

impl FfmpegOpener {
    pub fn new(config: FfmpegConfig) -> Self {
        Self { config }
    }

    fn build_command(&self, descriptor: &SourceDescriptor) -> Result<Command, CaptureError> {
        let mut cmd = Command::new(&self.config.binary);
        cmd.arg("-hide_banner").arg("-loglevel").arg("error");

        match descriptor {
            SourceDescriptor::Camera { index } => {
                apply_camera_input(&mut cmd, *index)
                    .map_err(|reason| CaptureError::open(descriptor.to_string(), reason))?;
            }
            SourceDescriptor::File { path } => {
                if !path.is_file() {
                    return Err(CaptureError::open(
                        descriptor.to_string(),
                        "file does not exist",
                    ));
                }
                if self.config.realtime_files {
                    cmd.arg("-re");
                }
                cmd.arg("-i").arg(path);
            }
        }

        let scale_arg = format!("scale={}:{}", self.config.width, self.config.height);
        cmd.arg("-an")
            .arg("-vf")
            .arg(&scale_arg)
            .arg("-pix_fmt")
            .arg("bgr24")
            .arg("-f")
            .arg("rawvideo")
            .arg("-");
        Ok(cmd)
    }
}

#[cfg(target_os = "linux")]
fn apply_camera_input(cmd: &mut Command, index: u32) -> Result<(), String> {
    cmd.arg("-f")
        .arg("video4linux2")
        .arg("-i")
        .arg(format!("/dev/video{index}"));
    Ok(())
}

#[cfg(target_os = "macos")]
fn apply_camera_input(cmd: &mut Command, index: u32) -> Result<(), String> {
    cmd.arg("-f")
        .arg("avfoundation")
        .arg("-framerate")
        .arg("30")
        .arg("-i")
        .arg(index.to_string());
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn apply_camera_input(_cmd: &mut Command, _index: u32) -> Result<(), String> {
    Err("camera capture through ffmpeg is unsupported on this platform; build with the `opencv` feature".into())
}

impl SourceOpener for FfmpegOpener {
    fn open(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn FrameSource>, CaptureError> {
        let label = descriptor.to_string();
        let mut cmd = self.build_command(descriptor)?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = cmd
            .spawn()
            .map_err(|err| CaptureError::open(&label, format!("failed to spawn ffmpeg: {err}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::open(&label, "failed to capture ffmpeg stdout"))?;
        debug!(source = %label, pid = child.id(), "spawned ffmpeg decoder");

        let child = Arc::new(Mutex::new(Some(child)));
        let (tx, rx) = bounded(FRAME_QUEUE);
        let target_size = (self.config.width, self.config.height);

        let reader_child = child.clone();
        let reader_label = label.clone();
        thread::Builder::new()
            .name("ffmpeg-reader".into())
            .spawn(move || {
                ffmpeg_loop(stdout, target_size, tx);
                stop_child(&reader_child);
                debug!(source = %reader_label, "ffmpeg reader finished");
            })
            .map_err(|err| CaptureError::open(&label, format!("failed to spawn reader: {err}")))?;

        let source = ChannelSource::new(
            label,
            rx,
            self.config.read_timeout,
            Box::new(move || stop_child(&child)),
        )
        .prime(self.config.open_timeout)?;
        Ok(Box::new(source))
    }
}

fn stop_child(child: &Mutex<Option<Child>>) {
    let taken = match child.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    };
    if let Some(mut child) = taken {
        if let Err(err) = child.kill() {
            if err.kind() != ErrorKind::InvalidInput {
                warn!("failed to kill ffmpeg: {err}");
            }
        }
        let _ = child.wait();
    }
}

fn ffmpeg_loop(
    mut stdout: ChildStdout,
    target_size: (i32, i32),
    tx: Sender<Result<Frame, CaptureError>>,
) {
    let frame_bytes = (target_size.0 as usize) * (target_size.1 as usize) * 3;
    let mut buffer = vec![0u8; frame_bytes];
    let mut sequence: u64 = 0;

    loop {
        match stdout.read_exact(&mut buffer) {
            Ok(()) => {
                sequence += 1;
                let timestamp_ms = Utc::now().timestamp_millis();
                if tx
                    .send(Ok(Frame {
                        data: buffer.clone(),
                        width: target_size.0,
                        height: target_size.1,
                        timestamp_ms,
                        sequence,
                        format: FrameFormat::Bgr8,
                    }))
                    .is_err()
                {
                    break;
                }
            }
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                let _ = tx.send(Err(CaptureError::EndOfStream));
                break;
            }
            Err(err) => {
                let _ = tx.send(Err(CaptureError::Read(anyhow!(err))));
                break;
            }
        }
    }
}

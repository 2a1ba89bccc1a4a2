//! Channel-backed [`FrameSource`] shared by the capture backends.
//!
//! Backends decode on their own thread and push frames into a small bounded
//! channel. Reads select between that channel and a cancellation channel whose
//! sender is dropped on release, so a blocked `read` wakes up as soon as the
//! source is released instead of waiting for the decoder.

use std::{sync::Mutex, time::Duration};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, select};
use tracing::debug;

use crate::types::{CaptureError, Frame, FrameSource};

/// Callback run once when the source is released.
pub type ReleaseHook = Box<dyn Fn() + Send + Sync>;

/// [`FrameSource`] fed through a channel by a producer thread.
///
/// Dropping every sender ends the stream with [`CaptureError::EndOfStream`].
pub struct ChannelSource {
    label: String,
    frames: Receiver<Result<Frame, CaptureError>>,
    cancel_rx: Receiver<()>,
    cancel_tx: Mutex<Option<Sender<()>>>,
    pending: Mutex<Option<Frame>>,
    read_timeout: Duration,
    on_release: ReleaseHook,
}

impl ChannelSource {
    pub fn new(
        label: String,
        frames: Receiver<Result<Frame, CaptureError>>,
        read_timeout: Duration,
        on_release: ReleaseHook,
    ) -> Self {
        let (cancel_tx, cancel_rx) = crossbeam_channel::bounded(0);
        Self {
            label,
            frames,
            cancel_rx,
            cancel_tx: Mutex::new(Some(cancel_tx)),
            pending: Mutex::new(None),
            read_timeout,
            on_release,
        }
    }

    /// Wait for the first decoded frame so an unusable source fails at open
    /// time. The frame is kept and returned by the first `read`.
    pub fn prime(self, open_timeout: Duration) -> Result<Self, CaptureError> {
        let first = match self.frames.recv_timeout(open_timeout) {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(err)) => Err(CaptureError::open(&self.label, err)),
            Err(RecvTimeoutError::Timeout) => Err(CaptureError::open(
                &self.label,
                format!("no frame decoded within {open_timeout:?}"),
            )),
            Err(RecvTimeoutError::Disconnected) => Err(CaptureError::open(
                &self.label,
                "decoder exited before producing a frame",
            )),
        };

        match first {
            Ok(frame) => {
                if let Ok(mut guard) = self.pending.lock() {
                    *guard = Some(frame);
                }
                Ok(self)
            }
            Err(err) => {
                self.release();
                Err(err)
            }
        }
    }

    fn take_pending(&self) -> Option<Frame> {
        match self.pending.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

impl FrameSource for ChannelSource {
    fn read(&self) -> Result<Frame, CaptureError> {
        if self.is_released() {
            return Err(CaptureError::Released);
        }
        if let Some(frame) = self.take_pending() {
            return Ok(frame);
        }

        select! {
            recv(self.frames) -> msg => match msg {
                Ok(result) => result,
                Err(_) => Err(CaptureError::EndOfStream),
            },
            recv(self.cancel_rx) -> _ => Err(CaptureError::Released),
            default(self.read_timeout) => Err(CaptureError::Timeout(self.read_timeout)),
        }
    }

    fn release(&self) {
        let sender = match self.cancel_tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sender) = sender {
            drop(sender);
            (self.on_release)();
            debug!(source = %self.label, "video source released");
        }
    }

    fn is_released(&self) -> bool {
        match self.cancel_tx.lock() {
            Ok(guard) => guard.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }
}

impl Drop for ChannelSource {
    fn drop(&mut self) {
        self.release();
    }
}

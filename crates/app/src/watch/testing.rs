//! Fake sources and detectors shared by the engine, control and server tests.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use crossbeam_channel::{Sender, bounded};
use ml_core::{Detection, DetectionError, Detector};
use video_ingest::{
    CaptureError, ChannelSource, Frame, FrameFormat, FrameSource, SourceDescriptor, SourceOpener,
};

pub(crate) const FRAME_WIDTH: i32 = 64;
pub(crate) const FRAME_HEIGHT: i32 = 48;
const READ_TIMEOUT: Duration = Duration::from_millis(50);

pub(crate) fn test_frame(sequence: u64) -> Frame {
    Frame {
        data: vec![90; (FRAME_WIDTH * FRAME_HEIGHT * 3) as usize],
        width: FRAME_WIDTH,
        height: FRAME_HEIGHT,
        timestamp_ms: sequence as i64 * 40,
        sequence,
        format: FrameFormat::Bgr8,
    }
}

pub(crate) fn person(confidence: f32) -> Detection {
    Detection {
        label: "person".into(),
        confidence,
        bbox: [8.0, 8.0, 40.0, 40.0],
    }
}

fn counting_hook(releases: &Arc<AtomicUsize>) -> Box<dyn Fn() + Send + Sync> {
    let releases = releases.clone();
    Box::new(move || {
        releases.fetch_add(1, Ordering::SeqCst);
    })
}

/// A clip of `count` frames delivered every `interval`, then end of stream.
pub(crate) fn clip_source(count: u64, interval: Duration) -> (ChannelSource, Arc<AtomicUsize>) {
    let (tx, rx) = bounded(1);
    thread::spawn(move || {
        for sequence in 1..=count {
            if tx.send(Ok(test_frame(sequence))).is_err() {
                return;
            }
            thread::sleep(interval);
        }
    });
    let releases = Arc::new(AtomicUsize::new(0));
    let source = ChannelSource::new("clip".into(), rx, READ_TIMEOUT, counting_hook(&releases));
    (source, releases)
}

/// An endless live feed; frames stop once the source is released.
pub(crate) fn live_source(interval: Duration) -> (ChannelSource, Arc<AtomicUsize>) {
    let (tx, rx) = bounded(1);
    thread::spawn(move || {
        for sequence in 1.. {
            if tx.send(Ok(test_frame(sequence))).is_err() {
                return;
            }
            thread::sleep(interval);
        }
    });
    let releases = Arc::new(AtomicUsize::new(0));
    let source = ChannelSource::new("live".into(), rx, READ_TIMEOUT, counting_hook(&releases));
    (source, releases)
}

/// A source that never produces a frame; every read blocks until timeout or release.
pub(crate) fn silent_source(read_timeout: Duration) -> (ChannelSource, Arc<AtomicUsize>) {
    let (tx, rx) = bounded::<Result<Frame, CaptureError>>(1);
    let keep_alive: Mutex<Option<Sender<Result<Frame, CaptureError>>>> = Mutex::new(Some(tx));
    let releases = Arc::new(AtomicUsize::new(0));
    let counter = releases.clone();
    let source = ChannelSource::new(
        "silent".into(),
        rx,
        read_timeout,
        Box::new(move || {
            if let Ok(mut sender) = keep_alive.lock() {
                sender.take();
            }
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );
    (source, releases)
}

type OpenFn = dyn Fn(&SourceDescriptor) -> Result<Box<dyn FrameSource>, CaptureError> + Send + Sync;

/// Opener backed by a closure.
pub(crate) struct FnOpener(Box<OpenFn>);

impl FnOpener {
    pub(crate) fn new(
        open: impl Fn(&SourceDescriptor) -> Result<Box<dyn FrameSource>, CaptureError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self(Box::new(open))
    }
}

impl SourceOpener for FnOpener {
    fn open(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn FrameSource>, CaptureError> {
        (self.0)(descriptor)
    }
}

/// Opener that hands out `source` once and fails afterwards.
pub(crate) fn single_source_opener(source: ChannelSource) -> Arc<dyn SourceOpener> {
    let slot = Mutex::new(Some(source));
    Arc::new(FnOpener::new(move |descriptor| {
        slot.lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .map(|source| Box::new(source) as Box<dyn FrameSource>)
            .ok_or_else(|| CaptureError::Open {
                uri: descriptor.to_string(),
                reason: "no more test sources".into(),
            })
    }))
}

pub(crate) fn failing_opener() -> Arc<dyn SourceOpener> {
    Arc::new(FnOpener::new(|descriptor| {
        Err(CaptureError::Open {
            uri: descriptor.to_string(),
            reason: "device not found".into(),
        })
    }))
}

type ScriptFn = dyn Fn(u64) -> Result<Vec<Detection>, DetectionError> + Send + Sync;

/// Detector answering from a per-sequence script.
pub(crate) struct ScriptedDetector {
    script: Box<ScriptFn>,
    resets: AtomicUsize,
}

impl ScriptedDetector {
    pub(crate) fn new(
        script: impl Fn(u64) -> Result<Vec<Detection>, DetectionError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            script: Box::new(script),
            resets: AtomicUsize::new(0),
        }
    }

    pub(crate) fn quiet() -> Self {
        Self::new(|_| Ok(Vec::new()))
    }

    pub(crate) fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

impl Detector for ScriptedDetector {
    fn name(&self) -> &str {
        "scripted"
    }

    fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, DetectionError> {
        (self.script)(frame.sequence)
    }

    fn reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

use actix_web::web::Bytes;
use serde::{Deserialize, Serialize};

use crate::watch::{alert::AlertState, snapshots::SnapshotRecord};

/// One encoded frame as delivered to stream subscribers.
#[derive(Clone, Debug)]
pub(crate) struct FramePacket {
    pub(crate) jpeg: Bytes,
    pub(crate) frame_number: u64,
    pub(crate) timestamp_ms: i64,
    pub(crate) fps: f32,
    pub(crate) alert: AlertState,
    /// False when detection failed and the frame carries no overlay.
    pub(crate) annotated: bool,
}

/// Snapshot of the running pipeline, read by `/status`.
#[derive(Clone, Debug, Default)]
pub(crate) struct PipelineStatus {
    pub(crate) running: bool,
    pub(crate) alert: AlertState,
    pub(crate) fps: f32,
    pub(crate) last_error: Option<String>,
    pub(crate) snapshots_taken: u64,
    pub(crate) last_snapshot: Option<SnapshotRecord>,
    pub(crate) frames_processed: u64,
    /// Display form of the active source.
    pub(crate) source: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct StartRequest {
    pub(crate) source: Option<String>,
    pub(crate) video_path: Option<String>,
    pub(crate) camera_index: Option<u32>,
}

/// Effective configuration of a started run.
#[derive(Clone, Debug, Serialize)]
pub(crate) struct StartSummary {
    pub(crate) source: String,
    pub(crate) target_label: String,
    pub(crate) threshold: f32,
    pub(crate) cooldown_secs: f64,
}

#[derive(Serialize)]
pub(crate) struct StartResponse {
    pub(crate) status: &'static str,
    /// Source kind, `camera` or `video`.
    pub(crate) source: &'static str,
    pub(crate) config: StartSummary,
}

#[derive(Serialize)]
pub(crate) struct StatusResponse {
    pub(crate) is_running: bool,
    pub(crate) detection_status: AlertState,
    pub(crate) fps: f32,
    pub(crate) last_error: Option<String>,
    pub(crate) snapshots_taken: u64,
    pub(crate) last_snapshot: Option<String>,
    pub(crate) last_snapshot_time: Option<String>,
    pub(crate) source: Option<String>,
}

impl From<PipelineStatus> for StatusResponse {
    fn from(status: PipelineStatus) -> Self {
        let (last_snapshot, last_snapshot_time) = match status.last_snapshot {
            Some(record) => (
                Some(record.filename),
                Some(record.timestamp.format("%Y-%m-%d %H:%M:%S").to_string()),
            ),
            None => (None, None),
        };
        Self {
            is_running: status.running,
            detection_status: status.alert,
            fps: status.fps,
            last_error: status.last_error,
            snapshots_taken: status.snapshots_taken,
            last_snapshot,
            last_snapshot_time,
            source: status.source,
        }
    }
}

#[derive(Serialize)]
pub(crate) struct StopResponse {
    pub(crate) status: &'static str,
    /// Whether a running pipeline was actually stopped.
    pub(crate) was_running: bool,
}

#[derive(Serialize)]
pub(crate) struct SnapshotsResponse {
    pub(crate) snapshots: Vec<String>,
}

#[derive(Serialize)]
pub(crate) struct VideosResponse {
    pub(crate) videos: Vec<String>,
}

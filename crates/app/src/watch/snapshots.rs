//! Snapshot persistence and lookup.
//!
//! Admitted alert frames are handed to a background writer thread through a
//! small bounded queue so that disk latency never stalls the pipeline. The
//! record returned to the pipeline carries the final file name, which is
//! decided up front and made unique within the output directory.

use std::{
    fs, io,
    path::{Component, Path, PathBuf},
    thread::JoinHandle,
};

use actix_web::web::Bytes;
use chrono::{DateTime, Local};
use crossbeam_channel::{Sender, TrySendError, bounded};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::watch::telemetry;

pub(crate) const SNAPSHOT_PREFIX: &str = "intruder_";
pub(crate) const SNAPSHOT_EXTENSION: &str = "jpg";
/// Number of file names returned by `/snapshots`.
pub(crate) const RECENT_SNAPSHOT_LIMIT: usize = 6;
const WRITER_QUEUE_CAPACITY: usize = 8;

/// A persisted (or queued) snapshot.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct SnapshotRecord {
    pub(crate) filename: String,
    pub(crate) timestamp: DateTime<Local>,
    pub(crate) confidence: f32,
}

#[derive(Debug, Error)]
pub(crate) enum PersistError {
    #[error("failed to create snapshot directory {}: {source}", .path.display())]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("failed to write snapshot {}: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },
    #[error("snapshot queue full; dropped {filename}")]
    QueueFull { filename: String },
    #[error("snapshot writer stopped; dropped {filename}")]
    WriterStopped { filename: String },
}

struct SnapshotJob {
    path: PathBuf,
    jpeg: Bytes,
}

/// `intruder_YYYY-MM-DD_HH-MM-SS` for the given local time.
pub(crate) fn snapshot_stem(timestamp: &DateTime<Local>) -> String {
    format!("{SNAPSHOT_PREFIX}{}", timestamp.format("%Y-%m-%d_%H-%M-%S"))
}

/// Background snapshot writer owned by one pipeline run.
pub(crate) struct SnapshotWriter {
    output_dir: PathBuf,
    tx: Option<Sender<SnapshotJob>>,
    handle: Option<JoinHandle<()>>,
    current_stem: Option<String>,
    issued: Vec<String>,
}

impl SnapshotWriter {
    pub(crate) fn spawn(output_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let output_dir = output_dir.into();
        let (tx, rx) = bounded::<SnapshotJob>(WRITER_QUEUE_CAPACITY);
        let dir = output_dir.clone();
        let handle = telemetry::spawn_thread("watch-snapshots", move || {
            for job in rx.iter() {
                match write_snapshot(&dir, &job) {
                    Ok(()) => {
                        metrics::counter!("watch_snapshots_total").increment(1);
                        info!("ALARM: snapshot saved to {}", job.path.display());
                    }
                    Err(err) => {
                        metrics::counter!("watch_snapshot_errors_total").increment(1);
                        error!("{err}");
                    }
                }
            }
        })?;
        Ok(Self {
            output_dir,
            tx: Some(tx),
            handle: Some(handle),
            current_stem: None,
            issued: Vec::new(),
        })
    }

    /// Queue `jpeg` for persistence and return its record.
    ///
    /// Never blocks: a full queue drops the snapshot with [`PersistError::QueueFull`].
    pub(crate) fn submit(
        &mut self,
        jpeg: Bytes,
        confidence: f32,
        timestamp: DateTime<Local>,
    ) -> Result<SnapshotRecord, PersistError> {
        let filename = self.unique_name(&timestamp);
        let Some(tx) = self.tx.as_ref() else {
            return Err(PersistError::WriterStopped { filename });
        };
        let job = SnapshotJob {
            path: self.output_dir.join(&filename),
            jpeg,
        };
        match tx.try_send(job) {
            Ok(()) => Ok(SnapshotRecord {
                filename,
                timestamp,
                confidence,
            }),
            Err(TrySendError::Full(_)) => {
                metrics::counter!("watch_snapshot_errors_total").increment(1);
                Err(PersistError::QueueFull { filename })
            }
            Err(TrySendError::Disconnected(_)) => Err(PersistError::WriterStopped { filename }),
        }
    }

    /// Flush queued snapshots and join the writer thread.
    pub(crate) fn finish(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("snapshot writer thread panicked");
            }
        }
    }

    /// Stem-based name, suffixed `-N` when the same second was already used.
    fn unique_name(&mut self, timestamp: &DateTime<Local>) -> String {
        let stem = snapshot_stem(timestamp);
        if self.current_stem.as_deref() != Some(stem.as_str()) {
            self.current_stem = Some(stem.clone());
            self.issued.clear();
        }
        let mut suffix = 0u32;
        loop {
            let candidate = if suffix == 0 {
                format!("{stem}.{SNAPSHOT_EXTENSION}")
            } else {
                format!("{stem}-{suffix}.{SNAPSHOT_EXTENSION}")
            };
            if !self.issued.contains(&candidate) && !self.output_dir.join(&candidate).exists() {
                self.issued.push(candidate.clone());
                return candidate;
            }
            suffix += 1;
        }
    }
}

impl Drop for SnapshotWriter {
    fn drop(&mut self) {
        self.finish();
    }
}

fn write_snapshot(dir: &Path, job: &SnapshotJob) -> Result<(), PersistError> {
    fs::create_dir_all(dir).map_err(|source| PersistError::CreateDir {
        path: dir.to_path_buf(),
        source,
    })?;
    fs::write(&job.path, &job.jpeg).map_err(|source| PersistError::Write {
        path: job.path.clone(),
        source,
    })
}

/// Whether `name` names a single entry with no directory components.
pub(crate) fn is_plain_file_name(name: &str) -> bool {
    if name.is_empty() || name.contains(['/', '\\']) {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Path of a snapshot inside `dir`, or `None` when `name` is not a plain
/// `.jpg` file name.
pub(crate) fn snapshot_path(dir: &Path, name: &str) -> Option<PathBuf> {
    let is_jpeg = Path::new(name)
        .extension()
        .is_some_and(|ext| ext == SNAPSHOT_EXTENSION);
    (is_plain_file_name(name) && is_jpeg).then(|| dir.join(name))
}

/// Most recent `.jpg` file names in `dir`, newest first.
///
/// Snapshot names embed a sortable timestamp, so reverse lexicographic order
/// is newest first. A missing directory yields an empty list.
pub(crate) fn list_recent(dir: &Path, limit: usize) -> io::Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if Path::new(&name)
            .extension()
            .is_some_and(|ext| ext == SNAPSHOT_EXTENSION)
        {
            names.push(name);
        }
    }
    names.sort_unstable_by(|a, b| b.cmp(a));
    names.truncate(limit);
    Ok(names)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(secs: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2024, 5, 17, 22, 15, secs)
            .single()
            .unwrap()
    }

    #[test]
    fn names_follow_timestamp_pattern() {
        assert_eq!(snapshot_stem(&at(7)), "intruder_2024-05-17_22-15-07");
    }

    #[test]
    fn writes_snapshot_into_created_directory() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("Intruder_Logs");
        let mut writer = SnapshotWriter::spawn(&dir).unwrap();

        let record = writer
            .submit(Bytes::from_static(b"\xFF\xD8jpeg"), 0.87, at(1))
            .unwrap();
        writer.finish();

        assert_eq!(record.filename, "intruder_2024-05-17_22-15-01.jpg");
        assert_eq!(record.confidence, 0.87);
        let written = fs::read(dir.join(&record.filename)).unwrap();
        assert_eq!(written, b"\xFF\xD8jpeg");
    }

    #[test]
    fn same_second_names_get_suffixes() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("intruder_2024-05-17_22-15-02.jpg"), b"old").unwrap();
        let mut writer = SnapshotWriter::spawn(dir.path()).unwrap();

        let first = writer.submit(Bytes::from_static(b"a"), 0.9, at(2)).unwrap();
        let second = writer.submit(Bytes::from_static(b"b"), 0.9, at(2)).unwrap();
        writer.finish();

        assert_eq!(first.filename, "intruder_2024-05-17_22-15-02-1.jpg");
        assert_eq!(second.filename, "intruder_2024-05-17_22-15-02-2.jpg");
        assert_eq!(
            fs::read(dir.path().join("intruder_2024-05-17_22-15-02.jpg")).unwrap(),
            b"old"
        );
    }

    #[test]
    fn submit_after_finish_reports_stopped_writer() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SnapshotWriter::spawn(dir.path()).unwrap();
        writer.finish();
        let err = writer
            .submit(Bytes::from_static(b"a"), 0.9, at(3))
            .unwrap_err();
        assert!(matches!(err, PersistError::WriterStopped { .. }));
    }

    #[test]
    fn unwritable_directory_is_logged_not_fatal() {
        let root = tempfile::tempdir().unwrap();
        let blocker = root.path().join("not-a-dir");
        fs::write(&blocker, b"file").unwrap();
        let mut writer = SnapshotWriter::spawn(&blocker).unwrap();

        assert!(writer.submit(Bytes::from_static(b"a"), 0.9, at(4)).is_ok());
        writer.finish();
        assert!(blocker.is_file());
    }

    #[test]
    fn lists_newest_jpegs_first() {
        let dir = tempfile::tempdir().unwrap();
        for secs in 0..8 {
            let name = format!("{}.jpg", snapshot_stem(&at(secs)));
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let recent = list_recent(dir.path(), RECENT_SNAPSHOT_LIMIT).unwrap();
        assert_eq!(recent.len(), 6);
        assert_eq!(recent[0], "intruder_2024-05-17_22-15-07.jpg");
        assert_eq!(recent[5], "intruder_2024-05-17_22-15-02.jpg");
        assert!(list_recent(&dir.path().join("missing"), 6).unwrap().is_empty());
    }

    #[test]
    fn validates_snapshot_names() {
        let dir = Path::new("/logs");
        assert_eq!(
            snapshot_path(dir, "intruder_1.jpg"),
            Some(PathBuf::from("/logs/intruder_1.jpg"))
        );
        for name in ["", "..", "../x.jpg", "a/b.jpg", "a\\b.jpg", "x.png", "/etc/x.jpg"] {
            assert_eq!(snapshot_path(dir, name), None, "{name:?}");
        }
        assert!(is_plain_file_name("yard camera.mp4"));
        assert!(!is_plain_file_name("."));
    }
}

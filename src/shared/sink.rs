use chrono::Utc;
use log::{error, info};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::errors::SinkError;
use super::influx::line_protocol::encode_point;
use crate::modules::ingest::point::TimePoint;

/// Destination for built points.
///
/// `write` blocks until the store has answered. Implementations are shared
/// between concurrently running pipeline invocations.
pub trait WriteSink: Send + Sync {
    fn write(&self, point: &TimePoint) -> Result<(), SinkError>;
}

impl<S: WriteSink + ?Sized> WriteSink for Box<S> {
    fn write(&self, point: &TimePoint) -> Result<(), SinkError> {
        (**self).write(point)
    }
}

impl<S: WriteSink + ?Sized> WriteSink for std::sync::Arc<S> {
    fn write(&self, point: &TimePoint) -> Result<(), SinkError> {
        (**self).write(point)
    }
}

/// Dry-run sink: logs the line protocol instead of writing it.
#[derive(Debug, Default)]
pub struct LogSink;

impl WriteSink for LogSink {
    fn write(&self, point: &TimePoint) -> Result<(), SinkError> {
        info!("[dry-run] {}", encode_point(point));
        Ok(())
    }
}

/// Persists points the inner sink failed to write, for manual replay.
///
/// Failed points are appended as line protocol to `failed_<date>.lp` in the
/// backup directory. The inner error is still returned; nothing is retried.
pub struct BackupSink<S> {
    inner: S,
    backup_dir: PathBuf,
    file_lock: Mutex<()>,
}

impl<S: WriteSink> BackupSink<S> {
    pub fn new(inner: S, backup_dir: impl Into<PathBuf>) -> Self {
        BackupSink {
            inner,
            backup_dir: backup_dir.into(),
            file_lock: Mutex::new(()),
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    fn backup_point(&self, point: &TimePoint) -> Result<PathBuf, SinkError> {
        // A poisoned lock only means another writer panicked mid-append.
        let _guard = self.file_lock.lock().unwrap_or_else(|e| e.into_inner());

        if !self.backup_dir.exists() {
            fs::create_dir_all(&self.backup_dir)?;
        }

        let backup_file = self
            .backup_dir
            .join(format!("failed_{}.lp", Utc::now().format("%Y%m%d")));

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&backup_file)?;
        file.write_all(format!("{}\n", encode_point(point)).as_bytes())?;

        Ok(backup_file)
    }
}

impl<S: WriteSink> WriteSink for BackupSink<S> {
    fn write(&self, point: &TimePoint) -> Result<(), SinkError> {
        let Err(write_err) = self.inner.write(point) else {
            return Ok(());
        };

        match self.backup_point(point) {
            Ok(file) => info!("Backup created for failed point, file: '{}'", file.display()),
            Err(e) => error!(
                "Failed to backup point to '{}': {}",
                self.backup_dir.display(),
                e
            ),
        }

        Err(write_err)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Records every point it is asked to write.
    #[derive(Default)]
    pub struct RecordingSink {
        pub points: Mutex<Vec<TimePoint>>,
    }

    impl RecordingSink {
        pub fn written(&self) -> Vec<TimePoint> {
            self.points.lock().unwrap().clone()
        }
    }

    impl WriteSink for RecordingSink {
        fn write(&self, point: &TimePoint) -> Result<(), SinkError> {
            self.points.lock().unwrap().push(point.clone());
            Ok(())
        }
    }

    /// Rejects every write, counting attempts.
    #[derive(Default)]
    pub struct FailingSink {
        pub attempts: Mutex<usize>,
    }

    impl WriteSink for FailingSink {
        fn write(&self, _point: &TimePoint) -> Result<(), SinkError> {
            *self.attempts.lock().unwrap() += 1;
            Err(SinkError::Rejected {
                status: 503,
                body: "service unavailable".to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{FailingSink, RecordingSink};
    use super::*;
    use crate::modules::ingest::extractor::{Metric, ReadingSet};
    use chrono::TimeZone;

    fn point() -> TimePoint {
        let mut fields = ReadingSet::new();
        fields.insert(Metric::Temperature, 20.5);
        TimePoint {
            measurement: "sensorData".to_string(),
            tags: vec![
                ("device_id".to_string(), "p1".to_string()),
                ("room_id".to_string(), "unknown_room".to_string()),
            ],
            fields,
            timestamp: Utc.timestamp_opt(2, 0).unwrap(),
            timestamp_nanos: 2_000_000_000,
        }
    }

    #[test]
    fn backup_sink_passes_through_success() {
        let dir = tempfile::tempdir().unwrap();
        let backup_dir = dir.path().join("failed");
        let sink = BackupSink::new(RecordingSink::default(), &backup_dir);

        sink.write(&point()).unwrap();

        assert_eq!(sink.inner.written().len(), 1);
        assert!(!backup_dir.exists());
    }

    #[test]
    fn backup_sink_persists_failed_points() {
        let dir = tempfile::tempdir().unwrap();
        let backup_dir = dir.path().join("failed");
        let sink = BackupSink::new(FailingSink::default(), &backup_dir);

        let err = sink.write(&point()).unwrap_err();
        assert!(matches!(err, SinkError::Rejected { status: 503, .. }));
        sink.write(&point()).unwrap_err();

        let files: Vec<_> = fs::read_dir(&backup_dir).unwrap().collect();
        assert_eq!(files.len(), 1);

        let path = files[0].as_ref().unwrap().path();
        let contents = fs::read_to_string(path).unwrap();
        let expected = "sensorData,device_id=p1,room_id=unknown_room temperature=20.5 2000000000\n";
        assert_eq!(contents, expected.repeat(2));
    }

    #[test]
    fn boxed_sink_delegates() {
        let sink: Box<dyn WriteSink> = Box::new(LogSink);
        assert!(sink.write(&point()).is_ok());
    }
}

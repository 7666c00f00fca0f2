//! Experiment data log sinks with clean feature flag handling.
//!
//! Every sink is append-only and safe to share between component tasks: each
//! `append` writes one complete, independently timestamped record. The core
//! never reads a log back.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

use crate::config::{LogFormat, StorageConfig};
use crate::error::StorageError;

/// Kind of a logged record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    /// A phase change or an applied state.
    Transition,
    /// A sensor reading.
    Reading,
}

impl RecordKind {
    /// Lowercase name, as serialized.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Transition => "transition",
            RecordKind::Reading => "reading",
        }
    }
}

/// One line of the experiment data log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Wall-clock time of the event.
    pub timestamp: DateTime<Utc>,
    /// Component the record is about.
    pub component: String,
    /// What the record holds.
    pub kind: RecordKind,
    /// Phase, state or reading details.
    pub payload: serde_json::Value,
}

impl LogRecord {
    /// A record stamped with the current wall-clock time.
    pub fn now(component: impl Into<String>, kind: RecordKind, payload: serde_json::Value) -> Self {
        Self {
            timestamp: Utc::now(),
            component: component.into(),
            kind,
            payload,
        }
    }
}

/// Append-only destination for [`LogRecord`]s.
pub trait LogSink: Send + Sync {
    /// Appends one record.
    fn append(&self, record: LogRecord) -> Result<(), StorageError>;

    /// Flushes buffered records. Called once at the end of a run.
    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

// ============================================================================
// Memory Log
// ============================================================================

/// Keeps records in memory. Used by tests and dry runs.
#[derive(Debug, Default, Clone)]
pub struct MemoryLog {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl MemoryLog {
    /// An empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record so far, in append order.
    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Records of one component and kind, in append order.
    pub fn filter(&self, component: &str, kind: RecordKind) -> Vec<LogRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.component == component && r.kind == kind)
            .collect()
    }
}

impl LogSink for MemoryLog {
    fn append(&self, record: LogRecord) -> Result<(), StorageError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
        Ok(())
    }
}

// ============================================================================
// JSON Lines Log
// ============================================================================

/// One JSON object per line.
pub struct JsonLinesLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonLinesLog {
    /// Creates or truncates the file at `path`.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        tracing::info!("JSON lines log initialized at '{}'.", path.display());
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Where the log is written.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogSink for JsonLinesLog {
    fn append(&self, record: LogRecord) -> Result<(), StorageError> {
        let line = serde_json::to_string(&record)?;
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()?;
        Ok(())
    }
}

// ============================================================================
// CSV Log
// ============================================================================

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;

    /// Comma-separated log; the payload column holds compact JSON.
    pub struct CsvLog {
        path: PathBuf,
        writer: Mutex<csv::Writer<File>>,
    }

    impl CsvLog {
        /// Creates the file, writing `# key: value` comment lines before the header.
        pub fn create(path: impl AsRef<Path>, metadata: &[(&str, String)]) -> Result<Self, StorageError> {
            let path = path.as_ref().to_path_buf();
            let mut file = File::create(&path)?;
            for (key, value) in metadata {
                writeln!(file, "# {}: {}", key, value)?;
            }

            let mut writer = csv::Writer::from_writer(file);
            writer.write_record(["timestamp", "component", "kind", "payload"])?;
            tracing::info!("CSV log initialized at '{}'.", path.display());

            Ok(Self {
                path,
                writer: Mutex::new(writer),
            })
        }

        /// Where the log is written.
        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    impl LogSink for CsvLog {
        fn append(&self, record: LogRecord) -> Result<(), StorageError> {
            let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
            writer.write_record(&[
                record.timestamp.to_rfc3339(),
                record.component,
                record.kind.as_str().to_string(),
                record.payload.to_string(),
            ])?;
            Ok(())
        }

        fn flush(&self) -> Result<(), StorageError> {
            self.writer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .flush()?;
            Ok(())
        }
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;

    /// Stands in for the CSV log when `storage_csv` is off.
    pub struct CsvLog;

    impl CsvLog {
        /// Always fails with `FormatUnavailable`.
        pub fn create(_path: impl AsRef<Path>, _metadata: &[(&str, String)]) -> Result<Self, StorageError> {
            Err(StorageError::FormatUnavailable("csv".to_string()))
        }
    }

    impl LogSink for CsvLog {
        fn append(&self, _record: LogRecord) -> Result<(), StorageError> {
            Err(StorageError::FormatUnavailable("csv".to_string()))
        }
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::CsvLog;

#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::CsvLog;

/// Opens the configured sink for a run, creating the output directory if needed.
///
/// Files are named `run_<timestamp>_<run_id>.<ext>`.
pub fn open_sink(
    config: &StorageConfig,
    run_id: Uuid,
    protocol: &str,
) -> Result<(Arc<dyn LogSink>, PathBuf), StorageError> {
    if !config.output_dir.exists() {
        fs::create_dir_all(&config.output_dir)?;
    }
    let stem = format!(
        "run_{}_{}",
        Utc::now().format("%Y%m%d_%H%M%S"),
        run_id.simple()
    );

    match config.format {
        LogFormat::Jsonl => {
            let path = config.output_dir.join(format!("{}.jsonl", stem));
            let sink = JsonLinesLog::create(&path)?;
            Ok((Arc::new(sink), path))
        }
        LogFormat::Csv => {
            let path = config.output_dir.join(format!("{}.csv", stem));
            let sink = CsvLog::create(
                &path,
                &[("run_id", run_id.to_string()), ("protocol", protocol.to_string())],
            )?;
            Ok((Arc::new(sink), path))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn memory_log_filters_by_component() {
        let log = MemoryLog::new();
        log.append(LogRecord::now("pump1", RecordKind::Transition, json!({"phase": "running"})))
            .unwrap();
        log.append(LogRecord::now("ir", RecordKind::Reading, json!(1.5)))
            .unwrap();
        assert_eq!(log.records().len(), 2);
        assert_eq!(log.filter("ir", RecordKind::Reading).len(), 1);
        assert!(log.filter("pump1", RecordKind::Reading).is_empty());
    }

    #[test]
    fn jsonl_log_writes_one_record_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            output_dir: dir.path().join("nested"),
            format: LogFormat::Jsonl,
        };
        let (sink, path) = open_sink(&config, Uuid::new_v4(), "test").unwrap();
        sink.append(LogRecord::now("pump1", RecordKind::Transition, json!({"t": 0.0})))
            .unwrap();
        sink.append(LogRecord::now("ir", RecordKind::Reading, json!({"value": 2})))
            .unwrap();
        sink.flush().unwrap();

        let text = fs::read_to_string(path).unwrap();
        let lines: Vec<LogRecord> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].kind, RecordKind::Reading);
        assert_eq!(lines[1].payload["value"], 2);
    }

    #[cfg(feature = "storage_csv")]
    #[test]
    fn csv_log_has_metadata_and_header() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            output_dir: dir.path().to_path_buf(),
            format: LogFormat::Csv,
        };
        let (sink, path) = open_sink(&config, Uuid::new_v4(), "prime").unwrap();
        sink.append(LogRecord::now("pump1", RecordKind::Transition, json!({"phase": "released"})))
            .unwrap();
        sink.flush().unwrap();

        let text = fs::read_to_string(path).unwrap();
        assert!(text.contains("# protocol: prime"));
        assert!(text.contains("timestamp,component,kind,payload"));
        assert!(text.contains("pump1,transition"));
    }
}

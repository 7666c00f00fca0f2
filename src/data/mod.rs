//! Experiment data logging.

pub mod storage;

pub use storage::{open_sink, CsvLog, JsonLinesLog, LogRecord, LogSink, MemoryLog, RecordKind};

//! In-process log ring buffer
//!
//! A fixed-capacity circular buffer of structured log records fed by a
//! `tracing` layer, queryable over the wire by level, substring, and tail
//! count. Per-logger level thresholds can be changed at runtime.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::domain_types::LogBufferCapacity;

/// Record severity, ordered from least to most severe
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<&tracing::Level> for LogLevel {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE => LogLevel::Trace,
            tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::WARN => LogLevel::Warn,
            tracing::Level::ERROR => LogLevel::Error,
        }
    }
}

/// One structured log record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub ts: DateTime<Utc>,
    pub level: LogLevel,
    pub logger: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
}

/// Query over the ring buffer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogQuery {
    /// Keep records at or above this level
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_level: Option<LogLevel>,
    /// Keep records whose message or logger contains this substring
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contains: Option<String>,
    /// Keep only the last N matching records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tail: Option<usize>,
}

/// Ring buffer plus runtime level control
pub struct LogManager {
    records: Mutex<VecDeque<LogRecord>>,
    capacity: usize,
    default_level: RwLock<LogLevel>,
    logger_levels: RwLock<HashMap<String, LogLevel>>,
    dropped: Mutex<u64>,
}

impl LogManager {
    /// Creates a manager with the given capacity
    #[must_use]
    pub fn new(capacity: LogBufferCapacity) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity.as_usize())),
            capacity: capacity.as_usize(),
            default_level: RwLock::new(LogLevel::Debug),
            logger_levels: RwLock::new(HashMap::new()),
            dropped: Mutex::new(0),
        }
    }

    /// Appends a record, evicting the oldest when full
    pub fn push(&self, record: LogRecord) {
        if record.level < self.threshold_for(&record.logger) {
            return;
        }
        let mut records = self.records.lock().unwrap();
        if records.len() >= self.capacity {
            records.pop_front();
            *self.dropped.lock().unwrap() += 1;
        }
        records.push_back(record);
    }

    fn threshold_for(&self, logger: &str) -> LogLevel {
        let overrides = self.logger_levels.read().unwrap();
        // Longest-prefix match lets a module override cover its children
        overrides
            .iter()
            .filter(|(name, _)| logger.starts_with(name.as_str()))
            .max_by_key(|(name, _)| name.len())
            .map(|(_, level)| *level)
            .unwrap_or(*self.default_level.read().unwrap())
    }

    /// Changes the default threshold at runtime
    pub fn set_default_level(&self, level: LogLevel) {
        *self.default_level.write().unwrap() = level;
    }

    /// Changes the threshold for one logger (and its children) at runtime
    pub fn set_logger_level(&self, logger: impl Into<String>, level: LogLevel) {
        self.logger_levels
            .write()
            .unwrap()
            .insert(logger.into(), level);
    }

    /// Runs a query over the buffered records
    #[must_use]
    pub fn query(&self, query: &LogQuery) -> Vec<LogRecord> {
        let records = self.records.lock().unwrap();
        let mut matched: Vec<LogRecord> = records
            .iter()
            .filter(|r| query.min_level.map_or(true, |level| r.level >= level))
            .filter(|r| {
                query.contains.as_ref().map_or(true, |needle| {
                    r.message.contains(needle) || r.logger.contains(needle)
                })
            })
            .cloned()
            .collect();
        if let Some(tail) = query.tail {
            let skip = matched.len().saturating_sub(tail);
            matched.drain(..skip);
        }
        matched
    }

    /// Buffered record count and total evictions
    #[must_use]
    pub fn stats(&self) -> (usize, u64) {
        (
            self.records.lock().unwrap().len(),
            *self.dropped.lock().unwrap(),
        )
    }
}

/// Size-rotated JSON-lines file sink
///
/// When the active file crosses `max_bytes` it is renamed to `<path>.1`
/// (replacing any previous rotation) and a fresh file is started.
pub struct RotatingFileSink {
    path: std::path::PathBuf,
    max_bytes: u64,
    written: Mutex<u64>,
}

impl RotatingFileSink {
    /// Opens the sink, continuing an existing file
    ///
    /// # Errors
    ///
    /// Returns an error when the parent directory cannot be created.
    pub fn open(path: std::path::PathBuf, max_bytes: u64) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let written = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path,
            max_bytes,
            written: Mutex::new(written),
        })
    }

    /// Appends one record, rotating first when the file is full
    pub fn write(&self, record: &LogRecord) {
        let Ok(line) = serde_json::to_string(record) else {
            return;
        };
        let mut written = self.written.lock().unwrap();
        if *written + line.len() as u64 + 1 > self.max_bytes {
            let rotated = self.path.with_extension("log.1");
            let _ = std::fs::rename(&self.path, rotated);
            *written = 0;
        }
        use std::io::Write;
        if let Ok(mut file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
        {
            if writeln!(file, "{line}").is_ok() {
                *written += line.len() as u64 + 1;
            }
        }
    }
}

/// `tracing` layer feeding a [`LogManager`] and an optional file sink
pub struct RingBufferLayer {
    manager: Arc<LogManager>,
    file_sink: Option<Arc<RotatingFileSink>>,
}

impl RingBufferLayer {
    /// Creates a layer over the shared manager
    #[must_use]
    pub fn new(manager: Arc<LogManager>) -> Self {
        Self {
            manager,
            file_sink: None,
        }
    }

    /// Attaches a rotating file sink
    #[must_use]
    pub fn with_file_sink(mut self, sink: Arc<RotatingFileSink>) -> Self {
        self.file_sink = Some(sink);
        self
    }
}

impl<S: Subscriber> Layer<S> for RingBufferLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        let record = LogRecord {
            ts: Utc::now(),
            level: event.metadata().level().into(),
            logger: event.metadata().target().to_string(),
            message: visitor.message,
            context: visitor.fields,
        };
        if let Some(sink) = &self.file_sink {
            sink.write(&record);
        }
        self.manager.push(record);
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: BTreeMap<String, String>,
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields
                .insert(field.name().to_string(), format!("{value:?}"));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields
                .insert(field.name().to_string(), value.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(level: LogLevel, logger: &str, message: &str) -> LogRecord {
        LogRecord {
            ts: Utc::now(),
            level,
            logger: logger.to_string(),
            message: message.to_string(),
            context: BTreeMap::new(),
        }
    }

    fn manager(capacity: usize) -> LogManager {
        LogManager::new(LogBufferCapacity::try_new(capacity.max(100)).unwrap())
    }

    #[test]
    fn buffer_evicts_oldest_when_full() {
        let manager = manager(100);
        for i in 0..150 {
            manager.push(record(LogLevel::Info, "test", &format!("msg {i}")));
        }
        let (len, dropped) = manager.stats();
        assert_eq!(len, 100);
        assert_eq!(dropped, 50);
        let records = manager.query(&LogQuery::default());
        assert_eq!(records.first().unwrap().message, "msg 50");
        assert_eq!(records.last().unwrap().message, "msg 149");
    }

    #[test]
    fn queries_filter_by_level_substring_and_tail() {
        let manager = manager(100);
        manager.push(record(LogLevel::Debug, "dispatcher", "dispatching ping"));
        manager.push(record(LogLevel::Warn, "broker", "slow consumer"));
        manager.push(record(LogLevel::Error, "dispatcher", "handler panicked"));

        let warnings = manager.query(&LogQuery {
            min_level: Some(LogLevel::Warn),
            ..LogQuery::default()
        });
        assert_eq!(warnings.len(), 2);

        let dispatcher = manager.query(&LogQuery {
            contains: Some("dispatcher".to_string()),
            ..LogQuery::default()
        });
        assert_eq!(dispatcher.len(), 2);

        let tail = manager.query(&LogQuery {
            tail: Some(1),
            ..LogQuery::default()
        });
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].message, "handler panicked");
    }

    #[test]
    fn runtime_level_change_applies_per_logger() {
        let manager = manager(100);
        manager.set_default_level(LogLevel::Info);
        manager.set_logger_level("gui", LogLevel::Error);

        manager.push(record(LogLevel::Info, "broker", "kept"));
        manager.push(record(LogLevel::Info, "gui::input", "suppressed"));
        manager.push(record(LogLevel::Error, "gui::input", "kept"));
        manager.push(record(LogLevel::Debug, "broker", "suppressed"));

        let records = manager.query(&LogQuery::default());
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.message == "kept"));
    }

    #[test]
    fn file_sink_rotates_on_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.log");
        let sink = RotatingFileSink::open(path.clone(), 300).unwrap();
        for i in 0..10 {
            sink.write(&record(LogLevel::Info, "test", &format!("record {i}")));
        }
        assert!(path.exists());
        assert!(path.with_extension("log.1").exists());
        assert!(std::fs::metadata(&path).unwrap().len() <= 300);
    }

    #[test]
    fn tracing_layer_captures_events() {
        use tracing_subscriber::prelude::*;

        let manager = Arc::new(LogManager::new(LogBufferCapacity::default()));
        let layer = RingBufferLayer::new(Arc::clone(&manager));
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(connection = 42, "client registered");
        });

        let records = manager.query(&LogQuery::default());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].level, LogLevel::Info);
        assert!(records[0].message.contains("client registered"));
        assert_eq!(records[0].context.get("connection").unwrap(), "42");
    }
}

//! Structured JSON logging.
//!
//! Every event is one flat JSON object (`ts_ms`, `level`, `target`,
//! `message`, optional `fields`). A [`Logger`] drops events below its
//! threshold and hands the rest to a [`LogSink`]. Callers discard sink
//! errors; logging never changes session behaviour.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

pub type LogFields = Map<String, Value>;

pub const SESSION_TARGET: &str = "patchgrid::session";
pub const ROUTER_TARGET: &str = "patchgrid::router";
pub const GRID_TARGET: &str = "patchgrid::grid";
pub const METRICS_TARGET: &str = "patchgrid::session.metrics";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent {
    pub ts_ms: u128,
    pub level: LogLevel,
    pub target: String,
    pub message: String,
    #[serde(skip_serializing_if = "LogFields::is_empty")]
    pub fields: LogFields,
}

impl LogEvent {
    pub fn new(level: LogLevel, target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            ts_ms: unix_ms(),
            level,
            target: target.into(),
            message: message.into(),
            fields: LogFields::new(),
        }
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

fn unix_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|since| since.as_millis())
        .unwrap_or_default()
}

pub type LoggingResult<T> = std::result::Result<T, LoggingError>;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("log file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("log event could not be encoded: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("log sink lock poisoned")]
    Poisoned,
}

pub trait LogSink: Send + Sync {
    fn write(&self, event: &LogEvent) -> LoggingResult<()>;
}

/// Cheap to clone; clones share one sink.
#[derive(Clone)]
pub struct Logger {
    sink: Arc<dyn LogSink>,
    min_level: LogLevel,
}

impl Logger {
    pub fn new<S>(sink: S) -> Self
    where
        S: LogSink + 'static,
    {
        Self {
            sink: Arc::new(sink),
            min_level: LogLevel::Trace,
        }
    }

    pub fn with_min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    pub fn min_level(&self) -> LogLevel {
        self.min_level
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.min_level
    }

    /// Write `event` unless it is below the threshold.
    pub fn emit(&self, event: &LogEvent) -> LoggingResult<()> {
        if self.enabled(event.level) {
            self.sink.write(event)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger")
            .field("min_level", &self.min_level)
            .finish_non_exhaustive()
    }
}

/// JSON lines file. Once the next line would push it past `max_bytes` the
/// file is moved to `<path>.1`, replacing any earlier backup, and a fresh
/// file is started. `max_bytes == 0` never rotates.
pub struct FileSink {
    path: PathBuf,
    max_bytes: u64,
    writer: Mutex<BufWriter<File>>,
}

impl FileSink {
    pub fn new(path: impl AsRef<Path>, max_bytes: u64) -> LoggingResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            max_bytes,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn backup_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".1");
        PathBuf::from(name)
    }

    fn rotate(&self, writer: &mut BufWriter<File>) -> LoggingResult<()> {
        writer.flush()?;
        fs::rename(&self.path, self.backup_path())?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        *writer = BufWriter::new(file);
        Ok(())
    }
}

impl LogSink for FileSink {
    fn write(&self, event: &LogEvent) -> LoggingResult<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let mut writer = self.writer.lock().map_err(|_| LoggingError::Poisoned)?;
        if self.max_bytes > 0 {
            let current = writer.get_ref().metadata()?.len();
            if current > 0 && current + line.len() as u64 > self.max_bytes {
                self.rotate(&mut writer)?;
            }
        }
        writer.write_all(&line)?;
        writer.flush()?;
        Ok(())
    }
}

/// Keeps events in memory. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<LogEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LogEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn messages_for(&self, target: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|event| event.target == target)
            .map(|event| event.message)
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl LogSink for MemorySink {
    fn write(&self, event: &LogEvent) -> LoggingResult<()> {
        self.events
            .lock()
            .map_err(|_| LoggingError::Poisoned)?
            .push(event.clone());
        Ok(())
    }
}

pub fn event_with_fields(
    level: LogLevel,
    target: &str,
    message: &str,
    fields: impl IntoIterator<Item = (String, Value)>,
) -> LogEvent {
    LogEvent {
        fields: fields.into_iter().collect(),
        ..LogEvent::new(level, target, message)
    }
}

pub fn json_kv(key: &str, value: impl Into<Value>) -> (String, Value) {
    (key.to_string(), value.into())
}

pub fn json_str(key: &str, value: impl Into<String>) -> (String, Value) {
    (key.to_string(), json!(value.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_log(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "patchgrid-{name}-{}-{}.jsonl",
            std::process::id(),
            unix_ms()
        ))
    }

    #[test]
    fn event_serializes_flat_json() {
        let event = event_with_fields(
            LogLevel::Warn,
            SESSION_TARGET,
            "layout_entry_dropped",
            [json_kv("index", 3), json_str("patch_id", "p1")],
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["level"], "warn");
        assert_eq!(value["target"], "patchgrid::session");
        assert_eq!(value["fields"]["index"], 3);
        assert_eq!(event.field("patch_id"), Some(&json!("p1")));
    }

    #[test]
    fn empty_fields_are_omitted() {
        let event = LogEvent::new(LogLevel::Info, GRID_TARGET, "reflow");
        let value = serde_json::to_value(&event).unwrap();
        assert!(value.get("fields").is_none());
    }

    #[test]
    fn threshold_filters_quiet_events() {
        let sink = MemorySink::new();
        let logger = Logger::new(sink.clone()).with_min_level(LogLevel::Debug);
        logger
            .emit(&LogEvent::new(LogLevel::Trace, ROUTER_TARGET, "parameter_write"))
            .unwrap();
        logger
            .emit(&LogEvent::new(LogLevel::Debug, ROUTER_TARGET, "bound"))
            .unwrap();
        assert_eq!(sink.messages_for(ROUTER_TARGET), vec!["bound".to_string()]);
        sink.clear();
        assert!(sink.events().is_empty());
    }

    #[test]
    fn levels_parse_from_settings_names() {
        let level: LogLevel = serde_json::from_str("\"warn\"").unwrap();
        assert_eq!(level, LogLevel::Warn);
        assert!(LogLevel::Error > LogLevel::Info);
    }

    #[test]
    fn file_sink_rotates_into_backup() {
        let path = temp_log("rotate");
        let sink = FileSink::new(&path, 200).unwrap();
        for _ in 0..10 {
            sink.write(&LogEvent::new(LogLevel::Info, SESSION_TARGET, "tick"))
                .unwrap();
        }
        let size = fs::metadata(&path).unwrap().len();
        assert!(size <= 200, "size={size}");
        let backup = sink.backup_path();
        assert!(fs::read_to_string(&backup).unwrap().lines().count() >= 1);
        let _ = fs::remove_file(&path);
        let _ = fs::remove_file(&backup);
    }
}

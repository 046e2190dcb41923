use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity of an application log entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Information,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "Trace",
            LogLevel::Debug => "Debug",
            LogLevel::Information => "Information",
            LogLevel::Warning => "Warning",
            LogLevel::Error => "Error",
            LogLevel::Critical => "Critical",
        }
    }

    /// Parse a level name leniently (case-insensitive, common abbreviations).
    ///
    /// Unrecognized names map to `Information`; a log call never fails on its level.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" | "verbose" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "warn" | "warning" => LogLevel::Warning,
            "error" | "err" => LogLevel::Error,
            "critical" | "fatal" | "crit" => LogLevel::Critical,
            _ => LogLevel::Information,
        }
    }
}

impl core::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for LogLevel {
    fn from(value: &str) -> Self {
        Self::parse_lenient(value)
    }
}

/// A single application log line headed for durable storage.
///
/// The timestamp is taken at construction (the log call site), not at flush time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    level: LogLevel,
    message: String,
    exception: Option<String>,
    timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(
        level: impl Into<LogLevel>,
        message: impl Into<String>,
        exception: Option<String>,
    ) -> Self {
        Self {
            level: level.into(),
            message: message.into(),
            exception,
            timestamp: Utc::now(),
        }
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn exception(&self) -> Option<&str> {
        self.exception.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

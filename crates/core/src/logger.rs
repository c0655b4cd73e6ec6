//! Per-operation event sink.
//!
//! Controllers report progress for a whole operation through an
//! `OperationLogger`: free-form messages tagged with a step name and a
//! status category. The sink is external; two implementations ship here.

use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Starting,
    Running,
    Success,
    Failure,
    Timeout,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Starting => "starting",
            StepStatus::Running => "running",
            StepStatus::Success => "success",
            StepStatus::Failure => "failure",
            StepStatus::Timeout => "timeout",
        }
    }
}

/// Step names used by the controllers.
pub mod step {
    pub const RUNTIME: &str = "runtime";
    pub const CALLBACK: &str = "callback";
    pub const LAST: &str = "last";
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub step: String,
    pub status: StepStatus,
}

pub trait OperationLogger: Send + Sync + fmt::Debug {
    fn log(&self, level: LogLevel, message: &str, step: &str, status: StepStatus);

    fn info(&self, message: &str, step: &str, status: StepStatus) { self.log(LogLevel::Info, message, step, status) }

    fn error(&self, message: &str, step: &str, status: StepStatus) { self.log(LogLevel::Error, message, step, status) }

    fn debug(&self, message: &str, step: &str, status: StepStatus) { self.log(LogLevel::Debug, message, step, status) }
}

/// Forwards every entry to `tracing`, tagged with the operation id.
#[derive(Debug, Clone, Default)]
pub struct TracingLogger {
    operation: String,
}

impl TracingLogger {
    pub fn new(operation: impl Into<String>) -> Self { Self { operation: operation.into() } }
}

impl OperationLogger for TracingLogger {
    fn log(&self, level: LogLevel, message: &str, step: &str, status: StepStatus) {
        let status = status.as_str();
        match level {
            LogLevel::Debug => tracing::debug!(operation = %self.operation, step, status, "{message}"),
            LogLevel::Info => tracing::info!(operation = %self.operation, step, status, "{message}"),
            LogLevel::Error => tracing::error!(operation = %self.operation, step, status, "{message}"),
        }
    }
}

/// Collects entries in memory.
#[derive(Debug, Default)]
pub struct MemoryLogger {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryLogger {
    pub fn new() -> Self { Self::default() }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_else(|p| p.into_inner().clone())
    }

    pub fn contains(&self, needle: &str) -> bool { self.entries().iter().any(|e| e.message.contains(needle)) }

    pub fn with_status(&self, status: StepStatus) -> Vec<LogEntry> {
        self.entries().into_iter().filter(|e| e.status == status).collect()
    }

    /// Drains everything logged so far.
    pub fn take(&self) -> Vec<LogEntry> {
        match self.entries.lock() {
            Ok(mut e) => std::mem::take(&mut *e),
            Err(p) => std::mem::take(&mut *p.into_inner()),
        }
    }
}

impl OperationLogger for MemoryLogger {
    fn log(&self, level: LogLevel, message: &str, step: &str, status: StepStatus) {
        let entry = LogEntry { at: Utc::now(), level, message: message.to_string(), step: step.to_string(), status };
        match self.entries.lock() {
            Ok(mut e) => e.push(entry),
            Err(p) => p.into_inner().push(entry),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_logger_keeps_order_and_tags() {
        let log = MemoryLogger::new();
        log.info("starting web", step::RUNTIME, StepStatus::Starting);
        log.error("web timed out", step::CALLBACK, StepStatus::Timeout);
        let entries = log.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].level, LogLevel::Info);
        assert_eq!(entries[1].step, "callback");
        assert_eq!(log.with_status(StepStatus::Timeout).len(), 1);
        assert!(log.contains("timed out"));
        assert_eq!(log.take().len(), 2);
        assert!(log.entries().is_empty());
    }
}

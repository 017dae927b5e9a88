//! Execution log sink for rollout attempts
//!
//! Every stage of an attempt writes human-readable lines under a
//! [`CommandUnit`] and closes the unit with a [`CommandExecutionStatus`].
//! Production code uses `TracingLogSink` or `HttpLogSink`; tests use
//! `MockLogSink`, which keeps records in memory for assertions.

use super::clock::Clock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LogSinkError {
    #[error("log sink error: {0}")]
    Generic(String),
}

/// Stage of a rollout attempt that a log line belongs to
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandUnit {
    Init,
    Prepare,
    Apply,
    WaitForSteadyState,
    WrapUp,
    Prune,
}

impl fmt::Display for CommandUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandUnit::Init => "Initialize",
            CommandUnit::Prepare => "Prepare",
            CommandUnit::Apply => "Apply",
            CommandUnit::WaitForSteadyState => "Wait for Steady State",
            CommandUnit::WrapUp => "Wrap Up",
            CommandUnit::Prune => "Prune",
        };
        f.write_str(name)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandExecutionStatus {
    Success,
    Failure,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// One line of execution log
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub attempt_id: Uuid,
    pub release_name: String,
    pub unit: CommandUnit,
    pub level: LogLevel,
    pub message: String,
    /// Set on the record that closes a unit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<CommandExecutionStatus>,
    pub timestamp: DateTime<Utc>,
}

/// Destination for execution log records
#[async_trait]
pub trait ExecutionLogSink: Send + Sync {
    async fn publish(&self, record: &LogRecord) -> Result<(), LogSinkError>;
}

/// Default sink, forwards records to `tracing`
pub struct TracingLogSink;

#[async_trait]
impl ExecutionLogSink for TracingLogSink {
    async fn publish(&self, record: &LogRecord) -> Result<(), LogSinkError> {
        let attempt = record.attempt_id.to_string();
        match record.level {
            LogLevel::Info => info!(
                attempt_id = %attempt,
                release = %record.release_name,
                unit = %record.unit,
                status = ?record.status,
                "{}", record.message
            ),
            LogLevel::Warn => warn!(
                attempt_id = %attempt,
                release = %record.release_name,
                unit = %record.unit,
                "{}", record.message
            ),
            LogLevel::Error => error!(
                attempt_id = %attempt,
                release = %record.release_name,
                unit = %record.unit,
                status = ?record.status,
                "{}", record.message
            ),
        }
        Ok(())
    }
}

/// Sink that POSTs each record as JSON to a callback URL
pub struct HttpLogSink {
    client: reqwest::Client,
    sink_url: Option<String>,
}

impl HttpLogSink {
    /// Create a sink; with no URL every record is dropped
    pub fn new(sink_url: Option<String>) -> Self {
        HttpLogSink {
            client: reqwest::Client::new(),
            sink_url,
        }
    }
}

#[async_trait]
impl ExecutionLogSink for HttpLogSink {
    async fn publish(&self, record: &LogRecord) -> Result<(), LogSinkError> {
        let Some(url) = &self.sink_url else {
            return Ok(()); // No sink URL configured, skip
        };

        self.client
            .post(url)
            .json(record)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| LogSinkError::Generic(format!("HTTP POST failed: {}", e)))?;

        Ok(())
    }
}

/// Mock log sink for testing - stores records in memory
#[cfg(test)]
pub struct MockLogSink {
    records: Arc<std::sync::Mutex<Vec<LogRecord>>>,
}

#[cfg(test)]
impl Default for MockLogSink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl MockLogSink {
    pub fn new() -> Self {
        MockLogSink {
            records: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    #[allow(clippy::unwrap_used)]
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().unwrap().clone()
    }

    /// Every message, in publish order
    pub fn messages(&self) -> Vec<String> {
        self.records().into_iter().map(|r| r.message).collect()
    }

    /// Closing status of each unit, in the order units were closed
    pub fn unit_statuses(&self) -> Vec<(CommandUnit, CommandExecutionStatus)> {
        self.records()
            .into_iter()
            .filter_map(|r| r.status.map(|s| (r.unit, s)))
            .collect()
    }
}

#[cfg(test)]
#[async_trait]
impl ExecutionLogSink for MockLogSink {
    async fn publish(&self, record: &LogRecord) -> Result<(), LogSinkError> {
        #[allow(clippy::unwrap_used)]
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

/// Writes records for one command unit of one attempt
///
/// Sink failures never fail the attempt; they are logged and dropped.
pub struct UnitLog {
    sink: Arc<dyn ExecutionLogSink>,
    clock: Arc<dyn Clock>,
    attempt_id: Uuid,
    release_name: String,
    unit: CommandUnit,
}

impl UnitLog {
    pub fn new(
        sink: Arc<dyn ExecutionLogSink>,
        clock: Arc<dyn Clock>,
        attempt_id: Uuid,
        release_name: &str,
        unit: CommandUnit,
    ) -> Self {
        UnitLog {
            sink,
            clock,
            attempt_id,
            release_name: release_name.to_string(),
            unit,
        }
    }

    pub fn unit(&self) -> CommandUnit {
        self.unit
    }

    async fn publish(
        &self,
        level: LogLevel,
        message: &str,
        status: Option<CommandExecutionStatus>,
    ) {
        let record = LogRecord {
            attempt_id: self.attempt_id,
            release_name: self.release_name.clone(),
            unit: self.unit,
            level,
            message: message.to_string(),
            status,
            timestamp: self.clock.now(),
        };
        if let Err(e) = self.sink.publish(&record).await {
            warn!(error = %e, unit = %self.unit, "Failed to publish execution log (non-fatal)");
        }
    }

    pub async fn info(&self, message: &str) {
        self.publish(LogLevel::Info, message, None).await;
    }

    pub async fn warn(&self, message: &str) {
        self.publish(LogLevel::Warn, message, None).await;
    }

    /// Close the unit successfully
    pub async fn success(&self, message: &str) {
        self.publish(LogLevel::Info, message, Some(CommandExecutionStatus::Success))
            .await;
    }

    /// Close the unit as failed
    pub async fn failure(&self, message: &str) {
        self.publish(LogLevel::Error, message, Some(CommandExecutionStatus::Failure))
            .await;
    }
}

//! Shared data types that flow between pipeline stages.
//!
//! `LogRecord` moves parser -> validator -> batch -> uploader by value; once a
//! record reaches the batch it is never mutated again (see DESIGN.md §ownership).

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The five severities recognised by the validator, case-insensitive on input,
/// canonicalised to this casing on output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Some(Severity::Debug),
            "info" => Some(Severity::Info),
            "warning" | "warn" => Some(Severity::Warning),
            "error" => Some(Severity::Error),
            "critical" | "crit" | "fatal" => Some(Severity::Critical),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Debug => "Debug",
            Severity::Info => "Info",
            Severity::Warning => "Warning",
            Severity::Error => "Error",
            Severity::Critical => "Critical",
        }
    }
}

/// Nested `error` object optionally attached to a record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Diagnostic stack trace. Never HTML-escaped (§4.2) — it is not rendered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// A normalised log entry, materialised by the parser, mutated only by the
/// validator (metadata assignment + HTML-escaping), then immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: String,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub level: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    /// Pipeline-assigned: the file this record was parsed from.
    pub source_file: PathBuf,
    /// Pipeline-assigned: when the validator processed this record.
    pub processed_at: DateTime<Utc>,
}

impl LogRecord {
    /// Approximate wire byte-size used only for flush triggering (§4.6), not
    /// for real wire framing.
    pub fn estimated_size_bytes(&self) -> usize {
        const OVERHEAD: usize = 100;
        self.id.len()
            + self.device_id.len()
            + self.message.len()
            + self.level.as_str().len()
            + self.source_file.as_os_str().len()
            + OVERHEAD
    }
}

/// Processing state of one observed file (§3 FileJob).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Tracked,
    Stable,
    Parsing,
    Uploading,
    Processed,
    Failed,
}

/// A unit of work representing one observed file. Only one active job exists
/// per path at a time (enforced by the orchestrator's job table).
#[derive(Debug, Clone)]
pub struct FileJob {
    pub path: PathBuf,
    pub first_seen: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub size_bytes: u64,
    pub state: JobState,
}

impl FileJob {
    pub fn new(path: PathBuf, now: DateTime<Utc>, size_bytes: u64) -> Self {
        Self {
            path,
            first_seen: now,
            last_modified: now,
            size_bytes,
            state: JobState::Tracked,
        }
    }

    /// Whether `to` is a legal transition from the job's current state (§3).
    pub fn can_transition(&self, to: JobState) -> bool {
        use JobState::*;
        if to == Failed {
            return !matches!(self.state, Processed | Failed);
        }
        matches!(
            (self.state, to),
            (Tracked, Stable) | (Stable, Parsing) | (Parsing, Uploading) | (Uploading, Processed)
        )
    }

    pub fn transition(&mut self, to: JobState) -> bool {
        if self.can_transition(to) {
            self.state = to;
            true
        } else {
            false
        }
    }
}

/// Upload-client connection state machine (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Error,
    /// Terminal; reached only on explicit provider disable.
    Disabled,
}

/// A file under the retention manager's purview (§3).
#[derive(Debug, Clone)]
pub struct RetentionEntry {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub last_modified: DateTime<Utc>,
    pub compressed: bool,
    pub large_file: bool,
}

/// Health state reported per probed subsystem (§4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// `{ filesystem, iothub, checked_at }` snapshot exposed by the health reporter.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub filesystem: HealthState,
    pub iothub: HealthState,
    pub checked_at: DateTime<Utc>,
}

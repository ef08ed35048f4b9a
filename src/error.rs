//! Error enums, one family per component, following the error-kind table in
//! spec §7. Library code returns these; the orchestrator/CLI boundary wraps
//! them in `anyhow::Error` with added operator-facing context.

use thiserror::Error;

/// Errors the encoding detector can surface. Per §4.1 it never panics; every
/// failure mode is represented here instead.
#[derive(Debug, Error)]
pub enum EncodingError {
    #[error("file not found: {0}")]
    NotFound(std::path::PathBuf),
    #[error("io error reading {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors surfaced while processing one file (§4.4 File Processor). Parse and
/// validation failures never reach this level — they are accounted per-line
/// and the file still succeeds.
#[derive(Debug, Error)]
pub enum FileProcessorError {
    #[error("encoding detection failed: {0}")]
    Encoding(#[from] EncodingError),
    #[error("filesystem error (transient, will retry on next event): {0}")]
    FilesystemTransient(std::io::Error),
    #[error("filesystem error (permanent): {0}")]
    FilesystemPermanent(std::io::Error),
}

/// Upload client failure taxonomy (§4.7, §7). The upload client distinguishes
/// transient (retryable) from permanent (surfaced immediately) causes in its
/// own type rather than stringly.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("network timeout or transient failure: {0}")]
    NetworkTransient(String),
    #[error("http {status}: {body}")]
    HttpTransient { status: u16, body: String },
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("http {status}: {body}")]
    HttpPermanent { status: u16, body: String },
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("connect retries exhausted after {attempts} attempts: {last_error}")]
    ConnectExhausted { attempts: u32, last_error: String },
    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
    #[error("not connected")]
    NotConnected,
    #[error("connection semaphore lock-acquire timed out")]
    LockTimeout,
    #[error("local file io error: {0}")]
    LocalIo(std::io::Error),
}

impl UploadError {
    /// Whether the retry policy should attempt this operation again (§4.7,
    /// §7 NetworkTransient vs NetworkPermanent).
    pub fn is_retryable(&self) -> bool {
        match self {
            UploadError::NetworkTransient(_) | UploadError::HttpTransient { .. } => true,
            UploadError::AuthFailed(_)
            | UploadError::HttpPermanent { .. }
            | UploadError::MalformedRequest(_)
            | UploadError::Cancelled
            | UploadError::ConnectExhausted { .. }
            | UploadError::RetriesExhausted { .. }
            | UploadError::NotConnected
            | UploadError::LockTimeout
            | UploadError::LocalIo(_) => false,
        }
    }
}

/// Retention manager failures. All retention file operations are best-effort
/// (§4.8); this type exists for the handful of paths that must be surfaced
/// (e.g. an unreadable directory at the root of a configured sweep).
#[derive(Debug, Error)]
pub enum RetentionError {
    #[error("io error on {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("disk statistics unavailable for {path}: {0}", path = .0.display())]
    DiskStatsUnavailable(std::path::PathBuf),
}

/// Configuration load/validation failure (§7 Configuration: fatal, refuse to
/// start). Collected into `anyhow::Error` at the CLI boundary.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config file {path}: {source}")]
    Parse {
        path: std::path::PathBuf,
        #[source]
        source: Box<toml::de::Error>,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Outcome of a cooperative, cancellable operation (§5). Cancellation is
/// distinct from error — callers match on this rather than propagating a
/// generic error for a cooperative stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome<T> {
    Completed(T),
    Cancelled,
}

impl<T> Outcome<T> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }
}

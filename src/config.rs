//! `AgentConfig` — the fully-resolved, validated configuration object (§10.3).
//!
//! Deserialized from TOML via serde; every field in spec §6 has a typed home
//! with the stated default, except `monitoring_paths` and the IoT Hub auth
//! fields, which are required. A validation pass after deserialization
//! enforces the cross-field invariants the type system cannot express.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_s")]
    pub initial_backoff_s: f64,
    #[serde(default = "default_max_backoff_s")]
    pub max_backoff_s: f64,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_initial_backoff_s() -> f64 {
    1.0
}
fn default_max_backoff_s() -> f64 {
    30.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_s: default_initial_backoff_s(),
            max_backoff_s: default_max_backoff_s(),
        }
    }
}

/// Device authentication: either a connection string or a pre-issued triple.
/// Both resolve to the same `DeviceAuth` (see `upload::auth`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IotHubConfig {
    #[serde(default)]
    pub connection_string: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub sas_token: Option<String>,
    #[serde(default = "default_upload_folder")]
    pub upload_folder: String,
}

fn default_upload_folder() -> String {
    "logs".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_large_file_retention_days")]
    pub large_file_retention_days: u32,
    #[serde(default = "default_large_file_size_threshold")]
    pub large_file_size_threshold: u64,
    #[serde(default)]
    pub archive_subdir: String,
    #[serde(default = "default_true")]
    pub compress_processed_files: bool,
    #[serde(default)]
    pub min_free_disk_gb: Option<f64>,
}

fn default_retention_days() -> u32 {
    7
}
fn default_large_file_retention_days() -> u32 {
    30
}
fn default_large_file_size_threshold() -> u64 {
    50 * 1024 * 1024
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            large_file_retention_days: default_large_file_retention_days(),
            large_file_size_threshold: default_large_file_size_threshold(),
            archive_subdir: String::new(),
            compress_processed_files: true,
            min_free_disk_gb: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_retention_days() -> u32 {
    7
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
            retention_days: default_log_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthConfig {
    #[serde(default)]
    pub listen_addr: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub monitoring_paths: Vec<PathBuf>,
    #[serde(default)]
    pub file_filter: Option<String>,
    #[serde(default)]
    pub file_extensions: Vec<String>,
    #[serde(default = "default_stabilization_period_seconds")]
    pub stabilization_period_seconds: u64,
    #[serde(default = "default_max_directories")]
    pub max_directories: usize,
    #[serde(default = "default_max_batch_size_bytes")]
    pub max_batch_size_bytes: u64,
    #[serde(default = "default_max_batch_items")]
    pub max_batch_items: usize,
    #[serde(default = "default_processing_interval_seconds")]
    pub processing_interval_seconds: u64,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_large_file_size_threshold")]
    pub large_file_size_threshold: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub iothub: IotHubConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

fn default_stabilization_period_seconds() -> u64 {
    5
}
fn default_max_directories() -> usize {
    10
}
fn default_max_batch_size_bytes() -> u64 {
    1024 * 1024
}
fn default_max_batch_items() -> usize {
    10_000
}
fn default_processing_interval_seconds() -> u64 {
    30
}
fn default_idle_timeout_ms() -> u64 {
    5_000
}

impl AgentConfig {
    /// Load from a TOML file, apply defaults, then run cross-field validation.
    /// Any violation produces a `ConfigError::Invalid` — fatal, refuse to start.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: AgentConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-field invariants the type system can't express (§10.3).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.monitoring_paths.is_empty() {
            return Err(ConfigError::Invalid(
                "monitoring_paths must be non-empty".to_string(),
            ));
        }
        if self.monitoring_paths.len() > self.max_directories {
            return Err(ConfigError::Invalid(format!(
                "monitoring_paths has {} entries, exceeds max_directories ({})",
                self.monitoring_paths.len(),
                self.max_directories
            )));
        }

        let has_conn_string = self.iothub.connection_string.is_some();
        let has_triple = self.iothub.host.is_some()
            || self.iothub.device_id.is_some()
            || self.iothub.sas_token.is_some();
        if has_conn_string && has_triple {
            return Err(ConfigError::Invalid(
                "iothub: supply either connection_string or {host, device_id, sas_token}, not both"
                    .to_string(),
            ));
        }
        if !has_conn_string && !has_triple {
            return Err(ConfigError::Invalid(
                "iothub: one of connection_string or {host, device_id, sas_token} is required"
                    .to_string(),
            ));
        }
        if has_triple
            && (self.iothub.host.is_none()
                || self.iothub.device_id.is_none()
                || self.iothub.sas_token.is_none())
        {
            return Err(ConfigError::Invalid(
                "iothub: host, device_id, and sas_token must all be supplied together".to_string(),
            ));
        }

        if self.retry.initial_backoff_s > self.retry.max_backoff_s {
            return Err(ConfigError::Invalid(
                "retry.initial_backoff_s must be <= retry.max_backoff_s".to_string(),
            ));
        }
        if self.retention.retention_days > self.retention.large_file_retention_days {
            return Err(ConfigError::Invalid(
                "retention.retention_days must be <= retention.large_file_retention_days"
                    .to_string(),
            ));
        }

        Ok(())
    }

    /// Layer CLI overrides onto a file-loaded base config, the way the CLI's
    /// scalar flags take precedence over the file (§10.3 `with_overrides`).
    pub fn with_overrides(mut self, extra_paths: &[PathBuf], log_level: Option<&str>) -> Self {
        self.monitoring_paths.extend(extra_paths.iter().cloned());
        if let Some(level) = log_level {
            self.log.level = level.to_string();
        }
        self
    }
}

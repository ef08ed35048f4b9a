//! Health Reporter (C12, spec §4.10). Pure reads plus one bounded-latency
//! probe each; invoked from a dedicated periodic task and cached for
//! whatever exposes it (e.g. the CLI `health` subcommand).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::model::{ConnectionState, HealthReport, HealthState};
use crate::retention::RetentionManager;
use crate::upload::UploadClient;

const IOTHUB_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const MIN_AVAILABLE_RATIO: f64 = 0.1;

pub struct HealthReporter {
    directories: Vec<PathBuf>,
    retention: Arc<RetentionManager>,
    upload: Option<Arc<UploadClient>>,
}

impl HealthReporter {
    pub fn new(
        directories: Vec<PathBuf>,
        retention: Arc<RetentionManager>,
        upload: Option<Arc<UploadClient>>,
    ) -> Self {
        Self {
            directories,
            retention,
            upload,
        }
    }

    /// Healthy if every monitored directory exists, is writable, and the
    /// backing volume's available ratio clears the configured threshold.
    /// Degraded if a minority of directories fail; Unhealthy otherwise.
    pub fn check_filesystem(&self) -> HealthState {
        if self.directories.is_empty() {
            return HealthState::Unhealthy;
        }

        let mut failing = 0usize;
        for dir in &self.directories {
            if !dir_is_healthy(dir, &self.retention) {
                failing += 1;
            }
        }

        if failing == 0 {
            HealthState::Healthy
        } else if failing < self.directories.len() {
            HealthState::Degraded
        } else {
            HealthState::Unhealthy
        }
    }

    /// Healthy when connected; Degraded mid-connect; Unhealthy otherwise,
    /// after a single bounded on-demand connect attempt if disconnected.
    pub async fn check_iothub(&self) -> HealthState {
        let Some(upload) = &self.upload else {
            return HealthState::Unhealthy;
        };

        match upload.connection_state() {
            ConnectionState::Connected => HealthState::Healthy,
            ConnectionState::Connecting => HealthState::Degraded,
            ConnectionState::Disconnected => {
                let cancel = CancellationToken::new();
                let probe = tokio::time::timeout(IOTHUB_PROBE_TIMEOUT, upload.connect(&cancel));
                match probe.await {
                    Ok(Ok(_)) => HealthState::Healthy,
                    _ => HealthState::Unhealthy,
                }
            }
            ConnectionState::Error | ConnectionState::Disconnecting | ConnectionState::Disabled => {
                HealthState::Unhealthy
            }
        }
    }

    pub async fn snapshot(&self) -> HealthReport {
        HealthReport {
            filesystem: self.check_filesystem(),
            iothub: self.check_iothub().await,
            checked_at: Utc::now(),
        }
    }
}

fn dir_is_healthy(dir: &Path, retention: &RetentionManager) -> bool {
    if !dir.exists() {
        debug!(dir = %dir.display(), "health check: directory missing");
        return false;
    }
    if !probe_writable(dir) {
        debug!(dir = %dir.display(), "health check: directory not writable");
        return false;
    }
    match retention.available_ratio(dir) {
        Ok(ratio) if ratio >= MIN_AVAILABLE_RATIO => true,
        Ok(ratio) => {
            debug!(dir = %dir.display(), ratio, "health check: available disk ratio below threshold");
            false
        }
        Err(_) => false,
    }
}

fn probe_writable(dir: &Path) -> bool {
    let probe = dir.join(format!(".health-probe-{}", Uuid::new_v4()));
    match std::fs::File::create(&probe) {
        Ok(_) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

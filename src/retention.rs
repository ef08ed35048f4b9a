//! Retention Manager (C9, spec §4.8). Scheduled and disk-pressure-driven
//! cleanup of processed files: compress, archive or delete, with an
//! emergency path when a monitored volume runs low on space.
//!
//! Disk statistics are read via `libc::statvfs`, reporting total bytes as
//! well as free bytes so callers can compute an available ratio.

use std::ffi::CString;
use std::fs::File;
use std::io::{Read, Write};
use std::mem::MaybeUninit;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RetentionConfig;
use crate::error::RetentionError;
use crate::error_tracker::ConsecutiveErrorTracker;
use crate::model::RetentionEntry;

const PROCESSED_SUFFIX: &str = ".processed";
const DISK_CHECK_INTERVAL: Duration = Duration::from_secs(30 * 60);
const PERIODIC_CLEANUP_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);
const COMPRESS_MIN_AGE: chrono::Duration = chrono::Duration::hours(1);
const EMERGENCY_RATIO_THRESHOLD: f64 = 0.2;
const EMERGENCY_RECHECK_EVERY: usize = 10;

#[derive(Debug, Clone, Default)]
pub struct CleanupSummary {
    pub compressed: usize,
    pub archived: usize,
    pub deleted: usize,
    pub errors: usize,
}

pub struct RetentionManager {
    directories: Vec<PathBuf>,
    config: RetentionConfig,
    disk_error_tracker: ConsecutiveErrorTracker,
}

impl RetentionManager {
    pub fn new(directories: Vec<PathBuf>, config: RetentionConfig) -> Arc<Self> {
        Arc::new(Self {
            directories,
            config,
            disk_error_tracker: ConsecutiveErrorTracker::new(),
        })
    }

    /// `free_bytes / total_bytes` for the volume backing `path`, or an error
    /// if `statvfs` fails (missing directory, unsupported platform).
    pub fn available_ratio(&self, path: &Path) -> Result<f64, RetentionError> {
        let (free, total) = disk_stats(path)?;
        if total == 0 {
            return Ok(1.0);
        }
        Ok(free as f64 / total as f64)
    }

    /// Run on the 30-minute disk-check cadence: escalate to emergency
    /// cleanup for any directory below the pressure threshold.
    pub async fn check_disk_pressure(&self) {
        for dir in self.directories.clone() {
            let ratio = match self.available_ratio(&dir) {
                Ok(r) => r,
                Err(e) => {
                    if self.disk_error_tracker.record_error() {
                        warn!(dir = %dir.display(), error = %e, "disk stats unavailable");
                    }
                    continue;
                }
            };
            if let Some(recovered) = self.disk_error_tracker.record_success() {
                info!(after_failures = recovered, "disk stats probe recovered");
            }
            if ratio < EMERGENCY_RATIO_THRESHOLD {
                warn!(dir = %dir.display(), available_ratio = ratio, "disk pressure, running emergency cleanup");
                self.run_emergency_cleanup(&dir).await;
            }
        }
    }

    /// Run standard cleanup across every configured directory (6h cadence).
    pub async fn run_periodic_cleanup(&self) {
        for dir in self.directories.clone() {
            let summary = self.run_standard_cleanup(&dir).await;
            info!(
                dir = %dir.display(),
                compressed = summary.compressed,
                archived = summary.archived,
                deleted = summary.deleted,
                errors = summary.errors,
                "retention sweep complete"
            );
        }
    }

    /// Standard cleanup (§4.8): compress aged candidates, then archive-or-
    /// delete anything past its retention window.
    pub async fn run_standard_cleanup(&self, dir: &Path) -> CleanupSummary {
        let dir = dir.to_path_buf();
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || standard_cleanup_blocking(&dir, &config))
            .await
            .unwrap_or_default()
    }

    /// Emergency cleanup (§4.8): compress everything, then delete oldest-
    /// first until pressure is relieved.
    pub async fn run_emergency_cleanup(&self, dir: &Path) -> CleanupSummary {
        let dir = dir.to_path_buf();
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || emergency_cleanup_blocking(&dir, &config))
            .await
            .unwrap_or_default()
    }

    /// Launch the two scheduling loops. Runs until `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut disk_ticker = tokio::time::interval(DISK_CHECK_INTERVAL);
            let mut cleanup_ticker = tokio::time::interval(PERIODIC_CLEANUP_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("retention manager stopping");
                        break;
                    }
                    _ = disk_ticker.tick() => {
                        self.check_disk_pressure().await;
                    }
                    _ = cleanup_ticker.tick() => {
                        self.run_periodic_cleanup().await;
                    }
                }
            }
        })
    }
}

fn disk_stats(path: &Path) -> Result<(u64, u64), RetentionError> {
    disk_stats_impl(path).ok_or_else(|| RetentionError::DiskStatsUnavailable(path.to_path_buf()))
}

#[cfg(unix)]
fn disk_stats_impl(path: &Path) -> Option<(u64, u64)> {
    let path_str = CString::new(path.to_string_lossy().as_bytes()).ok()?;
    unsafe {
        let mut stat: MaybeUninit<libc::statvfs> = MaybeUninit::uninit();
        if libc::statvfs(path_str.as_ptr(), stat.as_mut_ptr()) == 0 {
            let s = stat.assume_init();
            let free = s.f_bavail as u64 * s.f_frsize as u64;
            let total = s.f_blocks as u64 * s.f_frsize as u64;
            Some((free, total))
        } else {
            None
        }
    }
}

#[cfg(not(unix))]
fn disk_stats_impl(_path: &Path) -> Option<(u64, u64)> {
    None
}

fn is_candidate(path: &Path) -> bool {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(n) => n,
        None => return false,
    };
    name.ends_with(PROCESSED_SUFFIX) || name.ends_with(".processed.gz")
}

fn is_compressed(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("gz")
}

fn scan_candidates(dir: &Path, config: &RetentionConfig) -> Vec<RetentionEntry> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() || !is_candidate(&path) {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let last_modified: DateTime<Utc> = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        let size_bytes = metadata.len();
        out.push(RetentionEntry {
            path,
            size_bytes,
            last_modified,
            compressed: is_compressed(&entry.path()),
            large_file: size_bytes >= config.large_file_size_threshold,
        });
    }
    out
}

/// Gzip `path` to `{path}.gz`, verify by decompressing, and only then delete
/// the original (§4.8). On verification failure the partial `.gz` is removed
/// and the original kept untouched.
fn compress_and_verify(path: &Path) -> Result<PathBuf, std::io::Error> {
    let gz_path = {
        let mut name = path.as_os_str().to_owned();
        name.push(".gz");
        PathBuf::from(name)
    };

    let mut input = File::open(path)?;
    let output = File::create(&gz_path)?;
    let mut encoder = GzEncoder::new(output, Compression::default());
    std::io::copy(&mut input, &mut encoder)?;
    encoder.finish()?;

    let verified = (|| -> std::io::Result<bool> {
        let file = File::open(&gz_path)?;
        let mut decoder = flate2::read::GzDecoder::new(file);
        let mut buf = Vec::new();
        decoder.read_to_end(&mut buf)?;
        Ok(!buf.is_empty())
    })()
    .unwrap_or(false);

    if verified {
        std::fs::remove_file(path)?;
        Ok(gz_path)
    } else {
        let _ = std::fs::remove_file(&gz_path);
        Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "gzip verification failed, kept original",
        ))
    }
}

fn archive_or_delete(entry: &RetentionEntry, archive_subdir: &str) -> std::io::Result<bool> {
    if archive_subdir.is_empty() {
        std::fs::remove_file(&entry.path)?;
        return Ok(false);
    }

    let parent = entry.path.parent().unwrap_or(Path::new("."));
    let archive_dir = parent.join(archive_subdir);
    if let Err(e) = std::fs::create_dir_all(&archive_dir) {
        warn!(dir = %archive_dir.display(), error = %e, "could not create archive dir, deleting instead");
        std::fs::remove_file(&entry.path)?;
        return Ok(false);
    }

    let name = entry.path.file_name().unwrap_or_default();
    let dest = archive_dir.join(name);
    match std::fs::rename(&entry.path, &dest) {
        Ok(()) => Ok(true),
        Err(e) => {
            warn!(path = %entry.path.display(), error = %e, "archive move failed, deleting instead");
            std::fs::remove_file(&entry.path)?;
            Ok(false)
        }
    }
}

fn standard_cleanup_blocking(dir: &Path, config: &RetentionConfig) -> CleanupSummary {
    let mut summary = CleanupSummary::default();
    let now = Utc::now();

    let mut entries = scan_candidates(dir, config);

    if config.compress_processed_files {
        for entry in entries.iter_mut() {
            if entry.compressed || now - entry.last_modified < COMPRESS_MIN_AGE {
                continue;
            }
            match compress_and_verify(&entry.path) {
                Ok(gz_path) => {
                    debug!(path = %gz_path.display(), "compressed processed file");
                    entry.path = gz_path;
                    entry.compressed = true;
                    summary.compressed += 1;
                }
                Err(e) => {
                    warn!(path = %entry.path.display(), error = %e, "compression failed");
                    summary.errors += 1;
                }
            }
        }
    }

    for entry in &entries {
        let retention_days = if entry.large_file {
            config.large_file_retention_days
        } else {
            config.retention_days
        };
        let age_days = (now - entry.last_modified).num_days();
        if age_days <= retention_days as i64 {
            continue;
        }
        match archive_or_delete(entry, &config.archive_subdir) {
            Ok(true) => summary.archived += 1,
            Ok(false) => summary.deleted += 1,
            Err(e) => {
                warn!(path = %entry.path.display(), error = %e, "archive/delete failed");
                summary.errors += 1;
            }
        }
    }

    summary
}

fn emergency_cleanup_blocking(dir: &Path, config: &RetentionConfig) -> CleanupSummary {
    let mut summary = CleanupSummary::default();
    let mut entries = scan_candidates(dir, config);

    if config.compress_processed_files {
        for entry in entries.iter_mut() {
            if entry.compressed {
                continue;
            }
            match compress_and_verify(&entry.path) {
                Ok(gz_path) => {
                    entry.path = gz_path;
                    entry.compressed = true;
                    summary.compressed += 1;
                }
                Err(e) => {
                    warn!(path = %entry.path.display(), error = %e, "emergency compression failed");
                    summary.errors += 1;
                }
            }
        }
    }

    entries.sort_by_key(|e| e.last_modified);

    for (i, entry) in entries.iter().enumerate() {
        if i % EMERGENCY_RECHECK_EVERY == 0 && i > 0 {
            if let Some((free, total)) = disk_stats_impl(dir) {
                if total > 0 && free as f64 / total as f64 >= EMERGENCY_RATIO_THRESHOLD {
                    info!(deleted = summary.deleted, "disk pressure relieved, stopping emergency cleanup");
                    break;
                }
            }
        }
        match std::fs::remove_file(&entry.path) {
            Ok(()) => summary.deleted += 1,
            Err(e) => {
                warn!(path = %entry.path.display(), error = %e, "emergency delete failed");
                summary.errors += 1;
            }
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config() -> RetentionConfig {
        RetentionConfig {
            retention_days: 7,
            large_file_retention_days: 30,
            large_file_size_threshold: 1024 * 1024,
            archive_subdir: String::new(),
            compress_processed_files: true,
            min_free_disk_gb: None,
        }
    }

    fn write_aged_file(dir: &Path, name: &str, age_days: i64) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"some log content\n").unwrap();
        let old = std::time::SystemTime::now() - std::time::Duration::from_secs((age_days * 86400) as u64);
        let file_time = filetime::FileTime::from_system_time(old);
        filetime::set_file_mtime(&path, file_time).ok();
        path
    }

    #[test]
    fn candidate_detection_matches_processed_suffix() {
        assert!(is_candidate(Path::new("a.jsonl.processed")));
        assert!(is_candidate(Path::new("a.jsonl.processed.gz")));
        assert!(!is_candidate(Path::new("a.jsonl")));
    }

    #[test]
    fn compress_and_verify_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.processed");
        std::fs::write(&path, b"hello world, repeated ".repeat(50)).unwrap();

        let gz_path = compress_and_verify(&path).unwrap();
        assert!(gz_path.exists());
        assert!(!path.exists());

        let mut decoder = flate2::read::GzDecoder::new(File::open(&gz_path).unwrap());
        let mut buf = String::new();
        decoder.read_to_string(&mut buf).unwrap();
        assert!(buf.starts_with("hello world"));
    }

    #[test]
    fn standard_cleanup_deletes_past_retention_without_archive_subdir() {
        let dir = tempdir().unwrap();
        let mut config = test_config();
        config.compress_processed_files = false;
        let old_path = write_aged_file(dir.path(), "old.jsonl.processed", 10);
        let fresh_path = write_aged_file(dir.path(), "fresh.jsonl.processed", 1);

        let summary = standard_cleanup_blocking(dir.path(), &config);
        assert_eq!(summary.deleted, 1);
        assert!(!old_path.exists());
        assert!(fresh_path.exists());
    }

    #[test]
    fn standard_cleanup_archives_when_subdir_configured() {
        let dir = tempdir().unwrap();
        let mut config = test_config();
        config.compress_processed_files = false;
        config.archive_subdir = "archive".to_string();
        let old_path = write_aged_file(dir.path(), "old.jsonl.processed", 10);

        let summary = standard_cleanup_blocking(dir.path(), &config);
        assert_eq!(summary.archived, 1);
        assert!(!old_path.exists());
        assert!(dir.path().join("archive").join("old.jsonl.processed").exists());
    }

    #[test]
    fn emergency_cleanup_deletes_oldest_first() {
        let dir = tempdir().unwrap();
        let mut config = test_config();
        config.compress_processed_files = false;
        write_aged_file(dir.path(), "a.jsonl.processed", 5);
        write_aged_file(dir.path(), "b.jsonl.processed", 1);

        let summary = emergency_cleanup_blocking(dir.path(), &config);
        // With disk pressure never relieved in this sandbox, both are deleted.
        assert_eq!(summary.deleted, 2);
    }
}

//! Orchestrator (C10, spec §4.9). Wires the directory watcher, stability
//! detector, file processor, batch processor, and upload client together and
//! owns the process lifecycle: startup scan, steady-state event loop,
//! ordered shutdown.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batch::{BatchProcessor, BatchSink};
use crate::config::AgentConfig;
use crate::health::HealthReporter;
use crate::journal::Journal;
use crate::model::{FileJob, JobState, LogRecord};
use crate::pipeline::file_processor::{self, PreFilter};
use crate::retention::RetentionManager;
use crate::upload::auth::DeviceAuth;
use crate::upload::{HttpTransport, UploadClient};
use crate::watcher::{DirectoryWatcher, StabilityDetector};

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct Orchestrator {
    config: AgentConfig,
    batch: Arc<BatchProcessor>,
    upload: Arc<UploadClient>,
    retention: Arc<RetentionManager>,
    health: HealthReporter,
    journal: Option<Journal>,
    jobs: Mutex<HashMap<PathBuf, FileJob>>,
    /// Records remaining before a file's batched records have all been
    /// delivered by the batch processor's flush sink, keyed by source file.
    pending_batch: Arc<Mutex<HashMap<PathBuf, usize>>>,
    ready_tx: mpsc::Sender<PathBuf>,
    ready_rx: Mutex<mpsc::Receiver<PathBuf>>,
    retry_queue: Mutex<VecDeque<PathBuf>>,
}

impl Orchestrator {
    pub fn new(config: AgentConfig) -> Result<Arc<Self>> {
        let auth = DeviceAuth::from_config(&config.iothub).context("resolving device auth")?;
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("building upload HTTP client")?;
        let transport = Arc::new(HttpTransport::new(http_client, &auth.host, &auth.device_id));
        let upload = Arc::new(
            UploadClient::new(transport, &config.iothub)
                .context("constructing upload client")?
                .with_retry_config(config.retry.clone()),
        );

        let retention = RetentionManager::new(config.monitoring_paths.clone(), config.retention.clone());
        let health = HealthReporter::new(
            config.monitoring_paths.clone(),
            retention.clone(),
            Some(upload.clone()),
        );

        let journal = config.log.dir.as_ref().and_then(|dir| match Journal::open_default(dir) {
            Ok(j) => Some(j),
            Err(e) => {
                warn!(error = %e, "operational journal unavailable, continuing without it");
                None
            }
        });

        let pending_batch: Arc<Mutex<HashMap<PathBuf, usize>>> = Arc::new(Mutex::new(HashMap::new()));
        let (ready_tx, ready_rx) = mpsc::channel(1024);

        let sink = make_batch_sink(pending_batch.clone(), ready_tx.clone());
        let batch = BatchProcessor::new(
            config.max_batch_size_bytes,
            config.max_batch_items,
            Duration::from_millis(config.idle_timeout_ms),
            Duration::from_secs(config.processing_interval_seconds),
            sink,
        );

        Ok(Arc::new(Self {
            config,
            batch,
            upload,
            retention,
            health,
            journal,
            jobs: Mutex::new(HashMap::new()),
            pending_batch,
            ready_tx,
            ready_rx: Mutex::new(ready_rx),
            retry_queue: Mutex::new(VecDeque::new()),
        }))
    }

    /// Startup validation, initial full scan, then the steady-state loop.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        info!(paths = ?self.config.monitoring_paths, "starting edge log agent");

        let mut watcher = DirectoryWatcher::new(
            &self.config.monitoring_paths,
            self.config.file_extensions.clone(),
            self.config.max_directories,
        )
        .context("starting directory watcher")?;

        let (stability, mut stable_rx) =
            StabilityDetector::new(self.config.stabilization_period_seconds, 1000);
        let stability_handle = stability.clone().spawn(cancel.child_token());

        self.initial_scan(&stability).await;

        let batch_cancel = CancellationToken::new();
        let batch_handle = self.batch.clone().spawn(batch_cancel.clone());
        let retention_handle = self.retention.clone().spawn(cancel.child_token());

        let mut health_ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        let retry_period =
            Duration::from_secs(self.config.processing_interval_seconds.max(1) * 2);
        let mut retry_ticker = tokio::time::interval(retry_period);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("shutdown signal received");
                    break;
                }
                event = watcher.next_event() => {
                    match event {
                        Some(path) => stability.track(path).await,
                        None => {
                            warn!("directory watcher channel closed unexpectedly");
                            break;
                        }
                    }
                }
                Some(path) = stable_rx.recv() => {
                    let this = self.clone();
                    let child_cancel = cancel.child_token();
                    tokio::spawn(async move { this.handle_stable_file(path, &child_cancel).await; });
                }
                ready = Self::recv_ready(&self.ready_rx) => {
                    if let Some(path) = ready {
                        let this = self.clone();
                        let child_cancel = cancel.child_token();
                        tokio::spawn(async move { this.handle_ready_for_upload(path, &child_cancel).await; });
                    }
                }
                _ = health_ticker.tick() => {
                    let report = self.health.snapshot().await;
                    debug!(filesystem = ?report.filesystem, iothub = ?report.iothub, "health snapshot");
                }
                _ = retry_ticker.tick() => {
                    self.retry_failed_uploads(&cancel).await;
                }
            }
        }

        self.shutdown(stability_handle, batch_handle, batch_cancel, retention_handle)
            .await;
        Ok(())
    }

    /// One-shot health snapshot for the CLI `health` subcommand — does not
    /// require `run` to be active.
    pub async fn health_snapshot(&self) -> crate::model::HealthReport {
        self.health.snapshot().await
    }

    async fn recv_ready(rx: &Mutex<mpsc::Receiver<PathBuf>>) -> Option<PathBuf> {
        rx.lock().await.recv().await
    }

    async fn initial_scan(&self, stability: &Arc<StabilityDetector>) {
        for dir in self.config.monitoring_paths.clone() {
            if !dir.exists() {
                continue;
            }
            for entry in walkdir::WalkDir::new(&dir).into_iter().flatten() {
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                if matches!(
                    file_processor::should_process(path, &self.config),
                    Ok(PreFilter::Process)
                ) {
                    stability.track(path.to_path_buf()).await;
                }
            }
        }
        info!("initial directory scan complete");
    }

    async fn handle_stable_file(&self, path: PathBuf, cancel: &CancellationToken) {
        let pre = match file_processor::should_process(&path, &self.config) {
            Ok(p) => p,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "pre-filter check failed");
                return;
            }
        };
        if pre == PreFilter::Skip {
            return;
        }

        let now = Utc::now();
        let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        {
            let mut jobs = self.jobs.lock().await;
            let job = jobs
                .entry(path.clone())
                .or_insert_with(|| FileJob::new(path.clone(), now, size));
            job.transition(JobState::Stable);
            job.transition(JobState::Parsing);
        }

        let result = file_processor::process(&path, cancel).await;
        if !result.success {
            warn!(file = %path.display(), error = ?result.error, "file processing failed");
            self.mark_job(&path, JobState::Failed).await;
            self.journal_outcome(&path, "Failed", 0, 0, result.error.as_deref());
            return;
        }

        debug!(
            file = %path.display(),
            processed = result.processed_records,
            invalid = result.invalid_records,
            "file processed"
        );
        self.journal_outcome(
            &path,
            "Parsing",
            result.processed_records as u64,
            result.invalid_records as u64,
            None,
        );
        self.mark_job(&path, JobState::Uploading).await;

        if result.records.is_empty() {
            let _ = self.ready_tx.send(path).await;
            return;
        }

        {
            let mut pending = self.pending_batch.lock().await;
            pending.insert(path.clone(), result.records.len());
        }
        self.batch.add_range(result.records, cancel).await;
    }

    async fn handle_ready_for_upload(&self, path: PathBuf, cancel: &CancellationToken) {
        let blob_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();

        match self.upload.upload_file(&path, &blob_name, cancel).await {
            Ok(result) if result.ok => {
                self.mark_job(&path, JobState::Processed).await;
                self.journal_outcome(&path, "Processed", 0, 0, None);
                if let Err(e) = mark_processed_on_disk(&path) {
                    warn!(file = %path.display(), error = %e, "could not rename file to processed suffix");
                }
            }
            Ok(result) => {
                warn!(file = %path.display(), error = ?result.error, "upload did not succeed, will retry");
                self.retry_queue.lock().await.push_back(path);
            }
            Err(e) => {
                warn!(file = %path.display(), error = %e, "upload failed, will retry");
                self.retry_queue.lock().await.push_back(path);
            }
        }
    }

    async fn retry_failed_uploads(&self, cancel: &CancellationToken) {
        let paths: Vec<PathBuf> = {
            let mut queue = self.retry_queue.lock().await;
            queue.drain(..).collect()
        };
        for path in paths {
            self.handle_ready_for_upload(path, cancel).await;
        }
    }

    async fn mark_job(&self, path: &Path, state: JobState) {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.get_mut(path) {
            job.transition(state);
        }
    }

    fn journal_outcome(&self, path: &Path, state: &str, processed: u64, invalid: u64, error: Option<&str>) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.record_outcome(path, state, processed, invalid, error) {
                warn!(error = %e, "journal write failed");
            }
        }
    }

    /// Propagate shutdown to every child component in dependency order
    /// (watcher first — it is dropped by the caller when `run` returns —
    /// then batch processor, then upload client, then retention) (§4.9).
    async fn shutdown(
        &self,
        stability_handle: tokio::task::JoinHandle<()>,
        batch_handle: tokio::task::JoinHandle<()>,
        batch_cancel: CancellationToken,
        retention_handle: tokio::task::JoinHandle<()>,
    ) {
        info!("shutdown: stopping stability detector");
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, stability_handle).await;

        info!("shutdown: flushing and stopping batch processor");
        let batch = self.batch.clone();
        let result = batch.stop(batch_cancel, batch_handle).await;
        if !result.ok {
            warn!(error = ?result.error, "final batch flush did not fully succeed");
        }

        info!("shutdown: disconnecting upload client");
        self.upload.disconnect().await;

        info!("shutdown: stopping retention manager");
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, retention_handle).await;
    }
}

fn make_batch_sink(
    pending: Arc<Mutex<HashMap<PathBuf, usize>>>,
    ready_tx: mpsc::Sender<PathBuf>,
) -> BatchSink {
    Arc::new(move |record: LogRecord| {
        let pending = pending.clone();
        let ready_tx = ready_tx.clone();
        Box::pin(async move {
            let source = record.source_file.clone();
            let done = {
                let mut guard = pending.lock().await;
                match guard.get_mut(&source) {
                    Some(count) => {
                        *count = count.saturating_sub(1);
                        *count == 0
                    }
                    None => false,
                }
            };
            if done {
                pending.lock().await.remove(&source);
                let _ = ready_tx.send(source).await;
            }
            Ok(())
        })
    })
}

/// Rename a fully-uploaded file to the `.processed` suffix the retention
/// manager scans for (§4.8).
fn mark_processed_on_disk(path: &Path) -> std::io::Result<PathBuf> {
    let mut name = path.as_os_str().to_owned();
    name.push(".processed");
    let dest = PathBuf::from(name);
    std::fs::rename(path, &dest)?;
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Severity;
    use tempfile::tempdir;

    fn make_record(source: &Path) -> LogRecord {
        LogRecord {
            id: "1".to_string(),
            device_id: "d1".to_string(),
            timestamp: Utc::now(),
            level: Severity::Info,
            message: "x".to_string(),
            category: None,
            tags: vec![],
            error: None,
            source_file: source.to_path_buf(),
            processed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn batch_sink_signals_ready_once_all_records_delivered() {
        let pending = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = mpsc::channel(8);
        let sink = make_batch_sink(pending.clone(), tx);

        let source = PathBuf::from("a.jsonl");
        pending.lock().await.insert(source.clone(), 2);

        sink(make_record(&source)).await.unwrap();
        assert!(rx.try_recv().is_err());

        sink(make_record(&source)).await.unwrap();
        let ready = rx.try_recv().unwrap();
        assert_eq!(ready, source);
    }

    #[test]
    fn mark_processed_renames_with_suffix() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.jsonl");
        std::fs::write(&path, "data").unwrap();

        let dest = mark_processed_on_disk(&path).unwrap();
        assert_eq!(dest, dir.path().join("a.jsonl.processed"));
        assert!(dest.exists());
        assert!(!path.exists());
    }
}

//! Stability Detector (C5, spec §4.5). Tracks recently-touched files and
//! emits a `FileStabilized` event once a file has gone quiet for the
//! configured stabilization period AND a non-exclusive read-probe succeeds.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const PROBE_RETRIES: u32 = 3;
const PROBE_BACKOFF: Duration = Duration::from_millis(100);

pub struct StabilityDetector {
    touched: RwLock<HashMap<PathBuf, DateTime<Utc>>>,
    stabilization_period: chrono::Duration,
    check_interval: Duration,
    stabilized_tx: mpsc::Sender<PathBuf>,
}

impl StabilityDetector {
    pub fn new(
        stabilization_period_seconds: u64,
        check_interval_ms: u64,
    ) -> (Arc<Self>, mpsc::Receiver<PathBuf>) {
        let (tx, rx) = mpsc::channel(1024);
        let detector = Arc::new(Self {
            touched: RwLock::new(HashMap::new()),
            stabilization_period: chrono::Duration::seconds(stabilization_period_seconds as i64),
            check_interval: Duration::from_millis(check_interval_ms),
            stabilized_tx: tx,
        });
        (detector, rx)
    }

    /// Record (or refresh) a touch on `path`. Called by the directory watcher
    /// on every create/modify event it forwards.
    pub async fn track(&self, path: PathBuf) {
        let mut guard = self.touched.write().await;
        guard.insert(path, Utc::now());
    }

    /// Run one periodic check: snapshot entries whose quiet period has
    /// elapsed, release the lock, then probe each concurrently. Every
    /// examined entry is removed regardless of probe outcome (§4.5) — a
    /// failed probe simply means the next touch event re-tracks it.
    pub async fn check_once(&self) {
        let now = Utc::now();
        let due: Vec<PathBuf> = {
            let guard = self.touched.read().await;
            guard
                .iter()
                .filter(|(_, last_touch)| now - **last_touch >= self.stabilization_period)
                .map(|(path, _)| path.clone())
                .collect()
        };
        if due.is_empty() {
            return;
        }

        let mut probes = tokio::task::JoinSet::new();
        for path in due {
            probes.spawn(async move {
                let stable = probe_stable(&path).await;
                (path, stable)
            });
        }

        let mut guard = self.touched.write().await;
        while let Some(result) = probes.join_next().await {
            let (path, stable) = match result {
                Ok(pair) => pair,
                Err(_) => continue,
            };
            guard.remove(&path);
            if stable {
                debug!(file = %path.display(), "file stabilized");
                if self.stabilized_tx.send(path).await.is_err() {
                    // Receiver gone; detector is shutting down.
                    return;
                }
            }
        }
    }

    /// Launch the periodic check loop. Runs until `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.check_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("stability detector stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.check_once().await;
                    }
                }
            }
        })
    }
}

/// Non-exclusive read probe: open with shared read, read one byte, close.
/// Retries up to `PROBE_RETRIES` times with `PROBE_BACKOFF` between attempts.
async fn probe_stable(path: &Path) -> bool {
    for attempt in 0..=PROBE_RETRIES {
        match tokio::fs::File::open(path).await {
            Ok(mut file) => {
                let mut buf = [0u8; 1];
                match file.read(&mut buf).await {
                    Ok(_) => return true,
                    Err(_) if attempt < PROBE_RETRIES => {
                        tokio::time::sleep(PROBE_BACKOFF).await;
                    }
                    Err(_) => return false,
                }
            }
            Err(_) if attempt < PROBE_RETRIES => {
                tokio::time::sleep(PROBE_BACKOFF).await;
            }
            Err(_) => return false,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn tracked_file_stabilizes_after_quiet_period() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.jsonl");
        std::fs::write(&path, "data").unwrap();

        let (detector, mut rx) = StabilityDetector::new(0, 10);
        detector.track(path.clone()).await;
        detector.check_once().await;

        let stabilized = rx.try_recv().unwrap();
        assert_eq!(stabilized, path);
    }

    #[tokio::test]
    async fn entry_removed_even_when_probe_fails() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("gone.jsonl");

        let (detector, mut rx) = StabilityDetector::new(0, 10);
        detector.track(missing.clone()).await;
        detector.check_once().await;

        assert!(rx.try_recv().is_err());
        let guard = detector.touched.read().await;
        assert!(!guard.contains_key(&missing));
    }

    #[tokio::test]
    async fn not_yet_quiet_entries_are_left_tracked() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.jsonl");
        std::fs::write(&path, "data").unwrap();

        let (detector, mut rx) = StabilityDetector::new(3600, 10);
        detector.track(path.clone()).await;
        detector.check_once().await;

        assert!(rx.try_recv().is_err());
        let guard = detector.touched.read().await;
        assert!(guard.contains_key(&path));
    }
}

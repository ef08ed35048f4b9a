//! Batch Processor (C7, spec §4.6). A bounded, concurrent queue that flushes
//! on size, count, idle-timeout, or explicit request, feeding drained records
//! to an injected sink with bounded parallelism.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::model::LogRecord;

const STOP_FLUSH_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_TASK_GRACE: Duration = Duration::from_secs(10);
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(250);

pub type SinkFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;
/// Per-record processing callback invoked with bounded parallelism on flush.
/// The orchestrator supplies this — e.g. tracking per-file completion so it
/// knows when a file's records have all reached the batch and the source
/// file can be handed to the upload client.
pub type BatchSink = Arc<dyn Fn(LogRecord) -> SinkFuture + Send + Sync>;

#[derive(Debug, Clone)]
pub struct BatchResult {
    pub ok: bool,
    pub processed: usize,
    pub size_bytes: u64,
    pub duration_ms: u64,
    pub error: Option<String>,
}

impl BatchResult {
    fn empty() -> Self {
        Self {
            ok: true,
            processed: 0,
            size_bytes: 0,
            duration_ms: 0,
            error: None,
        }
    }
}

pub struct BatchProcessor {
    queue: RwLock<VecDeque<LogRecord>>,
    byte_counter: AtomicU64,
    max_size_bytes: u64,
    max_items: usize,
    idle_timeout: Duration,
    processing_interval: Duration,
    last_add: Mutex<Instant>,
    sink: BatchSink,
}

impl BatchProcessor {
    pub fn new(
        max_size_bytes: u64,
        max_items: usize,
        idle_timeout: Duration,
        processing_interval: Duration,
        sink: BatchSink,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue: RwLock::new(VecDeque::new()),
            byte_counter: AtomicU64::new(0),
            max_size_bytes,
            max_items,
            idle_timeout,
            processing_interval,
            last_add: Mutex::new(Instant::now()),
            sink,
        })
    }

    async fn is_full(&self) -> bool {
        if self.byte_counter.load(Ordering::SeqCst) >= self.max_size_bytes {
            return true;
        }
        self.queue.read().await.len() >= self.max_items
    }

    async fn has_items(&self) -> bool {
        !self.queue.read().await.is_empty()
    }

    fn touch(&self) {
        *self.last_add.lock().unwrap() = Instant::now();
    }

    fn idle_elapsed(&self) -> bool {
        self.last_add.lock().unwrap().elapsed() >= self.idle_timeout
    }

    /// Append one record. If the batch is already full, triggers an async
    /// flush first, then appends unconditionally (§4.6). Returns `false` on
    /// cancellation rather than throwing.
    pub async fn add(&self, record: LogRecord, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        if self.is_full().await {
            self.flush(false, cancel).await;
        }
        if cancel.is_cancelled() {
            return false;
        }
        let size = record.estimated_size_bytes() as u64;
        {
            let mut q = self.queue.write().await;
            q.push_back(record);
        }
        self.byte_counter.fetch_add(size, Ordering::SeqCst);
        self.touch();
        true
    }

    /// Append a sequence of records as one atomic unit from the caller's
    /// perspective: at most one flush-trigger check at the range boundary,
    /// never mid-range (§4.6).
    pub async fn add_range(&self, records: Vec<LogRecord>, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        if self.is_full().await {
            self.flush(false, cancel).await;
        }
        let mut added_size = 0u64;
        {
            let mut q = self.queue.write().await;
            for record in records {
                added_size += record.estimated_size_bytes() as u64;
                q.push_back(record);
            }
        }
        self.byte_counter.fetch_add(added_size, Ordering::SeqCst);
        self.touch();
        !cancel.is_cancelled()
    }

    /// Drain the queue atomically and dispatch the drained records to the
    /// sink with bounded parallelism. A no-op (but still `ok: true`) when the
    /// queue is empty and `force` is false — two consecutive forced flushes
    /// with nothing queued both return `processed: 0, ok: true` (§8).
    pub async fn flush(&self, force: bool, cancel: &CancellationToken) -> BatchResult {
        let start = Instant::now();
        let drained: Vec<LogRecord> = {
            let mut q = self.queue.write().await;
            if q.is_empty() && !force {
                return BatchResult::empty();
            }
            q.drain(..).collect()
        };
        self.byte_counter.store(0, Ordering::SeqCst);

        if drained.is_empty() {
            return BatchResult {
                duration_ms: start.elapsed().as_millis() as u64,
                ..BatchResult::empty()
            };
        }

        let size_bytes: u64 = drained.iter().map(|r| r.estimated_size_bytes() as u64).sum();
        let parallelism = num_cpus::get().clamp(1, 4);
        let semaphore = Arc::new(Semaphore::new(parallelism));
        let mut join_set = JoinSet::new();

        for record in drained {
            if cancel.is_cancelled() {
                break;
            }
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let sink = self.sink.clone();
            join_set.spawn(async move {
                let _permit = permit;
                sink(record).await
            });
        }

        let mut processed = 0usize;
        let mut failures = 0usize;
        while let Some(result) = join_set.join_next().await {
            match result {
                Ok(Ok(())) => processed += 1,
                Ok(Err(e)) => {
                    failures += 1;
                    warn!(error = %e, "batch item failed processing");
                }
                Err(e) => {
                    failures += 1;
                    warn!(error = %e, "batch item task panicked");
                }
            }
        }

        BatchResult {
            ok: failures == 0,
            processed,
            size_bytes,
            duration_ms: start.elapsed().as_millis() as u64,
            error: (failures > 0).then(|| format!("{failures} record(s) failed processing")),
        }
    }

    /// Launch the background task: flushes every `processing_interval` and
    /// additionally when the idle timeout elapses with items pending (§4.6).
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut periodic = tokio::time::interval(self.processing_interval);
            periodic.tick().await; // first tick fires immediately; skip it
            let mut idle_poll = tokio::time::interval(IDLE_POLL_INTERVAL);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("batch processor background loop stopping");
                        break;
                    }
                    _ = periodic.tick() => {
                        self.flush(true, &cancel).await;
                    }
                    _ = idle_poll.tick() => {
                        if self.idle_elapsed() && self.has_items().await {
                            self.flush(true, &cancel).await;
                        }
                    }
                }
            }
        })
    }

    /// Cancel the background task, force a final flush bounded by a 30s
    /// timeout, then await task completion with a further 10s grace (§4.6).
    pub async fn stop(
        self: Arc<Self>,
        cancel: CancellationToken,
        handle: tokio::task::JoinHandle<()>,
    ) -> BatchResult {
        cancel.cancel();
        let final_flush_cancel = CancellationToken::new();
        let flush_result = tokio::time::timeout(
            STOP_FLUSH_TIMEOUT,
            self.flush(true, &final_flush_cancel),
        )
        .await;
        let _ = tokio::time::timeout(STOP_TASK_GRACE, handle).await;

        match flush_result {
            Ok(result) => result,
            Err(_) => BatchResult {
                ok: false,
                processed: 0,
                size_bytes: 0,
                duration_ms: STOP_FLUSH_TIMEOUT.as_millis() as u64,
                error: Some("final flush timed out".to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Severity;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    fn make_record(id: &str) -> LogRecord {
        LogRecord {
            id: id.to_string(),
            device_id: "d1".to_string(),
            timestamp: chrono::Utc::now(),
            level: Severity::Info,
            message: "x".to_string(),
            category: None,
            tags: vec![],
            error: None,
            source_file: PathBuf::from("a.jsonl"),
            processed_at: chrono::Utc::now(),
        }
    }

    fn counting_sink() -> (BatchSink, Arc<AtomicUsize>) {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        let sink: BatchSink = Arc::new(move |_record| {
            let counter = counter_clone.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });
        (sink, counter)
    }

    #[tokio::test]
    async fn full_before_add_triggers_flush_then_appends() {
        let (sink, counter) = counting_sink();
        let batch = BatchProcessor::new(
            u64::MAX,
            2,
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            sink,
        );
        let cancel = CancellationToken::new();

        assert!(batch.add(make_record("1"), &cancel).await);
        assert!(batch.add(make_record("2"), &cancel).await);
        // Batch is now full (count == max_items); next add flushes first.
        assert!(batch.add(make_record("3"), &cancel).await);

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(batch.queue.read().await.len(), 1);
    }

    #[tokio::test]
    async fn flush_on_empty_is_idempotent() {
        let (sink, _counter) = counting_sink();
        let batch = BatchProcessor::new(
            u64::MAX,
            100,
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            sink,
        );
        let cancel = CancellationToken::new();

        let r1 = batch.flush(true, &cancel).await;
        let r2 = batch.flush(true, &cancel).await;
        assert!(r1.ok && r1.processed == 0);
        assert!(r2.ok && r2.processed == 0);
    }

    #[tokio::test]
    async fn seven_records_with_batch_of_three_flushes_twice_then_drains_on_stop() {
        let (sink, counter) = counting_sink();
        let batch = BatchProcessor::new(
            u64::MAX,
            3,
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            sink,
        );
        let cancel = CancellationToken::new();

        for i in 0..7 {
            batch.add(make_record(&i.to_string()), &cancel).await;
        }
        // Items 1-3 and 4-6 triggered flushes on the 3rd/6th add; item 7 remains.
        assert_eq!(counter.load(Ordering::SeqCst), 6);
        assert_eq!(batch.queue.read().await.len(), 1);

        let result = batch.flush(true, &cancel).await;
        assert_eq!(result.processed, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn size_bound_triggers_flush_independent_of_count() {
        let (sink, counter) = counting_sink();
        let batch = BatchProcessor::new(10, 1000, Duration::from_secs(3600), Duration::from_secs(3600), sink);
        let cancel = CancellationToken::new();

        let mut record = make_record("1");
        record.message = "x".repeat(50);
        batch.add(record, &cancel).await;
        batch.add(make_record("2"), &cancel).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn add_after_cancel_returns_false() {
        let (sink, _counter) = counting_sink();
        let batch = BatchProcessor::new(u64::MAX, 100, Duration::from_secs(3600), Duration::from_secs(3600), sink);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!batch.add(make_record("1"), &cancel).await);
    }

    #[tokio::test]
    async fn stop_flushes_remaining_items() {
        let (sink, counter) = counting_sink();
        let batch = BatchProcessor::new(
            u64::MAX,
            1000,
            Duration::from_millis(50),
            Duration::from_secs(3600),
            sink,
        );
        let cancel = CancellationToken::new();
        batch.add(make_record("1"), &cancel).await;

        let handle = batch.clone().spawn(cancel.clone());
        let result = batch.clone().stop(cancel, handle).await;
        assert_eq!(result.processed, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}

//! Upload Client (C8, spec §4.7). A connection-managed device endpoint:
//! exponential-backoff retry, reconnection on transient failure, and
//! operation-scoped cancellation around a three-step upload protocol.

use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{IotHubConfig, RetryConfig};
use crate::error::UploadError;
use crate::error_tracker::ConsecutiveErrorTracker;
use crate::model::ConnectionState;
use crate::upload::auth::DeviceAuth;
use crate::upload::transport::Transport;

const CONNECT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ConnectResult {
    pub ok: bool,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone)]
pub struct UploadResult {
    pub ok: bool,
    pub file_size: u64,
    pub elapsed_ms: u64,
    pub error: Option<String>,
}

fn state_to_u8(state: ConnectionState) -> u8 {
    match state {
        ConnectionState::Disconnected => 0,
        ConnectionState::Connecting => 1,
        ConnectionState::Connected => 2,
        ConnectionState::Disconnecting => 3,
        ConnectionState::Error => 4,
        ConnectionState::Disabled => 5,
    }
}

fn u8_to_state(v: u8) -> ConnectionState {
    match v {
        0 => ConnectionState::Disconnected,
        1 => ConnectionState::Connecting,
        2 => ConnectionState::Connected,
        3 => ConnectionState::Disconnecting,
        4 => ConnectionState::Error,
        _ => ConnectionState::Disabled,
    }
}

fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("json") | Some("jsonl") => "application/json",
        Some("log") | Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

pub struct UploadClient {
    transport: Arc<dyn Transport>,
    auth: DeviceAuth,
    upload_folder: String,
    retry: RetryConfig,
    state: AtomicU8,
    connect_lock: Semaphore,
    error_tracker: ConsecutiveErrorTracker,
}

impl UploadClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: &IotHubConfig,
    ) -> Result<Self, UploadError> {
        let auth = DeviceAuth::from_config(config)?;
        Ok(Self {
            transport,
            auth,
            upload_folder: config.upload_folder.clone(),
            retry: RetryConfig::default(),
            state: AtomicU8::new(state_to_u8(ConnectionState::Disconnected)),
            connect_lock: Semaphore::new(1),
            error_tracker: ConsecutiveErrorTracker::new(),
        })
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn connection_state(&self) -> ConnectionState {
        u8_to_state(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state_to_u8(state), Ordering::SeqCst);
    }

    /// Idempotent when already Connected. Guarded by the single-permit
    /// connection semaphore; applies the retry policy to the reachability
    /// probe.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<ConnectResult, UploadError> {
        if self.connection_state() == ConnectionState::Connected {
            return Ok(ConnectResult {
                ok: true,
                elapsed_ms: 0,
            });
        }
        if self.connection_state() == ConnectionState::Disabled {
            return Err(UploadError::NotConnected);
        }

        let _permit = tokio::time::timeout(CONNECT_LOCK_TIMEOUT, self.connect_lock.acquire())
            .await
            .map_err(|_| UploadError::LockTimeout)?
            .map_err(|_| UploadError::LockTimeout)?;

        // Re-check under the lock: another task may have connected first.
        if self.connection_state() == ConnectionState::Connected {
            return Ok(ConnectResult {
                ok: true,
                elapsed_ms: 0,
            });
        }

        self.set_state(ConnectionState::Connecting);
        let start = Instant::now();

        match self
            .with_retry(cancel, |_attempt| self.transport.probe(&self.auth))
            .await
        {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                Ok(ConnectResult {
                    ok: true,
                    elapsed_ms: start.elapsed().as_millis() as u64,
                })
            }
            Err(e) => {
                self.set_state(ConnectionState::Error);
                Err(e)
            }
        }
    }

    /// Graceful close with a 5s timeout. Always transitions to Disconnected
    /// even if the close itself times out or fails (§4.7).
    pub async fn disconnect(&self) {
        self.set_state(ConnectionState::Disconnecting);
        let _ = tokio::time::timeout(DISCONNECT_TIMEOUT, async {
            // No persistent socket to close for this transport; the state
            // transition itself is the meaningful side effect.
        })
        .await;
        self.set_state(ConnectionState::Disconnected);
    }

    /// Requires Connected; auto-connects on demand. Builds the remote path as
    /// `{upload_folder}/YYYY/MM/DD/{device_id}/{blob_name}` and runs the
    /// three-step protocol, each step wrapped in the retry policy.
    pub async fn upload_file(
        &self,
        local_path: &Path,
        blob_name: &str,
        cancel: &CancellationToken,
    ) -> Result<UploadResult, UploadError> {
        let start = Instant::now();

        if self.connection_state() != ConnectionState::Connected {
            self.connect(cancel).await?;
        }

        let now = Utc::now();
        let remote_path = format!(
            "{}/{}/{}",
            self.upload_folder.trim_end_matches('/'),
            now.format("%Y/%m/%d"),
            format!("{}/{}", self.auth.device_id, blob_name),
        );
        let content_type = content_type_for(local_path);

        let mut file = tokio::fs::File::open(local_path)
            .await
            .map_err(UploadError::LocalIo)?;
        let file_size = file
            .metadata()
            .await
            .map_err(UploadError::LocalIo)?
            .len();

        let uri_response = self
            .with_retry(cancel, |_attempt| {
                self.transport.request_upload_uri(&self.auth, &remote_path)
            })
            .await?;

        let put_result = self
            .with_retry(cancel, |attempt| {
                let file = &mut file;
                let blob_uri = &uri_response.blob_uri;
                async move {
                    if attempt > 1 {
                        if let Err(e) = file.seek(std::io::SeekFrom::Start(0)).await {
                            warn!(error = %e, "seek to rewind upload stream on retry failed");
                        }
                    }
                    let mut body = Vec::with_capacity(file_size as usize);
                    file.read_to_end(&mut body)
                        .await
                        .map_err(UploadError::LocalIo)?;
                    self.transport.put_blob(blob_uri, content_type, body).await
                }
            })
            .await;

        let success = put_result.is_ok();
        let notify_result = self
            .with_retry(cancel, |_attempt| {
                self.transport
                    .notify_completion(&self.auth, &uri_response.correlation_id, success)
            })
            .await;

        if let Err(e) = notify_result {
            warn!(error = %e, "upload completion notification failed");
        }

        match put_result {
            Ok(()) => Ok(UploadResult {
                ok: true,
                file_size,
                elapsed_ms: start.elapsed().as_millis() as u64,
                error: None,
            }),
            Err(e) => Ok(UploadResult {
                ok: false,
                file_size,
                elapsed_ms: start.elapsed().as_millis() as u64,
                error: Some(e.to_string()),
            }),
        }
    }

    /// Called when the caller has detected the underlying transport dropped
    /// while connected. Schedules a single reconnect attempt, serialised by
    /// the connection semaphore (§4.7 reconnection policy).
    pub async fn on_transport_drop(&self, cancel: &CancellationToken) {
        if self.connection_state() == ConnectionState::Connected {
            self.set_state(ConnectionState::Error);
            if let Err(e) = self.connect(cancel).await {
                warn!(error = %e, "reconnect after transport drop failed");
            }
        }
    }

    async fn with_retry<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, UploadError>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<T, UploadError>>,
    {
        let mut backoff = self.retry.initial_backoff_s;
        let mut last_error: Option<UploadError> = None;

        for attempt in 1..=self.retry.max_attempts {
            if cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }

            match op(attempt).await {
                Ok(value) => {
                    if let Some(total) = self.error_tracker.record_success() {
                        info!(recovered_after = total, "upload operation recovered");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_retryable() => {
                    if self.error_tracker.record_error() {
                        warn!(attempt, max_attempts = self.retry.max_attempts, error = %e, "upload operation failed, retrying");
                    }
                    let is_last = attempt == self.retry.max_attempts;
                    last_error = Some(e);
                    if is_last {
                        break;
                    }
                    let jittered = backoff / 2.0 + rand::thread_rng().gen_range(0.0..=backoff / 2.0);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                        _ = tokio::time::sleep(Duration::from_secs_f64(jittered)) => {}
                    }
                    backoff = (backoff * 2.0).min(self.retry.max_backoff_s);
                }
                Err(e) => return Err(e),
            }
        }

        Err(UploadError::RetriesExhausted {
            attempts: self.retry.max_attempts,
            last_error: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::transport::mock::MockTransport;
    use std::io::Write;

    fn test_config() -> IotHubConfig {
        IotHubConfig {
            connection_string: Some("HostName=h;DeviceId=dev1;SharedAccessKey=k".to_string()),
            host: None,
            device_id: None,
            sas_token: None,
            upload_folder: "logs".to_string(),
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_backoff_s: 0.001,
            max_backoff_s: 0.01,
        }
    }

    #[tokio::test]
    async fn connect_succeeds_and_is_idempotent() {
        let transport = Arc::new(MockTransport::new());
        let client = UploadClient::new(transport, &test_config()).unwrap();
        let cancel = CancellationToken::new();

        let result = client.connect(&cancel).await.unwrap();
        assert!(result.ok);
        assert_eq!(client.connection_state(), ConnectionState::Connected);

        // Second call is a no-op short-circuit, not a second probe.
        let result2 = client.connect(&cancel).await.unwrap();
        assert!(result2.ok);
    }

    #[tokio::test]
    async fn connect_retries_then_succeeds() {
        let transport = Arc::new(MockTransport::new().fail_probes(2));
        let client = UploadClient::new(transport, &test_config())
            .unwrap()
            .with_retry_config(fast_retry());
        let cancel = CancellationToken::new();

        let result = client.connect(&cancel).await.unwrap();
        assert!(result.ok);
    }

    #[tokio::test]
    async fn connect_exhausts_retries_and_enters_error_state() {
        let transport = Arc::new(MockTransport::new().fail_probes(10));
        let client = UploadClient::new(transport, &test_config())
            .unwrap()
            .with_retry_config(fast_retry());
        let cancel = CancellationToken::new();

        let result = client.connect(&cancel).await;
        assert!(result.is_err());
        assert_eq!(client.connection_state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn upload_file_auto_connects_and_runs_full_protocol() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.jsonl");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"{\"hello\":true}\n")
            .unwrap();

        let transport = Arc::new(MockTransport::new());
        let client = UploadClient::new(transport.clone(), &test_config()).unwrap();
        let cancel = CancellationToken::new();

        let result = client.upload_file(&path, "a.jsonl", &cancel).await.unwrap();
        assert!(result.ok);
        assert_eq!(result.file_size, 16);

        let calls = transport.calls.lock().unwrap();
        assert!(calls.contains(&"request_upload_uri".to_string()));
        assert!(calls.contains(&"put_blob".to_string()));
        assert!(calls.contains(&"notify_completion".to_string()));
    }

    #[tokio::test]
    async fn upload_file_retries_put_and_rewinds_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.jsonl");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"{\"hello\":true}\n")
            .unwrap();

        let transport = Arc::new(MockTransport::new().fail_puts(1));
        let client = UploadClient::new(transport, &test_config())
            .unwrap()
            .with_retry_config(fast_retry());
        let cancel = CancellationToken::new();

        let result = client.upload_file(&path, "a.jsonl", &cancel).await.unwrap();
        assert!(result.ok);
    }

    #[tokio::test]
    async fn disconnect_always_reaches_disconnected() {
        let transport = Arc::new(MockTransport::new());
        let client = UploadClient::new(transport, &test_config()).unwrap();
        let cancel = CancellationToken::new();
        client.connect(&cancel).await.unwrap();

        client.disconnect().await;
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn content_type_inferred_from_extension() {
        assert_eq!(content_type_for(Path::new("a.jsonl")), "application/json");
        assert_eq!(content_type_for(Path::new("a.log")), "text/plain");
        assert_eq!(content_type_for(Path::new("a.bin")), "application/octet-stream");
    }
}

//! Wire-level transport for the upload client's three-call protocol
//! (§4.7: `RequestSasUri` → `PUT` blob → `NotifyCompletion`). Abstracted
//! behind a trait so the client's state machine and retry policy can be
//! exercised against an in-process mock (§10.5).

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::UploadError;
use crate::upload::auth::DeviceAuth;

#[derive(Debug, Clone, Deserialize)]
pub struct UploadUriResponse {
    pub correlation_id: String,
    pub blob_uri: String,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Reachability probe used by `connect()`. Transport implementations
    /// that have no persistent session (plain HTTP) perform a cheap GET.
    async fn probe(&self, auth: &DeviceAuth) -> Result<(), UploadError>;

    async fn request_upload_uri(
        &self,
        auth: &DeviceAuth,
        remote_path: &str,
    ) -> Result<UploadUriResponse, UploadError>;

    async fn put_blob(
        &self,
        blob_uri: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<(), UploadError>;

    async fn notify_completion(
        &self,
        auth: &DeviceAuth,
        correlation_id: &str,
        success: bool,
    ) -> Result<(), UploadError>;
}

#[derive(Serialize)]
struct RequestUriBody<'a> {
    blob_name: &'a str,
}

#[derive(Serialize)]
struct NotifyBody<'a> {
    correlation_id: &'a str,
    is_success: bool,
}

fn classify_status(status: StatusCode, body: String) -> UploadError {
    let code = status.as_u16();
    match code {
        401 | 403 => UploadError::AuthFailed(body),
        408 | 429 | 503 | 504 => UploadError::HttpTransient { status: code, body },
        500..=599 => UploadError::HttpTransient { status: code, body },
        400..=499 => UploadError::HttpPermanent { status: code, body },
        _ => UploadError::HttpPermanent { status: code, body },
    }
}

/// Production transport: a device file-upload endpoint reachable over HTTPS.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, host: &str, device_id: &str) -> Self {
        Self {
            client,
            base_url: format!("https://{host}/devices/{device_id}"),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn probe(&self, auth: &DeviceAuth) -> Result<(), UploadError> {
        let response = self
            .client
            .get(format!("{}/ping", self.base_url))
            .header("Authorization", auth.bearer_value())
            .send()
            .await
            .map_err(|e| UploadError::NetworkTransient(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(classify_status(status, body))
        }
    }

    async fn request_upload_uri(
        &self,
        auth: &DeviceAuth,
        remote_path: &str,
    ) -> Result<UploadUriResponse, UploadError> {
        let response = self
            .client
            .post(format!("{}/files", self.base_url))
            .header("Authorization", auth.bearer_value())
            .json(&RequestUriBody {
                blob_name: remote_path,
            })
            .send()
            .await
            .map_err(|e| UploadError::NetworkTransient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }
        response
            .json::<UploadUriResponse>()
            .await
            .map_err(|e| UploadError::MalformedRequest(e.to_string()))
    }

    async fn put_blob(
        &self,
        blob_uri: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<(), UploadError> {
        let response = self
            .client
            .put(blob_uri)
            .header("Content-Type", content_type)
            .body(body)
            .send()
            .await
            .map_err(|e| UploadError::NetworkTransient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(classify_status(status, body))
        }
    }

    async fn notify_completion(
        &self,
        auth: &DeviceAuth,
        correlation_id: &str,
        success: bool,
    ) -> Result<(), UploadError> {
        let response = self
            .client
            .post(format!("{}/files/notifications", self.base_url))
            .header("Authorization", auth.bearer_value())
            .json(&NotifyBody {
                correlation_id,
                is_success: success,
            })
            .send()
            .await
            .map_err(|e| UploadError::NetworkTransient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(classify_status(status, body))
        }
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted transport for client-level tests: each call consumes one
    /// entry from its configured script, cycling behavior without a real
    /// network.
    pub struct MockTransport {
        pub probe_failures: AtomicUsize,
        pub put_failures: AtomicUsize,
        pub calls: Mutex<Vec<String>>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self {
                probe_failures: AtomicUsize::new(0),
                put_failures: AtomicUsize::new(0),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn fail_probes(self, n: usize) -> Self {
            self.probe_failures.store(n, Ordering::SeqCst);
            self
        }

        pub fn fail_puts(self, n: usize) -> Self {
            self.put_failures.store(n, Ordering::SeqCst);
            self
        }

        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn probe(&self, _auth: &DeviceAuth) -> Result<(), UploadError> {
            self.record("probe");
            if self.probe_failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n > 0).then_some(n - 1)
            }).is_ok() {
                return Err(UploadError::NetworkTransient("mock probe failure".to_string()));
            }
            Ok(())
        }

        async fn request_upload_uri(
            &self,
            _auth: &DeviceAuth,
            remote_path: &str,
        ) -> Result<UploadUriResponse, UploadError> {
            self.record("request_upload_uri");
            Ok(UploadUriResponse {
                correlation_id: "corr-1".to_string(),
                blob_uri: format!("https://mock.blob/{remote_path}"),
            })
        }

        async fn put_blob(
            &self,
            _blob_uri: &str,
            _content_type: &str,
            _body: Vec<u8>,
        ) -> Result<(), UploadError> {
            self.record("put_blob");
            if self.put_failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n > 0).then_some(n - 1)
            }).is_ok() {
                return Err(UploadError::NetworkTransient("mock put failure".to_string()));
            }
            Ok(())
        }

        async fn notify_completion(
            &self,
            _auth: &DeviceAuth,
            _correlation_id: &str,
            _success: bool,
        ) -> Result<(), UploadError> {
            self.record("notify_completion");
            Ok(())
        }
    }
}

//! Upload API abstraction and its HTTP client.

use crate::sync::models::{UploadItem, UploadResponse};
use crate::Result;
use std::future::Future;
use std::sync::Arc;

/// Path of the batch upload endpoint, relative to the server URL.
pub const BATCH_PATH: &str = "/api/v1/signatures/batch";
/// Path of the liveness endpoint used as the connectivity probe.
pub const HEALTH_PATH: &str = "/health";

/// The server's batch upload endpoint.
///
/// Implementations must be idempotent per `local_id`: delivering the same
/// item again returns the original outcome.
pub trait UploadApi: Send + Sync {
    /// Upload a batch. A whole-batch failure is reported as
    /// [`crate::FieldSignError::NetworkError`] (retryable) or
    /// [`crate::FieldSignError::ServerRejectedValidation`] (fatal).
    fn upload_batch(&self, items: &[UploadItem])
        -> impl Future<Output = Result<UploadResponse>> + Send;

    /// Cheap reachability check, used to confirm an "online" signal.
    fn probe(&self) -> impl Future<Output = bool> + Send;
}

impl<T: UploadApi> UploadApi for Arc<T> {
    fn upload_batch(
        &self,
        items: &[UploadItem],
    ) -> impl Future<Output = Result<UploadResponse>> + Send {
        (**self).upload_batch(items)
    }

    fn probe(&self) -> impl Future<Output = bool> + Send {
        (**self).probe()
    }
}

#[cfg(feature = "http")]
pub use http::HttpUploadClient;

#[cfg(feature = "http")]
mod http {
    use super::{UploadApi, BATCH_PATH, HEALTH_PATH};
    use crate::sync::models::{UploadItem, UploadResponse};
    use crate::{FieldSignError, Result};
    use reqwest::StatusCode;
    use std::time::Duration;
    use tracing::debug;
    use uuid::Uuid;

    /// HTTP client for the signature server.
    pub struct HttpUploadClient {
        client: reqwest::Client,
        server_url: String,
        device_id: Uuid,
    }

    impl HttpUploadClient {
        pub fn new(server_url: &str, device_id: Uuid, timeout: Duration) -> Result<Self> {
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| FieldSignError::Config(format!("HTTP client: {}", e)))?;

            Ok(Self {
                client,
                server_url: server_url.trim_end_matches('/').to_string(),
                device_id,
            })
        }
    }

    impl UploadApi for HttpUploadClient {
        async fn upload_batch(&self, items: &[UploadItem]) -> Result<UploadResponse> {
            let url = format!("{}{}", self.server_url, BATCH_PATH);
            let resp = self
                .client
                .post(&url)
                .header("X-Device-Id", self.device_id.to_string())
                .json(items)
                .send()
                .await
                .map_err(|e| FieldSignError::NetworkError(e.to_string()))?;

            let status = resp.status();
            if status == StatusCode::BAD_REQUEST || status == StatusCode::UNPROCESSABLE_ENTITY {
                let body = resp.text().await.unwrap_or_else(|_| "unknown".to_string());
                return Err(FieldSignError::ServerRejectedValidation(format!(
                    "{}: {}",
                    status, body
                )));
            }
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_else(|_| "unknown".to_string());
                return Err(FieldSignError::NetworkError(format!(
                    "Server error {}: {}",
                    status, body
                )));
            }

            resp.json::<UploadResponse>()
                .await
                .map_err(|e| FieldSignError::NetworkError(format!("Invalid batch response: {}", e)))
        }

        async fn probe(&self) -> bool {
            let url = format!("{}{}", self.server_url, HEALTH_PATH);
            match self.client.get(&url).send().await {
                Ok(resp) => resp.status().is_success(),
                Err(e) => {
                    debug!("Connectivity probe failed: {}", e);
                    false
                }
            }
        }
    }
}

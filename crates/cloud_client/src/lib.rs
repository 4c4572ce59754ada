//! Authenticated client for the Client System REST surface: connectivity
//! probe, batch reading upload, and the best-effort heartbeat. The trait
//! keeps route handlers and workers testable against a scripted fake.

#[cfg(any(test, feature = "testing"))]
pub mod testing;

use std::time::Duration;

use async_trait::async_trait;
use common::types::{
    ReadingRow,
    UnixMillis,
};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use url::Url;

/// Upload outcomes split along the retry boundary: network trouble and
/// server-side overload come back, validation and auth failures need an
/// operator.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("client system unreachable: {0:#}")]
    Retryable(#[source] anyhow::Error),
    #[error("client system rejected the batch ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl UploadError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, UploadError::Retryable(_))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UploadReceipt {
    pub records_processed: u64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct HeartbeatCounters {
    pub uploaded: u64,
    pub failed: u64,
    pub queued: u64,
}

#[async_trait]
pub trait ClientSystemApi: Send + Sync {
    /// Cheap authenticated reachability probe; `Ok` means the cloud answered
    /// with a 2xx.
    async fn ping(&self) -> anyhow::Result<()>;

    async fn upload_readings(
        &self,
        tenant_id: i64,
        readings: &[ReadingRow],
    ) -> Result<UploadReceipt, UploadError>;

    async fn heartbeat(
        &self,
        tenant_id: i64,
        counters: HeartbeatCounters,
    ) -> anyhow::Result<()>;

    /// Swapped in by downstream sync whenever the tenant row carries a key.
    fn set_api_key(&self, api_key: Option<String>);
}

#[derive(Deserialize)]
struct BatchUploadResponse {
    success: bool,
    records_processed: u64,
}

pub struct HttpClientSystem {
    base_url: Url,
    client: reqwest::Client,
    api_key: Mutex<Option<String>>,
}

impl HttpClientSystem {
    pub fn new(base_url: Url, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url,
            client,
            api_key: Mutex::new(None),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url.as_str().trim_end_matches('/'))
    }

    fn bearer(&self) -> Option<String> {
        self.api_key.lock().clone().filter(|k| !k.is_empty())
    }

    fn reading_payload(reading: &ReadingRow) -> serde_json::Value {
        let mut payload = serde_json::Map::new();
        payload.insert("meter_id".to_owned(), json!(reading.meter_id));
        payload.insert(
            "meter_element_id".to_owned(),
            json!(reading.meter_element_id),
        );
        payload.insert(
            "created_at".to_owned(),
            json!(reading.created_at.as_rfc3339()),
        );
        for (field, value) in &reading.fields {
            payload.insert(field.clone(), json!(value));
        }
        serde_json::Value::Object(payload)
    }
}

#[async_trait]
impl ClientSystemApi for HttpClientSystem {
    async fn ping(&self) -> anyhow::Result<()> {
        let Some(key) = self.bearer() else {
            anyhow::bail!("no api key configured yet");
        };
        let response = self
            .client
            .get(self.endpoint("health"))
            .bearer_auth(key)
            .send()
            .await?;
        anyhow::ensure!(
            response.status().is_success(),
            "health probe answered {}",
            response.status()
        );
        Ok(())
    }

    async fn upload_readings(
        &self,
        tenant_id: i64,
        readings: &[ReadingRow],
    ) -> Result<UploadReceipt, UploadError> {
        let Some(key) = self.bearer() else {
            return Err(UploadError::Rejected {
                status: 401,
                message: "no api key configured".to_owned(),
            });
        };
        let body = json!({
            "tenant_id": tenant_id,
            "readings": readings.iter().map(Self::reading_payload).collect::<Vec<_>>(),
        });
        let response = self
            .client
            .post(self.endpoint("readings/batch"))
            .bearer_auth(key)
            .json(&body)
            .send()
            .await
            .map_err(|e| UploadError::Retryable(e.into()))?;

        let status = response.status();
        if status.is_success() {
            let parsed: BatchUploadResponse = response
                .json()
                .await
                .map_err(|e| UploadError::Retryable(e.into()))?;
            if !parsed.success {
                return Err(UploadError::Rejected {
                    status: status.as_u16(),
                    message: "server reported success=false".to_owned(),
                });
            }
            return Ok(UploadReceipt {
                records_processed: parsed.records_processed,
            });
        }
        let message = response.text().await.unwrap_or_default();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(UploadError::Retryable(anyhow::anyhow!(
                "upload answered {status}: {message}"
            )));
        }
        if status.is_client_error() {
            return Err(UploadError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        Err(UploadError::Retryable(anyhow::anyhow!(
            "unexpected upload status {status}: {message}"
        )))
    }

    async fn heartbeat(
        &self,
        tenant_id: i64,
        counters: HeartbeatCounters,
    ) -> anyhow::Result<()> {
        let Some(key) = self.bearer() else {
            anyhow::bail!("no api key configured yet");
        };
        let body = json!({
            "tenant_id": tenant_id,
            "timestamp": UnixMillis::now().as_rfc3339(),
            "uploaded": counters.uploaded,
            "failed": counters.failed,
            "queued": counters.queued,
        });
        let response = self
            .client
            .post(self.endpoint("agents/heartbeat"))
            .bearer_auth(key)
            .json(&body)
            .send()
            .await?;
        anyhow::ensure!(
            response.status().is_success(),
            "heartbeat answered {}",
            response.status()
        );
        Ok(())
    }

    fn set_api_key(&self, api_key: Option<String>) {
        let had_key = self.api_key.lock().is_some();
        let has_key = api_key.as_deref().is_some_and(|k| !k.is_empty());
        *self.api_key.lock() = api_key.filter(|k| !k.is_empty());
        if has_key && !had_key {
            tracing::info!("Client System api key configured");
        }
    }
}

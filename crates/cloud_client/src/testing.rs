//! A scriptable Client System for worker tests.

use std::collections::VecDeque;

use async_trait::async_trait;
use common::types::ReadingRow;
use parking_lot::Mutex;

use crate::{
    ClientSystemApi,
    HeartbeatCounters,
    UploadError,
    UploadReceipt,
};

#[derive(Clone, Debug)]
pub enum FakeUploadOutcome {
    Success,
    Retryable(String),
    Rejected(u16, String),
}

#[derive(Default)]
pub struct FakeClientSystem {
    online: Mutex<bool>,
    upload_script: Mutex<VecDeque<FakeUploadOutcome>>,
    uploads: Mutex<Vec<Vec<i64>>>,
    heartbeats: Mutex<Vec<HeartbeatCounters>>,
    api_key: Mutex<Option<String>>,
}

impl FakeClientSystem {
    pub fn new() -> Self {
        let fake = Self::default();
        *fake.online.lock() = true;
        fake
    }

    pub fn set_online(&self, online: bool) {
        *self.online.lock() = online;
    }

    /// Queues outcomes for the next upload calls; once the queue drains,
    /// uploads succeed.
    pub fn script_uploads(&self, outcomes: impl IntoIterator<Item = FakeUploadOutcome>) {
        self.upload_script.lock().extend(outcomes);
    }

    /// The reading ids of every batch that reached the fake, acknowledged or
    /// not.
    pub fn uploaded_batches(&self) -> Vec<Vec<i64>> {
        self.uploads.lock().clone()
    }

    pub fn heartbeats(&self) -> Vec<HeartbeatCounters> {
        self.heartbeats.lock().clone()
    }

    pub fn api_key(&self) -> Option<String> {
        self.api_key.lock().clone()
    }
}

#[async_trait]
impl ClientSystemApi for FakeClientSystem {
    async fn ping(&self) -> anyhow::Result<()> {
        anyhow::ensure!(*self.online.lock(), "fake client system is offline");
        Ok(())
    }

    async fn upload_readings(
        &self,
        _tenant_id: i64,
        readings: &[ReadingRow],
    ) -> Result<UploadReceipt, UploadError> {
        if !*self.online.lock() {
            return Err(UploadError::Retryable(anyhow::anyhow!(
                "fake client system is offline"
            )));
        }
        let outcome = self
            .upload_script
            .lock()
            .pop_front()
            .unwrap_or(FakeUploadOutcome::Success);
        match outcome {
            FakeUploadOutcome::Success => {
                self.uploads
                    .lock()
                    .push(readings.iter().map(|r| r.id).collect());
                Ok(UploadReceipt {
                    records_processed: readings.len() as u64,
                })
            },
            FakeUploadOutcome::Retryable(message) => {
                Err(UploadError::Retryable(anyhow::anyhow!(message)))
            },
            FakeUploadOutcome::Rejected(status, message) => {
                Err(UploadError::Rejected { status, message })
            },
        }
    }

    async fn heartbeat(
        &self,
        _tenant_id: i64,
        counters: HeartbeatCounters,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(*self.online.lock(), "fake client system is offline");
        self.heartbeats.lock().push(counters);
        Ok(())
    }

    fn set_api_key(&self, api_key: Option<String>) {
        *self.api_key.lock() = api_key;
    }
}

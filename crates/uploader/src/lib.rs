//! The upstream upload manager: drain the queue of unsynchronized readings
//! whenever the connectivity monitor says the cloud is reachable. Batches are
//! shipped oldest-first and deleted only after the server acknowledges them
//! (at-least-once; the Client System deduplicates). Retryable failures back
//! off exponentially and re-probe connectivity between attempts; rejected
//! batches stay queued for an operator.

use std::{
    sync::Arc,
    time::Duration,
};

use cloud_client::{
    ClientSystemApi,
    HeartbeatCounters,
    UploadError,
};
use common::{
    backoff::Backoff,
    errors::report_error,
    gate::CycleGate,
    knobs::SYNC_LOG_RETENTION,
    runtime::{
        join_worker,
        tokio_spawn,
    },
    store::LocalStore,
    types::{
        ReadingRow,
        UnixMillis,
    },
};
use connectivity::{
    ConnectivityEvent,
    ConnectivityMonitor,
};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug)]
pub struct UploadConfig {
    pub interval: Duration,
    pub batch_size: usize,
    pub max_retries: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum UploadTriggerError {
    #[error("upload already in progress")]
    AlreadyRunning,
}

#[derive(Clone, Debug, Serialize)]
pub struct UploadCycleResult {
    pub is_client_connected: bool,
    pub queue_size_at_start: u64,
    pub batches_attempted: usize,
    pub uploaded: u64,
    pub failed: u64,
    /// True when the link dropped mid-cycle and the rest was left queued.
    pub aborted_offline: bool,
    pub error: Option<String>,
    pub timestamp: UnixMillis,
}

#[derive(Clone, Debug, Serialize)]
pub struct UploadStatus {
    pub is_running: bool,
    pub is_client_connected: bool,
    pub queue_size: u64,
    pub total_uploaded: u64,
    pub total_failed: u64,
    pub last_run_at: Option<UnixMillis>,
    pub last_result: Option<UploadCycleResult>,
}

#[derive(Default)]
struct StatusInner {
    queue_size: u64,
    total_uploaded: u64,
    total_failed: u64,
    last_run_at: Option<UnixMillis>,
    last_result: Option<UploadCycleResult>,
}

enum BatchOutcome {
    Acked,
    RetriesExhausted(String),
    Rejected(String),
    WentOffline,
}

struct Inner {
    store: Arc<dyn LocalStore>,
    cloud: Arc<dyn ClientSystemApi>,
    connectivity: Arc<ConnectivityMonitor>,
    tenant_id: i64,
    config: UploadConfig,
    gate: CycleGate,
    status: Mutex<StatusInner>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct UploadManager {
    inner: Arc<Inner>,
}

impl UploadManager {
    pub fn new(
        store: Arc<dyn LocalStore>,
        cloud: Arc<dyn ClientSystemApi>,
        connectivity: Arc<ConnectivityMonitor>,
        tenant_id: i64,
        config: UploadConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                cloud,
                connectivity,
                tenant_id,
                config,
                gate: CycleGate::new(),
                status: Mutex::new(StatusInner::default()),
                cancel: CancellationToken::new(),
                worker: Mutex::new(None),
            }),
        }
    }

    /// Starts the scheduler: a cycle per interval, plus one whenever the
    /// connectivity monitor broadcasts `Connected`.
    pub fn start(&self) {
        let this = self.clone();
        let mut events = self.inner.connectivity.subscribe();
        let handle = tokio_spawn("upload_manager", async move {
            tracing::info!(
                "Starting upload manager (interval {:?}, batch size {})",
                this.inner.config.interval,
                this.inner.config.batch_size
            );
            loop {
                tokio::select! {
                    _ = this.inner.cancel.cancelled() => break,
                    _ = tokio::time::sleep(this.inner.config.interval) => {},
                    event = events.recv() => {
                        match event {
                            Ok(ConnectivityEvent::Connected) => {
                                tracing::info!("Connectivity restored; draining the upload queue");
                            },
                            Ok(ConnectivityEvent::Disconnected) => continue,
                            Err(_) => continue,
                        }
                    },
                }
                match this.run_cycle().await {
                    Ok(result) => {
                        if let Some(error) = &result.error {
                            let mut e = anyhow::anyhow!("upload cycle failed: {error}");
                            report_error(&mut e);
                        } else if result.uploaded > 0 || result.failed > 0 {
                            tracing::info!(
                                "Upload cycle finished: {} uploaded, {} failed, queue was {}",
                                result.uploaded,
                                result.failed,
                                result.queue_size_at_start
                            );
                        }
                    },
                    Err(UploadTriggerError::AlreadyRunning) => {},
                }
            }
        });
        *self.inner.worker.lock() = Some(handle);
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.inner.cancel.cancel();
        let handle = self.inner.worker.lock().take();
        if let Some(handle) = handle {
            join_worker(handle).await?;
        }
        Ok(())
    }

    pub fn status(&self) -> UploadStatus {
        let status = self.inner.status.lock();
        UploadStatus {
            is_running: self.inner.gate.is_running(),
            is_client_connected: self.inner.connectivity.is_connected(),
            queue_size: status.queue_size,
            total_uploaded: status.total_uploaded,
            total_failed: status.total_failed,
            last_run_at: status.last_run_at,
            last_result: status.last_result.clone(),
        }
    }

    /// Runs one upload cycle. Rejected while another one is in flight.
    pub async fn run_cycle(&self) -> Result<UploadCycleResult, UploadTriggerError> {
        let _guard = self
            .inner
            .gate
            .try_enter()
            .ok_or(UploadTriggerError::AlreadyRunning)?;
        let timestamp = UnixMillis::now();

        // Offline: do not touch the store or the network.
        if !self.inner.connectivity.is_connected() {
            let result = UploadCycleResult {
                is_client_connected: false,
                queue_size_at_start: 0,
                batches_attempted: 0,
                uploaded: 0,
                failed: 0,
                aborted_offline: false,
                error: None,
                timestamp,
            };
            self.record(result.clone(), None);
            return Ok(result);
        }

        let mut result = UploadCycleResult {
            is_client_connected: true,
            queue_size_at_start: 0,
            batches_attempted: 0,
            uploaded: 0,
            failed: 0,
            aborted_offline: false,
            error: None,
            timestamp,
        };
        if let Err(e) = self.drain_queue(&mut result).await {
            result.error = Some(format!("{e:#}"));
        }

        if result.uploaded > 0 {
            if let Err(e) = self
                .inner
                .store
                .append_sync_log(result.uploaded as usize, true, None)
                .await
            {
                tracing::warn!("Failed to append upload success log: {e:#}");
            }
            self.after_successful_cycle(&result).await;
        }
        let queue_size = self
            .inner
            .store
            .count_unsynchronized()
            .await
            .unwrap_or(result.queue_size_at_start.saturating_sub(result.uploaded));
        self.record(result.clone(), Some(queue_size));
        Ok(result)
    }

    fn record(&self, result: UploadCycleResult, queue_size: Option<u64>) {
        let mut status = self.inner.status.lock();
        status.total_uploaded += result.uploaded;
        status.total_failed += result.failed;
        status.last_run_at = Some(result.timestamp);
        if let Some(queue_size) = queue_size {
            status.queue_size = queue_size;
        }
        status.last_result = Some(result);
    }

    async fn drain_queue(&self, result: &mut UploadCycleResult) -> anyhow::Result<()> {
        result.queue_size_at_start = self.inner.store.count_unsynchronized().await?;
        loop {
            if self.inner.cancel.is_cancelled() {
                result.error = Some("shutdown requested; upload cycle truncated".to_owned());
                return Ok(());
            }
            let batch = self
                .inner
                .store
                .list_unsynchronized_readings(self.inner.config.batch_size)
                .await?;
            if batch.is_empty() {
                return Ok(());
            }
            result.batches_attempted += 1;
            let ids: Vec<i64> = batch.iter().map(|r| r.id).collect();
            match self.upload_batch(&batch).await {
                BatchOutcome::Acked => {
                    // Delete only after the ack: at-least-once, never lost.
                    self.inner.store.delete_readings(&ids).await?;
                    result.uploaded += ids.len() as u64;
                },
                BatchOutcome::RetriesExhausted(message) => {
                    self.inner.store.increment_retry_count(&ids).await?;
                    self.inner
                        .store
                        .append_sync_log(ids.len(), false, Some(&message))
                        .await?;
                    result.failed += ids.len() as u64;
                    result.error = Some(message);
                    return Ok(());
                },
                BatchOutcome::Rejected(message) => {
                    // Readings stay queued untouched; an operator has to fix
                    // the upstream contract or the credentials.
                    self.inner
                        .store
                        .append_sync_log(ids.len(), false, Some(&message))
                        .await?;
                    result.error = Some(message);
                    return Ok(());
                },
                BatchOutcome::WentOffline => {
                    result.aborted_offline = true;
                    return Ok(());
                },
            }
        }
    }

    async fn upload_batch(&self, batch: &[ReadingRow]) -> BatchOutcome {
        let mut backoff = Backoff::new(INITIAL_BACKOFF, MAX_BACKOFF);
        let mut last_error = String::new();
        for attempt in 0..self.inner.config.max_retries {
            match self
                .inner
                .cloud
                .upload_readings(self.inner.tenant_id, batch)
                .await
            {
                Ok(receipt) => {
                    tracing::debug!(
                        "Server acknowledged {} records",
                        receipt.records_processed
                    );
                    return BatchOutcome::Acked;
                },
                Err(e @ UploadError::Rejected { .. }) => {
                    return BatchOutcome::Rejected(e.to_string());
                },
                Err(e @ UploadError::Retryable(_)) => {
                    last_error = e.to_string();
                    tracing::warn!(
                        "Upload attempt {}/{} failed: {last_error}",
                        attempt + 1,
                        self.inner.config.max_retries
                    );
                    if attempt + 1 < self.inner.config.max_retries {
                        tokio::time::sleep(backoff.fail()).await;
                        if !self.inner.connectivity.force_check().await {
                            return BatchOutcome::WentOffline;
                        }
                    }
                },
            }
        }
        BatchOutcome::RetriesExhausted(last_error)
    }

    async fn after_successful_cycle(&self, result: &UploadCycleResult) {
        let counters = HeartbeatCounters {
            uploaded: result.uploaded,
            failed: result.failed,
            queued: result.queue_size_at_start.saturating_sub(result.uploaded),
        };
        if let Err(e) = self
            .inner
            .cloud
            .heartbeat(self.inner.tenant_id, counters)
            .await
        {
            tracing::debug!("Heartbeat failed (best effort): {e:#}");
        }
        let horizon = UnixMillis::now().saturating_sub(*SYNC_LOG_RETENTION);
        match self.inner.store.prune_sync_logs(horizon).await {
            Ok(0) => {},
            Ok(pruned) => tracing::info!("Pruned {pruned} expired sync log rows"),
            Err(e) => tracing::warn!("Failed to prune sync logs: {e:#}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use cloud_client::testing::{
        FakeClientSystem,
        FakeUploadOutcome,
    };
    use common::{
        testing::MemoryStore,
        types::{
            WideReadingBatch,
            WideRow,
        },
    };
    use pretty_assertions::assert_eq;

    use super::*;

    async fn seed_readings(store: &MemoryStore, n: usize) {
        let rows = (0..n)
            .map(|i| WideRow {
                tenant_id: 7,
                meter_id: 10,
                meter_element_id: 1,
                created_at: UnixMillis::from_millis(1_000 + i as i64),
                values: vec![Some(i as f64)],
            })
            .collect();
        store
            .insert_readings_wide(&WideReadingBatch {
                field_columns: vec!["presentValue".to_owned()],
                rows,
            })
            .await
            .unwrap();
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        cloud: Arc<FakeClientSystem>,
        monitor: Arc<ConnectivityMonitor>,
        manager: UploadManager,
    }

    fn fixture(batch_size: usize) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let cloud = Arc::new(FakeClientSystem::new());
        let monitor = ConnectivityMonitor::new(cloud.clone(), Duration::from_secs(60));
        let manager = UploadManager::new(
            store.clone(),
            cloud.clone(),
            monitor.clone(),
            7,
            UploadConfig {
                interval: Duration::from_secs(300),
                batch_size,
                max_retries: 5,
            },
        );
        Fixture {
            store,
            cloud,
            monitor,
            manager,
        }
    }

    #[tokio::test]
    async fn offline_cycle_touches_nothing() {
        let fx = fixture(1000);
        seed_readings(&fx.store, 30).await;
        fx.cloud.set_online(false);
        fx.monitor.force_check().await;

        let result = fx.manager.run_cycle().await.unwrap();
        assert!(!result.is_client_connected);
        assert_eq!(result.uploaded, 0);
        assert_eq!(fx.cloud.uploaded_batches().len(), 0);
        assert_eq!(fx.store.reading_count(), 30);
    }

    #[tokio::test]
    async fn queued_readings_drain_once_connected() {
        let fx = fixture(1000);
        seed_readings(&fx.store, 30).await;
        fx.monitor.force_check().await;

        let result = fx.manager.run_cycle().await.unwrap();
        assert!(result.is_client_connected);
        assert_eq!(result.queue_size_at_start, 30);
        assert_eq!(result.uploaded, 30);
        assert_eq!(result.batches_attempted, 1);
        // Acknowledged rows are gone; a success log row exists.
        assert_eq!(fx.store.reading_count(), 0);
        let logs = fx.store.sync_logs();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].success);
        assert_eq!(logs[0].batch_size, 30);
        // The heartbeat carried the cycle counters.
        assert_eq!(fx.cloud.heartbeats().len(), 1);
        assert_eq!(fx.cloud.heartbeats()[0].uploaded, 30);
    }

    #[tokio::test]
    async fn oldest_readings_ship_first() {
        let fx = fixture(10);
        seed_readings(&fx.store, 25).await;
        fx.monitor.force_check().await;

        fx.manager.run_cycle().await.unwrap();
        let batches = fx.cloud.uploaded_batches();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 10);
        assert_eq!(batches[2].len(), 5);
        // Ascending created_at means ascending seeded ids here.
        assert!(batches[0].windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failures_back_off_then_succeed() {
        let fx = fixture(1000);
        seed_readings(&fx.store, 30).await;
        fx.monitor.force_check().await;
        fx.cloud.script_uploads([
            FakeUploadOutcome::Retryable("503 service unavailable".to_owned()),
            FakeUploadOutcome::Retryable("503 service unavailable".to_owned()),
        ]);

        let result = fx.manager.run_cycle().await.unwrap();
        assert_eq!(result.uploaded, 30);
        assert_eq!(result.failed, 0);
        assert_eq!(fx.store.reading_count(), 0);
        // The rows were never persisted as failed.
        let logs = fx.store.sync_logs();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].success);
        assert_eq!(logs[0].batch_size, 30);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_keep_rows_queued_with_bumped_retry_count() {
        let fx = fixture(1000);
        seed_readings(&fx.store, 30).await;
        fx.monitor.force_check().await;
        fx.cloud.script_uploads(
            std::iter::repeat_with(|| FakeUploadOutcome::Retryable("boom".to_owned())).take(5),
        );

        let result = fx.manager.run_cycle().await.unwrap();
        assert_eq!(result.uploaded, 0);
        assert_eq!(result.failed, 30);
        assert_eq!(fx.store.reading_count(), 30);
        assert!(fx.store.all_readings().iter().all(|r| r.retry_count == 1));
        let logs = fx.store.sync_logs();
        assert_eq!(logs.len(), 1);
        assert!(!logs[0].success);
        assert_eq!(logs[0].batch_size, 30);
    }

    #[tokio::test]
    async fn rejected_batches_are_left_untouched_for_the_operator() {
        let fx = fixture(1000);
        seed_readings(&fx.store, 30).await;
        fx.monitor.force_check().await;
        fx.cloud.script_uploads([FakeUploadOutcome::Rejected(
            400,
            "meter_element_id is required".to_owned(),
        )]);

        let result = fx.manager.run_cycle().await.unwrap();
        assert_eq!(result.uploaded, 0);
        assert_eq!(result.failed, 0);
        assert_eq!(fx.store.reading_count(), 30);
        assert!(fx.store.all_readings().iter().all(|r| r.retry_count == 0));
        let logs = fx.store.sync_logs();
        assert_eq!(logs.len(), 1);
        assert!(!logs[0].success);
        assert!(logs[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("meter_element_id is required"));
    }

    #[tokio::test(start_paused = true)]
    async fn going_offline_mid_retry_aborts_the_cycle() {
        let fx = fixture(1000);
        seed_readings(&fx.store, 30).await;
        fx.monitor.force_check().await;
        fx.cloud.script_uploads([FakeUploadOutcome::Retryable(
            "connection reset".to_owned(),
        )]);
        // The re-probe after the first backoff sees the link down.
        fx.cloud.set_online(false);

        let result = fx.manager.run_cycle().await.unwrap();
        assert!(result.aborted_offline);
        assert_eq!(fx.store.reading_count(), 30);
        assert!(fx.store.all_readings().iter().all(|r| r.retry_count == 0));
        assert_eq!(fx.store.sync_logs().len(), 0);
    }

    #[tokio::test]
    async fn batch_size_one_still_drains_the_queue() {
        let fx = fixture(1);
        seed_readings(&fx.store, 3).await;
        fx.monitor.force_check().await;

        let result = fx.manager.run_cycle().await.unwrap();
        assert_eq!(result.uploaded, 3);
        assert_eq!(result.batches_attempted, 3);
        assert_eq!(fx.cloud.uploaded_batches().len(), 3);
        assert_eq!(fx.store.reading_count(), 0);
    }

    #[tokio::test]
    async fn empty_queue_exits_without_touching_the_network() {
        let fx = fixture(1000);
        fx.monitor.force_check().await;

        let result = fx.manager.run_cycle().await.unwrap();
        assert_eq!(result.uploaded, 0);
        assert_eq!(result.batches_attempted, 0);
        assert_eq!(fx.cloud.uploaded_batches().len(), 0);
        assert_eq!(fx.store.sync_logs().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn connected_event_triggers_a_drain() {
        let fx = fixture(1000);
        seed_readings(&fx.store, 5).await;
        fx.cloud.set_online(false);
        fx.monitor.force_check().await;
        fx.manager.start();

        fx.cloud.set_online(true);
        fx.monitor.force_check().await;
        while fx.store.reading_count() > 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(fx.cloud.uploaded_batches().len(), 1);
        fx.manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn overlapping_cycles_are_rejected() {
        let fx = fixture(1000);
        fx.monitor.force_check().await;
        // Hold the gate the way a running cycle would.
        let guard = fx.manager.inner.gate.try_enter().unwrap();
        assert!(matches!(
            fx.manager.run_cycle().await,
            Err(UploadTriggerError::AlreadyRunning)
        ));
        drop(guard);
        assert!(fx.manager.run_cycle().await.is_ok());
    }
}

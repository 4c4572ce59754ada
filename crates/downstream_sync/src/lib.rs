//! Downstream sync: replicate the authoritative tenant and meter rows from
//! the Client System's database into the local store. Tenant first (meters
//! have no filter without one), then a three-set meter reconciliation:
//! deactivates, inserts, updates, each row its own transaction. Any change
//! asks the cache to reload before the next collection cycle.

pub mod diff;

use std::{
    sync::Arc,
    time::Duration,
};

use cache::MeterCache;
use cloud_client::ClientSystemApi;
use common::{
    errors::report_error,
    gate::CycleGate,
    runtime::{
        join_worker,
        tokio_spawn,
    },
    store::{
        LocalStore,
        RemoteConfigSource,
    },
    types::UnixMillis,
};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("meter sync already in progress")]
    AlreadyRunning,
}

#[derive(Clone, Debug, Serialize)]
pub struct SyncResult {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub success: bool,
    pub error: Option<String>,
    pub timestamp: UnixMillis,
}

impl SyncResult {
    pub fn changed(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct MeterSyncStatus {
    pub is_running: bool,
    pub runs_completed: u64,
    pub last_sync_at: Option<UnixMillis>,
    pub last_result: Option<SyncResult>,
}

#[derive(Default)]
struct StatusInner {
    runs_completed: u64,
    last_sync_at: Option<UnixMillis>,
    last_result: Option<SyncResult>,
}

struct Inner {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteConfigSource>,
    cache: Arc<MeterCache>,
    cloud: Arc<dyn ClientSystemApi>,
    tenant_id: i64,
    interval: Duration,
    gate: CycleGate,
    status: Mutex<StatusInner>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct MeterSyncAgent {
    inner: Arc<Inner>,
}

impl MeterSyncAgent {
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteConfigSource>,
        cache: Arc<MeterCache>,
        cloud: Arc<dyn ClientSystemApi>,
        tenant_id: i64,
        interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                remote,
                cache,
                cloud,
                tenant_id,
                interval,
                gate: CycleGate::new(),
                status: Mutex::new(StatusInner::default()),
                cancel: CancellationToken::new(),
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn tenant_id(&self) -> i64 {
        self.inner.tenant_id
    }

    pub fn start(&self) {
        let this = self.clone();
        let handle = tokio_spawn("downstream_sync", async move {
            tracing::info!(
                "Starting downstream sync agent (interval {:?})",
                this.inner.interval
            );
            loop {
                tokio::select! {
                    _ = this.inner.cancel.cancelled() => break,
                    _ = tokio::time::sleep(this.inner.interval) => {},
                }
                match this.run_sync().await {
                    Ok(result) if result.success => {
                        tracing::info!(
                            "Downstream sync finished: +{} ~{} -{}",
                            result.inserted,
                            result.updated,
                            result.deleted
                        );
                    },
                    Ok(result) => {
                        let mut e = anyhow::anyhow!(
                            "downstream sync failed: {}",
                            result.error.as_deref().unwrap_or("unknown error")
                        );
                        report_error(&mut e);
                    },
                    Err(SyncError::AlreadyRunning) => {},
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

    pub fn status(&self) -> MeterSyncStatus {
        let status = self.inner.status.lock();
        MeterSyncStatus {
            is_running: self.inner.gate.is_running(),
            runs_completed: status.runs_completed,
            last_sync_at: status.last_sync_at,
            last_result: status.last_result.clone(),
        }
    }

    /// Runs one downstream sync. Rejected while another one is in flight.
    pub async fn run_sync(&self) -> Result<SyncResult, SyncError> {
        let _guard = self
            .inner
            .gate
            .try_enter()
            .ok_or(SyncError::AlreadyRunning)?;
        let timestamp = UnixMillis::now();
        let result = match self.sync_once().await {
            Ok((inserted, updated, deleted)) => SyncResult {
                inserted,
                updated,
                deleted,
                success: true,
                error: None,
                timestamp,
            },
            Err(e) => SyncResult {
                inserted: 0,
                updated: 0,
                deleted: 0,
                success: false,
                error: Some(format!("{e:#}")),
                timestamp,
            },
        };
        let detail = match &result.error {
            Some(error) => format!("error: {error}"),
            None => format!(
                "inserted={} updated={} deactivated={}",
                result.inserted, result.updated, result.deleted
            ),
        };
        if let Err(e) = self
            .inner
            .store
            .append_sync_operation("downstream_sync", "sync", Some(&detail))
            .await
        {
            tracing::warn!("Failed to append sync operation row: {e:#}");
        }
        let mut status = self.inner.status.lock();
        status.runs_completed += 1;
        status.last_sync_at = Some(timestamp);
        status.last_result = Some(result.clone());
        Ok(result)
    }

    async fn sync_once(&self) -> anyhow::Result<(usize, usize, usize)> {
        let mut inserted = 0;
        let mut updated = 0;
        let mut deleted = 0;
        let mut row_failures: Vec<String> = Vec::new();

        // Tenant first. Without a tenant row there is no meter filter, so the
        // run stops here.
        let remote_tenant = self
            .inner
            .remote
            .fetch_tenant(self.inner.tenant_id)
            .await?
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "no tenant row in the remote database for tenant {}",
                    self.inner.tenant_id
                )
            })?;
        match self.inner.store.get_tenant().await? {
            None => {
                self.inner.store.upsert_tenant(&remote_tenant).await?;
                inserted += 1;
            },
            Some(local_tenant) => {
                if diff::tenant_differs(&remote_tenant, &local_tenant) {
                    self.inner.store.upsert_tenant(&remote_tenant).await?;
                    updated += 1;
                }
            },
        }
        // Surface the key so uploads and probes can authenticate.
        if remote_tenant.has_api_key() {
            self.inner.cloud.set_api_key(remote_tenant.api_key.clone());
        }

        let remote_meters = self.inner.remote.fetch_meters(self.inner.tenant_id).await?;
        let local_meters = self.inner.store.list_meters(false).await?;
        let diff = diff::diff_meters(&remote_meters, &local_meters);

        for key in &diff.to_deactivate {
            match self
                .inner
                .store
                .deactivate_meter(key.meter_id, Some(key.meter_element_id))
                .await
            {
                Ok(()) => deleted += 1,
                Err(e) => row_failures.push(format!("deactivate {key}: {e:#}")),
            }
        }
        for meter in &diff.to_insert {
            match self.inner.store.upsert_meter(meter).await {
                Ok(()) => inserted += 1,
                Err(e) => row_failures.push(format!("insert {}: {e:#}", meter.key())),
            }
        }
        for meter in &diff.to_update {
            match self.inner.store.upsert_meter(meter).await {
                Ok(()) => updated += 1,
                Err(e) => row_failures.push(format!("update {}: {e:#}", meter.key())),
            }
        }
        for failure in &row_failures {
            tracing::warn!("Downstream sync row failure: {failure}");
        }

        if inserted + updated + deleted > 0 {
            self.inner
                .cache
                .reload(self.inner.store.as_ref())
                .await?;
        }
        Ok((inserted, updated, deleted))
    }
}

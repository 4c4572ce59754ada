//! Process-lifetime view of the tenant and the active meter set, keyed for
//! the polling hot path. Readers take an immutable snapshot; `reload` is the
//! only mutation path and atomically swaps the snapshot, so concurrent
//! readers see either the pre- or post-reload state, never a mix.

use std::sync::{
    atomic::{
        AtomicU64,
        Ordering,
    },
    Arc,
};

use common::{
    store::LocalStore,
    types::{
        Meter,
        Tenant,
        UnixMillis,
    },
};
use parking_lot::RwLock;

#[derive(Debug)]
pub struct CacheSnapshot {
    pub tenant: Option<Tenant>,
    pub meters: Vec<Meter>,
    pub loaded_at: UnixMillis,
}

pub struct MeterCache {
    snapshot: RwLock<Option<Arc<CacheSnapshot>>>,
    reloads_completed: AtomicU64,
    reload_lock: tokio::sync::Mutex<()>,
}

impl MeterCache {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(None),
            reloads_completed: AtomicU64::new(0),
            reload_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// The current snapshot, if one has been loaded since the last
    /// invalidation. Never touches the store.
    pub fn snapshot(&self) -> Option<Arc<CacheSnapshot>> {
        self.snapshot.read().clone()
    }

    pub fn tenant(&self) -> Option<Tenant> {
        self.snapshot.read().as_ref().and_then(|s| s.tenant.clone())
    }

    pub fn meters(&self) -> Vec<Meter> {
        self.snapshot
            .read()
            .as_ref()
            .map(|s| s.meters.clone())
            .unwrap_or_default()
    }

    pub fn is_valid(&self) -> bool {
        self.snapshot.read().is_some()
    }

    /// Drops the snapshot; the next cycle reloads before polling.
    pub fn invalidate(&self) {
        *self.snapshot.write() = None;
    }

    /// Loads the tenant and the active meters and publishes them as one new
    /// snapshot. Serialized; callers that were queued behind a completed
    /// reload coalesce into it instead of hitting the store again.
    pub async fn reload(&self, store: &dyn LocalStore) -> anyhow::Result<()> {
        let observed = self.reloads_completed.load(Ordering::Acquire);
        let _guard = self.reload_lock.lock().await;
        if self.reloads_completed.load(Ordering::Acquire) != observed && self.is_valid() {
            return Ok(());
        }

        let tenant = store.get_tenant().await?;
        let meters = store.list_meters(true).await?;
        tracing::debug!(
            "Cache reloaded: tenant={:?}, {} active meters",
            tenant.as_ref().map(|t| t.tenant_id),
            meters.len()
        );
        *self.snapshot.write() = Some(Arc::new(CacheSnapshot {
            tenant,
            meters,
            loaded_at: UnixMillis::now(),
        }));
        self.reloads_completed.fetch_add(1, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use common::{
        testing::MemoryStore,
        types::{
            MeterKey,
            ReadingRow,
            SyncLogEntry,
            WideReadingBatch,
        },
    };
    use pretty_assertions::assert_eq;

    use super::*;

    fn meter(id: i64, element: i64, active: bool) -> Meter {
        Meter {
            meter_id: id,
            meter_element_id: element,
            name: format!("meter-{id}-{element}"),
            ip: "192.0.2.5".to_owned(),
            port: 47808,
            element: "kWh".to_owned(),
            active,
        }
    }

    fn tenant() -> Tenant {
        Tenant {
            tenant_id: 7,
            name: "Site A".to_owned(),
            address: None,
            city: None,
            country: None,
            active: true,
            api_key: Some("k".to_owned()),
        }
    }

    #[tokio::test]
    async fn reload_publishes_only_active_meters() {
        let store = MemoryStore::with_tenant(tenant());
        store.put_meter(meter(10, 1, true));
        store.put_meter(meter(10, 2, false));
        let cache = MeterCache::new();
        assert!(!cache.is_valid());

        cache.reload(&store).await.unwrap();
        assert!(cache.is_valid());
        assert_eq!(cache.tenant().unwrap().tenant_id, 7);
        let meters = cache.meters();
        assert_eq!(meters.len(), 1);
        assert_eq!(
            meters[0].key(),
            MeterKey {
                meter_id: 10,
                meter_element_id: 1
            }
        );
    }

    #[tokio::test]
    async fn invalidate_clears_until_the_next_reload() {
        let store = MemoryStore::with_tenant(tenant());
        let cache = MeterCache::new();
        cache.reload(&store).await.unwrap();
        assert!(cache.is_valid());
        cache.invalidate();
        assert!(!cache.is_valid());
        assert_eq!(cache.meters(), Vec::new());
        cache.reload(&store).await.unwrap();
        assert!(cache.is_valid());
    }

    /// Counts store hits and answers slowly, to catch reloads that fail to
    /// coalesce.
    struct SlowStore {
        inner: MemoryStore,
        tenant_reads: std::sync::atomic::AtomicU64,
    }

    #[async_trait]
    impl LocalStore for SlowStore {
        async fn get_tenant(&self) -> anyhow::Result<Option<Tenant>> {
            self.tenant_reads
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.inner.get_tenant().await
        }

        async fn list_meters(&self, active_only: bool) -> anyhow::Result<Vec<Meter>> {
            self.inner.list_meters(active_only).await
        }

        async fn upsert_tenant(&self, tenant: &Tenant) -> anyhow::Result<()> {
            self.inner.upsert_tenant(tenant).await
        }

        async fn upsert_meter(&self, meter: &Meter) -> anyhow::Result<()> {
            self.inner.upsert_meter(meter).await
        }

        async fn deactivate_meter(
            &self,
            meter_id: i64,
            meter_element_id: Option<i64>,
        ) -> anyhow::Result<()> {
            self.inner.deactivate_meter(meter_id, meter_element_id).await
        }

        async fn insert_readings_wide(&self, batch: &WideReadingBatch) -> anyhow::Result<u64> {
            self.inner.insert_readings_wide(batch).await
        }

        async fn list_unsynchronized_readings(
            &self,
            limit: usize,
        ) -> anyhow::Result<Vec<ReadingRow>> {
            self.inner.list_unsynchronized_readings(limit).await
        }

        async fn delete_readings(&self, ids: &[i64]) -> anyhow::Result<u64> {
            self.inner.delete_readings(ids).await
        }

        async fn increment_retry_count(&self, ids: &[i64]) -> anyhow::Result<u64> {
            self.inner.increment_retry_count(ids).await
        }

        async fn count_unsynchronized(&self) -> anyhow::Result<u64> {
            self.inner.count_unsynchronized().await
        }

        async fn recent_readings(
            &self,
            hours: u32,
            limit: usize,
        ) -> anyhow::Result<Vec<ReadingRow>> {
            self.inner.recent_readings(hours, limit).await
        }

        async fn append_sync_log(
            &self,
            batch_size: usize,
            success: bool,
            error_message: Option<&str>,
        ) -> anyhow::Result<()> {
            self.inner
                .append_sync_log(batch_size, success, error_message)
                .await
        }

        async fn recent_sync_logs(&self, n: usize) -> anyhow::Result<Vec<SyncLogEntry>> {
            self.inner.recent_sync_logs(n).await
        }

        async fn prune_sync_logs(&self, older_than: UnixMillis) -> anyhow::Result<u64> {
            self.inner.prune_sync_logs(older_than).await
        }

        async fn append_sync_operation(
            &self,
            component: &str,
            operation: &str,
            detail: Option<&str>,
        ) -> anyhow::Result<()> {
            self.inner
                .append_sync_operation(component, operation, detail)
                .await
        }
    }

    #[tokio::test]
    async fn concurrent_reloads_coalesce() {
        let store = Arc::new(SlowStore {
            inner: MemoryStore::with_tenant(tenant()),
            tenant_reads: std::sync::atomic::AtomicU64::new(0),
        });
        let cache = Arc::new(MeterCache::new());

        let (a, b) = tokio::join!(
            cache.reload(store.as_ref() as &dyn LocalStore),
            cache.reload(store.as_ref() as &dyn LocalStore),
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(
            store
                .tenant_reads
                .load(std::sync::atomic::Ordering::SeqCst),
            1
        );
        assert!(cache.is_valid());
    }
}

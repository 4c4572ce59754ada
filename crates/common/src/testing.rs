//! In-memory stand-ins for the durable stores, for worker tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    store::{
        LocalStore,
        RemoteConfigSource,
    },
    types::{
        Meter,
        MeterKey,
        ReadingRow,
        SyncLogEntry,
        Tenant,
        UnixMillis,
        WideReadingBatch,
    },
};

#[derive(Clone, Debug)]
struct StoredReading {
    row: ReadingRow,
    is_synchronized: bool,
}

#[derive(Default)]
struct Inner {
    tenant: Option<Tenant>,
    meters: BTreeMap<MeterKey, Meter>,
    readings: BTreeMap<i64, StoredReading>,
    next_reading_id: i64,
    sync_logs: Vec<SyncLogEntry>,
    next_sync_log_id: i64,
    operations: Vec<(String, String, Option<String>)>,
    fail_inserts: usize,
}

/// A `LocalStore` backed by maps. Mirrors the transactional contract: a
/// failed operation leaves the contents untouched.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tenant(tenant: Tenant) -> Self {
        let store = Self::new();
        store.inner.lock().tenant = Some(tenant);
        store
    }

    pub fn put_meter(&self, meter: Meter) {
        self.inner.lock().meters.insert(meter.key(), meter);
    }

    /// Makes the next `n` calls to `insert_readings_wide` fail.
    pub fn fail_next_inserts(&self, n: usize) {
        self.inner.lock().fail_inserts = n;
    }

    pub fn reading_count(&self) -> usize {
        self.inner.lock().readings.len()
    }

    pub fn all_readings(&self) -> Vec<ReadingRow> {
        self.inner
            .lock()
            .readings
            .values()
            .map(|r| r.row.clone())
            .collect()
    }

    pub fn sync_logs(&self) -> Vec<SyncLogEntry> {
        self.inner.lock().sync_logs.clone()
    }

    pub fn operations(&self) -> Vec<(String, String, Option<String>)> {
        self.inner.lock().operations.clone()
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn get_tenant(&self) -> anyhow::Result<Option<Tenant>> {
        Ok(self.inner.lock().tenant.clone())
    }

    async fn upsert_tenant(&self, tenant: &Tenant) -> anyhow::Result<()> {
        self.inner.lock().tenant = Some(tenant.clone());
        Ok(())
    }

    async fn list_meters(&self, active_only: bool) -> anyhow::Result<Vec<Meter>> {
        Ok(self
            .inner
            .lock()
            .meters
            .values()
            .filter(|m| !active_only || m.active)
            .cloned()
            .collect())
    }

    async fn upsert_meter(&self, meter: &Meter) -> anyhow::Result<()> {
        self.inner.lock().meters.insert(meter.key(), meter.clone());
        Ok(())
    }

    async fn deactivate_meter(
        &self,
        meter_id: i64,
        meter_element_id: Option<i64>,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        for meter in inner.meters.values_mut() {
            if meter.meter_id == meter_id
                && meter_element_id.map_or(true, |el| meter.meter_element_id == el)
            {
                meter.active = false;
            }
        }
        Ok(())
    }

    async fn insert_readings_wide(&self, batch: &WideReadingBatch) -> anyhow::Result<u64> {
        let mut inner = self.inner.lock();
        if inner.fail_inserts > 0 {
            inner.fail_inserts -= 1;
            anyhow::bail!("injected insert failure");
        }
        for row in &batch.rows {
            let id = inner.next_reading_id;
            inner.next_reading_id += 1;
            let fields = batch
                .field_columns
                .iter()
                .zip(&row.values)
                .filter_map(|(name, value)| value.map(|v| (name.clone(), v)))
                .collect();
            inner.readings.insert(
                id,
                StoredReading {
                    row: ReadingRow {
                        id,
                        tenant_id: row.tenant_id,
                        meter_id: row.meter_id,
                        meter_element_id: row.meter_element_id,
                        created_at: row.created_at,
                        retry_count: 0,
                        fields,
                    },
                    is_synchronized: false,
                },
            );
        }
        Ok(batch.rows.len() as u64)
    }

    async fn list_unsynchronized_readings(
        &self,
        limit: usize,
    ) -> anyhow::Result<Vec<ReadingRow>> {
        let inner = self.inner.lock();
        let mut rows: Vec<_> = inner
            .readings
            .values()
            .filter(|r| !r.is_synchronized)
            .map(|r| r.row.clone())
            .collect();
        rows.sort_by_key(|r| (r.created_at, r.id));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn delete_readings(&self, ids: &[i64]) -> anyhow::Result<u64> {
        let mut inner = self.inner.lock();
        let mut deleted = 0;
        for id in ids {
            if inner.readings.remove(id).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn increment_retry_count(&self, ids: &[i64]) -> anyhow::Result<u64> {
        let mut inner = self.inner.lock();
        let mut updated = 0;
        for id in ids {
            if let Some(reading) = inner.readings.get_mut(id) {
                reading.row.retry_count += 1;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn count_unsynchronized(&self) -> anyhow::Result<u64> {
        Ok(self
            .inner
            .lock()
            .readings
            .values()
            .filter(|r| !r.is_synchronized)
            .count() as u64)
    }

    async fn recent_readings(&self, hours: u32, limit: usize) -> anyhow::Result<Vec<ReadingRow>> {
        let horizon = UnixMillis::now()
            .saturating_sub(std::time::Duration::from_secs(u64::from(hours) * 3600));
        let inner = self.inner.lock();
        let mut rows: Vec<_> = inner
            .readings
            .values()
            .filter(|r| r.row.created_at >= horizon)
            .map(|r| r.row.clone())
            .collect();
        rows.sort_by_key(|r| std::cmp::Reverse((r.created_at, r.id)));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn append_sync_log(
        &self,
        batch_size: usize,
        success: bool,
        error_message: Option<&str>,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        let id = inner.next_sync_log_id;
        inner.next_sync_log_id += 1;
        inner.sync_logs.push(SyncLogEntry {
            id,
            batch_size: batch_size as i32,
            success,
            error_message: error_message.map(str::to_owned),
            synced_at: UnixMillis::now(),
        });
        Ok(())
    }

    async fn recent_sync_logs(&self, n: usize) -> anyhow::Result<Vec<SyncLogEntry>> {
        let inner = self.inner.lock();
        Ok(inner.sync_logs.iter().rev().take(n).cloned().collect())
    }

    async fn prune_sync_logs(&self, older_than: UnixMillis) -> anyhow::Result<u64> {
        let mut inner = self.inner.lock();
        let before = inner.sync_logs.len();
        inner.sync_logs.retain(|l| l.synced_at >= older_than);
        Ok((before - inner.sync_logs.len()) as u64)
    }

    async fn append_sync_operation(
        &self,
        component: &str,
        operation: &str,
        detail: Option<&str>,
    ) -> anyhow::Result<()> {
        self.inner.lock().operations.push((
            component.to_owned(),
            operation.to_owned(),
            detail.map(str::to_owned),
        ));
        Ok(())
    }
}

/// A scriptable `RemoteConfigSource`.
#[derive(Default)]
pub struct FakeRemoteConfig {
    tenant: Mutex<Option<Tenant>>,
    meters: Mutex<Vec<Meter>>,
    fail: Mutex<bool>,
}

impl FakeRemoteConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_tenant(&self, tenant: Option<Tenant>) {
        *self.tenant.lock() = tenant;
    }

    pub fn set_meters(&self, meters: Vec<Meter>) {
        *self.meters.lock() = meters;
    }

    pub fn set_unreachable(&self, fail: bool) {
        *self.fail.lock() = fail;
    }
}

#[async_trait]
impl RemoteConfigSource for FakeRemoteConfig {
    async fn fetch_tenant(&self, tenant_id: i64) -> anyhow::Result<Option<Tenant>> {
        anyhow::ensure!(!*self.fail.lock(), "remote database unreachable");
        Ok(self
            .tenant
            .lock()
            .clone()
            .filter(|t| t.tenant_id == tenant_id))
    }

    async fn fetch_meters(&self, _tenant_id: i64) -> anyhow::Result<Vec<Meter>> {
        anyhow::ensure!(!*self.fail.lock(), "remote database unreachable");
        Ok(self.meters.lock().clone())
    }
}

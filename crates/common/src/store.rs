use async_trait::async_trait;

use crate::types::{
    Meter,
    ReadingRow,
    SyncLogEntry,
    Tenant,
    UnixMillis,
    WideReadingBatch,
};

/// The durable store contract. All mutating operations are transactional: on
/// error they return `Err` and leave the store unchanged. Implemented by the
/// Postgres store and by `testing::MemoryStore`.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn get_tenant(&self) -> anyhow::Result<Option<Tenant>>;

    async fn upsert_tenant(&self, tenant: &Tenant) -> anyhow::Result<()>;

    async fn list_meters(&self, active_only: bool) -> anyhow::Result<Vec<Meter>>;

    async fn upsert_meter(&self, meter: &Meter) -> anyhow::Result<()>;

    /// Sets `active = false`. With `meter_element_id = None`, deactivates
    /// every element of the meter.
    async fn deactivate_meter(
        &self,
        meter_id: i64,
        meter_element_id: Option<i64>,
    ) -> anyhow::Result<()>;

    /// Atomically inserts a pre-pivoted batch. Every inserted row starts with
    /// `is_synchronized = false` and `retry_count = 0`.
    async fn insert_readings_wide(&self, batch: &WideReadingBatch) -> anyhow::Result<u64>;

    /// Unsynchronized rows ordered by `created_at` ascending, at most `limit`.
    async fn list_unsynchronized_readings(&self, limit: usize)
        -> anyhow::Result<Vec<ReadingRow>>;

    async fn delete_readings(&self, ids: &[i64]) -> anyhow::Result<u64>;

    async fn increment_retry_count(&self, ids: &[i64]) -> anyhow::Result<u64>;

    async fn count_unsynchronized(&self) -> anyhow::Result<u64>;

    /// Readings from the trailing `hours`, newest first, at most `limit`.
    async fn recent_readings(&self, hours: u32, limit: usize) -> anyhow::Result<Vec<ReadingRow>>;

    async fn append_sync_log(
        &self,
        batch_size: usize,
        success: bool,
        error_message: Option<&str>,
    ) -> anyhow::Result<()>;

    async fn recent_sync_logs(&self, n: usize) -> anyhow::Result<Vec<SyncLogEntry>>;

    async fn prune_sync_logs(&self, older_than: UnixMillis) -> anyhow::Result<u64>;

    /// Operational trace, append-only.
    async fn append_sync_operation(
        &self,
        component: &str,
        operation: &str,
        detail: Option<&str>,
    ) -> anyhow::Result<()>;
}

/// Read-only view of the authoritative configuration tables in the Client
/// System's database. Used only by the downstream sync agent.
#[async_trait]
pub trait RemoteConfigSource: Send + Sync {
    async fn fetch_tenant(&self, tenant_id: i64) -> anyhow::Result<Option<Tenant>>;

    async fn fetch_meters(&self, tenant_id: i64) -> anyhow::Result<Vec<Meter>>;
}

//! Postgres-backed implementations of the agent's two store contracts: the
//! durable local store, and the read-only view of the Client System's
//! configuration tables used by downstream sync.

mod connection;
pub mod sql;

use std::{
    collections::BTreeMap,
    sync::Arc,
};

use anyhow::Context as _;
use async_trait::async_trait;
use common::{
    store::{
        LocalStore,
        RemoteConfigSource,
    },
    types::{
        Meter,
        ReadingRow,
        SyncLogEntry,
        Tenant,
        UnixMillis,
        WideReadingBatch,
    },
};
use tokio_postgres::{
    types::ToSql,
    Row,
};

pub use crate::connection::{
    PgConnection,
    PgPool,
    PgTransaction,
    PostgresTimeout,
};

/// The durable local store. One per agent; shared by every component through
/// `Arc<dyn LocalStore>`.
pub struct PostgresStore {
    pool: Arc<PgPool>,
}

impl PostgresStore {
    /// Connects and brings the schema up to date. Fatal at startup if the
    /// database is unreachable.
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let config: tokio_postgres::Config =
            url.parse().context("invalid local database url")?;
        let pool = PgPool::new(config)?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> anyhow::Result<()> {
        let conn = self.pool.get_connection().await?;
        for statement in sql::init_statements() {
            conn.batch_execute(&statement).await?;
        }
        tracing::info!("Local store schema initialized");
        Ok(())
    }

    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}

fn tenant_from_row(row: &Row) -> anyhow::Result<Tenant> {
    Ok(Tenant {
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        address: row.try_get("address")?,
        city: row.try_get("city")?,
        country: row.try_get("country")?,
        active: row.try_get("active")?,
        api_key: row.try_get("api_key")?,
    })
}

fn meter_from_row(row: &Row) -> anyhow::Result<Meter> {
    let port: i32 = row.try_get("port")?;
    Ok(Meter {
        meter_id: row.try_get("meter_id")?,
        meter_element_id: row.try_get("meter_element_id")?,
        name: row.try_get("name")?,
        ip: row.try_get("ip")?,
        port: u16::try_from(port).with_context(|| format!("meter port {port} out of range"))?,
        element: row.try_get("element")?,
        active: row.try_get("active")?,
    })
}

// The reading row is wide and sparse; only columns in the known field
// superset become entries in `fields`, and NULLs are skipped.
fn reading_from_row(row: &Row) -> anyhow::Result<ReadingRow> {
    let mut fields = BTreeMap::new();
    for (i, column) in row.columns().iter().enumerate() {
        let name = column.name();
        if sql::is_known_field(name) {
            if let Some(value) = row.try_get::<_, Option<f64>>(i)? {
                fields.insert(name.to_owned(), value);
            }
        }
    }
    let created_at: i64 = row.try_get("created_at")?;
    Ok(ReadingRow {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        meter_id: row.try_get("meter_id")?,
        meter_element_id: row.try_get("meter_element_id")?,
        created_at: UnixMillis::from_millis(created_at),
        retry_count: row.try_get("retry_count")?,
        fields,
    })
}

fn sync_log_from_row(row: &Row) -> anyhow::Result<SyncLogEntry> {
    let synced_at: i64 = row.try_get("synced_at")?;
    Ok(SyncLogEntry {
        id: row.try_get("id")?,
        batch_size: row.try_get("batch_size")?,
        success: row.try_get("success")?,
        error_message: row.try_get("error_message")?,
        synced_at: UnixMillis::from_millis(synced_at),
    })
}

#[async_trait]
impl LocalStore for PostgresStore {
    async fn get_tenant(&self) -> anyhow::Result<Option<Tenant>> {
        let conn = self.pool.get_connection().await?;
        let statement = conn.prepare_cached(sql::GET_TENANT).await?;
        conn.query_opt(&statement, &[])
            .await?
            .map(|row| tenant_from_row(&row))
            .transpose()
    }

    async fn upsert_tenant(&self, tenant: &Tenant) -> anyhow::Result<()> {
        let conn = self.pool.get_connection().await?;
        let statement = conn.prepare_cached(sql::UPSERT_TENANT).await?;
        conn.execute(
            &statement,
            &[
                &tenant.tenant_id,
                &tenant.name,
                &tenant.address,
                &tenant.city,
                &tenant.country,
                &tenant.active,
                &tenant.api_key,
            ],
        )
        .await?;
        Ok(())
    }

    async fn list_meters(&self, active_only: bool) -> anyhow::Result<Vec<Meter>> {
        let conn = self.pool.get_connection().await?;
        let statement = if active_only {
            conn.prepare_cached(sql::LIST_ACTIVE_METERS).await?
        } else {
            conn.prepare_cached(sql::LIST_METERS).await?
        };
        conn.query(&statement, &[])
            .await?
            .iter()
            .map(meter_from_row)
            .collect()
    }

    async fn upsert_meter(&self, meter: &Meter) -> anyhow::Result<()> {
        let conn = self.pool.get_connection().await?;
        let statement = conn.prepare_cached(sql::UPSERT_METER).await?;
        let port = i32::from(meter.port);
        conn.execute(
            &statement,
            &[
                &meter.meter_id,
                &meter.meter_element_id,
                &meter.name,
                &meter.ip,
                &port,
                &meter.element,
                &meter.active,
            ],
        )
        .await?;
        Ok(())
    }

    async fn deactivate_meter(
        &self,
        meter_id: i64,
        meter_element_id: Option<i64>,
    ) -> anyhow::Result<()> {
        let conn = self.pool.get_connection().await?;
        match meter_element_id {
            Some(element_id) => {
                let statement = conn.prepare_cached(sql::DEACTIVATE_METER_ELEMENT).await?;
                conn.execute(&statement, &[&meter_id, &element_id]).await?;
            },
            None => {
                let statement = conn.prepare_cached(sql::DEACTIVATE_METER).await?;
                conn.execute(&statement, &[&meter_id]).await?;
            },
        }
        Ok(())
    }

    async fn insert_readings_wide(&self, batch: &WideReadingBatch) -> anyhow::Result<u64> {
        if batch.is_empty() {
            return Ok(0);
        }
        for field in &batch.field_columns {
            anyhow::ensure!(sql::is_known_field(field), "unknown reading field {field}");
        }
        for row in &batch.rows {
            anyhow::ensure!(
                row.values.len() == batch.field_columns.len(),
                "wide row width {} does not match column list {}",
                row.values.len(),
                batch.field_columns.len()
            );
        }
        let statement_sql = sql::insert_readings_statement(&batch.field_columns, batch.len());
        let created: Vec<i64> = batch
            .rows
            .iter()
            .map(|r| r.created_at.as_millis())
            .collect();
        let mut params: Vec<&(dyn ToSql + Sync)> =
            Vec::with_capacity(batch.len() * (sql::READING_BASE_COLUMNS.len() + batch.field_columns.len()));
        for (row, created_at) in batch.rows.iter().zip(&created) {
            params.push(&row.tenant_id);
            params.push(&row.meter_id);
            params.push(&row.meter_element_id);
            params.push(created_at);
            for value in &row.values {
                params.push(value);
            }
        }
        let mut conn = self.pool.get_connection().await?;
        let transaction = conn.transaction().await?;
        let statement = transaction.prepare_cached(&statement_sql).await?;
        let inserted = transaction.execute(&statement, &params).await?;
        transaction.commit().await?;
        Ok(inserted)
    }

    async fn list_unsynchronized_readings(
        &self,
        limit: usize,
    ) -> anyhow::Result<Vec<ReadingRow>> {
        let conn = self.pool.get_connection().await?;
        let statement = conn.prepare_cached(sql::LIST_UNSYNCHRONIZED_READINGS).await?;
        let limit = i64::try_from(limit)?;
        conn.query(&statement, &[&limit])
            .await?
            .iter()
            .map(reading_from_row)
            .collect()
    }

    async fn delete_readings(&self, ids: &[i64]) -> anyhow::Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let conn = self.pool.get_connection().await?;
        let statement = conn.prepare_cached(sql::DELETE_READINGS).await?;
        conn.execute(&statement, &[&ids]).await
    }

    async fn increment_retry_count(&self, ids: &[i64]) -> anyhow::Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let conn = self.pool.get_connection().await?;
        let statement = conn.prepare_cached(sql::INCREMENT_RETRY_COUNT).await?;
        conn.execute(&statement, &[&ids]).await
    }

    async fn count_unsynchronized(&self) -> anyhow::Result<u64> {
        let conn = self.pool.get_connection().await?;
        let statement = conn.prepare_cached(sql::COUNT_UNSYNCHRONIZED).await?;
        let row = conn
            .query_opt(&statement, &[])
            .await?
            .context("COUNT(*) returned nothing?")?;
        let count: i64 = row.try_get(0)?;
        Ok(count as u64)
    }

    async fn recent_readings(&self, hours: u32, limit: usize) -> anyhow::Result<Vec<ReadingRow>> {
        let horizon = UnixMillis::now()
            .saturating_sub(std::time::Duration::from_secs(u64::from(hours) * 3600))
            .as_millis();
        let limit = i64::try_from(limit)?;
        let conn = self.pool.get_connection().await?;
        let statement = conn.prepare_cached(sql::RECENT_READINGS).await?;
        conn.query(&statement, &[&horizon, &limit])
            .await?
            .iter()
            .map(reading_from_row)
            .collect()
    }

    async fn append_sync_log(
        &self,
        batch_size: usize,
        success: bool,
        error_message: Option<&str>,
    ) -> anyhow::Result<()> {
        let conn = self.pool.get_connection().await?;
        let statement = conn.prepare_cached(sql::APPEND_SYNC_LOG).await?;
        let batch_size = i32::try_from(batch_size)?;
        let synced_at = UnixMillis::now().as_millis();
        conn.execute(&statement, &[&batch_size, &success, &error_message, &synced_at])
            .await?;
        Ok(())
    }

    async fn recent_sync_logs(&self, n: usize) -> anyhow::Result<Vec<SyncLogEntry>> {
        let conn = self.pool.get_connection().await?;
        let statement = conn.prepare_cached(sql::RECENT_SYNC_LOGS).await?;
        let n = i64::try_from(n)?;
        conn.query(&statement, &[&n])
            .await?
            .iter()
            .map(sync_log_from_row)
            .collect()
    }

    async fn prune_sync_logs(&self, older_than: UnixMillis) -> anyhow::Result<u64> {
        let conn = self.pool.get_connection().await?;
        let statement = conn.prepare_cached(sql::PRUNE_SYNC_LOGS).await?;
        let horizon = older_than.as_millis();
        conn.execute(&statement, &[&horizon]).await
    }

    async fn append_sync_operation(
        &self,
        component: &str,
        operation: &str,
        detail: Option<&str>,
    ) -> anyhow::Result<()> {
        let conn = self.pool.get_connection().await?;
        let statement = conn.prepare_cached(sql::APPEND_SYNC_OPERATION).await?;
        let created_at = UnixMillis::now().as_millis();
        conn.execute(&statement, &[&component, &operation, &detail, &created_at])
            .await?;
        Ok(())
    }
}

/// Read-only client of the Client System's configuration database. Owned by
/// the downstream sync agent; nothing else touches the remote pool.
pub struct RemoteConfigStore {
    pool: Arc<PgPool>,
}

impl RemoteConfigStore {
    pub fn connect(url: &str) -> anyhow::Result<Self> {
        let config: tokio_postgres::Config =
            url.parse().context("invalid remote database url")?;
        Ok(Self {
            pool: PgPool::new(config)?,
        })
    }

    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}

#[async_trait]
impl RemoteConfigSource for RemoteConfigStore {
    async fn fetch_tenant(&self, tenant_id: i64) -> anyhow::Result<Option<Tenant>> {
        let conn = self.pool.get_connection().await?;
        let statement = conn.prepare_cached(sql::REMOTE_GET_TENANT).await?;
        conn.query_opt(&statement, &[&tenant_id])
            .await?
            .map(|row| tenant_from_row(&row))
            .transpose()
    }

    async fn fetch_meters(&self, tenant_id: i64) -> anyhow::Result<Vec<Meter>> {
        let conn = self.pool.get_connection().await?;
        let statement = conn.prepare_cached(sql::REMOTE_LIST_METERS).await?;
        conn.query(&statement, &[&tenant_id])
            .await?
            .iter()
            .map(meter_from_row)
            .collect()
    }
}

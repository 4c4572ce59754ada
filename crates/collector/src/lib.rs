//! The collection engine: every interval (or on manual trigger), poll the
//! cached meter fleet over BACnet, validate and pivot the readings, and
//! persist them in bounded transactional sub-batches. Per-point failures
//! never fail the cycle; persist failures are retried with a short fixed
//! backoff and surrendered without aborting the rest of the batch.

pub mod pivot;

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};

use anyhow::Context as _;
use bacnet::{
    device_address,
    BacnetGateway,
    ObjectType,
    PropertyId,
    ReadRequest,
};
use cache::MeterCache;
use common::{
    errors::report_error,
    gate::CycleGate,
    runtime::{
        join_worker,
        tokio_spawn,
    },
    store::LocalStore,
    types::{
        Meter,
        PendingReading,
        UnixMillis,
        WideReadingBatch,
    },
};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The field name carried by a plain present-value read.
pub const PRESENT_VALUE_FIELD: &str = "presentValue";

/// Wide rows are persisted in transactional sub-batches of at most this many.
pub const MAX_PERSIST_BATCH: usize = 100;

// Fixed persist backoff; deliberately different from the upload manager's
// exponential policy.
const PERSIST_ATTEMPTS: usize = 3;
const PERSIST_BACKOFF: [Duration; 2] = [Duration::from_secs(1), Duration::from_secs(2)];

#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error("collection cycle already running")]
    AlreadyRunning,
}

#[derive(Clone, Debug, Serialize)]
pub struct CycleResult {
    pub cycle_id: u64,
    pub started_at: UnixMillis,
    pub finished_at: UnixMillis,
    /// False when the cycle aborted before polling (cache reload failure or
    /// missing tenant).
    pub success: bool,
    pub meters_processed: usize,
    pub readings_collected: usize,
    pub readings_dropped: usize,
    pub readings_persisted: usize,
    pub errors: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct CollectorStatus {
    pub is_running: bool,
    pub cycles_completed: u64,
    pub last_cycle: Option<CycleResult>,
    /// Data points that errored in the most recent cycle, keyed by
    /// `meter_id/meter_element_id`.
    pub active_errors: BTreeMap<String, String>,
}

#[derive(Default)]
struct StatusInner {
    cycles_completed: u64,
    last_cycle: Option<CycleResult>,
    active_errors: BTreeMap<String, String>,
}

struct Inner {
    store: Arc<dyn LocalStore>,
    cache: Arc<MeterCache>,
    gateway: BacnetGateway,
    interval: Duration,
    gate: CycleGate,
    cycle_counter: AtomicU64,
    status: Mutex<StatusInner>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct CollectionEngine {
    inner: Arc<Inner>,
}

impl CollectionEngine {
    pub fn new(
        store: Arc<dyn LocalStore>,
        cache: Arc<MeterCache>,
        gateway: BacnetGateway,
        interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                cache,
                gateway,
                interval,
                gate: CycleGate::new(),
                cycle_counter: AtomicU64::new(0),
                status: Mutex::new(StatusInner::default()),
                cancel: CancellationToken::new(),
                worker: Mutex::new(None),
            }),
        }
    }

    /// Starts the interval scheduler. Manual triggers work whether or not the
    /// scheduler is running.
    pub fn start(&self) {
        let this = self.clone();
        let handle = tokio_spawn("collection_engine", async move {
            tracing::info!("Starting collection engine (interval {:?})", this.inner.interval);
            loop {
                tokio::select! {
                    _ = this.inner.cancel.cancelled() => break,
                    _ = tokio::time::sleep(this.inner.interval) => {},
                }
                match this.run_cycle().await {
                    Ok(result) if result.success => {
                        tracing::info!(
                            "Collection cycle {} finished: {} readings from {} meters, {} errors",
                            result.cycle_id,
                            result.readings_persisted,
                            result.meters_processed,
                            result.errors.len()
                        );
                    },
                    Ok(result) => {
                        let mut e = anyhow::anyhow!(
                            "collection cycle {} aborted: {}",
                            result.cycle_id,
                            result.errors.join("; ")
                        );
                        report_error(&mut e);
                    },
                    // A manual trigger beat the tick; skip it.
                    Err(CollectError::AlreadyRunning) => {},
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

    pub fn status(&self) -> CollectorStatus {
        let status = self.inner.status.lock();
        CollectorStatus {
            is_running: self.inner.gate.is_running(),
            cycles_completed: status.cycles_completed,
            last_cycle: status.last_cycle.clone(),
            active_errors: status.active_errors.clone(),
        }
    }

    /// Runs one collection cycle. Rejected while another cycle is in flight.
    pub async fn run_cycle(&self) -> Result<CycleResult, CollectError> {
        let _guard = self
            .inner
            .gate
            .try_enter()
            .ok_or(CollectError::AlreadyRunning)?;
        let cycle_id = self.inner.cycle_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let started_at = UnixMillis::now();
        let mut errors = Vec::new();
        let mut per_meter_errors = BTreeMap::new();

        // Never poll off a stale view: reload if invalidated, abort if the
        // reload fails.
        if !self.inner.cache.is_valid() {
            if let Err(e) = self.inner.cache.reload(self.inner.store.as_ref()).await {
                errors.push(format!("cache reload failed: {e:#}"));
                return Ok(self.record_aborted(cycle_id, started_at, errors, false));
            }
        }
        let snapshot = match self.inner.cache.snapshot() {
            Some(snapshot) => snapshot,
            None => {
                errors.push("cache is empty after reload".to_owned());
                return Ok(self.record_aborted(cycle_id, started_at, errors, false));
            },
        };
        let tenant = match &snapshot.tenant {
            Some(tenant) => tenant.clone(),
            None => {
                errors.push("no tenant configured; cannot attribute readings".to_owned());
                return Ok(self.record_aborted(cycle_id, started_at, errors, true));
            },
        };

        let mut pending = Vec::new();
        let mut meters_processed = 0;
        for meter in &snapshot.meters {
            if self.inner.cancel.is_cancelled() {
                errors.push("shutdown requested; cycle truncated".to_owned());
                break;
            }
            match self.read_meter(meter).await {
                Ok((readings, point_errors)) => {
                    pending.extend(readings);
                    for (key, error) in point_errors {
                        errors.push(format!("meter {key}: {error}"));
                        per_meter_errors.insert(key, error);
                    }
                },
                Err(e) => {
                    let key = meter.key().to_string();
                    let error = format!("{e:#}");
                    errors.push(format!("meter {key}: {error}"));
                    per_meter_errors.insert(key, error);
                },
            }
            meters_processed += 1;
        }

        let readings_collected = pending.len();
        let (valid, dropped) = pivot::validate(pending, UnixMillis::now());
        let readings_dropped = dropped.len();
        errors.extend(dropped);

        let batch = pivot::pivot(tenant.tenant_id, &valid);
        let mut readings_persisted = 0usize;
        for rows in batch.rows.chunks(MAX_PERSIST_BATCH) {
            if self.inner.cancel.is_cancelled() {
                errors.push("shutdown requested before persist".to_owned());
                break;
            }
            let sub_batch = WideReadingBatch {
                field_columns: batch.field_columns.clone(),
                rows: rows.to_vec(),
            };
            match self.persist_with_retries(&sub_batch).await {
                Ok(inserted) => readings_persisted += inserted as usize,
                Err(e) => {
                    errors.push(format!(
                        "failed to persist sub-batch of {}: {e:#}",
                        sub_batch.len()
                    ));
                },
            }
        }

        let result = CycleResult {
            cycle_id,
            started_at,
            finished_at: UnixMillis::now(),
            success: true,
            meters_processed,
            readings_collected,
            readings_dropped,
            readings_persisted,
            errors,
        };
        // Config edits take effect next tick: the next cycle reloads.
        self.inner.cache.invalidate();
        let mut status = self.inner.status.lock();
        status.cycles_completed += 1;
        status.active_errors = per_meter_errors;
        status.last_cycle = Some(result.clone());
        Ok(result)
    }

    fn record_aborted(
        &self,
        cycle_id: u64,
        started_at: UnixMillis,
        errors: Vec<String>,
        invalidate: bool,
    ) -> CycleResult {
        let result = CycleResult {
            cycle_id,
            started_at,
            finished_at: UnixMillis::now(),
            success: false,
            meters_processed: 0,
            readings_collected: 0,
            readings_dropped: 0,
            readings_persisted: 0,
            errors,
        };
        if invalidate {
            self.inner.cache.invalidate();
        }
        let mut status = self.inner.status.lock();
        status.cycles_completed += 1;
        status.last_cycle = Some(result.clone());
        result
    }

    async fn read_meter(
        &self,
        meter: &Meter,
    ) -> anyhow::Result<(Vec<PendingReading>, Vec<(String, String)>)> {
        let addr = device_address(&meter.ip, meter.port)?;
        let plan = read_plan(meter)?;
        let requests: Vec<ReadRequest> = plan.iter().map(|(_, request)| *request).collect();
        let results = self.inner.gateway.read_properties(addr, &requests).await;
        let now = UnixMillis::now();

        let mut readings = Vec::new();
        let mut point_errors = Vec::new();
        for ((field_name, request), result) in plan.into_iter().zip(results) {
            match result {
                Ok(value) => match value.as_f64() {
                    Some(value) => readings.push(PendingReading {
                        meter_id: meter.meter_id,
                        meter_element_id: meter.meter_element_id,
                        field_name,
                        value,
                        created_at: now,
                    }),
                    None => point_errors.push((
                        meter.key().to_string(),
                        format!("{request} returned a non-numeric value"),
                    )),
                },
                Err(e) => {
                    point_errors.push((meter.key().to_string(), format!("{request}: {e}")));
                },
            }
        }
        Ok((readings, point_errors))
    }

    async fn persist_with_retries(&self, batch: &WideReadingBatch) -> anyhow::Result<u64> {
        let mut last_error = None;
        for attempt in 0..PERSIST_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(PERSIST_BACKOFF[attempt - 1]).await;
            }
            match self.inner.store.insert_readings_wide(batch).await {
                Ok(inserted) => return Ok(inserted),
                Err(e) => {
                    tracing::warn!(
                        "Persist attempt {}/{PERSIST_ATTEMPTS} failed: {e:#}",
                        attempt + 1
                    );
                    last_error = Some(e);
                },
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("no persist attempt ran")))
    }
}

/// The properties read for one meter. One present-value read per data point
/// today; the read-multiple path keeps the cost of widening this later at one
/// exchange per device.
fn read_plan(meter: &Meter) -> anyhow::Result<Vec<(String, ReadRequest)>> {
    let instance = u32::try_from(meter.meter_element_id)
        .with_context(|| format!("meter element id {} out of range", meter.meter_element_id))?;
    Ok(vec![(
        PRESENT_VALUE_FIELD.to_owned(),
        ReadRequest {
            object_type: ObjectType::AnalogInput,
            instance,
            property: PropertyId::PresentValue,
        },
    )])
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use bacnet::{
        testing::{
            FakeDriver,
            FakeOutcome,
        },
        BacnetValue,
    };
    use common::{
        testing::MemoryStore,
        types::Tenant,
    };
    use pretty_assertions::assert_eq;

    use super::*;

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

    fn meter(meter_id: i64, element: i64, active: bool) -> Meter {
        Meter {
            meter_id,
            meter_element_id: element,
            name: format!("meter-{meter_id}-{element}"),
            ip: "192.0.2.5".to_owned(),
            port: 47808,
            element: "kWh".to_owned(),
            active,
        }
    }

    fn addr() -> SocketAddr {
        "192.0.2.5:47808".parse().unwrap()
    }

    fn present_value(instance: u32) -> ReadRequest {
        ReadRequest {
            object_type: ObjectType::AnalogInput,
            instance,
            property: PropertyId::PresentValue,
        }
    }

    fn engine(
        store: Arc<MemoryStore>,
        driver: Arc<FakeDriver>,
        read_timeout: Duration,
    ) -> (CollectionEngine, Arc<MeterCache>) {
        let cache = Arc::new(MeterCache::new());
        let engine = CollectionEngine::new(
            store,
            cache.clone(),
            BacnetGateway::new(driver, read_timeout),
            Duration::from_secs(60),
        );
        (engine, cache)
    }

    #[tokio::test]
    async fn happy_path_persists_one_wide_row() {
        let store = Arc::new(MemoryStore::with_tenant(tenant()));
        store.put_meter(meter(10, 1, true));
        let driver = Arc::new(FakeDriver::new());
        driver.script(
            addr(),
            present_value(1),
            FakeOutcome::Value(BacnetValue::Real(12345.67)),
        );
        let (engine, cache) = engine(store.clone(), driver, Duration::from_secs(3));

        let result = engine.run_cycle().await.unwrap();
        assert!(result.success);
        assert_eq!(result.meters_processed, 1);
        assert_eq!(result.readings_collected, 1);
        assert_eq!(result.readings_persisted, 1);
        assert_eq!(result.errors, Vec::<String>::new());

        let readings = store.all_readings();
        assert_eq!(readings.len(), 1);
        let row = &readings[0];
        assert_eq!(row.tenant_id, 7);
        assert_eq!(row.meter_id, 10);
        assert_eq!(row.meter_element_id, 1);
        assert_eq!(row.retry_count, 0);
        let value = row.fields[PRESENT_VALUE_FIELD];
        assert!((value - 12345.67).abs() < 0.01, "got {value}");

        // The cycle clears the cache so config edits land next tick.
        assert!(!cache.is_valid());
    }

    #[tokio::test]
    async fn inactive_meters_are_never_polled() {
        let store = Arc::new(MemoryStore::with_tenant(tenant()));
        store.put_meter(meter(10, 1, true));
        store.put_meter(meter(10, 2, false));
        let driver = Arc::new(FakeDriver::new());
        driver.script(
            addr(),
            present_value(1),
            FakeOutcome::Value(BacnetValue::Real(1.0)),
        );
        let (engine, _cache) = engine(store.clone(), driver.clone(), Duration::from_secs(3));

        let result = engine.run_cycle().await.unwrap();
        assert_eq!(result.meters_processed, 1);
        let polled: Vec<u32> = driver.calls().iter().map(|(_, r)| r.instance).collect();
        assert_eq!(polled, vec![1]);
    }

    #[tokio::test]
    async fn per_point_errors_do_not_fail_the_cycle() {
        let store = Arc::new(MemoryStore::with_tenant(tenant()));
        store.put_meter(meter(10, 1, true));
        store.put_meter(meter(11, 2, true));
        let driver = Arc::new(FakeDriver::new());
        driver.script(
            addr(),
            present_value(1),
            FakeOutcome::Value(BacnetValue::Real(5.0)),
        );
        driver.script(
            addr(),
            present_value(2),
            FakeOutcome::Error("device offline".to_owned()),
        );
        let (engine, _cache) = engine(store.clone(), driver, Duration::from_secs(3));

        let result = engine.run_cycle().await.unwrap();
        assert!(result.success);
        assert_eq!(result.readings_persisted, 1);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(store.reading_count(), 1);

        let status = engine.status();
        assert_eq!(status.active_errors.len(), 1);
        assert!(status.active_errors.contains_key("11/2"));
    }

    #[tokio::test(start_paused = true)]
    async fn a_hung_read_times_out_as_a_per_point_error() {
        let store = Arc::new(MemoryStore::with_tenant(tenant()));
        store.put_meter(meter(10, 1, true));
        store.put_meter(meter(11, 2, true));
        let driver = Arc::new(FakeDriver::new());
        driver.script(addr(), present_value(1), FakeOutcome::Hang);
        driver.script(
            addr(),
            present_value(2),
            FakeOutcome::Value(BacnetValue::Real(3.0)),
        );
        let (engine, _cache) = engine(store.clone(), driver, Duration::from_secs(3));

        let result = engine.run_cycle().await.unwrap();
        assert!(result.success);
        assert_eq!(result.readings_persisted, 1);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("timed out"), "{:?}", result.errors);
    }

    #[tokio::test(start_paused = true)]
    async fn persist_retries_with_fixed_backoff() {
        let store = Arc::new(MemoryStore::with_tenant(tenant()));
        store.put_meter(meter(10, 1, true));
        store.fail_next_inserts(2);
        let driver = Arc::new(FakeDriver::new());
        driver.script(
            addr(),
            present_value(1),
            FakeOutcome::Value(BacnetValue::Real(9.0)),
        );
        let (engine, _cache) = engine(store.clone(), driver, Duration::from_secs(3));

        let result = engine.run_cycle().await.unwrap();
        assert_eq!(result.readings_persisted, 1);
        assert_eq!(result.errors, Vec::<String>::new());
        assert_eq!(store.reading_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn persist_gives_up_after_three_attempts() {
        let store = Arc::new(MemoryStore::with_tenant(tenant()));
        store.put_meter(meter(10, 1, true));
        store.fail_next_inserts(3);
        let driver = Arc::new(FakeDriver::new());
        driver.script(
            addr(),
            present_value(1),
            FakeOutcome::Value(BacnetValue::Real(9.0)),
        );
        let (engine, _cache) = engine(store.clone(), driver, Duration::from_secs(3));

        let result = engine.run_cycle().await.unwrap();
        assert!(result.success);
        assert_eq!(result.readings_persisted, 0);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("persist"), "{:?}", result.errors);
        assert_eq!(store.reading_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_trigger_is_rejected() {
        let store = Arc::new(MemoryStore::with_tenant(tenant()));
        store.put_meter(meter(10, 1, true));
        let driver = Arc::new(FakeDriver::new());
        driver.script(addr(), present_value(1), FakeOutcome::Hang);
        let (engine, _cache) = engine(store.clone(), driver, Duration::from_secs(3));

        let running = engine.clone();
        let first = tokio::spawn(async move { running.run_cycle().await });
        while !engine.status().is_running {
            tokio::task::yield_now().await;
        }
        assert!(matches!(
            engine.run_cycle().await,
            Err(CollectError::AlreadyRunning)
        ));
        let result = first.await.unwrap().unwrap();
        assert!(result.success);
        assert_eq!(result.readings_persisted, 0);
    }

    #[tokio::test]
    async fn empty_meter_list_is_a_successful_cycle() {
        let store = Arc::new(MemoryStore::with_tenant(tenant()));
        let driver = Arc::new(FakeDriver::new());
        let (engine, _cache) = engine(store.clone(), driver, Duration::from_secs(3));

        let result = engine.run_cycle().await.unwrap();
        assert!(result.success);
        assert_eq!(result.meters_processed, 0);
        assert_eq!(result.readings_collected, 0);
        assert_eq!(result.errors, Vec::<String>::new());
    }

    #[tokio::test]
    async fn missing_tenant_aborts_before_polling() {
        let store = Arc::new(MemoryStore::new());
        store.put_meter(meter(10, 1, true));
        let driver = Arc::new(FakeDriver::new());
        let (engine, _cache) = engine(store.clone(), driver.clone(), Duration::from_secs(3));

        let result = engine.run_cycle().await.unwrap();
        assert!(!result.success);
        assert!(result.errors[0].contains("tenant"), "{:?}", result.errors);
        assert_eq!(driver.calls().len(), 0);
        assert_eq!(store.reading_count(), 0);
    }
}

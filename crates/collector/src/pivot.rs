//! Validation and the narrow→wide pivot. Pending readings are grouped by
//! data-point identity; each group becomes one wide row, and the batch column
//! list is the union of field names observed across the batch, with NULL for
//! fields a row did not observe.

use std::collections::{
    BTreeMap,
    BTreeSet,
};

use common::types::{
    MeterKey,
    PendingReading,
    UnixMillis,
    WideReadingBatch,
    WideRow,
};

/// Splits a cycle's pending readings into valid rows and drop reasons.
/// Invalid readings never reach the store.
pub fn validate(
    readings: Vec<PendingReading>,
    now: UnixMillis,
) -> (Vec<PendingReading>, Vec<String>) {
    let mut valid = Vec::with_capacity(readings.len());
    let mut dropped = Vec::new();
    for reading in readings {
        if let Err(reason) = check_reading(&reading, now) {
            dropped.push(format!(
                "dropped reading for {}: {reason}",
                reading.key()
            ));
            continue;
        }
        valid.push(reading);
    }
    (valid, dropped)
}

fn check_reading(reading: &PendingReading, now: UnixMillis) -> Result<(), &'static str> {
    if reading.meter_id <= 0 {
        return Err("missing meter id");
    }
    if reading.meter_element_id < 0 {
        return Err("missing meter element id");
    }
    if reading.field_name.is_empty() {
        return Err("empty field name");
    }
    if !reading.value.is_finite() {
        return Err("non-finite value");
    }
    if reading.created_at.as_millis() <= 0 {
        return Err("missing timestamp");
    }
    if reading.created_at > now {
        return Err("future-dated timestamp");
    }
    Ok(())
}

/// Groups valid readings by `(meter_id, meter_element_id)` and emits one wide
/// row per group. A field observed twice for the same group keeps the later
/// value; the row timestamp is the group's latest.
pub fn pivot(tenant_id: i64, readings: &[PendingReading]) -> WideReadingBatch {
    let mut field_union = BTreeSet::new();
    let mut groups: BTreeMap<MeterKey, (UnixMillis, BTreeMap<&str, f64>)> = BTreeMap::new();
    for reading in readings {
        field_union.insert(reading.field_name.as_str());
        let entry = groups
            .entry(reading.key())
            .or_insert_with(|| (reading.created_at, BTreeMap::new()));
        entry.0 = entry.0.max(reading.created_at);
        entry.1.insert(&reading.field_name, reading.value);
    }

    let field_columns: Vec<String> = field_union.iter().map(|f| (*f).to_owned()).collect();
    let rows = groups
        .into_iter()
        .map(|(key, (created_at, fields))| WideRow {
            tenant_id,
            meter_id: key.meter_id,
            meter_element_id: key.meter_element_id,
            created_at,
            values: field_columns
                .iter()
                .map(|column| fields.get(column.as_str()).copied())
                .collect(),
        })
        .collect();
    WideReadingBatch {
        field_columns,
        rows,
    }
}

/// Projects wide rows back to narrow tuples, skipping NULLs. The inverse of
/// [`pivot`] for batches whose groups share a timestamp.
pub fn project(batch: &WideReadingBatch) -> Vec<PendingReading> {
    let mut narrow = Vec::new();
    for row in &batch.rows {
        for (column, value) in batch.field_columns.iter().zip(&row.values) {
            if let Some(value) = *value {
                narrow.push(PendingReading {
                    meter_id: row.meter_id,
                    meter_element_id: row.meter_element_id,
                    field_name: column.clone(),
                    value,
                    created_at: row.created_at,
                });
            }
        }
    }
    narrow
}

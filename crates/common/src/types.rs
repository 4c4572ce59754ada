use std::{
    collections::BTreeMap,
    fmt,
    time::Duration,
};

use chrono::{
    DateTime,
    TimeZone,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};

/// Milliseconds since the Unix epoch. All persisted timestamps use this
/// representation; the wire format (RFC 3339) is derived at the edges.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct UnixMillis(i64);

impl UnixMillis {
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    pub fn from_millis(ms: i64) -> Self {
        Self(ms)
    }

    pub fn as_millis(&self) -> i64 {
        self.0
    }

    pub fn saturating_sub(&self, d: Duration) -> Self {
        Self(self.0.saturating_sub(d.as_millis() as i64))
    }

    pub fn as_rfc3339(&self) -> String {
        match Utc.timestamp_millis_opt(self.0) {
            chrono::LocalResult::Single(dt) => dt.to_rfc3339(),
            _ => format!("invalid-timestamp({})", self.0),
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.0).single()
    }
}

impl fmt::Display for UnixMillis {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_rfc3339())
    }
}

/// The single organization this agent collects for. Exactly one row is
/// expected in a deployed agent; `api_key` authenticates every Client System
/// call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub tenant_id: i64,
    pub name: String,
    pub address: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub active: bool,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

impl Tenant {
    pub fn has_api_key(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }
}

/// Composite identity of a logical data point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MeterKey {
    pub meter_id: i64,
    pub meter_element_id: i64,
}

impl fmt::Display for MeterKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.meter_id, self.meter_element_id)
    }
}

/// One logical data point of a physical meter, as replicated down from the
/// Client System. Inactive meters are never polled and never cached.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meter {
    pub meter_id: i64,
    pub meter_element_id: i64,
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub element: String,
    pub active: bool,
}

impl Meter {
    pub fn key(&self) -> MeterKey {
        MeterKey {
            meter_id: self.meter_id,
            meter_element_id: self.meter_element_id,
        }
    }
}

/// A narrow pre-pivot reading accumulated during a collection cycle. Never
/// persisted in this shape.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingReading {
    pub meter_id: i64,
    pub meter_element_id: i64,
    pub field_name: String,
    pub value: f64,
    pub created_at: UnixMillis,
}

impl PendingReading {
    pub fn key(&self) -> MeterKey {
        MeterKey {
            meter_id: self.meter_id,
            meter_element_id: self.meter_element_id,
        }
    }
}

/// A persisted wide reading row, as handed to the upload path. `fields`
/// carries only the non-NULL columns.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ReadingRow {
    pub id: i64,
    pub tenant_id: i64,
    pub meter_id: i64,
    pub meter_element_id: i64,
    pub created_at: UnixMillis,
    pub retry_count: i32,
    pub fields: BTreeMap<String, f64>,
}

/// Per-batch schema descriptor for the wide insert: the column list is the
/// union of field names observed in the batch, and each row's `values` run
/// parallel to `field_columns` (NULL for fields the row did not observe).
#[derive(Clone, Debug, PartialEq)]
pub struct WideReadingBatch {
    pub field_columns: Vec<String>,
    pub rows: Vec<WideRow>,
}

impl WideReadingBatch {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct WideRow {
    pub tenant_id: i64,
    pub meter_id: i64,
    pub meter_element_id: i64,
    pub created_at: UnixMillis,
    pub values: Vec<Option<f64>>,
}

/// One upload attempt outcome, append-only.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SyncLogEntry {
    pub id: i64,
    pub batch_size: i32,
    pub success: bool,
    pub error_message: Option<String>,
    pub synced_at: UnixMillis,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_millis_rfc3339() {
        let ts = UnixMillis::from_millis(1_700_000_000_000);
        assert_eq!(ts.as_rfc3339(), "2023-11-14T22:13:20+00:00");
    }

    #[test]
    fn tenant_api_key_presence() {
        let mut tenant = Tenant {
            tenant_id: 7,
            name: "Site A".to_owned(),
            address: None,
            city: None,
            country: None,
            active: true,
            api_key: None,
        };
        assert!(!tenant.has_api_key());
        tenant.api_key = Some(String::new());
        assert!(!tenant.has_api_key());
        tenant.api_key = Some("k".to_owned());
        assert!(tenant.has_api_key());
    }
}

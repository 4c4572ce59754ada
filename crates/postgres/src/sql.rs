//! Schema DDL and the statements used by the local store. Everything here is
//! idempotent at init time (`IF NOT EXISTS`) so the agent can run it on every
//! startup without touching resident data.
//!
//! `meter_reading` is the wide, sparse table: one DOUBLE PRECISION column per
//! known field name. The insert path builds its column list per batch from
//! the union of observed field names; identifiers are escaped and every value
//! is a bound parameter.

use std::fmt::Write as _;

use postgres_protocol::escape::escape_identifier;

/// The known field-column superset of `meter_reading`. Observed field names
/// outside this list are dropped by validation before they reach the insert
/// path.
pub const READING_FIELD_COLUMNS: &[&str] = &[
    "presentValue",
    "kWh",
    "kW",
    "kVARh",
    "kVAh",
    "V",
    "A",
    "PF",
    "Hz",
];

pub fn is_known_field(name: &str) -> bool {
    READING_FIELD_COLUMNS.contains(&name)
}

/// The fixed (non-field) columns of every wide insert, in statement order.
pub const READING_BASE_COLUMNS: &[&str] =
    &["tenant_id", "meter_id", "meter_element_id", "created_at"];

pub fn init_statements() -> Vec<String> {
    let field_columns = READING_FIELD_COLUMNS
        .iter()
        .map(|f| format!("    {} DOUBLE PRECISION NULL", escape_identifier(f)))
        .collect::<Vec<_>>()
        .join(",\n");
    vec![
        r"
CREATE TABLE IF NOT EXISTS tenant (
    tenant_id BIGINT NOT NULL PRIMARY KEY,
    name TEXT NOT NULL,
    address TEXT NULL,
    city TEXT NULL,
    country TEXT NULL,
    active BOOLEAN NOT NULL DEFAULT true,
    api_key TEXT NULL
);
"
        .to_owned(),
        r"
CREATE TABLE IF NOT EXISTS meter (
    meter_id BIGINT NOT NULL,
    meter_element_id BIGINT NOT NULL,
    name TEXT NOT NULL,
    ip TEXT NOT NULL,
    port INTEGER NOT NULL,
    element TEXT NOT NULL,
    active BOOLEAN NOT NULL DEFAULT true,
    PRIMARY KEY (meter_id, meter_element_id)
);
"
        .to_owned(),
        format!(
            r"
CREATE TABLE IF NOT EXISTS meter_reading (
    id BIGSERIAL PRIMARY KEY,
    tenant_id BIGINT NOT NULL,
    meter_id BIGINT NOT NULL,
    meter_element_id BIGINT NOT NULL,
    created_at BIGINT NOT NULL,
    is_synchronized BOOLEAN NOT NULL DEFAULT false,
    retry_count INTEGER NOT NULL DEFAULT 0,
{field_columns}
);
"
        ),
        r"
CREATE INDEX IF NOT EXISTS meter_reading_by_sync_state
    ON meter_reading (is_synchronized, created_at);
"
        .to_owned(),
        r"
CREATE TABLE IF NOT EXISTS sync_log (
    id BIGSERIAL PRIMARY KEY,
    batch_size INTEGER NOT NULL,
    success BOOLEAN NOT NULL,
    error_message TEXT NULL,
    synced_at BIGINT NOT NULL
);
"
        .to_owned(),
        r"
CREATE TABLE IF NOT EXISTS sync_operation_log (
    id BIGSERIAL PRIMARY KEY,
    component TEXT NOT NULL,
    operation TEXT NOT NULL,
    detail TEXT NULL,
    created_at BIGINT NOT NULL
);
"
        .to_owned(),
    ]
}

pub const GET_TENANT: &str = r"
SELECT tenant_id, name, address, city, country, active, api_key FROM tenant LIMIT 1
";

pub const UPSERT_TENANT: &str = r"
INSERT INTO tenant (tenant_id, name, address, city, country, active, api_key)
VALUES ($1, $2, $3, $4, $5, $6, $7)
ON CONFLICT (tenant_id) DO UPDATE SET
    name = EXCLUDED.name,
    address = EXCLUDED.address,
    city = EXCLUDED.city,
    country = EXCLUDED.country,
    active = EXCLUDED.active,
    api_key = EXCLUDED.api_key
";

pub const LIST_METERS: &str = r"
SELECT meter_id, meter_element_id, name, ip, port, element, active
FROM meter ORDER BY meter_id, meter_element_id
";

pub const LIST_ACTIVE_METERS: &str = r"
SELECT meter_id, meter_element_id, name, ip, port, element, active
FROM meter WHERE active ORDER BY meter_id, meter_element_id
";

pub const UPSERT_METER: &str = r"
INSERT INTO meter (meter_id, meter_element_id, name, ip, port, element, active)
VALUES ($1, $2, $3, $4, $5, $6, $7)
ON CONFLICT (meter_id, meter_element_id) DO UPDATE SET
    name = EXCLUDED.name,
    ip = EXCLUDED.ip,
    port = EXCLUDED.port,
    element = EXCLUDED.element,
    active = EXCLUDED.active
";

pub const DEACTIVATE_METER: &str = r"
UPDATE meter SET active = false WHERE meter_id = $1
";

pub const DEACTIVATE_METER_ELEMENT: &str = r"
UPDATE meter SET active = false WHERE meter_id = $1 AND meter_element_id = $2
";

pub const LIST_UNSYNCHRONIZED_READINGS: &str = r"
SELECT * FROM meter_reading
WHERE NOT is_synchronized
ORDER BY created_at ASC, id ASC
LIMIT $1
";

pub const RECENT_READINGS: &str = r"
SELECT * FROM meter_reading
WHERE created_at >= $1
ORDER BY created_at DESC, id DESC
LIMIT $2
";

pub const DELETE_READINGS: &str = r"
DELETE FROM meter_reading WHERE id = ANY($1)
";

pub const INCREMENT_RETRY_COUNT: &str = r"
UPDATE meter_reading SET retry_count = retry_count + 1 WHERE id = ANY($1)
";

pub const COUNT_UNSYNCHRONIZED: &str = r"
SELECT COUNT(*) FROM meter_reading WHERE NOT is_synchronized
";

pub const APPEND_SYNC_LOG: &str = r"
INSERT INTO sync_log (batch_size, success, error_message, synced_at)
VALUES ($1, $2, $3, $4)
";

pub const RECENT_SYNC_LOGS: &str = r"
SELECT id, batch_size, success, error_message, synced_at
FROM sync_log ORDER BY id DESC LIMIT $1
";

pub const PRUNE_SYNC_LOGS: &str = r"
DELETE FROM sync_log WHERE synced_at < $1
";

pub const APPEND_SYNC_OPERATION: &str = r"
INSERT INTO sync_operation_log (component, operation, detail, created_at)
VALUES ($1, $2, $3, $4)
";

pub const REMOTE_GET_TENANT: &str = r"
SELECT tenant_id, name, address, city, country, active, api_key
FROM tenant WHERE tenant_id = $1
";

pub const REMOTE_LIST_METERS: &str = r"
SELECT meter_id, meter_element_id, name, ip, port, element, active
FROM meter WHERE tenant_id = $1
ORDER BY meter_id, meter_element_id
";

/// Builds the multi-row wide INSERT for one sub-batch. The column list is the
/// four base columns plus the batch's field union; `is_synchronized` and
/// `retry_count` are left to their column defaults (`false`, `0`).
pub fn insert_readings_statement(field_columns: &[String], row_count: usize) -> String {
    let width = READING_BASE_COLUMNS.len() + field_columns.len();
    let mut sql = String::from("INSERT INTO meter_reading (");
    for (i, col) in READING_BASE_COLUMNS
        .iter()
        .map(|c| (*c).to_owned())
        .chain(field_columns.iter().map(|c| escape_identifier(c)))
        .enumerate()
    {
        if i > 0 {
            sql.push_str(", ");
        }
        sql.push_str(&col);
    }
    sql.push_str(") VALUES ");
    for row in 0..row_count {
        if row > 0 {
            sql.push_str(", ");
        }
        sql.push('(');
        for slot in 0..width {
            if slot > 0 {
                sql.push_str(", ");
            }
            let _ = write!(sql, "${}", row * width + slot + 1);
        }
        sql.push(')');
    }
    sql
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn insert_statement_numbers_params_row_major() {
        let sql = insert_readings_statement(&["kWh".to_owned(), "kW".to_owned()], 2);
        assert_eq!(
            sql,
            "INSERT INTO meter_reading (tenant_id, meter_id, meter_element_id, created_at, \
             \"kWh\", \"kW\") VALUES ($1, $2, $3, $4, $5, $6), ($7, $8, $9, $10, $11, $12)"
        );
    }

    #[test]
    fn insert_statement_escapes_field_identifiers() {
        let sql = insert_readings_statement(&["presentValue".to_owned()], 1);
        assert!(sql.contains("\"presentValue\""));
    }

    #[test]
    fn known_fields_cover_the_ddl() {
        let ddl = init_statements().join("\n");
        for field in READING_FIELD_COLUMNS {
            assert!(ddl.contains(&escape_identifier(field)), "missing {field}");
        }
        assert!(is_known_field("kWh"));
        assert!(!is_known_field("bogus"));
    }
}

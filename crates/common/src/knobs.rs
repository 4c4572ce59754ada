//! Operational tunables, overridable from the environment. The configuration
//! surface proper (tenant id, intervals, endpoints) lives in the agent's clap
//! config; these are the dials nobody should need to touch.

use std::{
    sync::LazyLock,
    time::Duration,
};

use crate::env::env_config;

/// Maximum simultaneous connections handed out by each Postgres pool.
pub static PG_MAX_CONNECTIONS: LazyLock<usize> =
    LazyLock::new(|| env_config("AGENT_PG_MAX_CONNECTIONS", 8));

/// Watchdog timeout for any single Postgres operation. A statement that
/// exceeds it poisons its connection.
pub static PG_TIMEOUT: LazyLock<Duration> = LazyLock::new(|| {
    Duration::from_secs(env_config("AGENT_PG_TIMEOUT_SECONDS", 30))
});

/// Per-connection prepared statement cache size.
pub static PG_MAX_CACHED_STATEMENTS: LazyLock<usize> =
    LazyLock::new(|| env_config("AGENT_PG_MAX_CACHED_STATEMENTS", 32));

/// Idle pooled connections older than this are closed.
pub static PG_INACTIVE_CONNECTION_LIFETIME: LazyLock<Duration> = LazyLock::new(|| {
    Duration::from_secs(env_config("AGENT_PG_INACTIVE_LIFETIME_SECONDS", 300))
});

/// Upload log rows older than this horizon are pruned.
pub static SYNC_LOG_RETENTION: LazyLock<Duration> = LazyLock::new(|| {
    Duration::from_secs(env_config("AGENT_SYNC_LOG_RETENTION_DAYS", 30) * 24 * 60 * 60)
});

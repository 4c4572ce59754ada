use std::{
    fmt,
    net::IpAddr,
    time::Duration,
};

use clap::Parser;
use url::Url;

/// Agent configuration, from flags or the environment (a `.env` file is
/// loaded first). Every interval is validated to be non-zero at startup.
#[derive(Parser, Clone)]
#[clap(name = "metertrack-agent", author = "MeterTrack <eng@metertrack.io>", version)]
pub struct AgentConfig {
    /// Which tenant this agent represents.
    #[clap(long, env = "TENANT_ID")]
    pub tenant_id: i64,

    /// Connection url of the local durable store.
    #[clap(long, env = "LOCAL_DB_URL")]
    pub local_db_url: String,

    /// Connection url of the Client System's configuration database.
    #[clap(long, env = "REMOTE_DB_URL")]
    pub remote_db_url: String,

    /// Base url of the Client System REST API.
    #[clap(long, env = "CLIENT_API_URL")]
    pub client_api_url: Url,

    #[clap(long, env = "CLIENT_API_TIMEOUT_MS", default_value_t = 30_000)]
    pub client_api_timeout_ms: u64,

    /// Local interface BACnet sockets bind to; defaults to all interfaces.
    #[clap(long, env = "BACNET_INTERFACE")]
    pub bacnet_interface: Option<IpAddr>,

    #[clap(long, env = "BACNET_PORT", default_value_t = 47808)]
    pub bacnet_port: u16,

    /// Broadcast address for future device discovery; accepted but unused by
    /// the unicast read path.
    #[clap(long, env = "BACNET_BROADCAST")]
    pub bacnet_broadcast: Option<IpAddr>,

    /// Accepted for parity with connection-oriented BACnet stacks; the UDP
    /// transport has no connect phase.
    #[clap(long, env = "BACNET_CONNECT_TIMEOUT_MS", default_value_t = 5_000)]
    pub bacnet_connect_timeout_ms: u64,

    #[clap(long, env = "BACNET_READ_TIMEOUT_MS", default_value_t = 3_000)]
    pub bacnet_read_timeout_ms: u64,

    #[clap(long, env = "COLLECTION_INTERVAL_SECONDS", default_value_t = 60)]
    pub collection_interval_seconds: u64,

    #[clap(
        long,
        env = "COLLECTION_AUTO_START",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub collection_auto_start: bool,

    #[clap(long, env = "DOWNSTREAM_SYNC_INTERVAL_MINUTES", default_value_t = 60)]
    pub downstream_sync_interval_minutes: u64,

    #[clap(
        long,
        env = "DOWNSTREAM_SYNC_AUTO_START",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub downstream_sync_auto_start: bool,

    #[clap(long, env = "UPLOAD_INTERVAL_MINUTES", default_value_t = 5)]
    pub upload_interval_minutes: u64,

    #[clap(long, env = "UPLOAD_BATCH_SIZE", default_value_t = 1_000)]
    pub upload_batch_size: usize,

    #[clap(long, env = "UPLOAD_MAX_RETRIES", default_value_t = 5)]
    pub upload_max_retries: u32,

    #[clap(long, env = "CONNECTIVITY_CHECK_INTERVAL_MS", default_value_t = 60_000)]
    pub connectivity_check_interval_ms: u64,

    #[clap(long, env = "LOCAL_API_PORT", default_value_t = 3002)]
    pub local_api_port: u16,

    /// Overrides the default `info` filter; `RUST_LOG` wins if both are set.
    #[clap(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,
}

impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Connection urls can embed credentials; keep them out of the log.
        f.debug_struct("AgentConfig")
            .field("tenant_id", &self.tenant_id)
            .field("client_api_url", &self.client_api_url)
            .field("bacnet_port", &self.bacnet_port)
            .field("collection_interval_seconds", &self.collection_interval_seconds)
            .field("collection_auto_start", &self.collection_auto_start)
            .field(
                "downstream_sync_interval_minutes",
                &self.downstream_sync_interval_minutes,
            )
            .field("upload_interval_minutes", &self.upload_interval_minutes)
            .field("upload_batch_size", &self.upload_batch_size)
            .field("local_api_port", &self.local_api_port)
            .finish()
    }
}

impl AgentConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.tenant_id > 0, "tenant_id must be positive");
        anyhow::ensure!(
            self.collection_interval_seconds > 0,
            "collection_interval_seconds must be non-zero"
        );
        anyhow::ensure!(
            self.downstream_sync_interval_minutes > 0,
            "downstream_sync_interval_minutes must be non-zero"
        );
        anyhow::ensure!(
            self.upload_interval_minutes > 0,
            "upload_interval_minutes must be non-zero"
        );
        anyhow::ensure!(self.upload_batch_size > 0, "upload_batch_size must be non-zero");
        anyhow::ensure!(self.upload_max_retries > 0, "upload_max_retries must be non-zero");
        anyhow::ensure!(
            self.connectivity_check_interval_ms > 0,
            "connectivity_check_interval_ms must be non-zero"
        );
        anyhow::ensure!(
            self.client_api_timeout_ms > 0,
            "client_api_timeout_ms must be non-zero"
        );
        anyhow::ensure!(
            self.bacnet_read_timeout_ms > 0,
            "bacnet_read_timeout_ms must be non-zero"
        );
        Ok(())
    }

    pub fn client_api_timeout(&self) -> Duration {
        Duration::from_millis(self.client_api_timeout_ms)
    }

    pub fn bacnet_read_timeout(&self) -> Duration {
        Duration::from_millis(self.bacnet_read_timeout_ms)
    }

    pub fn collection_interval(&self) -> Duration {
        Duration::from_secs(self.collection_interval_seconds)
    }

    pub fn downstream_sync_interval(&self) -> Duration {
        Duration::from_secs(self.downstream_sync_interval_minutes * 60)
    }

    pub fn upload_interval(&self) -> Duration {
        Duration::from_secs(self.upload_interval_minutes * 60)
    }

    pub fn connectivity_check_interval(&self) -> Duration {
        Duration::from_millis(self.connectivity_check_interval_ms)
    }

    #[cfg(test)]
    pub fn new_for_test() -> Self {
        Self::try_parse_from([
            "metertrack-agent",
            "--tenant-id",
            "7",
            "--local-db-url",
            "postgres://agent@127.0.0.1/agent?sslmode=disable",
            "--remote-db-url",
            "postgres://agent@cloud.example.com/config",
            "--client-api-url",
            "http://cloud.example.com/api",
        ])
        .expect("test config must parse")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_and_validate() {
        let config = AgentConfig::new_for_test();
        config.validate().unwrap();
        assert_eq!(config.collection_interval_seconds, 60);
        assert_eq!(config.upload_batch_size, 1_000);
        assert_eq!(config.local_api_port, 3002);
        assert!(config.collection_auto_start);
    }

    #[test]
    fn zero_collection_interval_is_rejected() {
        let mut config = AgentConfig::new_for_test();
        config.collection_interval_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let mut config = AgentConfig::new_for_test();
        config.upload_batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn debug_output_omits_database_credentials() {
        let config = AgentConfig::new_for_test();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("127.0.0.1/agent"));
    }
}

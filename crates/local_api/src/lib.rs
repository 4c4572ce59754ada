//! The operator-facing HTTP surface and the agent assembly: one `Agent`
//! value built in `main` owns the shared store, remote gateway, BACnet
//! gateway and cache, and every component holds references to the same
//! instances. No process-wide mutable singletons apart from the log sink.

pub mod config;
pub mod handlers;
pub mod router;

use std::sync::Arc;

use anyhow::Context as _;
use bacnet::{
    ip::IpDriver,
    BacnetGateway,
};
use cache::MeterCache;
use cloud_client::{
    ClientSystemApi,
    HttpClientSystem,
};
use collector::CollectionEngine;
use common::{
    store::LocalStore,
    types::UnixMillis,
};
use connectivity::ConnectivityMonitor;
use downstream_sync::MeterSyncAgent;
use postgres::{
    PostgresStore,
    RemoteConfigStore,
};
use uploader::{
    UploadConfig,
    UploadManager,
};

use crate::config::AgentConfig;

/// Everything a route handler can reach. Cheap to clone; all fields are
/// shared handles.
#[derive(Clone)]
pub struct AgentState {
    pub tenant_id: i64,
    pub store: Arc<dyn LocalStore>,
    pub cache: Arc<MeterCache>,
    pub connectivity: Arc<ConnectivityMonitor>,
    pub collector: CollectionEngine,
    pub meter_sync: MeterSyncAgent,
    pub uploader: UploadManager,
    pub started_at: UnixMillis,
}

pub struct Agent {
    pub state: AgentState,
    pub config: AgentConfig,
    postgres_store: Arc<PostgresStore>,
    remote_store: Arc<RemoteConfigStore>,
}

impl Agent {
    pub fn close_pools(&self) {
        self.postgres_store.shutdown();
        self.remote_store.shutdown();
    }
}

/// Builds the agent in dependency order. Fails fast on an unreachable local
/// store; the remote side is allowed to be down at this point (the initial
/// downstream sync decides whether startup can proceed).
pub async fn make_agent(config: AgentConfig) -> anyhow::Result<Agent> {
    let postgres_store = Arc::new(
        PostgresStore::connect(&config.local_db_url)
            .await
            .context("local store is unreachable")?,
    );
    let store: Arc<dyn LocalStore> = postgres_store.clone();

    let remote_store = Arc::new(
        RemoteConfigStore::connect(&config.remote_db_url)
            .context("invalid remote database configuration")?,
    );

    let cloud: Arc<dyn ClientSystemApi> = Arc::new(HttpClientSystem::new(
        config.client_api_url.clone(),
        config.client_api_timeout(),
    )?);
    // Seed the api key from a previously synced tenant so an offline restart
    // can still authenticate once the link returns.
    if let Some(tenant) = store.get_tenant().await? {
        if tenant.has_api_key() {
            cloud.set_api_key(tenant.api_key.clone());
        }
    }

    let cache = Arc::new(MeterCache::new());
    let gateway = BacnetGateway::new(
        Arc::new(IpDriver::new(config.bacnet_interface)),
        config.bacnet_read_timeout(),
    );

    let connectivity =
        ConnectivityMonitor::new(cloud.clone(), config.connectivity_check_interval());
    let collector = CollectionEngine::new(
        store.clone(),
        cache.clone(),
        gateway,
        config.collection_interval(),
    );
    let meter_sync = MeterSyncAgent::new(
        store.clone(),
        remote_store.clone(),
        cache.clone(),
        cloud.clone(),
        config.tenant_id,
        config.downstream_sync_interval(),
    );
    let uploader = UploadManager::new(
        store.clone(),
        cloud.clone(),
        connectivity.clone(),
        config.tenant_id,
        UploadConfig {
            interval: config.upload_interval(),
            batch_size: config.upload_batch_size,
            max_retries: config.upload_max_retries,
        },
    );

    let state = AgentState {
        tenant_id: config.tenant_id,
        store,
        cache,
        connectivity,
        collector,
        meter_sync,
        uploader,
        started_at: UnixMillis::now(),
    };
    Ok(Agent {
        state,
        config,
        postgres_store,
        remote_store,
    })
}

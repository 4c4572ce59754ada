use std::{
    future::IntoFuture,
    time::Duration,
};

use clap::Parser;
use common::env::config_service;
use futures::FutureExt;
use local_api::{
    config::AgentConfig,
    make_agent,
    router::router,
};
use tokio::signal;

// After this, a shutdown that is still draining gets cut off.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = AgentConfig::parse();
    if let Some(level) = &config.log_level {
        if std::env::var("RUST_LOG").is_err() {
            std::env::set_var("RUST_LOG", level);
        }
    }
    let _guard = config_service();
    config.validate()?;
    tracing::info!("Starting metertrack-agent with {config:?}");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(config))
}

async fn run(config: AgentConfig) -> anyhow::Result<()> {
    let local_api_port = config.local_api_port;
    let collection_auto_start = config.collection_auto_start;
    let downstream_sync_auto_start = config.downstream_sync_auto_start;

    let agent = make_agent(config).await?;
    let state = agent.state.clone();

    // One synchronous downstream sync before anything else runs. A failure is
    // survivable as long as a previously synced tenant is on disk.
    match state.meter_sync.run_sync().await {
        Ok(result) if result.success => {
            tracing::info!(
                "Initial downstream sync: +{} ~{} -{}",
                result.inserted,
                result.updated,
                result.deleted
            );
        },
        Ok(result) => {
            tracing::warn!(
                "Initial downstream sync failed: {}",
                result.error.as_deref().unwrap_or("unknown error")
            );
        },
        Err(e) => tracing::warn!("Initial downstream sync rejected: {e}"),
    }
    let tenant = state
        .store
        .get_tenant()
        .await?
        .ok_or_else(|| {
            anyhow::anyhow!("no tenant available: initial sync failed and the local store is empty")
        })?;
    tracing::info!("Agent serves tenant {} ({})", tenant.tenant_id, tenant.name);

    state.cache.reload(state.store.as_ref()).await?;

    state.connectivity.start();
    if collection_auto_start {
        state.collector.start();
    } else {
        tracing::info!("Collection scheduler disabled; cycles run on manual trigger only");
    }
    state.uploader.start();
    if downstream_sync_auto_start {
        state.meter_sync.start();
    }

    let app = router(state.clone());
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", local_api_port)).await?;
    tracing::info!("Local API listening on {}", listener.local_addr()?);

    let (shutdown_tx, shutdown_rx) = async_broadcast::broadcast::<()>(1);
    let mut http_shutdown_rx = shutdown_rx.clone();
    let serve_future = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = http_shutdown_rx.recv().await;
    })
    .into_future()
    .fuse();
    futures::pin_mut!(serve_future);

    futures::select! {
        r = serve_future => {
            r?;
            anyhow::bail!("local API server stopped unexpectedly");
        },
        r = signal::ctrl_c().fuse() => {
            r?;
            tracing::info!("Received shutdown signal");
            let _ = shutdown_tx.broadcast(()).await;
        },
    }

    let shutdown = async move {
        // Drain in-flight requests, then stop the schedulers, waiting out any
        // in-flight cycle, then close the pools.
        serve_future.await?;
        state.meter_sync.shutdown().await?;
        state.uploader.shutdown().await?;
        state.collector.shutdown().await?;
        state.connectivity.shutdown().await?;
        agent.close_pools();
        Ok::<_, anyhow::Error>(())
    }
    .fuse();
    futures::pin_mut!(shutdown);
    let grace = tokio::time::sleep(SHUTDOWN_GRACE).fuse();
    futures::pin_mut!(grace);

    futures::select! {
        r = shutdown => {
            r?;
            tracing::info!("Agent shut down cleanly");
        },
        _ = grace => {
            tracing::warn!("Shutdown grace period expired; exiting with work in flight");
        },
        r = signal::ctrl_c().fuse() => {
            r?;
            tracing::warn!("Second shutdown signal; forcing exit");
        },
    }
    Ok(())
}

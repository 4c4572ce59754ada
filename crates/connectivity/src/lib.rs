//! Single source of truth for "is the cloud reachable". A periodic
//! authenticated probe drives a two-state machine (initially Offline);
//! transitions are serialized and fanned out on a broadcast channel so the
//! upload manager can resume the moment the link comes back.

use std::{
    sync::Arc,
    time::Duration,
};

use cloud_client::ClientSystemApi;
use common::{
    runtime::{
        join_worker,
        tokio_spawn,
    },
    types::UnixMillis,
};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const EVENT_CHANNEL_CAPACITY: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Connected,
    Disconnected,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct ConnectivityStatus {
    pub is_connected: bool,
    pub last_successful: Option<UnixMillis>,
    pub last_checked: Option<UnixMillis>,
    pub consecutive_failures: u32,
}

#[derive(Debug)]
struct MonitorState {
    is_connected: bool,
    last_successful: Option<UnixMillis>,
    last_checked: Option<UnixMillis>,
    consecutive_failures: u32,
}

pub struct ConnectivityMonitor {
    client: Arc<dyn ClientSystemApi>,
    check_interval: Duration,
    state: Mutex<MonitorState>,
    // Serializes probes so transitions can never interleave.
    probe_lock: tokio::sync::Mutex<()>,
    event_tx: async_broadcast::Sender<ConnectivityEvent>,
    _event_rx: async_broadcast::InactiveReceiver<ConnectivityEvent>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectivityMonitor {
    pub fn new(client: Arc<dyn ClientSystemApi>, check_interval: Duration) -> Arc<Self> {
        let (mut event_tx, event_rx) = async_broadcast::broadcast(EVENT_CHANNEL_CAPACITY);
        // A slow subscriber should see the latest transition, not block the
        // monitor.
        event_tx.set_overflow(true);
        Arc::new(Self {
            client,
            check_interval,
            state: Mutex::new(MonitorState {
                is_connected: false,
                last_successful: None,
                last_checked: None,
                consecutive_failures: 0,
            }),
            probe_lock: tokio::sync::Mutex::new(()),
            event_tx,
            _event_rx: event_rx.deactivate(),
            cancel: CancellationToken::new(),
            worker: Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        let handle = tokio_spawn("connectivity_monitor", async move {
            tracing::info!(
                "Starting connectivity monitor (interval {:?})",
                this.check_interval
            );
            loop {
                this.force_check().await;
                tokio::select! {
                    _ = this.cancel.cancelled() => break,
                    _ = tokio::time::sleep(this.check_interval) => {},
                }
            }
        });
        *self.worker.lock() = Some(handle);
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.cancel.cancel();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            join_worker(handle).await?;
        }
        Ok(())
    }

    /// Probes immediately and returns the resulting connectivity.
    pub async fn force_check(&self) -> bool {
        let _guard = self.probe_lock.lock().await;
        let probe = self.client.ping().await;
        let now = UnixMillis::now();
        let mut state = self.state.lock();
        state.last_checked = Some(now);
        match probe {
            Ok(()) => {
                state.last_successful = Some(now);
                state.consecutive_failures = 0;
                if !state.is_connected {
                    state.is_connected = true;
                    tracing::info!("Client System is reachable again");
                    _ = self.event_tx.try_broadcast(ConnectivityEvent::Connected);
                }
                true
            },
            Err(e) => {
                state.consecutive_failures += 1;
                if state.is_connected {
                    state.is_connected = false;
                    tracing::warn!("Client System became unreachable: {e:#}");
                    _ = self.event_tx.try_broadcast(ConnectivityEvent::Disconnected);
                } else {
                    tracing::debug!(
                        "Client System still unreachable ({} failures): {e:#}",
                        state.consecutive_failures
                    );
                }
                false
            },
        }
    }

    /// Synchronous gate for the upload path.
    pub fn is_connected(&self) -> bool {
        self.state.lock().is_connected
    }

    pub fn status(&self) -> ConnectivityStatus {
        let state = self.state.lock();
        ConnectivityStatus {
            is_connected: state.is_connected,
            last_successful: state.last_successful,
            last_checked: state.last_checked,
            consecutive_failures: state.consecutive_failures,
        }
    }

    pub fn subscribe(&self) -> async_broadcast::Receiver<ConnectivityEvent> {
        self.event_tx.new_receiver()
    }
}

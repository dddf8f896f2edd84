//! Long-running surfaces of the relay
//!
//! Each adapter owns one task: the DIMSE listener, the folder watcher, or
//! the destination heartbeat. They share the snapshot handle, the event bus
//! and the orchestrator, and all stop on the same cancellation token.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dimse::DimseScp;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SnapshotHandle;
use crate::events::EventBus;
use crate::receiver::{PlanReceiver, TrustGate};
use crate::sender::HeartbeatMonitor;
use crate::watcher::FolderWatcher;

#[async_trait]
pub trait Adapter: Send + Sync {
    /// Start the adapter task
    async fn start(&self, shutdown: CancellationToken) -> anyhow::Result<JoinHandle<()>>;

    /// Human-readable summary used in startup logs
    fn summary(&self) -> String;
}

/// Inbound DICOM listener
pub struct DimseAdapter {
    snapshots: SnapshotHandle,
    receiver: Arc<PlanReceiver>,
    events: EventBus,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl DimseAdapter {
    pub fn new(snapshots: SnapshotHandle, receiver: Arc<PlanReceiver>, events: EventBus) -> Self {
        Self {
            snapshots,
            receiver,
            events,
            local_addr: Mutex::new(None),
        }
    }

    /// Address the listener is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn scp(&self) -> DimseScp {
        let config = self.snapshots.current().config.dimse_config();
        DimseScp::new(
            config,
            Arc::new(TrustGate::new(self.snapshots.clone(), self.events.clone())),
            self.receiver.clone(),
        )
    }

    /// Bind the listener without serving
    pub async fn bind(&self) -> anyhow::Result<(DimseScp, TcpListener)> {
        let scp = self.scp();
        let listener = scp.bind().await?;
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = Some(listener.local_addr()?);
        Ok((scp, listener))
    }
}

#[async_trait]
impl Adapter for DimseAdapter {
    async fn start(&self, shutdown: CancellationToken) -> anyhow::Result<JoinHandle<()>> {
        let (scp, listener) = self.bind().await?;
        let receiver = self.receiver.clone();

        Ok(tokio::spawn(async move {
            if let Err(e) = Arc::new(scp).serve(listener, shutdown).await {
                tracing::error!("DIMSE listener failed: {}", e);
            }
            let pending = receiver.drain_dispatches().await;
            if !pending.is_empty() {
                tracing::info!("{} in-flight dispatch(es) finished during shutdown", pending.len());
            }
        }))
    }

    fn summary(&self) -> String {
        let snapshot = self.snapshots.current();
        let relay = &snapshot.config.relay;
        format!(
            "DimseAdapter '{}' on {}:{}",
            relay.ae_title, relay.bind_addr, relay.port
        )
    }
}

/// Watch-folder import
pub struct WatchAdapter {
    summary: String,
    watcher: Mutex<Option<FolderWatcher>>,
}

impl WatchAdapter {
    pub fn new(watcher: FolderWatcher) -> Self {
        let summary = format!(
            "WatchAdapter on {} (failed: {})",
            watcher.watch_dir().display(),
            watcher.failed_dir().display()
        );
        Self {
            summary,
            watcher: Mutex::new(Some(watcher)),
        }
    }
}

#[async_trait]
impl Adapter for WatchAdapter {
    async fn start(&self, shutdown: CancellationToken) -> anyhow::Result<JoinHandle<()>> {
        let watcher = self
            .watcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| anyhow::anyhow!("watch adapter already started"))?;

        Ok(tokio::spawn(async move {
            // A watcher failure stops imports only; network reception carries on.
            if let Err(e) = watcher.run(shutdown).await {
                tracing::error!("Folder watcher stopped: {}", e);
            }
        }))
    }

    fn summary(&self) -> String {
        self.summary.clone()
    }
}

/// Periodic destination reachability probe
pub struct HeartbeatAdapter {
    monitor: Arc<HeartbeatMonitor>,
    interval: Duration,
}

impl HeartbeatAdapter {
    pub fn new(monitor: Arc<HeartbeatMonitor>, interval: Duration) -> Self {
        Self { monitor, interval }
    }
}

#[async_trait]
impl Adapter for HeartbeatAdapter {
    async fn start(&self, shutdown: CancellationToken) -> anyhow::Result<JoinHandle<()>> {
        let monitor = self.monitor.clone();
        let interval = self.interval;
        Ok(tokio::spawn(async move { monitor.run(interval, shutdown).await }))
    }

    fn summary(&self) -> String {
        format!("HeartbeatAdapter every {:?}", self.interval)
    }
}

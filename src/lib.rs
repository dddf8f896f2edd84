pub mod adapters;
pub mod assembler;
pub mod config;
pub mod conversion;
pub mod events;
pub mod models;
pub mod receiver;
pub mod rules;
pub mod sender;
pub mod storage;
pub mod trust;
pub mod watcher;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{prelude::*, EnvFilter};

use crate::adapters::{Adapter, DimseAdapter, HeartbeatAdapter, WatchAdapter};
use crate::config::{Config, LoggingConfig, SnapshotHandle};
use crate::events::EventBus;
use crate::receiver::PlanReceiver;
use crate::sender::{DimseTransport, HeartbeatMonitor, Orchestrator, StoreTransport};
use crate::watcher::FolderWatcher;

/// Install the global subscriber. `RUST_LOG` wins over `[logging] level`.
pub fn init_logging(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&logging.level))?;

    if logging.log_to_file && !logging.log_file_path.is_empty() {
        let path = Path::new(&logging.log_file_path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_file(true)
            .with_line_number(true)
            .with_writer(Arc::new(file));
        let stdout_layer = tracing_subscriber::fmt::layer()
            .with_file(true)
            .with_line_number(true);

        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(stdout_layer)
            .try_init()?;
    } else {
        let stdout_layer = tracing_subscriber::fmt::layer()
            .with_file(true)
            .with_line_number(true);

        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .try_init()?;
    }
    Ok(())
}

/// The wired relay: shared state plus the adapters that drive it
pub struct Relay {
    pub snapshots: SnapshotHandle,
    pub events: EventBus,
    pub orchestrator: Orchestrator,
    pub receiver: Arc<PlanReceiver>,
    listener: Arc<DimseAdapter>,
    adapters: Vec<Arc<dyn Adapter>>,
}

impl Relay {
    pub fn new(config: Config, shutdown: CancellationToken) -> Self {
        let transport = Arc::new(DimseTransport::new(config.dimse_config()));
        Self::with_transport(config, transport, shutdown)
    }

    /// Wire the relay over a given outbound transport
    pub fn with_transport(
        config: Config,
        transport: Arc<dyn StoreTransport>,
        shutdown: CancellationToken,
    ) -> Self {
        let events = EventBus::default();
        let converter = conversion::from_config(&config.conversion);
        let orchestrator = Orchestrator::new(
            transport.clone(),
            config.sender.workers,
            events.clone(),
            shutdown,
        );
        let watcher_config = config.watcher.clone();
        let heartbeat = config.sender.heartbeat_interval();
        let snapshots = SnapshotHandle::new(config);

        let receiver = Arc::new(PlanReceiver::new(
            snapshots.clone(),
            orchestrator.clone(),
            Arc::from(converter),
            events.clone(),
        ));

        let listener = Arc::new(DimseAdapter::new(
            snapshots.clone(),
            receiver.clone(),
            events.clone(),
        ));
        let mut adapters: Vec<Arc<dyn Adapter>> = vec![listener.clone()];
        if watcher_config.enabled {
            adapters.push(Arc::new(WatchAdapter::new(FolderWatcher::new(
                watcher_config,
                snapshots.clone(),
                orchestrator.clone(),
                events.clone(),
            ))));
        }
        if let Some(interval) = heartbeat {
            let monitor = HeartbeatMonitor::new(transport, snapshots.clone(), events.clone());
            adapters.push(Arc::new(HeartbeatAdapter::new(Arc::new(monitor), interval)));
        }

        Self {
            snapshots,
            events,
            orchestrator,
            receiver,
            listener,
            adapters,
        }
    }

    /// Address of the DICOM listener once started
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Start every adapter. One that fails to start is logged and skipped;
    /// this only fails when none started.
    pub async fn start(&self, shutdown: CancellationToken) -> anyhow::Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::with_capacity(self.adapters.len());
        let mut failures = Vec::new();
        for adapter in &self.adapters {
            tracing::info!("Starting {}", adapter.summary());
            match adapter.start(shutdown.clone()).await {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    tracing::error!("Failed to start {}: {:#}", adapter.summary(), e);
                    failures.push(format!("{}: {:#}", adapter.summary(), e));
                }
            }
        }
        if handles.is_empty() && !failures.is_empty() {
            anyhow::bail!("no adapter started ({})", failures.join("; "));
        }
        Ok(handles)
    }
}

/// Load a new configuration and publish it; the old one stays on error.
/// Returns the sections whose changes wait for a restart.
pub fn reload(snapshots: &SnapshotHandle, path: &Path) -> anyhow::Result<Vec<&'static str>> {
    let config = Config::from_file(path)?;
    let pending = snapshots.current().config.restart_required(&config);
    let snapshot = snapshots.replace(config)?;
    tracing::info!(
        "Configuration reloaded from {} (version {})",
        path.display(),
        snapshot.version
    );
    if !pending.is_empty() {
        tracing::warn!(
            "Changes to [{}] take effect after a restart",
            pending.join("], [")
        );
    }
    Ok(pending)
}

#[cfg(unix)]
async fn hangup(snapshots: SnapshotHandle, path: PathBuf, shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hup = match signal(SignalKind::hangup()) {
        Ok(hup) => hup,
        Err(e) => {
            tracing::warn!("SIGHUP reload unavailable: {}", e);
            return;
        }
    };
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            received = hup.recv() => {
                if received.is_none() {
                    break;
                }
                if let Err(e) = reload(&snapshots, &path) {
                    tracing::error!("Configuration reload rejected, keeping current: {:#}", e);
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn hangup(_snapshots: SnapshotHandle, _path: PathBuf, shutdown: CancellationToken) {
    shutdown.cancelled().await;
}

pub async fn run(config_path: PathBuf) -> anyhow::Result<()> {
    let config = Config::from_file(&config_path)?;
    init_logging(&config.logging)?;

    tracing::info!("Starting rtrelay '{}'", config.relay.id);

    let shutdown = CancellationToken::new();
    let relay = Relay::new(config, shutdown.clone());
    let handles = relay.start(shutdown.clone()).await?;

    let reloader = tokio::spawn(hangup(
        relay.snapshots.clone(),
        config_path,
        shutdown.clone(),
    ));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    shutdown.cancel();

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!("Adapter task failed: {}", e);
        }
    }
    let _ = reloader.await;
    tracing::info!("rtrelay stopped");
    Ok(())
}

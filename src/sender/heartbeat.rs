//! Periodic C-ECHO against enabled destinations

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::SnapshotHandle;
use crate::events::{EventBus, RelayEvent};
use crate::sender::transport::StoreTransport;

/// Tracks the last known reachability of each node
#[derive(Debug)]
pub struct HeartbeatMonitor {
    transport: Arc<dyn StoreTransport>,
    snapshots: SnapshotHandle,
    events: EventBus,
    status: Mutex<HashMap<String, bool>>,
}

impl HeartbeatMonitor {
    pub fn new(transport: Arc<dyn StoreTransport>, snapshots: SnapshotHandle, events: EventBus) -> Self {
        Self {
            transport,
            snapshots,
            events,
            status: Mutex::new(HashMap::new()),
        }
    }

    /// Last probe result for `node`, if it has been probed
    pub fn status(&self, node: &str) -> Option<bool> {
        self.status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(node)
            .copied()
    }

    /// Probe every enabled node once. Returns the nodes whose state changed
    /// (or were probed for the first time) with their new reachability.
    pub async fn probe_once(&self) -> Vec<(String, bool)> {
        let snapshot = self.snapshots.current();
        let nodes: Vec<_> = snapshot.config.nodes.iter().filter(|n| n.enabled).collect();

        let results = join_all(nodes.iter().map(|node| async move {
            (node.name.clone(), self.transport.echo(node).await)
        }))
        .await;

        let mut changes = Vec::new();
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        status.retain(|name, _| nodes.iter().any(|n| &n.name == name));

        for (name, result) in results {
            let reachable = result.is_ok();
            let previous = status.insert(name.clone(), reachable);
            if previous == Some(reachable) {
                debug!(node = %name, reachable, "Heartbeat unchanged");
                continue;
            }
            match result {
                Ok(()) => self.events.emit(RelayEvent::DestinationReachable { node: name.clone() }),
                Err(failure) => self.events.emit(RelayEvent::DestinationUnreachable {
                    node: name.clone(),
                    reason: failure.to_string(),
                }),
            }
            changes.push((name, reachable));
        }
        changes
    }

    /// Probe on `interval` until shutdown
    pub async fn run(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.probe_once().await;
                }
            }
        }
        debug!("Heartbeat stopped");
    }
}

//! Structured relay events
//!
//! Every event is logged through `tracing` and broadcast to subscribers
//! (audit sinks, a UI, tests). Emitting never blocks and never fails.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::{Modality, PlanKey, PlanOutcome};

#[derive(Debug, Clone, Serialize)]
pub enum RelayEvent {
    SessionAccepted {
        calling_ae: String,
        peer: SocketAddr,
    },
    SessionRejected {
        calling_ae: String,
        peer: SocketAddr,
        reason: String,
    },
    ObjectReceived {
        calling_ae: String,
        plan: PlanKey,
        instance_uid: String,
        modality: Modality,
        path: PathBuf,
    },
    ObjectRejected {
        calling_ae: String,
        reason: String,
    },
    IncompleteTransfer {
        calling_ae: String,
        discarded_bytes: usize,
    },
    ConversionFailed {
        path: PathBuf,
        reason: String,
    },
    PlanCompleted {
        plan: PlanKey,
        origin: String,
        label: String,
        objects: usize,
    },
    PlanEvicted {
        plan: PlanKey,
        objects: usize,
    },
    RulesEvaluated {
        plan: PlanKey,
        matched_rules: Vec<String>,
        destinations: Vec<String>,
    },
    SendStarted {
        plan: PlanKey,
        node: String,
        objects: usize,
    },
    SendSucceeded {
        plan: PlanKey,
        node: String,
        objects: usize,
    },
    SendFailed {
        plan: PlanKey,
        node: String,
        sent: usize,
        reason: String,
    },
    PlanDispatched {
        plan: PlanKey,
        outcome: PlanOutcome,
    },
    BucketDispatched {
        plan: PlanKey,
        files: usize,
        outcome: PlanOutcome,
    },
    BucketParked {
        plan: PlanKey,
        files: usize,
    },
    FileQuarantined {
        path: PathBuf,
        reason: String,
    },
    DestinationReachable {
        node: String,
    },
    DestinationUnreachable {
        node: String,
        reason: String,
    },
}

/// Fan-out point for relay events
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RelayEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: RelayEvent) {
        log_event(&event);
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

fn log_event(event: &RelayEvent) {
    use RelayEvent::*;
    match event {
        SessionAccepted { calling_ae, peer } => {
            tracing::info!(calling_ae = %calling_ae, peer = %peer, "Session accepted")
        }
        SessionRejected {
            calling_ae,
            peer,
            reason,
        } => tracing::warn!(calling_ae = %calling_ae, peer = %peer, "Session rejected: {}", reason),
        ObjectReceived {
            calling_ae,
            plan,
            instance_uid,
            modality,
            path,
        } => tracing::info!(
            calling_ae = %calling_ae,
            plan = %plan,
            modality = %modality,
            "Received {} -> {}",
            instance_uid,
            path.display()
        ),
        ObjectRejected { calling_ae, reason } => {
            tracing::warn!(calling_ae = %calling_ae, "Object rejected: {}", reason)
        }
        IncompleteTransfer {
            calling_ae,
            discarded_bytes,
        } => tracing::warn!(
            calling_ae = %calling_ae,
            "Incomplete transfer, discarded {} bytes",
            discarded_bytes
        ),
        ConversionFailed { path, reason } => {
            tracing::warn!("Conversion of {} failed, keeping original: {}", path.display(), reason)
        }
        PlanCompleted {
            plan,
            origin,
            label,
            objects,
        } => tracing::info!(
            plan = %plan,
            origin = %origin,
            "Plan '{}' complete with {} objects",
            label,
            objects
        ),
        PlanEvicted { plan, objects } => tracing::warn!(
            plan = %plan,
            "Incomplete plan evicted after idling ({} objects left on disk)",
            objects
        ),
        RulesEvaluated {
            plan,
            matched_rules,
            destinations,
        } => tracing::info!(
            plan = %plan,
            "Rules matched: {:?}; destinations: {:?}",
            matched_rules,
            destinations
        ),
        SendStarted {
            plan,
            node,
            objects,
        } => tracing::info!(plan = %plan, node = %node, "Sending {} objects", objects),
        SendSucceeded {
            plan,
            node,
            objects,
        } => tracing::info!(plan = %plan, node = %node, "Sent {} objects", objects),
        SendFailed {
            plan,
            node,
            sent,
            reason,
        } => tracing::error!(
            plan = %plan,
            node = %node,
            "Send failed after {} objects: {}",
            sent,
            reason
        ),
        PlanDispatched { plan, outcome } => {
            tracing::info!(plan = %plan, "Plan dispatch finished: {}", outcome)
        }
        BucketDispatched {
            plan,
            files,
            outcome,
        } => match outcome {
            PlanOutcome::Forwarded => {
                tracing::info!(plan = %plan, "Import bucket of {} files forwarded", files)
            }
            _ => tracing::error!(plan = %plan, "Import bucket of {} files {}", files, outcome),
        },
        BucketParked { plan, files } => tracing::info!(
            plan = %plan,
            "No rule matched import bucket of {} files; leaving it in place",
            files
        ),
        FileQuarantined { path, reason } => {
            tracing::warn!("Moved {} to the failed folder: {}", path.display(), reason)
        }
        DestinationReachable { node } => tracing::info!(node = %node, "Destination reachable"),
        DestinationUnreachable { node, reason } => {
            tracing::warn!(node = %node, "Destination unreachable: {}", reason)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_subscribers() {
        let bus = EventBus::new(4);
        bus.emit(RelayEvent::DestinationReachable { node: "a".into() });
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(RelayEvent::BucketParked {
            plan: PlanKey::new("P", "1"),
            files: 2,
        });
        match rx.recv().await.unwrap() {
            RelayEvent::BucketParked { files, .. } => assert_eq!(files, 2),
            other => panic!("unexpected event {:?}", other),
        }
    }
}

//! Inbound DIMSE handling
//!
//! [`TrustGate`] authenticates associations against the trust list of the
//! current snapshot. [`PlanReceiver`] writes every accepted object as a
//! Part 10 file, feeds it to the content-driven assembler and, once the
//! association that completed a plan ends, hands the plan to the orchestrator.
//! Objects for a dispatched plan that arrive later, within
//! `relay.late_object_window_secs`, complete a follow-up plan carrying the
//! same label, so the same rules route it.

pub mod status_mapper;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use dimse::scp::AssociationEnd;
use dimse::{AccessControl, AssociationContext, DatasetStream, DimseStatus, StoreHandler};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::assembler::{CompletionPolicy, PlanAssembler};
use crate::config::SnapshotHandle;
use crate::conversion::{Conversion, Converter};
use crate::events::{EventBus, RelayEvent};
use crate::models::{DicomObject, DispatchReport, Origin, PlanKey};
use crate::sender::Orchestrator;
use crate::storage::{layout, FilesystemStorage, StorageBackend, StorageError};

/// Deny-by-default association filter
#[derive(Debug, Clone)]
pub struct TrustGate {
    snapshots: SnapshotHandle,
    events: EventBus,
}

impl TrustGate {
    pub fn new(snapshots: SnapshotHandle, events: EventBus) -> Self {
        Self { snapshots, events }
    }
}

impl AccessControl for TrustGate {
    fn check_access(
        &self,
        calling_ae: &str,
        called_ae: &str,
        peer_addr: SocketAddr,
    ) -> Result<(), String> {
        let snapshot = self.snapshots.current();
        if !snapshot.trust.is_trusted(calling_ae) {
            let reason = format!("calling AE '{}' is not on the trust list", calling_ae);
            self.events.emit(RelayEvent::SessionRejected {
                calling_ae: calling_ae.to_string(),
                peer: peer_addr,
                reason: reason.clone(),
            });
            return Err(reason);
        }
        if called_ae != snapshot.config.relay.ae_title {
            debug!(
                "Association from {} addressed to '{}' instead of '{}'",
                calling_ae, called_ae, snapshot.config.relay.ae_title
            );
        }
        self.events.emit(RelayEvent::SessionAccepted {
            calling_ae: calling_ae.to_string(),
            peer: peer_addr,
        });
        Ok(())
    }
}

/// A plan handed to the orchestrator, remembered for late objects
#[derive(Debug, Clone)]
struct Dispatched {
    label: String,
    at: Instant,
}

/// Store handler for the relay SCP
#[derive(Debug)]
pub struct PlanReceiver {
    snapshots: SnapshotHandle,
    assembler: PlanAssembler,
    orchestrator: Orchestrator,
    converter: Arc<dyn Converter>,
    events: EventBus,
    /// Plans completed per association, dispatched when that association ends
    completed: Mutex<HashMap<Uuid, Vec<PlanKey>>>,
    dispatches: Mutex<Vec<JoinHandle<DispatchReport>>>,
    recent: Mutex<HashMap<PlanKey, Dispatched>>,
}

impl PlanReceiver {
    pub fn new(
        snapshots: SnapshotHandle,
        orchestrator: Orchestrator,
        converter: Arc<dyn Converter>,
        events: EventBus,
    ) -> Self {
        Self {
            snapshots,
            assembler: PlanAssembler::new(CompletionPolicy::Content),
            orchestrator,
            converter,
            events,
            completed: Mutex::new(HashMap::new()),
            dispatches: Mutex::new(Vec::new()),
            recent: Mutex::new(HashMap::new()),
        }
    }

    pub fn assembler(&self) -> &PlanAssembler {
        &self.assembler
    }

    /// Wait for the dispatches that have not been collected yet
    pub async fn drain_dispatches(&self) -> Vec<DispatchReport> {
        let handles: Vec<_> = std::mem::take(
            &mut *self.dispatches.lock().unwrap_or_else(|e| e.into_inner()),
        );
        let mut reports = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(report) => reports.push(report),
                Err(e) => error!("Plan dispatch task failed: {}", e),
            }
        }
        reports
    }

    async fn write_object(
        &self,
        root: &std::path::Path,
        object: &DicomObject,
        dataset: &DatasetStream,
    ) -> Result<PathBuf, StorageError> {
        let data = dataset
            .to_bytes()
            .await
            .map_err(|e| StorageError::Path(e.to_string()))?;
        let file = dimse::part10::encode(
            &data,
            &object.sop_class_uid,
            &object.instance_uid,
            &object.transfer_syntax,
        )
        .map_err(|e| StorageError::Path(e.to_string()))?;

        let storage = FilesystemStorage::new(root)?;
        storage
            .write_atomic(&layout::object_relative_path(object), file)
            .await
    }

    fn record_completed(&self, association: Uuid, key: PlanKey) {
        let mut completed = self.completed.lock().unwrap_or_else(|e| e.into_inner());
        let keys = completed.entry(association).or_default();
        if !keys.contains(&key) {
            keys.push(key);
        }
    }

    /// Complete the plan for `key` as a follow-up if its predecessor was
    /// dispatched within the late object window
    async fn complete_late_objects(&self, key: &PlanKey) -> bool {
        let window = self.snapshots.current().config.relay.late_object_window();
        let label = {
            let recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
            match recent.get(key) {
                Some(dispatched) if dispatched.at.elapsed() <= window => dispatched.label.clone(),
                _ => return false,
            }
        };
        let adopted = self.assembler.complete_follow_up(key, &label).await;
        if adopted {
            info!(plan = %key, "Late object for a dispatched plan, forwarding as a follow-up");
        }
        adopted
    }

    fn remember_dispatched(&self, key: PlanKey, label: String) {
        self.recent.lock().unwrap_or_else(|e| e.into_inner()).insert(
            key,
            Dispatched {
                label,
                at: Instant::now(),
            },
        );
    }

    fn evict_stale(&self) {
        let snapshot = self.snapshots.current();
        let relay = &snapshot.config.relay;
        let window = relay.late_object_window();
        self.recent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, d| d.at.elapsed() <= window);

        let max_idle = relay.stale_plan_after();
        for plan in self.assembler.evict_stale(max_idle) {
            self.events.emit(RelayEvent::PlanEvicted {
                plan: plan.key.clone(),
                objects: plan.object_count(),
            });
        }
    }
}

#[async_trait]
impl StoreHandler for PlanReceiver {
    async fn store(&self, ctx: &AssociationContext, dataset: DatasetStream) -> DimseStatus {
        let snapshot = self.snapshots.current();
        let mut object = match DicomObject::from_metadata(PathBuf::new(), dataset.metadata()) {
            Ok(object) => object,
            Err(e) => {
                self.events.emit(RelayEvent::ObjectRejected {
                    calling_ae: ctx.calling_ae.clone(),
                    reason: e.to_string(),
                });
                return status_mapper::object_error_to_dimse(&e);
            }
        };

        let root = snapshot.trust.resolve_directory(&ctx.calling_ae);
        object.path = match self.write_object(&root, &object, &dataset).await {
            Ok(path) => path,
            Err(e) => {
                error!(
                    calling_ae = %ctx.calling_ae,
                    "Failed to store {}: {}",
                    object.instance_uid,
                    e
                );
                return status_mapper::storage_error_to_dimse(&e);
            }
        };
        self.events.emit(RelayEvent::ObjectReceived {
            calling_ae: ctx.calling_ae.clone(),
            plan: PlanKey::of(&object),
            instance_uid: object.instance_uid.clone(),
            modality: object.modality,
            path: object.path.clone(),
        });

        let objects = match self.converter.try_convert(&object, &root).await {
            Conversion::Converted(objects) => objects,
            Conversion::Unchanged => vec![object],
            Conversion::Failed(reason) => {
                self.events.emit(RelayEvent::ConversionFailed {
                    path: object.path.clone(),
                    reason,
                });
                vec![object]
            }
        };

        let origin = Origin::Peer(ctx.calling_ae.clone());
        for object in objects {
            let result = self.assembler.ingest(object, origin.clone()).await;
            let completed =
                result.newly_complete || self.complete_late_objects(&result.key).await;
            if completed {
                let label = self
                    .assembler
                    .snapshot(&result.key)
                    .await
                    .map(|p| p.label)
                    .unwrap_or_default();
                self.events.emit(RelayEvent::PlanCompleted {
                    plan: result.key.clone(),
                    origin: origin.to_string(),
                    label,
                    objects: result.object_count,
                });
                self.record_completed(ctx.id, result.key);
            }
        }

        self.evict_stale();
        DimseStatus::Success
    }

    async fn transfer_interrupted(&self, ctx: &AssociationContext, buffered_bytes: usize) {
        self.events.emit(RelayEvent::IncompleteTransfer {
            calling_ae: ctx.calling_ae.clone(),
            discarded_bytes: buffered_bytes,
        });
    }

    async fn association_closed(&self, ctx: &AssociationContext, end: AssociationEnd) {
        let keys = self
            .completed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&ctx.id)
            .unwrap_or_default();
        info!(
            calling_ae = %ctx.calling_ae,
            "Association {} {}; {} plan(s) ready",
            ctx.id,
            end,
            keys.len()
        );

        for key in keys {
            // Recorded before the take so a concurrent late object finds it.
            let label = self
                .assembler
                .snapshot(&key)
                .await
                .map(|p| p.label)
                .unwrap_or_default();
            self.remember_dispatched(key.clone(), label);
            let Some(plan) = self.assembler.take(&key).await else {
                continue;
            };
            let orchestrator = self.orchestrator.clone();
            let snapshot = self.snapshots.current();
            let handle = tokio::spawn(async move { orchestrator.forward(&snapshot.rules, plan).await });
            let mut dispatches = self.dispatches.lock().unwrap_or_else(|e| e.into_inner());
            dispatches.retain(|h| !h.is_finished());
            dispatches.push(handle);
        }
    }
}

//! Outbound transport seam
//!
//! The orchestrator talks to destinations through [`StoreTransport`]; the
//! production implementation is [`DimseTransport`] over the `dimse` SCU.

use std::collections::BTreeSet;
use std::fmt::Debug;
use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use dimse::scu::ProposedContext;
use dimse::{DatasetStream, DimseConfig, DimseError, DimseScu, ScuAssociation};

use crate::models::{DicomObject, Node, SendFailure};

/// Opens sessions to destinations
#[async_trait]
pub trait StoreTransport: Send + Sync + Debug {
    /// Open a session able to carry every object in `objects`
    async fn open(
        &self,
        node: &Node,
        objects: &[&DicomObject],
    ) -> Result<Box<dyn TransportSession>, SendFailure>;

    /// Verification round trip
    async fn echo(&self, node: &Node) -> Result<(), SendFailure>;
}

/// One open outbound session
#[async_trait]
pub trait TransportSession: Send {
    async fn store(&mut self, object: &DicomObject) -> Result<(), SendFailure>;

    async fn release(self: Box<Self>) -> Result<(), SendFailure>;

    async fn abort(self: Box<Self>);
}

/// Map a DIMSE error raised while opening a session
pub fn open_failure(error: DimseError) -> SendFailure {
    match error {
        DimseError::AssociationRejected(reason) => SendFailure::AssociationRejected(reason),
        DimseError::AssociationAborted(_) => SendFailure::AssociationRejected(error.to_string()),
        DimseError::Network(_) | DimseError::Timeout(_) | DimseError::ConnectionClosed => {
            SendFailure::DestinationUnreachable(error.to_string())
        }
        other => SendFailure::Transfer(other.to_string()),
    }
}

/// Presentation contexts for a set of objects: one per SOP class and transfer syntax pair,
/// each offering exactly the syntax the file is stored in
pub fn contexts_for(objects: &[&DicomObject]) -> Vec<ProposedContext> {
    let pairs: BTreeSet<(&str, &str)> = objects
        .iter()
        .map(|o| (o.sop_class_uid.as_str(), o.transfer_syntax.as_str()))
        .collect();
    pairs
        .into_iter()
        .map(|(sop, ts)| ProposedContext::new(sop, vec![ts.to_string()]))
        .collect()
}

/// DICOM C-STORE transport
#[derive(Debug, Clone)]
pub struct DimseTransport {
    config: DimseConfig,
}

impl DimseTransport {
    pub fn new(config: DimseConfig) -> Self {
        Self { config }
    }

    fn scu(&self) -> DimseScu {
        DimseScu::new(self.config.clone())
    }
}

#[async_trait]
impl StoreTransport for DimseTransport {
    async fn open(
        &self,
        node: &Node,
        objects: &[&DicomObject],
    ) -> Result<Box<dyn TransportSession>, SendFailure> {
        let contexts = contexts_for(objects);
        let remote = node.remote(&self.config.local_aet);
        let association = self
            .scu()
            .associate(&remote, &contexts)
            .await
            .map_err(open_failure)?;
        Ok(Box::new(DimseSession { association }))
    }

    async fn echo(&self, node: &Node) -> Result<(), SendFailure> {
        let remote = node.remote(&self.config.local_aet);
        let status = self.scu().echo(&remote).await.map_err(open_failure)?;
        if status.is_accepted() {
            Ok(())
        } else {
            Err(SendFailure::Transfer(format!("C-ECHO returned {}", status)))
        }
    }
}

struct DimseSession {
    association: ScuAssociation,
}

async fn read_dataset(path: &Path) -> Result<Bytes, SendFailure> {
    let raw = tokio::fs::read(path)
        .await
        .map_err(|e| SendFailure::FileSystem(format!("{}: {}", path.display(), e)))?;
    let file = dimse::part10::split(Bytes::from(raw))
        .map_err(|e| SendFailure::FileSystem(format!("{}: {}", path.display(), e)))?;
    Ok(file.dataset)
}

#[async_trait]
impl TransportSession for DimseSession {
    async fn store(&mut self, object: &DicomObject) -> Result<(), SendFailure> {
        if !self
            .association
            .supports(&object.sop_class_uid, &object.transfer_syntax)
        {
            return Err(SendFailure::ObjectRejected {
                instance_uid: object.instance_uid.clone(),
                reason: format!(
                    "destination declined {} in {}",
                    object.sop_class_uid, object.transfer_syntax
                ),
            });
        }

        let dataset = read_dataset(&object.path).await?;
        let stream = DatasetStream::from_bytes(dataset, object.dataset_metadata());
        let status = self
            .association
            .store(&stream)
            .await
            .map_err(|e| match e {
                DimseError::Network(_) | DimseError::ConnectionClosed | DimseError::Timeout(_) => {
                    SendFailure::Transfer(e.to_string())
                }
                DimseError::AssociationAborted(_) => SendFailure::Transfer(e.to_string()),
                other => SendFailure::ObjectRejected {
                    instance_uid: object.instance_uid.clone(),
                    reason: other.to_string(),
                },
            })?;

        if status.is_accepted() {
            Ok(())
        } else {
            Err(SendFailure::ObjectRejected {
                instance_uid: object.instance_uid.clone(),
                reason: format!("status {}", status),
            })
        }
    }

    async fn release(self: Box<Self>) -> Result<(), SendFailure> {
        self.association
            .release()
            .await
            .map_err(|e| SendFailure::Transfer(format!("release failed: {}", e)))
    }

    async fn abort(self: Box<Self>) {
        self.association.abort().await;
    }
}

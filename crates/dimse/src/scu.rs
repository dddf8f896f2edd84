//! Service Class User (SCU) implementation for outbound DIMSE operations

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::config::{DimseConfig, RemoteNode};
use crate::message::{command_field, fragment, CommandSet, DimseMessage, MessageAssembler};
use crate::pdu::{
    self, pdu_name, Pdu, PresentationContextProposed, PresentationContextResultReason, UlCodec,
};
use crate::types::{uids, DatasetStream, DimseStatus};
use crate::{DimseError, Result};

/// Proposed presentation context: an abstract syntax and its candidate transfer syntaxes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposedContext {
    pub abstract_syntax: String,
    pub transfer_syntaxes: Vec<String>,
}

impl ProposedContext {
    pub fn new(abstract_syntax: impl Into<String>, transfer_syntaxes: Vec<String>) -> Self {
        Self {
            abstract_syntax: abstract_syntax.into(),
            transfer_syntaxes,
        }
    }

    /// Verification SOP class with the default transfer syntaxes
    pub fn verification() -> Self {
        Self::new(
            uids::VERIFICATION,
            vec![
                uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
                uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
            ],
        )
    }
}

/// DIMSE Service Class User
pub struct DimseScu {
    config: DimseConfig,
}

impl DimseScu {
    /// Create a new SCU with the given configuration
    pub fn new(config: DimseConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DimseConfig {
        &self.config
    }

    /// Open an association proposing the given contexts
    pub async fn associate(
        &self,
        node: &RemoteNode,
        contexts: &[ProposedContext],
    ) -> Result<ScuAssociation> {
        node.validate()?;
        if contexts.is_empty() || contexts.len() > 128 {
            return Err(DimseError::config(format!(
                "between 1 and 128 presentation contexts required, got {}",
                contexts.len()
            )));
        }

        let connect_timeout = node
            .connect_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.connect_timeout());
        let addr = node.socket_addr_string();

        let stream = match timeout(connect_timeout, TcpStream::connect(&addr)).await {
            Err(_) => {
                return Err(DimseError::Timeout(format!(
                    "connecting to {} took longer than {:?}",
                    node, connect_timeout
                )))
            }
            Ok(result) => result?,
        };
        let local_max_pdu = node.max_pdu.unwrap_or(self.config.max_pdu);
        let mut conn = Framed::new(stream, UlCodec::new(local_max_pdu));

        let calling_ae = node
            .calling_ae_title
            .clone()
            .unwrap_or_else(|| self.config.local_aet.clone());

        // Presentation context ids are odd: 1, 3, 5, ...
        let proposed: Vec<PresentationContextProposed> = contexts
            .iter()
            .enumerate()
            .map(|(i, c)| PresentationContextProposed {
                id: (i * 2 + 1) as u8,
                abstract_syntax: c.abstract_syntax.clone(),
                transfer_syntaxes: c.transfer_syntaxes.clone(),
            })
            .collect();

        let rq = pdu::association_rq(&calling_ae, &node.ae_title, proposed.clone(), local_max_pdu);
        conn.send(rq).await?;

        let reply = timeout(self.config.association_timeout(), conn.next())
            .await
            .map_err(|_| {
                DimseError::Timeout(format!("no association response from {}", node))
            })?;

        let ac = match reply {
            None => return Err(DimseError::ConnectionClosed),
            Some(Err(e)) => return Err(e),
            Some(Ok(Pdu::AssociationAC(ac))) => ac,
            Some(Ok(Pdu::AssociationRJ(rj))) => {
                return Err(DimseError::AssociationRejected(format!(
                    "{} by {}",
                    pdu::describe_rejection(&rj),
                    node
                )))
            }
            Some(Ok(Pdu::AbortRQ { source })) => {
                return Err(DimseError::AssociationAborted(format!("{:?}", source)))
            }
            Some(Ok(other)) => {
                return Err(DimseError::protocol(format!(
                    "expected association response, got {}",
                    pdu_name(&other)
                )))
            }
        };

        let accepted: Vec<AcceptedContext> = ac
            .presentation_contexts
            .iter()
            .filter(|pc| matches!(pc.reason, PresentationContextResultReason::Acceptance))
            .filter_map(|pc| {
                proposed.iter().find(|p| p.id == pc.id).map(|p| AcceptedContext {
                    id: pc.id,
                    abstract_syntax: p.abstract_syntax.clone(),
                    transfer_syntax: pc.transfer_syntax.clone(),
                })
            })
            .collect();

        info!(
            "Association {} -> {} established ({} of {} contexts accepted)",
            calling_ae,
            node,
            accepted.len(),
            proposed.len()
        );

        Ok(ScuAssociation {
            conn,
            peer: node.to_string(),
            accepted,
            peer_max_pdu: pdu::max_length(&ac.user_variables),
            next_message_id: 1,
            dimse_timeout: self.config.dimse_timeout(),
        })
    }

    /// Perform C-ECHO against a remote node
    pub async fn echo(&self, node: &RemoteNode) -> Result<DimseStatus> {
        let mut association = self
            .associate(node, &[ProposedContext::verification()])
            .await?;
        let status = association.echo().await;
        match status {
            Ok(status) => {
                association.release().await?;
                Ok(status)
            }
            Err(e) => {
                association.abort().await;
                Err(e)
            }
        }
    }

    /// Send a single dataset in its own association
    pub async fn store(&self, node: &RemoteNode, dataset: &DatasetStream) -> Result<DimseStatus> {
        let metadata = dataset.metadata();
        let (sop_class, ts) = match (&metadata.sop_class_uid, &metadata.transfer_syntax) {
            (Some(class), Some(ts)) => (class.clone(), ts.clone()),
            _ => {
                return Err(DimseError::operation_failed(
                    "dataset metadata lacks SOP class or transfer syntax",
                ))
            }
        };
        let mut association = self
            .associate(node, &[ProposedContext::new(sop_class, vec![ts])])
            .await?;
        match association.store(dataset).await {
            Ok(status) => {
                association.release().await?;
                Ok(status)
            }
            Err(e) => {
                association.abort().await;
                Err(e)
            }
        }
    }

    /// Test connection to a remote node with C-ECHO, retrying with backoff
    pub async fn test_connection(&self, node: &RemoteNode, max_retries: u32) -> Result<bool> {
        let mut last_error = None;
        for attempt in 1..=max_retries.max(1) {
            debug!("Connection test attempt {} for {}", attempt, node);
            match self.echo(node).await {
                Ok(status) if status.is_accepted() => return Ok(true),
                Ok(status) => {
                    warn!("C-ECHO to {} returned {}", node, status);
                    return Ok(false);
                }
                Err(e) if e.is_recoverable() && attempt < max_retries => {
                    warn!("Connection test attempt {} to {} failed: {}", attempt, node, e);
                    tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        match last_error {
            Some(e) => Err(e),
            None => Ok(false),
        }
    }
}

#[derive(Debug, Clone)]
struct AcceptedContext {
    id: u8,
    abstract_syntax: String,
    transfer_syntax: String,
}

/// An established outbound association
pub struct ScuAssociation {
    conn: Framed<TcpStream, UlCodec>,
    peer: String,
    accepted: Vec<AcceptedContext>,
    peer_max_pdu: u32,
    next_message_id: u16,
    dimse_timeout: Duration,
}

impl ScuAssociation {
    /// Whether a context for exactly this SOP class and transfer syntax was accepted
    pub fn supports(&self, sop_class_uid: &str, transfer_syntax: &str) -> bool {
        self.context_for(sop_class_uid, transfer_syntax).is_some()
    }

    fn context_for(&self, sop_class_uid: &str, transfer_syntax: &str) -> Option<u8> {
        self.accepted
            .iter()
            .find(|c| c.abstract_syntax == sop_class_uid && c.transfer_syntax == transfer_syntax)
            .map(|c| c.id)
    }

    fn message_id(&mut self) -> u16 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1).max(1);
        id
    }

    /// C-ECHO on this association
    pub async fn echo(&mut self) -> Result<DimseStatus> {
        let pc_id = self
            .accepted
            .iter()
            .find(|c| c.abstract_syntax == uids::VERIFICATION)
            .map(|c| c.id)
            .ok_or_else(|| DimseError::NoPresentationContext("Verification".into()))?;

        let rq = CommandSet::c_echo_rq(self.message_id());
        self.send_message(pc_id, &rq, None).await?;
        let rsp = self.await_response(command_field::C_ECHO_RSP).await?;
        Ok(DimseStatus::from_code(rsp.command.status.unwrap_or(0xFFFF)))
    }

    /// C-STORE one dataset; its bytes are sent unchanged
    pub async fn store(&mut self, dataset: &DatasetStream) -> Result<DimseStatus> {
        let metadata = dataset.metadata();
        let sop_class = metadata
            .sop_class_uid
            .as_deref()
            .ok_or_else(|| DimseError::operation_failed("dataset has no SOP Class UID"))?;
        let sop_instance = metadata
            .sop_instance_uid
            .as_deref()
            .ok_or_else(|| DimseError::operation_failed("dataset has no SOP Instance UID"))?;
        let ts = metadata
            .transfer_syntax
            .as_deref()
            .ok_or_else(|| DimseError::operation_failed("dataset has no transfer syntax"))?;

        let pc_id = self.context_for(sop_class, ts).ok_or_else(|| {
            DimseError::NoPresentationContext(format!("{} in {}", sop_class, ts))
        })?;

        let data = dataset.to_bytes().await?;
        let rq = CommandSet::c_store_rq(self.message_id(), sop_class, sop_instance);
        debug!(
            "C-STORE {} ({} bytes) to {}",
            sop_instance,
            data.len(),
            self.peer
        );
        self.send_message(pc_id, &rq, Some(data)).await?;

        let rsp = self.await_response(command_field::C_STORE_RSP).await?;
        Ok(DimseStatus::from_code(rsp.command.status.unwrap_or(0xFFFF)))
    }

    async fn send_message(
        &mut self,
        pc_id: u8,
        command: &CommandSet,
        data: Option<bytes::Bytes>,
    ) -> Result<()> {
        for pdu in fragment(pc_id, command.encode()?, data, self.peer_max_pdu) {
            self.conn.feed(pdu).await?;
        }
        self.conn.flush().await
    }

    async fn await_response(&mut self, expected: u16) -> Result<DimseMessage> {
        let mut assembler = MessageAssembler::new();
        loop {
            let next = timeout(self.dimse_timeout, self.conn.next())
                .await
                .map_err(|_| {
                    DimseError::Timeout(format!("no DIMSE response from {}", self.peer))
                })?;
            match next {
                None => return Err(DimseError::ConnectionClosed),
                Some(Err(e)) => return Err(e),
                Some(Ok(Pdu::PData { data: values })) => {
                    for pdv in values {
                        if let Some(message) = assembler.push(pdv)? {
                            if message.command.command_field != expected {
                                return Err(DimseError::protocol(format!(
                                    "expected response 0x{:04X}, got 0x{:04X}",
                                    expected, message.command.command_field
                                )));
                            }
                            return Ok(message);
                        }
                    }
                }
                Some(Ok(Pdu::AbortRQ { source })) => {
                    return Err(DimseError::AssociationAborted(format!("{:?}", source)))
                }
                Some(Ok(other)) => {
                    return Err(DimseError::protocol(format!(
                        "unexpected {} while waiting for a response",
                        pdu_name(&other)
                    )))
                }
            }
        }
    }

    /// Release the association gracefully
    pub async fn release(mut self) -> Result<()> {
        self.conn.send(Pdu::ReleaseRQ).await?;
        let reply = timeout(self.dimse_timeout, self.conn.next())
            .await
            .map_err(|_| DimseError::Timeout(format!("no A-RELEASE-RP from {}", self.peer)))?;
        match reply {
            Some(Ok(Pdu::ReleaseRP)) | None => Ok(()),
            Some(Ok(other)) => Err(DimseError::protocol(format!(
                "expected A-RELEASE-RP, got {}",
                pdu_name(&other)
            ))),
            Some(Err(e)) => Err(e),
        }
    }

    /// Abort the association; errors are ignored because the peer may already be gone
    pub async fn abort(mut self) {
        if let Err(e) = self.conn.send(pdu::user_abort()).await {
            debug!("A-ABORT to {} not delivered: {}", self.peer, e);
        }
    }
}

/// Builder for creating SCU instances
pub struct ScuBuilder {
    config: DimseConfig,
}

impl ScuBuilder {
    /// Create a new SCU builder
    pub fn new() -> Self {
        Self {
            config: DimseConfig::default(),
        }
    }

    /// Set the local AE title
    pub fn local_aet(mut self, aet: impl Into<String>) -> Self {
        self.config.local_aet = aet.into();
        self
    }

    /// Set connection timeout
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set time to wait for DIMSE responses
    pub fn dimse_timeout(mut self, timeout: Duration) -> Self {
        self.config.dimse_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set maximum PDU size
    pub fn max_pdu(mut self, size: u32) -> Self {
        self.config.max_pdu = size;
        self
    }

    /// Build the SCU
    pub fn build(self) -> Result<DimseScu> {
        self.config.validate()?;
        Ok(DimseScu::new(self.config))
    }
}

impl Default for ScuBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scu_builder() {
        let scu = ScuBuilder::new()
            .local_aet("TEST_SCU")
            .connection_timeout(Duration::from_secs(10))
            .max_pdu(32768)
            .build()
            .unwrap();

        assert_eq!(scu.config().local_aet, "TEST_SCU");
        assert_eq!(scu.config().connect_timeout_ms, 10_000);
        assert_eq!(scu.config().max_pdu, 32768);
    }

    #[test]
    fn test_scu_builder_rejects_bad_aet() {
        assert!(ScuBuilder::new().local_aet("").build().is_err());
    }

    #[tokio::test]
    async fn test_echo_unreachable_node() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let scu = ScuBuilder::new()
            .connection_timeout(Duration::from_secs(2))
            .build()
            .unwrap();
        let node = RemoteNode::new("NOBODY", "127.0.0.1", port);
        let err = scu.echo(&node).await.unwrap_err();
        assert!(err.is_recoverable());
    }
}

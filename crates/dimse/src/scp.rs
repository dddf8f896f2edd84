//! Service Class Provider (SCP) implementation for inbound DIMSE operations

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::DimseConfig;
use crate::message::{command_field, fragment, CommandSet, DimseMessage, MessageAssembler};
use crate::pdu::{
    self, pdu_name, AbortRQServiceProviderReason, AssociationRQ, Pdu, PresentationContextResult,
    PresentationContextResultReason, UlCodec,
};
use crate::types::{uids, DatasetStream, DimseStatus};
use crate::{part10, DimseError, Result};

/// Decides whether a calling AE may open an association
pub trait AccessControl: Send + Sync {
    /// `Err` carries the reason logged for the rejection
    fn check_access(
        &self,
        calling_ae: &str,
        called_ae: &str,
        peer_addr: SocketAddr,
    ) -> std::result::Result<(), String>;
}

/// Receives the objects of accepted associations
#[async_trait]
pub trait StoreHandler: Send + Sync {
    /// Store one received object and report the C-STORE status
    async fn store(&self, ctx: &AssociationContext, dataset: DatasetStream) -> DimseStatus;

    /// Called when an association ends in the middle of an object; the partial data is dropped
    async fn transfer_interrupted(&self, _ctx: &AssociationContext, _buffered_bytes: usize) {}

    /// Called once an accepted association has ended, however it ended
    async fn association_closed(&self, _ctx: &AssociationContext, _end: AssociationEnd) {}
}

/// Identity of one accepted association
#[derive(Debug, Clone)]
pub struct AssociationContext {
    pub id: Uuid,
    pub peer_addr: SocketAddr,
    pub calling_ae: String,
    pub called_ae: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// How an accepted association ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssociationEnd {
    Released,
    Aborted,
    Disconnected,
    TimedOut,
    Shutdown,
    Error(String),
}

impl AssociationEnd {
    /// Whether the last object may have been cut off
    pub fn is_clean(&self) -> bool {
        matches!(self, AssociationEnd::Released)
    }
}

impl std::fmt::Display for AssociationEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssociationEnd::Released => write!(f, "released"),
            AssociationEnd::Aborted => write!(f, "aborted by peer"),
            AssociationEnd::Disconnected => write!(f, "connection dropped"),
            AssociationEnd::TimedOut => write!(f, "idle timeout"),
            AssociationEnd::Shutdown => write!(f, "aborted for shutdown"),
            AssociationEnd::Error(e) => write!(f, "error: {}", e),
        }
    }
}

/// States an inbound session moves through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Listening,
    Accepted,
    Authenticating,
    Rejected,
    Receiving,
    Releasing,
    Closed,
}

impl SessionState {
    /// Whether `next` is a legal successor of `self`
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Listening, Accepted)
                | (Accepted, Authenticating)
                | (Accepted, Closed)
                | (Authenticating, Rejected)
                | (Authenticating, Receiving)
                | (Receiving, Releasing)
                | (Receiving, Closed)
                | (Releasing, Closed)
        )
    }
}

struct Session {
    state: SessionState,
}

impl Session {
    fn new() -> Self {
        Self {
            state: SessionState::Listening,
        }
    }

    fn advance(&mut self, next: SessionState) {
        if !self.state.can_transition_to(next) {
            warn!("Unexpected session transition {:?} -> {:?}", self.state, next);
        }
        debug!("Session {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

/// An accepted presentation context
#[derive(Debug, Clone)]
struct AcceptedContext {
    abstract_syntax: String,
    transfer_syntax: String,
}

type Connection = Framed<TcpStream, UlCodec>;

/// DIMSE Service Class Provider
pub struct DimseScp {
    config: DimseConfig,
    access: Arc<dyn AccessControl>,
    handler: Arc<dyn StoreHandler>,
    limiter: Arc<Semaphore>,
}

impl DimseScp {
    /// Create a new SCP with the given configuration, access policy and store handler
    pub fn new(
        config: DimseConfig,
        access: Arc<dyn AccessControl>,
        handler: Arc<dyn StoreHandler>,
    ) -> Self {
        let limiter = Arc::new(Semaphore::new(config.max_associations as usize));
        Self {
            config,
            access,
            handler,
            limiter,
        }
    }

    /// Validate the configuration and bind the listening socket
    pub async fn bind(&self) -> Result<TcpListener> {
        self.config.validate()?;
        let addr = SocketAddr::new(self.config.bind_addr, self.config.port);
        let listener = TcpListener::bind(addr).await?;
        info!(
            "DIMSE SCP listening on {} (AET: {})",
            listener.local_addr()?,
            self.config.local_aet
        );
        Ok(listener)
    }

    /// Bind and serve until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listener = self.bind().await?;
        Arc::new(self).serve(listener, shutdown).await
    }

    /// Accept associations on an already bound listener
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("DIMSE SCP on {} stopping", self.config.local_aet);
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!("Accepted connection from {}", peer_addr);
                        let permit = Arc::clone(&self.limiter).try_acquire_owned().ok();
                        let scp = Arc::clone(&self);
                        let token = shutdown.child_token();
                        let span = info_span!("association", peer = %peer_addr);
                        tokio::spawn(
                            async move {
                                if let Err(e) = scp.handle_association(stream, peer_addr, permit, token).await {
                                    warn!("Association from {} ended with error: {}", peer_addr, e);
                                }
                            }
                            .instrument(span),
                        );
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                    }
                }
            }
        }
    }

    /// Handle a single association
    async fn handle_association(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        permit: Option<OwnedSemaphorePermit>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut session = Session::new();
        session.advance(SessionState::Accepted);

        let mut conn = Framed::new(stream, UlCodec::new(self.config.max_pdu));

        let rq = match timeout(self.config.association_timeout(), conn.next()).await {
            Err(_) => {
                session.advance(SessionState::Closed);
                return Err(DimseError::Timeout(
                    "no A-ASSOCIATE-RQ within the association timeout".into(),
                ));
            }
            Ok(None) => {
                session.advance(SessionState::Closed);
                return Ok(());
            }
            Ok(Some(Err(e))) => {
                send_abort(&mut conn, AbortRQServiceProviderReason::ReasonNotSpecified).await;
                session.advance(SessionState::Closed);
                return Err(e);
            }
            Ok(Some(Ok(Pdu::AssociationRQ(rq)))) => rq,
            Ok(Some(Ok(other))) => {
                send_abort(&mut conn, AbortRQServiceProviderReason::UnexpectedPdu).await;
                session.advance(SessionState::Closed);
                return Err(DimseError::protocol(format!(
                    "expected A-ASSOCIATE-RQ, got {:?}",
                    pdu_name(&other)
                )));
            }
        };

        session.advance(SessionState::Authenticating);
        let calling_ae = rq.calling_ae_title.trim().to_string();
        let called_ae = rq.called_ae_title.trim().to_string();

        let Some(_permit) = permit else {
            warn!(
                "Maximum associations ({}) reached, rejecting {} from {}",
                self.config.max_associations, calling_ae, peer_addr
            );
            session.advance(SessionState::Rejected);
            conn.send(pdu::reject_local_limit()).await?;
            return Ok(());
        };

        if let Err(reason) = self.access.check_access(&calling_ae, &called_ae, peer_addr) {
            warn!(
                "Rejecting association from {} ({}): {}",
                calling_ae, peer_addr, reason
            );
            session.advance(SessionState::Rejected);
            conn.send(pdu::reject_calling_ae()).await?;
            return Ok(());
        }

        let (ac, contexts) = self.negotiate(&rq);
        let peer_max_pdu = pdu::max_length(&rq.user_variables);
        conn.send(ac).await?;

        let ctx = AssociationContext {
            id: Uuid::new_v4(),
            peer_addr,
            calling_ae,
            called_ae,
            started_at: chrono::Utc::now(),
        };
        info!(
            "Association {} accepted: {} -> {} ({} of {} presentation contexts)",
            ctx.id,
            ctx.calling_ae,
            ctx.called_ae,
            contexts.len(),
            rq.presentation_contexts.len()
        );
        session.advance(SessionState::Receiving);

        let (end, interrupted) = self
            .receive_loop(&mut conn, &ctx, &contexts, peer_max_pdu, &mut session, &shutdown)
            .await;

        session.advance(SessionState::Closed);
        if let Some(buffered) = interrupted {
            self.handler.transfer_interrupted(&ctx, buffered).await;
        }
        info!("Association {} from {} closed: {}", ctx.id, ctx.calling_ae, end);
        self.handler.association_closed(&ctx, end).await;
        Ok(())
    }

    /// Pick a transfer syntax for every proposed context
    fn negotiate(&self, rq: &AssociationRQ) -> (Pdu, HashMap<u8, AcceptedContext>) {
        let mut accepted = HashMap::new();
        let mut results = Vec::with_capacity(rq.presentation_contexts.len());

        for pc in &rq.presentation_contexts {
            let supported = (pc.abstract_syntax == uids::VERIFICATION && self.config.enable_echo)
                || (self.config.enable_store
                    && self
                        .config
                        .storage_sop_classes
                        .iter()
                        .any(|c| c == &pc.abstract_syntax));

            let (reason, transfer_syntax) = if !supported {
                (PresentationContextResultReason::AbstractSyntaxNotSupported, String::new())
            } else {
                // Our preference order wins over the proposal order.
                match self
                    .config
                    .preferred_transfer_syntaxes
                    .iter()
                    .find(|ts| pc.transfer_syntaxes.contains(ts))
                {
                    Some(ts) => (PresentationContextResultReason::Acceptance, ts.clone()),
                    None => (
                        PresentationContextResultReason::TransferSyntaxesNotSupported,
                        String::new(),
                    ),
                }
            };

            if matches!(reason, PresentationContextResultReason::Acceptance) {
                accepted.insert(
                    pc.id,
                    AcceptedContext {
                        abstract_syntax: pc.abstract_syntax.clone(),
                        transfer_syntax: transfer_syntax.clone(),
                    },
                );
            } else {
                debug!(
                    "Presentation context {} ({}) not accepted: {:?}",
                    pc.id, pc.abstract_syntax, reason
                );
            }
            results.push(PresentationContextResult {
                id: pc.id,
                reason,
                transfer_syntax,
            });
        }

        (pdu::association_ac(rq, results, self.config.max_pdu), accepted)
    }

    async fn receive_loop(
        &self,
        conn: &mut Connection,
        ctx: &AssociationContext,
        contexts: &HashMap<u8, AcceptedContext>,
        peer_max_pdu: u32,
        session: &mut Session,
        shutdown: &CancellationToken,
    ) -> (AssociationEnd, Option<usize>) {
        let mut assembler = MessageAssembler::new();

        let end = loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => None,
                next = timeout(self.config.association_timeout(), conn.next()) => Some(next),
            };
            let Some(next) = next else {
                send_abort(conn, AbortRQServiceProviderReason::ReasonNotSpecified).await;
                break AssociationEnd::Shutdown;
            };

            let pdu = match next {
                Err(_) => {
                    send_abort(conn, AbortRQServiceProviderReason::ReasonNotSpecified).await;
                    break AssociationEnd::TimedOut;
                }
                Ok(None) => break AssociationEnd::Disconnected,
                Ok(Some(Err(e))) => {
                    send_abort(conn, AbortRQServiceProviderReason::ReasonNotSpecified).await;
                    break AssociationEnd::Error(e.to_string());
                }
                Ok(Some(Ok(pdu))) => pdu,
            };

            match pdu {
                Pdu::PData { data: values } => {
                    for pdv in values {
                        let message = match assembler.push(pdv) {
                            Ok(Some(message)) => message,
                            Ok(None) => continue,
                            Err(e) => {
                                send_abort(conn, AbortRQServiceProviderReason::ReasonNotSpecified).await;
                                return self.finish(&assembler, AssociationEnd::Error(e.to_string()));
                            }
                        };
                        if let Err(e) = self
                            .handle_message(conn, ctx, contexts, peer_max_pdu, message)
                            .await
                        {
                            send_abort(conn, AbortRQServiceProviderReason::ReasonNotSpecified).await;
                            return self.finish(&assembler, AssociationEnd::Error(e.to_string()));
                        }
                    }
                }
                Pdu::ReleaseRQ => {
                    session.advance(SessionState::Releasing);
                    if let Err(e) = conn.send(Pdu::ReleaseRP).await {
                        debug!("Failed to send A-RELEASE-RP: {}", e);
                    }
                    break AssociationEnd::Released;
                }
                Pdu::AbortRQ { source } => {
                    debug!("A-ABORT received ({:?})", source);
                    break AssociationEnd::Aborted;
                }
                other => {
                    send_abort(conn, AbortRQServiceProviderReason::UnexpectedPdu).await;
                    break AssociationEnd::Error(format!("unexpected {}", pdu_name(&other)));
                }
            }
        };

        self.finish(&assembler, end)
    }

    fn finish(
        &self,
        assembler: &MessageAssembler,
        end: AssociationEnd,
    ) -> (AssociationEnd, Option<usize>) {
        if !assembler.in_progress() {
            return (end, None);
        }
        warn!(
            "Discarding incomplete object ({} bytes buffered): association {}",
            assembler.buffered_len(),
            end
        );
        (end, Some(assembler.buffered_len()))
    }

    async fn handle_message(
        &self,
        conn: &mut Connection,
        ctx: &AssociationContext,
        contexts: &HashMap<u8, AcceptedContext>,
        peer_max_pdu: u32,
        message: DimseMessage,
    ) -> Result<()> {
        let pc_id = message.presentation_context_id;
        let context = contexts.get(&pc_id).ok_or_else(|| {
            DimseError::protocol(format!("message on unaccepted presentation context {}", pc_id))
        })?;

        let response = match message.command.command_field {
            command_field::C_ECHO_RQ => {
                debug!("C-ECHO from {}", ctx.calling_ae);
                CommandSet::c_echo_rsp(&message.command, DimseStatus::Success)
            }
            command_field::C_STORE_RQ => {
                let status = match message.data_set {
                    Some(data) => self.handle_store(ctx, context, &message.command, data).await,
                    None => DimseStatus::CANNOT_UNDERSTAND,
                };
                CommandSet::c_store_rsp(&message.command, status)
            }
            other => {
                warn!("Unsupported DIMSE command 0x{:04X} from {}", other, ctx.calling_ae);
                CommandSet::unrecognized_rsp(&message.command)
            }
        };

        for pdu in fragment(pc_id, response.encode()?, None, peer_max_pdu) {
            conn.send(pdu).await?;
        }
        Ok(())
    }

    async fn handle_store(
        &self,
        ctx: &AssociationContext,
        context: &AcceptedContext,
        command: &CommandSet,
        data: bytes::Bytes,
    ) -> DimseStatus {
        let mut metadata = match part10::dataset_metadata(&data, &context.transfer_syntax) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(
                    "Cannot parse object {:?} from {}: {}",
                    command.affected_sop_instance_uid, ctx.calling_ae, e
                );
                return DimseStatus::CANNOT_UNDERSTAND;
            }
        };

        if let (Some(affected), Some(actual)) =
            (&command.affected_sop_class_uid, &metadata.sop_class_uid)
        {
            if affected != actual || affected != &context.abstract_syntax {
                warn!(
                    "SOP class mismatch from {}: command {}, data set {}",
                    ctx.calling_ae, affected, actual
                );
                return DimseStatus::DATASET_MISMATCH;
            }
        }
        if metadata.sop_instance_uid.is_none() {
            metadata.sop_instance_uid = command.affected_sop_instance_uid.clone();
        }

        self.handler
            .store(ctx, DatasetStream::from_bytes(data, metadata))
            .await
    }
}

async fn send_abort(conn: &mut Connection, reason: AbortRQServiceProviderReason) {
    if let Err(e) = conn.send(pdu::provider_abort(reason)).await {
        debug!("Failed to send A-ABORT: {}", e);
    }
}

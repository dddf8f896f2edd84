//! DIMSE (DICOM Message Service Element) implementation
//!
//! This crate provides the store/forward subset of DICOM networking: an
//! association acceptor (SCP) and an association requestor (SCU) running
//! over tokio sockets.
//!
//! # Features
//! - `tokio_util::codec::Framed` codec over the `dicom-ul` PDU reader and writer
//! - Inbound DIMSE services (SCP): C-ECHO, C-STORE
//! - Outbound DIMSE services (SCU): C-ECHO, C-STORE
//! - Part 10 helpers that keep received dataset bytes untouched

pub mod config;
pub mod error;
pub mod message;
pub mod part10;
pub mod pdu;
pub mod scp;
pub mod scu;
pub mod types;

// Re-export commonly used types
pub use config::{DimseConfig, RemoteNode};
pub use error::{DimseError, Result};
pub use scp::{AccessControl, AssociationContext, DimseScp, StoreHandler};
pub use scu::{DimseScu, ScuAssociation};
pub use types::{DatasetMetadata, DatasetStream, DimseCommand, DimseStatus};

/// DIMSE protocol version
pub const DIMSE_VERSION: &str = "0.2.0";

/// Default DICOM port (non-TLS)
pub const DEFAULT_DIMSE_PORT: u16 = 11112;

/// Implementation class UID announced during association negotiation
pub const IMPLEMENTATION_CLASS_UID: &str = "1.2.826.0.1.3680043.10.1175.2";

/// Implementation version name announced during association negotiation
pub const IMPLEMENTATION_VERSION_NAME: &str = "RTRELAY_020";

/// DICOM application context name
pub const APPLICATION_CONTEXT_NAME: &str = "1.2.840.10008.3.1.1.1";

//! Configuration types for DIMSE services

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::error::{DimseError, Result};
use crate::types::uids;
use crate::DEFAULT_DIMSE_PORT;

/// Configuration for DIMSE services
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimseConfig {
    /// Local Application Entity Title
    pub local_aet: String,

    /// Bind address for SCP listener
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,

    /// Port for SCP listener
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum PDU size in bytes
    #[serde(default = "default_max_pdu")]
    pub max_pdu: u32,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Association timeout in milliseconds: negotiation and idle time between PDUs
    #[serde(default = "default_association_timeout")]
    pub association_timeout_ms: u64,

    /// Time to wait for a DIMSE response in milliseconds
    #[serde(default = "default_dimse_timeout")]
    pub dimse_timeout_ms: u64,

    /// Accepted transfer syntaxes (in order of preference)
    #[serde(default = "default_transfer_syntaxes")]
    pub preferred_transfer_syntaxes: Vec<String>,

    /// Abstract syntaxes (SOP classes) the SCP accepts for C-STORE
    #[serde(default = "default_storage_sop_classes")]
    pub storage_sop_classes: Vec<String>,

    /// Maximum number of concurrent associations
    #[serde(default = "default_max_associations")]
    pub max_associations: u32,

    /// Enable C-ECHO service
    #[serde(default = "default_true")]
    pub enable_echo: bool,

    /// Enable C-STORE service
    #[serde(default = "default_true")]
    pub enable_store: bool,
}

/// Configuration for a remote DICOM node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteNode {
    /// Remote Application Entity Title
    pub ae_title: String,

    /// Remote host address
    pub host: String,

    /// Remote port
    pub port: u16,

    /// Calling AE title for this node (overrides the local AE title)
    #[serde(default)]
    pub calling_ae_title: Option<String>,

    /// Connection timeout in milliseconds (overrides global setting)
    pub connect_timeout_ms: Option<u64>,

    /// Maximum PDU size for this node (overrides global setting)
    pub max_pdu: Option<u32>,
}

impl Default for DimseConfig {
    fn default() -> Self {
        Self {
            local_aet: "RTRELAY".to_string(),
            bind_addr: default_bind_addr(),
            port: default_port(),
            max_pdu: default_max_pdu(),
            connect_timeout_ms: default_connect_timeout(),
            association_timeout_ms: default_association_timeout(),
            dimse_timeout_ms: default_dimse_timeout(),
            preferred_transfer_syntaxes: default_transfer_syntaxes(),
            storage_sop_classes: default_storage_sop_classes(),
            max_associations: default_max_associations(),
            enable_echo: true,
            enable_store: true,
        }
    }
}

impl DimseConfig {
    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Get association timeout as Duration
    pub fn association_timeout(&self) -> Duration {
        Duration::from_millis(self.association_timeout_ms)
    }

    /// Get DIMSE response timeout as Duration
    pub fn dimse_timeout(&self) -> Duration {
        Duration::from_millis(self.dimse_timeout_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validate_ae_title(&self.local_aet)?;

        // Port 0 asks the OS for an ephemeral port; only the SCP binds, so it is allowed.

        if self.max_pdu < 16384 || self.max_pdu > 131072 {
            return Err(DimseError::config(
                "Max PDU size must be between 16384 and 131072 bytes",
            ));
        }

        if self.preferred_transfer_syntaxes.is_empty() {
            return Err(DimseError::config(
                "At least one transfer syntax must be accepted",
            ));
        }

        if self.max_associations == 0 {
            return Err(DimseError::config("max_associations must be at least 1"));
        }

        Ok(())
    }
}

impl RemoteNode {
    /// Create a new remote node configuration
    pub fn new(ae_title: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            ae_title: ae_title.into(),
            host: host.into(),
            port,
            calling_ae_title: None,
            connect_timeout_ms: None,
            max_pdu: None,
        }
    }

    /// Use a specific calling AE title when talking to this node
    pub fn with_calling_ae_title(mut self, aet: impl Into<String>) -> Self {
        self.calling_ae_title = Some(aet.into());
        self
    }

    /// Set connection timeout for this node
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = Some(timeout_ms);
        self
    }

    /// `host:port` form used for connecting
    pub fn socket_addr_string(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validate the remote node configuration
    pub fn validate(&self) -> Result<()> {
        validate_ae_title(&self.ae_title)?;
        if let Some(calling) = &self.calling_ae_title {
            validate_ae_title(calling)?;
        }

        if self.host.is_empty() {
            return Err(DimseError::config("Remote host cannot be empty"));
        }

        if self.port == 0 {
            return Err(DimseError::config("Remote port must be greater than 0"));
        }

        Ok(())
    }
}

impl std::fmt::Display for RemoteNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.ae_title, self.host, self.port)
    }
}

/// Check an AE title: 1-16 characters, no backslash or control characters,
/// not only spaces.
pub fn validate_ae_title(aet: &str) -> Result<()> {
    if aet.trim().is_empty() || aet.len() > 16 {
        return Err(DimseError::InvalidAeTitle(format!(
            "'{}' must be 1-16 characters",
            aet
        )));
    }
    if aet.chars().any(|c| c == '\\' || c.is_control()) {
        return Err(DimseError::InvalidAeTitle(format!(
            "'{}' contains a backslash or control character",
            aet
        )));
    }
    Ok(())
}

// Default value functions
fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0))
}

fn default_port() -> u16 {
    DEFAULT_DIMSE_PORT
}

fn default_max_pdu() -> u32 {
    65536
}

fn default_connect_timeout() -> u64 {
    30_000 // 30 seconds
}

fn default_association_timeout() -> u64 {
    300_000 // 5 minutes
}

fn default_dimse_timeout() -> u64 {
    60_000
}

pub(crate) fn default_transfer_syntaxes() -> Vec<String> {
    vec![
        uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
        uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
        uids::EXPLICIT_VR_BIG_ENDIAN.to_string(),
    ]
}

pub(crate) fn default_storage_sop_classes() -> Vec<String> {
    [
        uids::CT_IMAGE_STORAGE,
        uids::MR_IMAGE_STORAGE,
        uids::ENHANCED_MR_IMAGE_STORAGE,
        uids::ENHANCED_MR_COLOR_IMAGE_STORAGE,
        uids::PET_IMAGE_STORAGE,
        uids::RT_PLAN_STORAGE,
        uids::RT_ION_PLAN_STORAGE,
        uids::RT_STRUCTURE_SET_STORAGE,
        uids::RT_DOSE_STORAGE,
        uids::SPATIAL_REGISTRATION_STORAGE,
        uids::DEFORMABLE_SPATIAL_REGISTRATION_STORAGE,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_max_associations() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use dimse::types::uids;
use serde::Deserialize;

/// The `[relay]` table: local identity and the inbound listener
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_id")]
    pub id: String,
    #[serde(default = "default_ae_title")]
    pub ae_title: String,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Default destination root for received objects
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    #[serde(default = "default_max_associations")]
    pub max_associations: u32,
    #[serde(default = "default_max_pdu")]
    pub max_pdu: u32,
    #[serde(default = "default_association_timeout")]
    pub association_timeout_ms: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_dimse_timeout")]
    pub dimse_timeout_ms: u64,
    /// Incomplete network plans idle longer than this are dropped from memory
    #[serde(default = "default_stale_plan_secs")]
    pub stale_plan_secs: u64,
    /// Objects arriving this long after their plan was dispatched are forwarded as a follow-up
    #[serde(default = "default_late_object_window")]
    pub late_object_window_secs: u64,
    #[serde(default = "default_transfer_syntaxes")]
    pub accepted_transfer_syntaxes: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            id: default_id(),
            ae_title: default_ae_title(),
            bind_addr: default_bind_addr(),
            port: default_port(),
            storage_dir: default_storage_dir(),
            max_associations: default_max_associations(),
            max_pdu: default_max_pdu(),
            association_timeout_ms: default_association_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            dimse_timeout_ms: default_dimse_timeout(),
            stale_plan_secs: default_stale_plan_secs(),
            late_object_window_secs: default_late_object_window(),
            accepted_transfer_syntaxes: default_transfer_syntaxes(),
        }
    }
}

impl RelayConfig {
    pub fn stale_plan_after(&self) -> Duration {
        Duration::from_secs(self.stale_plan_secs)
    }

    pub fn late_object_window(&self) -> Duration {
        Duration::from_secs(self.late_object_window_secs)
    }
}

fn default_id() -> String {
    "rtrelay".to_string()
}

fn default_ae_title() -> String {
    "RTRELAY".to_string()
}

fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    dimse::DEFAULT_DIMSE_PORT
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("./received")
}

fn default_max_associations() -> u32 {
    10
}

fn default_max_pdu() -> u32 {
    65536
}

fn default_association_timeout() -> u64 {
    30_000
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_dimse_timeout() -> u64 {
    60_000
}

fn default_stale_plan_secs() -> u64 {
    3600
}

fn default_late_object_window() -> u64 {
    300
}

fn default_transfer_syntaxes() -> Vec<String> {
    vec![
        uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
        uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
        uids::EXPLICIT_VR_BIG_ENDIAN.to_string(),
    ]
}

/// The `[sender]` table
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SenderConfig {
    /// Upper bound on concurrently running forward jobs
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// 0 disables the heartbeat
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            heartbeat_interval_secs: default_heartbeat_interval(),
        }
    }
}

impl SenderConfig {
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_secs > 0).then(|| Duration::from_secs(self.heartbeat_interval_secs))
    }
}

fn default_workers() -> usize {
    4
}

fn default_heartbeat_interval() -> u64 {
    120
}

/// The `[watcher]` table
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WatcherConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_watch_dir")]
    pub watch_dir: PathBuf,
    /// Defaults to `<watch_dir>/failed`
    #[serde(default)]
    pub failed_dir: Option<PathBuf>,
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_secs: u64,
    #[serde(default = "default_empty_dir_grace")]
    pub empty_dir_grace_secs: u64,
    /// Empty means every file is a candidate
    #[serde(default = "default_file_extensions")]
    pub file_extensions: Vec<String>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            watch_dir: default_watch_dir(),
            failed_dir: None,
            scan_interval_secs: default_scan_interval(),
            inactivity_timeout_secs: default_inactivity_timeout(),
            empty_dir_grace_secs: default_empty_dir_grace(),
            file_extensions: default_file_extensions(),
        }
    }
}

impl WatcherConfig {
    pub fn failed_dir(&self) -> PathBuf {
        self.failed_dir
            .clone()
            .unwrap_or_else(|| self.watch_dir.join("failed"))
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs.max(1))
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn empty_dir_grace(&self) -> Duration {
        Duration::from_secs(self.empty_dir_grace_secs)
    }
}

fn default_watch_dir() -> PathBuf {
    PathBuf::from("./import")
}

fn default_scan_interval() -> u64 {
    10
}

fn default_inactivity_timeout() -> u64 {
    13
}

fn default_empty_dir_grace() -> u64 {
    180
}

fn default_file_extensions() -> Vec<String> {
    vec!["dcm".to_string()]
}

/// The `[conversion]` table: optional external multi-frame splitter
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConversionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub tool: Option<PathBuf>,
    /// Extra arguments placed before `--out-dir`
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_conversion_timeout")]
    pub timeout_secs: u64,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tool: None,
            args: Vec::new(),
            timeout_secs: default_conversion_timeout(),
        }
    }
}

fn default_conversion_timeout() -> u64 {
    120
}

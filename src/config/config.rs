use std::collections::HashSet;
use std::path::{Path, PathBuf};

use dimse::config::validate_ae_title;
use dimse::DimseConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::config::logging_config::LoggingConfig;
use crate::config::relay_config::{ConversionConfig, RelayConfig, SenderConfig, WatcherConfig};
use crate::models::Node;
use crate::rules::ForwardingConfig;
use crate::trust::TrustEntry;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("relay id must not be empty")]
    InvalidRelayId,

    #[error("invalid AE title for {owner}: {reason}")]
    InvalidAeTitle { owner: String, reason: String },

    #[error("invalid port for {0}: must be 1-65535")]
    InvalidPort(String),

    #[error("sender.workers must be at least 1")]
    NoWorkers,

    #[error("duplicate node name '{0}'")]
    DuplicateNode(String),

    #[error("duplicate trust entry for AE '{0}'")]
    DuplicateTrust(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Root of the relay configuration file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub sender: SenderConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub forwarding: ForwardingConfig,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub trust: Vec<TrustEntry>,
    #[serde(default)]
    pub conversion: ConversionConfig,
}

impl Config {
    /// Read, parse and validate a TOML config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.relay.id.trim().is_empty() {
            return Err(ConfigError::InvalidRelayId);
        }
        check_ae_title("relay", &self.relay.ae_title)?;
        if self.relay.port == 0 {
            return Err(ConfigError::InvalidPort("relay".into()));
        }
        if !(16384..=131072).contains(&self.relay.max_pdu) {
            return Err(ConfigError::Invalid(
                "relay.max_pdu must be between 16384 and 131072".into(),
            ));
        }
        if self.relay.max_associations == 0 {
            return Err(ConfigError::Invalid(
                "relay.max_associations must be at least 1".into(),
            ));
        }
        if self.relay.accepted_transfer_syntaxes.is_empty() {
            return Err(ConfigError::Invalid(
                "relay.accepted_transfer_syntaxes must not be empty".into(),
            ));
        }
        if self.sender.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }

        let mut names = HashSet::new();
        for node in &self.nodes {
            if node.name.trim().is_empty() {
                return Err(ConfigError::Invalid("node name must not be empty".into()));
            }
            if !names.insert(node.name.as_str()) {
                return Err(ConfigError::DuplicateNode(node.name.clone()));
            }
            check_ae_title(&format!("node '{}'", node.name), &node.ae_title)?;
            if let Some(calling) = &node.calling_ae_title {
                check_ae_title(&format!("node '{}' calling AE", node.name), calling)?;
            }
            if node.port == 0 {
                return Err(ConfigError::InvalidPort(format!("node '{}'", node.name)));
            }
            if node.host.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "node '{}' has an empty host",
                    node.name
                )));
            }
        }

        let mut trusted = HashSet::new();
        for entry in &self.trust {
            if !trusted.insert(entry.ae_title.as_str()) {
                return Err(ConfigError::DuplicateTrust(entry.ae_title.clone()));
            }
        }

        if self.conversion.enabled && self.conversion.tool.is_none() {
            return Err(ConfigError::Invalid(
                "conversion.enabled requires conversion.tool".into(),
            ));
        }

        for rule in self.forwarding.rules.iter().filter(|r| r.source_ae.is_empty()) {
            tracing::warn!("Rule '{}' has an empty source_ae and will never match", rule.name);
        }
        for (rule, target) in self.unknown_rule_targets() {
            tracing::warn!("Rule '{}' targets unknown node '{}'", rule, target);
        }
        Ok(())
    }

    /// (rule, target) pairs whose target names no configured node
    pub fn unknown_rule_targets(&self) -> Vec<(String, String)> {
        self.forwarding
            .rules
            .iter()
            .flat_map(|rule| {
                rule.targets
                    .iter()
                    .filter(|t| !self.nodes.iter().any(|n| &n.name == *t))
                    .map(move |t| (rule.name.clone(), t.clone()))
            })
            .collect()
    }

    /// Sections of `next` that differ from `self` in settings read only at startup
    pub fn restart_required(&self, next: &Config) -> Vec<&'static str> {
        // Fields the running relay reads from each new snapshot.
        let fixed = |relay: &RelayConfig| RelayConfig {
            storage_dir: PathBuf::new(),
            stale_plan_secs: 0,
            late_object_window_secs: 0,
            ..relay.clone()
        };
        let mut sections = Vec::new();
        if fixed(&self.relay) != fixed(&next.relay) {
            sections.push("relay");
        }
        if self.logging != next.logging {
            sections.push("logging");
        }
        if self.sender != next.sender {
            sections.push("sender");
        }
        if self.watcher != next.watcher {
            sections.push("watcher");
        }
        if self.conversion != next.conversion {
            sections.push("conversion");
        }
        sections
    }

    /// Settings for the DIMSE acceptor and requestor
    pub fn dimse_config(&self) -> DimseConfig {
        DimseConfig {
            local_aet: self.relay.ae_title.clone(),
            bind_addr: self.relay.bind_addr,
            port: self.relay.port,
            max_pdu: self.relay.max_pdu,
            connect_timeout_ms: self.relay.connect_timeout_ms,
            association_timeout_ms: self.relay.association_timeout_ms,
            dimse_timeout_ms: self.relay.dimse_timeout_ms,
            preferred_transfer_syntaxes: self.relay.accepted_transfer_syntaxes.clone(),
            max_associations: self.relay.max_associations,
            ..DimseConfig::default()
        }
    }
}

fn check_ae_title(owner: &str, aet: &str) -> Result<(), ConfigError> {
    validate_ae_title(aet).map_err(|e| ConfigError::InvalidAeTitle {
        owner: owner.to_string(),
        reason: e.to_string(),
    })
}

//! Immutable configuration snapshots
//!
//! Components read `SnapshotHandle::current()` at the start of a session,
//! scan cycle or dispatch and keep that `Arc` for the duration. A reload or
//! an enable/disable toggle publishes a new snapshot; nothing is mutated in place.

use std::sync::Arc;

use tokio::sync::watch;

use crate::config::config::{Config, ConfigError};
use crate::rules::RuleEngine;
use crate::trust::TrustFilter;

#[derive(Debug)]
pub struct Snapshot {
    pub config: Config,
    pub trust: TrustFilter,
    pub rules: RuleEngine,
    /// Increases by one with every published snapshot
    pub version: u64,
}

impl Snapshot {
    /// Compile a config that has already been validated
    pub fn build(config: Config, version: u64) -> Self {
        let trust = TrustFilter::new(&config.trust, config.relay.storage_dir.clone());
        let rules = RuleEngine::new(&config.forwarding, &config.nodes);
        Self {
            config,
            trust,
            rules,
            version,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotHandle {
    tx: Arc<watch::Sender<Arc<Snapshot>>>,
}

impl SnapshotHandle {
    pub fn new(config: Config) -> Self {
        let (tx, _) = watch::channel(Arc::new(Snapshot::build(config, 1)));
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> Arc<Snapshot> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.tx.subscribe()
    }

    /// Validate `config` and publish it; an invalid config leaves the current snapshot in place
    pub fn replace(&self, config: Config) -> Result<Arc<Snapshot>, ConfigError> {
        config.validate()?;
        Ok(self.publish(config))
    }

    /// Publish a copy of the current config with one node enabled or disabled.
    /// Returns false when no node has that name.
    pub fn set_node_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut config = self.current().config.clone();
        let Some(node) = config.nodes.iter_mut().find(|n| n.name == name) else {
            return false;
        };
        node.enabled = enabled;
        self.publish(config);
        true
    }

    /// Same as [`set_node_enabled`](Self::set_node_enabled) for a forwarding rule
    pub fn set_rule_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut config = self.current().config.clone();
        let Some(rule) = config.forwarding.rules.iter_mut().find(|r| r.name == name) else {
            return false;
        };
        rule.enabled = enabled;
        self.publish(config);
        true
    }

    fn publish(&self, config: Config) -> Arc<Snapshot> {
        self.tx.send_modify(|current| {
            *current = Arc::new(Snapshot::build(config, current.version + 1));
        });
        let snapshot = self.current();
        tracing::info!("Published configuration snapshot v{}", snapshot.version);
        snapshot
    }
}

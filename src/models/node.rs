use dimse::RemoteNode;
use serde::{Deserialize, Serialize};

/// A forwarding destination
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Called AE title of the destination
    pub ae_title: String,
    /// Calling AE title used towards this node; the relay AE title when unset
    #[serde(default)]
    pub calling_ae_title: Option<String>,
    pub host: String,
    pub port: u16,
}

impl Node {
    /// Network view of the node used by the DIMSE SCU
    pub fn remote(&self, default_calling_ae: &str) -> RemoteNode {
        let calling = self
            .calling_ae_title
            .clone()
            .unwrap_or_else(|| default_calling_ae.to_string());
        RemoteNode::new(&self.ae_title, &self.host, self.port).with_calling_ae_title(calling)
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}@{}:{})", self.name, self.ae_title, self.host, self.port)
    }
}

fn default_enabled() -> bool {
    true
}

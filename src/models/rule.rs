use serde::{Deserialize, Serialize};

/// A forwarding rule: origin AE plus label substring mapped to target nodes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rule {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Exact originating AE title, or `IMPORT_FOLDER` for watch-folder plans.
    /// There is no wildcard: an empty value matches nothing.
    pub source_ae: String,
    /// Substring of the plan label; empty matches every label
    #[serde(default)]
    pub plan_label_match: String,
    /// Node names, in configuration order
    #[serde(default)]
    pub targets: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

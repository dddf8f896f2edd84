//! Inbound peer allow-list

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// One allow-list entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrustEntry {
    pub ae_title: String,
    #[serde(default = "default_allowed")]
    pub allowed: bool,
    /// Storage root for this peer; relative paths resolve against the relay storage dir
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

fn default_allowed() -> bool {
    true
}

/// Deny-by-default lookup of calling AE titles
#[derive(Debug, Clone)]
pub struct TrustFilter {
    entries: HashMap<String, TrustEntry>,
    default_root: PathBuf,
}

impl TrustFilter {
    pub fn new(entries: &[TrustEntry], default_root: impl Into<PathBuf>) -> Self {
        Self {
            entries: entries
                .iter()
                .map(|e| (e.ae_title.clone(), e.clone()))
                .collect(),
            default_root: default_root.into(),
        }
    }

    /// Exact, case-sensitive match against an allowed entry
    pub fn is_trusted(&self, identity: &str) -> bool {
        self.entries.get(identity).is_some_and(|e| e.allowed)
    }

    /// Storage root for objects from `identity`
    pub fn resolve_directory(&self, identity: &str) -> PathBuf {
        match self.entries.get(identity).and_then(|e| e.directory.as_deref()) {
            Some(dir) if dir.is_absolute() => dir.to_path_buf(),
            Some(dir) => self.default_root.join(dir),
            None => self.default_root.clone(),
        }
    }

    pub fn default_root(&self) -> &Path {
        &self.default_root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> TrustFilter {
        TrustFilter::new(
            &[
                TrustEntry {
                    ae_title: "FOLLOW".into(),
                    allowed: true,
                    directory: Some(PathBuf::from("follow")),
                },
                TrustEntry {
                    ae_title: "TPS".into(),
                    allowed: true,
                    directory: Some(PathBuf::from("/srv/tps")),
                },
                TrustEntry {
                    ae_title: "BLOCKED".into(),
                    allowed: false,
                    directory: None,
                },
            ],
            "/data/received",
        )
    }

    #[test]
    fn test_deny_by_default() {
        let filter = filter();
        assert!(filter.is_trusted("FOLLOW"));
        assert!(!filter.is_trusted("BLOCKED"));
        assert!(!filter.is_trusted("UNKNOWN"));
        assert!(!filter.is_trusted("follow"));
    }

    #[test]
    fn test_directory_override() {
        let filter = filter();
        assert_eq!(
            filter.resolve_directory("FOLLOW"),
            PathBuf::from("/data/received/follow")
        );
        assert_eq!(filter.resolve_directory("TPS"), PathBuf::from("/srv/tps"));
        assert_eq!(
            filter.resolve_directory("BLOCKED"),
            PathBuf::from("/data/received")
        );
    }
}

//! Rule evaluation: which nodes a plan goes to

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::{Node, Plan, Rule};

/// `[forwarding]` table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForwardingConfig {
    /// Global switch; when off nothing is forwarded
    #[serde(default = "default_true")]
    pub rules_enabled: bool,
    #[serde(default = "default_true")]
    pub label_case_sensitive: bool,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            rules_enabled: true,
            label_case_sensitive: true,
            rules: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Result of evaluating one plan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Evaluation {
    pub matched_rules: Vec<String>,
    /// Enabled nodes without duplicates, in first-match order
    pub destinations: Vec<Node>,
}

impl Evaluation {
    pub fn destination_names(&self) -> Vec<String> {
        self.destinations.iter().map(|n| n.name.clone()).collect()
    }
}

/// Read-only view over rules and nodes
#[derive(Debug, Clone)]
pub struct RuleEngine {
    rules: Vec<Rule>,
    nodes: HashMap<String, Node>,
    rules_enabled: bool,
    case_sensitive: bool,
}

impl RuleEngine {
    pub fn new(forwarding: &ForwardingConfig, nodes: &[Node]) -> Self {
        Self {
            rules: forwarding.rules.clone(),
            nodes: nodes.iter().map(|n| (n.name.clone(), n.clone())).collect(),
            rules_enabled: forwarding.rules_enabled,
            case_sensitive: forwarding.label_case_sensitive,
        }
    }

    pub fn evaluate(&self, plan: &Plan) -> Evaluation {
        self.evaluate_identity(plan.origin.identity(), &plan.label)
    }

    /// Union of the targets of every enabled rule matching `origin` and `label`
    pub fn evaluate_identity(&self, origin: &str, label: &str) -> Evaluation {
        let mut evaluation = Evaluation::default();
        if !self.rules_enabled {
            debug!("Forwarding rules are globally disabled");
            return evaluation;
        }

        for rule in self.rules.iter().filter(|r| r.enabled) {
            if !self.rule_matches(rule, origin, label) {
                continue;
            }
            evaluation.matched_rules.push(rule.name.clone());

            for target in &rule.targets {
                match self.nodes.get(target) {
                    Some(node) if node.enabled => {
                        if !evaluation.destinations.iter().any(|n| n.name == node.name) {
                            evaluation.destinations.push(node.clone());
                        }
                    }
                    Some(_) => debug!("Rule '{}': target '{}' is disabled", rule.name, target),
                    None => warn!("Rule '{}' targets unknown node '{}'", rule.name, target),
                }
            }
        }
        evaluation
    }

    /// An empty `source_ae` matches no origin
    pub fn rule_matches(&self, rule: &Rule, origin: &str, label: &str) -> bool {
        if rule.source_ae.is_empty() || rule.source_ae != origin {
            return false;
        }
        if rule.plan_label_match.is_empty() {
            return true;
        }
        if self.case_sensitive {
            label.contains(&rule.plan_label_match)
        } else {
            label
                .to_lowercase()
                .contains(&rule.plan_label_match.to_lowercase())
        }
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn enabled_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values().filter(|n| n.enabled)
    }
}

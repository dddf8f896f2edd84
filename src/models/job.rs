use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use super::node::Node;
use super::object::{DicomObject, Modality};
use super::plan::{Origin, PlanKey, PlanState};

/// Why a forward job to one destination failed
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
pub enum SendFailure {
    #[error("destination unreachable: {0}")]
    DestinationUnreachable(String),

    #[error("association rejected: {0}")]
    AssociationRejected(String),

    #[error("object {instance_uid} rejected: {reason}")]
    ObjectRejected { instance_uid: String, reason: String },

    #[error("transfer interrupted: {0}")]
    Transfer(String),

    #[error("file system error: {0}")]
    FileSystem(String),

    #[error("cancelled by shutdown")]
    Cancelled,
}

/// One unit of outbound work: a plan's objects for one destination
#[derive(Debug, Clone)]
pub struct ForwardJob {
    pub id: Uuid,
    pub plan_key: PlanKey,
    pub node: Node,
    pub objects: Vec<DicomObject>,
    pub attempts: u32,
}

impl ForwardJob {
    pub fn new(plan_key: PlanKey, node: Node, objects: Vec<DicomObject>) -> Self {
        Self {
            id: Uuid::new_v4(),
            plan_key,
            node,
            objects,
            attempts: 0,
        }
    }
}

/// An object accepted by a destination
#[derive(Debug, Clone, Serialize)]
pub struct SentObject {
    pub instance_uid: String,
    pub modality: Modality,
    pub sent_at: DateTime<Utc>,
}

/// Terminal result of a forward job
#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub node: String,
    pub attempts: u32,
    pub sent: Vec<SentObject>,
    /// Objects the job was meant to send
    pub total: usize,
    pub failure: Option<SendFailure>,
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// Aggregate outcome of forwarding one plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlanOutcome {
    Forwarded,
    PartiallyForwarded,
    Failed,
    /// No rule selected a destination
    NotForwarded,
}

impl PlanOutcome {
    pub fn from_jobs<'a>(outcomes: impl IntoIterator<Item = &'a JobOutcome>) -> Self {
        let (mut ok, mut failed) = (0usize, 0usize);
        for outcome in outcomes {
            if outcome.is_success() {
                ok += 1;
            } else {
                failed += 1;
            }
        }
        match (ok, failed) {
            (0, 0) => PlanOutcome::NotForwarded,
            (_, 0) => PlanOutcome::Forwarded,
            (0, _) => PlanOutcome::Failed,
            _ => PlanOutcome::PartiallyForwarded,
        }
    }

    pub fn as_state(self) -> PlanState {
        match self {
            PlanOutcome::Forwarded => PlanState::Forwarded,
            PlanOutcome::PartiallyForwarded => PlanState::PartiallyForwarded,
            PlanOutcome::Failed => PlanState::Failed,
            PlanOutcome::NotForwarded => PlanState::NotForwarded,
        }
    }
}

impl std::fmt::Display for PlanOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PlanOutcome::Forwarded => "forwarded",
            PlanOutcome::PartiallyForwarded => "partially-forwarded",
            PlanOutcome::Failed => "failed",
            PlanOutcome::NotForwarded => "not-forwarded",
        })
    }
}

/// Everything known about one plan dispatch
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    pub plan_key: PlanKey,
    pub label: String,
    pub origin: Origin,
    pub object_count: usize,
    pub matched_rules: Vec<String>,
    /// Keyed by node name
    pub outcomes: BTreeMap<String, JobOutcome>,
    pub outcome: PlanOutcome,
}

impl DispatchReport {
    pub fn failed_nodes(&self) -> Vec<&str> {
        self.outcomes
            .values()
            .filter(|o| !o.is_success())
            .map(|o| o.node.as_str())
            .collect()
    }

    /// Every computed destination accepted the whole plan
    pub fn all_succeeded(&self) -> bool {
        self.outcome == PlanOutcome::Forwarded
    }

    /// Human readable per-destination summary
    pub fn summary_lines(&self) -> Vec<String> {
        self.outcomes
            .values()
            .map(|o| match &o.failure {
                None => format!("{}: OK ({} objects)", o.node, o.sent.len()),
                Some(f) => format!(
                    "{}: FAILED after {}/{} objects: {}",
                    o.node,
                    o.sent.len(),
                    o.total,
                    f
                ),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(node: &str, failure: Option<SendFailure>) -> JobOutcome {
        JobOutcome {
            node: node.into(),
            attempts: 1,
            sent: Vec::new(),
            total: 3,
            failure,
        }
    }

    #[test]
    fn test_plan_outcome_aggregation() {
        let ok = outcome("a", None);
        let bad = outcome("b", Some(SendFailure::DestinationUnreachable("refused".into())));

        assert_eq!(PlanOutcome::from_jobs([&ok]), PlanOutcome::Forwarded);
        assert_eq!(PlanOutcome::from_jobs([&bad]), PlanOutcome::Failed);
        assert_eq!(PlanOutcome::from_jobs([&ok, &bad]), PlanOutcome::PartiallyForwarded);
        assert_eq!(PlanOutcome::from_jobs(std::iter::empty()), PlanOutcome::NotForwarded);
    }

    #[test]
    fn test_summary_lines() {
        let mut outcomes = BTreeMap::new();
        outcomes.insert("a".to_string(), outcome("a", None));
        outcomes.insert(
            "b".to_string(),
            outcome("b", Some(SendFailure::AssociationRejected("permanent".into()))),
        );
        let report = DispatchReport {
            plan_key: PlanKey::new("P", "1"),
            label: String::new(),
            origin: Origin::LocalImport,
            object_count: 3,
            matched_rules: vec!["r".into()],
            outcomes,
            outcome: PlanOutcome::PartiallyForwarded,
        };
        assert_eq!(report.failed_nodes(), vec!["b"]);
        let lines = report.summary_lines();
        assert!(lines[0].starts_with("a: OK"));
        assert!(lines[1].contains("association rejected"));
    }
}

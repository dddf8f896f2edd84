use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::object::{DicomObject, Modality};

/// Origin identity of every plan assembled from the watch folder
pub const LOCAL_IMPORT_IDENTITY: &str = "IMPORT_FOLDER";

/// Identity of a plan: patient plus study
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PlanKey {
    pub patient_id: String,
    pub study_uid: String,
}

impl PlanKey {
    pub fn new(patient_id: impl Into<String>, study_uid: impl Into<String>) -> Self {
        Self {
            patient_id: patient_id.into(),
            study_uid: study_uid.into(),
        }
    }

    pub fn of(object: &DicomObject) -> Self {
        Self::new(&object.patient_id, &object.study_uid)
    }
}

impl std::fmt::Display for PlanKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.patient_id, self.study_uid)
    }
}

/// Where a plan came from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Origin {
    /// Received from a peer with this calling AE title
    Peer(String),
    /// Picked up from the watch folder
    LocalImport,
}

impl Origin {
    /// Identity string compared against rule sources
    pub fn identity(&self) -> &str {
        match self {
            Origin::Peer(ae) => ae,
            Origin::LocalImport => LOCAL_IMPORT_IDENTITY,
        }
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.identity())
    }
}

/// Lifecycle of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanState {
    Assembling,
    Complete,
    Dispatched,
    Forwarded,
    PartiallyForwarded,
    Failed,
    /// Complete but no rule selected a destination
    NotForwarded,
}

impl PlanState {
    pub fn can_transition_to(self, next: PlanState) -> bool {
        use PlanState::*;
        matches!(
            (self, next),
            (Assembling, Complete)
                | (Complete, Dispatched)
                | (Complete, NotForwarded)
                | (Dispatched, Forwarded)
                | (Dispatched, PartiallyForwarded)
                | (Dispatched, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PlanState::Forwarded
                | PlanState::PartiallyForwarded
                | PlanState::Failed
                | PlanState::NotForwarded
        )
    }
}

/// What made a plan complete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionTrigger {
    /// A plan-type object arrived
    Content,
    /// No new files within the inactivity timeout
    Inactivity,
    /// Objects for a plan that was already dispatched
    FollowUp,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("plan {key}: illegal transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub key: PlanKey,
    pub from: PlanState,
    pub to: PlanState,
}

/// The forwardable unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub key: PlanKey,
    /// RT Plan Label, empty until a plan object carrying one arrives
    pub label: String,
    pub origin: Origin,
    pub received_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    objects: BTreeMap<Modality, Vec<DicomObject>>,
    state: PlanState,
    completion: Option<CompletionTrigger>,
}

impl Plan {
    pub fn new(key: PlanKey, origin: Origin) -> Self {
        let now = Utc::now();
        Self {
            key,
            label: String::new(),
            origin,
            received_at: now,
            updated_at: now,
            objects: BTreeMap::new(),
            state: PlanState::Assembling,
            completion: None,
        }
    }

    pub fn state(&self) -> PlanState {
        self.state
    }

    pub fn completion(&self) -> Option<CompletionTrigger> {
        self.completion
    }

    /// Add an object; an object with the same SOP Instance UID replaces the earlier one.
    /// Returns false for a replacement.
    pub fn add_object(&mut self, object: DicomObject) -> bool {
        debug_assert_eq!(PlanKey::of(&object), self.key);
        self.updated_at = Utc::now();
        if self.label.is_empty() {
            if let Some(label) = object.plan_label.as_deref().filter(|l| !l.is_empty()) {
                self.label = label.to_string();
            }
        }

        let replaced = self.remove_instance(&object.instance_uid);
        self.objects.entry(object.modality).or_default().push(object);
        !replaced
    }

    /// Drop the object with this instance UID, if present
    pub fn remove_instance(&mut self, instance_uid: &str) -> bool {
        let mut removed = false;
        for list in self.objects.values_mut() {
            let before = list.len();
            list.retain(|o| o.instance_uid != instance_uid);
            removed |= list.len() != before;
        }
        self.objects.retain(|_, list| !list.is_empty());
        removed
    }

    /// Drop the object stored at `path`, if present
    pub fn remove_path(&mut self, path: &std::path::Path) -> bool {
        let instance = self
            .iter_objects()
            .find(|o| o.path == path)
            .map(|o| o.instance_uid.clone());
        match instance {
            Some(uid) => self.remove_instance(&uid),
            None => false,
        }
    }

    pub fn object_count(&self) -> usize {
        self.objects.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn objects_of(&self, modality: Modality) -> &[DicomObject] {
        self.objects.get(&modality).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_plan_object(&self) -> bool {
        !self.objects_of(Modality::Plan).is_empty()
    }

    fn iter_objects(&self) -> impl Iterator<Item = &DicomObject> {
        self.objects.values().flatten()
    }

    /// Objects in send order: imaging, structure sets, plans, doses, others.
    /// Within a modality, arrival order is kept.
    pub fn ordered_objects(&self) -> Vec<&DicomObject> {
        self.iter_objects().collect()
    }

    pub fn total_bytes(&self) -> u64 {
        self.iter_objects().map(|o| o.size_bytes).sum()
    }

    pub fn transition(&mut self, next: PlanState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                key: self.key.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    pub fn mark_complete(&mut self, trigger: CompletionTrigger) -> Result<(), InvalidTransition> {
        self.transition(PlanState::Complete)?;
        self.completion = Some(trigger);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::PathBuf;

    pub(crate) fn object(patient: &str, study: &str, modality: Modality, instance: &str) -> DicomObject {
        DicomObject {
            modality,
            modality_code: match modality {
                Modality::Imaging => "CT",
                Modality::StructureSet => "RTSTRUCT",
                Modality::Plan => "RTPLAN",
                Modality::Dose => "RTDOSE",
                Modality::Other => "REG",
            }
            .to_string(),
            patient_id: patient.to_string(),
            patient_name: None,
            study_uid: study.to_string(),
            series_uid: format!("{}.1", study),
            instance_uid: instance.to_string(),
            sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".to_string(),
            transfer_syntax: "1.2.840.10008.1.2.1".to_string(),
            plan_label: None,
            path: PathBuf::from(format!("/data/{}.dcm", instance)),
            size_bytes: 10,
            has_pixel_data: modality == Modality::Imaging,
            number_of_frames: 1,
        }
    }

    #[test]
    fn test_ordered_objects_follow_precedence() {
        let key = PlanKey::new("P1", "1.2");
        let mut plan = Plan::new(key, Origin::Peer("FOLLOW".into()));
        plan.add_object(object("P1", "1.2", Modality::Dose, "d1"));
        plan.add_object(object("P1", "1.2", Modality::Plan, "p1"));
        plan.add_object(object("P1", "1.2", Modality::Imaging, "ct1"));
        plan.add_object(object("P1", "1.2", Modality::StructureSet, "s1"));
        plan.add_object(object("P1", "1.2", Modality::Imaging, "ct2"));

        let order: Vec<&str> = plan
            .ordered_objects()
            .iter()
            .map(|o| o.instance_uid.as_str())
            .collect();
        assert_eq!(order, vec!["ct1", "ct2", "s1", "p1", "d1"]);
        assert!(plan.has_plan_object());
    }

    #[test]
    fn test_duplicate_instance_replaces() {
        let mut plan = Plan::new(PlanKey::new("P1", "1.2"), Origin::LocalImport);
        assert!(plan.add_object(object("P1", "1.2", Modality::Imaging, "ct1")));
        assert!(!plan.add_object(object("P1", "1.2", Modality::Imaging, "ct1")));
        assert_eq!(plan.object_count(), 1);
        assert_eq!(plan.origin.identity(), LOCAL_IMPORT_IDENTITY);
    }

    #[test]
    fn test_label_taken_from_plan_object() {
        let mut plan = Plan::new(PlanKey::new("P1", "1.2"), Origin::LocalImport);
        let mut rtplan = object("P1", "1.2", Modality::Plan, "p1");
        rtplan.plan_label = Some("ADP_Fraction1".into());
        plan.add_object(rtplan);
        assert_eq!(plan.label, "ADP_Fraction1");
    }

    #[test]
    fn test_state_transitions() {
        let mut plan = Plan::new(PlanKey::new("P1", "1.2"), Origin::LocalImport);
        assert!(plan.transition(PlanState::Dispatched).is_err());
        plan.mark_complete(CompletionTrigger::Inactivity).unwrap();
        assert_eq!(plan.completion(), Some(CompletionTrigger::Inactivity));
        plan.transition(PlanState::Dispatched).unwrap();
        plan.transition(PlanState::PartiallyForwarded).unwrap();
        assert!(plan.state().is_terminal());
        assert!(plan.transition(PlanState::Forwarded).is_err());
    }
}

//! Plan assembly: grouping objects by patient and study
//!
//! The map lock is only held to look up or insert a plan; mutation happens
//! under the plan's own async mutex, so ingests for one identity are
//! serialized while different plans proceed independently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::models::{DicomObject, Modality, Origin, Plan, PlanKey, PlanState};
use crate::models::plan::CompletionTrigger;

/// How plans held by an assembler become complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionPolicy {
    /// At the first plan-type object
    Content,
    /// Only when the owner calls [`PlanAssembler::complete_by_inactivity`]
    Inactivity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestResult {
    pub key: PlanKey,
    /// False when the object replaced one with the same instance UID
    pub added: bool,
    /// This ingest moved the plan from assembling to complete
    pub newly_complete: bool,
    pub object_count: usize,
}

type SharedPlan = Arc<tokio::sync::Mutex<Plan>>;

#[derive(Debug)]
pub struct PlanAssembler {
    policy: CompletionPolicy,
    plans: Mutex<HashMap<PlanKey, SharedPlan>>,
}

impl PlanAssembler {
    pub fn new(policy: CompletionPolicy) -> Self {
        Self {
            policy,
            plans: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> CompletionPolicy {
        self.policy
    }

    fn entry(&self, key: &PlanKey, origin: &Origin) -> SharedPlan {
        let mut plans = self.plans.lock().unwrap_or_else(|e| e.into_inner());
        plans
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(plan = %key, origin = %origin, "New plan");
                Arc::new(tokio::sync::Mutex::new(Plan::new(key.clone(), origin.clone())))
            })
            .clone()
    }

    fn get(&self, key: &PlanKey) -> Option<SharedPlan> {
        self.plans
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// Add an object to the plan for its patient and study, creating the plan if needed
    pub async fn ingest(&self, object: DicomObject, origin: Origin) -> IngestResult {
        let key = PlanKey::of(&object);
        let shared = self.entry(&key, &origin);
        let mut plan = shared.lock().await;

        if plan.origin != origin {
            debug!(
                plan = %key,
                "Object from {} joins plan started by {}",
                origin,
                plan.origin
            );
        }

        let is_plan_object = object.modality == Modality::Plan;
        let added = plan.add_object(object);

        let newly_complete = self.policy == CompletionPolicy::Content
            && is_plan_object
            && plan.state() == PlanState::Assembling
            && plan.mark_complete(CompletionTrigger::Content).is_ok();

        IngestResult {
            key,
            added,
            newly_complete,
            object_count: plan.object_count(),
        }
    }

    /// Current state of a plan, without removing it
    pub async fn snapshot(&self, key: &PlanKey) -> Option<Plan> {
        let shared = self.get(key)?;
        let plan = shared.lock().await;
        Some(plan.clone())
    }

    /// Remove a plan and hand it to the caller
    pub async fn take(&self, key: &PlanKey) -> Option<Plan> {
        let shared = self
            .plans
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)?;
        // Wait for any in-flight ingest on this plan to finish.
        let plan = shared.lock().await;
        Some(plan.clone())
    }

    /// Complete an assembling plan whose earlier objects were already dispatched
    ///
    /// The plan inherits `label` when none of its own objects carried one.
    pub async fn complete_follow_up(&self, key: &PlanKey, label: &str) -> bool {
        let Some(shared) = self.get(key) else {
            return false;
        };
        let mut plan = shared.lock().await;
        if plan.state() != PlanState::Assembling {
            return false;
        }
        if plan.label.is_empty() {
            plan.label = label.to_string();
        }
        plan.mark_complete(CompletionTrigger::FollowUp).is_ok()
    }

    /// Remove a quiet plan, marking it complete by inactivity
    pub async fn complete_by_inactivity(&self, key: &PlanKey) -> Option<Plan> {
        let mut plan = self.take(key).await?;
        if plan.state() == PlanState::Assembling {
            // Assembling -> Complete is always legal.
            let _ = plan.mark_complete(CompletionTrigger::Inactivity);
        }
        Some(plan)
    }

    /// Forget the object stored at `path`; an emptied plan is dropped
    pub async fn remove_path(&self, key: &PlanKey, path: &std::path::Path) -> bool {
        let Some(shared) = self.get(key) else {
            return false;
        };
        let (removed, empty) = {
            let mut plan = shared.lock().await;
            (plan.remove_path(path), plan.is_empty())
        };
        if empty {
            let mut plans = self.plans.lock().unwrap_or_else(|e| e.into_inner());
            if plans.get(key).is_some_and(|p| Arc::ptr_eq(p, &shared)) {
                plans.remove(key);
            }
        }
        removed
    }

    /// Drop assembling plans that have not changed for `max_idle`.
    /// Plans that are currently being mutated are skipped.
    pub fn evict_stale(&self, max_idle: Duration) -> Vec<Plan> {
        let Ok(max_idle) = chrono::Duration::from_std(max_idle) else {
            return Vec::new();
        };
        let cutoff = Utc::now() - max_idle;
        let mut plans = self.plans.lock().unwrap_or_else(|e| e.into_inner());
        let mut evicted = Vec::new();

        plans.retain(|_, shared| match shared.try_lock() {
            Ok(plan) if plan.state() == PlanState::Assembling && plan.updated_at < cutoff => {
                evicted.push(plan.clone());
                false
            }
            _ => true,
        });
        evicted
    }

    pub fn len(&self) -> usize {
        self.plans.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<PlanKey> {
        self.plans
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

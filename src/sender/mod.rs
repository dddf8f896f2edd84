//! Outbound forwarding
//!
//! One [`ForwardJob`] per (plan, destination). Jobs run concurrently up to
//! the worker-pool size, shared by every plan. Within a job, objects go out
//! strictly in modality order over a single session; the first failure ends
//! that job and leaves other destinations untouched.

pub mod heartbeat;
pub mod transport;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::events::{EventBus, RelayEvent};
use crate::models::{
    DispatchReport, ForwardJob, JobOutcome, Node, Plan, PlanOutcome, PlanState, SendFailure,
    SentObject,
};
use crate::rules::RuleEngine;

pub use heartbeat::HeartbeatMonitor;
pub use transport::{DimseTransport, StoreTransport, TransportSession};

#[derive(Debug, Clone)]
pub struct Orchestrator {
    transport: Arc<dyn StoreTransport>,
    workers: Arc<Semaphore>,
    events: EventBus,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        transport: Arc<dyn StoreTransport>,
        workers: usize,
        events: EventBus,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            transport,
            workers: Arc::new(Semaphore::new(workers.max(1))),
            events,
            shutdown,
        }
    }

    pub fn transport(&self) -> Arc<dyn StoreTransport> {
        self.transport.clone()
    }

    /// Evaluate rules for a complete plan and send it to every destination.
    pub async fn forward(&self, rules: &RuleEngine, mut plan: Plan) -> DispatchReport {
        let evaluation = rules.evaluate(&plan);
        self.events.emit(RelayEvent::RulesEvaluated {
            plan: plan.key.clone(),
            matched_rules: evaluation.matched_rules.clone(),
            destinations: evaluation.destination_names(),
        });

        let mut report = DispatchReport {
            plan_key: plan.key.clone(),
            label: plan.label.clone(),
            origin: plan.origin.clone(),
            object_count: plan.object_count(),
            matched_rules: evaluation.matched_rules,
            outcomes: BTreeMap::new(),
            outcome: PlanOutcome::NotForwarded,
        };

        if evaluation.destinations.is_empty() {
            if let Err(e) = plan.transition(PlanState::NotForwarded) {
                warn!("{}", e);
            }
            info!(
                plan = %plan.key,
                origin = %plan.origin,
                "Plan '{}' received but not forwarded: no matching rule",
                plan.label
            );
            return report;
        }

        if let Err(e) = plan.transition(PlanState::Dispatched) {
            warn!("{}", e);
        }
        let plan = Arc::new(plan);
        report.outcomes = self.dispatch(plan.clone(), evaluation.destinations).await;
        report.outcome = PlanOutcome::from_jobs(report.outcomes.values());

        if let Ok(mut plan) = Arc::try_unwrap(plan) {
            if let Err(e) = plan.transition(report.outcome.as_state()) {
                warn!("{}", e);
            }
        }

        for line in report.summary_lines() {
            if report.all_succeeded() {
                info!(plan = %report.plan_key, "{}", line);
            } else {
                error!(plan = %report.plan_key, "{}", line);
            }
        }
        self.events.emit(RelayEvent::PlanDispatched {
            plan: report.plan_key.clone(),
            outcome: report.outcome,
        });
        report
    }

    /// Send `plan` to each destination; returns one outcome per node name.
    pub async fn dispatch(
        &self,
        plan: Arc<Plan>,
        destinations: Vec<Node>,
    ) -> BTreeMap<String, JobOutcome> {
        let objects: Vec<_> = plan.ordered_objects().into_iter().cloned().collect();
        let mut jobs = JoinSet::new();

        for node in &destinations {
            let job = ForwardJob::new(plan.key.clone(), node.clone(), objects.clone());
            let transport = self.transport.clone();
            let workers = self.workers.clone();
            let events = self.events.clone();
            let shutdown = self.shutdown.clone();

            jobs.spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return cancelled(&job, &events),
                    permit = workers.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return cancelled(&job, &events),
                    },
                };
                run_job(transport.as_ref(), job, &events, &shutdown).await
            });
        }

        let mut outcomes = BTreeMap::new();
        while let Some(joined) = jobs.join_next().await {
            match joined {
                Ok(outcome) => {
                    outcomes.insert(outcome.node.clone(), outcome);
                }
                Err(e) => error!(plan = %plan.key, "Forward job panicked: {}", e),
            }
        }
        for node in destinations {
            outcomes.entry(node.name.clone()).or_insert_with(|| JobOutcome {
                node: node.name,
                attempts: 1,
                sent: Vec::new(),
                total: objects.len(),
                failure: Some(SendFailure::Transfer("forward job did not complete".into())),
            });
        }
        outcomes
    }
}

fn cancelled(job: &ForwardJob, events: &EventBus) -> JobOutcome {
    let outcome = JobOutcome {
        node: job.node.name.clone(),
        attempts: job.attempts,
        sent: Vec::new(),
        total: job.objects.len(),
        failure: Some(SendFailure::Cancelled),
    };
    report_failure(job, &outcome, events);
    outcome
}

fn report_failure(job: &ForwardJob, outcome: &JobOutcome, events: &EventBus) {
    if let Some(failure) = &outcome.failure {
        events.emit(RelayEvent::SendFailed {
            plan: job.plan_key.clone(),
            node: job.node.name.clone(),
            sent: outcome.sent.len(),
            reason: failure.to_string(),
        });
    }
}

/// Run one job to a terminal outcome
async fn run_job(
    transport: &dyn StoreTransport,
    mut job: ForwardJob,
    events: &EventBus,
    shutdown: &CancellationToken,
) -> JobOutcome {
    job.attempts += 1;
    events.emit(RelayEvent::SendStarted {
        plan: job.plan_key.clone(),
        node: job.node.name.clone(),
        objects: job.objects.len(),
    });

    let mut outcome = JobOutcome {
        node: job.node.name.clone(),
        attempts: job.attempts,
        sent: Vec::with_capacity(job.objects.len()),
        total: job.objects.len(),
        failure: None,
    };

    let refs: Vec<_> = job.objects.iter().collect();
    let opened = tokio::select! {
        biased;
        _ = shutdown.cancelled() => Err(SendFailure::Cancelled),
        opened = transport.open(&job.node, &refs) => opened,
    };
    let mut session = match opened {
        Ok(session) => session,
        Err(failure) => {
            outcome.failure = Some(failure);
            report_failure(&job, &outcome, events);
            return outcome;
        }
    };

    for object in &job.objects {
        let stored = tokio::select! {
            biased;
            _ = shutdown.cancelled() => Err(SendFailure::Cancelled),
            stored = session.store(object) => stored,
        };
        match stored {
            Ok(()) => outcome.sent.push(SentObject {
                instance_uid: object.instance_uid.clone(),
                modality: object.modality,
                sent_at: Utc::now(),
            }),
            Err(failure) => {
                session.abort().await;
                outcome.failure = Some(failure);
                report_failure(&job, &outcome, events);
                return outcome;
            }
        }
    }

    // Everything was accepted; a failed release does not undo that.
    if let Err(e) = session.release().await {
        warn!(node = %job.node.name, "Session release failed: {}", e);
    }
    events.emit(RelayEvent::SendSucceeded {
        plan: job.plan_key.clone(),
        node: job.node.name.clone(),
        objects: outcome.sent.len(),
    });
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::plan::tests::object;
    use crate::models::{Modality, Origin, PlanKey};
    use crate::rules::ForwardingConfig;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct Recording {
        refuse: Vec<String>,
        reject_instance: Option<String>,
        stored: Mutex<Vec<(String, String)>>,
    }

    struct Session {
        node: String,
        parent: Arc<Recording>,
    }

    #[derive(Debug)]
    struct RecordingTransport(Arc<Recording>);

    #[async_trait]
    impl StoreTransport for RecordingTransport {
        async fn open(
            &self,
            node: &Node,
            _objects: &[&crate::models::DicomObject],
        ) -> Result<Box<dyn TransportSession>, SendFailure> {
            if self.0.refuse.contains(&node.name) {
                return Err(SendFailure::DestinationUnreachable("refused".into()));
            }
            Ok(Box::new(Session {
                node: node.name.clone(),
                parent: self.0.clone(),
            }))
        }

        async fn echo(&self, _node: &Node) -> Result<(), SendFailure> {
            Ok(())
        }
    }

    #[async_trait]
    impl TransportSession for Session {
        async fn store(&mut self, object: &crate::models::DicomObject) -> Result<(), SendFailure> {
            if self.parent.reject_instance.as_deref() == Some(object.instance_uid.as_str()) {
                return Err(SendFailure::ObjectRejected {
                    instance_uid: object.instance_uid.clone(),
                    reason: "status 0xA900".into(),
                });
            }
            self.parent
                .stored
                .lock()
                .unwrap()
                .push((self.node.clone(), object.instance_uid.clone()));
            Ok(())
        }

        async fn release(self: Box<Self>) -> Result<(), SendFailure> {
            Ok(())
        }

        async fn abort(self: Box<Self>) {}
    }

    fn node(name: &str) -> Node {
        Node {
            name: name.into(),
            enabled: true,
            ae_title: name.to_uppercase(),
            calling_ae_title: None,
            host: "127.0.0.1".into(),
            port: 104,
        }
    }

    fn plan() -> Plan {
        let mut plan = Plan::new(PlanKey::new("P1", "1.1"), Origin::Peer("FOLLOW".into()));
        plan.add_object(object("P1", "1.1", Modality::Dose, "dose"));
        plan.add_object(object("P1", "1.1", Modality::Plan, "plan"));
        plan.add_object(object("P1", "1.1", Modality::Imaging, "ct"));
        plan.mark_complete(crate::models::plan::CompletionTrigger::Content)
            .unwrap();
        plan
    }

    fn orchestrator(recording: Arc<Recording>) -> Orchestrator {
        Orchestrator::new(
            Arc::new(RecordingTransport(recording)),
            2,
            EventBus::default(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_reject_mid_plan_stops_job() {
        let recording = Arc::new(Recording {
            reject_instance: Some("plan".into()),
            ..Default::default()
        });
        let outcomes = orchestrator(recording.clone())
            .dispatch(Arc::new(plan()), vec![node("a")])
            .await;

        let outcome = &outcomes["a"];
        assert_eq!(outcome.sent.len(), 1);
        assert!(matches!(
            outcome.failure,
            Some(SendFailure::ObjectRejected { .. })
        ));
        // The dose after the rejected plan is never sent.
        assert_eq!(
            *recording.stored.lock().unwrap(),
            vec![("a".to_string(), "ct".to_string())]
        );
    }

    #[tokio::test]
    async fn test_forward_without_rules_is_not_forwarded() {
        let recording = Arc::new(Recording::default());
        let rules = RuleEngine::new(&ForwardingConfig::default(), &[node("a")]);
        let report = orchestrator(recording.clone()).forward(&rules, plan()).await;
        assert_eq!(report.outcome, PlanOutcome::NotForwarded);
        assert!(report.outcomes.is_empty());
        assert!(recording.stored.lock().unwrap().is_empty());
    }

    /// Counts sessions that are open at the same time
    #[derive(Debug, Default)]
    struct Gauge {
        open: std::sync::atomic::AtomicUsize,
        peak: std::sync::atomic::AtomicUsize,
        stored: std::sync::atomic::AtomicUsize,
    }

    impl Gauge {
        fn enter(&self) {
            use std::sync::atomic::Ordering::SeqCst;
            let now = self.open.fetch_add(1, SeqCst) + 1;
            self.peak.fetch_max(now, SeqCst);
        }

        fn leave(&self) {
            self.open.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[derive(Debug)]
    struct GaugedTransport(Arc<Gauge>);

    struct GaugedSession(Arc<Gauge>);

    #[async_trait]
    impl StoreTransport for GaugedTransport {
        async fn open(
            &self,
            _node: &Node,
            _objects: &[&crate::models::DicomObject],
        ) -> Result<Box<dyn TransportSession>, SendFailure> {
            self.0.enter();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            Ok(Box::new(GaugedSession(self.0.clone())))
        }

        async fn echo(&self, _node: &Node) -> Result<(), SendFailure> {
            Ok(())
        }
    }

    #[async_trait]
    impl TransportSession for GaugedSession {
        async fn store(&mut self, _object: &crate::models::DicomObject) -> Result<(), SendFailure> {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            self.0.stored.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }

        async fn release(self: Box<Self>) -> Result<(), SendFailure> {
            self.0.leave();
            Ok(())
        }

        async fn abort(self: Box<Self>) {
            self.0.leave();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_worker_pool_bounds_concurrent_sessions() {
        use std::sync::atomic::Ordering::SeqCst;

        let gauge = Arc::new(Gauge::default());
        let orchestrator = Orchestrator::new(
            Arc::new(GaugedTransport(gauge.clone())),
            2,
            EventBus::default(),
            CancellationToken::new(),
        );
        let destinations = vec![node("a"), node("b"), node("c")];

        let mut second = plan();
        second.key = PlanKey::new("P2", "2.1");
        let (first, second) = tokio::join!(
            orchestrator.dispatch(Arc::new(plan()), destinations.clone()),
            orchestrator.dispatch(Arc::new(second), destinations),
        );

        assert!(first.values().chain(second.values()).all(|o| o.failure.is_none()));
        assert_eq!(gauge.stored.load(SeqCst), 2 * 3 * 3);
        assert_eq!(gauge.open.load(SeqCst), 0);
        let peak = gauge.peak.load(SeqCst);
        assert!(peak <= 2, "{} sessions were open at once", peak);
        assert_eq!(peak, 2);
    }

    #[tokio::test]
    async fn test_cancelled_jobs_report_cancelled() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let orchestrator = Orchestrator::new(
            Arc::new(RecordingTransport(Arc::new(Recording::default()))),
            1,
            EventBus::default(),
            shutdown,
        );
        let outcomes = orchestrator
            .dispatch(Arc::new(plan()), vec![node("a"), node("b")])
            .await;
        assert!(outcomes
            .values()
            .all(|o| o.failure == Some(SendFailure::Cancelled)));
    }
}

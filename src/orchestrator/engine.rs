//! Scenario Orchestrator
//!
//! Drives one run through its turns. Each turn executes the enabled phases in
//! order, folds their output into a new snapshot, commits the turn and
//! persists it. Between phases the orchestrator checks for pause, halt and
//! cancellation requests and for tripped budgets.
//!
//! Terminal outcomes:
//! - `Completed`: the configured turn count or stop condition was reached.
//! - `Halted`: a cost limit, the per-session turn cap or a stop request.
//!   The run can be resumed from its snapshot.
//! - `Failed`: a phase raised an error; the snapshot records its class and
//!   the last completed turn.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::control::{RunControl, RunSignal};
use super::event_bus::{EventBus, SimulationEvent};
use super::phases::{
    budget_halt, CommunicationPhase, DecisionPhase, PersistencePhase, Phase, PhaseContext, PhaseOutput,
    ValidationPhase, WorldUpdatePhase,
};
use super::prompt::{PlainComposer, PromptComposer};
use crate::config::ScenarioConfig;
use crate::error::{PhaseError, RunError};
use crate::gateway::GenerationGateway;
use crate::ledger::{BudgetMeter, BudgetScope};
use crate::state::{
    FailureInfo, HaltReason, MetadataUpdate, PhaseKind, ScenarioStatus, SnapshotStore, StateSnapshot, Transformation,
};
use crate::utils::CancelToken;

/// Why the turn loop stopped.
enum Stop {
    Complete,
    Halt(HaltReason),
    Fail(PhaseError),
}

pub struct Orchestrator {
    scenario: Arc<ScenarioConfig>,
    gateway: Arc<GenerationGateway>,
    meter: Option<Arc<BudgetMeter>>,
    events: Arc<EventBus>,
    composer: Arc<dyn PromptComposer>,
    store: Option<SnapshotStore>,
    control: RunControl,
    cancel: CancelToken,
    session_turn_limit: Option<u32>,
    labels: BTreeMap<String, String>,
    turn_phases: Vec<Box<dyn Phase>>,
    persistence: PersistencePhase,
}

impl Orchestrator {
    pub fn new(scenario: Arc<ScenarioConfig>, gateway: Arc<GenerationGateway>) -> Self {
        Self {
            scenario,
            gateway,
            meter: None,
            events: Arc::new(EventBus::new()),
            composer: Arc::new(PlainComposer),
            store: None,
            control: RunControl::new(),
            cancel: CancelToken::new(),
            session_turn_limit: None,
            labels: BTreeMap::new(),
            turn_phases: vec![
                Box::new(CommunicationPhase),
                Box::new(DecisionPhase),
                Box::new(WorldUpdatePhase),
                Box::new(ValidationPhase),
            ],
            persistence: PersistencePhase,
        }
    }

    /// Budget meter for the run. Without one, a meter is created from the
    /// scenario's cost limit and seeded with the snapshot's spend.
    pub fn with_meter(mut self, meter: Arc<BudgetMeter>) -> Self {
        self.meter = Some(meter);
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn with_composer(mut self, composer: Arc<dyn PromptComposer>) -> Self {
        self.composer = composer;
        self
    }

    pub fn with_store(mut self, store: SnapshotStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_control(mut self, control: RunControl) -> Self {
        self.control = control;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Halts (resumably) after this many turns in one session.
    pub fn with_session_turn_limit(mut self, turns: u32) -> Self {
        self.session_turn_limit = Some(turns);
        self
    }

    /// Recorded in the snapshot's metadata when a fresh run starts.
    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels.extend(labels);
        self
    }

    pub fn scenario(&self) -> &ScenarioConfig {
        &self.scenario
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn control(&self) -> &RunControl {
        &self.control
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Starts a fresh run under a new random id.
    pub async fn start(&self) -> Result<StateSnapshot, RunError> {
        self.start_with_id(Uuid::new_v4().to_string()).await
    }

    pub async fn start_with_id(&self, run_id: impl Into<String>) -> Result<StateSnapshot, RunError> {
        let labels = self.labels.iter().map(|(key, value)| {
            Transformation::UpdateMetadata(MetadataUpdate::Label {
                key: key.clone(),
                value: value.clone(),
            })
        });
        let snapshot = StateSnapshot::new(run_id, &self.scenario, Utc::now()).apply_all(labels)?;
        info!(
            "Starting run {} of scenario '{}' with {} actors",
            snapshot.run_id,
            snapshot.scenario_id,
            snapshot.actors.len()
        );
        self.events.publish(SimulationEvent::RunStarted {
            run_id: snapshot.run_id.clone(),
            scenario_id: snapshot.scenario_id.clone(),
            from_turn: 0,
            resumed: false,
        });
        let snapshot = self.set_status(&snapshot, ScenarioStatus::Running)?;
        let meter = self.meter_for(&snapshot);
        Ok(self.drive(snapshot, meter).await)
    }

    /// Continues a paused, halted or interrupted run from its snapshot.
    pub async fn resume(&self, snapshot: StateSnapshot) -> Result<StateSnapshot, RunError> {
        if !matches!(
            snapshot.status,
            ScenarioStatus::Paused | ScenarioStatus::Halted | ScenarioStatus::Running
        ) {
            return Err(RunError::NotRunnable {
                run_id: snapshot.run_id,
                status: snapshot.status,
            });
        }

        info!("Resuming run {} after turn {}", snapshot.run_id, snapshot.turn);
        self.events.publish(SimulationEvent::RunStarted {
            run_id: snapshot.run_id.clone(),
            scenario_id: snapshot.scenario_id.clone(),
            from_turn: snapshot.turn,
            resumed: true,
        });
        let snapshot = snapshot.apply(Transformation::UpdateMetadata(MetadataUpdate::ResumedAt(snapshot.turn)))?;
        let snapshot = self.set_status(&snapshot, ScenarioStatus::Running)?;
        let meter = self.meter_for(&snapshot);
        Ok(self.drive(snapshot, meter).await)
    }

    fn meter_for(&self, snapshot: &StateSnapshot) -> Arc<BudgetMeter> {
        match &self.meter {
            Some(meter) => Arc::clone(meter),
            None => BudgetMeter::with_spent(BudgetScope::Run, self.scenario.cost_limit_money(), snapshot.total_cost),
        }
    }

    fn set_status(&self, snapshot: &StateSnapshot, to: ScenarioStatus) -> Result<StateSnapshot, RunError> {
        let from = snapshot.status;
        let next = snapshot.apply(Transformation::SetStatus(to))?;
        if from != to {
            self.events.publish(SimulationEvent::StatusChanged {
                run_id: next.run_id.clone(),
                from,
                to,
            });
        }
        Ok(next)
    }

    #[tracing::instrument(skip_all, fields(run_id = %snapshot.run_id))]
    async fn drive(&self, snapshot: StateSnapshot, meter: Arc<BudgetMeter>) -> StateSnapshot {
        let mut snapshot = snapshot;
        let stop = self.run_turns(&mut snapshot, &meter).await;
        self.finish(snapshot, stop).await
    }

    async fn run_turns(&self, snapshot: &mut StateSnapshot, meter: &BudgetMeter) -> Stop {
        let ctx = PhaseContext {
            scenario: &self.scenario,
            gateway: &self.gateway,
            meter,
            cancel: &self.cancel,
            composer: self.composer.as_ref(),
            events: &self.events,
            store: self.store.as_ref(),
        };
        let mut session_turns = 0;

        loop {
            if snapshot.turn >= self.scenario.turns {
                return Stop::Complete;
            }
            if let Some(limit) = self.session_turn_limit {
                if session_turns >= limit {
                    return Stop::Halt(HaltReason::TurnLimit { limit });
                }
            }

            let turn = snapshot.working_turn();
            self.events.publish(SimulationEvent::TurnStarted {
                run_id: snapshot.run_id.clone(),
                turn,
            });

            for phase in self.turn_phases.iter().filter(|p| p.enabled(&self.scenario)) {
                if let Some(stop) = self.checkpoint(snapshot, meter).await {
                    return stop;
                }
                if let Some(stop) = self.run_phase(phase.as_ref(), snapshot, &ctx).await {
                    return stop;
                }
            }

            if let Err(e) = self.commit(snapshot, Transformation::AdvanceTurn) {
                return Stop::Fail(e);
            }
            self.events.publish(SimulationEvent::TurnCompleted {
                run_id: snapshot.run_id.clone(),
                turn: snapshot.turn,
                total_cost: snapshot.total_cost,
            });
            info!("Turn {} complete, run total {}", snapshot.turn, snapshot.total_cost);

            if let Some(stop) = self.run_phase(&self.persistence, snapshot, &ctx).await {
                return stop;
            }
            session_turns += 1;

            if let Some(condition) = &self.scenario.stop_condition {
                if condition.is_met(snapshot) {
                    info!("Stop condition met after turn {}", snapshot.turn);
                    return Stop::Complete;
                }
            }
        }
    }

    /// Executes one phase and folds its output in. `Some` means stop.
    async fn run_phase(&self, phase: &dyn Phase, snapshot: &mut StateSnapshot, ctx: &PhaseContext<'_>) -> Option<Stop> {
        let kind = phase.kind();
        let turn = snapshot.working_turn();
        if let Err(e) = self.commit(snapshot, Transformation::SetPhase(Some(kind))) {
            return Some(Stop::Fail(e));
        }
        self.events.publish(SimulationEvent::PhaseStarted {
            run_id: snapshot.run_id.clone(),
            turn,
            phase: kind,
        });

        let output = match phase.execute(snapshot, ctx).await {
            Ok(output) => output,
            Err(e) => return Some(Stop::Fail(e)),
        };
        let PhaseOutput { transformations, halt } = output;
        if let Err(e) = self.fold(snapshot, transformations) {
            return Some(Stop::Fail(e));
        }

        match halt {
            Some(reason) => Some(Stop::Halt(reason)),
            None => {
                self.events.publish(SimulationEvent::PhaseCompleted {
                    run_id: snapshot.run_id.clone(),
                    turn,
                    phase: kind,
                });
                None
            }
        }
    }

    fn commit(&self, snapshot: &mut StateSnapshot, t: Transformation) -> Result<(), PhaseError> {
        *snapshot = snapshot.apply(t)?;
        Ok(())
    }

    fn fold(&self, snapshot: &mut StateSnapshot, transformations: Vec<Transformation>) -> Result<(), PhaseError> {
        let costs: Vec<_> = transformations
            .iter()
            .filter_map(|t| match t {
                Transformation::AddCost(record) => Some((record.phase, record.actor_id.clone(), record.amount)),
                _ => None,
            })
            .collect();

        *snapshot = snapshot.apply_all(transformations)?;

        for (phase, actor_id, amount) in costs {
            self.events.publish(SimulationEvent::CostRecorded {
                run_id: snapshot.run_id.clone(),
                phase,
                actor_id,
                amount,
                run_total: snapshot.total_cost,
            });
        }
        Ok(())
    }

    /// Between-phase check for budgets, cancellation and run control.
    async fn checkpoint(&self, snapshot: &mut StateSnapshot, meter: &BudgetMeter) -> Option<Stop> {
        if meter.is_tripped() {
            return Some(Stop::Halt(budget_halt(meter)));
        }
        if self.cancel.is_cancelled() {
            return Some(Stop::Halt(HaltReason::StopRequested));
        }

        match self.control.signal() {
            RunSignal::Run => None,
            RunSignal::Halt => Some(Stop::Halt(HaltReason::StopRequested)),
            RunSignal::Pause => self.pause(snapshot).await,
        }
    }

    async fn pause(&self, snapshot: &mut StateSnapshot) -> Option<Stop> {
        *snapshot = match self.set_status(snapshot, ScenarioStatus::Paused) {
            Ok(s) => s,
            Err(e) => return Some(Stop::Fail(run_error_to_phase(e))),
        };
        info!("Run {} paused at turn {}", snapshot.run_id, snapshot.working_turn());
        self.save_quietly(snapshot).await;

        match self.control.wait_while_paused(&self.cancel).await {
            RunSignal::Run => {
                let resumed = snapshot
                    .apply(Transformation::UpdateMetadata(MetadataUpdate::ResumedAt(snapshot.turn)))
                    .map_err(RunError::from)
                    .and_then(|s| self.set_status(&s, ScenarioStatus::Running));
                match resumed {
                    Ok(s) => {
                        *snapshot = s;
                        info!("Run {} resumed", snapshot.run_id);
                        None
                    }
                    Err(e) => Some(Stop::Fail(run_error_to_phase(e))),
                }
            }
            _ => Some(Stop::Halt(HaltReason::StopRequested)),
        }
    }

    async fn finish(&self, snapshot: StateSnapshot, stop: Stop) -> StateSnapshot {
        let run_id = snapshot.run_id.clone();
        let (status, extra) = match &stop {
            Stop::Complete => (ScenarioStatus::Completed, None),
            Stop::Halt(reason) => {
                warn!("Run {} halted: {}", run_id, reason);
                self.events.publish(SimulationEvent::RunHalted {
                    run_id: run_id.clone(),
                    turn: snapshot.turn,
                    reason: *reason,
                });
                (
                    ScenarioStatus::Halted,
                    Some(Transformation::UpdateMetadata(MetadataUpdate::Halted(*reason))),
                )
            }
            Stop::Fail(e) => {
                let info = FailureInfo {
                    cause: e.to_string(),
                    class: e.class(),
                    last_completed_turn: snapshot.turn,
                };
                error!("Run {} failed after turn {}: {}", run_id, snapshot.turn, info.cause);
                self.events.publish(SimulationEvent::RunFailed {
                    run_id: run_id.clone(),
                    last_completed_turn: snapshot.turn,
                    class: info.class,
                    cause: info.cause.clone(),
                });
                (
                    ScenarioStatus::Failed,
                    Some(Transformation::UpdateMetadata(MetadataUpdate::Failed(info))),
                )
            }
        };

        let mut closing: Vec<Transformation> = extra.into_iter().collect();
        if status != ScenarioStatus::Halted {
            closing.push(Transformation::SetPhase(None));
        }
        let from = snapshot.status;
        // A paused run that is halted passes through Paused -> Halted; a
        // paused run cannot complete, so resume it first.
        if from == ScenarioStatus::Paused && status != ScenarioStatus::Halted && status != ScenarioStatus::Failed {
            closing.insert(0, Transformation::SetStatus(ScenarioStatus::Running));
        }
        closing.push(Transformation::SetStatus(status));

        let finished = match snapshot.apply_all(closing) {
            Ok(s) => s,
            Err(e) => {
                error!("Run {} could not record its final status: {}", run_id, e);
                snapshot
            }
        };
        if finished.status != from {
            self.events.publish(SimulationEvent::StatusChanged {
                run_id: run_id.clone(),
                from,
                to: finished.status,
            });
        }

        self.save_quietly(&finished).await;
        self.events.publish(SimulationEvent::RunFinished {
            run_id,
            status: finished.status,
            turns: finished.turn,
            total_cost: finished.total_cost,
        });
        finished
    }

    async fn save_quietly(&self, snapshot: &StateSnapshot) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(snapshot).await {
                error!("Could not persist run {}: {}", snapshot.run_id, e);
            }
        }
    }
}

fn run_error_to_phase(e: RunError) -> PhaseError {
    match e {
        RunError::State(s) => PhaseError::State(s),
        other => PhaseError::State(crate::error::StateError::InvalidTransformation(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ActorConfig;
    use crate::error::ClientError;
    use crate::gateway::{Generation, GenerationClient, Message, SamplingParams};
    use crate::ledger::{ModelPrice, Money, PriceTable};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct EchoClient;

    #[async_trait]
    impl GenerationClient for EchoClient {
        async fn generate(
            &self,
            model: &str,
            messages: &[Message],
            sampling: &SamplingParams,
        ) -> Result<Generation, ClientError> {
            let text = if model == "actor" {
                let who = messages[0].content.split(' ').nth(2).unwrap_or("?").to_string();
                format!("REASONING: r\nACTION: {} acts", who)
            } else {
                "The world moves on.".to_string()
            };
            Ok(Generation::new(text, 10, sampling.max_tokens))
        }
    }

    fn scenario() -> ScenarioConfig {
        let mut s = ScenarioConfig::new("council", "Dawn.")
            .with_actor(ActorConfig::new("a", "A", "actor"))
            .with_actor(ActorConfig::new("b", "B", "actor"))
            .with_turns(3)
            .with_pricing(PriceTable::new().with_model("actor", ModelPrice::new(0.0, 100.0)));
        s.sampling.max_tokens = 1000;
        s.gateway.cache_enabled = false;
        s
    }

    async fn orchestrator(scenario: ScenarioConfig) -> Orchestrator {
        let gateway = GenerationGateway::from_config(Arc::new(EchoClient), &scenario.gateway, scenario.pricing.clone())
            .await
            .unwrap();
        Orchestrator::new(Arc::new(scenario), Arc::new(gateway))
    }

    #[tokio::test]
    async fn test_runs_to_completion() {
        let orch = orchestrator(scenario()).await;
        let result = orch.start_with_id("r1").await.unwrap();

        assert_eq!(result.status, ScenarioStatus::Completed);
        assert_eq!(result.turn, 3);
        assert_eq!(result.decision_log.len(), 6);
        assert_eq!(result.world_updates().count(), 3);
        assert_eq!(result.total_cost, Money::from_dollars(0.60));
        assert_eq!(result.current_phase, None);
    }

    #[tokio::test]
    async fn test_session_turn_limit_halts_resumably() {
        let orch = orchestrator(scenario()).await.with_session_turn_limit(1);
        let first = orch.start_with_id("r2").await.unwrap();
        assert_eq!(first.status, ScenarioStatus::Halted);
        assert_eq!(first.turn, 1);
        assert_eq!(
            first.execution_metadata.halt_reason,
            Some(HaltReason::TurnLimit { limit: 1 })
        );

        let second = orch.resume(first).await.unwrap();
        assert_eq!(second.turn, 2);
        assert_eq!(second.execution_metadata.resumed_at, vec![1]);
    }

    #[tokio::test]
    async fn test_completed_run_cannot_resume() {
        let orch = orchestrator(scenario()).await;
        let done = orch.start_with_id("r3").await.unwrap();
        assert!(matches!(orch.resume(done).await, Err(RunError::NotRunnable { .. })));
    }

    #[tokio::test]
    async fn test_stop_condition_completes_early() {
        let mut s = scenario();
        s.stop_condition = Some(crate::orchestrator::StopCondition::NarrativeContains {
            text: "moves on".into(),
        });
        let result = orchestrator(s).await.start_with_id("r4").await.unwrap();
        assert_eq!(result.status, ScenarioStatus::Completed);
        assert_eq!(result.turn, 1);
    }

    #[tokio::test]
    async fn test_external_halt_between_phases() {
        let orch = orchestrator(scenario()).await;
        orch.control().halt();
        let result = orch.start_with_id("r5").await.unwrap();
        assert_eq!(result.status, ScenarioStatus::Halted);
        assert_eq!(result.turn, 0);
        assert_eq!(result.execution_metadata.halt_reason, Some(HaltReason::StopRequested));
    }

    #[tokio::test]
    async fn test_turn_halted_in_validation_is_validated_once() {
        let mut s = scenario().with_turns(1);
        s.validator_model = Some("validator".into());
        s.pricing = s.pricing.clone().with_model("validator", ModelPrice::new(0.0, 100.0));

        // Two decisions fit; the review's reservation does not.
        let halted = orchestrator(s.clone().with_cost_limit(0.25))
            .await
            .start_with_id("r7")
            .await
            .unwrap();
        assert_eq!(halted.status, ScenarioStatus::Halted);
        assert_eq!(halted.turn, 0);
        assert!(halted.metrics.is_empty());

        let resumed = orchestrator(s.with_cost_limit(1.0)).await.resume(halted).await.unwrap();
        assert_eq!(resumed.status, ScenarioStatus::Completed);
        assert_eq!(resumed.turn, 1);
        let counts: Vec<_> = resumed
            .metrics
            .iter()
            .filter(|m| m.turn == 1 && m.name == "decisions.count")
            .collect();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[0].value, 2.0);
        assert_eq!(resumed.total_cost, Money::from_dollars(0.30));
    }

    #[tokio::test]
    async fn test_events_cover_the_lifecycle() {
        let orch = orchestrator(scenario().with_turns(1)).await;
        let kinds = Arc::new(Mutex::new(Vec::new()));
        let sink = kinds.clone();
        orch.events().subscribe(crate::orchestrator::EventFilter::All, move |e| {
            sink.lock().unwrap().push(e.kind());
            Ok(())
        });

        orch.start_with_id("r6").await.unwrap();

        use crate::orchestrator::EventKind::*;
        let kinds = kinds.lock().unwrap();
        assert_eq!(kinds.first(), Some(&RunStarted));
        assert_eq!(kinds.last(), Some(&RunFinished));
        for expected in [TurnStarted, PhaseStarted, PhaseCompleted, ActorDecided, CostRecorded, TurnCompleted] {
            assert!(kinds.contains(&expected), "missing {:?}", expected);
        }
    }
}

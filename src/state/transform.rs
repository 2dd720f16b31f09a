//! Snapshot Transformations
//!
//! The fixed catalogue of state changes. `apply` is pure: the input snapshot
//! is never touched and equal inputs always produce equal outputs.

use serde::{Deserialize, Serialize};

use super::snapshot::{
    ActorRecord, Communication, Decision, FailureInfo, HaltReason, MetricRecord, PhaseKind, ScenarioStatus,
    StateSnapshot, WorldState,
};
use crate::error::StateError;
use crate::ledger::CostRecord;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum MetadataUpdate {
    ResumedAt(u32),
    Persisted(u32),
    Halted(HaltReason),
    Failed(FailureInfo),
    Label { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum Transformation {
    /// Commits the working turn.
    AdvanceTurn,
    SetStatus(ScenarioStatus),
    SetPhase(Option<PhaseKind>),
    ReplaceWorld(WorldState),
    AddDecision(Decision),
    AddCost(CostRecord),
    AddMetric(MetricRecord),
    AddCommunication(Communication),
    UpsertActor(ActorRecord),
    UpdateMetadata(MetadataUpdate),
}

impl StateSnapshot {
    pub fn apply(&self, transformation: Transformation) -> Result<StateSnapshot, StateError> {
        let mut next = self.clone();
        next.apply_in_place(transformation)?;
        Ok(next)
    }

    /// Applies a sequence, stopping at the first invalid transformation.
    pub fn apply_all(
        &self,
        transformations: impl IntoIterator<Item = Transformation>,
    ) -> Result<StateSnapshot, StateError> {
        let mut next = self.clone();
        for t in transformations {
            next.apply_in_place(t)?;
        }
        Ok(next)
    }

    // Only ever called on a private clone.
    fn apply_in_place(&mut self, transformation: Transformation) -> Result<(), StateError> {
        match transformation {
            Transformation::AdvanceTurn => {
                self.turn += 1;
            }
            Transformation::SetStatus(status) => {
                if !self.status.can_transition_to(status) {
                    return Err(StateError::InvalidTransition {
                        from: self.status,
                        to: status,
                    });
                }
                self.status = status;
            }
            Transformation::SetPhase(phase) => {
                self.current_phase = phase;
            }
            Transformation::ReplaceWorld(world) => {
                if world.turn < self.world.turn {
                    return Err(StateError::InvalidTransformation(format!(
                        "world for turn {} would replace newer turn {}",
                        world.turn, self.world.turn
                    )));
                }
                self.world_history.push(world.clone());
                self.world = world;
            }
            Transformation::AddDecision(decision) => {
                let working = self.working_turn();
                if decision.turn != working {
                    return Err(StateError::InvalidTransformation(format!(
                        "decision for turn {} while turn {} is in progress",
                        decision.turn, working
                    )));
                }
                let actor = self
                    .actors
                    .get_mut(&decision.actor_id)
                    .ok_or_else(|| StateError::UnknownActor(decision.actor_id.clone()))?;
                actor.remember(decision.clone());

                self.decisions.retain(|_, d| d.turn == working);
                self.decisions.insert(decision.actor_id.clone(), decision.clone());
                self.decision_log.push(decision);
            }
            Transformation::AddCost(record) => {
                self.total_cost += record.amount;
                self.costs = std::mem::take(&mut self.costs).with_record(record);
            }
            Transformation::AddMetric(metric) => {
                self.metrics.push(metric);
            }
            Transformation::AddCommunication(message) => {
                if !self.actors.contains_key(&message.from) {
                    return Err(StateError::UnknownActor(message.from));
                }
                self.communications.push(message);
            }
            Transformation::UpsertActor(actor) => {
                self.actors.insert(actor.id.clone(), actor);
            }
            Transformation::UpdateMetadata(update) => {
                let meta = &mut self.execution_metadata;
                match update {
                    MetadataUpdate::ResumedAt(turn) => meta.resumed_at.push(turn),
                    MetadataUpdate::Persisted(turn) => meta.last_persisted_turn = Some(turn),
                    MetadataUpdate::Halted(reason) => meta.halt_reason = Some(reason),
                    MetadataUpdate::Failed(info) => meta.failure = Some(info),
                    MetadataUpdate::Label { key, value } => {
                        meta.labels.insert(key, value);
                    }
                }
            }
        }
        Ok(())
    }
}

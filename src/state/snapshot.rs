use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::config::ScenarioConfig;
use crate::error::ErrorClass;
use crate::ledger::{CostLedger, Money};

pub type ActorId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioStatus {
    Created,
    Running,
    Paused,
    Completed,
    Halted,
    Failed,
}

impl ScenarioStatus {
    /// Completed and Failed runs never execute again. Halted runs may resume.
    pub fn is_final(self) -> bool {
        matches!(self, ScenarioStatus::Completed | ScenarioStatus::Failed)
    }

    /// A status at which the orchestrator stops driving the run.
    pub fn is_stopped(self) -> bool {
        matches!(
            self,
            ScenarioStatus::Completed | ScenarioStatus::Halted | ScenarioStatus::Failed
        )
    }

    pub fn can_transition_to(self, next: ScenarioStatus) -> bool {
        use ScenarioStatus::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Created, Running)
                | (Created, Failed)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Halted)
                | (Running, Failed)
                | (Paused, Running)
                | (Paused, Halted)
                | (Paused, Failed)
                | (Halted, Running)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    Communication,
    Decision,
    WorldUpdate,
    Validation,
    Persistence,
}

impl PhaseKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseKind::Communication => "communication",
            PhaseKind::Decision => "decision",
            PhaseKind::WorldUpdate => "world_update",
            PhaseKind::Validation => "validation",
            PhaseKind::Persistence => "persistence",
        }
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The shared narrative as of a given turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldState {
    pub turn: u32,
    pub narrative: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub actor_id: ActorId,
    pub turn: u32,
    pub goals: Vec<String>,
    pub reasoning: String,
    pub action: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorRecord {
    pub id: ActorId,
    pub name: String,
    pub model: String,
    pub goals: Vec<String>,
    /// Goals the actor started the run with.
    #[serde(default)]
    pub initial_goals: Vec<String>,
    /// Most recent decisions, oldest first, capped at `history_limit`.
    pub history: Vec<Decision>,
    pub history_limit: usize,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl ActorRecord {
    pub(crate) fn remember(&mut self, decision: Decision) {
        self.history.push(decision);
        if self.history.len() > self.history_limit {
            let overflow = self.history.len() - self.history_limit;
            self.history.drain(..overflow);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Communication {
    pub turn: u32,
    pub from: ActorId,
    /// `None` addresses every actor.
    pub to: Option<ActorId>,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub turn: u32,
    pub name: String,
    pub value: f64,
    pub actor_id: Option<ActorId>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum HaltReason {
    /// The per-session turn cap was reached before the scenario ended.
    TurnLimit { limit: u32 },
    /// A run or batch cost limit was crossed.
    CostLimit { scope: crate::ledger::BudgetScope },
    /// The provider refused further calls on billing grounds.
    ProviderQuota,
    /// An external halt or stop signal.
    StopRequested,
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HaltReason::TurnLimit { limit } => write!(f, "turn limit of {} reached", limit),
            HaltReason::CostLimit { scope } => write!(f, "{:?} cost limit reached", scope),
            HaltReason::ProviderQuota => f.write_str("provider quota exhausted"),
            HaltReason::StopRequested => f.write_str("stop requested"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub cause: String,
    pub class: ErrorClass,
    pub last_completed_turn: u32,
}

/// Lineage and lifecycle markers that do not affect simulation semantics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    #[serde(default)]
    pub forked_from: Option<String>,
    #[serde(default)]
    pub fork_point: Option<u32>,
    #[serde(default)]
    pub resumed_at: Vec<u32>,
    #[serde(default)]
    pub last_persisted_turn: Option<u32>,
    #[serde(default)]
    pub halt_reason: Option<HaltReason>,
    #[serde(default)]
    pub failure: Option<FailureInfo>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Immutable simulation state. Every change goes through
/// [`StateSnapshot::apply`](crate::state::Transformation), which returns a new
/// snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub run_id: String,
    pub scenario_id: String,
    pub status: ScenarioStatus,
    /// Number of completed turns.
    pub turn: u32,
    pub current_phase: Option<PhaseKind>,
    pub world: WorldState,
    /// Initial world followed by one entry per world update.
    pub world_history: Vec<WorldState>,
    pub actors: BTreeMap<ActorId, ActorRecord>,
    /// Decisions of the turn in progress or most recently completed.
    pub decisions: BTreeMap<ActorId, Decision>,
    pub decision_log: Vec<Decision>,
    pub communications: Vec<Communication>,
    pub metrics: Vec<MetricRecord>,
    pub costs: CostLedger,
    pub total_cost: Money,
    pub execution_metadata: ExecutionMetadata,
    pub created_at: DateTime<Utc>,
}

impl StateSnapshot {
    pub fn new(run_id: impl Into<String>, scenario: &ScenarioConfig, created_at: DateTime<Utc>) -> Self {
        let world = WorldState {
            turn: 0,
            narrative: scenario.initial_world.clone(),
            metadata: BTreeMap::new(),
        };
        let actors = scenario
            .actors
            .iter()
            .map(|a| {
                (
                    a.id.clone(),
                    ActorRecord {
                        id: a.id.clone(),
                        name: a.name.clone(),
                        model: a.model.clone(),
                        goals: a.goals.clone(),
                        initial_goals: a.goals.clone(),
                        history: Vec::new(),
                        history_limit: scenario.history_limit,
                        notes: Vec::new(),
                    },
                )
            })
            .collect();

        Self {
            run_id: run_id.into(),
            scenario_id: scenario.id.clone(),
            status: ScenarioStatus::Created,
            turn: 0,
            current_phase: None,
            world_history: vec![world.clone()],
            world,
            actors,
            decisions: BTreeMap::new(),
            decision_log: Vec::new(),
            communications: Vec::new(),
            metrics: Vec::new(),
            costs: CostLedger::new(),
            total_cost: Money::ZERO,
            execution_metadata: ExecutionMetadata::default(),
            created_at,
        }
    }

    /// Turn number that the next executed phase belongs to.
    pub fn working_turn(&self) -> u32 {
        self.turn + 1
    }

    /// World records produced by turns, excluding the initial world.
    pub fn world_updates(&self) -> impl Iterator<Item = &WorldState> {
        self.world_history.iter().filter(|w| w.turn > 0)
    }

    pub fn decisions_for_turn(&self, turn: u32) -> impl Iterator<Item = &Decision> {
        self.decision_log.iter().filter(move |d| d.turn == turn)
    }

    pub fn communications_for_turn(&self, turn: u32) -> impl Iterator<Item = &Communication> {
        self.communications.iter().filter(move |c| c.turn == turn)
    }

    pub fn latest_metric(&self, name: &str) -> Option<&MetricRecord> {
        self.metrics.iter().rev().find(|m| m.name == name)
    }
}

//! Turn Phases
//!
//! A phase reads the current snapshot and returns the transformations it
//! wants applied. Phases never mutate shared state: costs, metrics and
//! decisions all travel back to the orchestrator inside [`PhaseOutput`].

mod communication;
mod decision;
mod persistence;
mod validation;
mod world_update;

pub use communication::CommunicationPhase;
pub use decision::DecisionPhase;
pub use persistence::PersistencePhase;
pub use validation::ValidationPhase;
pub use world_update::WorldUpdatePhase;

use async_trait::async_trait;

use super::event_bus::EventBus;
use super::prompt::PromptComposer;
use crate::config::ScenarioConfig;
use crate::error::{GatewayError, PhaseError};
use crate::gateway::GenerationGateway;
use crate::ledger::{BudgetMeter, BudgetScope};
use crate::state::{HaltReason, PhaseKind, SnapshotStore, StateSnapshot, Transformation};
use crate::utils::CancelToken;

/// Everything a phase may use besides the snapshot.
pub struct PhaseContext<'a> {
    pub scenario: &'a ScenarioConfig,
    pub gateway: &'a GenerationGateway,
    pub meter: &'a BudgetMeter,
    pub cancel: &'a CancelToken,
    pub composer: &'a dyn PromptComposer,
    pub events: &'a EventBus,
    pub store: Option<&'a SnapshotStore>,
}

#[derive(Debug, Default)]
pub struct PhaseOutput {
    pub transformations: Vec<Transformation>,
    /// Set when the phase hit a stopping condition. Its transformations are
    /// still applied, so billed work is never lost.
    pub halt: Option<HaltReason>,
}

impl PhaseOutput {
    pub fn push(&mut self, t: Transformation) {
        self.transformations.push(t);
    }

    /// Keeps the first reason when several calls stop the phase.
    pub fn halt_with(&mut self, reason: HaltReason) {
        self.halt.get_or_insert(reason);
    }

    /// Turns a halting gateway error into a halt, recording any cost the
    /// provider billed before the limit was crossed. Returns the error back
    /// when it is not a halt.
    pub fn absorb_halt(&mut self, error: GatewayError) -> Result<(), GatewayError> {
        let reason = match &error {
            GatewayError::Budget(e) => HaltReason::CostLimit { scope: e.scope },
            GatewayError::BudgetCrossed { source, .. } => HaltReason::CostLimit { scope: source.scope },
            GatewayError::ProviderQuota(_) => HaltReason::ProviderQuota,
            GatewayError::Cancelled => HaltReason::StopRequested,
            _ => return Err(error),
        };
        if let GatewayError::BudgetCrossed { record, .. } = error {
            self.push(Transformation::AddCost(*record));
        }
        self.halt_with(reason);
        Ok(())
    }
}

/// The scope to report when a meter refuses work.
pub(crate) fn budget_halt(meter: &BudgetMeter) -> HaltReason {
    HaltReason::CostLimit {
        scope: meter.tripped_scope().unwrap_or(BudgetScope::Run),
    }
}

#[async_trait]
pub trait Phase: Send + Sync {
    fn kind(&self) -> PhaseKind;

    fn enabled(&self, _scenario: &ScenarioConfig) -> bool {
        true
    }

    async fn execute(&self, snapshot: &StateSnapshot, ctx: &PhaseContext<'_>) -> Result<PhaseOutput, PhaseError>;
}

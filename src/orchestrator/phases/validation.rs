use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;

use super::{Phase, PhaseContext, PhaseOutput};
use crate::config::ScenarioConfig;
use crate::error::{PhaseError, StateError};
use crate::gateway::GenerationRequest;
use crate::orchestrator::parse::parse_issues;
use crate::state::{MetricRecord, PhaseKind, StateSnapshot, Transformation};

const ISSUES_METRIC: &str = "validation.issues";

/// Structural checks on the finished turn plus an optional model review.
/// Issues are recorded as metrics; only a ledger mismatch is fatal. A turn
/// is validated once: a halted review records no metrics, and a turn that
/// already has them is skipped on resume.
pub struct ValidationPhase;

impl ValidationPhase {
    fn already_validated(snapshot: &StateSnapshot, turn: u32) -> bool {
        snapshot.metrics.iter().any(|m| m.turn == turn && m.name == ISSUES_METRIC)
    }

    fn structural_issues(snapshot: &StateSnapshot, turn: u32) -> Vec<String> {
        let mut issues = Vec::new();
        if snapshot.world.turn != turn {
            issues.push(format!("world reflects turn {} instead of {}", snapshot.world.turn, turn));
        }
        if snapshot.world.narrative.trim().is_empty() {
            issues.push("world narrative is empty".to_string());
        }
        for d in snapshot.decisions.values().filter(|d| d.turn == turn) {
            if d.action.trim().is_empty() {
                issues.push(format!("{} has an empty action", d.actor_id));
            }
        }
        issues
    }
}

#[async_trait]
impl Phase for ValidationPhase {
    fn kind(&self) -> PhaseKind {
        PhaseKind::Validation
    }

    fn enabled(&self, scenario: &ScenarioConfig) -> bool {
        scenario.phases.validation
    }

    async fn execute(&self, snapshot: &StateSnapshot, ctx: &PhaseContext<'_>) -> Result<PhaseOutput, PhaseError> {
        let turn = snapshot.working_turn();
        let mut out = PhaseOutput::default();

        if snapshot.costs.total() != snapshot.total_cost {
            return Err(StateError::Corrupt {
                reason: format!(
                    "running total {} disagrees with ledger sum {}",
                    snapshot.total_cost,
                    snapshot.costs.total()
                ),
            }
            .into());
        }

        if Self::already_validated(snapshot, turn) {
            return Ok(out);
        }

        let mut issues = Self::structural_issues(snapshot, turn);

        if let Some(model) = &ctx.scenario.validator_model {
            let request = GenerationRequest::new(
                model.clone(),
                ctx.composer.validation(snapshot),
                PhaseKind::Validation,
                turn,
            )
            .with_sampling(ctx.scenario.sampling);
            match ctx.gateway.generate(&request, ctx.meter, ctx.cancel).await {
                Ok(response) => {
                    out.push(Transformation::AddCost(response.cost));
                    issues.extend(parse_issues(&response.text));
                }
                Err(e) => {
                    if let Err(e) = out.absorb_halt(e) {
                        warn!(run_id = %snapshot.run_id, turn, "Validator unavailable: {}", e);
                    }
                }
            }
        }

        if out.halt.is_some() {
            return Ok(out);
        }

        for issue in &issues {
            warn!(run_id = %snapshot.run_id, turn, "Validation issue: {}", issue);
        }

        let now = Utc::now();
        let decisions = snapshot.decisions.values().filter(|d| d.turn == turn).count();
        for (name, value) in [
            (ISSUES_METRIC, issues.len() as f64),
            ("decisions.count", decisions as f64),
            ("narrative.chars", snapshot.world.narrative.chars().count() as f64),
        ] {
            out.push(Transformation::AddMetric(MetricRecord {
                turn,
                name: name.to_string(),
                value,
                actor_id: None,
                timestamp: now,
            }));
        }
        Ok(out)
    }
}

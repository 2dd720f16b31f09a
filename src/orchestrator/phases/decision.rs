use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use tracing::{debug, warn};

use super::{budget_halt, Phase, PhaseContext, PhaseOutput};
use crate::error::{ErrorClass, GatewayError, PhaseError};
use crate::gateway::GenerationRequest;
use crate::ledger::CostRecord;
use crate::orchestrator::event_bus::SimulationEvent;
use crate::orchestrator::parse::parse_decision;
use crate::state::{ActorRecord, Decision, MetricRecord, PhaseKind, StateSnapshot, Transformation};

enum ActorFailure {
    Gateway(GatewayError),
    Unparseable,
}

struct ActorOutcome {
    cost: Option<CostRecord>,
    cached: bool,
    result: Result<(Decision, Option<Vec<String>>), ActorFailure>,
}

/// Asks every actor for a decision concurrently. One actor's failure never
/// affects the others; the phase fails only when nobody decided.
pub struct DecisionPhase;

impl DecisionPhase {
    async fn decide(
        snapshot: &StateSnapshot,
        actor: &ActorRecord,
        ctx: &PhaseContext<'_>,
        turn: u32,
    ) -> ActorOutcome {
        let inbox: Vec<_> = snapshot
            .communications_for_turn(turn)
            .filter(|c| c.from != actor.id && c.to.as_ref().map_or(true, |to| *to == actor.id))
            .collect();
        let request = GenerationRequest::new(
            actor.model.clone(),
            ctx.composer.decision(snapshot, actor, &inbox),
            PhaseKind::Decision,
            turn,
        )
        .with_sampling(ctx.scenario.sampling)
        .for_actor(actor.id.clone());

        let response = match ctx.gateway.generate(&request, ctx.meter, ctx.cancel).await {
            Ok(r) => r,
            Err(e) => {
                return ActorOutcome {
                    cost: None,
                    cached: false,
                    result: Err(ActorFailure::Gateway(e)),
                }
            }
        };

        let result = match parse_decision(&response.text) {
            Some(parsed) => {
                let goals = parsed.goals.clone().unwrap_or_else(|| actor.goals.clone());
                Ok((
                    Decision {
                        actor_id: actor.id.clone(),
                        turn,
                        goals,
                        reasoning: parsed.reasoning,
                        action: parsed.action,
                        timestamp: Utc::now(),
                    },
                    parsed.goals,
                ))
            }
            None => Err(ActorFailure::Unparseable),
        };

        ActorOutcome {
            cost: Some(response.cost),
            cached: response.cached,
            result,
        }
    }
}

#[async_trait]
impl Phase for DecisionPhase {
    fn kind(&self) -> PhaseKind {
        PhaseKind::Decision
    }

    async fn execute(&self, snapshot: &StateSnapshot, ctx: &PhaseContext<'_>) -> Result<PhaseOutput, PhaseError> {
        let turn = snapshot.working_turn();
        let mut out = PhaseOutput::default();

        // Actors that already decided this turn (a resumed, partially run
        // turn) keep their decision.
        let pending: Vec<&ActorRecord> = snapshot
            .actors
            .values()
            .filter(|a| !snapshot.decisions.get(&a.id).is_some_and(|d| d.turn == turn))
            .collect();
        let already_decided = snapshot.actors.len() - pending.len();
        if pending.is_empty() {
            return Ok(out);
        }

        if ctx.meter.is_tripped() {
            out.halt_with(budget_halt(ctx.meter));
            return Ok(out);
        }

        let outcomes = join_all(pending.iter().map(|actor| Self::decide(snapshot, actor, ctx, turn))).await;

        let mut succeeded = 0;
        let mut failures = Vec::new();
        for (actor, outcome) in pending.iter().zip(outcomes) {
            if let Some(cost) = outcome.cost {
                out.push(Transformation::AddCost(cost));
            }
            let error = match outcome.result {
                Ok((decision, new_goals)) => {
                    if let Some(goals) = new_goals {
                        let mut record = (*actor).clone();
                        record.goals = goals;
                        out.push(Transformation::UpsertActor(record));
                    }
                    out.push(Transformation::AddDecision(decision));
                    ctx.events.publish(SimulationEvent::ActorDecided {
                        run_id: snapshot.run_id.clone(),
                        turn,
                        actor_id: actor.id.clone(),
                        cached: outcome.cached,
                    });
                    succeeded += 1;
                    continue;
                }
                Err(ActorFailure::Gateway(e)) => match out.absorb_halt(e) {
                    Ok(()) => continue,
                    Err(e) => (e.class(), e.to_string()),
                },
                Err(ActorFailure::Unparseable) => (ErrorClass::Internal, "reply contained no action".to_string()),
            };

            let (class, message) = error;
            warn!(run_id = %snapshot.run_id, turn, actor = %actor.id, "Actor failed to decide: {}", message);
            out.push(Transformation::AddMetric(MetricRecord {
                turn,
                name: "decision.failed".to_string(),
                value: 1.0,
                actor_id: Some(actor.id.clone()),
                timestamp: Utc::now(),
            }));
            ctx.events.publish(SimulationEvent::ActorFailed {
                run_id: snapshot.run_id.clone(),
                turn,
                actor_id: actor.id.clone(),
                class,
                error: message.clone(),
            });
            failures.push((actor.id.clone(), message));
        }

        debug!(
            run_id = %snapshot.run_id,
            turn,
            succeeded,
            failed = failures.len(),
            "Decision phase finished"
        );

        if out.halt.is_none() && succeeded == 0 && already_decided == 0 {
            return Err(PhaseError::NoDecisions {
                turn,
                attempted: pending.len(),
                failures,
            });
        }
        Ok(out)
    }
}

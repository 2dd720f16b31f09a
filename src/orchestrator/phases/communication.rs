use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use tracing::warn;

use super::{Phase, PhaseContext, PhaseOutput};
use crate::config::ScenarioConfig;
use crate::error::PhaseError;
use crate::gateway::GenerationRequest;
use crate::orchestrator::parse::parse_communication;
use crate::state::{Communication, PhaseKind, StateSnapshot, Transformation};

/// Optional pre-decision round in which every actor may address the others.
/// A failed message is dropped; it never fails the turn.
pub struct CommunicationPhase;

#[async_trait]
impl Phase for CommunicationPhase {
    fn kind(&self) -> PhaseKind {
        PhaseKind::Communication
    }

    fn enabled(&self, scenario: &ScenarioConfig) -> bool {
        scenario.phases.communication && scenario.actors.len() > 1
    }

    async fn execute(&self, snapshot: &StateSnapshot, ctx: &PhaseContext<'_>) -> Result<PhaseOutput, PhaseError> {
        let turn = snapshot.working_turn();
        let mut out = PhaseOutput::default();

        let pending: Vec<_> = snapshot
            .actors
            .values()
            .filter(|a| !snapshot.communications_for_turn(turn).any(|c| c.from == a.id))
            .collect();

        let calls = pending.iter().map(|actor| {
            let request = GenerationRequest::new(
                actor.model.clone(),
                ctx.composer.communication(snapshot, actor),
                PhaseKind::Communication,
                turn,
            )
            .with_sampling(ctx.scenario.sampling)
            .for_actor(actor.id.clone());
            async move { ctx.gateway.generate(&request, ctx.meter, ctx.cancel).await }
        });
        let responses = join_all(calls).await;

        for (actor, response) in pending.iter().zip(responses) {
            match response {
                Ok(response) => {
                    out.push(Transformation::AddCost(response.cost));
                    let (to, content) = parse_communication(&response.text);
                    if content.is_empty() {
                        continue;
                    }
                    let to = to.filter(|id| snapshot.actors.contains_key(id) && *id != actor.id);
                    out.push(Transformation::AddCommunication(Communication {
                        turn,
                        from: actor.id.clone(),
                        to,
                        content,
                        timestamp: Utc::now(),
                    }));
                }
                Err(e) => {
                    if let Err(e) = out.absorb_halt(e) {
                        warn!(run_id = %snapshot.run_id, actor = %actor.id, "Message dropped: {}", e);
                    }
                }
            }
        }
        Ok(out)
    }
}

use async_trait::async_trait;
use std::collections::BTreeMap;

use super::{Phase, PhaseContext, PhaseOutput};
use crate::error::PhaseError;
use crate::gateway::GenerationRequest;
use crate::state::{PhaseKind, StateSnapshot, Transformation, WorldState};

/// Narrates the consequences of the turn's decisions with the world model.
pub struct WorldUpdatePhase;

#[async_trait]
impl Phase for WorldUpdatePhase {
    fn kind(&self) -> PhaseKind {
        PhaseKind::WorldUpdate
    }

    async fn execute(&self, snapshot: &StateSnapshot, ctx: &PhaseContext<'_>) -> Result<PhaseOutput, PhaseError> {
        let turn = snapshot.working_turn();
        let mut out = PhaseOutput::default();

        // Already narrated before an interruption.
        if snapshot.world.turn == turn {
            return Ok(out);
        }

        let decisions: Vec<_> = snapshot.decisions.values().filter(|d| d.turn == turn).collect();
        let request = GenerationRequest::new(
            ctx.scenario.world_model.clone(),
            ctx.composer.world_update(snapshot, &decisions),
            PhaseKind::WorldUpdate,
            turn,
        )
        .with_sampling(ctx.scenario.sampling);

        match ctx.gateway.generate(&request, ctx.meter, ctx.cancel).await {
            Ok(response) => {
                let mut metadata = BTreeMap::new();
                metadata.insert("model".to_string(), response.model.clone());
                metadata.insert("decisions".to_string(), decisions.len().to_string());
                out.push(Transformation::AddCost(response.cost));
                out.push(Transformation::ReplaceWorld(WorldState {
                    turn,
                    narrative: response.text.trim().to_string(),
                    metadata,
                }));
            }
            Err(e) => {
                out.absorb_halt(e).map_err(|source| PhaseError::Gateway {
                    phase: PhaseKind::WorldUpdate,
                    source,
                })?;
            }
        }
        Ok(out)
    }
}

use async_trait::async_trait;

use super::{Phase, PhaseContext, PhaseOutput};
use crate::error::PhaseError;
use crate::orchestrator::event_bus::SimulationEvent;
use crate::state::{MetadataUpdate, PhaseKind, StateSnapshot, Transformation};

/// Writes the committed turn to the snapshot store. Runs after the turn has
/// advanced, so the stored snapshot always ends on a turn boundary.
pub struct PersistencePhase;

#[async_trait]
impl Phase for PersistencePhase {
    fn kind(&self) -> PhaseKind {
        PhaseKind::Persistence
    }

    async fn execute(&self, snapshot: &StateSnapshot, ctx: &PhaseContext<'_>) -> Result<PhaseOutput, PhaseError> {
        let mut out = PhaseOutput::default();
        let Some(store) = ctx.store else {
            return Ok(out);
        };

        let updates = vec![
            Transformation::UpdateMetadata(MetadataUpdate::Persisted(snapshot.turn)),
            Transformation::SetPhase(None),
        ];
        // Store exactly what the orchestrator will hold once it applies
        // this output.
        let persisted = snapshot.apply_all(updates.clone())?;
        store.save(&persisted).await.map_err(|source| PhaseError::Persistence {
            phase: PhaseKind::Persistence,
            source,
        })?;

        ctx.events.publish(SimulationEvent::SnapshotPersisted {
            run_id: snapshot.run_id.clone(),
            turn: snapshot.turn,
        });
        out.transformations = updates;
        Ok(out)
    }
}

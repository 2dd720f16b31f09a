use uuid::Uuid;

use super::snapshot::{ExecutionMetadata, ScenarioStatus, StateSnapshot};
use crate::error::StateError;

/// Branches `snapshot` at `at_turn` under a fresh run id.
pub fn fork(snapshot: &StateSnapshot, at_turn: u32) -> Result<StateSnapshot, StateError> {
    fork_with_id(snapshot, at_turn, Uuid::new_v4().to_string())
}

/// Keeps every record from turns `<= at_turn`, restores the world as it stood
/// after that turn, and records the lineage. The branch starts `Paused` so it
/// can be resumed like any interrupted run.
pub fn fork_with_id(
    snapshot: &StateSnapshot,
    at_turn: u32,
    new_run_id: impl Into<String>,
) -> Result<StateSnapshot, StateError> {
    if at_turn > snapshot.turn {
        return Err(StateError::InvalidForkPoint {
            requested: at_turn,
            available: snapshot.turn,
        });
    }

    let world_history: Vec<_> = snapshot
        .world_history
        .iter()
        .filter(|w| w.turn <= at_turn)
        .cloned()
        .collect();
    let world = world_history.last().cloned().ok_or_else(|| StateError::Corrupt {
        reason: "snapshot has no initial world".to_string(),
    })?;

    let decision_log: Vec<_> = snapshot.decision_log.iter().filter(|d| d.turn <= at_turn).cloned().collect();

    // The bounded history may already have dropped early turns, so actor
    // state is rebuilt from the full log.
    let mut actors = snapshot.actors.clone();
    for actor in actors.values_mut() {
        let own: Vec<_> = decision_log.iter().filter(|d| d.actor_id == actor.id).collect();
        actor.goals = own
            .last()
            .map_or_else(|| actor.initial_goals.clone(), |d| d.goals.clone());
        let skip = own.len().saturating_sub(actor.history_limit);
        actor.history = own.into_iter().skip(skip).cloned().collect();
    }

    let costs = snapshot.costs.truncated_to_turn(at_turn);
    let total_cost = costs.total();

    let execution_metadata = ExecutionMetadata {
        forked_from: Some(snapshot.run_id.clone()),
        fork_point: Some(at_turn),
        labels: snapshot.execution_metadata.labels.clone(),
        ..ExecutionMetadata::default()
    };

    Ok(StateSnapshot {
        run_id: new_run_id.into(),
        scenario_id: snapshot.scenario_id.clone(),
        status: ScenarioStatus::Paused,
        turn: at_turn,
        current_phase: None,
        world,
        world_history,
        actors,
        decisions: decision_log
            .iter()
            .filter(|d| d.turn == at_turn)
            .map(|d| (d.actor_id.clone(), d.clone()))
            .collect(),
        decision_log,
        communications: snapshot
            .communications
            .iter()
            .filter(|c| c.turn <= at_turn)
            .cloned()
            .collect(),
        metrics: snapshot.metrics.iter().filter(|m| m.turn <= at_turn).cloned().collect(),
        costs,
        total_cost,
        execution_metadata,
        created_at: snapshot.created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ActorConfig, ScenarioConfig};
    use crate::ledger::{CostRecord, Money};
    use crate::state::{Decision, PhaseKind, Transformation, WorldState};
    use chrono::Utc;

    fn three_turns() -> StateSnapshot {
        let scenario = ScenarioConfig::new("s", "Start.").with_actor(ActorConfig::new("a", "A", "m"));
        let mut s = StateSnapshot::new("origin", &scenario, Utc::now())
            .apply(Transformation::SetStatus(ScenarioStatus::Running))
            .unwrap();
        for turn in 1..=3 {
            s = s
                .apply_all([
                    Transformation::AddDecision(Decision {
                        actor_id: "a".into(),
                        turn,
                        goals: vec![],
                        reasoning: String::new(),
                        action: format!("move {}", turn),
                        timestamp: Utc::now(),
                    }),
                    Transformation::AddCost(CostRecord {
                        timestamp: Utc::now(),
                        turn,
                        actor_id: Some("a".into()),
                        phase: PhaseKind::Decision,
                        model: "m".into(),
                        tokens_in: 1,
                        tokens_out: 1,
                        amount: Money::from_micros(100),
                        cached: false,
                    }),
                    Transformation::ReplaceWorld(WorldState {
                        turn,
                        narrative: format!("after turn {}", turn),
                        metadata: Default::default(),
                    }),
                    Transformation::AdvanceTurn,
                ])
                .unwrap();
        }
        s
    }

    #[test]
    fn test_fork_truncates_and_records_lineage() {
        let origin = three_turns();
        let branch = fork_with_id(&origin, 1, "branch").unwrap();

        assert_eq!(branch.run_id, "branch");
        assert_eq!(branch.turn, 1);
        assert_eq!(branch.status, ScenarioStatus::Paused);
        assert_eq!(branch.decision_log.len(), 1);
        assert_eq!(branch.costs.len(), 1);
        assert_eq!(branch.total_cost, Money::from_micros(100));
        assert_eq!(branch.world.narrative, "after turn 1");
        assert_eq!(branch.actors["a"].history.len(), 1);
        assert_eq!(branch.decisions["a"].action, "move 1");
        assert_eq!(branch.execution_metadata.forked_from.as_deref(), Some("origin"));
        assert_eq!(branch.execution_metadata.fork_point, Some(1));
    }

    #[test]
    fn test_fork_restores_actor_state_at_the_fork_point() {
        let mut scenario = ScenarioConfig::new("s", "Start.")
            .with_actor(ActorConfig::new("a", "A", "m").with_goal("goal-t0"))
            .with_actor(ActorConfig::new("b", "B", "m"));
        scenario.history_limit = 1;
        let mut s = StateSnapshot::new("origin", &scenario, Utc::now())
            .apply(Transformation::SetStatus(ScenarioStatus::Running))
            .unwrap();
        for turn in 1..=3 {
            let goals = vec![format!("goal-t{}", turn)];
            let mut actor = s.actors["a"].clone();
            actor.goals = goals.clone();
            let mut ts = vec![
                Transformation::UpsertActor(actor),
                Transformation::AddDecision(Decision {
                    actor_id: "a".into(),
                    turn,
                    goals,
                    reasoning: String::new(),
                    action: format!("a moves {}", turn),
                    timestamp: Utc::now(),
                }),
            ];
            // b only decides in the first turn.
            if turn == 1 {
                ts.push(Transformation::AddDecision(Decision {
                    actor_id: "b".into(),
                    turn,
                    goals: vec![],
                    reasoning: String::new(),
                    action: "b waits".into(),
                    timestamp: Utc::now(),
                }));
            }
            ts.push(Transformation::AdvanceTurn);
            s = s.apply_all(ts).unwrap();
        }
        assert_eq!(s.actors["a"].goals, vec!["goal-t3"]);
        assert_eq!(s.actors["a"].history[0].turn, 3);

        let at_two = fork(&s, 2).unwrap();
        let a = &at_two.actors["a"];
        assert_eq!(a.goals, vec!["goal-t2"]);
        assert_eq!(a.history.iter().map(|d| d.turn).collect::<Vec<_>>(), vec![2]);
        assert_eq!(at_two.decisions.keys().collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(at_two.actors["b"].history[0].action, "b waits");

        let at_one = fork(&s, 1).unwrap();
        assert_eq!(at_one.actors["a"].goals, vec!["goal-t1"]);
        assert_eq!(at_one.decisions.len(), 2);

        let at_zero = fork(&s, 0).unwrap();
        assert_eq!(at_zero.actors["a"].goals, vec!["goal-t0"]);
        assert!(at_zero.actors["a"].history.is_empty());
        assert!(at_zero.decisions.is_empty());
    }

    #[test]
    fn test_fork_at_zero_restores_initial_world() {
        let branch = fork(&three_turns(), 0).unwrap();
        assert_eq!(branch.world.narrative, "Start.");
        assert_eq!(branch.total_cost, Money::ZERO);
        assert_ne!(branch.run_id, "origin");
    }

    #[test]
    fn test_fork_beyond_history_rejected() {
        let err = fork(&three_turns(), 4).unwrap_err();
        assert!(matches!(err, StateError::InvalidForkPoint { requested: 4, available: 3 }));
    }
}

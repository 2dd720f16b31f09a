//! Prompt Composition
//!
//! Phases ask a [`PromptComposer`] for the messages of each call. The
//! composer owns all scenario-facing wording, so phases stay free of prose.

use crate::gateway::Message;
use crate::state::{ActorRecord, Communication, Decision, StateSnapshot};
use crate::utils::clip_middle;

const NARRATIVE_BUDGET: usize = 6_000;

pub trait PromptComposer: Send + Sync {
    fn decision(&self, snapshot: &StateSnapshot, actor: &ActorRecord, inbox: &[&Communication]) -> Vec<Message>;

    fn communication(&self, snapshot: &StateSnapshot, actor: &ActorRecord) -> Vec<Message>;

    /// `decisions` are the working turn's decisions in actor order.
    fn world_update(&self, snapshot: &StateSnapshot, decisions: &[&Decision]) -> Vec<Message>;

    fn validation(&self, snapshot: &StateSnapshot) -> Vec<Message>;
}

/// Plain-text prompts asking for the line-prefixed reply formats understood
/// by [`crate::orchestrator::parse`].
#[derive(Debug, Clone, Default)]
pub struct PlainComposer;

impl PlainComposer {
    fn actor_header(actor: &ActorRecord) -> String {
        let goals = if actor.goals.is_empty() {
            "none stated".to_string()
        } else {
            actor.goals.join("; ")
        };
        format!("You are {} (id: {}). Your goals: {}.", actor.name, actor.id, goals)
    }
}

impl PromptComposer for PlainComposer {
    fn decision(&self, snapshot: &StateSnapshot, actor: &ActorRecord, inbox: &[&Communication]) -> Vec<Message> {
        let system = format!(
            "{}\nDecide what you do this turn. Reply with a line starting REASONING: \
             followed by a line starting ACTION:. Optionally add a line GOALS: with your \
             updated goals separated by semicolons.",
            Self::actor_header(actor)
        );

        let mut user = format!(
            "Turn {}.\n\nCurrent situation:\n{}\n",
            snapshot.working_turn(),
            clip_middle(&snapshot.world.narrative, NARRATIVE_BUDGET)
        );
        if !actor.history.is_empty() {
            user.push_str("\nYour recent actions:\n");
            for d in &actor.history {
                user.push_str(&format!("- turn {}: {}\n", d.turn, d.action));
            }
        }
        if !inbox.is_empty() {
            user.push_str("\nMessages you received:\n");
            for m in inbox {
                user.push_str(&format!("- from {}: {}\n", m.from, m.content));
            }
        }

        vec![Message::system(system), Message::user(user)]
    }

    fn communication(&self, snapshot: &StateSnapshot, actor: &ActorRecord) -> Vec<Message> {
        let others: Vec<&str> = snapshot
            .actors
            .keys()
            .filter(|id| id.as_str() != actor.id)
            .map(String::as_str)
            .collect();
        let system = format!(
            "{}\nWrite one short message to the other parties before acting. Start the \
             first line with TO: followed by one of [{}] or 'all'.",
            Self::actor_header(actor),
            others.join(", ")
        );
        let user = format!(
            "Turn {}.\n\nCurrent situation:\n{}",
            snapshot.working_turn(),
            clip_middle(&snapshot.world.narrative, NARRATIVE_BUDGET)
        );
        vec![Message::system(system), Message::user(user)]
    }

    fn world_update(&self, snapshot: &StateSnapshot, decisions: &[&Decision]) -> Vec<Message> {
        let system = "You narrate a shared world. Given the current situation and what each \
                      party did, describe the new situation in a few paragraphs. Do not \
                      decide for the parties."
            .to_string();

        let mut user = format!(
            "Turn {}.\n\nCurrent situation:\n{}\n\nActions:\n",
            snapshot.working_turn(),
            clip_middle(&snapshot.world.narrative, NARRATIVE_BUDGET)
        );
        for d in decisions {
            let name = snapshot.actors.get(&d.actor_id).map_or(d.actor_id.as_str(), |a| a.name.as_str());
            user.push_str(&format!("- {}: {}\n", name, d.action));
        }

        vec![Message::system(system), Message::user(user)]
    }

    fn validation(&self, snapshot: &StateSnapshot) -> Vec<Message> {
        let system = "You review a simulated world for consistency. Reply OK if the \
                      narrative is consistent with the actions taken, otherwise one line per \
                      problem starting with ISSUE:."
            .to_string();

        let mut user = format!("Narrative after turn {}:\n{}\n\nActions:\n", snapshot.world.turn, snapshot.world.narrative);
        for d in snapshot.decisions_for_turn(snapshot.world.turn) {
            user.push_str(&format!("- {}: {}\n", d.actor_id, d.action));
        }
        vec![Message::system(system), Message::user(user)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ActorConfig, ScenarioConfig};
    use chrono::Utc;

    #[test]
    fn test_decision_prompt_mentions_goals_and_inbox() {
        let scenario = ScenarioConfig::new("s", "A tense summit.")
            .with_actor(ActorConfig::new("north", "Northland", "m").with_goal("secure water"))
            .with_actor(ActorConfig::new("south", "Southland", "m"));
        let snapshot = StateSnapshot::new("r", &scenario, Utc::now());
        let note = Communication {
            turn: 1,
            from: "south".into(),
            to: Some("north".into()),
            content: "Let us talk.".into(),
            timestamp: Utc::now(),
        };

        let msgs = PlainComposer.decision(&snapshot, &snapshot.actors["north"], &[&note]);
        assert_eq!(msgs.len(), 2);
        assert!(msgs[0].content.contains("secure water"));
        assert!(msgs[0].content.contains("ACTION:"));
        assert!(msgs[1].content.contains("A tense summit."));
        assert!(msgs[1].content.contains("Let us talk."));
    }
}

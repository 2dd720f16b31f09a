use serde::{Deserialize, Serialize};

use crate::state::StateSnapshot;

fn default_idle_keyword() -> String {
    "pass".to_string()
}

/// Declarative end condition, checked after every completed turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopCondition {
    /// The world narrative mentions `text` (case-insensitive).
    NarrativeContains { text: String },
    /// The latest value of metric `name` is at least `value`.
    MetricAtLeast { name: String, value: f64 },
    /// Every decision of the last turn contains `keyword` in its action.
    AllActorsIdle {
        #[serde(default = "default_idle_keyword")]
        keyword: String,
    },
    Any { conditions: Vec<StopCondition> },
    All { conditions: Vec<StopCondition> },
}

impl StopCondition {
    pub fn is_met(&self, snapshot: &StateSnapshot) -> bool {
        match self {
            StopCondition::NarrativeContains { text } => snapshot
                .world
                .narrative
                .to_lowercase()
                .contains(&text.to_lowercase()),
            StopCondition::MetricAtLeast { name, value } => {
                snapshot.latest_metric(name).is_some_and(|m| m.value >= *value)
            }
            StopCondition::AllActorsIdle { keyword } => {
                let keyword = keyword.to_lowercase();
                let mut decisions = snapshot.decisions_for_turn(snapshot.turn).peekable();
                decisions.peek().is_some() && decisions.all(|d| d.action.to_lowercase().contains(&keyword))
            }
            StopCondition::Any { conditions } => conditions.iter().any(|c| c.is_met(snapshot)),
            StopCondition::All { conditions } => {
                !conditions.is_empty() && conditions.iter().all(|c| c.is_met(snapshot))
            }
        }
    }
}

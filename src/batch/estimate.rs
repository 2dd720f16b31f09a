use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::config::ScenarioConfig;
use crate::ledger::{Money, PriceTable};

/// Upper-bound forecast for a batch, computed without any provider calls.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchEstimate {
    pub total_runs: usize,
    pub pending_runs: usize,
    pub calls: u64,
    pub cost: Money,
    /// Cost the batch has already spent in earlier sessions.
    pub spent: Money,
    pub duration: Duration,
    pub max_parallel: usize,
    pub exceeds_budget: bool,
}

impl fmt::Display for BatchEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Runs:      {} pending of {}", self.pending_runs, self.total_runs)?;
        writeln!(f, "Calls:     at most {}", self.calls)?;
        writeln!(f, "Cost:      at most {} (already spent {})", self.cost, self.spent)?;
        write!(
            f,
            "Duration:  about {}s with {} parallel runs",
            self.duration.as_secs(),
            self.max_parallel
        )?;
        if self.exceeds_budget {
            write!(f, "\nWarning:   estimate exceeds the batch budget")?;
        }
        Ok(())
    }
}

/// Worst case for one run: every turn, every enabled phase, full
/// `max_tokens` output, prompts approximated by the world text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunEstimate {
    pub calls: u64,
    /// Sequential call rounds; phases run one after another, actors within
    /// a phase concurrently.
    pub rounds: u64,
    pub cost: Money,
}

impl RunEstimate {
    pub fn for_scenario(scenario: &ScenarioConfig, pricing: &PriceTable) -> Self {
        let turns = u64::from(scenario.turns);
        let max_tokens = scenario.sampling.max_tokens;
        let prompt = scenario.initial_world.as_str();
        let actor_cost: Money = scenario
            .actors
            .iter()
            .map(|a| pricing.estimate(&a.model, prompt, max_tokens))
            .sum();

        let mut per_turn = RunEstimate::default();
        let mut add = |calls: u64, cost: Money| {
            per_turn.calls += calls;
            per_turn.rounds += 1;
            per_turn.cost += cost;
        };

        let actors = scenario.actors.len() as u64;
        if scenario.phases.communication && actors > 1 {
            add(actors, actor_cost);
        }
        add(actors, actor_cost);
        add(1, pricing.estimate(&scenario.world_model, prompt, max_tokens));
        if scenario.phases.validation {
            if let Some(model) = &scenario.validator_model {
                add(1, pricing.estimate(model, prompt, max_tokens));
            }
        }

        let cost: Money = (0..turns).map(|_| per_turn.cost).sum();
        let cost = match scenario.cost_limit_money() {
            Some(limit) => cost.min(limit),
            None => cost,
        };
        RunEstimate {
            calls: per_turn.calls * turns,
            rounds: per_turn.rounds * turns,
            cost,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ActorConfig;
    use crate::ledger::ModelPrice;

    #[test]
    fn test_run_estimate_counts_every_phase() {
        let mut s = ScenarioConfig::new("s", "w")
            .with_actor(ActorConfig::new("a", "A", "m"))
            .with_actor(ActorConfig::new("b", "B", "m"))
            .with_turns(2);
        s.sampling.max_tokens = 1000;
        let pricing = PriceTable::new().with_model("m", ModelPrice::new(0.0, 100.0));

        let e = RunEstimate::for_scenario(&s, &pricing);
        // 2 decisions + 1 world update per turn; no validator model
        assert_eq!(e.calls, 6);
        assert_eq!(e.rounds, 4);
        assert_eq!(e.cost, Money::from_dollars(0.40));
    }

    #[test]
    fn test_run_estimate_capped_by_run_limit() {
        let mut s = ScenarioConfig::new("s", "w")
            .with_actor(ActorConfig::new("a", "A", "m"))
            .with_turns(10)
            .with_cost_limit(0.25);
        s.sampling.max_tokens = 1000;
        let pricing = PriceTable::new().with_model("m", ModelPrice::new(0.0, 100.0));
        assert_eq!(RunEstimate::for_scenario(&s, &pricing).cost, Money::from_dollars(0.25));
    }
}

//! Configuration
//!
//! Declarative scenario and batch descriptions, loaded from YAML or JSON.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::batch::VariationAxis;
use crate::error::ConfigError;
use crate::gateway::SamplingParams;
use crate::ledger::{Money, PriceTable};
use crate::orchestrator::StopCondition;

fn default_history_limit() -> usize {
    5
}

fn default_world_model() -> String {
    "world-model".to_string()
}

fn default_turns() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorConfig {
    pub id: String,
    pub name: String,
    pub model: String,
    #[serde(default)]
    pub goals: Vec<String>,
}

impl ActorConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            model: model.into(),
            goals: Vec::new(),
        }
    }

    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.goals.push(goal.into());
        self
    }
}

/// Optional phases. Decision, WorldUpdate and Persistence always run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseToggles {
    #[serde(default)]
    pub communication: bool,
    #[serde(default = "enabled")]
    pub validation: bool,
}

fn enabled() -> bool {
    true
}

impl Default for PhaseToggles {
    fn default() -> Self {
        Self {
            communication: false,
            validation: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub initial_world: String,
    pub actors: Vec<ActorConfig>,
    #[serde(default = "default_world_model")]
    pub world_model: String,
    /// Turns after which the scenario is complete.
    #[serde(default = "default_turns")]
    pub turns: u32,
    #[serde(default)]
    pub stop_condition: Option<StopCondition>,
    #[serde(default)]
    pub phases: PhaseToggles,
    #[serde(default)]
    pub sampling: SamplingParams,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Per-run limit in dollars.
    #[serde(default)]
    pub cost_limit: Option<f64>,
    /// Model asked to review each turn for consistency, if any.
    #[serde(default)]
    pub validator_model: Option<String>,
    #[serde(default)]
    pub pricing: PriceTable,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

impl ScenarioConfig {
    pub fn new(id: impl Into<String>, initial_world: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            initial_world: initial_world.into(),
            actors: Vec::new(),
            world_model: default_world_model(),
            turns: default_turns(),
            stop_condition: None,
            phases: PhaseToggles::default(),
            sampling: SamplingParams::default(),
            history_limit: default_history_limit(),
            cost_limit: None,
            validator_model: None,
            pricing: PriceTable::default(),
            gateway: GatewayConfig::default(),
        }
    }

    pub fn with_actor(mut self, actor: ActorConfig) -> Self {
        self.actors.push(actor);
        self
    }

    pub fn with_turns(mut self, turns: u32) -> Self {
        self.turns = turns;
        self
    }

    pub fn with_world_model(mut self, model: impl Into<String>) -> Self {
        self.world_model = model.into();
        self
    }

    pub fn with_cost_limit(mut self, dollars: f64) -> Self {
        self.cost_limit = Some(dollars);
        self
    }

    pub fn with_phases(mut self, phases: PhaseToggles) -> Self {
        self.phases = phases;
        self
    }

    pub fn with_stop_condition(mut self, condition: StopCondition) -> Self {
        self.stop_condition = Some(condition);
        self
    }

    pub fn with_pricing(mut self, pricing: PriceTable) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn cost_limit_money(&self) -> Option<Money> {
        self.cost_limit.map(Money::from_dollars)
    }

    pub fn actor(&self, id: &str) -> Option<&ActorConfig> {
        self.actors.iter().find(|a| a.id == id)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.actors.is_empty() {
            return Err(ConfigError::Invalid(format!("scenario '{}' has no actors", self.id)));
        }
        let mut seen = HashSet::new();
        for actor in &self.actors {
            if !seen.insert(actor.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate actor id '{}'", actor.id)));
            }
        }
        if self.turns == 0 {
            return Err(ConfigError::Invalid("turns must be at least 1".into()));
        }
        if self.history_limit == 0 {
            return Err(ConfigError::Invalid("history_limit must be at least 1".into()));
        }
        if self.cost_limit.is_some_and(|l| l < 0.0) {
            return Err(ConfigError::Invalid("cost_limit cannot be negative".into()));
        }
        self.sampling.validate()?;
        self.gateway.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of each backoff delay that is randomized, in `[0, 1]`.
    pub jitter: f64,
    pub call_timeout_secs: u64,
    pub cache_enabled: bool,
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
    /// SQLite file backing the cache across restarts.
    pub cache_path: Option<PathBuf>,
    /// Model id -> ordered substitutes tried when it is unavailable.
    pub fallback_chains: BTreeMap<String, Vec<String>>,
    /// Shared across every worker of the process.
    pub requests_per_minute: Option<u32>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: 0.2,
            call_timeout_secs: 120,
            cache_enabled: true,
            cache_ttl_secs: 24 * 60 * 60,
            cache_capacity: 1024,
            cache_path: None,
            fallback_chains: BTreeMap::new(),
            requests_per_minute: None,
        }
    }
}

impl GatewayConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("gateway.max_attempts must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::Invalid("gateway.jitter must be within [0, 1]".into()));
        }
        if self.requests_per_minute == Some(0) {
            return Err(ConfigError::Invalid("gateway.requests_per_minute must be positive".into()));
        }
        Ok(())
    }
}

fn default_runs_per_variation() -> u32 {
    1
}

fn default_max_parallel() -> usize {
    4
}

fn default_assumed_latency_ms() -> u64 {
    3_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    pub experiment_name: String,
    /// Scenario file, relative to the batch file when loaded from disk.
    pub base_scenario: PathBuf,
    #[serde(default = "default_runs_per_variation")]
    pub runs_per_variation: u32,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Soft deadline: the run halts between phases once it passes.
    #[serde(default)]
    pub timeout_per_run_secs: Option<u64>,
    /// Global limit in dollars.
    #[serde(default)]
    pub budget_limit: Option<f64>,
    /// Per-run limit in dollars; overrides the scenario's own limit.
    #[serde(default)]
    pub cost_per_run_limit: Option<f64>,
    #[serde(default)]
    pub variations: Vec<VariationAxis>,
    pub output_dir: PathBuf,
    /// Used only by dry-run estimates.
    #[serde(default = "default_assumed_latency_ms")]
    pub assumed_latency_ms: u64,
    /// When false each run gets its own sampling seed so replicates never
    /// share cached responses.
    #[serde(default)]
    pub share_cache_across_runs: bool,
}

impl BatchConfig {
    pub fn new(experiment_name: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            experiment_name: experiment_name.into(),
            base_scenario: PathBuf::new(),
            runs_per_variation: default_runs_per_variation(),
            max_parallel: default_max_parallel(),
            timeout_per_run_secs: None,
            budget_limit: None,
            cost_per_run_limit: None,
            variations: Vec::new(),
            output_dir: output_dir.into(),
            assumed_latency_ms: default_assumed_latency_ms(),
            share_cache_across_runs: false,
        }
    }

    pub fn budget_limit_money(&self) -> Option<Money> {
        self.budget_limit.map(Money::from_dollars)
    }

    pub fn cost_per_run_limit_money(&self) -> Option<Money> {
        self.cost_per_run_limit.map(Money::from_dollars)
    }

    pub fn timeout_per_run(&self) -> Option<Duration> {
        self.timeout_per_run_secs.map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.experiment_name.trim().is_empty() {
            return Err(ConfigError::Invalid("experiment_name is empty".into()));
        }
        if self.max_parallel == 0 {
            return Err(ConfigError::Invalid("max_parallel must be at least 1".into()));
        }
        if self.runs_per_variation == 0 {
            return Err(ConfigError::Invalid("runs_per_variation must be at least 1".into()));
        }
        for axis in &self.variations {
            axis.validate()?;
        }
        Ok(())
    }
}

/// Parses YAML or JSON depending on the file extension.
pub fn load_file<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let parse_err = |reason: String| ConfigError::Parse {
        path: path.to_path_buf(),
        reason,
    };
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&text).map_err(|e| parse_err(e.to_string())),
        _ => serde_yaml::from_str(&text).map_err(|e| parse_err(e.to_string())),
    }
}

pub fn load_scenario(path: &Path) -> Result<ScenarioConfig, ConfigError> {
    let scenario: ScenarioConfig = load_file(path)?;
    scenario.validate()?;
    Ok(scenario)
}

/// Loads a batch file and the scenario it references.
pub fn load_batch(path: &Path) -> Result<(BatchConfig, ScenarioConfig), ConfigError> {
    let mut batch: BatchConfig = load_file(path)?;
    batch.validate()?;
    if batch.base_scenario.is_relative() {
        if let Some(dir) = path.parent() {
            batch.base_scenario = dir.join(&batch.base_scenario);
        }
    }
    let scenario = load_scenario(&batch.base_scenario)?;
    Ok((batch, scenario))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SCENARIO_YAML: &str = r#"
id: trade-talks
initial_world: Two nations meet at the border.
turns: 2
actors:
  - id: north
    name: Northland
    model: model-a
    goals: [secure water rights]
  - id: south
    name: Southland
    model: model-b
pricing:
  models:
    model-a: { input_per_million: 1.0, output_per_million: 2.0 }
gateway:
  max_attempts: 2
  fallback_chains:
    model-a: [model-b]
"#;

    #[test]
    fn test_scenario_yaml_defaults() {
        let scenario: ScenarioConfig = serde_yaml::from_str(SCENARIO_YAML).unwrap();
        scenario.validate().unwrap();
        assert_eq!(scenario.turns, 2);
        assert_eq!(scenario.world_model, "world-model");
        assert!(scenario.phases.validation);
        assert!(!scenario.phases.communication);
        assert_eq!(scenario.gateway.max_attempts, 2);
        assert_eq!(scenario.gateway.cache_capacity, 1024);
        assert_eq!(scenario.gateway.fallback_chains["model-a"], vec!["model-b".to_string()]);
    }

    #[test]
    fn test_duplicate_actor_rejected() {
        let scenario = ScenarioConfig::new("s", "w")
            .with_actor(ActorConfig::new("a", "A", "m"))
            .with_actor(ActorConfig::new("a", "A again", "m"));
        assert!(matches!(scenario.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_empty_scenario_rejected() {
        assert!(ScenarioConfig::new("s", "w").validate().is_err());
    }

    #[test]
    fn test_load_batch_resolves_relative_scenario() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("scenario.yaml"), SCENARIO_YAML).unwrap();
        std::fs::write(
            dir.path().join("batch.yaml"),
            r#"
experiment_name: sweep
base_scenario: scenario.yaml
runs_per_variation: 2
max_parallel: 3
budget_limit: 5.0
output_dir: out
variations:
  - name: temperature
    kind: temperature
    values: [0.2, 0.8]
"#,
        )
        .unwrap();

        let (batch, scenario) = load_batch(&dir.path().join("batch.yaml")).unwrap();
        assert_eq!(batch.runs_per_variation, 2);
        assert_eq!(batch.budget_limit_money(), Some(Money::from_dollars(5.0)));
        assert_eq!(batch.variations.len(), 1);
        assert_eq!(scenario.id, "trade-talks");
    }

    #[test]
    fn test_zero_parallelism_rejected() {
        let mut batch = BatchConfig::new("e", "out");
        batch.max_parallel = 0;
        assert!(batch.validate().is_err());
    }
}

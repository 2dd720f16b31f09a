//! Batch State - the resumable record of an experiment
//!
//! One JSON document per output directory listing every run of the batch,
//! its status, run id and cost. It is rewritten atomically after every status
//! change so an interrupted process can be restarted without repeating
//! finished work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::variation::{RunKey, Variation, VariationAxis};
use crate::config::{BatchConfig, GatewayConfig, ScenarioConfig};
use crate::error::BatchError;
use crate::ledger::Money;
use crate::state::{write_atomic, ScenarioStatus};

pub const BATCH_SCHEMA_VERSION: u32 = 1;
const STATE_FILE: &str = "batch_state.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    SkippedBudgetExceeded,
}

impl RunStatus {
    /// Terminal statuses are never dispatched again.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRun {
    pub key: RunKey,
    pub status: RunStatus,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    /// Spend on this key across every attempt.
    #[serde(default)]
    pub cost: Money,
    /// Spend of abandoned earlier attempts, already included in `cost`.
    #[serde(default)]
    pub earlier_attempts_cost: Money,
    /// Status of the scenario itself, which may differ from the batch view
    /// (a run halted by its own cost limit is still done).
    #[serde(default)]
    pub final_status: Option<ScenarioStatus>,
    #[serde(default)]
    pub turns_completed: u32,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl BatchRun {
    fn pending(key: RunKey, labels: BTreeMap<String, String>) -> Self {
        Self {
            key,
            status: RunStatus::Pending,
            run_id: None,
            attempts: 0,
            cost: Money::ZERO,
            earlier_attempts_cost: Money::ZERO,
            final_status: None,
            turns_completed: 0,
            error: None,
            labels,
            started_at: None,
            finished_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchState {
    pub schema_version: u32,
    pub experiment: String,
    /// Digest of everything that shapes the run list. Budgets, parallelism
    /// and timeouts may change between sessions; this may not.
    pub config_hash: String,
    pub runs: Vec<BatchRun>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BatchState {
    pub fn new(config: &BatchConfig, config_hash: String, variations: &[Variation]) -> Self {
        let runs = variations
            .iter()
            .flat_map(|v| {
                let labels = v.labels();
                (0..config.runs_per_variation).map(move |rep| BatchRun::pending(RunKey::new(v.index, rep), labels.clone()))
            })
            .collect();
        let now = Utc::now();
        Self {
            schema_version: BATCH_SCHEMA_VERSION,
            experiment: config.experiment_name.clone(),
            config_hash,
            runs,
            created_at: now,
            updated_at: now,
        }
    }

    /// Cumulative spend across every session of this batch.
    pub fn total_cost(&self) -> Money {
        self.runs.iter().map(|r| r.cost).sum()
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for run in &self.runs {
            match run.status {
                RunStatus::Pending => counts.pending += 1,
                RunStatus::Running => counts.running += 1,
                RunStatus::Completed => counts.completed += 1,
                RunStatus::Failed => counts.failed += 1,
                RunStatus::SkippedBudgetExceeded => counts.skipped += 1,
            }
        }
        counts
    }

    /// Indices of runs that still need work, in dispatch order.
    pub fn dispatchable(&self) -> Vec<usize> {
        self.runs
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.status.is_terminal())
            .map(|(i, _)| i)
            .collect()
    }

    /// Prepares a loaded state for a new session. Runs left `Running` by a
    /// crash and runs skipped for budget go back to `Pending`; failed runs
    /// keep their status but are re-attempted. Returns how many were reset.
    pub fn recover(&mut self) -> usize {
        let mut reset = 0;
        for run in &mut self.runs {
            if matches!(run.status, RunStatus::Running | RunStatus::SkippedBudgetExceeded) {
                run.status = RunStatus::Pending;
                reset += 1;
            }
        }
        reset
    }

    pub fn run(&self, key: RunKey) -> Option<&BatchRun> {
        self.runs.iter().find(|r| r.key == key)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Digest of the batch inputs that determine its run list. The scenario's
/// cost limit and gateway settings are left out, so budgets, timeouts and
/// rate limits can change between sessions.
pub fn config_hash(config: &BatchConfig, scenario: &ScenarioConfig) -> Result<String, BatchError> {
    #[derive(Serialize)]
    struct Shape<'a> {
        experiment: &'a str,
        runs_per_variation: u32,
        share_cache_across_runs: bool,
        variations: &'a [VariationAxis],
        scenario: &'a ScenarioConfig,
    }
    let scenario = ScenarioConfig {
        cost_limit: None,
        gateway: GatewayConfig::default(),
        ..scenario.clone()
    };
    let bytes = serde_json::to_vec(&Shape {
        experiment: &config.experiment_name,
        runs_per_variation: config.runs_per_variation,
        share_cache_across_runs: config.share_cache_across_runs,
        variations: &config.variations,
        scenario: &scenario,
    })?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

#[derive(Debug, Clone)]
pub struct BatchStateStore {
    path: PathBuf,
}

impl BatchStateStore {
    pub fn new(output_dir: impl AsRef<Path>) -> Self {
        Self {
            path: output_dir.as_ref().join(STATE_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<Option<BatchState>, BatchError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let raw: serde_json::Value = serde_json::from_slice(&bytes).map_err(|e| self.corrupt(e))?;
        let found = raw
            .get("schema_version")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| self.corrupt("missing schema_version"))? as u32;
        if found > BATCH_SCHEMA_VERSION {
            return Err(BatchError::UnsupportedVersion {
                found,
                supported: BATCH_SCHEMA_VERSION,
            });
        }

        let state: BatchState = serde_json::from_value(raw).map_err(|e| self.corrupt(e))?;
        info!(
            "Loaded batch state for '{}' ({} runs) from {}",
            state.experiment,
            state.runs.len(),
            self.path.display()
        );
        Ok(Some(state))
    }

    pub async fn save(&self, state: &BatchState) -> Result<(), BatchError> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let bytes = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.path, &bytes).await?;
        debug!(path = %self.path.display(), "Batch state saved");
        Ok(())
    }

    fn corrupt(&self, reason: impl ToString) -> BatchError {
        BatchError::CorruptState {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }
}

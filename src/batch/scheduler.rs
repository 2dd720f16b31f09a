//! Batch Scheduler
//!
//! Executes every run of an experiment with at most `max_parallel` runs in
//! flight. All runs share one gateway (so one cache and one rate limiter)
//! and one global budget meter; each run charges a child meter carrying its
//! own limit.
//!
//! The batch state is persisted after every status change. Restarting the
//! scheduler on the same output directory skips completed runs, resumes
//! interrupted ones from their snapshots and re-attempts the rest.

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::estimate::{BatchEstimate, RunEstimate};
use super::state::{config_hash, BatchState, BatchStateStore, RunStatus};
use super::variation::{expand, RunKey, Variation};
use crate::config::{BatchConfig, ScenarioConfig};
use crate::error::{BatchError, RunError};
use crate::gateway::{CacheStats, GenerationClient, GenerationGateway};
use crate::ledger::{BudgetMeter, BudgetScope, Money};
use crate::orchestrator::{EventBus, Orchestrator, PlainComposer, PromptComposer, SimulationEvent};
use crate::state::{HaltReason, ScenarioStatus, SnapshotStore, StateSnapshot};
use crate::utils::CancelToken;

const RUNS_DIR: &str = "runs";
const CACHE_FILE: &str = "response_cache.db";

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub experiment: String,
    pub total_runs: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub pending: usize,
    /// Spend across every session of the batch.
    pub total_cost: Money,
    /// Provider calls made in this session; cache hits excluded.
    pub external_calls: u64,
    pub cache: Option<CacheStats>,
    pub budget_exceeded: bool,
    pub stopped: bool,
    pub state_path: PathBuf,
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Experiment '{}': {} runs", self.experiment, self.total_runs)?;
        writeln!(
            f,
            "  completed {}, failed {}, skipped (budget) {}, pending {}",
            self.completed, self.failed, self.skipped, self.pending
        )?;
        writeln!(f, "  total cost {}, {} provider calls", self.total_cost, self.external_calls)?;
        if let Some(cache) = &self.cache {
            writeln!(f, "  cache hits {}, misses {}", cache.hits, cache.misses)?;
        }
        if self.budget_exceeded {
            writeln!(f, "  stopped early: batch budget exhausted")?;
        } else if self.stopped {
            writeln!(f, "  stopped early: stop requested; rerun to continue")?;
        }
        write!(f, "  state: {}", self.state_path.display())
    }
}

/// How a run will be (re)started.
enum Prepared {
    AlreadyCompleted(StateSnapshot),
    Start { run_id: String, resume_from: Option<StateSnapshot> },
}

struct RunReport {
    index: usize,
    run_id: String,
    timed_out: bool,
    result: Result<StateSnapshot, String>,
}

pub struct BatchScheduler {
    config: BatchConfig,
    scenario: ScenarioConfig,
    client: Arc<dyn GenerationClient>,
    events: Arc<EventBus>,
    composer: Arc<dyn PromptComposer>,
    stop: CancelToken,
}

impl BatchScheduler {
    pub fn new(config: BatchConfig, scenario: ScenarioConfig, client: Arc<dyn GenerationClient>) -> Self {
        Self {
            config,
            scenario,
            client,
            events: Arc::new(EventBus::new()),
            composer: Arc::new(PlainComposer),
            stop: CancelToken::new(),
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn with_composer(mut self, composer: Arc<dyn PromptComposer>) -> Self {
        self.composer = composer;
        self
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Cancelling this token stops dispatch and halts in-flight runs at their
    /// next checkpoint. Unfinished runs stay resumable.
    pub fn stop_handle(&self) -> CancelToken {
        self.stop.clone()
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.config.output_dir.join(RUNS_DIR)
    }

    pub fn snapshot_store(&self) -> SnapshotStore {
        SnapshotStore::new(self.runs_dir())
    }

    pub fn state_store(&self) -> BatchStateStore {
        BatchStateStore::new(&self.config.output_dir)
    }

    /// Forecasts the remaining work without calling any provider.
    pub async fn dry_run(&self) -> Result<BatchEstimate, BatchError> {
        let (variations, state) = self.plan().await?;
        let pending = state.dispatchable();

        let mut calls = 0;
        let mut rounds = 0;
        let mut cost = Money::ZERO;
        for &index in &pending {
            let key = state.runs[index].key;
            let scenario = self.scenario_for(variation(&variations, key, &state)?, key);
            let run = RunEstimate::for_scenario(&scenario, &scenario.pricing);
            calls += run.calls;
            rounds += run.rounds;
            cost += run.cost;
        }

        let spent = state.total_cost();
        let parallel = self.config.max_parallel.min(pending.len()).max(1) as u64;
        let duration = Duration::from_millis(self.config.assumed_latency_ms.saturating_mul(rounds) / parallel);
        Ok(BatchEstimate {
            total_runs: state.runs.len(),
            pending_runs: pending.len(),
            calls,
            cost,
            spent,
            duration,
            max_parallel: self.config.max_parallel,
            exceeds_budget: self.config.budget_limit_money().is_some_and(|limit| spent + cost > limit),
        })
    }

    pub async fn run(&self) -> Result<BatchSummary, BatchError> {
        let (variations, mut state) = self.plan().await?;
        let store = self.state_store();
        let snapshots = self.snapshot_store();

        self.reconcile_costs(&mut state, &snapshots).await;
        state.touch();
        store.save(&state).await?;

        let gateway = Arc::new(self.build_gateway().await?);
        let global = BudgetMeter::with_spent(BudgetScope::Global, self.config.budget_limit_money(), state.total_cost());

        let pending = state.dispatchable();
        info!(
            "Batch '{}': {} of {} runs to execute, {} in parallel",
            self.config.experiment_name,
            pending.len(),
            state.runs.len(),
            self.config.max_parallel
        );
        self.events.publish(SimulationEvent::BatchStarted {
            experiment: self.config.experiment_name.clone(),
            total_runs: state.runs.len(),
            pending_runs: pending.len(),
        });

        let slots = Arc::new(Semaphore::new(self.config.max_parallel));
        let mut tasks: JoinSet<RunReport> = JoinSet::new();
        let mut budget_exhausted = false;
        let mut stopped = false;

        for index in pending {
            // Wait for a free slot, recording finished runs meanwhile.
            let permit = loop {
                if let Ok(permit) = Arc::clone(&slots).try_acquire_owned() {
                    break Some(permit);
                }
                tokio::select! {
                    Some(joined) = tasks.join_next() => {
                        budget_exhausted |= self.record(&mut state, joined);
                        store.save(&state).await?;
                    }
                    _ = self.stop.cancelled() => break None,
                }
            };
            let Some(permit) = permit else {
                stopped = true;
                break;
            };
            if self.stop.is_cancelled() {
                stopped = true;
                break;
            }
            if budget_exhausted || global.is_tripped() {
                budget_exhausted = true;
                break;
            }

            let key = state.runs[index].key;
            let scenario = Arc::new(self.scenario_for(variation(&variations, key, &state)?, key));

            let (run_id, resume_from) = match self.prepare(&state, index, &snapshots).await {
                Prepared::AlreadyCompleted(snapshot) => {
                    info!("Run {} ({}) already completed before the interruption", snapshot.run_id, key);
                    let run = &mut state.runs[index];
                    run.status = RunStatus::Completed;
                    run.cost = run.earlier_attempts_cost + snapshot.total_cost;
                    run.final_status = Some(snapshot.status);
                    run.turns_completed = snapshot.turn;
                    run.finished_at = Some(Utc::now());
                    state.touch();
                    store.save(&state).await?;
                    continue;
                }
                Prepared::Start { run_id, resume_from } => (run_id, resume_from),
            };

            let seeded = resume_from.as_ref().map(|s| s.total_cost).unwrap_or_default();
            let meter = global.child(scenario.cost_limit_money(), seeded);
            let cancel = self.stop.child();
            let orchestrator = Orchestrator::new(Arc::clone(&scenario), Arc::clone(&gateway))
                .with_meter(meter)
                .with_events(Arc::clone(&self.events))
                .with_composer(Arc::clone(&self.composer))
                .with_store(snapshots.clone())
                .with_cancel(cancel)
                .with_labels(state.runs[index].labels.clone());

            {
                let run = &mut state.runs[index];
                if resume_from.is_none() {
                    run.earlier_attempts_cost = run.cost;
                }
                run.status = RunStatus::Running;
                run.run_id = Some(run_id.clone());
                run.attempts += 1;
                run.error = None;
                run.started_at = Some(Utc::now());
                run.finished_at = None;
            }
            state.touch();
            store.save(&state).await?;

            info!(
                "Dispatching run {} ({}){}",
                run_id,
                key,
                if resume_from.is_some() { " from its snapshot" } else { "" }
            );
            self.events.publish(SimulationEvent::BatchRunStarted {
                run_key: key.to_string(),
                run_id: run_id.clone(),
            });

            let timeout = self.config.timeout_per_run();
            tasks.spawn(async move {
                let outcome = AssertUnwindSafe(execute(&orchestrator, run_id.clone(), resume_from, timeout))
                    .catch_unwind()
                    .await;
                drop(permit);
                let (result, timed_out) = match outcome {
                    Ok((result, timed_out)) => (result.map_err(|e| e.to_string()), timed_out),
                    Err(_) => (Err("run panicked".to_string()), false),
                };
                RunReport {
                    index,
                    run_id,
                    timed_out,
                    result,
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            budget_exhausted |= self.record(&mut state, joined);
            store.save(&state).await?;
        }

        budget_exhausted |= global.is_tripped();
        if budget_exhausted && !stopped {
            let mut skipped = 0;
            for run in state.runs.iter_mut().filter(|r| r.status == RunStatus::Pending) {
                run.status = RunStatus::SkippedBudgetExceeded;
                skipped += 1;
            }
            warn!(
                "Batch '{}' budget exhausted at {}; {} runs skipped",
                self.config.experiment_name,
                global.spent(),
                skipped
            );
            if let Some(limit) = global.limit() {
                self.events.publish(SimulationEvent::BatchBudgetExceeded {
                    spent: global.spent(),
                    limit,
                });
            }
        }
        state.touch();
        store.save(&state).await?;

        let counts = state.counts();
        let summary = BatchSummary {
            experiment: self.config.experiment_name.clone(),
            total_runs: state.runs.len(),
            completed: counts.completed,
            failed: counts.failed,
            skipped: counts.skipped,
            pending: counts.pending + counts.running,
            total_cost: state.total_cost(),
            external_calls: gateway.external_calls(),
            cache: gateway.cache().map(|c| c.stats()),
            budget_exceeded: budget_exhausted,
            stopped,
            state_path: store.path().to_path_buf(),
        };
        self.events.publish(SimulationEvent::BatchFinished {
            experiment: summary.experiment.clone(),
            completed: summary.completed,
            failed: summary.failed,
            skipped: summary.skipped,
            pending: summary.pending,
            total_cost: summary.total_cost,
        });
        info!(
            "Batch '{}' finished: {} completed, {} failed, {} skipped, {} pending, total {}",
            summary.experiment, summary.completed, summary.failed, summary.skipped, summary.pending, summary.total_cost
        );
        Ok(summary)
    }

    /// Validates the configuration and loads (or creates) the batch state.
    async fn plan(&self) -> Result<(Vec<Variation>, BatchState), BatchError> {
        self.config.validate()?;
        self.scenario.validate()?;
        let variations = expand(&self.config.variations);
        let hash = config_hash(&self.config, &self.scenario)?;

        let state = match self.state_store().load().await? {
            Some(state) if state.config_hash != hash => {
                return Err(BatchError::ConfigMismatch {
                    expected: hash,
                    found: state.config_hash,
                })
            }
            Some(mut state) => {
                let reset = state.recover();
                if reset > 0 {
                    info!("Re-queued {} interrupted or skipped runs", reset);
                }
                state
            }
            None => BatchState::new(&self.config, hash, &variations),
        };
        Ok((variations, state))
    }

    /// A crash leaves the cost of in-flight runs only in their snapshots.
    async fn reconcile_costs(&self, state: &mut BatchState, snapshots: &SnapshotStore) {
        for run in state.runs.iter_mut().filter(|r| r.status != RunStatus::Completed) {
            let Some(run_id) = &run.run_id else { continue };
            if let Ok(Some(snapshot)) = snapshots.try_load(run_id).await {
                run.cost = run.earlier_attempts_cost + snapshot.total_cost;
            }
        }
    }

    async fn prepare(&self, state: &BatchState, index: usize, snapshots: &SnapshotStore) -> Prepared {
        if let Some(run_id) = &state.runs[index].run_id {
            match snapshots.try_load(run_id).await {
                Ok(Some(snapshot)) if snapshot.status == ScenarioStatus::Completed => {
                    return Prepared::AlreadyCompleted(snapshot);
                }
                Ok(Some(snapshot))
                    if matches!(
                        snapshot.status,
                        ScenarioStatus::Running | ScenarioStatus::Paused | ScenarioStatus::Halted
                    ) =>
                {
                    return Prepared::Start {
                        run_id: run_id.clone(),
                        resume_from: Some(snapshot),
                    };
                }
                Ok(_) => {}
                Err(e) => warn!("Snapshot of run {} is unusable, starting over: {}", run_id, e),
            }
        }
        Prepared::Start {
            run_id: Uuid::new_v4().to_string(),
            resume_from: None,
        }
    }

    fn scenario_for(&self, variation: &Variation, key: RunKey) -> ScenarioConfig {
        let mut base = self.scenario.clone();
        if let Some(limit) = self.config.cost_per_run_limit {
            base.cost_limit = Some(limit);
        }
        let mut scenario = variation.apply(&base);
        if !self.config.share_cache_across_runs {
            scenario.sampling.seed = Some(key.seed(&self.config.experiment_name, self.scenario.sampling.seed));
        }
        scenario
    }

    async fn build_gateway(&self) -> Result<GenerationGateway, BatchError> {
        let mut config = self.scenario.gateway.clone();
        if config.cache_enabled && config.cache_path.is_none() {
            config.cache_path = Some(self.config.output_dir.join(CACHE_FILE));
        }
        Ok(GenerationGateway::from_config(Arc::clone(&self.client), &config, self.scenario.pricing.clone()).await?)
    }

    /// Folds a finished run into the state. Returns `true` when the run was
    /// stopped by the batch budget.
    fn record(&self, state: &mut BatchState, joined: Result<RunReport, JoinError>) -> bool {
        let report = match joined {
            Ok(report) => report,
            Err(e) => {
                error!("Batch worker task was lost: {}", e);
                return false;
            }
        };

        let run = &mut state.runs[report.index];
        run.finished_at = Some(Utc::now());
        match &report.result {
            Ok(snapshot) => {
                let (status, error) = classify(snapshot, report.timed_out);
                run.status = status;
                run.error = error;
                run.cost = run.earlier_attempts_cost + snapshot.total_cost;
                run.final_status = Some(snapshot.status);
                run.turns_completed = snapshot.turn;
            }
            Err(cause) => {
                error!("Run {} ({}) could not execute: {}", report.run_id, run.key, cause);
                run.status = RunStatus::Failed;
                run.error = Some(cause.clone());
            }
        }

        info!("Run {} ({}) finished as {:?}, cost {}", report.run_id, run.key, run.status, run.cost);
        self.events.publish(SimulationEvent::BatchRunFinished {
            run_key: run.key.to_string(),
            run_id: report.run_id,
            status: run.status,
            cost: run.cost,
        });
        let exhausted = run.status == RunStatus::SkippedBudgetExceeded;
        state.touch();
        exhausted
    }
}

fn variation<'a>(variations: &'a [Variation], key: RunKey, state: &BatchState) -> Result<&'a Variation, BatchError> {
    variations.get(key.variation).ok_or_else(|| BatchError::CorruptState {
        path: PathBuf::from(&state.experiment),
        reason: format!("run {} refers to an unknown variation", key),
    })
}

/// Batch view of a finished run.
fn classify(snapshot: &StateSnapshot, timed_out: bool) -> (RunStatus, Option<String>) {
    match snapshot.status {
        ScenarioStatus::Completed => (RunStatus::Completed, None),
        ScenarioStatus::Failed => (
            RunStatus::Failed,
            snapshot.execution_metadata.failure.as_ref().map(|f| f.cause.clone()),
        ),
        ScenarioStatus::Halted => match snapshot.execution_metadata.halt_reason {
            Some(HaltReason::CostLimit {
                scope: BudgetScope::Global,
            }) => (RunStatus::SkippedBudgetExceeded, Some("batch budget exhausted".into())),
            // The run's own limit or turn cap ends it for good.
            Some(HaltReason::CostLimit { scope: BudgetScope::Run }) | Some(HaltReason::TurnLimit { .. }) => {
                (RunStatus::Completed, None)
            }
            Some(HaltReason::ProviderQuota) => (RunStatus::Failed, Some("provider quota exhausted".into())),
            Some(HaltReason::StopRequested) if timed_out => (RunStatus::Failed, Some("timed out".into())),
            Some(HaltReason::StopRequested) | None => (RunStatus::Pending, None),
        },
        _ => (RunStatus::Pending, None),
    }
}

async fn execute(
    orchestrator: &Orchestrator,
    run_id: String,
    resume_from: Option<StateSnapshot>,
    timeout: Option<Duration>,
) -> (Result<StateSnapshot, RunError>, bool) {
    let run = async {
        match resume_from {
            Some(snapshot) => orchestrator.resume(snapshot).await,
            None => orchestrator.start_with_id(run_id).await,
        }
    };
    tokio::pin!(run);

    let Some(limit) = timeout else {
        return (run.await, false);
    };
    tokio::select! {
        result = &mut run => (result, false),
        _ = tokio::time::sleep(limit) => {
            warn!("Run exceeded its {:?} time limit; stopping at the next checkpoint", limit);
            orchestrator.cancel_token().cancel();
            (run.await, true)
        }
    }
}

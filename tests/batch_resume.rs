//! Batch execution across interruptions, restarts and budget limits.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rust_conclave::batch::{AxisValues, BatchScheduler, BatchStateStore, RunStatus, VariationAxis};
use rust_conclave::config::{ActorConfig, BatchConfig, ScenarioConfig};
use rust_conclave::error::ClientError;
use rust_conclave::gateway::{Generation, GenerationClient, Message, SamplingParams};
use rust_conclave::ledger::{ModelPrice, Money, PriceTable};
use rust_conclave::orchestrator::{EventBus, EventFilter, EventKind};
use rust_conclave::state::ScenarioStatus;
use rust_conclave::utils::CancelToken;

/// Bills the full output allowance on every call.
#[derive(Default)]
struct CountingClient {
    calls: AtomicUsize,
}

#[async_trait]
impl GenerationClient for CountingClient {
    async fn generate(
        &self,
        _model: &str,
        _messages: &[Message],
        sampling: &SamplingParams,
    ) -> Result<Generation, ClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Generation::new("REASONING: steady\nACTION: holds course", 0, sampling.max_tokens))
    }
}

/// Holds every call for `delay` and tracks how many distinct runs (told
/// apart by their sampling seed) have a call in flight at once.
struct SlowClient {
    delay: Duration,
    slow: AtomicBool,
    actor_calls: AtomicUsize,
    active: Mutex<HashMap<Option<u64>, usize>>,
    peak_runs: AtomicUsize,
    /// Cancelled once this many runs have a call in flight.
    stop_at: Mutex<Option<(usize, CancelToken)>>,
}

impl SlowClient {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            slow: AtomicBool::new(true),
            actor_calls: AtomicUsize::new(0),
            active: Mutex::new(HashMap::new()),
            peak_runs: AtomicUsize::new(0),
            stop_at: Mutex::new(None),
        }
    }

    fn enter(&self, seed: Option<u64>) {
        let mut active = self.active.lock().unwrap();
        *active.entry(seed).or_default() += 1;
        self.peak_runs.fetch_max(active.len(), Ordering::SeqCst);
        if let Some((runs, stop)) = &*self.stop_at.lock().unwrap() {
            if active.len() >= *runs {
                stop.cancel();
            }
        }
    }

    fn leave(&self, seed: Option<u64>) {
        let mut active = self.active.lock().unwrap();
        if let Some(n) = active.get_mut(&seed) {
            *n -= 1;
            if *n == 0 {
                active.remove(&seed);
            }
        }
    }
}

#[async_trait]
impl GenerationClient for SlowClient {
    async fn generate(
        &self,
        model: &str,
        _messages: &[Message],
        sampling: &SamplingParams,
    ) -> Result<Generation, ClientError> {
        if model == "actor-model" {
            self.actor_calls.fetch_add(1, Ordering::SeqCst);
        }
        self.enter(sampling.seed);
        if self.slow.load(Ordering::SeqCst) {
            tokio::time::sleep(self.delay).await;
        }
        self.leave(sampling.seed);
        Ok(Generation::new("REASONING: steady\nACTION: holds course", 0, sampling.max_tokens))
    }
}

/// Two actors, one turn: $0.20 per run.
fn scenario() -> ScenarioConfig {
    let mut s = ScenarioConfig::new("sweep", "Two captains share a harbour.")
        .with_actor(ActorConfig::new("a", "Captain A", "actor-model"))
        .with_actor(ActorConfig::new("b", "Captain B", "actor-model"))
        .with_turns(1)
        .with_pricing(PriceTable::new().with_model("actor-model", ModelPrice::new(0.0, 100.0)));
    s.sampling.max_tokens = 1000;
    s
}

/// 2 temperatures x 3 repetitions = 6 runs.
fn batch(dir: &Path) -> BatchConfig {
    let mut b = BatchConfig::new("harbour", dir);
    b.runs_per_variation = 3;
    b.max_parallel = 1;
    b.variations = vec![VariationAxis::new(
        "temperature",
        AxisValues::Temperature { values: vec![0.3, 0.9] },
    )];
    b
}

fn scheduler(config: BatchConfig, client: Arc<CountingClient>) -> BatchScheduler {
    BatchScheduler::new(config, scenario(), client)
}

#[tokio::test]
async fn test_stop_then_resume_runs_each_key_once() {
    let dir = tempfile::tempdir().unwrap();
    let first_client = Arc::new(CountingClient::default());
    let events = Arc::new(EventBus::new());
    let first = scheduler(batch(dir.path()), first_client.clone()).with_events(events.clone());

    let stop = first.stop_handle();
    let finished = Arc::new(AtomicUsize::new(0));
    let counter = finished.clone();
    events.subscribe(EventFilter::Kind(EventKind::BatchRunFinished), move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
            stop.cancel();
        }
        Ok(())
    });

    let partial = first.run().await.unwrap();
    assert!(partial.stopped);
    assert_eq!(partial.completed, 2);
    assert_eq!(partial.pending, 4);
    assert_eq!(first_client.calls.load(Ordering::SeqCst), 2 * 3);

    let second_client = Arc::new(CountingClient::default());
    let second = scheduler(batch(dir.path()), second_client.clone());
    assert_eq!(second.dry_run().await.unwrap().pending_runs, 4);

    let full = second.run().await.unwrap();
    assert_eq!(full.completed, 6);
    assert_eq!(full.pending, 0);
    assert_eq!(full.total_cost, Money::from_dollars(1.20));
    assert_eq!(second_client.calls.load(Ordering::SeqCst), 4 * 3);

    let state = BatchStateStore::new(dir.path()).load().await.unwrap().unwrap();
    let ids: HashSet<_> = state.runs.iter().filter_map(|r| r.run_id.clone()).collect();
    assert_eq!(ids.len(), 6);
    assert!(state.runs.iter().all(|r| r.attempts == 1));
}

#[tokio::test]
async fn test_completed_snapshot_behind_a_running_entry_is_not_rerun() {
    let dir = tempfile::tempdir().unwrap();
    scheduler(batch(dir.path()), Arc::new(CountingClient::default()))
        .run()
        .await
        .unwrap();

    // Simulate a crash between the final snapshot write and the state update.
    let store = BatchStateStore::new(dir.path());
    let mut state = store.load().await.unwrap().unwrap();
    state.runs[0].status = RunStatus::Running;
    store.save(&state).await.unwrap();

    let client = Arc::new(CountingClient::default());
    let summary = scheduler(batch(dir.path()), client.clone()).run().await.unwrap();
    assert_eq!(summary.completed, 6);
    assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    assert_eq!(summary.total_cost, Money::from_dollars(1.20));
}

#[tokio::test]
async fn test_run_without_snapshot_restarts_under_a_new_id() {
    let dir = tempfile::tempdir().unwrap();
    scheduler(batch(dir.path()), Arc::new(CountingClient::default()))
        .run()
        .await
        .unwrap();

    let store = BatchStateStore::new(dir.path());
    let mut state = store.load().await.unwrap().unwrap();
    let lost_id = state.runs[3].run_id.clone().unwrap();
    state.runs[3].status = RunStatus::Running;
    state.runs[3].cost = Money::ZERO;
    store.save(&state).await.unwrap();
    std::fs::remove_file(dir.path().join("runs").join(format!("{}.state.json", lost_id))).unwrap();

    let summary = scheduler(batch(dir.path()), Arc::new(CountingClient::default()))
        .run()
        .await
        .unwrap();
    assert_eq!(summary.completed, 6);

    let state = store.load().await.unwrap().unwrap();
    let rerun = &state.runs[3];
    assert_ne!(rerun.run_id.as_deref(), Some(lost_id.as_str()));
    assert_eq!(rerun.attempts, 2);
    assert_eq!(rerun.status, RunStatus::Completed);
}

#[tokio::test]
async fn test_global_budget_skips_remaining_runs() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = batch(dir.path());
    config.budget_limit = Some(0.30);

    let summary = scheduler(config, Arc::new(CountingClient::default())).run().await.unwrap();

    assert!(summary.budget_exceeded);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.skipped, 5);
    assert!(summary.total_cost <= Money::from_dollars(0.30));

    let state = BatchStateStore::new(dir.path()).load().await.unwrap().unwrap();
    assert_eq!(state.runs[0].status, RunStatus::Completed);
    assert!(state.runs[1..]
        .iter()
        .all(|r| r.status == RunStatus::SkippedBudgetExceeded));
}

#[tokio::test]
async fn test_per_run_limit_halts_only_that_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = batch(dir.path());
    config.cost_per_run_limit = Some(0.10);

    let summary = scheduler(config, Arc::new(CountingClient::default())).run().await.unwrap();
    assert!(!summary.budget_exceeded);
    assert_eq!(summary.completed, 6);
    assert_eq!(summary.total_cost, Money::from_dollars(0.60));

    let state = BatchStateStore::new(dir.path()).load().await.unwrap().unwrap();
    assert!(state
        .runs
        .iter()
        .all(|r| r.final_status == Some(ScenarioStatus::Halted)));
}

#[tokio::test]
async fn test_labels_reach_run_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let s = scheduler(batch(dir.path()), Arc::new(CountingClient::default()));
    s.run().await.unwrap();

    let state = s.state_store().load().await.unwrap().unwrap();
    let last = state.runs.last().unwrap();
    let snapshot = s.snapshot_store().load(last.run_id.as_deref().unwrap()).await.unwrap();
    assert_eq!(snapshot.execution_metadata.labels["temperature"], "0.9");
}

#[tokio::test]
async fn test_parallel_runs_never_exceed_the_worker_limit() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = batch(dir.path());
    config.max_parallel = 2;
    let client = Arc::new(SlowClient::new(Duration::from_millis(100)));

    let summary = BatchScheduler::new(config, scenario(), client.clone()).run().await.unwrap();

    assert_eq!(summary.completed, 6);
    assert_eq!(client.peak_runs.load(Ordering::SeqCst), 2);
    assert_eq!(client.actor_calls.load(Ordering::SeqCst), 6 * 2);
}

#[tokio::test]
async fn test_timed_out_run_fails_then_resumes_from_its_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = batch(dir.path());
    config.variations = vec![VariationAxis::new("temperature", AxisValues::Temperature { values: vec![0.5] })];
    config.runs_per_variation = 1;
    config.timeout_per_run_secs = Some(1);

    // Both decisions outlast the limit; they still finish and are billed.
    let slow = Arc::new(SlowClient::new(Duration::from_millis(1500)));
    let first = BatchScheduler::new(config.clone(), scenario(), slow.clone()).run().await.unwrap();
    assert_eq!(first.failed, 1);
    assert_eq!(first.total_cost, Money::from_dollars(0.20));

    let store = BatchStateStore::new(dir.path());
    let state = store.load().await.unwrap().unwrap();
    let run = &state.runs[0];
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_deref(), Some("timed out"));
    assert_eq!(run.final_status, Some(ScenarioStatus::Halted));
    let run_id = run.run_id.clone().unwrap();

    let fast = Arc::new(SlowClient::new(Duration::ZERO));
    fast.slow.store(false, Ordering::SeqCst);
    let second = BatchScheduler::new(config, scenario(), fast.clone()).run().await.unwrap();
    assert_eq!(second.completed, 1);
    assert_eq!(second.total_cost, Money::from_dollars(0.20));
    assert_eq!(fast.actor_calls.load(Ordering::SeqCst), 0);

    let state = store.load().await.unwrap().unwrap();
    assert_eq!(state.runs[0].run_id.as_deref(), Some(run_id.as_str()));
    assert_eq!(state.runs[0].attempts, 2);
    assert_eq!(state.runs[0].final_status, Some(ScenarioStatus::Completed));
}

#[tokio::test]
async fn test_stop_with_runs_in_flight_keeps_their_billed_work() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = batch(dir.path());
    config.max_parallel = 3;
    let client = Arc::new(SlowClient::new(Duration::from_millis(50)));
    let first = BatchScheduler::new(config.clone(), scenario(), client.clone());
    *client.stop_at.lock().unwrap() = Some((2, first.stop_handle()));

    let partial = first.run().await.unwrap();
    assert!(partial.stopped);
    assert_eq!(partial.completed + partial.pending, 6);

    // The calls in flight at the stop finished and are in the books.
    let served = client.actor_calls.load(Ordering::SeqCst) as i64;
    assert!(served >= 2);
    assert_eq!(partial.total_cost, Money::from_micros(100_000 * served));
    *client.stop_at.lock().unwrap() = None;

    let store = BatchStateStore::new(dir.path());
    let state = store.load().await.unwrap().unwrap();
    let dispatched: Vec<_> = state.runs.iter().filter(|r| r.run_id.is_some()).collect();
    assert!((2..=3).contains(&dispatched.len()));
    assert!(state.runs.iter().all(|r| r.status != RunStatus::Running));

    let second = BatchScheduler::new(config, scenario(), client.clone()).run().await.unwrap();
    assert_eq!(second.completed, 6);
    assert_eq!(second.total_cost, Money::from_dollars(1.20));
    // No decision was requested twice across the two sessions.
    assert_eq!(client.actor_calls.load(Ordering::SeqCst), 6 * 2);

    let state = store.load().await.unwrap().unwrap();
    let ids: HashSet<_> = state.runs.iter().filter_map(|r| r.run_id.clone()).collect();
    assert_eq!(ids.len(), 6);
    for (run, before) in state.runs.iter().zip(dispatched.iter()) {
        assert_eq!(run.run_id, before.run_id);
    }
}

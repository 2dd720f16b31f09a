//! Simulation Event Bus
//!
//! In-process publish/subscribe for lifecycle notifications. Delivery is
//! best effort: a handler that errors or panics is logged and skipped, and
//! `publish` itself never fails. Nothing in the execution core reads events
//! back, so subscribers cannot influence a run.

use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::batch::RunStatus;
use crate::error::ErrorClass;
use crate::ledger::Money;
use crate::state::{HaltReason, PhaseKind, ScenarioStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum SimulationEvent {
    RunStarted {
        run_id: String,
        scenario_id: String,
        /// Turn the run continues from; zero for a fresh run.
        from_turn: u32,
        resumed: bool,
    },
    StatusChanged {
        run_id: String,
        from: ScenarioStatus,
        to: ScenarioStatus,
    },
    TurnStarted { run_id: String, turn: u32 },
    PhaseStarted { run_id: String, turn: u32, phase: PhaseKind },
    PhaseCompleted { run_id: String, turn: u32, phase: PhaseKind },
    ActorDecided {
        run_id: String,
        turn: u32,
        actor_id: String,
        cached: bool,
    },
    ActorFailed {
        run_id: String,
        turn: u32,
        actor_id: String,
        class: ErrorClass,
        error: String,
    },
    CostRecorded {
        run_id: String,
        phase: PhaseKind,
        actor_id: Option<String>,
        amount: Money,
        run_total: Money,
    },
    TurnCompleted { run_id: String, turn: u32, total_cost: Money },
    SnapshotPersisted { run_id: String, turn: u32 },
    RunHalted { run_id: String, turn: u32, reason: HaltReason },
    RunFailed {
        run_id: String,
        last_completed_turn: u32,
        class: ErrorClass,
        cause: String,
    },
    RunFinished {
        run_id: String,
        status: ScenarioStatus,
        turns: u32,
        total_cost: Money,
    },
    BatchStarted {
        experiment: String,
        total_runs: usize,
        pending_runs: usize,
    },
    BatchRunStarted { run_key: String, run_id: String },
    BatchRunFinished {
        run_key: String,
        run_id: String,
        status: RunStatus,
        cost: Money,
    },
    BatchBudgetExceeded { spent: Money, limit: Money },
    BatchFinished {
        experiment: String,
        completed: usize,
        failed: usize,
        skipped: usize,
        pending: usize,
        total_cost: Money,
    },
}

/// Discriminant of [`SimulationEvent`], used for filtered subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    RunStarted,
    StatusChanged,
    TurnStarted,
    PhaseStarted,
    PhaseCompleted,
    ActorDecided,
    ActorFailed,
    CostRecorded,
    TurnCompleted,
    SnapshotPersisted,
    RunHalted,
    RunFailed,
    RunFinished,
    BatchStarted,
    BatchRunStarted,
    BatchRunFinished,
    BatchBudgetExceeded,
    BatchFinished,
}

impl SimulationEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SimulationEvent::RunStarted { .. } => EventKind::RunStarted,
            SimulationEvent::StatusChanged { .. } => EventKind::StatusChanged,
            SimulationEvent::TurnStarted { .. } => EventKind::TurnStarted,
            SimulationEvent::PhaseStarted { .. } => EventKind::PhaseStarted,
            SimulationEvent::PhaseCompleted { .. } => EventKind::PhaseCompleted,
            SimulationEvent::ActorDecided { .. } => EventKind::ActorDecided,
            SimulationEvent::ActorFailed { .. } => EventKind::ActorFailed,
            SimulationEvent::CostRecorded { .. } => EventKind::CostRecorded,
            SimulationEvent::TurnCompleted { .. } => EventKind::TurnCompleted,
            SimulationEvent::SnapshotPersisted { .. } => EventKind::SnapshotPersisted,
            SimulationEvent::RunHalted { .. } => EventKind::RunHalted,
            SimulationEvent::RunFailed { .. } => EventKind::RunFailed,
            SimulationEvent::RunFinished { .. } => EventKind::RunFinished,
            SimulationEvent::BatchStarted { .. } => EventKind::BatchStarted,
            SimulationEvent::BatchRunStarted { .. } => EventKind::BatchRunStarted,
            SimulationEvent::BatchRunFinished { .. } => EventKind::BatchRunFinished,
            SimulationEvent::BatchBudgetExceeded { .. } => EventKind::BatchBudgetExceeded,
            SimulationEvent::BatchFinished { .. } => EventKind::BatchFinished,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    All,
    Kind(EventKind),
}

impl EventFilter {
    pub fn matches(&self, event: &SimulationEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Kind(kind) => event.kind() == *kind,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&SimulationEvent) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    filter: EventFilter,
    handler: EventHandler,
}

pub struct EventBus {
    tx: broadcast::Sender<SimulationEvent>,
    handlers: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// `capacity` bounds the backlog of each channel subscriber; slow
    /// receivers skip ahead rather than block publishers.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            handlers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: SimulationEvent) {
        debug!(kind = ?event.kind(), "Event published");
        let matching: Vec<(SubscriptionId, EventHandler)> = {
            let handlers = self.handlers.read().unwrap_or_else(|p| p.into_inner());
            handlers
                .iter()
                .filter(|s| s.filter.matches(&event))
                .map(|s| (s.id, Arc::clone(&s.handler)))
                .collect()
        };

        for (id, handler) in matching {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(subscription = id.0, kind = ?event.kind(), "Event handler failed: {}", e),
                Err(_) => warn!(subscription = id.0, kind = ?event.kind(), "Event handler panicked"),
            }
        }

        let _ = self.tx.send(event);
    }

    pub fn subscribe<F>(&self, filter: EventFilter, handler: F) -> SubscriptionId
    where
        F: Fn(&SimulationEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(Subscription {
                id,
                filter,
                handler: Arc::new(handler),
            });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|p| p.into_inner());
        let before = handlers.len();
        handlers.retain(|s| s.id != id);
        handlers.len() != before
    }

    /// Create a new channel subscriber
    pub fn subscribe_channel(&self) -> broadcast::Receiver<SimulationEvent> {
        self.tx.subscribe()
    }

    /// Events published from now on; lagged gaps are skipped.
    pub fn stream(&self) -> impl Stream<Item = SimulationEvent> {
        BroadcastStream::new(self.tx.subscribe()).filter_map(|r| r.ok())
    }
}

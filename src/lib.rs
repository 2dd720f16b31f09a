//! Rust Conclave
//!
//! Execution core for multi-actor LLM scenario simulations:
//! - Turn-based orchestration through a fixed phase pipeline
//! - Immutable, checksummed state snapshots with resume and branching
//! - A generation gateway with caching, retry, fallback and rate limiting
//! - Per-run and global cost accounting with hard budget limits
//! - Resumable parameter-sweep batches

pub mod batch;
pub mod config;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod orchestrator;
pub mod state;
pub mod utils;

// Re-exports for convenience
pub use batch::{BatchScheduler, BatchSummary};
pub use config::{ActorConfig, BatchConfig, GatewayConfig, ScenarioConfig};
pub use error::{BatchError, ErrorClass, GatewayError, PhaseError, RunError, StateError};
pub use gateway::{GenerationClient, GenerationGateway};
pub use ledger::{BudgetMeter, Money, PriceTable};
pub use orchestrator::{EventBus, Orchestrator, SimulationEvent};
pub use state::{ScenarioStatus, SnapshotStore, StateSnapshot};

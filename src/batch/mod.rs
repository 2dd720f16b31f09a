//! Batch Experiments
//!
//! Parameter sweeps over a base scenario: variation expansion, a resumable
//! record of every run, dry-run estimates and the bounded-parallel scheduler.

mod estimate;
mod scheduler;
mod state;
mod variation;

pub use estimate::{BatchEstimate, RunEstimate};
pub use scheduler::{BatchScheduler, BatchSummary};
pub use state::{config_hash, BatchRun, BatchState, BatchStateStore, RunStatus, StatusCounts, BATCH_SCHEMA_VERSION};
pub use variation::{expand, AxisValues, Binding, RunKey, Variation, VariationAxis, VariationValue};

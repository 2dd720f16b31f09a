//! State Store
//!
//! Immutable simulation snapshots, the transformations that derive new ones,
//! checksummed serialization for resume, and truncate-and-fork branching.

pub mod codec;
mod fork;
mod snapshot;
mod store;
mod transform;

pub use codec::{deserialize, serialize, SNAPSHOT_SCHEMA_VERSION};
pub use fork::{fork, fork_with_id};
pub use snapshot::{
    ActorId, ActorRecord, Communication, Decision, ExecutionMetadata, FailureInfo, HaltReason, MetricRecord,
    PhaseKind, ScenarioStatus, StateSnapshot, WorldState,
};
pub use store::{load_path, SnapshotStore};
pub(crate) use store::write_atomic;
pub use transform::{MetadataUpdate, Transformation};

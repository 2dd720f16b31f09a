//! Orchestrator Module
//!
//! Runs a scenario turn by turn through its phase pipeline, enforcing budget
//! and turn limits and reacting to pause, resume and halt requests.

pub mod control;
pub mod engine;
pub mod event_bus;
pub mod parse;
pub mod phases;
pub mod prompt;
pub mod stop;

pub use control::{RunControl, RunSignal};
pub use engine::Orchestrator;
pub use event_bus::{EventBus, EventFilter, EventHandler, EventKind, SimulationEvent, SubscriptionId};
pub use phases::{Phase, PhaseContext, PhaseOutput};
pub use prompt::{PlainComposer, PromptComposer};
pub use stop::StopCondition;

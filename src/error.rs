//! Error Taxonomy
//!
//! Classified failures for every layer of the execution core. Each error can
//! report an [`ErrorClass`] so the orchestrator can decide between halting and
//! failing a run without inspecting error strings.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::ledger::{BudgetExceeded, CostRecord};
use crate::state::PhaseKind;

/// Coarse classification used for propagation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network or rate-limit trouble; retried locally.
    Transient,
    /// The requested model cannot serve the call; a fallback may.
    Capability,
    /// Credentials or request shape are wrong. Never retried.
    Authorization,
    /// A cost limit was reached. Expected control flow, not a failure.
    Budget,
    /// A persisted snapshot could not be trusted.
    StateCorruption,
    /// Every actor failed in the same decision phase.
    PartialDecisionFailure,
    /// Anything else (I/O, serialization, misuse).
    Internal,
}

/// Failure reported by a [`GenerationClient`](crate::gateway::GenerationClient).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClientError {
    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    #[error("provider returned HTTP {status}: {message}")]
    Http {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("connection error: {0}")]
    Connection(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("model '{model}' unavailable: {reason}")]
    ModelUnavailable { model: String, reason: String },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("malformed request: {0}")]
    InvalidRequest(String),

    #[error("provider quota exhausted: {0}")]
    QuotaExhausted(String),
}

impl ClientError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ClientError::RateLimited { .. } | ClientError::Connection(_) | ClientError::Timeout(_) => {
                ErrorClass::Transient
            }
            ClientError::Http { status, .. } => match status {
                429 | 502 | 503 | 504 => ErrorClass::Transient,
                403 | 404 => ErrorClass::Capability,
                402 => ErrorClass::Budget,
                _ => ErrorClass::Authorization,
            },
            ClientError::ModelUnavailable { .. } => ErrorClass::Capability,
            ClientError::Authentication(_) | ClientError::InvalidRequest(_) => ErrorClass::Authorization,
            ClientError::QuotaExhausted(_) => ErrorClass::Budget,
        }
    }

    /// Server-specified wait, if the provider sent one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ClientError::RateLimited { retry_after } | ClientError::Http { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Failure surfaced by the [`GenerationGateway`](crate::gateway::GenerationGateway).
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("'{model}' still failing after {attempts} attempts: {source}")]
    RetriesExhausted {
        model: String,
        attempts: u32,
        #[source]
        source: ClientError,
    },

    #[error("no model in fallback chain {tried:?} could serve the request: {source}")]
    FallbacksExhausted {
        tried: Vec<String>,
        #[source]
        source: ClientError,
    },

    #[error("request rejected: {0}")]
    Rejected(#[source] ClientError),

    #[error("provider refused on budget grounds: {0}")]
    ProviderQuota(#[source] ClientError),

    /// The call was never made because the reservation did not fit.
    #[error(transparent)]
    Budget(#[from] BudgetExceeded),

    /// The call was made and billed, but its charge crossed a limit.
    #[error("charge of {} crossed the budget: {source}", .record.amount)]
    BudgetCrossed {
        record: Box<CostRecord>,
        #[source]
        source: BudgetExceeded,
    },

    #[error("stop requested before dispatch")]
    Cancelled,
}

impl GatewayError {
    pub fn class(&self) -> ErrorClass {
        match self {
            GatewayError::RetriesExhausted { .. } => ErrorClass::Transient,
            GatewayError::FallbacksExhausted { .. } => ErrorClass::Capability,
            GatewayError::Rejected(_) => ErrorClass::Authorization,
            GatewayError::ProviderQuota(_) | GatewayError::Budget(_) | GatewayError::BudgetCrossed { .. } => {
                ErrorClass::Budget
            }
            GatewayError::Cancelled => ErrorClass::Internal,
        }
    }

    /// Budget and cancellation outcomes stop a run without failing it.
    pub fn is_halt(&self) -> bool {
        matches!(
            self,
            GatewayError::Budget(_)
                | GatewayError::BudgetCrossed { .. }
                | GatewayError::ProviderQuota(_)
                | GatewayError::Cancelled
        )
    }
}

/// Snapshot construction, transformation, and persistence failures.
#[derive(Debug, Error)]
pub enum StateError {
    /// Fatal for the run.
    #[error("corrupt state: {reason}")]
    Corrupt { reason: String },

    #[error("invalid status transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: crate::state::ScenarioStatus,
        to: crate::state::ScenarioStatus,
    },

    #[error("invalid transformation: {0}")]
    InvalidTransformation(String),

    #[error("unknown actor '{0}'")]
    UnknownActor(String),

    #[error("cannot fork at turn {requested}; snapshot has only completed {available} turns")]
    InvalidForkPoint { requested: u32, available: u32 },

    #[error("snapshot not found at {0}")]
    NotFound(PathBuf),

    #[error("snapshot serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl StateError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StateError::Corrupt { .. } => ErrorClass::StateCorruption,
            _ => ErrorClass::Internal,
        }
    }
}

/// Failure raised by a single phase of a turn.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("all {attempted} actors failed to decide in turn {turn}")]
    NoDecisions {
        turn: u32,
        attempted: usize,
        failures: Vec<(String, String)>,
    },

    #[error("{phase} phase gateway call failed: {source}")]
    Gateway {
        phase: PhaseKind,
        #[source]
        source: GatewayError,
    },

    #[error("{phase} phase could not persist state: {source}")]
    Persistence {
        phase: PhaseKind,
        #[source]
        source: StateError,
    },

    #[error(transparent)]
    State(#[from] StateError),
}

impl PhaseError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PhaseError::NoDecisions { .. } => ErrorClass::PartialDecisionFailure,
            PhaseError::Gateway { source, .. } => source.class(),
            PhaseError::Persistence { source, .. } | PhaseError::State(source) => source.class(),
        }
    }
}

/// Misuse of the orchestrator. Phase failures do not surface here; they are
/// recorded on the returned snapshot as a `Failed` status.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("run '{run_id}' is {status:?} and cannot be executed")]
    NotRunnable {
        run_id: String,
        status: crate::state::ScenarioStatus,
    },

    #[error(transparent)]
    State(#[from] StateError),
}

/// Configuration loading and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Batch-level failures. Individual run failures never surface here.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("batch state at {path} is unreadable: {reason}")]
    CorruptState { path: PathBuf, reason: String },

    #[error("batch state schema v{found} is newer than supported v{supported}")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("batch state was written for a different configuration (expected {expected}, found {found})")]
    ConfigMismatch { expected: String, found: String },

    #[error("batch state I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("batch state serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The shared gateway (e.g. its durable cache) could not be opened.
    #[error(transparent)]
    Setup(#[from] anyhow::Error),
}

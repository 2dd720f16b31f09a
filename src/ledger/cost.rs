use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Money;
use crate::state::PhaseKind;

/// One priced operation. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostRecord {
    pub timestamp: DateTime<Utc>,
    /// Turn the charge belongs to; used when a run is forked.
    pub turn: u32,
    /// `None` for system-level calls such as world updates.
    pub actor_id: Option<String>,
    pub phase: PhaseKind,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub amount: Money,
    /// Served from the response cache; amount is always zero.
    #[serde(default)]
    pub cached: bool,
}

/// Append-only list of cost records. Totals are always derived by summation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CostLedger {
    records: Vec<CostRecord>,
}

impl CostLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new ledger with `record` appended.
    pub fn record(&self, record: CostRecord) -> CostLedger {
        self.clone().with_record(record)
    }

    /// Consuming variant of [`CostLedger::record`].
    pub fn with_record(mut self, record: CostRecord) -> CostLedger {
        self.records.push(record);
        self
    }

    pub fn total(&self) -> Money {
        self.records.iter().map(|r| r.amount).sum()
    }

    pub fn total_for_actor(&self, actor_id: &str) -> Money {
        self.records
            .iter()
            .filter(|r| r.actor_id.as_deref() == Some(actor_id))
            .map(|r| r.amount)
            .sum()
    }

    /// Charges with no actor attached.
    pub fn total_for_system(&self) -> Money {
        self.records.iter().filter(|r| r.actor_id.is_none()).map(|r| r.amount).sum()
    }

    pub fn total_for_phase(&self, phase: PhaseKind) -> Money {
        self.records.iter().filter(|r| r.phase == phase).map(|r| r.amount).sum()
    }

    pub fn total_for_model(&self, model: &str) -> Money {
        self.records.iter().filter(|r| r.model == model).map(|r| r.amount).sum()
    }

    pub fn total_for_turn(&self, turn: u32) -> Money {
        self.records.iter().filter(|r| r.turn == turn).map(|r| r.amount).sum()
    }

    /// `true` once the ledger total is strictly greater than `limit`.
    pub fn would_exceed(&self, limit: Money) -> bool {
        self.total() > limit
    }

    /// `true` if adding `additional` would take the total past `limit`.
    pub fn would_exceed_with(&self, additional: Money, limit: Money) -> bool {
        self.total() + additional > limit
    }

    pub fn tokens(&self) -> (u64, u64) {
        self.records.iter().fold((0, 0), |(i, o), r| {
            (i + u64::from(r.tokens_in), o + u64::from(r.tokens_out))
        })
    }

    pub fn cache_hits(&self) -> usize {
        self.records.iter().filter(|r| r.cached).count()
    }

    /// Ledger restricted to records from turns `<= turn`.
    pub fn truncated_to_turn(&self, turn: u32) -> CostLedger {
        CostLedger {
            records: self.records.iter().filter(|r| r.turn <= turn).cloned().collect(),
        }
    }

    pub fn records(&self) -> &[CostRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

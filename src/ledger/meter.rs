//! Budget Meter
//!
//! Concurrency-safe running totals shared by every call of a run (and, through
//! a parent link, by every run of a batch). Calls reserve their estimated cost
//! before dispatch and settle the actual charge afterwards; the actual charge
//! is always recorded, even when it crosses the limit.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::warn;

use super::Money;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetScope {
    Run,
    Global,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{scope:?} budget of {limit} exceeded: {spent} committed, {requested} requested")]
pub struct BudgetExceeded {
    pub scope: BudgetScope,
    pub limit: Money,
    pub spent: Money,
    pub requested: Money,
}

#[derive(Debug, Default)]
struct MeterState {
    committed: Money,
    reserved: Money,
    tripped: bool,
}

/// Estimated cost held against a meter until the call settles.
#[derive(Debug)]
#[must_use = "a reservation must be settled or released"]
pub struct Reservation {
    amount: Money,
}

impl Reservation {
    pub fn amount(&self) -> Money {
        self.amount
    }
}

#[derive(Debug)]
pub struct BudgetMeter {
    scope: BudgetScope,
    limit: Option<Money>,
    state: Mutex<MeterState>,
    parent: Option<Arc<BudgetMeter>>,
}

impl BudgetMeter {
    pub fn new(scope: BudgetScope, limit: Option<Money>) -> Arc<Self> {
        Self::with_spent(scope, limit, Money::ZERO)
    }

    pub fn unlimited(scope: BudgetScope) -> Arc<Self> {
        Self::new(scope, None)
    }

    /// Meter seeded with spend that happened before this process started.
    pub fn with_spent(scope: BudgetScope, limit: Option<Money>, spent: Money) -> Arc<Self> {
        let tripped = limit.is_some_and(|l| spent > l);
        Arc::new(Self {
            scope,
            limit,
            state: Mutex::new(MeterState {
                committed: spent,
                reserved: Money::ZERO,
                tripped,
            }),
            parent: None,
        })
    }

    /// Run-scoped meter that also charges `self`. `spent` seeds only the
    /// child; the parent is assumed to already account for it.
    pub fn child(self: &Arc<Self>, limit: Option<Money>, spent: Money) -> Arc<BudgetMeter> {
        let tripped = limit.is_some_and(|l| spent > l);
        Arc::new(BudgetMeter {
            scope: BudgetScope::Run,
            limit,
            state: Mutex::new(MeterState {
                committed: spent,
                reserved: Money::ZERO,
                tripped,
            }),
            parent: Some(Arc::clone(self)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, MeterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn scope(&self) -> BudgetScope {
        self.scope
    }

    pub fn limit(&self) -> Option<Money> {
        self.limit
    }

    pub fn spent(&self) -> Money {
        self.lock().committed
    }

    pub fn remaining(&self) -> Option<Money> {
        self.limit.map(|l| l.saturating_sub(self.spent()))
    }

    /// `true` once this meter or any ancestor has crossed its limit.
    pub fn is_tripped(&self) -> bool {
        self.lock().tripped || self.parent.as_ref().is_some_and(|p| p.is_tripped())
    }

    /// The exceeded scope nearest the root, for reporting.
    pub fn tripped_scope(&self) -> Option<BudgetScope> {
        if let Some(scope) = self.parent.as_ref().and_then(|p| p.tripped_scope()) {
            return Some(scope);
        }
        self.lock().tripped.then_some(self.scope)
    }

    /// Holds `estimate` against this meter and its ancestors, or refuses if
    /// committed + reserved + estimate would pass any limit.
    pub fn reserve(&self, estimate: Money) -> Result<Reservation, BudgetExceeded> {
        {
            let mut state = self.lock();
            if let Some(limit) = self.limit {
                if state.tripped || state.committed + state.reserved + estimate > limit {
                    return Err(BudgetExceeded {
                        scope: self.scope,
                        limit,
                        spent: state.committed,
                        requested: estimate,
                    });
                }
            }
            state.reserved += estimate;
        }

        if let Some(parent) = &self.parent {
            if let Err(e) = parent.reserve(estimate) {
                let mut state = self.lock();
                state.reserved = state.reserved.saturating_sub(estimate);
                return Err(e);
            }
        }

        Ok(Reservation { amount: estimate })
    }

    /// Replaces the reservation with the actual charge. The charge is always
    /// committed; an error means it crossed a limit.
    pub fn settle(&self, reservation: Reservation, actual: Money) -> Result<(), BudgetExceeded> {
        let local = self.commit(reservation.amount, actual);
        let upstream = match &self.parent {
            Some(parent) => parent.settle(Reservation { amount: reservation.amount }, actual),
            None => Ok(()),
        };
        // Report the outermost crossing first; it stops more work.
        upstream.and(local)
    }

    /// Returns the reservation untouched, e.g. when the call failed unbilled.
    pub fn release(&self, reservation: Reservation) {
        {
            let mut state = self.lock();
            state.reserved = state.reserved.saturating_sub(reservation.amount);
        }
        if let Some(parent) = &self.parent {
            parent.release(Reservation { amount: reservation.amount });
        }
    }

    /// Commits a charge that was never reserved.
    pub fn record(&self, actual: Money) -> Result<(), BudgetExceeded> {
        self.settle(Reservation { amount: Money::ZERO }, actual)
    }

    fn commit(&self, reserved: Money, actual: Money) -> Result<(), BudgetExceeded> {
        let mut state = self.lock();
        state.reserved = state.reserved.saturating_sub(reserved);
        state.committed += actual;
        match self.limit {
            Some(limit) if state.committed > limit => {
                if !state.tripped {
                    warn!(scope = ?self.scope, %limit, spent = %state.committed, "Budget limit crossed");
                }
                state.tripped = true;
                Err(BudgetExceeded {
                    scope: self.scope,
                    limit,
                    spent: state.committed,
                    requested: actual,
                })
            }
            _ => Ok(()),
        }
    }
}

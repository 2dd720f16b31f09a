//! Cost Ledger
//!
//! Append-only accounting of priced generation calls, the price table used to
//! compute and estimate charges, and the concurrent budget meter that enforces
//! per-run and global limits.

mod cost;
mod meter;
mod money;
mod pricing;

pub use cost::{CostLedger, CostRecord};
pub use meter::{BudgetExceeded, BudgetMeter, BudgetScope, Reservation};
pub use money::Money;
pub use pricing::{ModelPrice, PriceTable};

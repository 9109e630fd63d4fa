//! Notional-based admission control.
//!
//! The gate is a pure function: callers fetch quotes (a suspension point)
//! and read exposures under the admission transaction's session lock, then
//! evaluate here. Nothing in this crate touches the database.

pub mod engine;
pub mod types;

pub use engine::{available_notional_cents, evaluate, open_notional_cents, worst_case_unit_cost_cents};
pub use types::{
    Exposure, Quote, QuoteBook, QuoteSource, RiskConfig, RiskDecision, RiskRejection,
};

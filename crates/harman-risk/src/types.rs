//! Inputs and outputs of the risk gate.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use harman_oms::Action;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Latest market view for one ticker, in integer cents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub ticker: String,
    pub yes_bid_cents: i32,
    pub yes_ask_cents: i32,
    pub last_trade_cents: Option<i32>,
    pub as_of: DateTime<Utc>,
}

impl Quote {
    /// A quote older than the staleness threshold must not be trusted for
    /// admission; the gate falls back to the binary upper bound instead.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        now.signed_duration_since(self.as_of) > stale_after
    }
}

/// The market-quote lookup seam. Implemented over the snapshot store in
/// production and by fixed maps in tests.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    /// Latest quote for `ticker`, or `None` when the ticker has never been
    /// quoted (treated as stale by the gate).
    async fn lookup(&self, ticker: &str) -> Option<Quote>;
}

/// Quotes keyed by ticker, as collected before the admission transaction.
pub type QuoteBook = HashMap<String, Quote>;

/// One unit of open exposure: the unfilled remainder of a live order, or an
/// open position (net filled contracts keyed by their opening action).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exposure {
    pub ticker: String,
    pub action: Action,
    pub quantity: i64,
}

/// Gate configuration. The per-session `max_notional` override, when set,
/// replaces `default_max_notional_cents`; the default is never persisted
/// into the session row.
#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub default_max_notional_cents: i64,
    pub quote_stale_after: Duration,
}

impl RiskConfig {
    pub fn effective_max_notional(&self, session_override_cents: Option<i64>) -> i64 {
        session_override_cents.unwrap_or(self.default_max_notional_cents)
    }
}

/// Why the gate refused the candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RiskRejection {
    LimitBreached {
        candidate_notional_cents: i64,
        available_notional_cents: i64,
    },
}

impl fmt::Display for RiskRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskRejection::LimitBreached {
                candidate_notional_cents,
                available_notional_cents,
            } => write!(
                f,
                "risk limit breached: candidate notional {}c exceeds available {}c",
                candidate_notional_cents, available_notional_cents
            ),
        }
    }
}

impl std::error::Error for RiskRejection {}

/// Outcome of an admission evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskDecision {
    pub open_notional_cents: i64,
    pub candidate_notional_cents: i64,
    pub available_notional_cents: i64,
    pub rejection: Option<RiskRejection>,
}

impl RiskDecision {
    pub fn admitted(&self) -> bool {
        self.rejection.is_none()
    }
}

//! Typed adapter errors.
//!
//! The sweeper branches on [`ExchangeError::is_retriable`]: retriable
//! failures release the queue row for the next tick, permanent ones drive
//! the order to `rejected` (or surface as an admin error for non-submit
//! intents). Nothing here is ever shown verbatim to an admission caller.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    /// The exchange could not be reached at all.
    Transport { message: String },
    /// The call timed out; the outcome is unknown (idempotent retry safe).
    Timeout { timeout_ms: u64 },
    /// Throttled; retry after the hinted delay.
    RateLimited { retry_after_ms: u64 },
    /// The exchange refused the order.
    Rejected { reason: String },
    /// The exchange refused the price specifically (outside its tick or
    /// band rules).
    PriceRejected { reason: String },
    /// The referenced exchange order does not exist.
    NotFound { exchange_order_id: String },
}

impl ExchangeError {
    /// Retriable errors leave the queue row in place; the sweeper re-examines
    /// it on the next tick. Permanent errors consume the row.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ExchangeError::Transport { .. }
                | ExchangeError::Timeout { .. }
                | ExchangeError::RateLimited { .. }
        )
    }

    /// Short stable name recorded in audit details.
    pub fn kind(&self) -> &'static str {
        match self {
            ExchangeError::Transport { .. } => "transport",
            ExchangeError::Timeout { .. } => "timeout",
            ExchangeError::RateLimited { .. } => "rate_limited",
            ExchangeError::Rejected { .. } => "rejected",
            ExchangeError::PriceRejected { .. } => "price_rejected",
            ExchangeError::NotFound { .. } => "not_found",
        }
    }
}

impl fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeError::Transport { message } => write!(f, "exchange transport error: {message}"),
            ExchangeError::Timeout { timeout_ms } => {
                write!(f, "exchange call timed out after {timeout_ms}ms")
            }
            ExchangeError::RateLimited { retry_after_ms } => {
                write!(f, "rate limited; retry after {retry_after_ms}ms")
            }
            ExchangeError::Rejected { reason } => write!(f, "exchange rejected order: {reason}"),
            ExchangeError::PriceRejected { reason } => {
                write!(f, "exchange rejected price: {reason}")
            }
            ExchangeError::NotFound { exchange_order_id } => {
                write!(f, "exchange order {exchange_order_id} not found")
            }
        }
    }
}

impl std::error::Error for ExchangeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_split() {
        assert!(ExchangeError::Transport {
            message: "conn refused".to_string()
        }
        .is_retriable());
        assert!(ExchangeError::Timeout { timeout_ms: 5000 }.is_retriable());
        assert!(ExchangeError::RateLimited { retry_after_ms: 250 }.is_retriable());
        assert!(!ExchangeError::Rejected {
            reason: "self cross".to_string()
        }
        .is_retriable());
        assert!(!ExchangeError::PriceRejected {
            reason: "off tick".to_string()
        }
        .is_retriable());
        assert!(!ExchangeError::NotFound {
            exchange_order_id: "EX-1".to_string()
        }
        .is_retriable());
    }
}

//! The `ExchangeAdapter` trait and its request/response types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harman_oms::{Action, Side, TimeInForce};
use harman_reconcile::RemoteOrder;
use uuid::Uuid;

use crate::error::ExchangeError;

/// The order columns an adapter needs to place a new order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitOrder {
    pub client_order_id: Uuid,
    pub ticker: String,
    pub side: Side,
    pub action: Action,
    pub quantity: i32,
    pub price_cents: i32,
    pub time_in_force: TimeInForce,
}

/// One execution as reported by the exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FillReport {
    pub trade_id: String,
    pub price_cents: i32,
    pub quantity: i32,
    pub is_taker: bool,
    pub filled_at: DateTime<Utc>,
}

/// Successful submit: the assigned exchange id plus any fills that happened
/// on the matching pass (IOC orders often fill inside the submit call).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitAck {
    pub exchange_order_id: String,
    pub initial_fills: Vec<FillReport>,
}

/// Cancel outcome. `accepted == false` with a terminal hint means the order
/// was already closed on the exchange when the cancel arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelAck {
    pub accepted: bool,
    pub terminal_state_if_known: Option<harman_reconcile::RemoteStatus>,
}

/// Amend outcome: the values now resting on the exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmendAck {
    pub exchange_order_id: String,
    pub new_price_cents: i32,
    pub new_quantity: i32,
}

/// The narrow async surface the core depends on.
///
/// # Idempotency contract
/// - `submit` keyed by `client_order_id`: re-submitting the same id returns
///   the original `exchange_order_id` without placing a second order.
/// - `cancel`/`amend` keyed by `exchange_order_id`: repeating a confirmed
///   operation is a no-op success.
///
/// The sweeper relies on this to make crash-retry safe (a worker killed
/// between the adapter call and the commit simply re-runs the call).
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    async fn submit(&self, order: &SubmitOrder) -> Result<SubmitAck, ExchangeError>;

    async fn cancel(&self, exchange_order_id: &str) -> Result<CancelAck, ExchangeError>;

    async fn amend(
        &self,
        exchange_order_id: &str,
        new_price_cents: i32,
        new_quantity: i32,
    ) -> Result<AmendAck, ExchangeError>;

    /// The exchange's view of this session's orders (open, plus recently
    /// closed where the venue reports them).
    async fn fetch_open_orders(&self) -> Result<Vec<RemoteOrder>, ExchangeError>;

    /// All fills the exchange has for one order; used by reconciliation to
    /// heal missed executions (deduped locally by `trade_id`).
    async fn fetch_fills(&self, exchange_order_id: &str)
        -> Result<Vec<FillReport>, ExchangeError>;
}

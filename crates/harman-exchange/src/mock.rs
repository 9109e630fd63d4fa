//! Configurable deterministic exchange double.
//!
//! Tests (and the daemon's paper mode) drive the full sweeper/reconciler
//! machinery against this adapter. Behaviors are configurable per
//! operation, with per-`client_order_id` overrides, and every call is
//! logged for assertions. Submits are idempotent by `client_order_id`
//! exactly as the contract requires: the same id always yields the same
//! `exchange_order_id`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use harman_reconcile::{RemoteOrder, RemoteStatus};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::adapter::{AmendAck, CancelAck, ExchangeAdapter, FillReport, SubmitAck, SubmitOrder};
use crate::error::ExchangeError;

/// Configurable response for `submit`.
#[derive(Clone, Debug)]
pub enum SubmitBehavior {
    /// Accept with an auto-generated exchange order id.
    Accept,
    /// Accept with a specific exchange order id.
    AcceptWithId(String),
    /// Accept and report these fills in the same response.
    AcceptWithFills(String, Vec<FillReport>),
    Reject(String),
    PriceReject(String),
    Timeout,
    RateLimited(u64),
}

/// Configurable response for `cancel`.
#[derive(Clone, Debug)]
pub enum CancelBehavior {
    Accept,
    /// Order already closed on the exchange.
    AlreadyTerminal(RemoteStatus),
    NotFound,
    Timeout,
}

/// Configurable response for `amend`.
#[derive(Clone, Debug)]
pub enum AmendBehavior {
    Accept,
    Reject(String),
    NotFound,
    Timeout,
}

/// Inner state, protected by a tokio `Mutex` so tests can reconfigure the
/// exchange mid-scenario.
#[derive(Debug)]
pub struct MockExchangeState {
    pub submit_behavior: SubmitBehavior,
    /// Per-client_order_id overrides for submit.
    pub submit_overrides: HashMap<Uuid, SubmitBehavior>,
    pub cancel_behavior: CancelBehavior,
    pub amend_behavior: AmendBehavior,
    /// What `fetch_open_orders` returns.
    pub open_orders: Vec<RemoteOrder>,
    /// Fills returned by `fetch_fills`, keyed by exchange order id.
    pub fills: HashMap<String, Vec<FillReport>>,

    // Call logs for assertions.
    pub submitted: Vec<SubmitOrder>,
    pub cancel_calls: Vec<String>,
    pub amend_calls: Vec<(String, i32, i32)>,

    /// Stable submit idempotency: client id -> assigned exchange id.
    assigned_ids: HashMap<Uuid, String>,
    next_id: u64,
}

impl Default for MockExchangeState {
    fn default() -> Self {
        Self {
            submit_behavior: SubmitBehavior::Accept,
            submit_overrides: HashMap::new(),
            cancel_behavior: CancelBehavior::Accept,
            amend_behavior: AmendBehavior::Accept,
            open_orders: Vec::new(),
            fills: HashMap::new(),
            submitted: Vec::new(),
            cancel_calls: Vec::new(),
            amend_calls: Vec::new(),
            assigned_ids: HashMap::new(),
            next_id: 1,
        }
    }
}

impl MockExchangeState {
    fn assign_id(&mut self, client_order_id: Uuid) -> String {
        if let Some(existing) = self.assigned_ids.get(&client_order_id) {
            return existing.clone();
        }
        let id = format!("mock-exch-{}", self.next_id);
        self.next_id += 1;
        self.assigned_ids.insert(client_order_id, id.clone());
        id
    }
}

/// The mock adapter. Clone-cheap via the shared state handle.
pub struct MockExchange {
    pub state: Arc<Mutex<MockExchangeState>>,
}

impl Default for MockExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExchange {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockExchangeState::default())),
        }
    }

    pub fn with_state(state: Arc<Mutex<MockExchangeState>>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl ExchangeAdapter for MockExchange {
    async fn submit(&self, order: &SubmitOrder) -> Result<SubmitAck, ExchangeError> {
        let mut state = self.state.lock().await;
        state.submitted.push(order.clone());

        let behavior = state
            .submit_overrides
            .get(&order.client_order_id)
            .cloned()
            .unwrap_or_else(|| state.submit_behavior.clone());

        match behavior {
            SubmitBehavior::Accept => {
                let id = state.assign_id(order.client_order_id);
                Ok(SubmitAck {
                    exchange_order_id: id,
                    initial_fills: Vec::new(),
                })
            }
            SubmitBehavior::AcceptWithId(id) => {
                state.assigned_ids.insert(order.client_order_id, id.clone());
                Ok(SubmitAck {
                    exchange_order_id: id,
                    initial_fills: Vec::new(),
                })
            }
            SubmitBehavior::AcceptWithFills(id, fills) => {
                state.assigned_ids.insert(order.client_order_id, id.clone());
                Ok(SubmitAck {
                    exchange_order_id: id,
                    initial_fills: fills,
                })
            }
            SubmitBehavior::Reject(reason) => Err(ExchangeError::Rejected { reason }),
            SubmitBehavior::PriceReject(reason) => Err(ExchangeError::PriceRejected { reason }),
            SubmitBehavior::Timeout => Err(ExchangeError::Timeout { timeout_ms: 5000 }),
            SubmitBehavior::RateLimited(ms) => {
                Err(ExchangeError::RateLimited { retry_after_ms: ms })
            }
        }
    }

    async fn cancel(&self, exchange_order_id: &str) -> Result<CancelAck, ExchangeError> {
        let mut state = self.state.lock().await;
        state.cancel_calls.push(exchange_order_id.to_string());

        match state.cancel_behavior.clone() {
            CancelBehavior::Accept => Ok(CancelAck {
                accepted: true,
                terminal_state_if_known: None,
            }),
            CancelBehavior::AlreadyTerminal(status) => Ok(CancelAck {
                accepted: false,
                terminal_state_if_known: Some(status),
            }),
            CancelBehavior::NotFound => Err(ExchangeError::NotFound {
                exchange_order_id: exchange_order_id.to_string(),
            }),
            CancelBehavior::Timeout => Err(ExchangeError::Timeout { timeout_ms: 5000 }),
        }
    }

    async fn amend(
        &self,
        exchange_order_id: &str,
        new_price_cents: i32,
        new_quantity: i32,
    ) -> Result<AmendAck, ExchangeError> {
        let mut state = self.state.lock().await;
        state
            .amend_calls
            .push((exchange_order_id.to_string(), new_price_cents, new_quantity));

        match state.amend_behavior.clone() {
            AmendBehavior::Accept => Ok(AmendAck {
                exchange_order_id: exchange_order_id.to_string(),
                new_price_cents,
                new_quantity,
            }),
            AmendBehavior::Reject(reason) => Err(ExchangeError::Rejected { reason }),
            AmendBehavior::NotFound => Err(ExchangeError::NotFound {
                exchange_order_id: exchange_order_id.to_string(),
            }),
            AmendBehavior::Timeout => Err(ExchangeError::Timeout { timeout_ms: 5000 }),
        }
    }

    async fn fetch_open_orders(&self) -> Result<Vec<RemoteOrder>, ExchangeError> {
        let state = self.state.lock().await;
        Ok(state.open_orders.clone())
    }

    async fn fetch_fills(
        &self,
        exchange_order_id: &str,
    ) -> Result<Vec<FillReport>, ExchangeError> {
        let state = self.state.lock().await;
        Ok(state
            .fills
            .get(exchange_order_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use harman_oms::{Action, Side, TimeInForce};

    fn order(client_order_id: Uuid) -> SubmitOrder {
        SubmitOrder {
            client_order_id,
            ticker: "INXD-25-B4000".to_string(),
            side: Side::Yes,
            action: Action::Buy,
            quantity: 10,
            price_cents: 45,
            time_in_force: TimeInForce::Gtc,
        }
    }

    #[tokio::test]
    async fn submit_is_idempotent_by_client_order_id() {
        let ex = MockExchange::new();
        let coid = Uuid::from_u128(1);

        let first = ex.submit(&order(coid)).await.unwrap();
        let second = ex.submit(&order(coid)).await.unwrap();
        assert_eq!(first.exchange_order_id, second.exchange_order_id);

        // A different client id gets a different exchange id.
        let other = ex.submit(&order(Uuid::from_u128(2))).await.unwrap();
        assert_ne!(first.exchange_order_id, other.exchange_order_id);
    }

    #[tokio::test]
    async fn behaviors_and_call_logs() {
        let ex = MockExchange::new();
        {
            let mut st = ex.state.lock().await;
            st.submit_overrides
                .insert(Uuid::from_u128(9), SubmitBehavior::Reject("no".to_string()));
            st.fills.insert(
                "EX-1".to_string(),
                vec![FillReport {
                    trade_id: "T-1".to_string(),
                    price_cents: 45,
                    quantity: 10,
                    is_taker: true,
                    filled_at: Utc::now(),
                }],
            );
        }

        let err = ex.submit(&order(Uuid::from_u128(9))).await.unwrap_err();
        assert!(!err.is_retriable());

        let fills = ex.fetch_fills("EX-1").await.unwrap();
        assert_eq!(fills.len(), 1);
        assert!(ex.fetch_fills("EX-2").await.unwrap().is_empty());

        ex.cancel("EX-1").await.unwrap();
        let st = ex.state.lock().await;
        assert_eq!(st.cancel_calls, vec!["EX-1".to_string()]);
        assert_eq!(st.submitted.len(), 1);
    }
}

//! The exchange adapter seam.
//!
//! The core depends only on [`ExchangeAdapter`]: a narrow async surface the
//! sweeper and reconciler call. Every operation is idempotent — `submit` by
//! `client_order_id`, the rest by `exchange_order_id` — so retries after a
//! worker crash are safe. The production implementation (REST/WS client,
//! signing, HTTP retry policy) lives outside this repository; the in-repo
//! [`MockExchange`] is the deterministic double used by tests and paper
//! mode.

pub mod adapter;
pub mod error;
pub mod mock;

pub use adapter::{AmendAck, CancelAck, ExchangeAdapter, FillReport, SubmitAck, SubmitOrder};
pub use error::ExchangeError;
pub use mock::{MockExchange, MockExchangeState};

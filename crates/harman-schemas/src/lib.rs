//! Wire schemas shared by the daemon and its clients.
//!
//! Prices cross the wire as decimal dollar strings in (0, 1) exclusive and
//! are stored as integer cents everywhere else; [`prices`] is the single
//! conversion point.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub mod prices;

pub use prices::{format_price_cents, parse_price_dollars, PriceError};

/// Admission request body for `POST /v1/orders`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: Uuid,
    pub ticker: String,
    pub side: String,
    pub action: String,
    pub quantity: i32,
    /// Decimal dollar string in (0, 1) exclusive, e.g. `"0.45"`.
    pub price: String,
    pub time_in_force: String,
}

/// An order as rendered on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderView {
    pub id: i64,
    pub session_id: i64,
    pub client_order_id: Uuid,
    pub exchange_order_id: Option<String>,
    pub ticker: String,
    pub side: String,
    pub action: String,
    pub quantity: i32,
    /// Decimal dollar string, e.g. `"0.45"`.
    pub price: String,
    pub filled_quantity: i32,
    pub time_in_force: String,
    pub state: String,
    pub cancel_reason: Option<String>,
    pub group_id: Option<i64>,
    pub leg_role: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Amend request body: both fields required (the exchange replaces the
/// resting order wholesale).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmendRequest {
    pub new_price: String,
    pub new_quantity: i32,
}

/// Decrease request body: reduce the resting quantity by `reduce_by`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecreaseRequest {
    pub reduce_by: i32,
}

/// One leg of a bracket or OCO creation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupLegRequest {
    pub client_order_id: Uuid,
    pub side: String,
    pub action: String,
    pub quantity: i32,
    pub price: String,
    pub time_in_force: String,
}

/// `POST /v1/groups/bracket` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BracketRequest {
    pub ticker: String,
    pub entry: GroupLegRequest,
    pub take_profit: GroupLegRequest,
    pub stop_loss: GroupLegRequest,
}

/// `POST /v1/groups/oco` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcoRequest {
    pub ticker: String,
    pub legs: [GroupLegRequest; 2],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupView {
    pub id: i64,
    pub session_id: i64,
    pub group_type: String,
    pub state: String,
    pub legs: Vec<OrderView>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillView {
    pub id: i64,
    pub order_id: i64,
    pub trade_id: String,
    pub price: String,
    pub quantity: i32,
    pub is_taker: bool,
    pub filled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditView {
    pub id: i64,
    pub order_id: i64,
    pub from_state: String,
    pub to_state: String,
    pub event: String,
    pub actor: String,
    pub details: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Net open contracts per (ticker, side).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionView {
    pub ticker: String,
    pub side: String,
    pub quantity: i64,
}

/// Risk gate snapshot for `GET /v1/risk`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSnapshotView {
    pub session_id: i64,
    /// Effective limit: session override when set, process default otherwise.
    pub max_notional: String,
    pub open_notional: String,
    pub available_notional: String,
    pub admission_paused: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
    pub db_ok: bool,
}

/// Typed error envelope returned by every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Stable machine-readable kind, e.g. `risk_limit_breached`.
    pub error: String,
    pub message: String,
}

/// Result of a mass-cancel sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MassCancelResponse {
    pub cancels_enqueued: i64,
    pub staged_cancelled: i64,
    pub admission_paused: bool,
}

/// Result of an on-demand reconciliation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileResponse {
    pub actions_applied: usize,
    pub orphans_recorded: usize,
    pub fills_healed: usize,
}

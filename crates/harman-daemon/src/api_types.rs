//! Boundary error mapping and view construction.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use harman_db::{EnqueueError, OpError};
use harman_schemas::{
    format_price_cents, AuditView, ErrorResponse, FillView, GroupView, OrderView, PositionView,
};

/// Every error a handler can surface, keyed by the stable kinds of the
/// service contract. Adapter errors are translated into order state and
/// audit rows long before a response is built, with one exception: the
/// operator's reconcile-now route queries the exchange synchronously and
/// surfaces an unreachable upstream as `upstream_unavailable`.
#[derive(Debug)]
pub enum ApiError {
    InvalidInput(String),
    RiskLimitBreached(String),
    SessionClosed,
    AdmissionPaused,
    IllegalTransition(String),
    NotFound,
    Conflict(String),
    UpstreamUnavailable(String),
    Internal(anyhow::Error),
}

impl ApiError {
    fn kind(&self) -> &'static str {
        match self {
            ApiError::InvalidInput(_) => "invalid_input",
            ApiError::RiskLimitBreached(_) => "risk_limit_breached",
            ApiError::SessionClosed => "session_closed",
            ApiError::AdmissionPaused => "admission_paused",
            ApiError::IllegalTransition(_) => "illegal_transition",
            ApiError::NotFound => "not_found",
            ApiError::Conflict(_) => "conflict",
            ApiError::UpstreamUnavailable(_) => "upstream_unavailable",
            ApiError::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::RiskLimitBreached(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::SessionClosed => StatusCode::FORBIDDEN,
            ApiError::AdmissionPaused => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::IllegalTransition(_) => StatusCode::CONFLICT,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::InvalidInput(m)
            | ApiError::RiskLimitBreached(m)
            | ApiError::IllegalTransition(m)
            | ApiError::Conflict(m)
            | ApiError::UpstreamUnavailable(m) => m.clone(),
            ApiError::SessionClosed => "session is closed".to_string(),
            ApiError::AdmissionPaused => {
                "admission is paused; resume to accept new orders".to_string()
            }
            ApiError::NotFound => "not found".to_string(),
            // Internal details stay in the logs.
            ApiError::Internal(_) => "internal error".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(e) = &self {
            tracing::error!(error = %format!("{e:#}"), "internal error");
        }
        (
            self.status(),
            Json(ErrorResponse {
                error: self.kind().to_string(),
                message: self.message(),
            }),
        )
            .into_response()
    }
}

/// `DuplicateClientOrderId` is handled by the admission route itself (it
/// responds with the original order); everything else maps here.
impl From<EnqueueError> for ApiError {
    fn from(e: EnqueueError) -> Self {
        match e {
            EnqueueError::InvalidInput(m) => ApiError::InvalidInput(m),
            EnqueueError::RiskLimitBreached(r) => ApiError::RiskLimitBreached(r.to_string()),
            EnqueueError::SessionClosed => ApiError::SessionClosed,
            EnqueueError::AdmissionPaused => ApiError::AdmissionPaused,
            EnqueueError::DuplicateClientOrderId(id) => {
                ApiError::Conflict(format!("duplicate client_order_id {id}"))
            }
            EnqueueError::Database(e) => ApiError::Internal(e),
        }
    }
}

impl From<OpError> for ApiError {
    fn from(e: OpError) -> Self {
        match e {
            OpError::NotFound => ApiError::NotFound,
            OpError::InvalidInput(m) => ApiError::InvalidInput(m),
            OpError::Illegal(t) => ApiError::IllegalTransition(t.to_string()),
            OpError::Database(e) => ApiError::Internal(e),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

/// Reconcile-now is the one route that talks to the exchange inline; an
/// unreachable upstream is 503, a store failure stays internal.
impl From<harman_runtime::ReconcileError> for ApiError {
    fn from(e: harman_runtime::ReconcileError) -> Self {
        match e {
            harman_runtime::ReconcileError::Upstream(upstream) => {
                ApiError::UpstreamUnavailable(upstream.to_string())
            }
            harman_runtime::ReconcileError::Store(store) => ApiError::Internal(store),
        }
    }
}

// ---------------------------------------------------------------------------
// Row → wire view construction
// ---------------------------------------------------------------------------

pub fn order_view(row: &harman_db::OrderRow) -> OrderView {
    OrderView {
        id: row.id,
        session_id: row.session_id,
        client_order_id: row.client_order_id,
        exchange_order_id: row.exchange_order_id.clone(),
        ticker: row.ticker.clone(),
        side: row.side.as_str().to_string(),
        action: row.action.as_str().to_string(),
        quantity: row.quantity,
        price: format_price_cents(row.price_cents),
        filled_quantity: row.filled_quantity,
        time_in_force: row.time_in_force.as_str().to_string(),
        state: row.state.as_str().to_string(),
        cancel_reason: row.cancel_reason.map(|r| r.as_str().to_string()),
        group_id: row.group_id,
        leg_role: row.leg_role.map(|r| r.as_str().to_string()),
        created_at: row.created_at,
        updated_at: row.updated_at,
    }
}

pub fn group_view(group: &harman_db::GroupRow, legs: &[harman_db::OrderRow]) -> GroupView {
    GroupView {
        id: group.id,
        session_id: group.session_id,
        group_type: group.group_type.as_str().to_string(),
        state: group.state.as_str().to_string(),
        legs: legs.iter().map(order_view).collect(),
        created_at: group.created_at,
        updated_at: group.updated_at,
    }
}

pub fn fill_view(row: &harman_db::FillRow) -> FillView {
    FillView {
        id: row.id,
        order_id: row.order_id,
        trade_id: row.trade_id.clone(),
        price: format_price_cents(row.price_cents),
        quantity: row.quantity,
        is_taker: row.is_taker,
        filled_at: row.filled_at,
    }
}

pub fn audit_view(row: &harman_db::AuditRow) -> AuditView {
    AuditView {
        id: row.id,
        order_id: row.order_id,
        from_state: row.from_state.clone(),
        to_state: row.to_state.clone(),
        event: row.event.clone(),
        actor: row.actor.clone(),
        details: row.details.clone(),
        created_at: row.created_at,
    }
}

pub fn position_view((ticker, side, quantity): &(String, String, i64)) -> PositionView {
    PositionView {
        ticker: ticker.clone(),
        side: side.clone(),
        quantity: *quantity,
    }
}

/// Cents → wire dollar string for notional amounts (not contract prices,
/// so values at or above $1.00 are legal here).
pub fn format_notional_cents(cents: i64) -> String {
    format!("{}.{:02}", cents / 100, (cents % 100).abs())
}

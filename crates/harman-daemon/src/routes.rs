//! Axum router and all HTTP handlers.
//!
//! `build_router` is the single entry point; `main.rs` calls it and
//! attaches middleware layers. Handlers stay thin: parse the wire shape,
//! resolve the caller's session, delegate to `harman-db`, map the result.
//! The only synchronous failures at admission are validation and risk;
//! everything downstream is observable via order state and the audit log.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use harman_oms::{Action, CancelReason, LegRole, OrderState, Side, TimeInForce};
use harman_risk::{available_notional_cents, open_notional_cents, Quote};
use harman_schemas::{
    parse_price_dollars, AmendRequest, BracketRequest, DecreaseRequest, GroupLegRequest,
    HealthResponse, MassCancelResponse, OcoRequest, OrderRequest, ReconcileResponse,
    RiskSnapshotView,
};
use serde::Deserialize;
use tracing::info;

use crate::api_types::{
    audit_view, fill_view, format_notional_cents, group_view, order_view, position_view, ApiError,
};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/orders", post(create_order).get(list_orders))
        .route("/v1/orders/:id", get(get_order))
        .route("/v1/orders/:id/cancel", post(cancel_order))
        .route("/v1/orders/:id/amend", post(amend_order))
        .route("/v1/orders/:id/decrease", post(decrease_order))
        .route("/v1/groups", get(list_groups))
        .route("/v1/groups/bracket", post(create_bracket))
        .route("/v1/groups/oco", post(create_oco))
        .route("/v1/groups/:id", get(get_group))
        .route("/v1/groups/:id/cancel", post(cancel_group))
        .route("/v1/fills", get(list_fills))
        .route("/v1/audit", get(list_audit))
        .route("/v1/positions", get(list_positions))
        .route("/v1/risk", get(risk_snapshot))
        .route("/v1/admin/mass-cancel", post(mass_cancel))
        .route("/v1/admin/resume", post(resume))
        .route("/v1/admin/reconcile", post(reconcile_now))
        // Dev-only quote injection (paper mode / tests).
        .route("/v1/quotes", post(inject_quote))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Session resolution
// ---------------------------------------------------------------------------

/// Bind the caller to the open session for its API-key prefix, creating it
/// on first use. Full authentication (hashing, rate limits) lives in the
/// gateway in front of this service.
async fn resolve_session(
    st: &AppState,
    headers: &HeaderMap,
) -> Result<harman_db::SessionRow, ApiError> {
    let key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::InvalidInput("missing x-api-key header".to_string()))?;

    let prefix: String = key.chars().take(8).collect();
    harman_db::get_or_create_session(&st.pool, &st.config.exchange, &prefix)
        .await
        .map_err(ApiError::from)
}

/// Orders are visible only within their own session.
async fn owned_order(
    st: &AppState,
    session_id: i64,
    order_id: i64,
) -> Result<harman_db::OrderRow, ApiError> {
    let order = harman_db::fetch_order(&st.pool, order_id)
        .await
        .map_err(ApiError::from)?
        .ok_or(ApiError::NotFound)?;
    if order.session_id != session_id {
        return Err(ApiError::NotFound);
    }
    Ok(order)
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let db_ok = harman_db::status(&st.pool).await.map(|s| s.ok).unwrap_or(false);
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: db_ok,
            service: st.build.service,
            version: st.build.version,
            db_ok,
        }),
    )
}

// ---------------------------------------------------------------------------
// POST /v1/orders — admission
// ---------------------------------------------------------------------------

fn parse_order_fields(
    side: &str,
    action: &str,
    price: &str,
    time_in_force: &str,
) -> Result<(Side, Action, i32, TimeInForce), ApiError> {
    let side = Side::parse(side).map_err(|e| ApiError::InvalidInput(e.to_string()))?;
    let action = Action::parse(action).map_err(|e| ApiError::InvalidInput(e.to_string()))?;
    let price_cents =
        parse_price_dollars(price).map_err(|e| ApiError::InvalidInput(e.to_string()))?;
    let tif =
        TimeInForce::parse(time_in_force).map_err(|e| ApiError::InvalidInput(e.to_string()))?;
    Ok((side, action, price_cents, tif))
}

async fn create_order(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<OrderRequest>,
) -> Result<Response, ApiError> {
    // Field validation is free; do it before touching the database.
    let (side, action, price_cents, time_in_force) =
        parse_order_fields(&req.side, &req.action, &req.price, &req.time_in_force)?;
    let session = resolve_session(&st, &headers).await?;

    let new_order = harman_db::NewOrder {
        client_order_id: req.client_order_id,
        ticker: req.ticker.clone(),
        side,
        action,
        quantity: req.quantity,
        price_cents,
        time_in_force,
    };

    // Quote lookup is a suspension point; it happens before the admission
    // transaction ever starts.
    let quotes = st.quotes.book_for([req.ticker.as_str()]).await;

    match harman_db::enqueue_order(
        &st.pool,
        session.id,
        &new_order,
        &quotes,
        &st.risk_config(),
    )
    .await
    {
        Ok(order) => Ok((StatusCode::CREATED, Json(order_view(&order))).into_response()),
        // Idempotent re-submit: respond with the original order.
        Err(harman_db::EnqueueError::DuplicateClientOrderId(id)) => {
            let original = harman_db::fetch_order_by_client_id(&st.pool, id)
                .await
                .map_err(ApiError::from)?
                .ok_or_else(|| {
                    ApiError::Internal(anyhow::anyhow!("duplicate id {id} but no original row"))
                })?;
            info!(client_order_id = %id, "duplicate admission answered with original");
            Ok((StatusCode::OK, Json(order_view(&original))).into_response())
        }
        Err(e) => Err(e.into()),
    }
}

// ---------------------------------------------------------------------------
// Order reads
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ListOrdersQuery {
    state: Option<String>,
}

async fn list_orders(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListOrdersQuery>,
) -> Result<Response, ApiError> {
    let session = resolve_session(&st, &headers).await?;
    let state_filter = query
        .state
        .as_deref()
        .map(OrderState::parse)
        .transpose()
        .map_err(|e| ApiError::InvalidInput(e.to_string()))?;

    let orders = harman_db::list_orders(&st.pool, session.id, state_filter)
        .await
        .map_err(ApiError::from)?;
    let views: Vec<_> = orders.iter().map(order_view).collect();
    Ok(Json(views).into_response())
}

async fn get_order(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(order_id): Path<i64>,
) -> Result<Response, ApiError> {
    let session = resolve_session(&st, &headers).await?;
    let order = owned_order(&st, session.id, order_id).await?;
    Ok(Json(order_view(&order)).into_response())
}

// ---------------------------------------------------------------------------
// Order mutations
// ---------------------------------------------------------------------------

async fn cancel_order(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(order_id): Path<i64>,
) -> Result<Response, ApiError> {
    let session = resolve_session(&st, &headers).await?;
    owned_order(&st, session.id, order_id).await?;

    harman_db::request_cancel(&st.pool, order_id, CancelReason::UserRequested).await?;
    let order = owned_order(&st, session.id, order_id).await?;
    Ok(Json(order_view(&order)).into_response())
}

async fn amend_order(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(order_id): Path<i64>,
    Json(req): Json<AmendRequest>,
) -> Result<Response, ApiError> {
    let session = resolve_session(&st, &headers).await?;
    owned_order(&st, session.id, order_id).await?;

    let new_price_cents =
        parse_price_dollars(&req.new_price).map_err(|e| ApiError::InvalidInput(e.to_string()))?;
    harman_db::request_amend(&st.pool, order_id, new_price_cents, req.new_quantity).await?;
    let order = owned_order(&st, session.id, order_id).await?;
    Ok(Json(order_view(&order)).into_response())
}

async fn decrease_order(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(order_id): Path<i64>,
    Json(req): Json<DecreaseRequest>,
) -> Result<Response, ApiError> {
    let session = resolve_session(&st, &headers).await?;
    owned_order(&st, session.id, order_id).await?;

    harman_db::request_decrease(&st.pool, order_id, req.reduce_by).await?;
    let order = owned_order(&st, session.id, order_id).await?;
    Ok(Json(order_view(&order)).into_response())
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

fn parse_group_leg(
    leg: &GroupLegRequest,
    leg_role: LegRole,
) -> Result<harman_db::NewGroupLeg, ApiError> {
    let (side, action, price_cents, time_in_force) =
        parse_order_fields(&leg.side, &leg.action, &leg.price, &leg.time_in_force)?;
    Ok(harman_db::NewGroupLeg {
        client_order_id: leg.client_order_id,
        leg_role,
        side,
        action,
        quantity: leg.quantity,
        price_cents,
        time_in_force,
    })
}

async fn create_bracket(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<BracketRequest>,
) -> Result<Response, ApiError> {
    let session = resolve_session(&st, &headers).await?;

    let entry = parse_group_leg(&req.entry, LegRole::Entry)?;
    let take_profit = parse_group_leg(&req.take_profit, LegRole::TakeProfit)?;
    let stop_loss = parse_group_leg(&req.stop_loss, LegRole::StopLoss)?;

    let quotes = st.quotes.book_for([req.ticker.as_str()]).await;
    let (group, legs) = harman_db::create_bracket(
        &st.pool,
        session.id,
        &req.ticker,
        entry,
        take_profit,
        stop_loss,
        &quotes,
        &st.risk_config(),
    )
    .await?;

    Ok((StatusCode::CREATED, Json(group_view(&group, &legs))).into_response())
}

async fn create_oco(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<OcoRequest>,
) -> Result<Response, ApiError> {
    let session = resolve_session(&st, &headers).await?;

    let legs = [
        parse_group_leg(&req.legs[0], LegRole::OcoLeg)?,
        parse_group_leg(&req.legs[1], LegRole::OcoLeg)?,
    ];

    let quotes = st.quotes.book_for([req.ticker.as_str()]).await;
    let (group, rows) = harman_db::create_oco(
        &st.pool,
        session.id,
        &req.ticker,
        legs,
        &quotes,
        &st.risk_config(),
    )
    .await?;

    Ok((StatusCode::CREATED, Json(group_view(&group, &rows))).into_response())
}

async fn get_group(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(group_id): Path<i64>,
) -> Result<Response, ApiError> {
    let session = resolve_session(&st, &headers).await?;
    let (group, legs) = harman_db::fetch_group(&st.pool, group_id)
        .await
        .map_err(ApiError::from)?
        .ok_or(ApiError::NotFound)?;
    if group.session_id != session.id {
        return Err(ApiError::NotFound);
    }
    Ok(Json(group_view(&group, &legs)).into_response())
}

async fn list_groups(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let session = resolve_session(&st, &headers).await?;
    let groups = harman_db::list_groups(&st.pool, session.id)
        .await
        .map_err(ApiError::from)?;
    let views: Vec<_> = groups
        .iter()
        .map(|(g, legs)| group_view(g, legs))
        .collect();
    Ok(Json(views).into_response())
}

async fn cancel_group(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(group_id): Path<i64>,
) -> Result<Response, ApiError> {
    let session = resolve_session(&st, &headers).await?;
    let (group, _) = harman_db::fetch_group(&st.pool, group_id)
        .await
        .map_err(ApiError::from)?
        .ok_or(ApiError::NotFound)?;
    if group.session_id != session.id {
        return Err(ApiError::NotFound);
    }

    harman_db::cancel_group(&st.pool, group_id, CancelReason::UserRequested).await?;
    let (group, legs) = harman_db::fetch_group(&st.pool, group_id)
        .await
        .map_err(ApiError::from)?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(group_view(&group, &legs)).into_response())
}

// ---------------------------------------------------------------------------
// Read-only admin surface
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ScopedQuery {
    order_id: Option<i64>,
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    200
}

async fn list_fills(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ScopedQuery>,
) -> Result<Response, ApiError> {
    let session = resolve_session(&st, &headers).await?;
    if let Some(order_id) = query.order_id {
        owned_order(&st, session.id, order_id).await?;
    }
    let fills = harman_db::list_fills(&st.pool, query.order_id, query.limit)
        .await
        .map_err(ApiError::from)?;
    let views: Vec<_> = fills.iter().map(fill_view).collect();
    Ok(Json(views).into_response())
}

async fn list_audit(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ScopedQuery>,
) -> Result<Response, ApiError> {
    let session = resolve_session(&st, &headers).await?;
    if let Some(order_id) = query.order_id {
        owned_order(&st, session.id, order_id).await?;
    }
    let rows = harman_db::list_audit(&st.pool, query.order_id, query.limit)
        .await
        .map_err(ApiError::from)?;
    let views: Vec<_> = rows.iter().map(audit_view).collect();
    Ok(Json(views).into_response())
}

async fn list_positions(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let session = resolve_session(&st, &headers).await?;
    let rows = harman_db::positions(&st.pool, session.id)
        .await
        .map_err(ApiError::from)?;
    let views: Vec<_> = rows.iter().map(position_view).collect();
    Ok(Json(views).into_response())
}

async fn risk_snapshot(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let session = resolve_session(&st, &headers).await?;
    let risk_cfg = st.risk_config();

    let exposures = harman_db::open_exposures(&st.pool, session.id)
        .await
        .map_err(ApiError::from)?;
    let tickers: BTreeSet<&str> = exposures.iter().map(|e| e.ticker.as_str()).collect();
    let quotes = st.quotes.book_for(tickers).await;

    let open = open_notional_cents(&exposures, &quotes, Utc::now(), &risk_cfg);
    let max = risk_cfg.effective_max_notional(session.max_notional_cents);
    let available = available_notional_cents(max, open);

    let mut conn = st.pool.acquire().await.map_err(|e| ApiError::Internal(e.into()))?;
    let paused = harman_db::is_admission_paused(&mut conn)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(RiskSnapshotView {
        session_id: session.id,
        max_notional: format_notional_cents(max),
        open_notional: format_notional_cents(open),
        available_notional: format_notional_cents(available),
        admission_paused: paused,
    })
    .into_response())
}

// ---------------------------------------------------------------------------
// Admin writes
// ---------------------------------------------------------------------------

async fn mass_cancel(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let session = resolve_session(&st, &headers).await?;
    let outcome =
        harman_db::mass_cancel_session(&st.pool, session.id, CancelReason::Shutdown)
            .await
            .map_err(ApiError::from)?;
    info!(session_id = session.id, "mass cancel requested");
    Ok(Json(MassCancelResponse {
        cancels_enqueued: outcome.cancels_enqueued,
        staged_cancelled: outcome.staged_cancelled,
        admission_paused: true,
    })
    .into_response())
}

async fn resume(State(st): State<Arc<AppState>>) -> Result<Response, ApiError> {
    harman_db::resume_admission(&st.pool).await.map_err(ApiError::from)?;
    Ok(Json(serde_json::json!({ "admission_paused": false })).into_response())
}

async fn reconcile_now(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let session = resolve_session(&st, &headers).await?;
    // An unreachable exchange surfaces as upstream_unavailable (503); the
    // periodic loop will retry regardless.
    let summary = harman_runtime::reconcile_once(
        &st.pool,
        st.adapter.as_ref(),
        session.id,
        &st.runtime_config(),
    )
    .await
    .map_err(ApiError::from)?;
    Ok(Json(ReconcileResponse {
        actions_applied: summary.actions_applied,
        orphans_recorded: summary.orphans_recorded,
        fills_healed: summary.fills_healed,
    })
    .into_response())
}

// ---------------------------------------------------------------------------
// Dev-only quote injection
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct QuoteInject {
    ticker: String,
    yes_bid: String,
    yes_ask: String,
    last_trade: Option<String>,
}

async fn inject_quote(
    State(st): State<Arc<AppState>>,
    Json(req): Json<QuoteInject>,
) -> Result<Response, ApiError> {
    let allow = std::env::var("HARMAN_DEV_ALLOW_QUOTE_INJECT")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if !allow {
        return Err(ApiError::InvalidInput(
            "quote injection disabled; set HARMAN_DEV_ALLOW_QUOTE_INJECT=1".to_string(),
        ));
    }

    let yes_bid_cents =
        parse_price_dollars(&req.yes_bid).map_err(|e| ApiError::InvalidInput(e.to_string()))?;
    let yes_ask_cents =
        parse_price_dollars(&req.yes_ask).map_err(|e| ApiError::InvalidInput(e.to_string()))?;
    let last_trade_cents = req
        .last_trade
        .as_deref()
        .map(parse_price_dollars)
        .transpose()
        .map_err(|e| ApiError::InvalidInput(e.to_string()))?;

    st.quotes
        .set_quote(Quote {
            ticker: req.ticker,
            yes_bid_cents,
            yes_ask_cents,
            last_trade_cents,
            as_of: Utc::now(),
        })
        .await;

    Ok(Json(serde_json::json!({ "ok": true })).into_response())
}

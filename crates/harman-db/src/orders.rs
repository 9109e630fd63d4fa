//! Admission and admin operations on orders.

use anyhow::{Context, Result};
use harman_oms::{
    Action, CancelReason, OrderEvent, OrderState, QueueAction, Side, TimeInForce, TransitionError,
};
use harman_risk::{evaluate, Exposure, QuoteBook, RiskConfig, RiskRejection};
use serde_json::json;
use sqlx::{PgConnection, PgPool};
use std::fmt;
use tracing::{debug, info};
use uuid::Uuid;

use crate::queue::enqueue_intent;
use crate::rows::{OrderRow, SessionRow, ORDER_COLUMNS};
use crate::transitions::{apply_event_conn, cascade_group, lock_order, TransitionOutcome};

/// A validated candidate order, prices already in integer cents.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub client_order_id: Uuid,
    pub ticker: String,
    pub side: Side,
    pub action: Action,
    pub quantity: i32,
    pub price_cents: i32,
    pub time_in_force: TimeInForce,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Admission failures. Only validation and risk are surfaced synchronously;
/// everything downstream shows up in order state and the audit log.
#[derive(Debug)]
pub enum EnqueueError {
    InvalidInput(String),
    /// A prior order with this `client_order_id` exists; respond with it.
    DuplicateClientOrderId(Uuid),
    RiskLimitBreached(RiskRejection),
    SessionClosed,
    AdmissionPaused,
    Database(anyhow::Error),
}

impl fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnqueueError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EnqueueError::DuplicateClientOrderId(id) => {
                write!(f, "duplicate client_order_id {id}")
            }
            EnqueueError::RiskLimitBreached(r) => write!(f, "{r}"),
            EnqueueError::SessionClosed => write!(f, "session closed"),
            EnqueueError::AdmissionPaused => write!(f, "admission paused"),
            EnqueueError::Database(e) => write!(f, "database error: {e:#}"),
        }
    }
}

impl std::error::Error for EnqueueError {}

/// Admin operation failures (cancel/amend/decrease and friends).
#[derive(Debug)]
pub enum OpError {
    NotFound,
    InvalidInput(String),
    Illegal(TransitionError),
    Database(anyhow::Error),
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpError::NotFound => write!(f, "order not found"),
            OpError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            OpError::Illegal(e) => write!(f, "{e}"),
            OpError::Database(e) => write!(f, "database error: {e:#}"),
        }
    }
}

impl std::error::Error for OpError {}

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

/// The core transactional enqueue.
///
/// One transaction: lock the session row → read open exposures → evaluate
/// the risk gate with the pre-fetched quotes → insert the order, its
/// `submit` queue row, and the creation audit row. Locking the session
/// serializes concurrent admissions so the risk check cannot race itself
/// (property P8). Quotes were fetched before the transaction; no external
/// call ever happens inside it.
pub async fn enqueue_order(
    pool: &PgPool,
    session_id: i64,
    new_order: &NewOrder,
    quotes: &QuoteBook,
    risk_cfg: &RiskConfig,
) -> Result<OrderRow, EnqueueError> {
    validate_new_order(new_order)?;

    let mut tx = pool.begin().await.map_err(db_err)?;

    // Session lock is the admission serialization point.
    let session = sqlx::query(
        r#"
        select id, exchange, api_key_prefix, max_notional_cents, created_at, closed_at
        from sessions
        where id = $1
        for update
        "#,
    )
    .bind(session_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(db_err)?;

    let session = match session {
        Some(row) => SessionRow::from_row(&row).map_err(EnqueueError::Database)?,
        None => return Err(EnqueueError::SessionClosed),
    };
    if !session.is_open() {
        return Err(EnqueueError::SessionClosed);
    }

    if crate::sessions::is_admission_paused(&mut tx)
        .await
        .map_err(EnqueueError::Database)?
    {
        return Err(EnqueueError::AdmissionPaused);
    }

    let exposures = open_exposures_conn(&mut tx, session_id)
        .await
        .map_err(EnqueueError::Database)?;

    let candidate = Exposure {
        ticker: new_order.ticker.clone(),
        action: new_order.action,
        quantity: i64::from(new_order.quantity),
    };
    let max_notional = risk_cfg.effective_max_notional(session.max_notional_cents);
    let decision = evaluate(
        &candidate,
        &exposures,
        quotes,
        max_notional,
        chrono::Utc::now(),
        risk_cfg,
    );
    if let Some(rejection) = decision.rejection {
        debug!(
            session_id,
            client_order_id = %new_order.client_order_id,
            open = decision.open_notional_cents,
            candidate = decision.candidate_notional_cents,
            "admission refused by risk gate"
        );
        return Err(EnqueueError::RiskLimitBreached(rejection));
    }

    let inserted = sqlx::query(&format!(
        "insert into orders (session_id, client_order_id, ticker, side, action, \
                             quantity, price_cents, time_in_force, state) \
         values ($1, $2, $3, $4, $5, $6, $7, $8, 'pending') \
         returning {ORDER_COLUMNS}"
    ))
    .bind(session_id)
    .bind(new_order.client_order_id)
    .bind(&new_order.ticker)
    .bind(new_order.side.as_str())
    .bind(new_order.action.as_str())
    .bind(new_order.quantity)
    .bind(new_order.price_cents)
    .bind(new_order.time_in_force.as_str())
    .fetch_one(&mut *tx)
    .await;

    let order = match inserted {
        Ok(row) => OrderRow::from_row(&row).map_err(EnqueueError::Database)?,
        Err(e) if crate::is_unique_constraint_violation(&e, "uq_orders_client_order_id") => {
            return Err(EnqueueError::DuplicateClientOrderId(
                new_order.client_order_id,
            ));
        }
        Err(e) => return Err(db_err(e)),
    };

    // I1: the order and its submit intent are born in the same transaction.
    enqueue_intent(&mut tx, order.id, QueueAction::Submit, None)
        .await
        .map_err(EnqueueError::Database)?;

    crate::audit::insert_audit(
        &mut tx,
        order.id,
        "none",
        "pending",
        "created",
        "api",
        None,
    )
    .await
    .map_err(EnqueueError::Database)?;

    tx.commit().await.map_err(db_err)?;

    info!(
        order_id = order.id,
        client_order_id = %order.client_order_id,
        ticker = %order.ticker,
        "order enqueued"
    );
    Ok(order)
}

fn validate_new_order(new_order: &NewOrder) -> Result<(), EnqueueError> {
    if new_order.quantity <= 0 {
        return Err(EnqueueError::InvalidInput(format!(
            "quantity must be positive, got {}",
            new_order.quantity
        )));
    }
    if new_order.price_cents <= 0 || new_order.price_cents >= 100 {
        return Err(EnqueueError::InvalidInput(format!(
            "price_cents must be inside (0, 100), got {}",
            new_order.price_cents
        )));
    }
    if new_order.ticker.trim().is_empty() {
        return Err(EnqueueError::InvalidInput("ticker must not be empty".to_string()));
    }
    Ok(())
}

fn db_err(e: sqlx::Error) -> EnqueueError {
    EnqueueError::Database(anyhow::Error::new(e))
}

// ---------------------------------------------------------------------------
// Exposures
// ---------------------------------------------------------------------------

const OPEN_STATES: &str =
    "'pending','submitted','acknowledged','partially_filled','pending_cancel',\
     'pending_amend','pending_decrease','staged'";

/// Open exposure for the risk gate: the unfilled remainder of every live
/// order plus the net open position per (ticker, side), keyed by its
/// opening action.
pub(crate) async fn open_exposures_conn(
    conn: &mut PgConnection,
    session_id: i64,
) -> Result<Vec<Exposure>> {
    let mut exposures = Vec::new();

    let order_rows: Vec<(String, String, i64)> = sqlx::query_as(&format!(
        "select ticker, action, coalesce(sum(quantity - filled_quantity), 0)::bigint \
         from orders \
         where session_id = $1 and state in ({OPEN_STATES}) \
         group by ticker, action"
    ))
    .bind(session_id)
    .fetch_all(&mut *conn)
    .await
    .context("open order exposure query failed")?;

    for (ticker, action, qty) in order_rows {
        if qty > 0 {
            exposures.push(Exposure {
                ticker,
                action: Action::parse(&action).context("orders.action")?,
                quantity: qty,
            });
        }
    }

    let position_rows: Vec<(String, String, i64)> = sqlx::query_as(
        r#"
        select o.ticker, o.side,
               coalesce(sum(case when o.action = 'buy' then f.quantity
                                 else -f.quantity end), 0)::bigint as net
        from fills f
        join orders o on o.id = f.order_id
        where o.session_id = $1
        group by o.ticker, o.side
        "#,
    )
    .bind(session_id)
    .fetch_all(&mut *conn)
    .await
    .context("position exposure query failed")?;

    for (ticker, _side, net) in position_rows {
        if net > 0 {
            exposures.push(Exposure {
                ticker,
                action: Action::Buy,
                quantity: net,
            });
        } else if net < 0 {
            exposures.push(Exposure {
                ticker,
                action: Action::Sell,
                quantity: -net,
            });
        }
    }

    Ok(exposures)
}

/// Pool-level exposure read for the risk snapshot endpoint.
pub async fn open_exposures(pool: &PgPool, session_id: i64) -> Result<Vec<Exposure>> {
    let mut conn = pool.acquire().await?;
    open_exposures_conn(&mut conn, session_id).await
}

// ---------------------------------------------------------------------------
// Lookups
// ---------------------------------------------------------------------------

pub async fn fetch_order(pool: &PgPool, order_id: i64) -> Result<Option<OrderRow>> {
    let row = sqlx::query(&format!("select {ORDER_COLUMNS} from orders where id = $1"))
        .bind(order_id)
        .fetch_optional(pool)
        .await
        .context("fetch order failed")?;
    row.as_ref().map(OrderRow::from_row).transpose()
}

pub async fn fetch_order_by_client_id(
    pool: &PgPool,
    client_order_id: Uuid,
) -> Result<Option<OrderRow>> {
    let row = sqlx::query(&format!(
        "select {ORDER_COLUMNS} from orders where client_order_id = $1"
    ))
    .bind(client_order_id)
    .fetch_optional(pool)
    .await
    .context("fetch order by client id failed")?;
    row.as_ref().map(OrderRow::from_row).transpose()
}

/// List a session's orders, optionally filtered by state.
pub async fn list_orders(
    pool: &PgPool,
    session_id: i64,
    state: Option<OrderState>,
) -> Result<Vec<OrderRow>> {
    let rows = match state {
        Some(s) => {
            sqlx::query(&format!(
                "select {ORDER_COLUMNS} from orders \
                 where session_id = $1 and state = $2 order by id"
            ))
            .bind(session_id)
            .bind(s.as_str())
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query(&format!(
                "select {ORDER_COLUMNS} from orders where session_id = $1 order by id"
            ))
            .bind(session_id)
            .fetch_all(pool)
            .await
        }
    }
    .context("list orders failed")?;

    rows.iter().map(OrderRow::from_row).collect()
}

/// Non-terminal orders for one session, as reconciliation input.
pub async fn list_open_orders(pool: &PgPool, session_id: i64) -> Result<Vec<OrderRow>> {
    let rows = sqlx::query(&format!(
        "select {ORDER_COLUMNS} from orders \
         where session_id = $1 and state in ({OPEN_STATES}) order by id"
    ))
    .bind(session_id)
    .fetch_all(pool)
    .await
    .context("list open orders failed")?;

    rows.iter().map(OrderRow::from_row).collect()
}

// ---------------------------------------------------------------------------
// Admin operations
// ---------------------------------------------------------------------------

/// Durable cancel request: move to `pending_cancel` and enqueue the cancel
/// intent in one transaction. Staged group legs (never sent to the
/// exchange) cancel in place instead.
pub async fn request_cancel(
    pool: &PgPool,
    order_id: i64,
    reason: CancelReason,
) -> Result<Vec<TransitionOutcome>, OpError> {
    let mut tx = pool.begin().await.map_err(op_db)?;

    let Some(order) = lock_order(&mut tx, order_id).await.map_err(OpError::Database)? else {
        return Err(OpError::NotFound);
    };

    let applied = if order.state == OrderState::Staged {
        apply_event_conn(&mut tx, order_id, &OrderEvent::DirectCancel { reason }, "api")
            .await
            .map_err(OpError::Database)?
    } else {
        let applied = apply_event_conn(&mut tx, order_id, &OrderEvent::CancelRequest, "api")
            .await
            .map_err(OpError::Database)?;
        if applied.is_ok() {
            enqueue_intent(
                &mut tx,
                order_id,
                QueueAction::Cancel,
                Some(json!({ "reason": reason.as_str() })),
            )
            .await
            .map_err(OpError::Database)?;
        }
        applied
    };

    finish_admin_op(tx, applied).await
}

/// Durable amend request: validate against the locked row, move to
/// `pending_amend`, enqueue the amend intent.
pub async fn request_amend(
    pool: &PgPool,
    order_id: i64,
    new_price_cents: i32,
    new_quantity: i32,
) -> Result<Vec<TransitionOutcome>, OpError> {
    if new_price_cents <= 0 || new_price_cents >= 100 {
        return Err(OpError::InvalidInput(format!(
            "price_cents must be inside (0, 100), got {new_price_cents}"
        )));
    }
    if new_quantity <= 0 {
        return Err(OpError::InvalidInput(format!(
            "quantity must be positive, got {new_quantity}"
        )));
    }

    let mut tx = pool.begin().await.map_err(op_db)?;

    let Some(order) = lock_order(&mut tx, order_id).await.map_err(OpError::Database)? else {
        return Err(OpError::NotFound);
    };
    if new_quantity < order.filled_quantity {
        return Err(OpError::InvalidInput(format!(
            "new quantity {new_quantity} below filled quantity {}",
            order.filled_quantity
        )));
    }

    let applied = apply_event_conn(&mut tx, order_id, &OrderEvent::AmendRequest, "api")
        .await
        .map_err(OpError::Database)?;
    if applied.is_ok() {
        enqueue_intent(
            &mut tx,
            order_id,
            QueueAction::Amend,
            Some(json!({
                "new_price_cents": new_price_cents,
                "new_quantity": new_quantity,
            })),
        )
        .await
        .map_err(OpError::Database)?;
    }

    finish_admin_op(tx, applied).await
}

/// Durable decrease request: quantity only, never below `filled_quantity`.
pub async fn request_decrease(
    pool: &PgPool,
    order_id: i64,
    reduce_by: i32,
) -> Result<Vec<TransitionOutcome>, OpError> {
    if reduce_by <= 0 {
        return Err(OpError::InvalidInput(format!(
            "reduce_by must be positive, got {reduce_by}"
        )));
    }

    let mut tx = pool.begin().await.map_err(op_db)?;

    let Some(order) = lock_order(&mut tx, order_id).await.map_err(OpError::Database)? else {
        return Err(OpError::NotFound);
    };
    if order.quantity - reduce_by < order.filled_quantity {
        return Err(OpError::InvalidInput(format!(
            "decrease by {reduce_by} would cross filled quantity {} (quantity {})",
            order.filled_quantity, order.quantity
        )));
    }

    let applied = apply_event_conn(&mut tx, order_id, &OrderEvent::DecreaseRequest, "api")
        .await
        .map_err(OpError::Database)?;
    if applied.is_ok() {
        enqueue_intent(
            &mut tx,
            order_id,
            QueueAction::Decrease,
            Some(json!({ "reduce_by": reduce_by })),
        )
        .await
        .map_err(OpError::Database)?;
    }

    finish_admin_op(tx, applied).await
}

/// Commit the admin transaction. Illegal transitions keep their audit row
/// (the order itself is untouched) and surface as `OpError::Illegal`.
async fn finish_admin_op(
    mut tx: sqlx::Transaction<'_, sqlx::Postgres>,
    applied: Result<TransitionOutcome, TransitionError>,
) -> Result<Vec<TransitionOutcome>, OpError> {
    match applied {
        Err(illegal) => {
            tx.commit().await.map_err(op_db)?;
            Err(OpError::Illegal(illegal))
        }
        Ok(outcome) => {
            let mut outcomes = vec![outcome];
            let cascaded = cascade_group(&mut tx, &outcomes[0], "api")
                .await
                .map_err(OpError::Database)?;
            outcomes.extend(cascaded);
            tx.commit().await.map_err(op_db)?;
            Ok(outcomes)
        }
    }
}

fn op_db(e: sqlx::Error) -> OpError {
    OpError::Database(anyhow::Error::new(e))
}

//! Order groups: creation and explicit cancel.
//!
//! A group and all its legs are born in one transaction. Brackets stage
//! their children (no queue row until the entry fills); OCO legs dispatch
//! immediately. The cascade reactions to later transitions live in
//! `transitions::cascade_group`.

use anyhow::{Context, Result};
use harman_groups::validate_leg_roles;
use harman_oms::{
    Action, CancelReason, GroupType, LegRole, QueueAction, Side, TimeInForce,
};
use harman_risk::{
    available_notional_cents, open_notional_cents, Exposure, QuoteBook, RiskConfig, RiskRejection,
};
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::orders::{open_exposures_conn, EnqueueError, OpError};
use crate::queue::enqueue_intent;
use crate::rows::{GroupRow, OrderRow, SessionRow, ORDER_COLUMNS};
use crate::transitions::{
    apply_group_directives, load_group_snapshot_locked, TransitionOutcome,
};

/// One leg of a group creation request, already validated to integer cents.
#[derive(Debug, Clone)]
pub struct NewGroupLeg {
    pub client_order_id: Uuid,
    pub leg_role: LegRole,
    pub side: Side,
    pub action: Action,
    pub quantity: i32,
    pub price_cents: i32,
    pub time_in_force: TimeInForce,
}

/// Create a bracket: entry dispatches now, take-profit and stop-loss stage
/// until the entry fills.
pub async fn create_bracket(
    pool: &PgPool,
    session_id: i64,
    ticker: &str,
    entry: NewGroupLeg,
    take_profit: NewGroupLeg,
    stop_loss: NewGroupLeg,
    quotes: &QuoteBook,
    risk_cfg: &RiskConfig,
) -> Result<(GroupRow, Vec<OrderRow>), EnqueueError> {
    let legs = vec![entry, take_profit, stop_loss];
    create_group(pool, session_id, ticker, GroupType::Bracket, legs, quotes, risk_cfg).await
}

/// Create an OCO pair: both legs dispatch immediately.
pub async fn create_oco(
    pool: &PgPool,
    session_id: i64,
    ticker: &str,
    legs: [NewGroupLeg; 2],
    quotes: &QuoteBook,
    risk_cfg: &RiskConfig,
) -> Result<(GroupRow, Vec<OrderRow>), EnqueueError> {
    create_group(
        pool,
        session_id,
        ticker,
        GroupType::Oco,
        legs.into_iter().collect(),
        quotes,
        risk_cfg,
    )
    .await
}

async fn create_group(
    pool: &PgPool,
    session_id: i64,
    ticker: &str,
    group_type: GroupType,
    legs: Vec<NewGroupLeg>,
    quotes: &QuoteBook,
    risk_cfg: &RiskConfig,
) -> Result<(GroupRow, Vec<OrderRow>), EnqueueError> {
    // Shape and field validation before anything touches the database.
    let roles: Vec<LegRole> = legs.iter().map(|l| l.leg_role).collect();
    validate_leg_roles(group_type, &roles)
        .map_err(|e| EnqueueError::InvalidInput(e.to_string()))?;
    if ticker.trim().is_empty() {
        return Err(EnqueueError::InvalidInput("ticker must not be empty".to_string()));
    }
    for leg in &legs {
        if leg.quantity <= 0 {
            return Err(EnqueueError::InvalidInput(format!(
                "leg {} quantity must be positive",
                leg.client_order_id
            )));
        }
        if leg.price_cents <= 0 || leg.price_cents >= 100 {
            return Err(EnqueueError::InvalidInput(format!(
                "leg {} price_cents must be inside (0, 100)",
                leg.client_order_id
            )));
        }
    }

    let mut tx = pool.begin().await.map_err(db_err)?;

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

    // Every leg becomes a non-terminal order immediately (staged legs
    // included), so the gate prices the whole group as the candidate.
    let exposures = open_exposures_conn(&mut tx, session_id)
        .await
        .map_err(EnqueueError::Database)?;
    let candidate_exposures: Vec<Exposure> = legs
        .iter()
        .map(|l| Exposure {
            ticker: ticker.to_string(),
            action: l.action,
            quantity: i64::from(l.quantity),
        })
        .collect();
    let now = chrono::Utc::now();
    let open = open_notional_cents(&exposures, quotes, now, risk_cfg);
    let candidate = open_notional_cents(&candidate_exposures, quotes, now, risk_cfg);
    let max_notional = risk_cfg.effective_max_notional(session.max_notional_cents);
    let available = available_notional_cents(max_notional, open);
    if candidate > available {
        return Err(EnqueueError::RiskLimitBreached(
            RiskRejection::LimitBreached {
                candidate_notional_cents: candidate,
                available_notional_cents: available,
            },
        ));
    }

    let group_row = sqlx::query(
        r#"
        insert into order_groups (session_id, group_type)
        values ($1, $2)
        returning id, session_id, group_type, state, created_at, updated_at
        "#,
    )
    .bind(session_id)
    .bind(group_type.as_str())
    .fetch_one(&mut *tx)
    .await
    .map_err(db_err)?;
    let group = GroupRow::from_row(&group_row).map_err(EnqueueError::Database)?;

    let mut order_rows = Vec::with_capacity(legs.len());
    for leg in &legs {
        // Bracket children wait for the entry; everything else dispatches now.
        let initial_state = match (group_type, leg.leg_role) {
            (GroupType::Bracket, LegRole::TakeProfit | LegRole::StopLoss) => "staged",
            _ => "pending",
        };

        let inserted = sqlx::query(&format!(
            "insert into orders (session_id, client_order_id, ticker, side, action, \
                                 quantity, price_cents, time_in_force, state, group_id, leg_role) \
             values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             returning {ORDER_COLUMNS}"
        ))
        .bind(session_id)
        .bind(leg.client_order_id)
        .bind(ticker)
        .bind(leg.side.as_str())
        .bind(leg.action.as_str())
        .bind(leg.quantity)
        .bind(leg.price_cents)
        .bind(leg.time_in_force.as_str())
        .bind(initial_state)
        .bind(group.id)
        .bind(leg.leg_role.as_str())
        .fetch_one(&mut *tx)
        .await;

        let order = match inserted {
            Ok(row) => OrderRow::from_row(&row).map_err(EnqueueError::Database)?,
            Err(e) if crate::is_unique_constraint_violation(&e, "uq_orders_client_order_id") => {
                return Err(EnqueueError::DuplicateClientOrderId(leg.client_order_id));
            }
            Err(e) => return Err(db_err(e)),
        };

        if initial_state == "pending" {
            enqueue_intent(&mut tx, order.id, QueueAction::Submit, None)
                .await
                .map_err(EnqueueError::Database)?;
        }
        crate::audit::insert_audit(
            &mut tx,
            order.id,
            "none",
            initial_state,
            "created",
            "api",
            None,
        )
        .await
        .map_err(EnqueueError::Database)?;

        order_rows.push(order);
    }

    tx.commit().await.map_err(db_err)?;

    info!(
        group_id = group.id,
        group_type = group_type.as_str(),
        legs = order_rows.len(),
        "group created"
    );
    Ok((group, order_rows))
}

fn db_err(e: sqlx::Error) -> EnqueueError {
    EnqueueError::Database(anyhow::Error::new(e))
}

// ---------------------------------------------------------------------------
// Explicit cancel
// ---------------------------------------------------------------------------

/// Cancel every leg the exchange hasn't finished: staged legs in place,
/// live legs through `pending_cancel`. The group row closes `cancelled`
/// in the same transaction.
pub async fn cancel_group(
    pool: &PgPool,
    group_id: i64,
    reason: CancelReason,
) -> Result<Vec<TransitionOutcome>, OpError> {
    let mut tx = pool.begin().await.map_err(|e| OpError::Database(e.into()))?;

    let Some(snapshot) = load_group_snapshot_locked(&mut tx, group_id)
        .await
        .map_err(OpError::Database)?
    else {
        return Err(OpError::NotFound);
    };

    let plan = harman_groups::plan_group_cancel(&snapshot, reason);
    if plan.is_empty() {
        // Already closed: cancelling again is a no-op.
        return Ok(Vec::new());
    }

    let trigger = snapshot.legs.first().map(|l| l.order_id).unwrap_or(0);
    let outcomes = apply_group_directives(&mut tx, group_id, trigger, &plan, "api")
        .await
        .map_err(OpError::Database)?;

    tx.commit().await.map_err(|e| OpError::Database(e.into()))?;
    info!(group_id, cancelled_legs = outcomes.len(), "group cancelled");
    Ok(outcomes)
}

// ---------------------------------------------------------------------------
// Lookups
// ---------------------------------------------------------------------------

pub async fn fetch_group(
    pool: &PgPool,
    group_id: i64,
) -> Result<Option<(GroupRow, Vec<OrderRow>)>> {
    let row = sqlx::query(
        r#"
        select id, session_id, group_type, state, created_at, updated_at
        from order_groups
        where id = $1
        "#,
    )
    .bind(group_id)
    .fetch_optional(pool)
    .await
    .context("fetch group failed")?;

    let Some(row) = row else { return Ok(None) };
    let group = GroupRow::from_row(&row)?;

    let leg_rows = sqlx::query(&format!(
        "select {ORDER_COLUMNS} from orders where group_id = $1 order by id"
    ))
    .bind(group_id)
    .fetch_all(pool)
    .await
    .context("fetch group legs failed")?;
    let legs = leg_rows
        .iter()
        .map(OrderRow::from_row)
        .collect::<Result<Vec<_>>>()?;

    Ok(Some((group, legs)))
}

pub async fn list_groups(
    pool: &PgPool,
    session_id: i64,
) -> Result<Vec<(GroupRow, Vec<OrderRow>)>> {
    let group_rows = sqlx::query(
        r#"
        select id, session_id, group_type, state, created_at, updated_at
        from order_groups
        where session_id = $1
        order by id
        "#,
    )
    .bind(session_id)
    .fetch_all(pool)
    .await
    .context("list groups failed")?;

    let mut out = Vec::with_capacity(group_rows.len());
    for row in &group_rows {
        let group = GroupRow::from_row(row)?;
        let leg_rows = sqlx::query(&format!(
            "select {ORDER_COLUMNS} from orders where group_id = $1 order by id"
        ))
        .bind(group.id)
        .fetch_all(pool)
        .await
        .context("list group legs failed")?;
        let legs = leg_rows
            .iter()
            .map(OrderRow::from_row)
            .collect::<Result<Vec<_>>>()?;
        out.push((group, legs));
    }
    Ok(out)
}

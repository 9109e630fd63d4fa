//! Locked state transitions.
//!
//! Every order mutation takes the order's row lock, evaluates the pure
//! machine against the locked snapshot, persists the column changes, and
//! writes exactly one audit row per state change. Group cascades run in the
//! same transaction as the transition that triggered them.

use anyhow::{bail, Context, Result};
use harman_groups::{GroupDirective, GroupSnapshot, LegSnapshot, LegTransition};
use harman_oms::{transition, OrderEvent, OrderState, TransitionError};
use serde_json::{json, Value};
use sqlx::{PgConnection, PgPool};
use tracing::{debug, warn};

use crate::audit::{insert_audit, record_illegal_attempt};
use crate::orders::OpError;
use crate::queue::enqueue_intent;
use crate::rows::{OrderRow, ORDER_COLUMNS};

/// One committed state change.
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub order_id: i64,
    pub from: OrderState,
    pub to: OrderState,
    pub group_id: Option<i64>,
    pub note: Option<&'static str>,
}

impl TransitionOutcome {
    pub fn changed_state(&self) -> bool {
        self.from != self.to
    }
}

pub(crate) async fn lock_order(conn: &mut PgConnection, order_id: i64) -> Result<Option<OrderRow>> {
    let row = sqlx::query(&format!(
        "select {ORDER_COLUMNS} from orders where id = $1 for update"
    ))
    .bind(order_id)
    .fetch_optional(&mut *conn)
    .await
    .context("lock order failed")?;

    row.as_ref().map(OrderRow::from_row).transpose()
}

/// Audit payload for the event, when it carries anything worth keeping.
fn event_details(event: &OrderEvent, note: Option<&'static str>) -> Option<Value> {
    let mut details = match event {
        OrderEvent::Ack { exchange_order_id } => json!({ "exchange_order_id": exchange_order_id }),
        OrderEvent::Reject { reason } => json!({ "reason": reason }),
        OrderEvent::Fill { delta_qty } => json!({ "delta_qty": delta_qty }),
        OrderEvent::CancelConfirmed { reason } => json!({ "reason": reason.as_str() }),
        OrderEvent::AmendConfirmed {
            new_price_cents,
            new_quantity,
        } => json!({ "new_price_cents": new_price_cents, "new_quantity": new_quantity }),
        OrderEvent::DecreaseConfirmed { reduce_by } => json!({ "reduce_by": reduce_by }),
        OrderEvent::DirectCancel { reason } => json!({ "reason": reason.as_str() }),
        OrderEvent::ExchangeTerminal { state } => json!({ "remote_terminal": format!("{state:?}") }),
        _ => json!({}),
    };
    if let Some(n) = note {
        details["note"] = Value::String(n.to_string());
    }
    match details.as_object() {
        Some(m) if m.is_empty() => None,
        _ => Some(details),
    }
}

/// Apply `event` to the locked order. Returns the committed outcome, or the
/// machine's refusal (already audited) in the inner error.
pub(crate) async fn apply_event_conn(
    conn: &mut PgConnection,
    order_id: i64,
    event: &OrderEvent,
    actor: &str,
) -> Result<Result<TransitionOutcome, TransitionError>> {
    let Some(order) = lock_order(conn, order_id).await? else {
        bail!("order {order_id} not found");
    };

    let applied = match transition(&order.snapshot(), event) {
        Ok(applied) => applied,
        Err(err) => {
            warn!(order_id, %err, "illegal transition attempt");
            record_illegal_attempt(
                conn,
                order_id,
                order.state.as_str(),
                event.audit_name(),
                actor,
                err.detail.clone(),
            )
            .await?;
            return Ok(Err(err));
        }
    };

    // Pure no-op (duplicate ack, duplicate fill, cancel ack racing a fill):
    // nothing to persist, nothing to audit.
    if applied.is_noop(order.state) {
        debug!(
            order_id,
            state = %order.state,
            event = event.audit_name(),
            note = applied.note,
            "no-op transition"
        );
        return Ok(Ok(TransitionOutcome {
            order_id,
            from: order.state,
            to: order.state,
            group_id: order.group_id,
            note: applied.note,
        }));
    }

    sqlx::query(
        r#"
        update orders
        set state             = $1,
            exchange_order_id = coalesce($2, exchange_order_id),
            filled_quantity   = coalesce($3, filled_quantity),
            cancel_reason     = coalesce($4, cancel_reason),
            price_cents       = coalesce($5, price_cents),
            quantity          = coalesce($6, quantity)
        where id = $7
        "#,
    )
    .bind(applied.next_state.as_str())
    .bind(applied.set_exchange_order_id.as_deref())
    .bind(applied.new_filled_quantity)
    .bind(applied.cancel_reason.map(|r| r.as_str()))
    .bind(applied.new_price_cents)
    .bind(applied.new_quantity)
    .bind(order_id)
    .execute(&mut *conn)
    .await
    .context("update order failed")?;

    insert_audit(
        conn,
        order_id,
        order.state.as_str(),
        applied.next_state.as_str(),
        event.audit_name(),
        actor,
        event_details(event, applied.note),
    )
    .await?;

    Ok(Ok(TransitionOutcome {
        order_id,
        from: order.state,
        to: applied.next_state,
        group_id: order.group_id,
        note: applied.note,
    }))
}

// ---------------------------------------------------------------------------
// Group cascade
// ---------------------------------------------------------------------------

pub(crate) async fn load_group_snapshot_locked(
    conn: &mut PgConnection,
    group_id: i64,
) -> Result<Option<GroupSnapshot>> {
    let group = sqlx::query(
        r#"
        select id, session_id, group_type, state, created_at, updated_at
        from order_groups
        where id = $1
        for update
        "#,
    )
    .bind(group_id)
    .fetch_optional(&mut *conn)
    .await
    .context("lock group failed")?;

    let Some(group) = group else { return Ok(None) };
    let group = crate::rows::GroupRow::from_row(&group)?;

    let leg_rows = sqlx::query(&format!(
        "select {ORDER_COLUMNS} from orders where group_id = $1 order by id for update"
    ))
    .bind(group_id)
    .fetch_all(&mut *conn)
    .await
    .context("lock group legs failed")?;

    let mut legs = Vec::with_capacity(leg_rows.len());
    for row in &leg_rows {
        let leg = OrderRow::from_row(row)?;
        legs.push(LegSnapshot {
            order_id: leg.id,
            leg_role: leg
                .leg_role
                .with_context(|| format!("group {group_id} leg {} missing role", leg.id))?,
            state: leg.state,
            filled_quantity: leg.filled_quantity,
        });
    }

    Ok(Some(GroupSnapshot {
        group_id: group.id,
        group_type: group.group_type,
        state: group.state,
        legs,
    }))
}

pub(crate) async fn apply_group_directives(
    conn: &mut PgConnection,
    group_id: i64,
    trigger_order_id: i64,
    directives: &[GroupDirective],
    actor: &str,
) -> Result<Vec<TransitionOutcome>> {
    let mut outcomes = Vec::new();

    for directive in directives {
        match directive {
            GroupDirective::ReleaseLeg { order_id } => {
                let outcome = apply_event_conn(conn, *order_id, &OrderEvent::Release, actor)
                    .await?
                    .map_err(|e| anyhow::anyhow!("group release refused: {e}"))?;
                enqueue_intent(conn, *order_id, harman_oms::QueueAction::Submit, None).await?;
                outcomes.push(outcome);
            }
            GroupDirective::RequestCancel { order_id, reason } => {
                let outcome = apply_event_conn(conn, *order_id, &OrderEvent::CancelRequest, actor)
                    .await?
                    .map_err(|e| anyhow::anyhow!("group cancel refused: {e}"))?;
                enqueue_intent(
                    conn,
                    *order_id,
                    harman_oms::QueueAction::Cancel,
                    Some(json!({ "reason": reason.as_str() })),
                )
                .await?;
                outcomes.push(outcome);
            }
            GroupDirective::DirectCancel { order_id, reason } => {
                let outcome = apply_event_conn(
                    conn,
                    *order_id,
                    &OrderEvent::DirectCancel { reason: *reason },
                    actor,
                )
                .await?
                .map_err(|e| anyhow::anyhow!("group direct cancel refused: {e}"))?;
                outcomes.push(outcome);
            }
            GroupDirective::CloseGroup { state } => {
                sqlx::query(
                    r#"
                    update order_groups set state = $1 where id = $2
                    "#,
                )
                .bind(state.as_str())
                .bind(group_id)
                .execute(&mut *conn)
                .await
                .context("close group failed")?;
            }
            GroupDirective::WarnBothFilled => {
                warn!(order_id = trigger_order_id, "both OCO legs filled before cancel landed");
                let current = lock_order(conn, trigger_order_id)
                    .await?
                    .context("trigger order vanished")?;
                insert_audit(
                    conn,
                    trigger_order_id,
                    current.state.as_str(),
                    current.state.as_str(),
                    "oco_both_filled_race",
                    actor,
                    None,
                )
                .await?;
            }
        }
    }

    Ok(outcomes)
}

/// Run the group engine for a committed transition, inside the same
/// transaction. No-op for free-standing orders.
pub(crate) async fn cascade_group(
    conn: &mut PgConnection,
    outcome: &TransitionOutcome,
    actor: &str,
) -> Result<Vec<TransitionOutcome>> {
    let Some(group_id) = outcome.group_id else {
        return Ok(Vec::new());
    };
    if !outcome.changed_state() {
        return Ok(Vec::new());
    }

    let Some(snapshot) = load_group_snapshot_locked(conn, group_id).await? else {
        bail!("order {} references missing group {group_id}", outcome.order_id);
    };

    let plan = harman_groups::on_leg_transition(
        &snapshot,
        &LegTransition {
            order_id: outcome.order_id,
            from: outcome.from,
            to: outcome.to,
        },
    );
    if plan.is_empty() {
        return Ok(Vec::new());
    }

    debug!(group_id, trigger = outcome.order_id, directives = plan.len(), "group cascade");
    apply_group_directives(conn, group_id, outcome.order_id, &plan, actor).await
}

// ---------------------------------------------------------------------------
// Public entry point
// ---------------------------------------------------------------------------

/// Apply one event (plus any group cascade) in a single transaction.
///
/// On an illegal transition the `illegal_transition_attempt` audit row is
/// kept (the transaction commits with the order untouched) and the typed
/// error is returned for the caller to surface.
pub async fn apply_event(
    pool: &PgPool,
    order_id: i64,
    event: &OrderEvent,
    actor: &str,
) -> Result<Vec<TransitionOutcome>, OpError> {
    let mut tx = pool.begin().await.map_err(op_db)?;

    let applied = apply_event_conn(&mut tx, order_id, event, actor)
        .await
        .map_err(OpError::Database)?;

    match applied {
        Err(illegal) => {
            tx.commit().await.map_err(op_db)?;
            Err(OpError::Illegal(illegal))
        }
        Ok(outcome) => {
            let mut outcomes = vec![outcome];
            let cascaded = cascade_group(&mut tx, &outcomes[0], actor)
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

/// Record fills discovered outside the sweeper path (reconciliation
/// healing): each new `trade_id` is inserted and drives a `Fill` event,
/// with group cascades, in one transaction. Duplicates are skipped.
pub async fn apply_fills(
    pool: &PgPool,
    order_id: i64,
    fills: &[harman_exchange::FillReport],
    actor: &str,
) -> Result<Vec<TransitionOutcome>> {
    let mut tx = pool.begin().await?;
    let mut outcomes = Vec::new();

    for fill in fills {
        let inserted = crate::fills::record_fill_conn(&mut tx, order_id, fill).await?;
        if !inserted {
            continue;
        }
        match apply_event_conn(
            &mut tx,
            order_id,
            &OrderEvent::Fill {
                delta_qty: fill.quantity,
            },
            actor,
        )
        .await?
        {
            Ok(outcome) => outcomes.push(outcome),
            Err(err) => {
                warn!(order_id, trade_id = %fill.trade_id, %err, "healed fill refused");
            }
        }
    }

    let mut cascaded = Vec::new();
    for outcome in outcomes.iter().filter(|o| o.changed_state()) {
        cascaded.extend(cascade_group(&mut tx, outcome, actor).await?);
    }
    outcomes.extend(cascaded);

    tx.commit().await?;
    Ok(outcomes)
}

/// Expire IOC orders the exchange should have resolved long ago: nothing
/// filled → `expired`; a partial residue → `cancelled` with reason
/// `expired`. The reconcile loop calls this each pass.
pub async fn expire_stale_ioc(pool: &PgPool, grace_secs: i64) -> Result<Vec<TransitionOutcome>> {
    let ids: Vec<(i64,)> = sqlx::query_as(
        r#"
        select id from orders
        where time_in_force = 'ioc'
          and state in ('acknowledged', 'partially_filled')
          and updated_at < now() - make_interval(secs => $1)
        order by id
        "#,
    )
    .bind(grace_secs as f64)
    .fetch_all(pool)
    .await
    .context("stale ioc query failed")?;

    let mut outcomes = Vec::new();
    for (order_id,) in ids {
        match apply_event(pool, order_id, &OrderEvent::IocExpired, "reconciler").await {
            Ok(mut o) => outcomes.append(&mut o),
            Err(OpError::Illegal(e)) => {
                // The order moved on between the scan and the lock; the
                // attempt is audited and that is enough.
                debug!(order_id, %e, "ioc expiry raced a transition");
            }
            Err(OpError::Database(e)) => return Err(e),
            Err(other) => bail!("ioc expiry failed: {other}"),
        }
    }
    Ok(outcomes)
}

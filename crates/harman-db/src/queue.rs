//! The transactional outbox protocol.
//!
//! Queue rows are intents the sweeper must deliver to the exchange. The
//! dequeue step claims exactly one row under `FOR UPDATE SKIP LOCKED` in a
//! short transaction; the adapter call happens outside any transaction; and
//! the completion step applies the resulting events, the group cascade, and
//! the queue-row delete atomically. A worker crash between claim and
//! completion leaves `processing = TRUE`, which the recovery pass clears
//! after the configured horizon — adapter idempotency makes the re-dispatch
//! safe.

use anyhow::{Context, Result};
use harman_exchange::FillReport;
use harman_oms::{OrderEvent, OrderState, QueueAction};
use serde_json::Value;
use sqlx::{PgConnection, PgPool};
use tracing::{debug, info, warn};

use crate::fills::record_fill_conn;
use crate::rows::OrderRow;
use crate::transitions::{apply_event_conn, cascade_group, TransitionOutcome};

/// A claimed intent plus the order snapshot it targets.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub queue_id: i64,
    pub action: QueueAction,
    pub metadata: Option<Value>,
    pub order: OrderRow,
}

/// Insert an intent row. Always called inside the transaction that made
/// the intent necessary (invariant I1: order mutations and their queue
/// rows commit together).
pub(crate) async fn enqueue_intent(
    conn: &mut PgConnection,
    order_id: i64,
    action: QueueAction,
    metadata: Option<Value>,
) -> Result<i64> {
    let (queue_id,): (i64,) = sqlx::query_as(
        r#"
        insert into order_queue (order_id, action, metadata)
        values ($1, $2, $3)
        returning id
        "#,
    )
    .bind(order_id)
    .bind(action.as_str())
    .bind(metadata)
    .fetch_one(&mut *conn)
    .await
    .context("enqueue intent failed")?;

    debug!(order_id, queue_id, action = action.as_str(), "intent enqueued");
    Ok(queue_id)
}

/// Claim the oldest ready queue row, if any.
///
/// Short transaction: claim the row (`FOR UPDATE SKIP LOCKED`, mark
/// `processing`), and for `submit` intents move the order `pending →
/// submitted` so the adapter-call window is observable. Commits before the
/// adapter is ever touched.
pub async fn dequeue_queue_item(pool: &PgPool, worker: &str) -> Result<Option<QueueItem>> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query(
        r#"
        select q.id as queue_id, q.action as queue_action, q.metadata as queue_metadata, o.*
        from order_queue q
        join orders o on o.id = q.order_id
        where not q.processing
        order by q.id
        limit 1
        for update of q skip locked
        "#,
    )
    .fetch_optional(&mut *tx)
    .await
    .context("dequeue query failed")?;

    let Some(row) = row else {
        tx.rollback().await.ok();
        return Ok(None);
    };

    use sqlx::Row;
    let queue_id: i64 = row.try_get("queue_id")?;
    let action = QueueAction::parse(row.try_get::<String, _>("queue_action")?.as_str())
        .context("order_queue.action")?;
    let metadata: Option<Value> = row.try_get("queue_metadata")?;
    let mut order = OrderRow::from_row(&row)?;

    sqlx::query(
        r#"
        update order_queue
        set processing = true, claimed_at = now()
        where id = $1
        "#,
    )
    .bind(queue_id)
    .execute(&mut *tx)
    .await
    .context("mark processing failed")?;

    // Submit intents pass through the transient `submitted` state while the
    // adapter call is in flight. Re-dispatch after recovery finds the order
    // already `submitted`; the event is a no-op then.
    if action == QueueAction::Submit && order.state == OrderState::Pending {
        let applied = apply_event_conn(&mut tx, order.id, &OrderEvent::Submit, worker)
            .await?
            .map_err(|e| anyhow::anyhow!("submit dispatch refused: {e}"))?;
        order.state = applied.to;
    }

    tx.commit().await?;

    debug!(queue_id, order_id = order.id, action = action.as_str(), worker, "intent claimed");
    Ok(Some(QueueItem {
        queue_id,
        action,
        metadata,
        order,
    }))
}

/// Finish a claimed intent after the adapter responded.
///
/// One transaction: apply the lead event (ACK, reject, cancel/amend
/// confirmation, …), record any attached fills (deduped by `trade_id`,
/// each new one driving a `Fill` event), run the group cascade for every
/// state change, and delete the queue row.
///
/// An illegal lead event is audited by the machine and the row is consumed
/// anyway — re-dispatching an intent the order can no longer accept would
/// loop forever.
pub async fn complete_queue_item(
    pool: &PgPool,
    queue_id: i64,
    order_id: i64,
    actor: &str,
    lead_event: Option<OrderEvent>,
    fills: &[FillReport],
) -> Result<Vec<TransitionOutcome>> {
    let mut tx = pool.begin().await?;
    let mut outcomes: Vec<TransitionOutcome> = Vec::new();

    if let Some(event) = lead_event {
        match apply_event_conn(&mut tx, order_id, &event, actor).await? {
            Ok(outcome) => outcomes.push(outcome),
            Err(err) => {
                warn!(order_id, queue_id, %err, "lead event refused; consuming intent");
            }
        }
    }

    for fill in fills {
        let inserted = record_fill_conn(&mut tx, order_id, fill).await?;
        if !inserted {
            debug!(order_id, trade_id = %fill.trade_id, "duplicate fill ignored");
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
                // Fill row is kept (exchange truth); the state fault is audited.
                warn!(order_id, trade_id = %fill.trade_id, %err, "fill event refused");
            }
        }
    }

    let mut cascaded = Vec::new();
    for outcome in outcomes.iter().filter(|o| o.changed_state()) {
        cascaded.extend(cascade_group(&mut tx, outcome, actor).await?);
    }
    outcomes.extend(cascaded);

    sqlx::query("delete from order_queue where id = $1")
        .bind(queue_id)
        .execute(&mut *tx)
        .await
        .context("delete queue row failed")?;

    tx.commit().await?;
    debug!(queue_id, order_id, outcomes = outcomes.len(), "intent completed");
    Ok(outcomes)
}

/// Retriable adapter failure: release the claim so the next tick finds the
/// row again.
pub async fn release_queue_item(pool: &PgPool, queue_id: i64) -> Result<()> {
    sqlx::query(
        r#"
        update order_queue
        set processing = false, claimed_at = null
        where id = $1
        "#,
    )
    .bind(queue_id)
    .execute(pool)
    .await
    .context("release queue row failed")?;
    Ok(())
}

/// Permanent failure on a non-submit intent whose order should revert: the
/// reverting event plus the queue delete in one transaction.
pub async fn fail_queue_item(
    pool: &PgPool,
    queue_id: i64,
    order_id: i64,
    actor: &str,
    event: OrderEvent,
) -> Result<Vec<TransitionOutcome>> {
    complete_queue_item(pool, queue_id, order_id, actor, Some(event), &[]).await
}

/// Startup / periodic recovery: clear claims whose worker died.
///
/// Only rows older than the horizon are touched so a live worker's
/// in-flight claim is never stolen; adapter idempotency makes the eventual
/// re-dispatch safe (scenario S6).
pub async fn recover_stale_processing(pool: &PgPool, horizon_secs: i64) -> Result<u64> {
    let result = sqlx::query(
        r#"
        update order_queue
        set processing = false, claimed_at = null
        where processing
          and claimed_at < now() - make_interval(secs => $1)
        "#,
    )
    .bind(horizon_secs as f64)
    .execute(pool)
    .await
    .context("recover stale processing failed")?;

    let recovered = result.rows_affected();
    if recovered > 0 {
        info!(recovered, "recovered stale queue claims");
    }
    Ok(recovered)
}

/// Rows awaiting dispatch (diagnostics).
pub async fn queue_depth(pool: &PgPool) -> Result<i64> {
    let (n,): (i64,) =
        sqlx::query_as("select count(*)::bigint from order_queue where not processing")
            .fetch_one(pool)
            .await
            .context("queue depth query failed")?;
    Ok(n)
}

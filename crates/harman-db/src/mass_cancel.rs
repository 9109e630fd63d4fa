//! The kill switch.
//!
//! One transaction drives the whole session toward a safe state: every
//! non-terminal order either cancels in place (staged legs) or gets a
//! durable cancel intent, and admission is paused until the operator
//! resumes. Partial progress is impossible; a crash mid-sweep rolls the
//! whole thing back.

use anyhow::{Context, Result};
use harman_oms::{CancelReason, OrderEvent, OrderState, QueueAction};
use serde_json::json;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::queue::enqueue_intent;
use crate::rows::{OrderRow, ORDER_COLUMNS};
use crate::sessions::set_admission_state;
use crate::transitions::{apply_event_conn, load_group_snapshot_locked};

#[derive(Debug, Clone, Default)]
pub struct MassCancelOutcome {
    /// Orders that got a `cancel` queue row.
    pub cancels_enqueued: i64,
    /// Staged legs cancelled in place (no queue row needed).
    pub staged_cancelled: i64,
    /// Orders skipped because a cancel was already in flight.
    pub already_cancelling: i64,
}

/// Cancel everything non-terminal in the session and pause admission.
///
/// Idempotent: orders already in `pending_cancel` are skipped, and a second
/// sweep finds nothing to do.
pub async fn mass_cancel_session(
    pool: &PgPool,
    session_id: i64,
    reason: CancelReason,
) -> Result<MassCancelOutcome> {
    let mut tx = pool.begin().await?;
    let mut outcome = MassCancelOutcome::default();

    let rows = sqlx::query(&format!(
        "select {ORDER_COLUMNS} from orders \
         where session_id = $1 \
           and state not in ('filled', 'cancelled', 'rejected', 'expired') \
         order by id \
         for update"
    ))
    .bind(session_id)
    .fetch_all(&mut *tx)
    .await
    .context("lock non-terminal orders failed")?;

    let mut group_ids: Vec<i64> = Vec::new();

    for row in &rows {
        let order = OrderRow::from_row(row)?;
        if let Some(gid) = order.group_id {
            if !group_ids.contains(&gid) {
                group_ids.push(gid);
            }
        }

        match order.state {
            OrderState::Staged => {
                apply_event_conn(
                    &mut tx,
                    order.id,
                    &OrderEvent::DirectCancel { reason },
                    "admin",
                )
                .await?
                .map_err(|e| anyhow::anyhow!("mass cancel direct refuse: {e}"))?;
                outcome.staged_cancelled += 1;
            }
            OrderState::PendingCancel => {
                // A cancel is already in flight; nothing to add.
                outcome.already_cancelling += 1;
            }
            _ => {
                let applied = apply_event_conn(
                    &mut tx,
                    order.id,
                    &OrderEvent::CancelRequest,
                    "admin",
                )
                .await?;
                match applied {
                    Ok(_) => {
                        enqueue_intent(
                            &mut tx,
                            order.id,
                            QueueAction::Cancel,
                            Some(json!({ "reason": reason.as_str() })),
                        )
                        .await?;
                        outcome.cancels_enqueued += 1;
                    }
                    Err(e) => {
                        // The order terminated between the lock list and now
                        // within this transaction; impossible, but never let
                        // the kill switch die on one order.
                        warn!(order_id = order.id, %e, "mass cancel skip");
                    }
                }
            }
        }
    }

    // Groups whose legs all just became terminal (staged-only brackets)
    // close right here; the rest close when their cancels confirm.
    for group_id in group_ids {
        if let Some(snapshot) = load_group_snapshot_locked(&mut tx, group_id).await? {
            if let Some(state) = harman_groups::close_state_if_all_terminal(&snapshot) {
                sqlx::query("update order_groups set state = $1 where id = $2")
                    .bind(state.as_str())
                    .bind(group_id)
                    .execute(&mut *tx)
                    .await
                    .context("close group during mass cancel failed")?;
            }
        }
    }

    set_admission_state(&mut tx, "PAUSED", Some("mass_cancel")).await?;

    tx.commit().await?;

    info!(
        session_id,
        cancels_enqueued = outcome.cancels_enqueued,
        staged_cancelled = outcome.staged_cancelled,
        already_cancelling = outcome.already_cancelling,
        reason = reason.as_str(),
        "mass cancel committed"
    );
    Ok(outcome)
}

/// All open sessions' ids; graceful shutdown sweeps each one.
pub async fn open_session_ids(pool: &PgPool) -> Result<Vec<i64>> {
    let rows: Vec<(i64,)> =
        sqlx::query_as("select id from sessions where closed_at is null order by id")
            .fetch_all(pool)
            .await
            .context("list open sessions failed")?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

//! Append-only transition log.
//!
//! Exactly one row per state change (invariant I9); illegal attempts and
//! reconciliation warnings are recorded with `from_state = to_state` so the
//! trail stays monotone (no row ever has a terminal `from_state` moving
//! elsewhere).

use anyhow::{Context, Result};
use serde_json::{json, Value};
use sqlx::{PgConnection, PgPool};

use crate::rows::AuditRow;

pub(crate) async fn insert_audit(
    conn: &mut PgConnection,
    order_id: i64,
    from_state: &str,
    to_state: &str,
    event: &str,
    actor: &str,
    details: Option<Value>,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into audit_log (order_id, from_state, to_state, event, actor, details)
        values ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(order_id)
    .bind(from_state)
    .bind(to_state)
    .bind(event)
    .bind(actor)
    .bind(details)
    .execute(&mut *conn)
    .await
    .context("insert audit failed")?;
    Ok(())
}

/// Record an exchange order the store never admitted. Written at most once
/// per `exchange_order_id` so repeated reconciliation passes add nothing.
/// Keyed on the sentinel order id 0 is not possible (FK), so the entry
/// hangs off no order: it is stored against the audit table via a dedicated
/// orphans ledger.
pub async fn record_orphan_once(pool: &PgPool, exchange_order_id: &str) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        insert into reconcile_orphans (exchange_order_id)
        values ($1)
        on conflict (exchange_order_id) do nothing
        returning id
        "#,
    )
    .bind(exchange_order_id)
    .fetch_optional(pool)
    .await
    .context("record orphan failed")?;

    Ok(row.is_some())
}

/// List audit rows, newest last, optionally scoped to one order.
pub async fn list_audit(
    pool: &PgPool,
    order_id: Option<i64>,
    limit: i64,
) -> Result<Vec<AuditRow>> {
    let rows = match order_id {
        Some(id) => {
            sqlx::query(
                r#"
                select id, order_id, from_state, to_state, event, actor, details, created_at
                from audit_log
                where order_id = $1
                order by id asc
                limit $2
                "#,
            )
            .bind(id)
            .bind(limit)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query(
                r#"
                select id, order_id, from_state, to_state, event, actor, details, created_at
                from audit_log
                order by id asc
                limit $1
                "#,
            )
            .bind(limit)
            .fetch_all(pool)
            .await
        }
    }
    .context("list audit failed")?;

    rows.iter().map(AuditRow::from_row).collect()
}

/// Reconciliation saw price/quantity drift it must not heal; leave the
/// evidence for operators. The same observation is recorded once: a repeat
/// pass over unchanged state adds nothing (P10). Returns whether a row was
/// written.
pub async fn record_divergence_warning(
    pool: &PgPool,
    order_id: i64,
    field: &str,
    local: i64,
    remote: i64,
) -> Result<bool> {
    let details = json!({ "field": field, "local": local, "remote": remote });

    let mut conn = pool.acquire().await?;
    let (already,): (bool,) = sqlx::query_as(
        r#"
        select exists (
            select 1 from audit_log
            where order_id = $1 and event = 'reconcile_divergence' and details @> $2
        )
        "#,
    )
    .bind(order_id)
    .bind(&details)
    .fetch_one(&mut *conn)
    .await
    .context("divergence dedupe check failed")?;
    if already {
        return Ok(false);
    }

    let (state,): (String,) = sqlx::query_as("select state from orders where id = $1")
        .bind(order_id)
        .fetch_one(&mut *conn)
        .await
        .context("read order state failed")?;
    insert_audit(
        &mut conn,
        order_id,
        &state,
        &state,
        "reconcile_divergence",
        "reconciler",
        Some(details),
    )
    .await?;
    Ok(true)
}

/// Audit an event the machine refused. The order row is untouched; the
/// attempt itself is evidence for operators.
pub(crate) async fn record_illegal_attempt(
    conn: &mut PgConnection,
    order_id: i64,
    current_state: &str,
    attempted_event: &str,
    actor: &str,
    detail: Option<String>,
) -> Result<()> {
    insert_audit(
        conn,
        order_id,
        current_state,
        current_state,
        "illegal_transition_attempt",
        actor,
        Some(json!({
            "attempted_event": attempted_event,
            "detail": detail,
        })),
    )
    .await
}

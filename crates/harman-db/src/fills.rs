//! Executions: append-only, deduped by exchange trade id.

use anyhow::{Context, Result};
use harman_exchange::FillReport;
use sqlx::{PgConnection, PgPool};

use crate::rows::FillRow;

/// Insert one fill. Returns `false` when the `trade_id` was already
/// recorded (out-of-order and duplicate delivery are both safe).
///
/// The caller pairs every successful insert with a `Fill` state-machine
/// event so `filled_quantity` stays equal to the sum of fills (I4).
pub(crate) async fn record_fill_conn(
    conn: &mut PgConnection,
    order_id: i64,
    fill: &FillReport,
) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        insert into fills (order_id, trade_id, price_cents, quantity, is_taker, filled_at)
        values ($1, $2, $3, $4, $5, $6)
        on conflict (trade_id) do nothing
        returning id
        "#,
    )
    .bind(order_id)
    .bind(&fill.trade_id)
    .bind(fill.price_cents)
    .bind(fill.quantity)
    .bind(fill.is_taker)
    .bind(fill.filled_at)
    .fetch_optional(&mut *conn)
    .await
    .context("insert fill failed")?;

    Ok(row.is_some())
}

/// Standalone fill insert (tests and tools); production writes go through
/// `complete_queue_item` / the reconciler so the state machine sees every
/// new fill.
pub async fn record_fill(pool: &PgPool, order_id: i64, fill: &FillReport) -> Result<bool> {
    let mut conn = pool.acquire().await?;
    record_fill_conn(&mut conn, order_id, fill).await
}

/// List fills, optionally scoped to one order.
pub async fn list_fills(pool: &PgPool, order_id: Option<i64>, limit: i64) -> Result<Vec<FillRow>> {
    let rows = match order_id {
        Some(id) => {
            sqlx::query(
                r#"
                select id, order_id, trade_id, price_cents, quantity, is_taker,
                       filled_at, created_at
                from fills
                where order_id = $1
                order by id
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
                select id, order_id, trade_id, price_cents, quantity, is_taker,
                       filled_at, created_at
                from fills
                order by id
                limit $1
                "#,
            )
            .bind(limit)
            .fetch_all(pool)
            .await
        }
    }
    .context("list fills failed")?;

    rows.iter().map(FillRow::from_row).collect()
}

/// Net open contracts per (ticker, side) for one session.
pub async fn positions(pool: &PgPool, session_id: i64) -> Result<Vec<(String, String, i64)>> {
    let rows: Vec<(String, String, i64)> = sqlx::query_as(
        r#"
        select o.ticker, o.side,
               coalesce(sum(case when o.action = 'buy' then f.quantity
                                 else -f.quantity end), 0)::bigint as net
        from fills f
        join orders o on o.id = f.order_id
        where o.session_id = $1
        group by o.ticker, o.side
        having coalesce(sum(case when o.action = 'buy' then f.quantity
                                 else -f.quantity end), 0) <> 0
        order by o.ticker, o.side
        "#,
    )
    .bind(session_id)
    .fetch_all(pool)
    .await
    .context("positions query failed")?;

    Ok(rows)
}

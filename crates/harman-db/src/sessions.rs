//! Trading sessions and the admission kill-switch singleton.

use anyhow::{Context, Result};
use sqlx::{PgConnection, PgPool};
use tracing::info;

use crate::rows::SessionRow;

/// Find the open session for `(exchange, api_key_prefix)`, creating it on
/// first use. The partial unique index serializes concurrent creators: the
/// loser of the race re-reads the winner's row.
pub async fn get_or_create_session(
    pool: &PgPool,
    exchange: &str,
    api_key_prefix: &str,
) -> Result<SessionRow> {
    if let Some(existing) = fetch_open_session(pool, exchange, api_key_prefix).await? {
        return Ok(existing);
    }

    let inserted = sqlx::query(
        r#"
        insert into sessions (exchange, api_key_prefix)
        values ($1, $2)
        returning id, exchange, api_key_prefix, max_notional_cents, created_at, closed_at
        "#,
    )
    .bind(exchange)
    .bind(api_key_prefix)
    .fetch_one(pool)
    .await;

    match inserted {
        Ok(row) => {
            let session = SessionRow::from_row(&row)?;
            info!(session_id = session.id, exchange, api_key_prefix, "session created");
            Ok(session)
        }
        Err(e) if crate::is_unique_constraint_violation(&e, "uq_sessions_open_pair") => {
            fetch_open_session(pool, exchange, api_key_prefix)
                .await?
                .context("open session vanished after unique-violation race")
        }
        Err(e) => Err(anyhow::Error::new(e).context("insert session failed")),
    }
}

async fn fetch_open_session(
    pool: &PgPool,
    exchange: &str,
    api_key_prefix: &str,
) -> Result<Option<SessionRow>> {
    let row = sqlx::query(
        r#"
        select id, exchange, api_key_prefix, max_notional_cents, created_at, closed_at
        from sessions
        where exchange = $1 and api_key_prefix = $2 and closed_at is null
        "#,
    )
    .bind(exchange)
    .bind(api_key_prefix)
    .fetch_optional(pool)
    .await
    .context("fetch open session failed")?;

    row.as_ref().map(SessionRow::from_row).transpose()
}

pub async fn fetch_session(pool: &PgPool, session_id: i64) -> Result<Option<SessionRow>> {
    let row = sqlx::query(
        r#"
        select id, exchange, api_key_prefix, max_notional_cents, created_at, closed_at
        from sessions
        where id = $1
        "#,
    )
    .bind(session_id)
    .fetch_optional(pool)
    .await
    .context("fetch session failed")?;

    row.as_ref().map(SessionRow::from_row).transpose()
}

/// Administrative close. Idempotent: closing a closed session is a no-op.
pub async fn close_session(pool: &PgPool, session_id: i64) -> Result<()> {
    sqlx::query(
        r#"
        update sessions
        set closed_at = now()
        where id = $1 and closed_at is null
        "#,
    )
    .bind(session_id)
    .execute(pool)
    .await
    .context("close session failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Admission state singleton
// ---------------------------------------------------------------------------

pub async fn is_admission_paused(conn: &mut PgConnection) -> Result<bool> {
    let (state,): (String,) = sqlx::query_as(
        r#"
        select state from sys_admission_state where sentinel_id = 1
        "#,
    )
    .fetch_one(&mut *conn)
    .await
    .context("read admission state failed")?;
    Ok(state == "PAUSED")
}

pub(crate) async fn set_admission_state(
    conn: &mut PgConnection,
    state: &str,
    reason: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        update sys_admission_state
        set state = $1, reason = $2, updated_at = now()
        where sentinel_id = 1
        "#,
    )
    .bind(state)
    .bind(reason)
    .execute(&mut *conn)
    .await
    .context("set admission state failed")?;
    Ok(())
}

/// Stop admitting new orders (mass cancel flips this).
pub async fn pause_admission(pool: &PgPool, reason: &str) -> Result<()> {
    let mut conn = pool.acquire().await?;
    set_admission_state(&mut conn, "PAUSED", Some(reason)).await?;
    info!(reason, "admission paused");
    Ok(())
}

/// Re-enable admission after a pause.
pub async fn resume_admission(pool: &PgPool) -> Result<()> {
    let mut conn = pool.acquire().await?;
    set_admission_state(&mut conn, "ARMED", None).await?;
    info!("admission resumed");
    Ok(())
}

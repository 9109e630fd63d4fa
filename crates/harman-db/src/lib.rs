//! Postgres system of record.
//!
//! Every mutation of an order, its queue row, its fills, or its group runs
//! inside a transaction here, and every state change flows through the pure
//! machine in `harman-oms` while the order's row lock is held. The store is
//! the single point of serialization; workers, the reconciler, and the
//! admission path coordinate exclusively through it.

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub mod audit;
pub mod fills;
pub mod groups;
pub mod mass_cancel;
pub mod orders;
pub mod queue;
pub mod rows;
pub mod sessions;
pub mod transitions;

pub use audit::{list_audit, record_divergence_warning, record_orphan_once};
pub use fills::{list_fills, positions, record_fill};
pub use groups::{cancel_group, create_bracket, create_oco, fetch_group, list_groups, NewGroupLeg};
pub use mass_cancel::{mass_cancel_session, open_session_ids, MassCancelOutcome};
pub use orders::{
    enqueue_order, fetch_order, fetch_order_by_client_id, list_open_orders, list_orders,
    open_exposures, request_amend, request_cancel, request_decrease, EnqueueError, NewOrder,
    OpError,
};
pub use queue::{
    complete_queue_item, dequeue_queue_item, fail_queue_item, queue_depth,
    recover_stale_processing, release_queue_item, QueueItem,
};
pub use rows::{AuditRow, FillRow, GroupRow, OrderRow, SessionRow};
pub use sessions::{
    close_session, fetch_session, get_or_create_session, is_admission_paused, pause_admission,
    resume_admission,
};
pub use transitions::{apply_event, apply_fills, expire_stale_ioc, TransitionOutcome};

pub const ENV_DB_URL: &str = "HARMAN_DATABASE_URL";

/// Connect to Postgres using HARMAN_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url).await
}

pub async fn connect(url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(pool)
}

/// Run embedded SQLx migrations (idempotent; `_sqlx_migrations` records
/// applied versions).
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Test helper used by integration tests: connect via HARMAN_DATABASE_URL
/// and ensure migrations are applied.
pub async fn testkit_db_pool() -> Result<PgPool> {
    let pool = connect_from_env().await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (exists,): (bool,) = sqlx::query_as(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='orders'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok: one == 1,
        has_orders_table: exists,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_orders_table: bool,
}

/// Detect a Postgres unique violation by constraint name.
pub(crate) fn is_unique_constraint_violation(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.constraint() == Some(constraint),
        _ => false,
    }
}

//! Startup recovery.
//!
//! A worker killed between claiming a queue row and committing its
//! completion leaves `processing = TRUE` behind. Clearing claims older
//! than the horizon re-exposes those rows; the adapter's idempotency keys
//! make the re-dispatch produce the original effect exactly once (S6).

use anyhow::Result;
use sqlx::PgPool;
use tracing::info;

pub async fn startup_recovery(pool: &PgPool, recovery_horizon_secs: i64) -> Result<u64> {
    let recovered = harman_db::recover_stale_processing(pool, recovery_horizon_secs).await?;
    let depth = harman_db::queue_depth(pool).await?;
    info!(recovered, queue_depth = depth, "startup recovery complete");
    Ok(recovered)
}

//! Graceful shutdown: drive every open session to a safe state, then let
//! the sweeper drain the cancel intents it just enqueued.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use harman_exchange::ExchangeAdapter;
use harman_oms::CancelReason;
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::sweeper::Sweeper;
use crate::RuntimeConfig;

/// Mass-cancel every open session with reason `shutdown`, then run a
/// bounded drain so the cancels actually reach the exchange before the
/// process exits. Anything still queued afterwards is recovered on the
/// next startup — nothing is lost, only delayed.
pub async fn graceful_shutdown(
    pool: &PgPool,
    adapter: Arc<dyn ExchangeAdapter>,
    config: &RuntimeConfig,
    drain_timeout: Duration,
) -> Result<()> {
    for session_id in harman_db::open_session_ids(pool).await? {
        let outcome =
            harman_db::mass_cancel_session(pool, session_id, CancelReason::Shutdown).await?;
        info!(
            session_id,
            cancels = outcome.cancels_enqueued,
            staged = outcome.staged_cancelled,
            "shutdown mass cancel"
        );
    }

    // A short-lived sweeper drains the queue; the watch channel ends it.
    let (stop_tx, stop_rx) = watch::channel(false);
    let sweeper = Sweeper::new(pool.clone(), adapter, config.clone());

    let drain = async {
        loop {
            match harman_db::queue_depth(pool).await {
                Ok(0) => break,
                Ok(_) => tokio::time::sleep(Duration::from_millis(100)).await,
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "queue depth check failed during drain");
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = sweeper.run(stop_rx.clone()) => {}
        _ = async { drain.await } => {}
        _ = tokio::time::sleep(drain_timeout) => {
            warn!("drain timeout; remaining intents recover on next start");
        }
    }
    let _ = stop_tx.send(true);

    info!("graceful shutdown complete");
    Ok(())
}

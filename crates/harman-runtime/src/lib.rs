//! The moving parts: sweeper worker pool, startup recovery, reconciliation
//! loop, graceful shutdown.
//!
//! The runtime owns no state of its own. Everything durable lives in the
//! store; everything upstream goes through the adapter trait. Worker count
//! is a deployment knob, never a correctness parameter.

use std::sync::Arc;

use harman_exchange::ExchangeAdapter;
use sqlx::PgPool;
use tokio::sync::watch;

pub mod reconciler;
pub mod recovery;
pub mod shutdown;
pub mod sweeper;

pub use reconciler::{reconcile_once, ReconcileError, ReconcileSummary};
pub use recovery::startup_recovery;
pub use shutdown::graceful_shutdown;
pub use sweeper::Sweeper;

/// Tunables, all in plain units; defaults match the config crate.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub worker_count: usize,
    pub poll_interval_ms: u64,
    /// Claims older than this are recovered at startup and on each tick.
    pub recovery_horizon_secs: i64,
    pub reconcile_interval_secs: u64,
    /// How long a dispatch-state order may be missing from the exchange
    /// before reconciliation synthesizes its cancel.
    pub reconcile_grace_secs: i64,
    /// IOC orders older than this in a live state are expired.
    pub ioc_grace_secs: i64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            poll_interval_ms: 500,
            recovery_horizon_secs: 300,
            reconcile_interval_secs: 5,
            reconcile_grace_secs: 60,
            ioc_grace_secs: 30,
        }
    }
}

/// Wires the sweeper and the reconcile loop over one pool + adapter.
pub struct Runtime {
    pub pool: PgPool,
    pub adapter: Arc<dyn ExchangeAdapter>,
    pub config: RuntimeConfig,
}

impl Runtime {
    pub fn new(pool: PgPool, adapter: Arc<dyn ExchangeAdapter>, config: RuntimeConfig) -> Self {
        Self {
            pool,
            adapter,
            config,
        }
    }

    /// Recover stale claims, then run workers and the reconcile loop until
    /// `shutdown` flips true.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        startup_recovery(&self.pool, self.config.recovery_horizon_secs).await?;

        let sweeper = Sweeper::new(
            self.pool.clone(),
            Arc::clone(&self.adapter),
            self.config.clone(),
        );
        let sweep = sweeper.run(shutdown.clone());
        let reconcile = reconciler::run_loop(
            self.pool.clone(),
            Arc::clone(&self.adapter),
            self.config.clone(),
            shutdown,
        );

        tokio::try_join!(sweep, reconcile)?;
        Ok(())
    }
}

//! Reconciliation loop driver.
//!
//! Each pass fetches the exchange view (a suspension point, outside any
//! transaction), diffs it against local open orders via the pure planner,
//! and applies each healing action in its own short transaction through
//! the ordinary state-machine path. Running a pass twice with no
//! intervening activity changes nothing (P10): planning is deterministic
//! and every application is guarded (orphans dedupe, fills dedupe by
//! trade_id, terminal applies are refused once the order is terminal).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use harman_db::OpError;
use harman_exchange::{ExchangeAdapter, ExchangeError};
use harman_oms::OrderEvent;
use harman_reconcile::{LocalOpenOrder, ReconcileAction, RemoteOrder};
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::RuntimeConfig;

#[derive(Debug, Clone, Default)]
pub struct ReconcileSummary {
    pub actions_applied: usize,
    pub orphans_recorded: usize,
    pub fills_healed: usize,
}

/// Why a reconcile pass failed. The split matters: an unreachable exchange
/// is retried on the next tick (and surfaces as `upstream_unavailable` on
/// the operator route), while a store failure must take the process down.
#[derive(Debug)]
pub enum ReconcileError {
    /// The exchange could not be queried.
    Upstream(ExchangeError),
    /// The store refused or lost a transaction.
    Store(anyhow::Error),
}

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileError::Upstream(e) => write!(f, "exchange unreachable: {e}"),
            ReconcileError::Store(e) => write!(f, "store failure: {e:#}"),
        }
    }
}

impl std::error::Error for ReconcileError {}

/// Periodic loop over every open session.
pub async fn run_loop(
    pool: PgPool,
    adapter: Arc<dyn ExchangeAdapter>,
    config: RuntimeConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let interval = Duration::from_secs(config.reconcile_interval_secs);

    loop {
        if *shutdown.borrow() {
            info!("reconciler stopped");
            return Ok(());
        }

        let session_ids = harman_db::open_session_ids(&pool)
            .await
            .context("store unavailable listing sessions")?;
        for session_id in session_ids {
            match reconcile_once(&pool, adapter.as_ref(), session_id, &config).await {
                Ok(summary) if summary.actions_applied > 0 => {
                    info!(
                        session_id,
                        actions = summary.actions_applied,
                        orphans = summary.orphans_recorded,
                        fills = summary.fills_healed,
                        "reconcile pass healed divergence"
                    );
                }
                Ok(_) => {}
                // Transient exchange loss is expected; the next tick retries.
                Err(ReconcileError::Upstream(e)) => {
                    warn!(session_id, error = %e, "exchange unreachable; reconcile retried next tick");
                }
                // A dead store is not survivable: bubble it up so the
                // process exits nonzero.
                Err(ReconcileError::Store(e)) => {
                    return Err(e.context("store unavailable during reconcile"));
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {}
        }
    }
}

/// One reconciliation pass for one session (also the operator's
/// "reconcile now").
pub async fn reconcile_once(
    pool: &PgPool,
    adapter: &dyn ExchangeAdapter,
    session_id: i64,
    config: &RuntimeConfig,
) -> Result<ReconcileSummary, ReconcileError> {
    // Suspension point: the exchange fetch happens before any transaction.
    let remote: Vec<RemoteOrder> = adapter
        .fetch_open_orders()
        .await
        .map_err(ReconcileError::Upstream)?;

    let local: Vec<LocalOpenOrder> = harman_db::list_open_orders(pool, session_id)
        .await
        .map_err(ReconcileError::Store)?
        .into_iter()
        .map(|o| LocalOpenOrder {
            order_id: o.id,
            client_order_id: o.client_order_id,
            exchange_order_id: o.exchange_order_id,
            state: o.state,
            quantity: o.quantity,
            filled_quantity: o.filled_quantity,
            price_cents: o.price_cents,
            updated_at: o.updated_at,
        })
        .collect();

    let plan = harman_reconcile::plan(
        &local,
        &remote,
        chrono::Utc::now(),
        chrono::Duration::seconds(config.reconcile_grace_secs),
    );

    let mut summary = ReconcileSummary::default();
    for action in &plan.actions {
        apply_action(pool, adapter, action, &mut summary).await?;
    }

    // IOC orders the exchange should have resolved long ago.
    let expired = harman_db::expire_stale_ioc(pool, config.ioc_grace_secs)
        .await
        .map_err(ReconcileError::Store)?;
    summary.actions_applied += expired.len();

    Ok(summary)
}

async fn apply_action(
    pool: &PgPool,
    adapter: &dyn ExchangeAdapter,
    action: &ReconcileAction,
    summary: &mut ReconcileSummary,
) -> Result<(), ReconcileError> {
    match action {
        ReconcileAction::SynthesizeCancel { order_id } => {
            apply_synthetic(
                pool,
                *order_id,
                &OrderEvent::ExchangeTerminal {
                    state: harman_oms::TerminalState::Cancelled,
                },
            )
            .await
            .map_err(ReconcileError::Store)?;
            summary.actions_applied += 1;
        }

        ReconcileAction::RecordOrphan { exchange_order_id } => {
            if harman_db::record_orphan_once(pool, exchange_order_id)
                .await
                .map_err(ReconcileError::Store)?
            {
                warn!(%exchange_order_id, "orphaned exchange order recorded");
                summary.orphans_recorded += 1;
                summary.actions_applied += 1;
            }
        }

        ReconcileAction::HealFills {
            order_id,
            exchange_order_id,
            local_filled,
            remote_filled,
        } => {
            // Suspension point again: fetch the authoritative fill list,
            // then append under the order lock.
            let fills = adapter
                .fetch_fills(exchange_order_id)
                .await
                .map_err(ReconcileError::Upstream)?;
            let outcomes = harman_db::apply_fills(pool, *order_id, &fills, "reconciler")
                .await
                .map_err(ReconcileError::Store)?;
            if !outcomes.is_empty() {
                debug!(
                    order_id = *order_id,
                    local_filled = *local_filled,
                    remote_filled = *remote_filled,
                    healed = outcomes.len(),
                    "fills healed"
                );
                summary.fills_healed += outcomes.len();
                summary.actions_applied += 1;
            }
        }

        ReconcileAction::ApplyTerminal { order_id, terminal } => {
            apply_synthetic(
                pool,
                *order_id,
                &OrderEvent::ExchangeTerminal { state: *terminal },
            )
            .await
            .map_err(ReconcileError::Store)?;
            summary.actions_applied += 1;
        }

        ReconcileAction::WarnDivergence {
            order_id,
            field,
            local,
            remote,
        } => {
            if harman_db::record_divergence_warning(pool, *order_id, field, *local, *remote)
                .await
                .map_err(ReconcileError::Store)?
            {
                warn!(
                    order_id = *order_id,
                    field = *field,
                    local = *local,
                    remote = *remote,
                    "reconcile divergence (not healed)"
                );
                summary.actions_applied += 1;
            }
        }
    }
    Ok(())
}

/// Apply a synthesized event; losing the race to a concurrent transition
/// is fine (the refusal is audited and the next pass sees fresh state).
async fn apply_synthetic(pool: &PgPool, order_id: i64, event: &OrderEvent) -> Result<()> {
    match harman_db::apply_event(pool, order_id, event, "reconciler").await {
        Ok(_) => Ok(()),
        Err(OpError::Illegal(e)) => {
            debug!(order_id, %e, "synthetic event raced a transition");
            Ok(())
        }
        Err(OpError::Database(e)) => Err(e),
        Err(other) => Err(anyhow::anyhow!("synthetic event failed: {other}")),
    }
}

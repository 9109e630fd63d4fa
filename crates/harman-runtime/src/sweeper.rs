//! Outbox sweeper worker pool.
//!
//! Each worker loops: claim one intent (short transaction) → call the
//! adapter (no transaction held) → apply the response atomically. Workers
//! idle on a poll timer and additionally wake on the queue's `NOTIFY`
//! channel; the notification is latency sugar, polling alone is correct.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::future::join_all;
use harman_db::QueueItem;
use harman_exchange::{ExchangeAdapter, ExchangeError, SubmitOrder};
use harman_oms::{CancelReason, OrderEvent, OrderState, QueueAction, TerminalState};
use harman_reconcile::RemoteStatus;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

use crate::RuntimeConfig;

pub struct Sweeper {
    pool: PgPool,
    adapter: Arc<dyn ExchangeAdapter>,
    config: RuntimeConfig,
    wakeup: Arc<Notify>,
}

impl Sweeper {
    pub fn new(pool: PgPool, adapter: Arc<dyn ExchangeAdapter>, config: RuntimeConfig) -> Self {
        Self {
            pool,
            adapter,
            config,
            wakeup: Arc::new(Notify::new()),
        }
    }

    /// Run the worker pool until shutdown. Individual intent failures are
    /// logged and retried; only pool-level database loss ends the run.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = self.spawn_queue_listener();

        let mut workers = Vec::with_capacity(self.config.worker_count);
        for worker_id in 0..self.config.worker_count {
            workers.push(self.worker_loop(worker_id, shutdown.clone()));
        }
        join_all(workers).await;

        listener.abort();
        info!("sweeper stopped");
        Ok(())
    }

    /// Claim and process at most one intent. Returns whether anything was
    /// claimed. The worker loops are built from this; tests and tools
    /// drive it directly.
    pub async fn tick_once(&self, worker: &str) -> Result<bool> {
        match harman_db::dequeue_queue_item(&self.pool, worker).await? {
            Some(item) => {
                self.process_item(worker, item).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Forward `NOTIFY harman_order_queue` into worker wakeups. A lost
    /// connection only degrades latency back to the poll interval.
    fn spawn_queue_listener(&self) -> tokio::task::JoinHandle<()> {
        let pool = self.pool.clone();
        let wakeup = Arc::clone(&self.wakeup);
        tokio::spawn(async move {
            loop {
                match PgListener::connect_with(&pool).await {
                    Ok(mut listener) => {
                        if listener.listen("harman_order_queue").await.is_err() {
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            continue;
                        }
                        loop {
                            match listener.recv().await {
                                Ok(_) => wakeup.notify_waiters(),
                                Err(e) => {
                                    warn!(%e, "queue listener dropped; reconnecting");
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        warn!(%e, "queue listener connect failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        })
    }

    async fn worker_loop(&self, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        let worker = format!("worker-{worker_id}");
        let poll = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            if *shutdown.borrow() {
                return;
            }

            match harman_db::dequeue_queue_item(&self.pool, &worker).await {
                Ok(Some(item)) => {
                    if let Err(e) = self.process_item(&worker, item).await {
                        error!(worker = %worker, error = %format!("{e:#}"), "intent processing failed");
                    }
                    // Drain eagerly while work remains.
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(worker = %worker, error = %format!("{e:#}"), "dequeue failed");
                }
            }

            tokio::select! {
                _ = self.wakeup.notified() => {}
                _ = tokio::time::sleep(poll) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// Deliver one claimed intent. The adapter call happens here, outside
    /// any transaction; the response is applied in one transaction by
    /// `complete_queue_item`. Retriable adapter failures release the claim.
    async fn process_item(&self, worker: &str, item: QueueItem) -> Result<()> {
        match item.action {
            QueueAction::Submit => self.process_submit(worker, item).await,
            QueueAction::Cancel => self.process_cancel(worker, item).await,
            QueueAction::Amend => self.process_amend(worker, item).await,
            QueueAction::Decrease => self.process_decrease(worker, item).await,
        }
    }

    async fn process_submit(&self, worker: &str, item: QueueItem) -> Result<()> {
        let order = &item.order;

        // The order was cancelled (or finished) before its submit went out:
        // drop the intent unsent.
        if order.state != OrderState::Submitted {
            debug!(order_id = order.id, state = %order.state, "dropping stale submit intent");
            harman_db::complete_queue_item(&self.pool, item.queue_id, order.id, worker, None, &[])
                .await?;
            return Ok(());
        }

        let request = SubmitOrder {
            client_order_id: order.client_order_id,
            ticker: order.ticker.clone(),
            side: order.side,
            action: order.action,
            quantity: order.quantity,
            price_cents: order.price_cents,
            time_in_force: order.time_in_force,
        };

        match self.adapter.submit(&request).await {
            Ok(ack) => {
                harman_db::complete_queue_item(
                    &self.pool,
                    item.queue_id,
                    order.id,
                    worker,
                    Some(OrderEvent::Ack {
                        exchange_order_id: ack.exchange_order_id,
                    }),
                    &ack.initial_fills,
                )
                .await?;
            }
            Err(e) if e.is_retriable() => {
                debug!(order_id = order.id, error = %e, "submit retriable; releasing");
                harman_db::release_queue_item(&self.pool, item.queue_id).await?;
            }
            Err(e) => {
                warn!(order_id = order.id, error = %e, "submit rejected");
                harman_db::complete_queue_item(
                    &self.pool,
                    item.queue_id,
                    order.id,
                    worker,
                    Some(OrderEvent::Reject {
                        reason: e.to_string(),
                    }),
                    &[],
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn process_cancel(&self, worker: &str, item: QueueItem) -> Result<()> {
        let order = &item.order;
        let reason = cancel_reason_from_metadata(item.metadata.as_ref());

        // Never reached the exchange: confirm locally.
        let Some(exchange_order_id) = order.exchange_order_id.clone() else {
            harman_db::complete_queue_item(
                &self.pool,
                item.queue_id,
                order.id,
                worker,
                Some(OrderEvent::CancelConfirmed { reason }),
                &[],
            )
            .await?;
            return Ok(());
        };

        match self.adapter.cancel(&exchange_order_id).await {
            Ok(ack) if ack.accepted => {
                harman_db::complete_queue_item(
                    &self.pool,
                    item.queue_id,
                    order.id,
                    worker,
                    Some(OrderEvent::CancelConfirmed { reason }),
                    &[],
                )
                .await?;
            }
            Ok(ack) => {
                // The exchange already closed the order; apply its verdict
                // (a filled verdict supersedes the cancel, S5).
                let event = ack
                    .terminal_state_if_known
                    .map(|status| OrderEvent::ExchangeTerminal {
                        state: remote_terminal(status),
                    });
                harman_db::complete_queue_item(
                    &self.pool,
                    item.queue_id,
                    order.id,
                    worker,
                    event,
                    &[],
                )
                .await?;
            }
            Err(ExchangeError::NotFound { .. }) => {
                // Nothing to cancel upstream; the intent has its effect.
                harman_db::complete_queue_item(
                    &self.pool,
                    item.queue_id,
                    order.id,
                    worker,
                    Some(OrderEvent::CancelConfirmed { reason }),
                    &[],
                )
                .await?;
            }
            Err(e) if e.is_retriable() => {
                harman_db::release_queue_item(&self.pool, item.queue_id).await?;
            }
            Err(e) => {
                warn!(order_id = order.id, error = %e, "cancel failed permanently");
                harman_db::complete_queue_item(&self.pool, item.queue_id, order.id, worker, None, &[])
                    .await?;
            }
        }
        Ok(())
    }

    async fn process_amend(&self, worker: &str, item: QueueItem) -> Result<()> {
        let order = &item.order;
        let (new_price_cents, new_quantity) = match amend_metadata(item.metadata.as_ref()) {
            Some(values) => values,
            None => {
                warn!(order_id = order.id, "amend intent without metadata; reverting");
                harman_db::fail_queue_item(
                    &self.pool,
                    item.queue_id,
                    order.id,
                    worker,
                    OrderEvent::AmendRejected,
                )
                .await?;
                return Ok(());
            }
        };

        let Some(exchange_order_id) = order.exchange_order_id.clone() else {
            harman_db::fail_queue_item(
                &self.pool,
                item.queue_id,
                order.id,
                worker,
                OrderEvent::AmendRejected,
            )
            .await?;
            return Ok(());
        };

        match self
            .adapter
            .amend(&exchange_order_id, new_price_cents, new_quantity)
            .await
        {
            Ok(ack) => {
                harman_db::complete_queue_item(
                    &self.pool,
                    item.queue_id,
                    order.id,
                    worker,
                    Some(OrderEvent::AmendConfirmed {
                        new_price_cents: ack.new_price_cents,
                        new_quantity: ack.new_quantity,
                    }),
                    &[],
                )
                .await?;
            }
            Err(e) if e.is_retriable() => {
                harman_db::release_queue_item(&self.pool, item.queue_id).await?;
            }
            Err(e) => {
                warn!(order_id = order.id, error = %e, "amend rejected");
                harman_db::fail_queue_item(
                    &self.pool,
                    item.queue_id,
                    order.id,
                    worker,
                    OrderEvent::AmendRejected,
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn process_decrease(&self, worker: &str, item: QueueItem) -> Result<()> {
        let order = &item.order;
        let reduce_by = match decrease_metadata(item.metadata.as_ref()) {
            Some(v) => v,
            None => {
                warn!(order_id = order.id, "decrease intent without metadata; reverting");
                harman_db::fail_queue_item(
                    &self.pool,
                    item.queue_id,
                    order.id,
                    worker,
                    OrderEvent::DecreaseRejected,
                )
                .await?;
                return Ok(());
            }
        };

        let Some(exchange_order_id) = order.exchange_order_id.clone() else {
            harman_db::fail_queue_item(
                &self.pool,
                item.queue_id,
                order.id,
                worker,
                OrderEvent::DecreaseRejected,
            )
            .await?;
            return Ok(());
        };

        // Decrease is delivered through amend: price unchanged, reduced qty.
        let new_quantity = order.quantity - reduce_by;
        match self
            .adapter
            .amend(&exchange_order_id, order.price_cents, new_quantity)
            .await
        {
            Ok(_) => {
                harman_db::complete_queue_item(
                    &self.pool,
                    item.queue_id,
                    order.id,
                    worker,
                    Some(OrderEvent::DecreaseConfirmed { reduce_by }),
                    &[],
                )
                .await?;
            }
            Err(e) if e.is_retriable() => {
                harman_db::release_queue_item(&self.pool, item.queue_id).await?;
            }
            Err(e) => {
                warn!(order_id = order.id, error = %e, "decrease rejected");
                harman_db::fail_queue_item(
                    &self.pool,
                    item.queue_id,
                    order.id,
                    worker,
                    OrderEvent::DecreaseRejected,
                )
                .await?;
            }
        }
        Ok(())
    }
}

fn cancel_reason_from_metadata(metadata: Option<&serde_json::Value>) -> CancelReason {
    metadata
        .and_then(|m| m.get("reason"))
        .and_then(|r| r.as_str())
        .and_then(|s| CancelReason::parse(s).ok())
        .unwrap_or(CancelReason::UserRequested)
}

fn amend_metadata(metadata: Option<&serde_json::Value>) -> Option<(i32, i32)> {
    let m = metadata?;
    let price = m.get("new_price_cents")?.as_i64()?;
    let qty = m.get("new_quantity")?.as_i64()?;
    Some((i32::try_from(price).ok()?, i32::try_from(qty).ok()?))
}

fn decrease_metadata(metadata: Option<&serde_json::Value>) -> Option<i32> {
    metadata?
        .get("reduce_by")?
        .as_i64()
        .and_then(|v| i32::try_from(v).ok())
}

fn remote_terminal(status: RemoteStatus) -> TerminalState {
    match status {
        RemoteStatus::Filled => TerminalState::Filled,
        RemoteStatus::Cancelled | RemoteStatus::Open => TerminalState::Cancelled,
        RemoteStatus::Rejected => TerminalState::Rejected,
        RemoteStatus::Expired => TerminalState::Expired,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn metadata_parsers() {
        assert_eq!(
            cancel_reason_from_metadata(Some(&json!({ "reason": "shutdown" }))),
            CancelReason::Shutdown
        );
        assert_eq!(cancel_reason_from_metadata(None), CancelReason::UserRequested);
        assert_eq!(
            amend_metadata(Some(&json!({ "new_price_cents": 55, "new_quantity": 8 }))),
            Some((55, 8))
        );
        assert_eq!(amend_metadata(Some(&json!({}))), None);
        assert_eq!(decrease_metadata(Some(&json!({ "reduce_by": 3 }))), Some(3));
    }
}

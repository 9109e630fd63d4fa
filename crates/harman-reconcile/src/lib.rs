//! Reconciliation planner.
//!
//! Periodically the runtime fetches the exchange's view of the session and
//! the store's non-terminal orders, then asks this module what diverged.
//! The plan only ever contains events the state machine already knows how
//! to apply; reconciliation never invents orders and never mutates price or
//! quantity (divergence there is surfaced as a warning).
//!
//! Planning is deterministic: identical snapshots produce identical plans,
//! and the db-side application of every action is idempotent, so running
//! the loop twice with no intervening activity changes nothing (property
//! P10 in the scenario suite).

use chrono::{DateTime, Duration, Utc};
use harman_oms::{OrderState, TerminalState};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// A non-terminal order as stored locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalOpenOrder {
    pub order_id: i64,
    pub client_order_id: Uuid,
    pub exchange_order_id: Option<String>,
    pub state: OrderState,
    pub quantity: i32,
    pub filled_quantity: i32,
    pub price_cents: i32,
    pub updated_at: DateTime<Utc>,
}

/// Exchange-side order status. `Open` means the exchange still lists the
/// order; the terminal variants appear when the adapter's view includes
/// recently closed orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    Open,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl RemoteStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RemoteStatus::Open)
    }

    fn as_terminal(&self) -> Option<TerminalState> {
        match self {
            RemoteStatus::Open => None,
            RemoteStatus::Filled => Some(TerminalState::Filled),
            RemoteStatus::Cancelled => Some(TerminalState::Cancelled),
            RemoteStatus::Rejected => Some(TerminalState::Rejected),
            RemoteStatus::Expired => Some(TerminalState::Expired),
        }
    }
}

/// One order in the exchange's view of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOrder {
    pub exchange_order_id: String,
    pub client_order_id: Option<Uuid>,
    pub status: RemoteStatus,
    pub quantity: i32,
    pub filled_quantity: i32,
    pub price_cents: i32,
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// One divergence-healing step. Applied by the runtime, each in its own
/// short transaction, through the ordinary state-machine path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Local order is gone from the exchange and stuck in a dispatch state
    /// past the grace window: synthesize `cancelled` / `exchange_cancel`.
    SynthesizeCancel { order_id: i64 },
    /// The exchange reports an order the store never admitted. Recorded
    /// once per `exchange_order_id`; local orders are never fabricated.
    RecordOrphan { exchange_order_id: String },
    /// The exchange has seen more fills than the store: fetch the order's
    /// fills and append the missing ones (deduped by `trade_id`).
    HealFills {
        order_id: i64,
        exchange_order_id: String,
        local_filled: i32,
        remote_filled: i32,
    },
    /// The exchange closed the order but the store still has it open.
    ApplyTerminal {
        order_id: i64,
        terminal: TerminalState,
    },
    /// Price/quantity drift: surfaced, never healed automatically.
    WarnDivergence {
        order_id: i64,
        field: &'static str,
        local: i64,
        remote: i64,
    },
}

impl ReconcileAction {
    fn sort_key(&self) -> (i64, u8) {
        match self {
            ReconcileAction::HealFills { order_id, .. } => (*order_id, 0),
            ReconcileAction::ApplyTerminal { order_id, .. } => (*order_id, 1),
            ReconcileAction::SynthesizeCancel { order_id } => (*order_id, 2),
            ReconcileAction::WarnDivergence { order_id, .. } => (*order_id, 3),
            ReconcileAction::RecordOrphan { .. } => (i64::MAX, 4),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub actions: Vec<ReconcileAction>,
}

impl ReconcilePlan {
    pub fn is_clean(&self) -> bool {
        self.actions.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

/// Dispatch-side states that may legitimately have no exchange counterpart
/// for a while; past the grace window their absence means the exchange
/// never saw (or already dropped) the order.
fn eligible_for_synth_cancel(state: OrderState) -> bool {
    matches!(
        state,
        OrderState::Pending | OrderState::Submitted | OrderState::PendingCancel
    )
}

/// Diff local vs exchange state and produce the healing plan.
pub fn plan(
    local: &[LocalOpenOrder],
    remote: &[RemoteOrder],
    now: DateTime<Utc>,
    grace: Duration,
) -> ReconcilePlan {
    let mut actions = Vec::new();

    // Remote orders indexed both ways: the exchange id is authoritative,
    // the client id covers orders whose ack we lost.
    let by_exchange_id: std::collections::HashMap<&str, &RemoteOrder> = remote
        .iter()
        .map(|r| (r.exchange_order_id.as_str(), r))
        .collect();
    let by_client_id: std::collections::HashMap<Uuid, &RemoteOrder> = remote
        .iter()
        .filter_map(|r| r.client_order_id.map(|c| (c, r)))
        .collect();

    let mut matched_remote: std::collections::HashSet<&str> = std::collections::HashSet::new();

    for l in local {
        let remote_match = l
            .exchange_order_id
            .as_deref()
            .and_then(|eid| by_exchange_id.get(eid).copied())
            .or_else(|| by_client_id.get(&l.client_order_id).copied());

        match remote_match {
            None => {
                // §4.4 step 3: only dispatch-side states are healed by a
                // synthesized cancel, and only after the grace window.
                if eligible_for_synth_cancel(l.state)
                    && now.signed_duration_since(l.updated_at) > grace
                {
                    actions.push(ReconcileAction::SynthesizeCancel {
                        order_id: l.order_id,
                    });
                }
            }
            Some(r) => {
                matched_remote.insert(r.exchange_order_id.as_str());

                // Step 5: heal missed fills before anything else.
                if r.filled_quantity > l.filled_quantity {
                    actions.push(ReconcileAction::HealFills {
                        order_id: l.order_id,
                        exchange_order_id: r.exchange_order_id.clone(),
                        local_filled: l.filled_quantity,
                        remote_filled: r.filled_quantity,
                    });
                } else if r.filled_quantity < l.filled_quantity {
                    // The store can never un-fill; this is a fault upstream.
                    actions.push(ReconcileAction::WarnDivergence {
                        order_id: l.order_id,
                        field: "filled_quantity",
                        local: i64::from(l.filled_quantity),
                        remote: i64::from(r.filled_quantity),
                    });
                }

                // Step 6: exchange terminal, local still open.
                if let Some(terminal) = r.status.as_terminal() {
                    // A full remote fill is already covered by HealFills;
                    // only force the terminal when fills alone won't get
                    // there (cancel/reject/expire, or fill count already
                    // equal).
                    let heals_to_filled = terminal == TerminalState::Filled
                        && r.filled_quantity >= r.quantity
                        && r.filled_quantity > l.filled_quantity;
                    if !heals_to_filled {
                        actions.push(ReconcileAction::ApplyTerminal {
                            order_id: l.order_id,
                            terminal,
                        });
                    }
                }

                // Reconciliation never mutates price/quantity (amend healing
                // is out of scope); drift is warned about only.
                if r.price_cents != l.price_cents {
                    actions.push(ReconcileAction::WarnDivergence {
                        order_id: l.order_id,
                        field: "price_cents",
                        local: i64::from(l.price_cents),
                        remote: i64::from(r.price_cents),
                    });
                }
                if r.quantity != l.quantity {
                    actions.push(ReconcileAction::WarnDivergence {
                        order_id: l.order_id,
                        field: "quantity",
                        local: i64::from(l.quantity),
                        remote: i64::from(r.quantity),
                    });
                }
            }
        }
    }

    // Step 4: remote-only orders become orphan audit entries, nothing more.
    for r in remote {
        if !matched_remote.contains(r.exchange_order_id.as_str()) {
            actions.push(ReconcileAction::RecordOrphan {
                exchange_order_id: r.exchange_order_id.clone(),
            });
        }
    }

    actions.sort_by_key(|a| a.sort_key());
    ReconcilePlan { actions }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn local(
        order_id: i64,
        state: OrderState,
        exchange_order_id: Option<&str>,
        filled: i32,
        age_secs: i64,
        now: DateTime<Utc>,
    ) -> LocalOpenOrder {
        LocalOpenOrder {
            order_id,
            client_order_id: Uuid::from_u128(order_id as u128),
            exchange_order_id: exchange_order_id.map(str::to_string),
            state,
            quantity: 10,
            filled_quantity: filled,
            price_cents: 45,
            updated_at: now - Duration::seconds(age_secs),
        }
    }

    fn remote(eid: &str, status: RemoteStatus, filled: i32) -> RemoteOrder {
        RemoteOrder {
            exchange_order_id: eid.to_string(),
            client_order_id: None,
            status,
            quantity: 10,
            filled_quantity: filled,
            price_cents: 45,
        }
    }

    fn grace() -> Duration {
        Duration::seconds(60)
    }

    #[test]
    fn clean_when_views_agree() {
        let now = Utc::now();
        let l = vec![local(1, OrderState::Acknowledged, Some("EX-1"), 0, 5, now)];
        let r = vec![remote("EX-1", RemoteStatus::Open, 0)];
        assert!(plan(&l, &r, now, grace()).is_clean());
    }

    #[test]
    fn stuck_pending_past_grace_gets_synthesized_cancel() {
        let now = Utc::now();
        let l = vec![
            local(1, OrderState::Pending, None, 0, 300, now),
            // Within grace: left alone.
            local(2, OrderState::Pending, None, 0, 10, now),
            // Acknowledged orders are never synthesized away.
            local(3, OrderState::Acknowledged, Some("EX-3"), 0, 300, now),
        ];
        let p = plan(&l, &[], now, grace());
        assert_eq!(
            p.actions,
            vec![ReconcileAction::SynthesizeCancel { order_id: 1 }]
        );
    }

    #[test]
    fn pending_cancel_missing_remotely_is_synthesized_after_grace() {
        let now = Utc::now();
        let l = vec![local(4, OrderState::PendingCancel, Some("EX-4"), 0, 120, now)];
        let p = plan(&l, &[], now, grace());
        assert_eq!(
            p.actions,
            vec![ReconcileAction::SynthesizeCancel { order_id: 4 }]
        );
    }

    #[test]
    fn remote_only_order_is_recorded_as_orphan() {
        let now = Utc::now();
        let r = vec![remote("EX-STRANGER", RemoteStatus::Open, 0)];
        let p = plan(&[], &r, now, grace());
        assert_eq!(
            p.actions,
            vec![ReconcileAction::RecordOrphan {
                exchange_order_id: "EX-STRANGER".to_string(),
            }]
        );
    }

    #[test]
    fn fill_gap_heals_before_terminal_applies() {
        let now = Utc::now();
        let l = vec![local(1, OrderState::Acknowledged, Some("EX-1"), 2, 5, now)];
        // Remote saw 6 of 10 filled then the order cancelled.
        let mut r = remote("EX-1", RemoteStatus::Cancelled, 6);
        r.client_order_id = Some(Uuid::from_u128(1));
        let p = plan(&l, &[r], now, grace());
        assert_eq!(
            p.actions,
            vec![
                ReconcileAction::HealFills {
                    order_id: 1,
                    exchange_order_id: "EX-1".to_string(),
                    local_filled: 2,
                    remote_filled: 6,
                },
                ReconcileAction::ApplyTerminal {
                    order_id: 1,
                    terminal: TerminalState::Cancelled,
                },
            ]
        );
    }

    #[test]
    fn full_remote_fill_is_healed_through_fills_not_forced() {
        let now = Utc::now();
        let l = vec![local(1, OrderState::PartiallyFilled, Some("EX-1"), 4, 5, now)];
        let r = vec![remote("EX-1", RemoteStatus::Filled, 10)];
        let p = plan(&l, &r, now, grace());
        assert_eq!(
            p.actions,
            vec![ReconcileAction::HealFills {
                order_id: 1,
                exchange_order_id: "EX-1".to_string(),
                local_filled: 4,
                remote_filled: 10,
            }],
            "appending the missing fills already drives the machine to filled"
        );
    }

    #[test]
    fn matches_by_client_order_id_when_ack_was_lost() {
        let now = Utc::now();
        // Local never learned the exchange id (missed ACK).
        let l = vec![local(1, OrderState::Submitted, None, 0, 300, now)];
        let mut r = remote("EX-9", RemoteStatus::Open, 0);
        r.client_order_id = Some(Uuid::from_u128(1));
        let p = plan(&l, &[r], now, grace());
        // Matched: no synthesized cancel, no orphan.
        assert!(p.is_clean(), "{:?}", p.actions);
    }

    #[test]
    fn price_and_quantity_drift_only_warns() {
        let now = Utc::now();
        let l = vec![local(1, OrderState::Acknowledged, Some("EX-1"), 0, 5, now)];
        let mut r = remote("EX-1", RemoteStatus::Open, 0);
        r.price_cents = 55;
        r.quantity = 12;
        let p = plan(&l, &[r], now, grace());
        assert_eq!(
            p.actions,
            vec![
                ReconcileAction::WarnDivergence {
                    order_id: 1,
                    field: "price_cents",
                    local: 45,
                    remote: 55,
                },
                ReconcileAction::WarnDivergence {
                    order_id: 1,
                    field: "quantity",
                    local: 10,
                    remote: 12,
                },
            ]
        );
    }

    #[test]
    fn planning_is_idempotent_on_identical_snapshots() {
        let now = Utc::now();
        let l = vec![
            local(1, OrderState::Pending, None, 0, 300, now),
            local(2, OrderState::Acknowledged, Some("EX-2"), 1, 5, now),
        ];
        let r = vec![remote("EX-2", RemoteStatus::Open, 3)];
        let first = plan(&l, &r, now, grace());
        let second = plan(&l, &r, now, grace());
        assert_eq!(first, second);
    }
}

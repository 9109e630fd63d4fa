//! Order state machine.
//!
//! # Design
//!
//! [`transition`] is a pure function over a locked order snapshot and an
//! event. It returns the full set of column changes to persist ([`Applied`])
//! or a [`TransitionError`] when the event is not legal in the current state.
//! Callers hold the order's row lock while evaluating, so per-order
//! transitions are serialized by the database.
//!
//! Two rules shape the table:
//!
//! 1. **Fills win.** A fill is accepted from any live state, including while
//!    a cancel, amend, or decrease is in flight. A cancel confirmation that
//!    arrives after the order already filled is a no-op (the caller records
//!    nothing against the terminal row).
//! 2. **Terminal states are sticky.** Once `filled`, `cancelled`, `rejected`
//!    or `expired`, no event may mutate state, price, or quantity. Duplicate
//!    fills against a `filled` order are ignored.
//!
//! ```text
//!                     Submit            Ack
//!   (admission) pending ──► submitted ──► acknowledged ──► partially_filled ──► filled
//!        │                      │              │   ▲  │          │    ▲
//!        │ Reject/Fill          │              │   │  └ Amend/DecreaseRequest
//!        │                      │   CancelRequest  └──── confirm/reject restores
//!        ▼                      ▼              ▼
//!    rejected              pending_cancel ──► cancelled        staged ──► pending
//!                               │ (fill wins: → partially_filled/filled)  (Release)
//! ```

use crate::types::{CancelReason, TimeInForce};
use std::fmt;

// ---------------------------------------------------------------------------
// OrderState
// ---------------------------------------------------------------------------

/// All states a persisted order can occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderState {
    /// Accepted by admission; a `submit` queue row exists.
    Pending,
    /// A sweeper dequeued the submit intent; the adapter call is in flight.
    Submitted,
    /// Exchange acknowledged the order and assigned `exchange_order_id`.
    Acknowledged,
    /// One or more fills received; not yet fully filled.
    PartiallyFilled,
    /// Fully filled. **Terminal.**
    Filled,
    /// A cancel intent is enqueued or in flight.
    PendingCancel,
    /// An amend intent is enqueued or in flight.
    PendingAmend,
    /// A decrease intent is enqueued or in flight.
    PendingDecrease,
    /// Cancelled; `cancel_reason` says why. **Terminal.**
    Cancelled,
    /// Rejected by the exchange. **Terminal.**
    Rejected,
    /// IOC order expired with nothing filled. **Terminal.**
    Expired,
    /// Group child waiting for its entry leg to fill; no queue row yet.
    Staged,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Cancelled | OrderState::Rejected | OrderState::Expired
        )
    }

    /// States that count toward open exposure and are the reconciler's scope.
    pub fn is_open(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderState::Pending => "pending",
            OrderState::Submitted => "submitted",
            OrderState::Acknowledged => "acknowledged",
            OrderState::PartiallyFilled => "partially_filled",
            OrderState::Filled => "filled",
            OrderState::PendingCancel => "pending_cancel",
            OrderState::PendingAmend => "pending_amend",
            OrderState::PendingDecrease => "pending_decrease",
            OrderState::Cancelled => "cancelled",
            OrderState::Rejected => "rejected",
            OrderState::Expired => "expired",
            OrderState::Staged => "staged",
        }
    }

    pub fn parse(s: &str) -> Result<Self, crate::types::ParseEnumError> {
        match s {
            "pending" => Ok(OrderState::Pending),
            "submitted" => Ok(OrderState::Submitted),
            "acknowledged" => Ok(OrderState::Acknowledged),
            "partially_filled" => Ok(OrderState::PartiallyFilled),
            "filled" => Ok(OrderState::Filled),
            "pending_cancel" => Ok(OrderState::PendingCancel),
            "pending_amend" => Ok(OrderState::PendingAmend),
            "pending_decrease" => Ok(OrderState::PendingDecrease),
            "cancelled" => Ok(OrderState::Cancelled),
            "rejected" => Ok(OrderState::Rejected),
            "expired" => Ok(OrderState::Expired),
            "staged" => Ok(OrderState::Staged),
            other => Err(crate::types::ParseEnumError {
                kind: "order_state",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Terminal verdicts the reconciler can observe on the exchange side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

/// Events that drive order transitions. Produced by admission, the sweeper,
/// the reconciler, and the group engine; never applied without the row lock.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderEvent {
    /// Sweeper dequeued the submit intent; adapter call about to start.
    Submit,
    /// Exchange acknowledged; carries the assigned exchange order id.
    Ack { exchange_order_id: String },
    /// Exchange rejected the order outright.
    Reject { reason: String },
    /// An execution of `delta_qty` contracts. Whether this is a partial or
    /// the completing fill is decided against the snapshot's quantities.
    Fill { delta_qty: i32 },
    /// Operator or group engine asked for a cancel.
    CancelRequest,
    /// Adapter confirmed the cancel.
    CancelConfirmed { reason: CancelReason },
    /// Operator asked for a price/quantity amend.
    AmendRequest,
    /// Adapter confirmed the amend; new values take effect.
    AmendConfirmed {
        new_price_cents: i32,
        new_quantity: i32,
    },
    /// Adapter rejected the amend; order reverts with unchanged values.
    AmendRejected,
    /// Operator asked to reduce quantity by `reduce_by`.
    DecreaseRequest,
    DecreaseConfirmed { reduce_by: i32 },
    DecreaseRejected,
    /// Group engine releases a staged child after the entry filled.
    Release,
    /// Group engine cancels a staged child directly (no queue row).
    DirectCancel { reason: CancelReason },
    /// Reconciler observed an exchange-side terminal state.
    ExchangeTerminal { state: TerminalState },
    /// IOC grace window elapsed without the order completing.
    IocExpired,
}

impl OrderEvent {
    /// Short event name recorded in the audit log.
    pub fn audit_name(&self) -> &'static str {
        match self {
            OrderEvent::Submit => "submit",
            OrderEvent::Ack { .. } => "ack",
            OrderEvent::Reject { .. } => "reject",
            OrderEvent::Fill { .. } => "fill",
            OrderEvent::CancelRequest => "cancel_request",
            OrderEvent::CancelConfirmed { .. } => "cancel_confirmed",
            OrderEvent::AmendRequest => "amend_request",
            OrderEvent::AmendConfirmed { .. } => "amend_confirmed",
            OrderEvent::AmendRejected => "amend_rejected",
            OrderEvent::DecreaseRequest => "decrease_request",
            OrderEvent::DecreaseConfirmed { .. } => "decrease_confirmed",
            OrderEvent::DecreaseRejected => "decrease_rejected",
            OrderEvent::Release => "release",
            OrderEvent::DirectCancel { .. } => "direct_cancel",
            OrderEvent::ExchangeTerminal { .. } => "exchange_terminal",
            OrderEvent::IocExpired => "ioc_expired",
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshot and result
// ---------------------------------------------------------------------------

/// The locked order columns the machine needs to decide a transition.
#[derive(Debug, Clone)]
pub struct OrderSnapshot {
    pub state: OrderState,
    pub quantity: i32,
    pub filled_quantity: i32,
    pub price_cents: i32,
    pub time_in_force: TimeInForce,
}

/// Column changes produced by a legal transition. `None` fields are left
/// untouched by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub next_state: OrderState,
    pub set_exchange_order_id: Option<String>,
    pub new_filled_quantity: Option<i32>,
    pub cancel_reason: Option<CancelReason>,
    pub new_price_cents: Option<i32>,
    pub new_quantity: Option<i32>,
    /// Extra audit note, e.g. `cancel_superseded_by_fill`.
    pub note: Option<&'static str>,
}

impl Applied {
    fn to(next_state: OrderState) -> Self {
        Self {
            next_state,
            set_exchange_order_id: None,
            new_filled_quantity: None,
            cancel_reason: None,
            new_price_cents: None,
            new_quantity: None,
            note: None,
        }
    }

    /// True when the transition changes no persisted column (pure no-op).
    pub fn is_noop(&self, from: OrderState) -> bool {
        self.next_state == from
            && self.set_exchange_order_id.is_none()
            && self.new_filled_quantity.is_none()
            && self.cancel_reason.is_none()
            && self.new_price_cents.is_none()
            && self.new_quantity.is_none()
    }
}

// ---------------------------------------------------------------------------
// TransitionError
// ---------------------------------------------------------------------------

/// Returned when an event cannot legally be applied in the current state.
/// The caller surfaces this and records an `illegal_transition_attempt`
/// audit row; the order is left untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: OrderState,
    /// Debug rendering of the rejected event.
    pub event: String,
    /// Extra context for faults like fill over-delivery.
    pub detail: Option<String>,
}

impl TransitionError {
    fn new(from: OrderState, event: &OrderEvent) -> Self {
        Self {
            from,
            event: format!("{event:?}"),
            detail: None,
        }
    }

    fn with_detail(from: OrderState, event: &OrderEvent, detail: String) -> Self {
        Self {
            from,
            event: format!("{event:?}"),
            detail: Some(detail),
        }
    }
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(d) => write!(f, "illegal transition: {} + {} ({d})", self.from, self.event),
            None => write!(f, "illegal transition: {} + {}", self.from, self.event),
        }
    }
}

impl std::error::Error for TransitionError {}

// ---------------------------------------------------------------------------
// The machine
// ---------------------------------------------------------------------------

/// When an amend/decrease/cancel round-trip ends, the order returns to the
/// live state implied by its fill progress.
fn restored_live_state(filled_quantity: i32) -> OrderState {
    if filled_quantity > 0 {
        OrderState::PartiallyFilled
    } else {
        OrderState::Acknowledged
    }
}

/// Decide the transition for `event` against the locked `snapshot`.
///
/// # Errors
/// [`TransitionError`] when the event is outside the legal table, or when a
/// fill would push `filled_quantity` past `quantity` (a reconciliation
/// fault, never a legal execution).
pub fn transition(snapshot: &OrderSnapshot, event: &OrderEvent) -> Result<Applied, TransitionError> {
    use OrderEvent as Ev;
    use OrderState as St;

    let from = snapshot.state;

    match (from, event) {
        // ------------------------------------------------------------------
        // Submit dispatch: pending -> submitted while the adapter call runs.
        // ------------------------------------------------------------------
        (St::Pending, Ev::Submit) => Ok(Applied::to(St::Submitted)),
        // Re-dispatch after a crash mid-submit is legal and a no-op.
        (St::Submitted, Ev::Submit) => Ok(Applied::to(St::Submitted)),

        // ------------------------------------------------------------------
        // Exchange ACK / REJECT of the submit.
        // ------------------------------------------------------------------
        (St::Pending | St::Submitted, Ev::Ack { exchange_order_id }) => {
            let mut applied = Applied::to(St::Acknowledged);
            applied.set_exchange_order_id = Some(exchange_order_id.clone());
            Ok(applied)
        }
        // Idempotent retry: the adapter returned the same ack again.
        (St::Acknowledged, Ev::Ack { exchange_order_id }) => {
            let mut applied = Applied::to(St::Acknowledged);
            applied.set_exchange_order_id = Some(exchange_order_id.clone());
            Ok(applied)
        }
        // Ack landing after a cancel was requested: keep the cancel in
        // flight but learn the exchange id so the cancel can target it.
        (St::PendingCancel, Ev::Ack { exchange_order_id }) => {
            let mut applied = Applied::to(St::PendingCancel);
            applied.set_exchange_order_id = Some(exchange_order_id.clone());
            Ok(applied)
        }
        (St::Pending | St::Submitted, Ev::Reject { .. }) => Ok(Applied::to(St::Rejected)),

        // ------------------------------------------------------------------
        // Fills: accepted from any live state. Fills win over in-flight
        // cancel/amend/decrease intents.
        // ------------------------------------------------------------------
        (
            St::Pending
            | St::Submitted
            | St::Acknowledged
            | St::PartiallyFilled
            | St::PendingCancel
            | St::PendingAmend
            | St::PendingDecrease,
            Ev::Fill { delta_qty },
        ) => {
            if *delta_qty <= 0 {
                return Err(TransitionError::with_detail(
                    from,
                    event,
                    format!("non-positive fill delta {delta_qty}"),
                ));
            }
            let cum = snapshot.filled_quantity + delta_qty;
            if cum > snapshot.quantity {
                return Err(TransitionError::with_detail(
                    from,
                    event,
                    format!(
                        "fill overflow: {} + {} > {}",
                        snapshot.filled_quantity, delta_qty, snapshot.quantity
                    ),
                ));
            }
            let mut applied = Applied::to(if cum == snapshot.quantity {
                St::Filled
            } else {
                St::PartiallyFilled
            });
            applied.new_filled_quantity = Some(cum);
            if from == St::PendingCancel && applied.next_state == St::Filled {
                applied.note = Some("cancel_superseded_by_fill");
            }
            Ok(applied)
        }

        // Duplicate fill against a filled order: ignored (dedup upstream).
        (St::Filled, Ev::Fill { .. }) => Ok(Applied::to(St::Filled)),

        // ------------------------------------------------------------------
        // Cancel flow.
        // ------------------------------------------------------------------
        // A cancel may land while a submit or an amend/decrease is still in
        // flight (mass cancel does this); the cancel wins and the late
        // confirmation of the overridden intent is refused when it arrives.
        (
            St::Pending
            | St::Submitted
            | St::Acknowledged
            | St::PartiallyFilled
            | St::PendingAmend
            | St::PendingDecrease,
            Ev::CancelRequest,
        ) => Ok(Applied::to(St::PendingCancel)),
        // Duplicate cancel request while one is in flight: no-op.
        (St::PendingCancel, Ev::CancelRequest) => Ok(Applied::to(St::PendingCancel)),

        (St::PendingCancel, Ev::CancelConfirmed { reason }) => {
            let mut applied = Applied::to(St::Cancelled);
            applied.cancel_reason = Some(*reason);
            Ok(applied)
        }
        // Cancel confirmation racing a completed fill: pure no-op, nothing
        // recorded against the terminal row (fills win).
        (St::Filled, Ev::CancelConfirmed { .. }) => {
            let mut applied = Applied::to(St::Filled);
            applied.note = Some("cancel_superseded_by_fill");
            Ok(applied)
        }

        // ------------------------------------------------------------------
        // Amend flow: confirm applies the new values, reject restores.
        // ------------------------------------------------------------------
        (St::Acknowledged | St::PartiallyFilled, Ev::AmendRequest) => {
            Ok(Applied::to(St::PendingAmend))
        }
        (St::PendingAmend, Ev::AmendConfirmed { new_price_cents, new_quantity }) => {
            if *new_quantity < snapshot.filled_quantity {
                return Err(TransitionError::with_detail(
                    from,
                    event,
                    format!(
                        "amend below filled quantity: {} < {}",
                        new_quantity, snapshot.filled_quantity
                    ),
                ));
            }
            let mut applied = Applied::to(restored_live_state(snapshot.filled_quantity));
            applied.new_price_cents = Some(*new_price_cents);
            applied.new_quantity = Some(*new_quantity);
            Ok(applied)
        }
        (St::PendingAmend, Ev::AmendRejected) => {
            Ok(Applied::to(restored_live_state(snapshot.filled_quantity)))
        }

        // ------------------------------------------------------------------
        // Decrease flow: quantity only, never below filled_quantity.
        // ------------------------------------------------------------------
        (St::Acknowledged | St::PartiallyFilled, Ev::DecreaseRequest) => {
            Ok(Applied::to(St::PendingDecrease))
        }
        (St::PendingDecrease, Ev::DecreaseConfirmed { reduce_by }) => {
            if *reduce_by <= 0 {
                return Err(TransitionError::with_detail(
                    from,
                    event,
                    format!("non-positive decrease {reduce_by}"),
                ));
            }
            let new_qty = snapshot.quantity - reduce_by;
            if new_qty < snapshot.filled_quantity {
                return Err(TransitionError::with_detail(
                    from,
                    event,
                    format!(
                        "decrease below filled quantity: {} < {}",
                        new_qty, snapshot.filled_quantity
                    ),
                ));
            }
            let mut applied = Applied::to(restored_live_state(snapshot.filled_quantity));
            applied.new_quantity = Some(new_qty);
            Ok(applied)
        }
        (St::PendingDecrease, Ev::DecreaseRejected) => {
            Ok(Applied::to(restored_live_state(snapshot.filled_quantity)))
        }

        // ------------------------------------------------------------------
        // Group staging.
        // ------------------------------------------------------------------
        (St::Staged, Ev::Release) => Ok(Applied::to(St::Pending)),
        (St::Staged, Ev::DirectCancel { reason }) => {
            let mut applied = Applied::to(St::Cancelled);
            applied.cancel_reason = Some(*reason);
            Ok(applied)
        }

        // ------------------------------------------------------------------
        // Reconciler-synthesized exchange terminals: legal from any live
        // state; the exchange is the source of truth.
        // ------------------------------------------------------------------
        (from_state, Ev::ExchangeTerminal { state }) if !from_state.is_terminal() => {
            match state {
                TerminalState::Filled => {
                    let mut applied = Applied::to(St::Filled);
                    applied.new_filled_quantity = Some(snapshot.quantity);
                    Ok(applied)
                }
                TerminalState::Cancelled => {
                    let mut applied = Applied::to(St::Cancelled);
                    applied.cancel_reason = Some(CancelReason::ExchangeCancel);
                    Ok(applied)
                }
                TerminalState::Rejected => Ok(Applied::to(St::Rejected)),
                TerminalState::Expired => Ok(Applied::to(St::Expired)),
            }
        }

        // ------------------------------------------------------------------
        // IOC expiry: nothing filled -> expired; a residue after partials
        // -> cancelled with reason `expired` (keeps the reason contract).
        // ------------------------------------------------------------------
        (St::Acknowledged | St::PartiallyFilled, Ev::IocExpired) => {
            if snapshot.time_in_force != TimeInForce::Ioc {
                return Err(TransitionError::with_detail(
                    from,
                    event,
                    "ioc expiry on a gtc order".to_string(),
                ));
            }
            if snapshot.filled_quantity > 0 {
                let mut applied = Applied::to(St::Cancelled);
                applied.cancel_reason = Some(CancelReason::Expired);
                Ok(applied)
            } else {
                Ok(Applied::to(St::Expired))
            }
        }

        // Everything else is illegal.
        (from_state, ev) => Err(TransitionError::new(from_state, ev)),
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(state: OrderState, quantity: i32, filled: i32) -> OrderSnapshot {
        OrderSnapshot {
            state,
            quantity,
            filled_quantity: filled,
            price_cents: 45,
            time_in_force: TimeInForce::Gtc,
        }
    }

    fn ioc_snap(state: OrderState, quantity: i32, filled: i32) -> OrderSnapshot {
        OrderSnapshot {
            time_in_force: TimeInForce::Ioc,
            ..snap(state, quantity, filled)
        }
    }

    #[test]
    fn happy_path_submit_ack_fill() {
        let a = transition(&snap(OrderState::Pending, 10, 0), &OrderEvent::Submit).unwrap();
        assert_eq!(a.next_state, OrderState::Submitted);

        let a = transition(
            &snap(OrderState::Submitted, 10, 0),
            &OrderEvent::Ack {
                exchange_order_id: "EX-1".to_string(),
            },
        )
        .unwrap();
        assert_eq!(a.next_state, OrderState::Acknowledged);
        assert_eq!(a.set_exchange_order_id.as_deref(), Some("EX-1"));

        let a = transition(
            &snap(OrderState::Acknowledged, 10, 0),
            &OrderEvent::Fill { delta_qty: 10 },
        )
        .unwrap();
        assert_eq!(a.next_state, OrderState::Filled);
        assert_eq!(a.new_filled_quantity, Some(10));
    }

    #[test]
    fn partial_then_completing_fill() {
        let a = transition(
            &snap(OrderState::Acknowledged, 10, 0),
            &OrderEvent::Fill { delta_qty: 3 },
        )
        .unwrap();
        assert_eq!(a.next_state, OrderState::PartiallyFilled);
        assert_eq!(a.new_filled_quantity, Some(3));

        let a = transition(
            &snap(OrderState::PartiallyFilled, 10, 3),
            &OrderEvent::Fill { delta_qty: 7 },
        )
        .unwrap();
        assert_eq!(a.next_state, OrderState::Filled);
        assert_eq!(a.new_filled_quantity, Some(10));
    }

    #[test]
    fn fill_overflow_is_a_fault() {
        let err = transition(
            &snap(OrderState::PartiallyFilled, 10, 8),
            &OrderEvent::Fill { delta_qty: 5 },
        )
        .unwrap_err();
        assert_eq!(err.from, OrderState::PartiallyFilled);
        assert!(err.detail.unwrap().contains("overflow"));
    }

    #[test]
    fn reject_from_pending_is_terminal() {
        let a = transition(
            &snap(OrderState::Pending, 10, 0),
            &OrderEvent::Reject {
                reason: "self cross".to_string(),
            },
        )
        .unwrap();
        assert_eq!(a.next_state, OrderState::Rejected);
        assert!(a.next_state.is_terminal());
    }

    #[test]
    fn late_fill_beats_inflight_cancel() {
        // Order in pending_cancel; the completing fill arrives first.
        let a = transition(
            &snap(OrderState::PendingCancel, 10, 0),
            &OrderEvent::Fill { delta_qty: 10 },
        )
        .unwrap();
        assert_eq!(a.next_state, OrderState::Filled);
        assert_eq!(a.note, Some("cancel_superseded_by_fill"));
        assert_eq!(a.cancel_reason, None, "fill wins: no cancel reason");
    }

    #[test]
    fn cancel_confirmation_after_fill_is_noop() {
        let a = transition(
            &snap(OrderState::Filled, 10, 10),
            &OrderEvent::CancelConfirmed {
                reason: CancelReason::UserRequested,
            },
        )
        .unwrap();
        assert_eq!(a.next_state, OrderState::Filled);
        assert!(a.is_noop(OrderState::Filled));
        assert_eq!(a.note, Some("cancel_superseded_by_fill"));
    }

    #[test]
    fn partial_fill_during_cancel_keeps_cancel_pending_resolution_open() {
        // A partial fill while cancelling leaves the order partially filled;
        // the cancel can still confirm afterwards.
        let a = transition(
            &snap(OrderState::PendingCancel, 10, 0),
            &OrderEvent::Fill { delta_qty: 4 },
        )
        .unwrap();
        assert_eq!(a.next_state, OrderState::PartiallyFilled);
    }

    #[test]
    fn cancel_confirm_carries_reason() {
        let a = transition(
            &snap(OrderState::PendingCancel, 10, 0),
            &OrderEvent::CancelConfirmed {
                reason: CancelReason::Shutdown,
            },
        )
        .unwrap();
        assert_eq!(a.next_state, OrderState::Cancelled);
        assert_eq!(a.cancel_reason, Some(CancelReason::Shutdown));
    }

    #[test]
    fn amend_confirm_restores_live_state_with_new_values() {
        let a = transition(
            &snap(OrderState::PendingAmend, 10, 0),
            &OrderEvent::AmendConfirmed {
                new_price_cents: 55,
                new_quantity: 20,
            },
        )
        .unwrap();
        assert_eq!(a.next_state, OrderState::Acknowledged);
        assert_eq!(a.new_price_cents, Some(55));
        assert_eq!(a.new_quantity, Some(20));

        // With prior fills the restore target is partially_filled.
        let a = transition(
            &snap(OrderState::PendingAmend, 10, 4),
            &OrderEvent::AmendConfirmed {
                new_price_cents: 55,
                new_quantity: 8,
            },
        )
        .unwrap();
        assert_eq!(a.next_state, OrderState::PartiallyFilled);
    }

    #[test]
    fn amend_reject_restores_unchanged() {
        let a = transition(
            &snap(OrderState::PendingAmend, 10, 0),
            &OrderEvent::AmendRejected,
        )
        .unwrap();
        assert_eq!(a.next_state, OrderState::Acknowledged);
        assert_eq!(a.new_price_cents, None);
        assert_eq!(a.new_quantity, None);
    }

    #[test]
    fn decrease_never_crosses_filled_quantity() {
        let err = transition(
            &snap(OrderState::PendingDecrease, 10, 6),
            &OrderEvent::DecreaseConfirmed { reduce_by: 5 },
        )
        .unwrap_err();
        assert!(err.detail.unwrap().contains("below filled"));

        let a = transition(
            &snap(OrderState::PendingDecrease, 10, 6),
            &OrderEvent::DecreaseConfirmed { reduce_by: 4 },
        )
        .unwrap();
        assert_eq!(a.next_state, OrderState::PartiallyFilled);
        assert_eq!(a.new_quantity, Some(6));
    }

    #[test]
    fn staged_release_and_direct_cancel() {
        let a = transition(&snap(OrderState::Staged, 10, 0), &OrderEvent::Release).unwrap();
        assert_eq!(a.next_state, OrderState::Pending);

        let a = transition(
            &snap(OrderState::Staged, 10, 0),
            &OrderEvent::DirectCancel {
                reason: CancelReason::UserRequested,
            },
        )
        .unwrap();
        assert_eq!(a.next_state, OrderState::Cancelled);
        assert_eq!(a.cancel_reason, Some(CancelReason::UserRequested));
    }

    #[test]
    fn exchange_terminal_heals_any_live_state() {
        let a = transition(
            &snap(OrderState::Pending, 10, 0),
            &OrderEvent::ExchangeTerminal {
                state: TerminalState::Cancelled,
            },
        )
        .unwrap();
        assert_eq!(a.next_state, OrderState::Cancelled);
        assert_eq!(a.cancel_reason, Some(CancelReason::ExchangeCancel));

        let a = transition(
            &snap(OrderState::PendingCancel, 10, 2),
            &OrderEvent::ExchangeTerminal {
                state: TerminalState::Filled,
            },
        )
        .unwrap();
        assert_eq!(a.next_state, OrderState::Filled);
        assert_eq!(a.new_filled_quantity, Some(10));
    }

    #[test]
    fn exchange_terminal_on_terminal_order_is_illegal() {
        let err = transition(
            &snap(OrderState::Filled, 10, 10),
            &OrderEvent::ExchangeTerminal {
                state: TerminalState::Cancelled,
            },
        )
        .unwrap_err();
        assert_eq!(err.from, OrderState::Filled);
    }

    #[test]
    fn ioc_expiry_semantics() {
        // Nothing filled: expired.
        let a = transition(&ioc_snap(OrderState::Acknowledged, 10, 0), &OrderEvent::IocExpired)
            .unwrap();
        assert_eq!(a.next_state, OrderState::Expired);
        assert_eq!(a.cancel_reason, None);

        // Residue after a partial: cancelled with reason expired.
        let a = transition(
            &ioc_snap(OrderState::PartiallyFilled, 10, 4),
            &OrderEvent::IocExpired,
        )
        .unwrap();
        assert_eq!(a.next_state, OrderState::Cancelled);
        assert_eq!(a.cancel_reason, Some(CancelReason::Expired));
    }

    #[test]
    fn ioc_expiry_on_gtc_is_illegal() {
        let err =
            transition(&snap(OrderState::Acknowledged, 10, 0), &OrderEvent::IocExpired).unwrap_err();
        assert!(err.detail.unwrap().contains("gtc"));
    }

    #[test]
    fn terminal_states_are_sticky() {
        for terminal in [
            OrderState::Filled,
            OrderState::Cancelled,
            OrderState::Rejected,
            OrderState::Expired,
        ] {
            let err = transition(&snap(terminal, 10, 10), &OrderEvent::CancelRequest).unwrap_err();
            assert_eq!(err.from, terminal);
            let err = transition(&snap(terminal, 10, 10), &OrderEvent::AmendRequest).unwrap_err();
            assert_eq!(err.from, terminal);
        }
    }

    #[test]
    fn amend_request_requires_acknowledged_order() {
        let err = transition(&snap(OrderState::Pending, 10, 0), &OrderEvent::AmendRequest)
            .unwrap_err();
        assert_eq!(err.from, OrderState::Pending);
    }

    #[test]
    fn cancel_of_inflight_submit_keeps_late_ack_usable() {
        // Mass cancel hits an order whose submit call is mid-flight.
        let a = transition(&snap(OrderState::Submitted, 10, 0), &OrderEvent::CancelRequest)
            .unwrap();
        assert_eq!(a.next_state, OrderState::PendingCancel);

        // The submit's ack still lands and records the exchange id without
        // disturbing the cancel.
        let a = transition(
            &snap(OrderState::PendingCancel, 10, 0),
            &OrderEvent::Ack {
                exchange_order_id: "EX-7".to_string(),
            },
        )
        .unwrap();
        assert_eq!(a.next_state, OrderState::PendingCancel);
        assert_eq!(a.set_exchange_order_id.as_deref(), Some("EX-7"));
    }

    #[test]
    fn cancel_overrides_inflight_amend() {
        let a = transition(&snap(OrderState::PendingAmend, 10, 0), &OrderEvent::CancelRequest)
            .unwrap();
        assert_eq!(a.next_state, OrderState::PendingCancel);
        // The late amend confirmation is then refused.
        let err = transition(
            &snap(OrderState::PendingCancel, 10, 0),
            &OrderEvent::AmendConfirmed {
                new_price_cents: 50,
                new_quantity: 10,
            },
        )
        .unwrap_err();
        assert_eq!(err.from, OrderState::PendingCancel);
    }

    #[test]
    fn duplicate_fill_on_filled_order_is_ignored() {
        let a = transition(
            &snap(OrderState::Filled, 10, 10),
            &OrderEvent::Fill { delta_qty: 10 },
        )
        .unwrap();
        assert!(a.is_noop(OrderState::Filled));
    }
}

//! Bracket / OCO group engine.
//!
//! Pure planner: given a group snapshot (with the triggering transition
//! already committed into it) this module decides what must happen to the
//! sibling legs and to the group row. The caller applies the directives in
//! the same transaction as the triggering transition, so bracket releases
//! and sibling cancels are atomic with the fill that caused them.

use harman_oms::{CancelReason, GroupState, GroupType, LegRole, OrderState};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Snapshot inputs
// ---------------------------------------------------------------------------

/// One leg as read under the group's row lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegSnapshot {
    pub order_id: i64,
    pub leg_role: LegRole,
    pub state: OrderState,
    pub filled_quantity: i32,
}

impl LegSnapshot {
    fn is_child(&self) -> bool {
        matches!(self.leg_role, LegRole::TakeProfit | LegRole::StopLoss)
    }

    fn has_filled(&self) -> bool {
        self.state == OrderState::Filled
    }
}

/// A group and its legs, read FOR UPDATE after the triggering transition
/// committed its column changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSnapshot {
    pub group_id: i64,
    pub group_type: GroupType,
    pub state: GroupState,
    pub legs: Vec<LegSnapshot>,
}

/// The order transition that woke the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegTransition {
    pub order_id: i64,
    pub from: OrderState,
    pub to: OrderState,
}

// ---------------------------------------------------------------------------
// Directives
// ---------------------------------------------------------------------------

/// What the caller must apply, in order, inside the triggering transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupDirective {
    /// Staged leg becomes `pending` and gets a `submit` queue row.
    ReleaseLeg { order_id: i64 },
    /// Live leg goes through `pending_cancel` with a `cancel` queue row.
    RequestCancel { order_id: i64, reason: CancelReason },
    /// Staged leg is cancelled in place; no queue row is ever written.
    DirectCancel { order_id: i64, reason: CancelReason },
    /// The group row moves to a closed state.
    CloseGroup { state: GroupState },
    /// Both OCO legs filled before either cancel landed; audit the race.
    WarnBothFilled,
}

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

/// Plan the reaction to one committed leg transition.
///
/// The returned directives only reference legs other than the trigger; the
/// trigger's own columns are already persisted. An empty plan means the
/// group needs nothing.
pub fn on_leg_transition(group: &GroupSnapshot, trigger: &LegTransition) -> Vec<GroupDirective> {
    if group.state.is_closed() {
        return Vec::new();
    }

    let Some(trigger_leg) = group.legs.iter().find(|l| l.order_id == trigger.order_id) else {
        return Vec::new();
    };

    let mut plan = match group.group_type {
        GroupType::Bracket => plan_bracket(group, trigger, trigger_leg),
        GroupType::Oco => plan_oco(group, trigger),
    };

    // Close the group once every leg is terminal, counting cancels the plan
    // itself just decided (a DirectCancel makes its leg terminal in this
    // same transaction).
    if let Some(close) = close_directive(group, &plan) {
        plan.push(close);
    }
    plan
}

fn plan_bracket(
    group: &GroupSnapshot,
    trigger: &LegTransition,
    trigger_leg: &LegSnapshot,
) -> Vec<GroupDirective> {
    let mut plan = Vec::new();

    match trigger_leg.leg_role {
        // Entry filled: release both staged children.
        LegRole::Entry if trigger.to == OrderState::Filled => {
            for leg in group.legs.iter().filter(|l| l.is_child()) {
                if leg.state == OrderState::Staged {
                    plan.push(GroupDirective::ReleaseLeg {
                        order_id: leg.order_id,
                    });
                }
            }
        }

        // Entry died before its fill: the children were never released, so
        // they cancel in place and the group is over.
        LegRole::Entry if trigger.to.is_terminal() => {
            for leg in group.legs.iter().filter(|l| l.is_child()) {
                match leg.state {
                    OrderState::Staged => plan.push(GroupDirective::DirectCancel {
                        order_id: leg.order_id,
                        reason: CancelReason::UserRequested,
                    }),
                    s if !s.is_terminal() && s != OrderState::PendingCancel => {
                        plan.push(GroupDirective::RequestCancel {
                            order_id: leg.order_id,
                            reason: CancelReason::UserRequested,
                        })
                    }
                    _ => {}
                }
            }
        }

        // A child filled: the surviving sibling is cancelled.
        LegRole::TakeProfit | LegRole::StopLoss if trigger.to == OrderState::Filled => {
            for leg in group.legs.iter().filter(|l| l.is_child()) {
                if leg.order_id == trigger.order_id {
                    continue;
                }
                match leg.state {
                    OrderState::Staged => plan.push(GroupDirective::DirectCancel {
                        order_id: leg.order_id,
                        reason: CancelReason::UserRequested,
                    }),
                    s if !s.is_terminal() && s != OrderState::PendingCancel => {
                        plan.push(GroupDirective::RequestCancel {
                            order_id: leg.order_id,
                            reason: CancelReason::UserRequested,
                        })
                    }
                    _ => {}
                }
            }
        }

        _ => {}
    }

    plan
}

fn plan_oco(group: &GroupSnapshot, trigger: &LegTransition) -> Vec<GroupDirective> {
    let mut plan = Vec::new();

    // Any fill, partial or full, cancels the peer.
    let filled_event = matches!(
        trigger.to,
        OrderState::PartiallyFilled | OrderState::Filled
    );
    if !filled_event {
        return plan;
    }

    for leg in &group.legs {
        if leg.order_id == trigger.order_id {
            continue;
        }
        match leg.state {
            // Both legs filled before either cancel landed (observed via
            // reconciliation): keep both fills, flag the race.
            OrderState::Filled if trigger.to == OrderState::Filled => {
                plan.push(GroupDirective::WarnBothFilled);
            }
            s if !s.is_terminal() && s != OrderState::PendingCancel => {
                plan.push(GroupDirective::RequestCancel {
                    order_id: leg.order_id,
                    reason: CancelReason::UserRequested,
                });
            }
            _ => {}
        }
    }
    plan
}

/// Explicit group cancel (operator request or bracket cascade): staged legs
/// cancel in place, live legs go through the exchange, the group closes
/// `cancelled` immediately.
pub fn plan_group_cancel(group: &GroupSnapshot, reason: CancelReason) -> Vec<GroupDirective> {
    let mut plan = Vec::new();
    if group.state.is_closed() {
        return plan;
    }

    for leg in &group.legs {
        match leg.state {
            OrderState::Staged => plan.push(GroupDirective::DirectCancel {
                order_id: leg.order_id,
                reason,
            }),
            s if !s.is_terminal() && s != OrderState::PendingCancel => {
                plan.push(GroupDirective::RequestCancel {
                    order_id: leg.order_id,
                    reason,
                })
            }
            _ => {}
        }
    }

    plan.push(GroupDirective::CloseGroup {
        state: GroupState::Cancelled,
    });
    plan
}

/// The closed state a fully terminal group lands in: `completed` when the
/// trade did something (any non-entry leg filled, or for OCO any leg
/// filled), `cancelled` otherwise. `None` while any leg is still live.
pub fn close_state_if_all_terminal(group: &GroupSnapshot) -> Option<GroupState> {
    if !group.legs.iter().all(|l| l.state.is_terminal()) {
        return None;
    }

    let any_fill = match group.group_type {
        GroupType::Bracket => group.legs.iter().any(|l| l.is_child() && l.has_filled()),
        GroupType::Oco => group.legs.iter().any(|l| l.has_filled()),
    };

    Some(if any_fill {
        GroupState::Completed
    } else {
        GroupState::Cancelled
    })
}

fn close_directive(group: &GroupSnapshot, plan: &[GroupDirective]) -> Option<GroupDirective> {
    // Legs the plan cancels in place are terminal within this transaction.
    let directly_cancelled: Vec<i64> = plan
        .iter()
        .filter_map(|d| match d {
            GroupDirective::DirectCancel { order_id, .. } => Some(*order_id),
            _ => None,
        })
        .collect();

    let adjusted = GroupSnapshot {
        legs: group
            .legs
            .iter()
            .map(|l| {
                let mut leg = l.clone();
                if directly_cancelled.contains(&l.order_id) {
                    leg.state = OrderState::Cancelled;
                }
                leg
            })
            .collect(),
        ..group.clone()
    };

    close_state_if_all_terminal(&adjusted).map(|state| GroupDirective::CloseGroup { state })
}

// ---------------------------------------------------------------------------
// Creation-time validation (I7)
// ---------------------------------------------------------------------------

/// Reject leg-role combinations the invariants don't allow, before any row
/// is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupShapeError(pub String);

impl std::fmt::Display for GroupShapeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid group shape: {}", self.0)
    }
}

impl std::error::Error for GroupShapeError {}

/// A bracket is exactly one `entry` plus one `take_profit` and one
/// `stop_loss`; an OCO is exactly two `oco_leg`s.
pub fn validate_leg_roles(group_type: GroupType, roles: &[LegRole]) -> Result<(), GroupShapeError> {
    let count = |r: LegRole| roles.iter().filter(|x| **x == r).count();
    match group_type {
        GroupType::Bracket => {
            if roles.len() != 3
                || count(LegRole::Entry) != 1
                || count(LegRole::TakeProfit) != 1
                || count(LegRole::StopLoss) != 1
            {
                return Err(GroupShapeError(format!(
                    "bracket requires entry + take_profit + stop_loss, got {roles:?}"
                )));
            }
        }
        GroupType::Oco => {
            if roles.len() != 2 || count(LegRole::OcoLeg) != 2 {
                return Err(GroupShapeError(format!(
                    "oco requires exactly two oco_leg legs, got {roles:?}"
                )));
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn leg(order_id: i64, role: LegRole, state: OrderState, filled: i32) -> LegSnapshot {
        LegSnapshot {
            order_id,
            leg_role: role,
            state,
            filled_quantity: filled,
        }
    }

    fn bracket(entry: OrderState, tp: OrderState, sl: OrderState) -> GroupSnapshot {
        GroupSnapshot {
            group_id: 7,
            group_type: GroupType::Bracket,
            state: GroupState::Active,
            legs: vec![
                leg(1, LegRole::Entry, entry, 0),
                leg(2, LegRole::TakeProfit, tp, 0),
                leg(3, LegRole::StopLoss, sl, 0),
            ],
        }
    }

    fn oco(a: OrderState, b: OrderState) -> GroupSnapshot {
        GroupSnapshot {
            group_id: 9,
            group_type: GroupType::Oco,
            state: GroupState::Active,
            legs: vec![
                leg(11, LegRole::OcoLeg, a, 0),
                leg(12, LegRole::OcoLeg, b, 0),
            ],
        }
    }

    #[test]
    fn entry_fill_releases_both_staged_children() {
        let g = bracket(OrderState::Filled, OrderState::Staged, OrderState::Staged);
        let plan = on_leg_transition(
            &g,
            &LegTransition {
                order_id: 1,
                from: OrderState::Acknowledged,
                to: OrderState::Filled,
            },
        );
        assert_eq!(
            plan,
            vec![
                GroupDirective::ReleaseLeg { order_id: 2 },
                GroupDirective::ReleaseLeg { order_id: 3 },
            ]
        );
    }

    #[test]
    fn child_fill_cancels_sibling() {
        let g = bracket(
            OrderState::Filled,
            OrderState::Filled,
            OrderState::Acknowledged,
        );
        let plan = on_leg_transition(
            &g,
            &LegTransition {
                order_id: 2,
                from: OrderState::Acknowledged,
                to: OrderState::Filled,
            },
        );
        assert_eq!(
            plan,
            vec![GroupDirective::RequestCancel {
                order_id: 3,
                reason: CancelReason::UserRequested,
            }]
        );
    }

    #[test]
    fn entry_rejection_cancels_staged_children_and_closes() {
        let g = bracket(OrderState::Rejected, OrderState::Staged, OrderState::Staged);
        let plan = on_leg_transition(
            &g,
            &LegTransition {
                order_id: 1,
                from: OrderState::Submitted,
                to: OrderState::Rejected,
            },
        );
        assert_eq!(
            plan,
            vec![
                GroupDirective::DirectCancel {
                    order_id: 2,
                    reason: CancelReason::UserRequested,
                },
                GroupDirective::DirectCancel {
                    order_id: 3,
                    reason: CancelReason::UserRequested,
                },
                GroupDirective::CloseGroup {
                    state: GroupState::Cancelled,
                },
            ]
        );
    }

    #[test]
    fn bracket_completes_when_last_leg_terminates_after_a_child_fill() {
        // TP filled earlier; SL's cancel just confirmed.
        let g = bracket(
            OrderState::Filled,
            OrderState::Filled,
            OrderState::Cancelled,
        );
        let plan = on_leg_transition(
            &g,
            &LegTransition {
                order_id: 3,
                from: OrderState::PendingCancel,
                to: OrderState::Cancelled,
            },
        );
        assert_eq!(
            plan,
            vec![GroupDirective::CloseGroup {
                state: GroupState::Completed,
            }]
        );
    }

    #[test]
    fn oco_partial_fill_cancels_peer() {
        let g = oco(OrderState::PartiallyFilled, OrderState::Acknowledged);
        let plan = on_leg_transition(
            &g,
            &LegTransition {
                order_id: 11,
                from: OrderState::Acknowledged,
                to: OrderState::PartiallyFilled,
            },
        );
        assert_eq!(
            plan,
            vec![GroupDirective::RequestCancel {
                order_id: 12,
                reason: CancelReason::UserRequested,
            }]
        );
    }

    #[test]
    fn oco_full_fill_after_partial_does_not_recancel_pending_peer() {
        let g = oco(OrderState::Filled, OrderState::PendingCancel);
        let plan = on_leg_transition(
            &g,
            &LegTransition {
                order_id: 11,
                from: OrderState::PartiallyFilled,
                to: OrderState::Filled,
            },
        );
        assert!(plan.is_empty(), "peer already cancelling: {plan:?}");
    }

    #[test]
    fn oco_simultaneous_fills_keep_both_and_warn() {
        let mut g = oco(OrderState::Filled, OrderState::Filled);
        g.legs[0].filled_quantity = 10;
        g.legs[1].filled_quantity = 10;
        let plan = on_leg_transition(
            &g,
            &LegTransition {
                order_id: 12,
                from: OrderState::Acknowledged,
                to: OrderState::Filled,
            },
        );
        assert_eq!(
            plan,
            vec![
                GroupDirective::WarnBothFilled,
                GroupDirective::CloseGroup {
                    state: GroupState::Completed,
                },
            ]
        );
    }

    #[test]
    fn oco_closes_completed_once_peer_cancel_confirms() {
        let g = oco(OrderState::Filled, OrderState::Cancelled);
        let plan = on_leg_transition(
            &g,
            &LegTransition {
                order_id: 12,
                from: OrderState::PendingCancel,
                to: OrderState::Cancelled,
            },
        );
        assert_eq!(
            plan,
            vec![GroupDirective::CloseGroup {
                state: GroupState::Completed,
            }]
        );
    }

    #[test]
    fn group_cancel_splits_staged_and_live_legs() {
        let g = bracket(
            OrderState::Acknowledged,
            OrderState::Staged,
            OrderState::Staged,
        );
        let plan = plan_group_cancel(&g, CancelReason::UserRequested);
        assert_eq!(
            plan,
            vec![
                GroupDirective::RequestCancel {
                    order_id: 1,
                    reason: CancelReason::UserRequested,
                },
                GroupDirective::DirectCancel {
                    order_id: 2,
                    reason: CancelReason::UserRequested,
                },
                GroupDirective::DirectCancel {
                    order_id: 3,
                    reason: CancelReason::UserRequested,
                },
                GroupDirective::CloseGroup {
                    state: GroupState::Cancelled,
                },
            ]
        );
    }

    #[test]
    fn closed_group_plans_nothing() {
        let mut g = oco(OrderState::Filled, OrderState::Cancelled);
        g.state = GroupState::Completed;
        let plan = on_leg_transition(
            &g,
            &LegTransition {
                order_id: 11,
                from: OrderState::PartiallyFilled,
                to: OrderState::Filled,
            },
        );
        assert!(plan.is_empty());
        assert!(plan_group_cancel(&g, CancelReason::UserRequested).is_empty());
    }

    #[test]
    fn leg_role_shapes_are_validated() {
        assert!(validate_leg_roles(
            GroupType::Bracket,
            &[LegRole::Entry, LegRole::TakeProfit, LegRole::StopLoss]
        )
        .is_ok());
        assert!(validate_leg_roles(
            GroupType::Bracket,
            &[LegRole::Entry, LegRole::TakeProfit, LegRole::TakeProfit]
        )
        .is_err());
        assert!(validate_leg_roles(GroupType::Oco, &[LegRole::OcoLeg, LegRole::OcoLeg]).is_ok());
        assert!(validate_leg_roles(GroupType::Oco, &[LegRole::OcoLeg, LegRole::Entry]).is_err());
        assert!(validate_leg_roles(GroupType::Oco, &[LegRole::OcoLeg]).is_err());
    }
}

//! Pure order domain for the harman OMS.
//!
//! This crate holds the closed vocabulary of the system (sides, actions,
//! time-in-force, cancel reasons, group roles) and the order state machine.
//! Nothing here performs I/O; every persisted mutation in `harman-db` is
//! computed by [`transition`] first and applied under a row lock.

pub mod state_machine;
pub mod types;

pub use state_machine::{
    Applied, OrderEvent, OrderSnapshot, OrderState, TerminalState, TransitionError, transition,
};
pub use types::{
    Action, CancelReason, GroupState, GroupType, LegRole, QueueAction, Side, TimeInForce,
};

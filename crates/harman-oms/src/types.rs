//! Closed enumerations shared across the service.
//!
//! Every enum carries an `as_str`/`parse` pair because these values round-trip
//! through Postgres `text` columns; the strings are the canonical wire and
//! storage spelling.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome side of a binary contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Yes => "yes",
            Side::No => "no",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ParseEnumError> {
        match s {
            "yes" => Ok(Side::Yes),
            "no" => Ok(Side::No),
            other => Err(ParseEnumError::new("side", other)),
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Buy or sell the chosen side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Buy,
    Sell,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Buy => "buy",
            Action::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ParseEnumError> {
        match s {
            "buy" => Ok(Action::Buy),
            "sell" => Ok(Action::Sell),
            other => Err(ParseEnumError::new("action", other)),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeInForce {
    /// Good till cancelled.
    Gtc,
    /// Immediate or cancel.
    Ioc,
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeInForce::Gtc => "gtc",
            TimeInForce::Ioc => "ioc",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ParseEnumError> {
        match s {
            "gtc" => Ok(TimeInForce::Gtc),
            "ioc" => Ok(TimeInForce::Ioc),
            other => Err(ParseEnumError::new("time_in_force", other)),
        }
    }
}

impl fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an order ended up `cancelled`. Non-null exactly when the order is in
/// the `cancelled` state (enforced by a DB check constraint).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    UserRequested,
    RiskLimitBreached,
    Shutdown,
    Expired,
    ExchangeCancel,
}

impl CancelReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelReason::UserRequested => "user_requested",
            CancelReason::RiskLimitBreached => "risk_limit_breached",
            CancelReason::Shutdown => "shutdown",
            CancelReason::Expired => "expired",
            CancelReason::ExchangeCancel => "exchange_cancel",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ParseEnumError> {
        match s {
            "user_requested" => Ok(CancelReason::UserRequested),
            "risk_limit_breached" => Ok(CancelReason::RiskLimitBreached),
            "shutdown" => Ok(CancelReason::Shutdown),
            "expired" => Ok(CancelReason::Expired),
            "exchange_cancel" => Ok(CancelReason::ExchangeCancel),
            other => Err(ParseEnumError::new("cancel_reason", other)),
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Intent kinds carried by `order_queue` rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueAction {
    Submit,
    Cancel,
    Amend,
    Decrease,
}

impl QueueAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueAction::Submit => "submit",
            QueueAction::Cancel => "cancel",
            QueueAction::Amend => "amend",
            QueueAction::Decrease => "decrease",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ParseEnumError> {
        match s {
            "submit" => Ok(QueueAction::Submit),
            "cancel" => Ok(QueueAction::Cancel),
            "amend" => Ok(QueueAction::Amend),
            "decrease" => Ok(QueueAction::Decrease),
            other => Err(ParseEnumError::new("queue_action", other)),
        }
    }
}

impl fmt::Display for QueueAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role of a leg inside an order group. Closed sum type: combinations the
/// group invariants don't allow are rejected at group creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegRole {
    Entry,
    TakeProfit,
    StopLoss,
    OcoLeg,
}

impl LegRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            LegRole::Entry => "entry",
            LegRole::TakeProfit => "take_profit",
            LegRole::StopLoss => "stop_loss",
            LegRole::OcoLeg => "oco_leg",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ParseEnumError> {
        match s {
            "entry" => Ok(LegRole::Entry),
            "take_profit" => Ok(LegRole::TakeProfit),
            "stop_loss" => Ok(LegRole::StopLoss),
            "oco_leg" => Ok(LegRole::OcoLeg),
            other => Err(ParseEnumError::new("leg_role", other)),
        }
    }
}

impl fmt::Display for LegRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupType {
    Bracket,
    Oco,
}

impl GroupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupType::Bracket => "bracket",
            GroupType::Oco => "oco",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ParseEnumError> {
        match s {
            "bracket" => Ok(GroupType::Bracket),
            "oco" => Ok(GroupType::Oco),
            other => Err(ParseEnumError::new("group_type", other)),
        }
    }
}

impl fmt::Display for GroupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupState {
    Active,
    Completed,
    Cancelled,
}

impl GroupState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupState::Active => "active",
            GroupState::Completed => "completed",
            GroupState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ParseEnumError> {
        match s {
            "active" => Ok(GroupState::Active),
            "completed" => Ok(GroupState::Completed),
            "cancelled" => Ok(GroupState::Cancelled),
            other => Err(ParseEnumError::new("group_state", other)),
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, GroupState::Completed | GroupState::Cancelled)
    }
}

impl fmt::Display for GroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored string did not match any variant of the target enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {:?}", self.kind, self.value)
    }
}

impl std::error::Error for ParseEnumError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enums_round_trip_through_strings() {
        for s in [Side::Yes, Side::No] {
            assert_eq!(Side::parse(s.as_str()).unwrap(), s);
        }
        for a in [Action::Buy, Action::Sell] {
            assert_eq!(Action::parse(a.as_str()).unwrap(), a);
        }
        for t in [TimeInForce::Gtc, TimeInForce::Ioc] {
            assert_eq!(TimeInForce::parse(t.as_str()).unwrap(), t);
        }
        for r in [
            CancelReason::UserRequested,
            CancelReason::RiskLimitBreached,
            CancelReason::Shutdown,
            CancelReason::Expired,
            CancelReason::ExchangeCancel,
        ] {
            assert_eq!(CancelReason::parse(r.as_str()).unwrap(), r);
        }
        for q in [
            QueueAction::Submit,
            QueueAction::Cancel,
            QueueAction::Amend,
            QueueAction::Decrease,
        ] {
            assert_eq!(QueueAction::parse(q.as_str()).unwrap(), q);
        }
        for l in [
            LegRole::Entry,
            LegRole::TakeProfit,
            LegRole::StopLoss,
            LegRole::OcoLeg,
        ] {
            assert_eq!(LegRole::parse(l.as_str()).unwrap(), l);
        }
    }

    #[test]
    fn unknown_value_is_an_error() {
        let err = Side::parse("maybe").unwrap_err();
        assert_eq!(err.kind, "side");
        assert!(err.to_string().contains("maybe"));
    }
}

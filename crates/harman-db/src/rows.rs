//! Row structs and the column → domain parsers.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use harman_oms::{
    Action, CancelReason, GroupState, GroupType, LegRole, OrderState, Side, TimeInForce,
};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: i64,
    pub exchange: String,
    pub api_key_prefix: String,
    pub max_notional_cents: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl SessionRow {
    pub fn from_row(row: &PgRow) -> Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            exchange: row.try_get("exchange")?,
            api_key_prefix: row.try_get("api_key_prefix")?,
            max_notional_cents: row.try_get("max_notional_cents")?,
            created_at: row.try_get("created_at")?,
            closed_at: row.try_get("closed_at")?,
        })
    }

    pub fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct OrderRow {
    pub id: i64,
    pub session_id: i64,
    pub client_order_id: Uuid,
    pub exchange_order_id: Option<String>,
    pub ticker: String,
    pub side: Side,
    pub action: Action,
    pub quantity: i32,
    pub price_cents: i32,
    pub filled_quantity: i32,
    pub time_in_force: TimeInForce,
    pub state: OrderState,
    pub cancel_reason: Option<CancelReason>,
    pub group_id: Option<i64>,
    pub leg_role: Option<LegRole>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderRow {
    pub fn from_row(row: &PgRow) -> Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            session_id: row.try_get("session_id")?,
            client_order_id: row.try_get("client_order_id")?,
            exchange_order_id: row.try_get("exchange_order_id")?,
            ticker: row.try_get("ticker")?,
            side: Side::parse(row.try_get::<String, _>("side")?.as_str())
                .context("orders.side")?,
            action: Action::parse(row.try_get::<String, _>("action")?.as_str())
                .context("orders.action")?,
            quantity: row.try_get("quantity")?,
            price_cents: row.try_get("price_cents")?,
            filled_quantity: row.try_get("filled_quantity")?,
            time_in_force: TimeInForce::parse(
                row.try_get::<String, _>("time_in_force")?.as_str(),
            )
            .context("orders.time_in_force")?,
            state: OrderState::parse(row.try_get::<String, _>("state")?.as_str())
                .context("orders.state")?,
            cancel_reason: row
                .try_get::<Option<String>, _>("cancel_reason")?
                .map(|s| CancelReason::parse(&s))
                .transpose()
                .context("orders.cancel_reason")?,
            group_id: row.try_get("group_id")?,
            leg_role: row
                .try_get::<Option<String>, _>("leg_role")?
                .map(|s| LegRole::parse(&s))
                .transpose()
                .context("orders.leg_role")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    /// The locked columns the state machine evaluates.
    pub fn snapshot(&self) -> harman_oms::OrderSnapshot {
        harman_oms::OrderSnapshot {
            state: self.state,
            quantity: self.quantity,
            filled_quantity: self.filled_quantity,
            price_cents: self.price_cents,
            time_in_force: self.time_in_force,
        }
    }
}

/// The canonical order column list; every order query selects exactly this.
pub(crate) const ORDER_COLUMNS: &str = "id, session_id, client_order_id, exchange_order_id, \
     ticker, side, action, quantity, price_cents, filled_quantity, \
     time_in_force, state, cancel_reason, group_id, leg_role, \
     created_at, updated_at";

#[derive(Debug, Clone)]
pub struct FillRow {
    pub id: i64,
    pub order_id: i64,
    pub trade_id: String,
    pub price_cents: i32,
    pub quantity: i32,
    pub is_taker: bool,
    pub filled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl FillRow {
    pub fn from_row(row: &PgRow) -> Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            order_id: row.try_get("order_id")?,
            trade_id: row.try_get("trade_id")?,
            price_cents: row.try_get("price_cents")?,
            quantity: row.try_get("quantity")?,
            is_taker: row.try_get("is_taker")?,
            filled_at: row.try_get("filled_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct GroupRow {
    pub id: i64,
    pub session_id: i64,
    pub group_type: GroupType,
    pub state: GroupState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GroupRow {
    pub fn from_row(row: &PgRow) -> Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            session_id: row.try_get("session_id")?,
            group_type: GroupType::parse(row.try_get::<String, _>("group_type")?.as_str())
                .context("order_groups.group_type")?,
            state: GroupState::parse(row.try_get::<String, _>("state")?.as_str())
                .context("order_groups.state")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AuditRow {
    pub id: i64,
    pub order_id: i64,
    pub from_state: String,
    pub to_state: String,
    pub event: String,
    pub actor: String,
    pub details: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl AuditRow {
    pub fn from_row(row: &PgRow) -> Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            order_id: row.try_get("order_id")?,
            from_state: row.try_get("from_state")?,
            to_state: row.try_get("to_state")?,
            event: row.try_get("event")?,
            actor: row.try_get("actor")?,
            details: row.try_get("details")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

//! Durable record of an in-flight trade, keyed by its entry order id.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use super::{OrderKind, PositionSide};

/// A tracked trade. Created when an entry order is accepted, updated as
/// exits are attached, deleted once the exchange shows the trade is gone.
/// Remote order state is never cached here; it is re-fetched on demand.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedTrade {
    pub entry_order_id: i64,
    pub symbol: String,
    pub position_side: PositionSide,
    pub order_kind: OrderKind,
    /// Limit price; market entries record the fill price once known.
    pub entry_price: Option<Decimal>,
    pub quantity: Decimal,
    pub leverage: u32,
    /// Planned protection prices. Normally both present; a record missing
    /// them cannot have exits re-attached during recovery.
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub sl_order_id: Option<i64>,
    pub tp_order_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TrackedTrade {
    pub fn has_exits(&self) -> bool {
        self.sl_order_id.is_some() || self.tp_order_id.is_some()
    }
}

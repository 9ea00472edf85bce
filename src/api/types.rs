//! Wire types for the USDT-margined futures REST API.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::PositionSide;

/// Order side on the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// The side that closes a position held on the given position side.
    pub fn closing(position_side: PositionSide) -> Self {
        match position_side {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

/// Remote order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Expired,
    Rejected,
    #[serde(other)]
    Unknown,
}

impl OrderStatus {
    /// Canceled/expired/rejected: the order will never produce (more) fills.
    pub fn is_terminal_negative(&self) -> bool {
        matches!(
            self,
            OrderStatus::Canceled | OrderStatus::Expired | OrderStatus::Rejected
        )
    }

    pub fn has_fill(&self) -> bool {
        matches!(self, OrderStatus::PartiallyFilled | OrderStatus::Filled)
    }
}

/// An order as reported by the exchange. Never persisted; always re-fetched.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteOrder {
    pub order_id: i64,
    pub symbol: String,
    pub side: OrderSide,
    #[serde(default)]
    pub position_side: Option<PositionSide>,
    #[serde(rename = "type")]
    pub order_type: String,
    pub status: OrderStatus,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub close_position: bool,
    #[serde(default)]
    pub stop_price: Option<Decimal>,
    #[serde(default)]
    pub price: Option<Decimal>,
    /// Creation time in epoch milliseconds.
    #[serde(default)]
    pub time: i64,
    #[serde(default)]
    pub update_time: i64,
}

impl RemoteOrder {
    /// Whether this order is a protective closing order (stop or take-profit
    /// that reduces/closes a position). Some exits carry only `reduceOnly`.
    pub fn is_closing_order(&self) -> bool {
        let exit_type = matches!(
            self.order_type.as_str(),
            "STOP" | "STOP_MARKET" | "TAKE_PROFIT" | "TAKE_PROFIT_MARKET"
        );
        self.close_position || (self.reduce_only && exit_type)
    }

    /// Position side, derived from the order side when the exchange omits it.
    /// For closing orders BUY closes a SHORT; for entries BUY opens a LONG.
    pub fn effective_position_side(&self) -> PositionSide {
        if let Some(side) = self.position_side {
            return side;
        }
        match (self.is_closing_order(), self.side) {
            (true, OrderSide::Buy) | (false, OrderSide::Sell) => PositionSide::Short,
            (true, OrderSide::Sell) | (false, OrderSide::Buy) => PositionSide::Long,
        }
    }

    /// Creation time, falling back to the last update when absent.
    pub fn created_ms(&self) -> i64 {
        if self.time > 0 {
            self.time
        } else {
            self.update_time
        }
    }
}

/// Acknowledgment returned by order placement.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAck {
    pub order_id: i64,
    pub symbol: String,
    pub status: OrderStatus,
    #[serde(default)]
    pub avg_price: Option<Decimal>,
    #[serde(default)]
    pub executed_qty: Option<Decimal>,
}

/// Account snapshot: available margin and per-symbol positions.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    pub available_balance: Decimal,
    #[serde(default)]
    pub positions: Vec<AccountPosition>,
}

/// One position row from the account snapshot (hedge mode: LONG and SHORT
/// rows exist independently).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountPosition {
    pub symbol: String,
    pub position_amt: Decimal,
    #[serde(default)]
    pub position_side: Option<PositionSide>,
}

impl AccountPosition {
    pub fn effective_side(&self) -> Option<PositionSide> {
        self.position_side.or_else(|| {
            if self.position_amt > Decimal::ZERO {
                Some(PositionSide::Long)
            } else if self.position_amt < Decimal::ZERO {
                Some(PositionSide::Short)
            } else {
                None
            }
        })
    }
}

/// Price ticker response.
#[derive(Debug, Clone, Deserialize)]
pub struct TickerPrice {
    pub symbol: String,
    pub price: Decimal,
}

/// Exchange metadata for all symbols.
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeInfo {
    pub symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfo {
    pub symbol: String,
    pub status: String,
    #[serde(default)]
    pub contract_type: String,
    #[serde(default)]
    pub filters: Vec<SymbolFilter>,
}

impl SymbolInfo {
    /// Tradable perpetual or quarterly contract.
    pub fn is_active(&self) -> bool {
        self.status == "TRADING"
            && matches!(
                self.contract_type.as_str(),
                "PERPETUAL" | "CURRENT_QUARTER" | "NEXT_QUARTER"
            )
    }
}

/// Per-symbol trading rule filters.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "filterType")]
pub enum SymbolFilter {
    #[serde(rename = "PRICE_FILTER", rename_all = "camelCase")]
    Price {
        tick_size: Decimal,
        min_price: Decimal,
        max_price: Decimal,
    },
    #[serde(rename = "LOT_SIZE", rename_all = "camelCase")]
    LotSize {
        step_size: Decimal,
        min_qty: Decimal,
        max_qty: Decimal,
    },
    #[serde(rename = "MIN_NOTIONAL", rename_all = "camelCase")]
    MinNotional { notional: Decimal },
    #[serde(other)]
    Other,
}

/// Leverage bracket listing for one symbol.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolBrackets {
    pub symbol: String,
    #[serde(default)]
    pub brackets: Vec<LeverageBracket>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeverageBracket {
    pub initial_leverage: u32,
}

/// One income record (realized PnL, commission, funding fee, ...).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomeRecord {
    #[serde(default)]
    pub symbol: Option<String>,
    pub income_type: String,
    pub income: Decimal,
    pub time: i64,
}

/// A single closed candle, enough for true-range math.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candle {
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn closing_side_is_opposite() {
        assert_eq!(OrderSide::closing(PositionSide::Long), OrderSide::Sell);
        assert_eq!(OrderSide::closing(PositionSide::Short), OrderSide::Buy);
    }

    #[test]
    fn reduce_only_stop_counts_as_closing() {
        let order: RemoteOrder = serde_json::from_value(serde_json::json!({
            "orderId": 7, "symbol": "BTCUSDT", "side": "SELL",
            "type": "STOP_MARKET", "status": "NEW", "reduceOnly": true
        }))
        .unwrap();
        assert!(order.is_closing_order());
        assert_eq!(order.effective_position_side(), PositionSide::Long);
    }

    #[test]
    fn plain_limit_is_an_entry() {
        let order: RemoteOrder = serde_json::from_value(serde_json::json!({
            "orderId": 8, "symbol": "ETHUSDT", "side": "BUY",
            "type": "LIMIT", "status": "NEW", "time": 1234
        }))
        .unwrap();
        assert!(!order.is_closing_order());
        assert_eq!(order.effective_position_side(), PositionSide::Long);
        assert_eq!(order.created_ms(), 1234);
    }

    #[test]
    fn unknown_status_does_not_fail_deserialization() {
        let order: RemoteOrder = serde_json::from_value(serde_json::json!({
            "orderId": 9, "symbol": "BTCUSDT", "side": "BUY",
            "type": "LIMIT", "status": "PENDING_CANCEL"
        }))
        .unwrap();
        assert_eq!(order.status, OrderStatus::Unknown);
    }

    #[test]
    fn account_position_side_inferred_from_sign() {
        let pos = AccountPosition {
            symbol: "BTCUSDT".into(),
            position_amt: dec!(-0.5),
            position_side: None,
        };
        assert_eq!(pos.effective_side(), Some(PositionSide::Short));
    }
}

//! Attachment of protective exit orders after a fill.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::api::types::RemoteOrder;
use crate::api::{FuturesOrderType, NewOrderRequest};
use crate::models::PositionSide;

use super::EngineContext;

/// Exit order ids resulting from one attachment pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttachedExits {
    pub sl_order_id: Option<i64>,
    pub tp_order_id: Option<i64>,
    /// True when an existing closing order made this call a no-op.
    pub already_protected: bool,
}

/// Whether any of the given open orders already closes a position on
/// (symbol, side). This is the idempotency guard for attachment.
pub fn protection_exists(
    open_orders: &[RemoteOrder],
    symbol: &str,
    side: PositionSide,
) -> bool {
    open_orders
        .iter()
        .any(|o| o.symbol == symbol && o.is_closing_order() && o.effective_position_side() == side)
}

/// Attach the stop-loss and take-profit closing orders for a filled entry.
///
/// Scans live orders first: if a closing order already protects the
/// position the call is a no-op. Legs are submitted independently; on a
/// partial failure the placed leg stays live, the store records its id,
/// and the error is surfaced to the caller.
pub async fn attach_exits(
    ctx: &EngineContext,
    symbol: &str,
    position_side: PositionSide,
    stop_loss: Option<Decimal>,
    take_profit: Option<Decimal>,
    entry_order_id: i64,
) -> Result<AttachedExits> {
    let open = ctx
        .client
        .open_orders(symbol)
        .await
        .with_context(|| format!("Failed to list open orders for {}", symbol))?;
    if protection_exists(&open, symbol, position_side) {
        info!(
            symbol = %symbol,
            side = %position_side.as_str(),
            "Closing order already live, skipping exit attachment"
        );
        return Ok(AttachedExits {
            already_protected: true,
            ..Default::default()
        });
    }

    let mut attached = AttachedExits::default();
    let mut first_error = None;

    if let Some(stop) = stop_loss {
        let request = NewOrderRequest::closing_trigger(
            symbol,
            position_side,
            FuturesOrderType::StopMarket,
            stop,
        );
        match ctx.client.new_order(request).await {
            Ok(ack) => {
                info!(symbol = %symbol, order_id = ack.order_id, stop = %stop, "Stop loss attached");
                attached.sl_order_id = Some(ack.order_id);
            }
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "Stop loss placement failed");
                first_error = Some(anyhow::Error::from(e).context("Stop loss placement failed"));
            }
        }
    }

    if let Some(target) = take_profit {
        let request = NewOrderRequest::closing_trigger(
            symbol,
            position_side,
            FuturesOrderType::TakeProfitMarket,
            target,
        );
        match ctx.client.new_order(request).await {
            Ok(ack) => {
                info!(symbol = %symbol, order_id = ack.order_id, target = %target, "Take profit attached");
                attached.tp_order_id = Some(ack.order_id);
            }
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "Take profit placement failed");
                if first_error.is_none() {
                    first_error =
                        Some(anyhow::Error::from(e).context("Take profit placement failed"));
                }
            }
        }
    }

    if attached.sl_order_id.is_some() || attached.tp_order_id.is_some() {
        ctx.db
            .set_exit_orders(entry_order_id, attached.sl_order_id, attached.tp_order_id)
            .await?;
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(attached),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::types::OrderSide;

    fn order(json: serde_json::Value) -> RemoteOrder {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn guard_finds_existing_close_position_order() {
        let open = vec![order(serde_json::json!({
            "orderId": 1, "symbol": "BTCUSDT", "side": "SELL",
            "type": "STOP_MARKET", "status": "NEW",
            "closePosition": true, "positionSide": "LONG"
        }))];
        assert!(protection_exists(&open, "BTCUSDT", PositionSide::Long));
        assert!(!protection_exists(&open, "BTCUSDT", PositionSide::Short));
        assert!(!protection_exists(&open, "ETHUSDT", PositionSide::Long));
    }

    #[test]
    fn guard_ignores_entry_orders() {
        let open = vec![order(serde_json::json!({
            "orderId": 2, "symbol": "BTCUSDT", "side": "BUY",
            "type": "LIMIT", "status": "NEW"
        }))];
        assert!(!protection_exists(&open, "BTCUSDT", PositionSide::Long));
        assert_eq!(open[0].side, OrderSide::Buy);
    }

    #[test]
    fn guard_accepts_reduce_only_exit_without_position_side() {
        let open = vec![order(serde_json::json!({
            "orderId": 3, "symbol": "ETHUSDT", "side": "BUY",
            "type": "TAKE_PROFIT_MARKET", "status": "NEW",
            "reduceOnly": true
        }))];
        // BUY exit closes a short
        assert!(protection_exists(&open, "ETHUSDT", PositionSide::Short));
    }
}

//! Startup recovery: re-establish monitoring and protection for trades
//! persisted before the last shutdown.

use anyhow::Result;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};

use crate::api::types::{OrderStatus, RemoteOrder};
use crate::models::{OrderKind, TrackedTrade};

use super::monitor::{MonitorParams, MonitorSupervisor};
use super::{exits, position_amount, EngineContext};

/// What recovery decided for one persisted trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Remote order gone or terminal, or the position has closed.
    DropRecord,
    /// Entry still open and unfilled: relaunch a lifecycle monitor.
    RelaunchMonitor,
    /// Filled with a live position and no protection: re-attach exits.
    AttachExits,
    /// Filled and already protected.
    NoOp,
    /// Filled, unprotected, and the record lacks stop/target prices.
    /// Logged as a gap; never auto-corrected.
    UnrecoverableGap,
}

/// Pure decision table for one persisted trade.
pub fn plan_recovery(
    trade: &TrackedTrade,
    remote: Option<&RemoteOrder>,
    position_open: bool,
    protection_exists: bool,
) -> RecoveryAction {
    let Some(order) = remote else {
        return RecoveryAction::DropRecord;
    };
    if order.status.is_terminal_negative() {
        return RecoveryAction::DropRecord;
    }
    if trade.order_kind == OrderKind::Limit
        && matches!(order.status, OrderStatus::New | OrderStatus::PartiallyFilled)
    {
        return RecoveryAction::RelaunchMonitor;
    }
    if order.status.has_fill() {
        if !position_open {
            return RecoveryAction::DropRecord;
        }
        if protection_exists {
            return RecoveryAction::NoOp;
        }
        if trade.stop_loss.is_some() && trade.take_profit.is_some() {
            return RecoveryAction::AttachExits;
        }
        return RecoveryAction::UnrecoverableGap;
    }
    // open but not a limit-entry monitor case (e.g. unknown status): leave
    // it to the reconcile sweep
    RecoveryAction::NoOp
}

/// Walk every persisted trade and act on it. Failures are isolated per
/// trade; one symbol's error never aborts recovery for the rest.
pub async fn recover(ctx: &EngineContext, supervisor: &Arc<MonitorSupervisor>) -> Result<()> {
    let trades = ctx.db.list_trades().await?;
    if trades.is_empty() {
        info!("No persisted trades to recover");
        return Ok(());
    }
    info!(count = trades.len(), "Recovering persisted trades");

    for trade in trades {
        if let Err(e) = recover_one(ctx, supervisor, &trade).await {
            warn!(
                symbol = %trade.symbol,
                order_id = trade.entry_order_id,
                error = %e,
                "Recovery failed for trade, leaving it for the reconcile sweep"
            );
        }
    }
    info!("Recovery pass complete");
    Ok(())
}

async fn recover_one(
    ctx: &EngineContext,
    supervisor: &Arc<MonitorSupervisor>,
    trade: &TrackedTrade,
) -> Result<()> {
    let remote = match ctx
        .client
        .query_order(&trade.symbol, trade.entry_order_id)
        .await
    {
        Ok(order) => Some(order),
        // -2013: order does not exist
        Err(e) if e.exchange_code() == Some(-2013) => None,
        Err(e) => return Err(e.into()),
    };

    let (position_open, protection) = match &remote {
        Some(order) if order.status.has_fill() => {
            let amount = position_amount(&ctx.client, &trade.symbol, trade.position_side).await?;
            if amount > Decimal::ZERO {
                let open = ctx.client.open_orders(&trade.symbol).await?;
                let protected =
                    exits::protection_exists(&open, &trade.symbol, trade.position_side);
                (true, protected)
            } else {
                (false, false)
            }
        }
        _ => (false, false),
    };

    match plan_recovery(trade, remote.as_ref(), position_open, protection) {
        RecoveryAction::DropRecord => {
            info!(
                symbol = %trade.symbol,
                order_id = trade.entry_order_id,
                "Trade already resolved, dropping record"
            );
            ctx.db.delete_trade(trade.entry_order_id).await?;
        }
        RecoveryAction::RelaunchMonitor => {
            info!(
                symbol = %trade.symbol,
                order_id = trade.entry_order_id,
                "Relaunching monitor for open entry order"
            );
            supervisor
                .spawn(
                    ctx.clone(),
                    MonitorParams {
                        symbol: trade.symbol.clone(),
                        entry_order_id: trade.entry_order_id,
                        position_side: trade.position_side,
                        stop_loss: trade.stop_loss,
                        take_profit: trade.take_profit,
                    },
                )
                .await;
        }
        RecoveryAction::AttachExits => {
            info!(
                symbol = %trade.symbol,
                order_id = trade.entry_order_id,
                "Re-attaching missing exits"
            );
            exits::attach_exits(
                ctx,
                &trade.symbol,
                trade.position_side,
                trade.stop_loss,
                trade.take_profit,
                trade.entry_order_id,
            )
            .await?;
            ctx.notifier
                .send(&format!(
                    "Recovery re-attached exits for {} (order {})",
                    trade.symbol, trade.entry_order_id
                ))
                .await;
        }
        RecoveryAction::NoOp => {}
        RecoveryAction::UnrecoverableGap => {
            warn!(
                symbol = %trade.symbol,
                order_id = trade.entry_order_id,
                "Filled trade has no stop/target on record, cannot re-protect"
            );
            ctx.notifier
                .send(&format!(
                    "Recovery gap: {} (order {}) is filled but has no stop/target on record",
                    trade.symbol, trade.entry_order_id
                ))
                .await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PositionSide;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn trade(kind: OrderKind, with_prices: bool) -> TrackedTrade {
        TrackedTrade {
            entry_order_id: 42,
            symbol: "BTCUSDT".to_string(),
            position_side: PositionSide::Long,
            order_kind: kind,
            entry_price: Some(dec!(60000)),
            quantity: dec!(0.5),
            leverage: 20,
            stop_loss: with_prices.then(|| dec!(59000)),
            take_profit: with_prices.then(|| dec!(61500)),
            sl_order_id: None,
            tp_order_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn remote(status: &str) -> RemoteOrder {
        serde_json::from_value(serde_json::json!({
            "orderId": 42, "symbol": "BTCUSDT", "side": "BUY",
            "type": "LIMIT", "status": status, "positionSide": "LONG"
        }))
        .unwrap()
    }

    #[test]
    fn missing_or_terminal_order_drops_record() {
        let t = trade(OrderKind::Limit, true);
        assert_eq!(plan_recovery(&t, None, false, false), RecoveryAction::DropRecord);
        assert_eq!(
            plan_recovery(&t, Some(&remote("CANCELED")), false, false),
            RecoveryAction::DropRecord
        );
        assert_eq!(
            plan_recovery(&t, Some(&remote("EXPIRED")), false, false),
            RecoveryAction::DropRecord
        );
    }

    #[test]
    fn open_limit_order_relaunches_exactly_one_monitor() {
        let t = trade(OrderKind::Limit, true);
        assert_eq!(
            plan_recovery(&t, Some(&remote("NEW")), false, false),
            RecoveryAction::RelaunchMonitor
        );
        assert_eq!(
            plan_recovery(&t, Some(&remote("PARTIALLY_FILLED")), true, false),
            RecoveryAction::RelaunchMonitor
        );
    }

    #[test]
    fn filled_with_zero_position_drops_record() {
        let t = trade(OrderKind::Limit, true);
        assert_eq!(
            plan_recovery(&t, Some(&remote("FILLED")), false, false),
            RecoveryAction::DropRecord
        );
    }

    #[test]
    fn filled_and_already_protected_is_a_noop() {
        let t = trade(OrderKind::Market, true);
        assert_eq!(
            plan_recovery(&t, Some(&remote("FILLED")), true, true),
            RecoveryAction::NoOp
        );
    }

    #[test]
    fn filled_and_unprotected_reattaches_when_prices_exist() {
        let t = trade(OrderKind::Market, true);
        assert_eq!(
            plan_recovery(&t, Some(&remote("FILLED")), true, false),
            RecoveryAction::AttachExits
        );
    }

    #[test]
    fn missing_prices_are_an_unrecoverable_gap() {
        let t = trade(OrderKind::Market, false);
        assert_eq!(
            plan_recovery(&t, Some(&remote("FILLED")), true, false),
            RecoveryAction::UnrecoverableGap
        );
    }
}

//! Reconciliation sweep: converge exchange reality with persisted intent.
//!
//! Cancels two kinds of drift: closing orders whose position is gone
//! (orphaned exits) and entry orders unfilled past the auto-cancel age
//! (stale entries). Runs at startup and on a periodic interval; it is the
//! correctness backstop for every other component.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{info, warn};

use crate::api::types::RemoteOrder;
use crate::models::PositionSide;

use super::{ListingMode, EngineContext};

/// One canceled order, for the sweep report.
#[derive(Debug, Clone)]
pub struct CanceledOrder {
    pub symbol: String,
    pub order_id: i64,
    pub order_type: String,
    pub position_side: PositionSide,
}

/// Result of one sweep. Ephemeral; consumed for notification and logging.
#[derive(Debug, Default)]
pub struct ReconciliationReport {
    pub stale_entries: Vec<CanceledOrder>,
    pub orphan_exits: Vec<CanceledOrder>,
}

impl ReconciliationReport {
    pub fn is_empty(&self) -> bool {
        self.stale_entries.is_empty() && self.orphan_exits.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "Reconcile sweep: {} stale entries canceled, {} orphaned exits canceled",
            self.stale_entries.len(),
            self.orphan_exits.len()
        )
    }
}

/// What the sweep should do with one open order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Keep,
    CancelOrphanExit,
    CancelStaleEntry,
}

/// Classify an open order against the live position set and its age.
pub fn classify(
    order: &RemoteOrder,
    positions: &HashSet<(String, PositionSide)>,
    now_ms: i64,
    auto_cancel: Duration,
) -> Disposition {
    if order.is_closing_order() {
        let key = (order.symbol.clone(), order.effective_position_side());
        if positions.contains(&key) {
            Disposition::Keep
        } else {
            Disposition::CancelOrphanExit
        }
    } else {
        let created = order.created_ms();
        if created > 0 && now_ms - created >= auto_cancel.as_millis() as i64 {
            Disposition::CancelStaleEntry
        } else {
            Disposition::Keep
        }
    }
}

/// Enumerate open orders using the configured listing strategy. In the
/// per-symbol mode a symbol's repeated failure skips that symbol only.
async fn list_open_orders(ctx: &EngineContext) -> Result<Vec<RemoteOrder>> {
    match ctx.config.listing_mode {
        ListingMode::Bulk => ctx
            .client
            .all_open_orders()
            .await
            .context("Bulk open-order listing failed"),
        ListingMode::PerSymbol => {
            let symbols = ctx.metadata.active_symbols().await?;
            let policy = ctx.config.per_symbol_retry;
            let mut orders = Vec::new();
            for symbol in symbols {
                let mut attempt = 0;
                loop {
                    attempt += 1;
                    match ctx.client.open_orders(&symbol).await {
                        Ok(mut batch) => {
                            orders.append(&mut batch);
                            break;
                        }
                        Err(e) if attempt < policy.max_attempts => {
                            warn!(symbol = %symbol, attempt, error = %e, "Open-order listing retry");
                            tokio::time::sleep(policy.delay).await;
                        }
                        Err(e) => {
                            warn!(symbol = %symbol, error = %e, "Skipping symbol after repeated failures");
                            break;
                        }
                    }
                }
                if !ctx.config.per_symbol_throttle.is_zero() {
                    tokio::time::sleep(ctx.config.per_symbol_throttle).await;
                }
            }
            Ok(orders)
        }
    }
}

/// Non-zero live positions as a (symbol, side) set.
async fn live_position_set(ctx: &EngineContext) -> Result<HashSet<(String, PositionSide)>> {
    let account = ctx
        .client
        .account()
        .await
        .context("Failed to fetch account snapshot")?;
    Ok(account
        .positions
        .iter()
        .filter(|p| p.position_amt.abs() > Decimal::ZERO)
        .filter_map(|p| p.effective_side().map(|side| (p.symbol.clone(), side)))
        .collect())
}

/// Run one full sweep. Per-order failures are isolated; the sweep reports
/// what it actually canceled and notifies only when it acted.
pub async fn run_sweep(ctx: &EngineContext) -> Result<ReconciliationReport> {
    let open_orders = list_open_orders(ctx).await?;
    let positions = live_position_set(ctx).await?;
    info!(
        open_orders = open_orders.len(),
        positions = positions.len(),
        "Reconcile sweep started"
    );

    let now_ms = chrono::Utc::now().timestamp_millis();
    let mut report = ReconciliationReport::default();

    for order in &open_orders {
        let disposition = classify(order, &positions, now_ms, ctx.config.auto_cancel);
        if disposition == Disposition::Keep {
            continue;
        }
        match ctx.client.cancel_order(&order.symbol, order.order_id).await {
            Ok(_) => {
                let canceled = CanceledOrder {
                    symbol: order.symbol.clone(),
                    order_id: order.order_id,
                    order_type: order.order_type.clone(),
                    position_side: order.effective_position_side(),
                };
                match disposition {
                    Disposition::CancelOrphanExit => {
                        info!(symbol = %canceled.symbol, order_id = canceled.order_id, "Canceled orphaned exit");
                        report.orphan_exits.push(canceled);
                    }
                    Disposition::CancelStaleEntry => {
                        info!(symbol = %canceled.symbol, order_id = canceled.order_id, "Canceled stale entry");
                        if let Err(e) = ctx.db.delete_trade(order.order_id).await {
                            warn!(order_id = order.order_id, error = %e, "Failed to drop stale trade record");
                        }
                        report.stale_entries.push(canceled);
                    }
                    Disposition::Keep => unreachable!(),
                }
            }
            Err(e) => {
                warn!(
                    symbol = %order.symbol,
                    order_id = order.order_id,
                    error = %e,
                    "Cancel failed, order left for the next sweep"
                );
            }
        }
    }

    info!(
        stale = report.stale_entries.len(),
        orphans = report.orphan_exits.len(),
        "Reconcile sweep finished"
    );
    if !report.is_empty() {
        ctx.notifier.send(&report.summary()).await;
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(json: serde_json::Value) -> RemoteOrder {
        serde_json::from_value(json).unwrap()
    }

    fn positions(entries: &[(&str, PositionSide)]) -> HashSet<(String, PositionSide)> {
        entries
            .iter()
            .map(|(s, side)| (s.to_string(), *side))
            .collect()
    }

    const HOUR_MS: i64 = 3_600_000;

    #[test]
    fn exit_without_position_is_an_orphan() {
        let exit = order(serde_json::json!({
            "orderId": 1, "symbol": "BTCUSDT", "side": "SELL",
            "type": "STOP_MARKET", "status": "NEW",
            "closePosition": true, "positionSide": "LONG", "time": 1000
        }));
        let auto_cancel = Duration::from_secs(12 * 3600);
        assert_eq!(
            classify(&exit, &positions(&[]), 2000, auto_cancel),
            Disposition::CancelOrphanExit
        );
        assert_eq!(
            classify(
                &exit,
                &positions(&[("BTCUSDT", PositionSide::Long)]),
                2000,
                auto_cancel
            ),
            Disposition::Keep
        );
    }

    #[test]
    fn exit_side_mismatch_is_still_an_orphan() {
        let exit = order(serde_json::json!({
            "orderId": 2, "symbol": "BTCUSDT", "side": "BUY",
            "type": "TAKE_PROFIT_MARKET", "status": "NEW",
            "reduceOnly": true, "time": 1000
        }));
        // BUY exit closes a SHORT; only a LONG position is live
        assert_eq!(
            classify(
                &exit,
                &positions(&[("BTCUSDT", PositionSide::Long)]),
                2000,
                Duration::from_secs(60)
            ),
            Disposition::CancelOrphanExit
        );
    }

    #[test]
    fn old_entry_is_stale_recent_entry_is_kept() {
        let entry = order(serde_json::json!({
            "orderId": 3, "symbol": "ETHUSDT", "side": "BUY",
            "type": "LIMIT", "status": "NEW", "time": 1
        }));
        let auto_cancel = Duration::from_secs(12 * 3600);
        assert_eq!(
            classify(&entry, &positions(&[]), 13 * HOUR_MS, auto_cancel),
            Disposition::CancelStaleEntry
        );
        assert_eq!(
            classify(&entry, &positions(&[]), 11 * HOUR_MS, auto_cancel),
            Disposition::Keep
        );
    }

    #[test]
    fn entry_with_unknown_age_is_kept() {
        let entry = order(serde_json::json!({
            "orderId": 4, "symbol": "ETHUSDT", "side": "SELL",
            "type": "LIMIT", "status": "NEW"
        }));
        assert_eq!(
            classify(&entry, &positions(&[]), 99 * HOUR_MS, Duration::from_secs(1)),
            Disposition::Keep
        );
    }

    #[test]
    fn entry_age_ignores_positions() {
        // an aged entry is stale even while a position exists on the symbol
        let entry = order(serde_json::json!({
            "orderId": 5, "symbol": "BTCUSDT", "side": "BUY",
            "type": "LIMIT", "status": "PARTIALLY_FILLED", "time": 1
        }));
        assert_eq!(
            classify(
                &entry,
                &positions(&[("BTCUSDT", PositionSide::Long)]),
                13 * HOUR_MS,
                Duration::from_secs(12 * 3600)
            ),
            Disposition::CancelStaleEntry
        );
    }
}

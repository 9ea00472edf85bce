//! Long-running monitor for unfilled entry orders.
//!
//! One task per entry order. Detects fills and attaches exits, cleans up
//! after terminal order states, and cancels orders that sit unfilled past
//! the configured timeout. A supervisor owns every task handle so the bot
//! can enumerate and abort them on shutdown.

use anyhow::Result;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::models::PositionSide;

use super::{exits, position_amount, EngineContext};

/// Parameters for one monitored entry order.
#[derive(Debug, Clone)]
pub struct MonitorParams {
    pub symbol: String,
    pub entry_order_id: i64,
    pub position_side: PositionSide,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}

/// Registry of live monitor tasks, keyed by entry order id.
pub struct MonitorSupervisor {
    tasks: Mutex<HashMap<i64, JoinHandle<()>>>,
}

impl MonitorSupervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tasks: Mutex::new(HashMap::new()),
        })
    }

    /// Spawn a monitor task for the given entry order. A second spawn for
    /// the same order id replaces the first.
    pub async fn spawn(self: &Arc<Self>, ctx: EngineContext, params: MonitorParams) {
        let order_id = params.entry_order_id;
        let supervisor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if let Err(e) = monitor_entry_order(&ctx, &params).await {
                error!(
                    symbol = %params.symbol,
                    order_id = params.entry_order_id,
                    error = %e,
                    "Monitor task failed"
                );
            }
            supervisor.tasks.lock().await.remove(&order_id);
        });
        if let Some(previous) = self.tasks.lock().await.insert(order_id, handle) {
            warn!(order_id, "Replacing existing monitor task");
            previous.abort();
        }
    }

    pub async fn active_count(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Abort all monitor tasks. Used on graceful shutdown; recovery
    /// relaunches monitors for still-open orders on the next start.
    pub async fn shutdown(&self) {
        let mut tasks = self.tasks.lock().await;
        let count = tasks.len();
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
        if count > 0 {
            info!(count, "Aborted monitor tasks");
        }
    }
}

/// Poll one entry order until terminal.
///
/// Timeout is wall-clock from task start. A cancel that fails is logged
/// and left for the reconcile sweep; the task still ends.
async fn monitor_entry_order(ctx: &EngineContext, params: &MonitorParams) -> Result<()> {
    let symbol = params.symbol.as_str();
    let order_id = params.entry_order_id;
    info!(
        symbol = %symbol,
        order_id,
        timeout_secs = ctx.config.auto_cancel.as_secs(),
        "Monitoring entry order"
    );

    let started = Instant::now();
    let mut exits_attached = false;

    loop {
        tokio::time::sleep(ctx.config.monitor_poll_interval).await;

        let order = match ctx.client.query_order(symbol, order_id).await {
            Ok(order) => order,
            Err(e) => {
                warn!(symbol = %symbol, order_id, error = %e, "Order query failed, retrying");
                continue;
            }
        };

        if order.status.has_fill() {
            if !exits_attached {
                match exits::attach_exits(
                    ctx,
                    symbol,
                    params.position_side,
                    params.stop_loss,
                    params.take_profit,
                    order_id,
                )
                .await
                {
                    Ok(_) => {
                        exits_attached = true;
                        ctx.notifier
                            .send(&format!(
                                "Fill detected on {} (order {}), exits attached",
                                symbol, order_id
                            ))
                            .await;
                    }
                    Err(e) => {
                        warn!(symbol = %symbol, order_id, error = %e, "Exit attachment failed, will retry");
                    }
                }
            }
            if order.status == crate::api::types::OrderStatus::Filled {
                info!(symbol = %symbol, order_id, "Entry order fully filled");
                return Ok(());
            }
            // partially filled: keep polling until full fill or timeout
        } else if order.status.is_terminal_negative() {
            info!(symbol = %symbol, order_id, status = ?order.status, "Entry order terminal, dropping record");
            ctx.db.delete_trade(order_id).await?;
            return Ok(());
        }

        if started.elapsed() >= ctx.config.auto_cancel
            && order.status != crate::api::types::OrderStatus::Filled
        {
            return handle_timeout(ctx, params, exits_attached).await;
        }
    }
}

/// Cancel an entry order that outlived the timeout. Any partially filled
/// remainder must end up protected before the record is dropped.
async fn handle_timeout(
    ctx: &EngineContext,
    params: &MonitorParams,
    exits_attached: bool,
) -> Result<()> {
    let symbol = params.symbol.as_str();
    let order_id = params.entry_order_id;

    if let Err(e) = ctx.client.cancel_order(symbol, order_id).await {
        warn!(
            symbol = %symbol,
            order_id,
            error = %e,
            "Timeout cancel failed, leaving order for the reconcile sweep"
        );
        ctx.notifier
            .send(&format!(
                "Cancel of timed-out order {} on {} failed, reconcile will retry",
                order_id, symbol
            ))
            .await;
        return Ok(());
    }
    info!(symbol = %symbol, order_id, "Canceled entry order after timeout");

    let remainder = position_amount(&ctx.client, symbol, params.position_side)
        .await
        .unwrap_or(Decimal::ZERO);
    if remainder > Decimal::ZERO && !exits_attached {
        match exits::attach_exits(
            ctx,
            symbol,
            params.position_side,
            params.stop_loss,
            params.take_profit,
            order_id,
        )
        .await
        {
            Ok(_) => {
                ctx.notifier
                    .send(&format!(
                        "Timed-out order {} on {} canceled; exits attached for the partial fill",
                        order_id, symbol
                    ))
                    .await;
            }
            Err(e) => {
                // keep the record so recovery can retry protection
                error!(symbol = %symbol, order_id, error = %e, "Partial fill left unprotected");
                ctx.notifier
                    .send(&format!(
                        "Partial fill on {} (order {}) is unprotected, attachment failed",
                        symbol, order_id
                    ))
                    .await;
                return Ok(());
            }
        }
    } else if remainder == Decimal::ZERO {
        ctx.notifier
            .send(&format!(
                "Entry order {} on {} canceled after timeout",
                order_id, symbol
            ))
            .await;
    }

    ctx.db.delete_trade(order_id).await?;
    Ok(())
}

//! Execution orchestrator: turns an approved candidate trade into an
//! entry order with attached protection.
//!
//! Single pass, no backtracking: leverage negotiation, sizing, entry
//! submission, a short synchronous fill wait, then exit attachment or a
//! hand-off to the lifecycle monitor. Abort paths before submission leave
//! nothing behind on the exchange or in the store.

use anyhow::{Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::api::types::OrderSide;
use crate::api::NewOrderRequest;
use crate::models::{CandidateTrade, OrderKind, PositionSide, TrackedTrade, TradeAdvisor};

use super::monitor::{MonitorParams, MonitorSupervisor};
use super::risk::{self, SizingInputs, Targets};
use super::{exits, leverage, EngineContext};

pub struct Executor {
    ctx: EngineContext,
    monitors: Arc<MonitorSupervisor>,
    advisor: Option<Arc<dyn TradeAdvisor>>,
}

struct TradePlan {
    requested_leverage: u32,
    user_stop: Option<Decimal>,
    user_target: Option<Decimal>,
}

impl Executor {
    pub fn new(
        ctx: EngineContext,
        monitors: Arc<MonitorSupervisor>,
        advisor: Option<Arc<dyn TradeAdvisor>>,
    ) -> Self {
        Self {
            ctx,
            monitors,
            advisor,
        }
    }

    /// Execute one candidate trade end to end. Clean rejections (bad
    /// symbol, sizing failure, advisor veto) return Ok after notifying;
    /// only unexpected I/O failures propagate as errors.
    pub async fn execute(&self, candidate: CandidateTrade) -> Result<()> {
        let Some(side) = candidate.position_side() else {
            info!("Candidate has no actionable direction, ignoring");
            return Ok(());
        };
        let Some(symbol) = candidate.symbol.clone().filter(|s| !s.is_empty()) else {
            warn!("Candidate missing symbol, rejected");
            self.ctx.notifier.send("Signal rejected: no symbol").await;
            return Ok(());
        };
        if !self.ctx.metadata.is_valid_symbol(&symbol).await? {
            warn!(symbol = %symbol, "Symbol unknown or not tradable, rejected");
            self.ctx
                .notifier
                .send(&format!("Signal rejected: {} is not tradable", symbol))
                .await;
            return Ok(());
        }

        let ticker = self
            .ctx
            .client
            .ticker_price(&symbol)
            .await
            .with_context(|| format!("Failed to fetch price for {}", symbol))?;
        let reference_price = candidate.entry_price.unwrap_or(ticker.price);

        let Some(plan) = self.build_plan(&candidate, &symbol, ticker.price).await? else {
            return Ok(());
        };

        // 1. leverage: everything downstream uses the effective value
        let effective_leverage = match leverage::negotiate_leverage(
            &self.ctx.client,
            &self.ctx.metadata,
            &symbol,
            plan.requested_leverage,
        )
        .await
        {
            Ok(lv) => lv,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "Leverage negotiation failed, trade abandoned");
                self.ctx
                    .notifier
                    .send(&format!("Trade abandoned: leverage setup failed on {}", symbol))
                    .await;
                return Ok(());
            }
        };

        // 2. instrument rules
        let rule = self.ctx.metadata.rule(&symbol).await?;

        // 3. stop/target derivation
        let targets = match self
            .derive_targets(&candidate, &symbol, side, reference_price, &plan, &rule)
            .await
        {
            Ok(targets) => targets,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "Target derivation rejected the trade");
                self.ctx
                    .notifier
                    .send(&format!("Trade abandoned on {}: {}", symbol, e))
                    .await;
                return Ok(());
            }
        };
        for warning in &targets.warnings {
            info!(symbol = %symbol, "{}", warning);
        }

        // 4. quantity under exchange constraints and the margin cap
        let account = self.ctx.client.account().await?;
        let stop_distance = (reference_price - targets.stop_loss).abs();
        let quantity = match risk::derive_quantity(
            SizingInputs {
                available_margin: account.available_balance,
                leverage: effective_leverage,
                reference_price,
                stop_distance,
                mode: self.ctx.config.sizing_mode,
            },
            &rule,
            &self.ctx.config,
        ) {
            Ok(qty) => qty,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "Sizing rejected the trade");
                self.ctx
                    .notifier
                    .send(&format!("Trade abandoned on {}: {}", symbol, e))
                    .await;
                return Ok(());
            }
        };

        let entry_price = candidate
            .entry_price
            .map(|p| risk::round_entry(side, p, rule.tick_size));
        let stop_price = risk::round_stop(side, targets.stop_loss, rule.tick_size);
        let target_price = risk::round_target(side, targets.take_profit, rule.tick_size);
        let order_kind = if entry_price.is_some() {
            OrderKind::Limit
        } else {
            OrderKind::Market
        };

        // 5. submit entry and persist intent immediately
        let order_side = match side {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        };
        let request = match entry_price {
            Some(price) => NewOrderRequest::limit_entry(&symbol, order_side, side, quantity, price),
            None => NewOrderRequest::market_entry(&symbol, order_side, side, quantity),
        };
        let ack = self
            .ctx
            .client
            .new_order(request)
            .await
            .with_context(|| format!("Entry order submission failed for {}", symbol))?;
        info!(
            symbol = %symbol,
            order_id = ack.order_id,
            side = %side.as_str(),
            kind = order_kind.as_str(),
            quantity = %quantity,
            leverage = effective_leverage,
            "Entry order submitted"
        );

        let recorded_entry = entry_price.or_else(|| {
            ack.avg_price
                .filter(|p| *p > Decimal::ZERO)
                .or(Some(reference_price))
        });
        let now = Utc::now();
        self.ctx
            .db
            .upsert_trade(&TrackedTrade {
                entry_order_id: ack.order_id,
                symbol: symbol.clone(),
                position_side: side,
                order_kind,
                entry_price: recorded_entry,
                quantity,
                leverage: effective_leverage,
                stop_loss: Some(stop_price),
                take_profit: Some(target_price),
                sl_order_id: None,
                tp_order_id: None,
                created_at: now,
                updated_at: now,
            })
            .await?;
        self.ctx
            .notifier
            .send(&format!(
                "Entry submitted: {} {} {} x{} qty {} (order {})",
                symbol,
                side.as_str(),
                entry_price
                    .map(|p| format!("@{}", p))
                    .unwrap_or_else(|| "MARKET".to_string()),
                effective_leverage,
                quantity,
                ack.order_id
            ))
            .await;

        // 6. short synchronous fill wait
        match self
            .await_initial_fill(&symbol, ack.order_id, order_kind)
            .await?
        {
            FillOutcome::Filled => {}
            FillOutcome::Dead => return Ok(()),
            FillOutcome::Pending => {
                self.monitors
                    .spawn(
                        self.ctx.clone(),
                        MonitorParams {
                            symbol: symbol.clone(),
                            entry_order_id: ack.order_id,
                            position_side: side,
                            stop_loss: Some(stop_price),
                            take_profit: Some(target_price),
                        },
                    )
                    .await;
                info!(symbol = %symbol, order_id = ack.order_id, "Fill pending, handed off to monitor");
                return Ok(());
            }
        }

        // 7. immediate-trigger guard on the take-profit
        let take_profit = match self.ctx.client.ticker_price(&symbol).await {
            Ok(current) => {
                let triggers_now = match side {
                    PositionSide::Long => target_price <= current.price,
                    PositionSide::Short => target_price >= current.price,
                };
                if triggers_now {
                    warn!(
                        symbol = %symbol,
                        target = %target_price,
                        price = %current.price,
                        "Take profit would trigger immediately, attaching stop only"
                    );
                    self.ctx
                        .notifier
                        .send(&format!(
                            "Price too close to target on {}, attaching stop loss only",
                            symbol
                        ))
                        .await;
                    None
                } else {
                    Some(target_price)
                }
            }
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "Price check failed, attaching both exits");
                Some(target_price)
            }
        };

        // 8. attach exits
        let attached = exits::attach_exits(
            &self.ctx,
            &symbol,
            side,
            Some(stop_price),
            take_profit,
            ack.order_id,
        )
        .await?;
        if !attached.already_protected {
            self.ctx
                .notifier
                .send(&format!(
                    "Protection live on {}: SL {} (id {:?}), TP {} (id {:?})",
                    symbol,
                    stop_price,
                    attached.sl_order_id,
                    take_profit
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "skipped".to_string()),
                    attached.tp_order_id
                ))
                .await;
        }
        Ok(())
    }

    /// Resolve requested leverage and user-preferred targets, either from
    /// the external advisor or from the signal itself.
    async fn build_plan(
        &self,
        candidate: &CandidateTrade,
        symbol: &str,
        current_price: Decimal,
    ) -> Result<Option<TradePlan>> {
        let advisor = match self.advisor.as_ref() {
            Some(advisor) if !self.ctx.config.use_internal_risk => advisor,
            _ => {
                return Ok(Some(TradePlan {
                    requested_leverage: self
                        .ctx
                        .config
                        .requested_leverage(symbol, candidate.leverage),
                    user_stop: candidate.stop_loss,
                    user_target: candidate.take_profit,
                }));
            }
        };
        let verdict = advisor
            .review(candidate, current_price)
            .await
            .context("Advisor review failed")?;
        if !verdict.approve {
            info!(
                symbol = %symbol,
                reason = verdict.reason.as_deref().unwrap_or("none given"),
                "Advisor rejected the trade"
            );
            self.ctx
                .notifier
                .send(&format!(
                    "Trade on {} rejected by advisor: {}",
                    symbol,
                    verdict.reason.as_deref().unwrap_or("no reason")
                ))
                .await;
            return Ok(None);
        }
        let (Some(stop), Some(target), Some(lev)) =
            (verdict.stop_loss, verdict.take_profit, verdict.leverage)
        else {
            warn!(symbol = %symbol, "Advisor approval missing required fields, trade abandoned");
            self.ctx
                .notifier
                .send(&format!(
                    "Trade on {} abandoned: advisor approval was incomplete",
                    symbol
                ))
                .await;
            return Ok(None);
        };
        Ok(Some(TradePlan {
            requested_leverage: self.ctx.config.requested_leverage(symbol, Some(lev)),
            user_stop: Some(stop),
            user_target: Some(target),
        }))
    }

    async fn derive_targets(
        &self,
        candidate: &CandidateTrade,
        symbol: &str,
        side: PositionSide,
        reference_price: Decimal,
        plan: &TradePlan,
        rule: &crate::api::InstrumentRule,
    ) -> Result<Targets, risk::SizingError> {
        let bounds = Some((rule.min_price, rule.max_price));
        if self.ctx.config.use_internal_risk || self.advisor.is_none() {
            let limit = (self.ctx.config.atr_period as u32 + 20).max(60);
            let atr = match self
                .ctx
                .client
                .klines(symbol, &self.ctx.config.kline_interval, limit)
                .await
            {
                Ok(candles) => risk::average_true_range(&candles, self.ctx.config.atr_period),
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Candle fetch failed, using percentage floor");
                    None
                }
            };
            let floor = risk::distance_floor(reference_price, atr, &self.ctx.config);
            risk::select_targets(
                side,
                reference_price,
                plan.user_stop,
                plan.user_target,
                floor,
                bounds,
                &self.ctx.config,
            )
        } else {
            // advisor values still pass sanitation; a wrong-side stop from
            // the advisor is a hard rejection
            match plan.user_stop {
                Some(stop) => risk::sanitize_targets(
                    side,
                    reference_price,
                    stop,
                    plan.user_target,
                    bounds,
                    &self.ctx.config,
                ),
                None => Err(risk::SizingError::ZeroStopDistance),
            }
        }
    }

    /// Poll the fresh entry order for a short window. Market orders count
    /// as immediately filled; limit orders that outlive the window are
    /// handed off to the monitor. A terminal failure cleans up the record.
    async fn await_initial_fill(
        &self,
        symbol: &str,
        order_id: i64,
        kind: OrderKind,
    ) -> Result<FillOutcome> {
        if kind == OrderKind::Market {
            return Ok(FillOutcome::Filled);
        }
        let deadline = Instant::now() + self.ctx.config.initial_fill_wait;
        while Instant::now() < deadline {
            tokio::time::sleep(self.ctx.config.initial_poll_interval).await;
            let order = match self.ctx.client.query_order(symbol, order_id).await {
                Ok(order) => order,
                Err(e) => {
                    warn!(symbol = %symbol, order_id, error = %e, "Order poll failed");
                    continue;
                }
            };
            if order.status.has_fill() {
                info!(symbol = %symbol, order_id, status = ?order.status, "Entry filled within the initial window");
                return Ok(FillOutcome::Filled);
            }
            if order.status.is_terminal_negative() {
                warn!(symbol = %symbol, order_id, status = ?order.status, "Entry order died before filling");
                self.ctx.db.delete_trade(order_id).await?;
                self.ctx
                    .notifier
                    .send(&format!(
                        "Entry order {} on {} ended {:?} before filling",
                        order_id, symbol, order.status
                    ))
                    .await;
                return Ok(FillOutcome::Dead);
            }
        }
        Ok(FillOutcome::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FillOutcome {
    Filled,
    Pending,
    Dead,
}

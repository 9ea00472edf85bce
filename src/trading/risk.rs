//! Risk and sizing engine: stop/target derivation and conversion of a
//! margin budget into an exchange-compliant quantity.
//!
//! Everything here is pure computation over already-fetched data, so the
//! whole module is testable without a network.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::api::types::Candle;
use crate::api::InstrumentRule;
use crate::models::PositionSide;

use super::config::{SizingMode, TradingConfig};

/// Reasons a trade is abandoned before any order is placed.
#[derive(Debug, Error, PartialEq)]
pub enum SizingError {
    #[error("stop loss {stop} is on the wrong side of entry {entry} for {side:?}")]
    StopWrongSide {
        side: PositionSide,
        entry: Decimal,
        stop: Decimal,
    },
    #[error("stop distance is zero")]
    ZeroStopDistance,
    #[error("reference price must be positive")]
    InvalidReferencePrice,
    #[error("minimum quantity {min_qty} exceeds the margin cap of {max_qty}")]
    MinQtyOverMarginCap { min_qty: Decimal, max_qty: Decimal },
    #[error("quantity {required} needed for min notional exceeds the margin cap of {max_qty}")]
    NotionalOverMarginCap { required: Decimal, max_qty: Decimal },
    #[error("quantity fell below the minimum after margin capping")]
    CappedBelowMinQty,
}

/// Final stop/target pair plus any corrections applied along the way.
#[derive(Debug, Clone, PartialEq)]
pub struct Targets {
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub warnings: Vec<String>,
}

fn step_scale(step: Decimal) -> u32 {
    step.normalize().scale()
}

/// Round down to a multiple of `step`, keeping the step's scale so the
/// value serializes the way the exchange expects ("3.00", not "3").
pub fn floor_to_step(value: Decimal, step: Decimal) -> Decimal {
    let mut out = (value / step).floor() * step;
    out.rescale(step_scale(step));
    out
}

/// Round up to a multiple of `step`.
pub fn ceil_to_step(value: Decimal, step: Decimal) -> Decimal {
    let mut out = (value / step).ceil() * step;
    out.rescale(step_scale(step));
    out
}

/// Entry prices round toward a better fill: down for longs, up for shorts.
pub fn round_entry(side: PositionSide, price: Decimal, tick: Decimal) -> Decimal {
    match side {
        PositionSide::Long => floor_to_step(price, tick),
        PositionSide::Short => ceil_to_step(price, tick),
    }
}

/// Stops round toward entry so the trigger never loosens.
pub fn round_stop(side: PositionSide, price: Decimal, tick: Decimal) -> Decimal {
    match side {
        PositionSide::Long => ceil_to_step(price, tick),
        PositionSide::Short => floor_to_step(price, tick),
    }
}

/// Targets round toward entry as well.
pub fn round_target(side: PositionSide, price: Decimal, tick: Decimal) -> Decimal {
    match side {
        PositionSide::Long => floor_to_step(price, tick),
        PositionSide::Short => ceil_to_step(price, tick),
    }
}

/// Average true range over the last `period` candles. Needs `period + 1`
/// candles for the first previous close; returns None on short history.
pub fn average_true_range(candles: &[Candle], period: usize) -> Option<Decimal> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }
    let mut true_ranges = Vec::with_capacity(candles.len() - 1);
    let mut prev_close = candles[0].close;
    for candle in &candles[1..] {
        let hl = candle.high - candle.low;
        let hc = (candle.high - prev_close).abs();
        let cl = (prev_close - candle.low).abs();
        true_ranges.push(hl.max(hc).max(cl));
        prev_close = candle.close;
    }
    let tail = &true_ranges[true_ranges.len() - period..];
    let sum: Decimal = tail.iter().copied().sum();
    Some(sum / Decimal::from(period as u64))
}

/// Minimum stop distance: `max(ATR * k, entry * min_pct)`, degrading to
/// the percentage term when no ATR could be computed.
pub fn distance_floor(entry: Decimal, atr: Option<Decimal>, config: &TradingConfig) -> Decimal {
    let pct_floor = entry * config.min_stop_distance_pct;
    match atr {
        Some(atr) => (atr * config.atr_k).max(pct_floor),
        None => pct_floor,
    }
}

/// Validate and correct a stop/target pair.
///
/// A stop on the wrong side of entry is a hard error. The take-profit is
/// recomputed from `rr_default * stop_distance` when missing, on the wrong
/// side, or farther than `rr_max` times the default distance, then clamped
/// into the instrument's price bounds.
pub fn sanitize_targets(
    side: PositionSide,
    entry: Decimal,
    stop_loss: Decimal,
    take_profit: Option<Decimal>,
    price_bounds: Option<(Decimal, Decimal)>,
    config: &TradingConfig,
) -> Result<Targets, SizingError> {
    let is_long = side == PositionSide::Long;
    let stop_ok = if is_long {
        stop_loss < entry
    } else {
        stop_loss > entry
    };
    if !stop_ok {
        return Err(SizingError::StopWrongSide {
            side,
            entry,
            stop: stop_loss,
        });
    }

    let mut warnings = Vec::new();
    let stop_distance = (entry - stop_loss).abs();
    let default_tp = if is_long {
        entry + config.rr_default * stop_distance
    } else {
        entry - config.rr_default * stop_distance
    };
    let default_distance = (default_tp - entry).abs();

    let mut use_default = true;
    if let Some(tp) = take_profit {
        let right_side = if is_long { tp > entry } else { tp < entry };
        let within_reach = (tp - entry).abs() <= default_distance * config.rr_max;
        use_default = !(right_side && within_reach);
    }
    let mut tp = match (use_default, take_profit) {
        (false, Some(tp)) => tp,
        _ => {
            if take_profit.is_some() {
                warnings.push(format!("take profit recomputed to {}", default_tp));
            }
            default_tp
        }
    };

    if let Some((min_price, max_price)) = price_bounds {
        if min_price > Decimal::ZERO && tp < min_price {
            warnings.push(format!("take profit clamped up to min price {}", min_price));
            tp = min_price;
        }
        if max_price > Decimal::ZERO && tp > max_price {
            warnings.push(format!("take profit clamped down to max price {}", max_price));
            tp = max_price;
        }
    }

    Ok(Targets {
        stop_loss,
        take_profit: tp,
        warnings,
    })
}

/// Choose the final stop/target, preferring user-supplied values when they
/// pass the direction and distance-floor checks.
pub fn select_targets(
    side: PositionSide,
    entry: Decimal,
    user_stop: Option<Decimal>,
    user_target: Option<Decimal>,
    floor: Decimal,
    price_bounds: Option<(Decimal, Decimal)>,
    config: &TradingConfig,
) -> Result<Targets, SizingError> {
    let is_long = side == PositionSide::Long;
    let mut warnings = Vec::new();

    let stop_loss = match user_stop {
        Some(stop) => {
            let right_side = if is_long { stop < entry } else { stop > entry };
            let distance = (entry - stop).abs();
            if right_side && distance >= floor {
                stop
            } else {
                if right_side {
                    warnings.push(format!(
                        "user stop too close ({} < {}), recomputed at the floor",
                        distance, floor
                    ));
                } else {
                    warnings.push("user stop on the wrong side, recomputed".to_string());
                }
                if is_long {
                    entry - floor
                } else {
                    entry + floor
                }
            }
        }
        None => {
            if is_long {
                entry - floor
            } else {
                entry + floor
            }
        }
    };

    let mut targets = sanitize_targets(side, entry, stop_loss, user_target, price_bounds, config)?;
    warnings.append(&mut targets.warnings);
    targets.warnings = warnings;
    Ok(targets)
}

/// Inputs to quantity derivation.
#[derive(Debug, Clone, Copy)]
pub struct SizingInputs {
    pub available_margin: Decimal,
    pub leverage: u32,
    pub reference_price: Decimal,
    pub stop_distance: Decimal,
    pub mode: SizingMode,
}

/// Derive the order quantity, applying three sequential exchange-constraint
/// corrections: step rounding with a min-qty bump, a min-notional bump, and
/// a final hard cap at the margin budget. Every correction re-checks the
/// margin cap; any conflict rejects the trade rather than shrinking risk
/// controls.
pub fn derive_quantity(
    inputs: SizingInputs,
    rule: &InstrumentRule,
    config: &TradingConfig,
) -> Result<Decimal, SizingError> {
    if inputs.reference_price <= Decimal::ZERO {
        return Err(SizingError::InvalidReferencePrice);
    }
    let leverage = Decimal::from(inputs.leverage);
    let margin_budget = inputs.available_margin * config.max_margin_fraction;
    let max_qty_by_margin = margin_budget * leverage / inputs.reference_price;

    let raw = match inputs.mode {
        SizingMode::Margin => max_qty_by_margin,
        SizingMode::Risk => {
            if inputs.stop_distance <= Decimal::ZERO {
                return Err(SizingError::ZeroStopDistance);
            }
            let risk_amount = inputs.available_margin * config.risk_per_trade_fraction;
            (risk_amount / inputs.stop_distance).min(max_qty_by_margin)
        }
    };

    // (a) step rounding, bumping to the exchange minimum if affordable
    let mut qty = floor_to_step(raw, rule.step_size);
    if qty < rule.min_qty {
        if rule.min_qty > max_qty_by_margin {
            return Err(SizingError::MinQtyOverMarginCap {
                min_qty: rule.min_qty,
                max_qty: max_qty_by_margin,
            });
        }
        qty = ceil_to_step(rule.min_qty, rule.step_size);
    }

    // (b) minimum notional
    if rule.min_notional > Decimal::ZERO && inputs.reference_price * qty < rule.min_notional {
        let required = ceil_to_step(rule.min_notional / inputs.reference_price, rule.step_size);
        if required > max_qty_by_margin {
            return Err(SizingError::NotionalOverMarginCap {
                required,
                max_qty: max_qty_by_margin,
            });
        }
        qty = required;
    }

    // (c) final hard cap at the margin budget
    if qty > max_qty_by_margin {
        qty = floor_to_step(max_qty_by_margin, rule.step_size);
        if qty < rule.min_qty {
            return Err(SizingError::CappedBelowMinQty);
        }
    }

    Ok(qty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn rule() -> InstrumentRule {
        InstrumentRule {
            tick_size: dec!(0.1),
            min_price: dec!(0.1),
            max_price: dec!(1000000),
            step_size: dec!(0.01),
            min_qty: dec!(0.01),
            max_qty: dec!(100000),
            min_notional: dec!(5),
        }
    }

    fn config() -> TradingConfig {
        TradingConfig::default()
    }

    fn candles(values: &[(i64, i64, i64, i64)]) -> Vec<Candle> {
        values
            .iter()
            .map(|&(o, h, l, c)| Candle {
                open: Decimal::from(o),
                high: Decimal::from(h),
                low: Decimal::from(l),
                close: Decimal::from(c),
            })
            .collect()
    }

    #[test]
    fn margin_budget_scenario_yields_formatted_quantity() {
        // budget 30 USDT at 10x on a 100 USDT instrument: 3.0 contracts
        let qty = derive_quantity(
            SizingInputs {
                available_margin: dec!(1000),
                leverage: 10,
                reference_price: dec!(100),
                stop_distance: dec!(1),
                mode: SizingMode::Margin,
            },
            &rule(),
            &config(),
        )
        .unwrap();
        assert_eq!(qty.to_string(), "3.00");
    }

    #[test]
    fn implied_margin_never_exceeds_budget() {
        let cfg = config();
        let cases = [
            (dec!(1000), 10u32, dec!(100)),
            (dec!(250), 3, dec!(17.3)),
            (dec!(99999), 125, dec!(0.07)),
            (dec!(41), 1, dec!(5.5)),
        ];
        for (available, lev, price) in cases {
            let inputs = SizingInputs {
                available_margin: available,
                leverage: lev,
                reference_price: price,
                stop_distance: dec!(1),
                mode: SizingMode::Margin,
            };
            if let Ok(qty) = derive_quantity(inputs, &rule(), &cfg) {
                let implied_margin = price * qty / Decimal::from(lev);
                let budget = available * cfg.max_margin_fraction;
                let tolerance = price * rule().step_size / Decimal::from(lev);
                assert!(
                    implied_margin <= budget + tolerance,
                    "margin {} over budget {} (available={}, lev={}, price={})",
                    implied_margin,
                    budget,
                    available,
                    lev,
                    price
                );
            }
        }
    }

    #[test]
    fn min_notional_bump_respects_margin_cap() {
        // budget 30 at 1x on price 100: cap 0.3 contracts, but min notional
        // of 50 needs 0.5 contracts
        let mut restrictive = rule();
        restrictive.min_notional = dec!(50);
        let err = derive_quantity(
            SizingInputs {
                available_margin: dec!(1000),
                leverage: 1,
                reference_price: dec!(100),
                stop_distance: dec!(1),
                mode: SizingMode::Margin,
            },
            &restrictive,
            &config(),
        )
        .unwrap_err();
        assert!(matches!(err, SizingError::NotionalOverMarginCap { .. }));
    }

    #[test]
    fn min_qty_over_cap_rejects() {
        let mut restrictive = rule();
        restrictive.min_qty = dec!(10);
        restrictive.min_notional = Decimal::ZERO;
        let err = derive_quantity(
            SizingInputs {
                available_margin: dec!(100),
                leverage: 1,
                reference_price: dec!(100),
                stop_distance: dec!(1),
                mode: SizingMode::Margin,
            },
            &restrictive,
            &config(),
        )
        .unwrap_err();
        assert!(matches!(err, SizingError::MinQtyOverMarginCap { .. }));
    }

    #[test]
    fn risk_mode_rejects_zero_stop_distance() {
        let err = derive_quantity(
            SizingInputs {
                available_margin: dec!(1000),
                leverage: 10,
                reference_price: dec!(100),
                stop_distance: Decimal::ZERO,
                mode: SizingMode::Risk,
            },
            &rule(),
            &config(),
        )
        .unwrap_err();
        assert_eq!(err, SizingError::ZeroStopDistance);
    }

    #[test]
    fn atr_needs_period_plus_one_candles() {
        let data = candles(&[(100, 102, 99, 101); 14]);
        assert_eq!(average_true_range(&data, 14), None);
        let data = candles(&[(100, 102, 99, 101); 15]);
        assert!(average_true_range(&data, 14).is_some());
    }

    #[test]
    fn floor_uses_atr_when_it_dominates() {
        let mut cfg = config();
        cfg.min_stop_distance_pct = dec!(0.004);
        // entry 100: pct floor 0.4, ATR*k 0.6 wins
        assert_eq!(distance_floor(dec!(100), Some(dec!(0.6)), &cfg), dec!(0.6));
        // no ATR: pct only
        assert_eq!(distance_floor(dec!(100), None, &cfg), dec!(0.400));
    }

    #[test]
    fn close_user_stop_replaced_at_exactly_the_floor() {
        let targets = select_targets(
            PositionSide::Long,
            dec!(100),
            Some(dec!(99.7)), // distance 0.3 < floor 0.6
            None,
            dec!(0.6),
            None,
            &config(),
        )
        .unwrap();
        assert_eq!(targets.stop_loss, dec!(99.4));
        assert!(!targets.warnings.is_empty());

        let short = select_targets(
            PositionSide::Short,
            dec!(100),
            Some(dec!(100.3)),
            None,
            dec!(0.6),
            None,
            &config(),
        )
        .unwrap();
        assert_eq!(short.stop_loss, dec!(100.6));
    }

    #[test]
    fn valid_user_stop_is_honored() {
        let targets = select_targets(
            PositionSide::Long,
            dec!(100),
            Some(dec!(99)),
            None,
            dec!(0.6),
            None,
            &config(),
        )
        .unwrap();
        assert_eq!(targets.stop_loss, dec!(99));
        // TP derived from the final stop distance at rr 1.5
        assert_eq!(targets.take_profit, dec!(101.5));
    }

    #[test]
    fn wrong_side_stop_is_a_hard_error() {
        let err = sanitize_targets(
            PositionSide::Long,
            dec!(100),
            dec!(101),
            Some(dec!(103)),
            None,
            &config(),
        )
        .unwrap_err();
        assert!(matches!(err, SizingError::StopWrongSide { .. }));

        let err = sanitize_targets(
            PositionSide::Short,
            dec!(100),
            dec!(99),
            None,
            None,
            &config(),
        )
        .unwrap_err();
        assert!(matches!(err, SizingError::StopWrongSide { .. }));
    }

    #[test]
    fn runaway_take_profit_is_recomputed() {
        // stop distance 1, default tp distance 1.5, rr_max 3 allows 4.5
        let targets = sanitize_targets(
            PositionSide::Long,
            dec!(100),
            dec!(99),
            Some(dec!(110)),
            None,
            &config(),
        )
        .unwrap();
        assert_eq!(targets.take_profit, dec!(101.5));

        let kept = sanitize_targets(
            PositionSide::Long,
            dec!(100),
            dec!(99),
            Some(dec!(104)),
            None,
            &config(),
        )
        .unwrap();
        assert_eq!(kept.take_profit, dec!(104));
    }

    #[test]
    fn take_profit_clamped_into_price_bounds() {
        let targets = sanitize_targets(
            PositionSide::Long,
            dec!(100),
            dec!(99),
            Some(dec!(101)),
            Some((dec!(0.1), dec!(100.8))),
            &config(),
        )
        .unwrap();
        assert_eq!(targets.take_profit, dec!(100.8));
    }

    #[test]
    fn directional_rounding() {
        let tick = dec!(0.1);
        assert_eq!(round_entry(PositionSide::Long, dec!(100.17), tick), dec!(100.1));
        assert_eq!(round_entry(PositionSide::Short, dec!(100.11), tick), dec!(100.2));
        assert_eq!(round_stop(PositionSide::Long, dec!(99.42), tick), dec!(99.5));
        assert_eq!(round_stop(PositionSide::Short, dec!(100.68), tick), dec!(100.6));
        assert_eq!(round_target(PositionSide::Long, dec!(101.58), tick), dec!(101.5));
        assert_eq!(round_target(PositionSide::Short, dec!(98.42), tick), dec!(98.5));
    }

    #[test]
    fn step_rounding_keeps_step_scale() {
        assert_eq!(floor_to_step(dec!(3.0), dec!(0.01)).to_string(), "3.00");
        assert_eq!(ceil_to_step(dec!(0.051), dec!(0.01)).to_string(), "0.06");
    }
}

//! Trading configuration with conservative defaults.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::time::Duration;

use crate::api::RetryPolicy;

/// How the raw quantity is derived from the account budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizingMode {
    /// Initial margin per trade = available * max_margin_fraction.
    Margin,
    /// Risk amount per trade = available * risk_per_trade_fraction,
    /// divided by stop distance. Still margin-capped.
    Risk,
}

/// How open orders are enumerated during a reconcile sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingMode {
    /// Symbol-by-symbol with retries. Slow but resilient to rate limits.
    PerSymbol,
    /// Single bulk call. Fast, more likely to be blocked under load.
    Bulk,
}

#[derive(Debug, Clone)]
pub struct TradingConfig {
    /// Cap on initial margin per trade, as a fraction of available balance.
    pub max_margin_fraction: Decimal,
    pub risk_per_trade_fraction: Decimal,
    pub sizing_mode: SizingMode,

    /// Reward:risk ratio used when computing a take-profit.
    pub rr_default: Decimal,
    /// A user take-profit farther than rr_default * stop_distance * rr_max
    /// is discarded and recomputed.
    pub rr_max: Decimal,
    /// Minimum stop distance as a fraction of entry price.
    pub min_stop_distance_pct: Decimal,
    pub atr_period: usize,
    pub atr_k: Decimal,
    pub kline_interval: String,

    pub default_leverage: u32,
    pub leverage_overrides: HashMap<String, u32>,

    /// Entry orders unfilled past this age are canceled.
    pub auto_cancel: Duration,
    pub monitor_poll_interval: Duration,
    pub initial_fill_wait: Duration,
    pub initial_poll_interval: Duration,

    pub reconcile_interval: Duration,
    pub reconcile_jitter_secs: u64,
    pub listing_mode: ListingMode,
    pub per_symbol_retry: RetryPolicy,
    pub per_symbol_throttle: Duration,

    /// When false, an external advisor supplies stop/target/leverage.
    pub use_internal_risk: bool,
}

impl Default for TradingConfig {
    fn default() -> Self {
        let mut leverage_overrides = HashMap::new();
        leverage_overrides.insert("BTCUSDT".to_string(), 125);
        leverage_overrides.insert("ETHUSDT".to_string(), 125);
        leverage_overrides.insert("BNBUSDT".to_string(), 75);
        leverage_overrides.insert("SOLUSDT".to_string(), 100);

        Self {
            max_margin_fraction: dec!(0.03),
            risk_per_trade_fraction: dec!(0.03),
            sizing_mode: SizingMode::Margin,
            rr_default: dec!(1.5),
            rr_max: dec!(3.0),
            min_stop_distance_pct: dec!(0.004),
            atr_period: 14,
            atr_k: dec!(1.0),
            kline_interval: "5m".to_string(),
            default_leverage: 50,
            leverage_overrides,
            auto_cancel: Duration::from_secs(12 * 60 * 60),
            monitor_poll_interval: Duration::from_secs(30),
            initial_fill_wait: Duration::from_secs(60),
            initial_poll_interval: Duration::from_secs(1),
            reconcile_interval: Duration::from_secs(600),
            reconcile_jitter_secs: 6,
            listing_mode: ListingMode::PerSymbol,
            per_symbol_retry: RetryPolicy::default(),
            per_symbol_throttle: Duration::from_millis(0),
            use_internal_risk: true,
        }
    }
}

impl TradingConfig {
    /// Leverage to request for a signal: per-symbol override wins, then
    /// the signal's own value, then the default.
    pub fn requested_leverage(&self, symbol: &str, suggested: Option<u32>) -> u32 {
        if let Some(over) = self.leverage_overrides.get(symbol) {
            return *over;
        }
        suggested.unwrap_or(self.default_leverage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_beats_signal_leverage() {
        let config = TradingConfig::default();
        assert_eq!(config.requested_leverage("BTCUSDT", Some(20)), 125);
        assert_eq!(config.requested_leverage("DOGEUSDT", Some(20)), 20);
        assert_eq!(config.requested_leverage("DOGEUSDT", None), 50);
    }
}

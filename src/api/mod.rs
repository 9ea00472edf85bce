//! Exchange gateway: REST client, wire types, and instrument metadata cache.

pub mod futures_client;
pub mod types;

pub use futures_client::{FuturesClient, FuturesOrderType, GatewayError, NewOrderRequest};

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;

use types::{SymbolFilter, SymbolInfo};

/// Retry policy for per-symbol open-order enumeration.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            delay: Duration::from_millis(500),
        }
    }
}

/// Per-instrument trading rules extracted from exchange metadata.
#[derive(Debug, Clone, Copy)]
pub struct InstrumentRule {
    pub tick_size: Decimal,
    pub min_price: Decimal,
    pub max_price: Decimal,
    pub step_size: Decimal,
    pub min_qty: Decimal,
    pub max_qty: Decimal,
    pub min_notional: Decimal,
}

impl InstrumentRule {
    fn from_symbol_info(info: &SymbolInfo) -> Option<Self> {
        let mut tick = None;
        let mut price_bounds = None;
        let mut lot = None;
        let mut notional = None;
        for filter in &info.filters {
            match filter {
                SymbolFilter::Price {
                    tick_size,
                    min_price,
                    max_price,
                } => {
                    tick = Some(*tick_size);
                    price_bounds = Some((*min_price, *max_price));
                }
                SymbolFilter::LotSize {
                    step_size,
                    min_qty,
                    max_qty,
                } => lot = Some((*step_size, *min_qty, *max_qty)),
                SymbolFilter::MinNotional { notional: n } => notional = Some(*n),
                SymbolFilter::Other => {}
            }
        }
        let (min_price, max_price) = price_bounds?;
        let (step_size, min_qty, max_qty) = lot?;
        Some(Self {
            tick_size: tick?,
            min_price,
            max_price,
            step_size,
            min_qty,
            max_qty,
            min_notional: notional.unwrap_or(Decimal::ZERO),
        })
    }
}

/// Read-through cache of instrument rules, active symbols, and maximum
/// leverage. Metadata is fetched once per process and kept; there is no
/// eviction.
pub struct MetadataCache {
    client: Arc<FuturesClient>,
    rules: RwLock<HashMap<String, InstrumentRule>>,
    active: RwLock<HashSet<String>>,
    max_leverage: RwLock<HashMap<String, u32>>,
    loaded: RwLock<bool>,
}

impl MetadataCache {
    pub fn new(client: Arc<FuturesClient>) -> Self {
        Self {
            client,
            rules: RwLock::new(HashMap::new()),
            active: RwLock::new(HashSet::new()),
            max_leverage: RwLock::new(HashMap::new()),
            loaded: RwLock::new(false),
        }
    }

    async fn ensure_loaded(&self) -> Result<()> {
        if *self.loaded.read().await {
            return Ok(());
        }
        let info = self
            .client
            .exchange_info()
            .await
            .context("Failed to fetch exchange info")?;

        let mut rules = HashMap::new();
        let mut active = HashSet::new();
        for symbol in &info.symbols {
            if let Some(rule) = InstrumentRule::from_symbol_info(symbol) {
                rules.insert(symbol.symbol.clone(), rule);
            }
            if symbol.is_active() {
                active.insert(symbol.symbol.clone());
            }
        }
        info!(
            symbols = rules.len(),
            active = active.len(),
            "Loaded exchange metadata"
        );
        *self.rules.write().await = rules;
        *self.active.write().await = active;
        *self.loaded.write().await = true;
        Ok(())
    }

    /// Trading rules for one symbol.
    pub async fn rule(&self, symbol: &str) -> Result<InstrumentRule> {
        self.ensure_loaded().await?;
        self.rules
            .read()
            .await
            .get(symbol)
            .copied()
            .with_context(|| format!("No trading rules for symbol {}", symbol))
    }

    /// Whether the symbol exists and is currently tradable.
    pub async fn is_valid_symbol(&self, symbol: &str) -> Result<bool> {
        self.ensure_loaded().await?;
        Ok(self.active.read().await.contains(symbol))
    }

    /// All currently tradable symbols, for the reconcile sweep.
    pub async fn active_symbols(&self) -> Result<Vec<String>> {
        self.ensure_loaded().await?;
        let mut symbols: Vec<String> = self.active.read().await.iter().cloned().collect();
        symbols.sort();
        Ok(symbols)
    }

    /// Maximum initial leverage for a symbol, from the bracket listing.
    pub async fn max_leverage(&self, symbol: &str) -> Result<u32> {
        if let Some(max) = self.max_leverage.read().await.get(symbol) {
            return Ok(*max);
        }
        let brackets = self
            .client
            .leverage_brackets(symbol)
            .await
            .with_context(|| format!("Failed to fetch leverage brackets for {}", symbol))?;
        let max = brackets
            .iter()
            .filter(|b| b.symbol == symbol)
            .flat_map(|b| b.brackets.iter())
            .map(|b| b.initial_leverage)
            .max()
            .with_context(|| format!("Empty leverage brackets for {}", symbol))?;
        self.max_leverage
            .write()
            .await
            .insert(symbol.to_string(), max);
        Ok(max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn symbol_info(json: serde_json::Value) -> SymbolInfo {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn rule_extracted_from_filters() {
        let info = symbol_info(serde_json::json!({
            "symbol": "ZROUSDT",
            "status": "TRADING",
            "contractType": "PERPETUAL",
            "filters": [
                {"filterType": "PRICE_FILTER", "tickSize": "0.0001",
                 "minPrice": "0.0001", "maxPrice": "10000"},
                {"filterType": "LOT_SIZE", "stepSize": "0.01",
                 "minQty": "0.01", "maxQty": "100000"},
                {"filterType": "MIN_NOTIONAL", "notional": "5"},
                {"filterType": "PERCENT_PRICE", "multiplierUp": "1.1"}
            ]
        }));
        let rule = InstrumentRule::from_symbol_info(&info).unwrap();
        assert_eq!(rule.tick_size, dec!(0.0001));
        assert_eq!(rule.step_size, dec!(0.01));
        assert_eq!(rule.min_notional, dec!(5));
        assert!(info.is_active());
    }

    #[test]
    fn rule_requires_price_and_lot_filters() {
        let info = symbol_info(serde_json::json!({
            "symbol": "BROKEN",
            "status": "TRADING",
            "contractType": "PERPETUAL",
            "filters": [
                {"filterType": "MIN_NOTIONAL", "notional": "5"}
            ]
        }));
        assert!(InstrumentRule::from_symbol_info(&info).is_none());
    }

    #[test]
    fn settled_contract_is_not_active() {
        let info = symbol_info(serde_json::json!({
            "symbol": "OLDUSDT",
            "status": "SETTLING",
            "contractType": "PERPETUAL",
            "filters": []
        }));
        assert!(!info.is_active());
    }
}

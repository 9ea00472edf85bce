//! Aggregation of income records into a PnL summary.

use rust_decimal::Decimal;
use std::collections::BTreeMap;

use crate::api::types::IncomeRecord;

const REALIZED_PNL: &str = "REALIZED_PNL";

/// Aggregated income over a time window.
#[derive(Debug, Default, PartialEq)]
pub struct PnlSummary {
    /// Net income across all record types.
    pub total: Decimal,
    pub by_type: BTreeMap<String, Decimal>,
    /// Realized PnL per symbol.
    pub realized_by_symbol: BTreeMap<String, Decimal>,
}

pub fn aggregate(records: &[IncomeRecord]) -> PnlSummary {
    let mut summary = PnlSummary::default();
    for record in records {
        summary.total += record.income;
        *summary
            .by_type
            .entry(record.income_type.clone())
            .or_default() += record.income;
        if record.income_type == REALIZED_PNL {
            if let Some(symbol) = &record.symbol {
                *summary
                    .realized_by_symbol
                    .entry(symbol.clone())
                    .or_default() += record.income;
            }
        }
    }
    summary
}

impl PnlSummary {
    pub fn format(&self) -> String {
        let mut out = format!("Net income: {} USDT\n", self.total.round_dp(4));
        out.push_str("By type:\n");
        for (income_type, amount) in &self.by_type {
            out.push_str(&format!("  {}: {}\n", income_type, amount.round_dp(4)));
        }
        if !self.realized_by_symbol.is_empty() {
            out.push_str("Realized PnL by symbol:\n");
            for (symbol, amount) in &self.realized_by_symbol {
                out.push_str(&format!("  {}: {}\n", symbol, amount.round_dp(4)));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn record(symbol: Option<&str>, income_type: &str, income: Decimal) -> IncomeRecord {
        IncomeRecord {
            symbol: symbol.map(str::to_string),
            income_type: income_type.to_string(),
            income,
            time: 0,
        }
    }

    #[test]
    fn sums_by_type_and_symbol() {
        let records = vec![
            record(Some("BTCUSDT"), "REALIZED_PNL", dec!(12.5)),
            record(Some("BTCUSDT"), "COMMISSION", dec!(-0.4)),
            record(Some("ETHUSDT"), "REALIZED_PNL", dec!(-3.0)),
            record(None, "FUNDING_FEE", dec!(0.2)),
        ];
        let summary = aggregate(&records);
        assert_eq!(summary.total, dec!(9.3));
        assert_eq!(summary.by_type["REALIZED_PNL"], dec!(9.5));
        assert_eq!(summary.realized_by_symbol["BTCUSDT"], dec!(12.5));
        assert_eq!(summary.realized_by_symbol["ETHUSDT"], dec!(-3.0));
        assert!(!summary.by_type.contains_key("TRANSFER"));
    }

    #[test]
    fn empty_window_is_all_zero() {
        let summary = aggregate(&[]);
        assert_eq!(summary.total, Decimal::ZERO);
        assert!(summary.by_type.is_empty());
    }
}

//! Signal intake types and the external advisor seam.
//!
//! Message ingestion and parsing live outside this process; candidates
//! arrive as JSON with whatever fields the parser managed to extract.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;

use super::PositionSide;

/// Colloquial names rewritten to standard tickers before symbol lookup.
const ALIASES: &[(&str, &str)] = &[
    ("大餅", "BTC"),
    ("比特幣", "BTC"),
    ("比特", "BTC"),
    ("姨太", "ETH"),
    ("以太", "ETH"),
    ("二餅", "ETH"),
];

/// Rewrite known symbol aliases in raw signal text.
pub fn normalize_aliases(text: &str) -> String {
    let mut out = text.to_string();
    for (alias, ticker) in ALIASES {
        if out.contains(alias) {
            out = out.replace(alias, ticker);
        }
    }
    out
}

/// Direction extracted from a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalAction {
    Buy,
    Sell,
    #[serde(other)]
    Ignore,
}

/// A parsed trade candidate. Optional fields reflect what the upstream
/// parser could extract; the orchestrator validates the rest.
#[derive(Debug, Clone, Deserialize)]
pub struct CandidateTrade {
    pub action: SignalAction,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub entry_price: Option<Decimal>,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    #[serde(default)]
    pub leverage: Option<u32>,
    #[serde(default)]
    pub raw_text: String,
}

impl CandidateTrade {
    /// Position side implied by the action, if actionable.
    pub fn position_side(&self) -> Option<PositionSide> {
        match self.action {
            SignalAction::Buy => Some(PositionSide::Long),
            SignalAction::Sell => Some(PositionSide::Short),
            SignalAction::Ignore => None,
        }
    }
}

/// Verdict from an external risk advisor. Missing fields on an approval
/// abort the trade; approvals never get defaults filled in.
#[derive(Debug, Clone, Deserialize)]
pub struct AdvisorVerdict {
    pub approve: bool,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    #[serde(default)]
    pub leverage: Option<u32>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// External advisor consulted instead of the internal risk engine when
/// configured. Implementations typically call out to a model service.
#[async_trait]
pub trait TradeAdvisor: Send + Sync {
    async fn review(
        &self,
        candidate: &CandidateTrade,
        current_price: Decimal,
    ) -> anyhow::Result<AdvisorVerdict>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_rewritten_in_place() {
        assert_eq!(normalize_aliases("大餅 多單 60000"), "BTC 多單 60000");
        assert_eq!(normalize_aliases("no alias here"), "no alias here");
    }

    #[test]
    fn candidate_parses_with_missing_fields() {
        let candidate: CandidateTrade = serde_json::from_str(
            r#"{"action": "BUY", "symbol": "BTCUSDT", "raw_text": "long btc"}"#,
        )
        .unwrap();
        assert_eq!(candidate.action, SignalAction::Buy);
        assert_eq!(candidate.position_side(), Some(PositionSide::Long));
        assert!(candidate.entry_price.is_none());
    }

    #[test]
    fn unknown_action_is_ignored() {
        let candidate: CandidateTrade =
            serde_json::from_str(r#"{"action": "HOLD", "raw_text": ""}"#).unwrap();
        assert_eq!(candidate.action, SignalAction::Ignore);
        assert_eq!(candidate.position_side(), None);
    }
}

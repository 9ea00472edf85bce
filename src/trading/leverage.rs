//! Leverage negotiation against exchange-imposed caps.

use anyhow::{bail, Result};
use tracing::{info, warn};

use crate::api::{FuturesClient, GatewayError, MetadataCache};

/// Exchange error: requested leverage exceeds the symbol's cap.
const ERR_LEVERAGE_OVER_CAP: i64 = -4028;
/// Exchange error: leverage already set to this value. Treated as success.
const ERR_LEVERAGE_UNCHANGED: i64 = -4048;

/// Common leverage tiers, tried in descending order during fallback.
const FALLBACK_LADDER: [u32; 13] = [125, 100, 75, 50, 40, 30, 25, 20, 10, 5, 3, 2, 1];

/// Candidate list for fallback: the discovered maximum first, then the
/// ladder, filtered to values at or below the original request, deduped.
pub fn fallback_candidates(requested: u32, discovered_max: Option<u32>) -> Vec<u32> {
    let mut candidates = Vec::with_capacity(FALLBACK_LADDER.len() + 1);
    let mut push = |lv: u32| {
        if lv > 0 && lv <= requested && !candidates.contains(&lv) {
            candidates.push(lv);
        }
    };
    if let Some(max) = discovered_max {
        push(max);
    }
    for lv in FALLBACK_LADDER {
        push(lv);
    }
    candidates
}

async fn try_set(
    client: &FuturesClient,
    symbol: &str,
    leverage: u32,
) -> Result<bool, GatewayError> {
    match client.change_leverage(symbol, leverage).await {
        Ok(()) => Ok(true),
        Err(e) if e.exchange_code() == Some(ERR_LEVERAGE_UNCHANGED) => Ok(true),
        Err(e) if e.exchange_code().is_some() => {
            warn!(symbol = %symbol, leverage, error = %e, "Leverage candidate rejected");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Set leverage on the symbol, falling back through the candidate ladder
/// when the request exceeds the instrument's cap. Returns the effective
/// leverage; all downstream sizing must use this value, never the request.
pub async fn negotiate_leverage(
    client: &FuturesClient,
    metadata: &MetadataCache,
    symbol: &str,
    requested: u32,
) -> Result<u32> {
    match client.change_leverage(symbol, requested).await {
        Ok(()) => return Ok(requested),
        Err(e) if e.exchange_code() == Some(ERR_LEVERAGE_UNCHANGED) => return Ok(requested),
        Err(e) if e.exchange_code() == Some(ERR_LEVERAGE_OVER_CAP) => {
            info!(symbol = %symbol, requested, "Leverage over cap, starting fallback");
        }
        Err(e) => return Err(e.into()),
    }

    // Bracket discovery failing is not fatal; the ladder alone still covers
    // every tier the exchange is likely to accept.
    let discovered_max = match metadata.max_leverage(symbol).await {
        Ok(max) => Some(max),
        Err(e) => {
            warn!(symbol = %symbol, error = %e, "Max leverage discovery failed, using ladder only");
            None
        }
    };

    for candidate in fallback_candidates(requested, discovered_max) {
        if try_set(client, symbol, candidate).await? {
            if candidate != requested {
                info!(
                    symbol = %symbol,
                    requested,
                    effective = candidate,
                    "Leverage fell back"
                );
            }
            return Ok(candidate);
        }
    }

    bail!(
        "Leverage negotiation failed for {}: no candidate at or below {}x was accepted",
        symbol,
        requested
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovered_max_tried_first() {
        let candidates = fallback_candidates(80, Some(60));
        assert_eq!(candidates[0], 60);
        assert!(candidates.iter().all(|&lv| lv <= 80));
    }

    #[test]
    fn candidates_never_exceed_the_request() {
        let candidates = fallback_candidates(50, Some(125));
        assert!(candidates.iter().all(|&lv| lv <= 50));
        assert_eq!(candidates[0], 50);
    }

    #[test]
    fn candidates_are_deduped_and_bounded() {
        let candidates = fallback_candidates(125, Some(100));
        let mut seen = candidates.clone();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), candidates.len());
        assert!(candidates.len() <= FALLBACK_LADDER.len() + 1);
    }

    #[test]
    fn tiny_request_leaves_only_the_floor() {
        assert_eq!(fallback_candidates(1, None), vec![1]);
        assert_eq!(fallback_candidates(4, Some(20)), vec![3, 2, 1]);
    }
}

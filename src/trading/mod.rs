//! Trading engine: sizing, leverage negotiation, execution, lifecycle
//! monitoring, reconciliation, and startup recovery.

pub mod config;
pub mod executor;
pub mod exits;
pub mod leverage;
pub mod monitor;
pub mod pnl;
pub mod reconcile;
pub mod recovery;
pub mod risk;

pub use config::{ListingMode, SizingMode, TradingConfig};

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::sync::Arc;

use crate::api::{FuturesClient, MetadataCache};
use crate::db::Database;
use crate::models::PositionSide;
use crate::notify::Notifier;

/// Shared handles threaded through the engine's task families.
#[derive(Clone)]
pub struct EngineContext {
    pub client: Arc<FuturesClient>,
    pub metadata: Arc<MetadataCache>,
    pub db: Arc<Database>,
    pub notifier: Arc<Notifier>,
    pub config: Arc<TradingConfig>,
}

/// Live position amount for (symbol, side), zero when absent.
pub(crate) async fn position_amount(
    client: &FuturesClient,
    symbol: &str,
    side: PositionSide,
) -> Result<Decimal> {
    let account = client
        .account()
        .await
        .context("Failed to fetch account snapshot")?;
    Ok(account
        .positions
        .iter()
        .filter(|p| p.symbol == symbol && p.effective_side() == Some(side))
        .map(|p| p.position_amt.abs())
        .sum())
}

//! SQLite persistence for tracked trades.
//!
//! One row per in-flight trade, keyed by the entry order id. Decimal
//! values are stored as TEXT and converted at the row boundary.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{FromRow, SqlitePool};
use std::str::FromStr;
use tracing::info;

use crate::models::{OrderKind, PositionSide, TrackedTrade};

pub struct Database {
    pool: SqlitePool,
}

#[derive(Debug, FromRow)]
struct StoredTrade {
    entry_order_id: String,
    symbol: String,
    position_side: String,
    order_kind: String,
    entry_price: Option<String>,
    quantity: String,
    leverage: i64,
    stop_loss: Option<String>,
    take_profit: Option<String>,
    sl_order_id: Option<i64>,
    tp_order_id: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<StoredTrade> for TrackedTrade {
    type Error = anyhow::Error;

    fn try_from(row: StoredTrade) -> Result<Self> {
        let decimal = |s: &str, field: &str| {
            Decimal::from_str(s).with_context(|| format!("Invalid {} in stored trade: {}", field, s))
        };
        Ok(TrackedTrade {
            entry_order_id: row
                .entry_order_id
                .parse()
                .context("Invalid entry order id in stored trade")?,
            position_side: PositionSide::parse(&row.position_side)
                .with_context(|| format!("Invalid position side: {}", row.position_side))?,
            order_kind: OrderKind::parse(&row.order_kind)
                .with_context(|| format!("Invalid order kind: {}", row.order_kind))?,
            entry_price: row
                .entry_price
                .as_deref()
                .map(|s| decimal(s, "entry price"))
                .transpose()?,
            quantity: decimal(&row.quantity, "quantity")?,
            leverage: row.leverage as u32,
            stop_loss: row
                .stop_loss
                .as_deref()
                .map(|s| decimal(s, "stop loss"))
                .transpose()?,
            take_profit: row
                .take_profit
                .as_deref()
                .map(|s| decimal(s, "take profit"))
                .transpose()?,
            symbol: row.symbol,
            sl_order_id: row.sl_order_id,
            tp_order_id: row.tp_order_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl Database {
    /// Open (or create) the database and run migrations.
    pub async fn new(database_url: &str) -> Result<Self> {
        // one connection: sqlite serializes writers anyway, and in-memory
        // databases live and die with their connection
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .connect(database_url)
            .await
            .with_context(|| format!("Failed to connect to database: {}", database_url))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tracked_trades (
                entry_order_id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                position_side TEXT NOT NULL,
                order_kind TEXT NOT NULL,
                entry_price TEXT,
                quantity TEXT NOT NULL,
                leverage INTEGER NOT NULL,
                stop_loss TEXT,
                take_profit TEXT,
                sl_order_id INTEGER,
                tp_order_id INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("Failed to run migrations")?;

        info!(url = %database_url, "Database ready");
        Ok(Self { pool })
    }

    /// Insert or replace a tracked trade.
    pub async fn upsert_trade(&self, trade: &TrackedTrade) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO tracked_trades (
                entry_order_id, symbol, position_side, order_kind,
                entry_price, quantity, leverage, stop_loss, take_profit,
                sl_order_id, tp_order_id, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(trade.entry_order_id.to_string())
        .bind(&trade.symbol)
        .bind(trade.position_side.as_str())
        .bind(trade.order_kind.as_str())
        .bind(trade.entry_price.map(|p| p.to_string()))
        .bind(trade.quantity.to_string())
        .bind(trade.leverage as i64)
        .bind(trade.stop_loss.map(|p| p.to_string()))
        .bind(trade.take_profit.map(|p| p.to_string()))
        .bind(trade.sl_order_id)
        .bind(trade.tp_order_id)
        .bind(trade.created_at)
        .bind(trade.updated_at)
        .execute(&self.pool)
        .await
        .context("Failed to upsert trade")?;
        Ok(())
    }

    /// Fetch one trade by entry order id.
    pub async fn get_trade(&self, entry_order_id: i64) -> Result<Option<TrackedTrade>> {
        let row: Option<StoredTrade> =
            sqlx::query_as("SELECT * FROM tracked_trades WHERE entry_order_id = ?")
                .bind(entry_order_id.to_string())
                .fetch_optional(&self.pool)
                .await
                .context("Failed to fetch trade")?;
        row.map(TrackedTrade::try_from).transpose()
    }

    /// Record the exit order ids after attachment.
    pub async fn set_exit_orders(
        &self,
        entry_order_id: i64,
        sl_order_id: Option<i64>,
        tp_order_id: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE tracked_trades SET sl_order_id = ?, tp_order_id = ?, updated_at = ? \
             WHERE entry_order_id = ?",
        )
        .bind(sl_order_id)
        .bind(tp_order_id)
        .bind(Utc::now())
        .bind(entry_order_id.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to update exit order ids")?;
        Ok(())
    }

    /// Record the observed fill price for a market entry.
    pub async fn set_entry_price(&self, entry_order_id: i64, price: Decimal) -> Result<()> {
        sqlx::query(
            "UPDATE tracked_trades SET entry_price = ?, updated_at = ? WHERE entry_order_id = ?",
        )
        .bind(price.to_string())
        .bind(Utc::now())
        .bind(entry_order_id.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to update entry price")?;
        Ok(())
    }

    /// Remove a trade record.
    pub async fn delete_trade(&self, entry_order_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM tracked_trades WHERE entry_order_id = ?")
            .bind(entry_order_id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to delete trade")?;
        Ok(())
    }

    /// All tracked trades, oldest first. Loaded in full at startup.
    pub async fn list_trades(&self) -> Result<Vec<TrackedTrade>> {
        let rows: Vec<StoredTrade> =
            sqlx::query_as("SELECT * FROM tracked_trades ORDER BY created_at ASC")
                .fetch_all(&self.pool)
                .await
                .context("Failed to list trades")?;
        rows.into_iter().map(TrackedTrade::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_trade(id: i64) -> TrackedTrade {
        TrackedTrade {
            entry_order_id: id,
            symbol: "BTCUSDT".to_string(),
            position_side: PositionSide::Long,
            order_kind: OrderKind::Limit,
            entry_price: Some(dec!(60000.5)),
            quantity: dec!(3.00),
            leverage: 50,
            stop_loss: Some(dec!(59000)),
            take_profit: Some(dec!(62000)),
            sl_order_id: None,
            tp_order_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn round_trip_preserves_decimals() {
        let db = Database::new("sqlite::memory:").await.unwrap();
        let trade = sample_trade(1001);
        db.upsert_trade(&trade).await.unwrap();

        let loaded = db.get_trade(1001).await.unwrap().unwrap();
        assert_eq!(loaded.symbol, trade.symbol);
        assert_eq!(loaded.entry_price, Some(dec!(60000.5)));
        assert_eq!(loaded.quantity, dec!(3.00));
        assert_eq!(loaded.quantity.to_string(), "3.00");
        assert_eq!(loaded.position_side, PositionSide::Long);
        assert!(!loaded.has_exits());
    }

    #[tokio::test]
    async fn exit_ids_are_recorded() {
        let db = Database::new("sqlite::memory:").await.unwrap();
        db.upsert_trade(&sample_trade(2002)).await.unwrap();

        db.set_exit_orders(2002, Some(31), Some(32)).await.unwrap();
        let loaded = db.get_trade(2002).await.unwrap().unwrap();
        assert_eq!(loaded.sl_order_id, Some(31));
        assert_eq!(loaded.tp_order_id, Some(32));
        assert!(loaded.has_exits());
    }

    #[tokio::test]
    async fn delete_and_list() {
        let db = Database::new("sqlite::memory:").await.unwrap();
        db.upsert_trade(&sample_trade(1)).await.unwrap();
        db.upsert_trade(&sample_trade(2)).await.unwrap();

        db.delete_trade(1).await.unwrap();
        let all = db.list_trades().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].entry_order_id, 2);
        assert!(db.get_trade(1).await.unwrap().is_none());
    }
}

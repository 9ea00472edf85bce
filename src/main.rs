mod api;
mod bot;
mod db;
mod models;
mod notify;
mod trading;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use bot::Bot;
use trading::{pnl, reconcile, TradingConfig};

#[derive(Parser)]
#[command(name = "futpilot")]
#[command(about = "Signal-driven USDT-margined futures execution bot")]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Database URL for trade state
    #[arg(
        long,
        env = "FUTPILOT_DATABASE_URL",
        default_value = "sqlite:futpilot.db?mode=rwc"
    )]
    database_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bot: recovery, reconcile loop, and stdin signal intake
    Run,
    /// Execute a single candidate trade given as a JSON object
    Execute {
        /// Candidate JSON, e.g. '{"action":"BUY","symbol":"BTCUSDT",...}'
        signal: String,
    },
    /// Run one reconciliation sweep and exit
    Reconcile,
    /// List tracked trades
    Status,
    /// Realized PnL summary over the last N days
    Pnl {
        #[arg(long, default_value_t = 1)]
        days: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = TradingConfig::default();
    let bot = Bot::new(config, &cli.database_url).await?;

    match cli.command {
        Commands::Run => bot.run().await,
        Commands::Execute { signal } => {
            let candidate = serde_json::from_str(&signal)?;
            bot.execute_once(candidate).await
        }
        Commands::Reconcile => {
            let report = reconcile::run_sweep(bot.context()).await?;
            println!("{}", report.summary());
            for order in &report.stale_entries {
                println!(
                    "  stale entry: {} {} order {}",
                    order.symbol, order.order_type, order.order_id
                );
            }
            for order in &report.orphan_exits {
                println!(
                    "  orphaned exit: {} {} order {}",
                    order.symbol, order.order_type, order.order_id
                );
            }
            Ok(())
        }
        Commands::Status => {
            let trades = bot.context().db.list_trades().await?;
            if trades.is_empty() {
                println!("No tracked trades.");
                return Ok(());
            }
            for trade in trades {
                println!(
                    "{} {} {} qty {} x{} entry {} SL {} TP {} exits {:?}/{:?}",
                    trade.entry_order_id,
                    trade.symbol,
                    trade.position_side.as_str(),
                    trade.quantity,
                    trade.leverage,
                    trade
                        .entry_price
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "market".to_string()),
                    trade
                        .stop_loss
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    trade
                        .take_profit
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    trade.sl_order_id,
                    trade.tp_order_id,
                );
            }
            Ok(())
        }
        Commands::Pnl { days } => {
            let end = chrono::Utc::now().timestamp_millis();
            let start = end - i64::from(days) * 24 * 3_600_000;
            let records = bot.context().client.income_history(start, end).await?;
            let summary = pnl::aggregate(&records);
            println!("{}", summary.format());
            Ok(())
        }
    }
}

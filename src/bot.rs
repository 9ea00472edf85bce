//! Bot runner: wires the gateway, store, and engine together and drives
//! the signal intake, monitor, and reconcile loops.

use anyhow::{Context, Result};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use crate::api::{FuturesClient, MetadataCache};
use crate::db::Database;
use crate::models::signal::normalize_aliases;
use crate::models::CandidateTrade;
use crate::notify::Notifier;
use crate::trading::executor::Executor;
use crate::trading::monitor::MonitorSupervisor;
use crate::trading::{reconcile, recovery, EngineContext, TradingConfig};

pub struct Bot {
    ctx: EngineContext,
    executor: Executor,
    monitors: Arc<MonitorSupervisor>,
    shutdown: Arc<AtomicBool>,
}

impl Bot {
    /// Build the full engine from env credentials and the given store.
    pub async fn new(config: TradingConfig, database_url: &str) -> Result<Self> {
        let api_key = std::env::var("BINANCE_API_KEY").context("BINANCE_API_KEY is not set")?;
        let api_secret =
            std::env::var("BINANCE_API_SECRET").context("BINANCE_API_SECRET is not set")?;

        let client = Arc::new(FuturesClient::new(api_key, api_secret)?);
        let metadata = Arc::new(MetadataCache::new(Arc::clone(&client)));
        let db = Arc::new(Database::new(database_url).await?);
        let notifier = Arc::new(Notifier::from_env());

        let ctx = EngineContext {
            client,
            metadata,
            db,
            notifier,
            config: Arc::new(config),
        };
        let monitors = MonitorSupervisor::new();
        let executor = Executor::new(ctx.clone(), Arc::clone(&monitors), None);

        Ok(Self {
            ctx,
            executor,
            monitors,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    /// Execute a single candidate without entering the signal loop.
    pub async fn execute_once(&self, candidate: CandidateTrade) -> Result<()> {
        self.executor.execute(candidate).await
    }

    /// Full service loop: recovery, startup sweep, periodic reconcile,
    /// and newline-delimited JSON candidates on stdin until Ctrl-C.
    pub async fn run(&self) -> Result<()> {
        recovery::recover(&self.ctx, &self.monitors).await?;
        match reconcile::run_sweep(&self.ctx).await {
            Ok(report) => info!("{}", report.summary()),
            Err(e) => error!(error = %e, "Startup reconcile sweep failed"),
        }

        let reconcile_task = {
            let ctx = self.ctx.clone();
            let shutdown = Arc::clone(&self.shutdown);
            tokio::spawn(async move {
                loop {
                    let jitter =
                        rand::thread_rng().gen_range(0..=ctx.config.reconcile_jitter_secs);
                    tokio::time::sleep(ctx.config.reconcile_interval + Duration::from_secs(jitter))
                        .await;
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    if let Err(e) = reconcile::run_sweep(&ctx).await {
                        error!(error = %e, "Reconcile sweep failed");
                    }
                }
            })
        };

        info!("Reading signal candidates from stdin (one JSON object per line)");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    break;
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => self.handle_signal_line(&line).await,
                        Ok(None) => {
                            info!("Signal input closed");
                            break;
                        }
                        Err(e) => {
                            error!(error = %e, "Signal input failed");
                            break;
                        }
                    }
                }
            }
        }

        self.shutdown.store(true, Ordering::Relaxed);
        reconcile_task.abort();
        let active = self.monitors.active_count().await;
        if active > 0 {
            info!(active, "Stopping monitor tasks; recovery resumes them on the next start");
        }
        self.monitors.shutdown().await;
        info!("Bot stopped");
        Ok(())
    }

    async fn handle_signal_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let mut candidate: CandidateTrade = match serde_json::from_str(line) {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!(error = %e, "Discarding malformed signal line");
                return;
            }
        };
        candidate.raw_text = normalize_aliases(&candidate.raw_text);
        if let Err(e) = self.executor.execute(candidate).await {
            error!(error = %e, "Trade execution failed");
            self.ctx
                .notifier
                .send(&format!("Trade execution failed: {}", e))
                .await;
        }
    }
}

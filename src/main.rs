// =============================================================================
// Perp Ingest — Main Entry Point
// =============================================================================
//
// Resolves the USDT perpetual universe once, then runs the REST backfill and
// the live kline consumer side by side against the same SQLite store.
// Ctrl+C cancels both; each path stops at its next safe point.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod binance;
mod error;
mod ingest;
mod progress;
mod runtime_config;
mod store;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::binance::{FuturesClient, RateLimiter};
use crate::ingest::{universe, BackfillEngine, LiveStreamConsumer};
use crate::progress::IngestProgress;
use crate::runtime_config::IngestConfig;
use crate::store::SqliteStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Perp Ingest — Starting Up                         ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = IngestConfig::load("ingest_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        IngestConfig::default()
    });
    config.apply_env_overrides();

    info!(
        run_mode = %config.run_mode,
        db_path = %config.db_path,
        subscription_mode = %config.live.subscription_mode,
        lookback_days = config.backfill.lookback_days,
        "Ingest configuration"
    );

    // ── 2. Store, rate limiter, REST client ──────────────────────────────
    let store = Arc::new(SqliteStore::open(&config.db_path)?);
    match store.checkpoints().await {
        Ok(rows) => info!(
            db = %store.location(),
            checkpoints = rows.len(),
            "Existing backfill checkpoints"
        ),
        Err(e) => warn!(error = %e, "Could not read backfill checkpoints"),
    }
    let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));

    let api_key = std::env::var("BINANCE_API_KEY").ok();
    if api_key.is_none() {
        info!("BINANCE_API_KEY not set, using anonymous market-data access");
    }
    let client = Arc::new(FuturesClient::new(
        api_key.as_deref(),
        config.rest_base_url.clone(),
        limiter.clone(),
    )?);

    let progress = Arc::new(IngestProgress::new());

    // ── 3. Symbol universe (fatal on failure) ────────────────────────────
    let universe = match universe::resolve(client.as_ref(), &config.universe).await {
        Ok(u) => Arc::new(u),
        Err(e) => {
            error!(error = %e, "Symbol discovery failed, nothing to ingest");
            return Err(e.into());
        }
    };

    // ── 4. Shutdown & status ─────────────────────────────────────────────
    let cancel = CancellationToken::new();

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received...");
                cancel.cancel();
            }
        });
    }

    let status_handle = {
        let progress = progress.clone();
        let limiter = limiter.clone();
        let cancel = cancel.clone();
        let period = Duration::from_secs(config.status_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        progress.log_summary();
                        let rl = limiter.snapshot();
                        info!(
                            total_requests = rl.total_requests,
                            window_requests = rl.window_requests,
                            used_weight_1m = rl.used_weight_1m,
                            long_pauses = rl.long_pauses,
                            "rate limiter status"
                        );
                    }
                }
            }
        })
    };

    // ── 5. Backfill path ─────────────────────────────────────────────────
    let backfill_handle = if config.run_mode.runs_backfill() {
        let engine = BackfillEngine::new(
            client.clone(),
            store.clone(),
            store.clone(),
            limiter.clone(),
            progress.clone(),
            config.backfill.clone(),
        );
        let universe = universe.clone();
        let cancel = cancel.clone();
        Some(tokio::spawn(async move {
            let result = engine.run(&universe, &cancel).await;
            match &result {
                Ok(report) => {
                    info!(
                        completed = report.completed.len(),
                        failed = report.failed.len(),
                        rows = report.rows_written,
                        interrupted = report.interrupted,
                        "Backfill pass finished"
                    );
                    for (symbol, reason) in &report.failed {
                        warn!(symbol = %symbol, reason = %reason, "symbol not backfilled");
                    }
                }
                Err(e) => {
                    error!(error = %e, "Backfill halted");
                    cancel.cancel();
                }
            }
            result
        }))
    } else {
        None
    };

    // ── 6. Live path ─────────────────────────────────────────────────────
    let live_handle = if config.run_mode.runs_live() {
        let consumer = LiveStreamConsumer::new(
            store.clone(),
            progress.clone(),
            config.live.clone(),
            config.ws_base_url.clone(),
        );
        let universe = universe.clone();
        let cancel = cancel.clone();
        Some(tokio::spawn(async move {
            let result = consumer.run(&universe, &cancel).await;
            if let Err(e) = &result {
                error!(error = %e, "Live consumer halted");
                cancel.cancel();
            }
            result
        }))
    } else {
        None
    };

    info!(
        symbols = universe.len(),
        "All ingestion paths running. Press Ctrl+C to stop."
    );

    // ── 7. Wait for both paths ───────────────────────────────────────────
    let mut failed = false;

    if let Some(handle) = backfill_handle {
        failed |= !matches!(handle.await, Ok(Ok(_)));
    }
    if let Some(handle) = live_handle {
        failed |= !matches!(handle.await, Ok(Ok(())));
    }

    cancel.cancel();
    let _ = status_handle.await;
    progress.log_summary();

    if failed {
        anyhow::bail!("ingestion stopped on a fatal error");
    }

    info!("Perp Ingest shut down complete.");
    Ok(())
}

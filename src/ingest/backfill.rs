// =============================================================================
// Backfill Engine — checkpointed historical pagination per symbol
// =============================================================================
//
// Per symbol: Idle → Fetching → Persisting → {Fetching | Completed | Failed}.
//
// Ordering guarantee: a page is upserted first and the checkpoint advanced
// second, so an interruption between the two only causes the page to be
// fetched again on the next run. Cancellation is observed only while waiting
// (rate-limit delay, request in flight, retry delay), never between the two
// writes.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::binance::RateLimiter;
use crate::error::IngestError;
use crate::progress::{BackfillState, IngestProgress};
use crate::runtime_config::BackfillConfig;
use crate::store::{CandleStore, CheckpointStore};
use crate::types::{Candle, SymbolUniverse};

/// Request/response source of historical 1-minute candles.
#[async_trait]
pub trait KlineSource: Send + Sync {
    /// Up to `limit` consecutive candles with `timestamp >= start_ms`, oldest
    /// first.
    async fn fetch_klines(
        &self,
        symbol: &str,
        start_ms: i64,
        limit: u32,
    ) -> Result<Vec<Candle>, IngestError>;
}

/// How a single symbol's pass ended (errors are returned separately).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolOutcome {
    Completed { rows: u64 },
    Interrupted { rows: u64 },
}

/// Summary of one backfill pass over the universe.
#[derive(Debug, Clone, Default)]
pub struct BackfillReport {
    pub completed: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub rows_written: u64,
    pub interrupted: bool,
}

pub struct BackfillEngine {
    source: Arc<dyn KlineSource>,
    candles: Arc<dyn CandleStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    limiter: Arc<RateLimiter>,
    progress: Arc<IngestProgress>,
    config: BackfillConfig,
}

impl BackfillEngine {
    pub fn new(
        source: Arc<dyn KlineSource>,
        candles: Arc<dyn CandleStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        limiter: Arc<RateLimiter>,
        progress: Arc<IngestProgress>,
        config: BackfillConfig,
    ) -> Self {
        Self {
            source,
            candles,
            checkpoints,
            limiter,
            progress,
            config,
        }
    }

    /// Backfill every symbol up to the current time.
    pub async fn run(
        &self,
        universe: &SymbolUniverse,
        cancel: &CancellationToken,
    ) -> Result<BackfillReport, IngestError> {
        self.run_until(universe, Utc::now().timestamp_millis(), cancel)
            .await
    }

    /// Backfill every symbol up to `now_ms`, sequentially.
    ///
    /// Symbol-level failures are recorded in the report and the pass moves on;
    /// a persistence failure aborts the pass because the store is shared.
    pub async fn run_until(
        &self,
        universe: &SymbolUniverse,
        now_ms: i64,
        cancel: &CancellationToken,
    ) -> Result<BackfillReport, IngestError> {
        info!(
            symbols = universe.len(),
            until = %format_ms(now_ms),
            lookback_days = self.config.lookback_days,
            "backfill pass starting"
        );

        let mut report = BackfillReport::default();

        for symbol in universe.symbols() {
            if cancel.is_cancelled() {
                report.interrupted = true;
                break;
            }

            match self.backfill_symbol(symbol, now_ms, cancel).await {
                Ok(SymbolOutcome::Completed { rows }) => {
                    report.rows_written += rows;
                    report.completed.push(symbol.clone());
                }
                Ok(SymbolOutcome::Interrupted { rows }) => {
                    report.rows_written += rows;
                    report.interrupted = true;
                    break;
                }
                Err(e) => {
                    self.progress.update_symbol(symbol, |p| {
                        p.state = BackfillState::Failed;
                        p.last_error = Some(e.to_string());
                    });
                    error!(symbol = %symbol, error = %e, "backfill failed for symbol");
                    if e.is_fatal() {
                        return Err(e);
                    }
                    report.failed.push((symbol.clone(), e.to_string()));
                }
            }
        }

        if report.interrupted {
            warn!(
                completed = report.completed.len(),
                rows = report.rows_written,
                "backfill pass interrupted"
            );
        } else {
            info!(
                completed = report.completed.len(),
                failed = report.failed.len(),
                rows = report.rows_written,
                "backfill pass complete"
            );
        }
        Ok(report)
    }

    async fn backfill_symbol(
        &self,
        symbol: &str,
        now_ms: i64,
        cancel: &CancellationToken,
    ) -> Result<SymbolOutcome, IngestError> {
        let mut checkpoint = self.checkpoints.get(symbol).await?;
        let mut cursor = match checkpoint {
            Some(ts) => ts + 1,
            None => now_ms - self.config.lookback_ms(),
        };

        self.progress.update_symbol(symbol, |p| {
            p.state = BackfillState::Idle;
            p.cursor_ms = cursor;
            p.checkpoint_ms = checkpoint;
        });
        info!(
            symbol,
            from = %format_ms(cursor),
            resumed = checkpoint.is_some(),
            "backfill symbol starting"
        );

        let mut rows_total = 0u64;

        while cursor < now_ms {
            self.progress.set_state(symbol, BackfillState::Fetching);
            let Some(page) = self.fetch_page(symbol, cursor, cancel).await? else {
                info!(symbol, at = %format_ms(cursor), "backfill symbol interrupted");
                return Ok(SymbolOutcome::Interrupted { rows: rows_total });
            };

            // Still-forming minutes are left to the next pass (or the live path).
            let page: Vec<Candle> = page
                .into_iter()
                .filter(|c| c.timestamp >= cursor && c.is_closed_at(now_ms))
                .collect();
            let Some(last_ts) = page.iter().map(|c| c.timestamp).max() else {
                break;
            };

            self.progress.set_state(symbol, BackfillState::Persisting);
            let written = self.candles.upsert_batch(page).await?;
            if checkpoint.map_or(true, |cp| last_ts > cp) {
                self.checkpoints.set(symbol, last_ts).await?;
                checkpoint = Some(last_ts);
            }

            rows_total += written as u64;
            cursor = last_ts + 1;
            self.progress.update_symbol(symbol, |p| {
                p.cursor_ms = cursor;
                p.checkpoint_ms = checkpoint;
                p.rows_written += written as u64;
                p.pages += 1;
            });
            info!(symbol, rows = written, "downloaded up to {}", format_ms(last_ts));
        }

        self.progress.set_state(symbol, BackfillState::Completed);
        info!(
            symbol,
            rows = rows_total,
            checkpoint = ?checkpoint,
            "backfill symbol completed"
        );
        Ok(SymbolOutcome::Completed { rows: rows_total })
    }

    /// Fetch one page, retrying transient failures indefinitely.
    /// Returns `None` when cancelled before a page arrived.
    async fn fetch_page(
        &self,
        symbol: &str,
        cursor: i64,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<Candle>>, IngestError> {
        let mut attempt = 0u64;
        loop {
            let request = async {
                self.limiter.before_request().await;
                self.source
                    .fetch_klines(symbol, cursor, self.config.page_limit)
                    .await
            };
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                r = request => r,
            };

            let e = match result {
                Ok(page) => return Ok(Some(page)),
                Err(e) if e.is_transient() => e,
                Err(e) => return Err(e),
            };

            attempt += 1;
            self.progress.update_symbol(symbol, |p| {
                p.retries += 1;
                p.last_error = Some(e.to_string());
            });
            warn!(symbol, start_ms = cursor, attempt, error = %e, "request failed — retrying");

            let wait = async {
                match &e {
                    IngestError::RateLimited { retry_after, .. } => {
                        self.limiter.on_rate_limited(*retry_after).await
                    }
                    _ => tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await,
                }
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                _ = wait => {}
            }
        }
    }
}

/// Human-readable UTC time for progress logs.
pub fn format_ms(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| ms.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

// =============================================================================
// Live Stream Consumer — 1m kline WebSocket streams written through the store
// =============================================================================
//
// One task per connection. Multiplexed mode packs many `<sym>@kline_1m`
// streams into each combined-stream connection; per-symbol mode opens one
// connection per symbol. Either way every decoded update is upserted, so the
// row for the forming minute is overwritten until the candle closes.
//
// Live writes never touch checkpoints; gaps left by disconnects are the
// backfill path's job on its next run.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::task::JoinSet;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::binance::client::parse_str_f64;
use crate::error::IngestError;
use crate::progress::{IngestProgress, StreamStatus};
use crate::runtime_config::LiveConfig;
use crate::store::CandleStore;
use crate::types::{Candle, SubscriptionMode, SymbolUniverse};

const KLINE_STREAM: &str = "@kline_1m";

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A decoded kline update.
#[derive(Debug, Clone, PartialEq)]
pub struct KlineEvent {
    pub candle: Candle,
    /// The exchange marked this candle as closed.
    pub is_final: bool,
}

/// Decode one text frame.
///
/// Accepts both the combined-stream envelope and a bare payload. Returns
/// `Ok(None)` for anything that is not a kline event (subscription acks,
/// other event kinds).
///
/// Expected shape:
/// ```json
/// { "e": "kline", "s": "ARBUSDT", "k": { "t": 1700000000000, "o": "1.0", ..., "x": false } }
/// ```
pub fn decode_event(text: &str) -> Result<Option<KlineEvent>, IngestError> {
    let root: Value = serde_json::from_str(text)?;
    let data = root.get("data").unwrap_or(&root);

    if data.get("e").and_then(Value::as_str) != Some("kline") {
        return Ok(None);
    }

    let symbol = data["s"]
        .as_str()
        .ok_or_else(|| IngestError::Decode("missing field s".into()))?
        .to_uppercase();

    let k = data
        .get("k")
        .ok_or_else(|| IngestError::Decode("missing field k".into()))?;

    let timestamp = k["t"]
        .as_i64()
        .ok_or_else(|| IngestError::Decode("missing field k.t".into()))?;
    let is_final = k["x"]
        .as_bool()
        .ok_or_else(|| IngestError::Decode("missing field k.x".into()))?;

    let candle = Candle {
        symbol,
        timestamp,
        open: field_f64(k, "o")?,
        high: field_f64(k, "h")?,
        low: field_f64(k, "l")?,
        close: field_f64(k, "c")?,
        volume: field_f64(k, "v")?,
    };

    Ok(Some(KlineEvent { candle, is_final }))
}

fn field_f64(k: &Value, name: &str) -> Result<f64, IngestError> {
    parse_str_f64(&k[name]).map_err(|e| IngestError::Decode(format!("field k.{name}: {e}")))
}

// ---------------------------------------------------------------------------
// Subscription targets
// ---------------------------------------------------------------------------

/// One WebSocket connection and the symbols it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTarget {
    pub url: String,
    pub symbols: Vec<String>,
}

/// Lay the universe out over connections according to `mode`.
pub fn stream_targets(
    ws_base_url: &str,
    symbols: &[String],
    mode: SubscriptionMode,
    max_streams_per_connection: usize,
) -> Vec<StreamTarget> {
    let base = ws_base_url.trim_end_matches('/');
    match mode {
        SubscriptionMode::Multiplexed => symbols
            .chunks(max_streams_per_connection.max(1))
            .map(|chunk| {
                let streams: Vec<String> = chunk
                    .iter()
                    .map(|s| format!("{}{KLINE_STREAM}", s.to_lowercase()))
                    .collect();
                StreamTarget {
                    url: format!("{base}/stream?streams={}", streams.join("/")),
                    symbols: chunk.to_vec(),
                }
            })
            .collect(),
        SubscriptionMode::PerSymbol => symbols
            .iter()
            .map(|s| StreamTarget {
                url: format!("{base}/ws/{}{KLINE_STREAM}", s.to_lowercase()),
                symbols: vec![s.clone()],
            })
            .collect(),
    }
}

// ---------------------------------------------------------------------------
// Reconnect backoff
// ---------------------------------------------------------------------------

/// Doubling delay, capped, reset after every successful connect.
#[derive(Debug, Clone)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.min(max);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

enum SessionEnd {
    Cancelled,
    Closed,
}

#[derive(Clone)]
pub struct LiveStreamConsumer {
    candles: Arc<dyn CandleStore>,
    progress: Arc<IngestProgress>,
    config: LiveConfig,
    ws_base_url: String,
}

impl LiveStreamConsumer {
    pub fn new(
        candles: Arc<dyn CandleStore>,
        progress: Arc<IngestProgress>,
        config: LiveConfig,
        ws_base_url: impl Into<String>,
    ) -> Self {
        Self {
            candles,
            progress,
            config,
            ws_base_url: ws_base_url.into(),
        }
    }

    /// Run until `cancel` fires or a persistence failure stops the consumer.
    pub async fn run(
        &self,
        universe: &SymbolUniverse,
        cancel: &CancellationToken,
    ) -> Result<(), IngestError> {
        let targets = stream_targets(
            &self.ws_base_url,
            universe.symbols(),
            self.config.subscription_mode,
            self.config.max_streams_per_connection,
        );
        if targets.is_empty() {
            warn!("live consumer has no symbols to subscribe");
            return Ok(());
        }

        info!(
            symbols = universe.len(),
            connections = targets.len(),
            mode = %self.config.subscription_mode,
            persist_partial = self.config.persist_partial_candles,
            "live consumer starting"
        );

        // Child token: a fatal error on one connection stops its siblings
        // without cancelling the rest of the process.
        let stop = cancel.child_token();
        let mut tasks = JoinSet::new();
        for (id, target) in targets.into_iter().enumerate() {
            let consumer = self.clone();
            let stop = stop.clone();
            tasks.spawn(async move { consumer.run_connection(id, target, stop).await });
        }

        let mut result = Ok(());
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => Err(IngestError::Connection(format!("stream task aborted: {e}"))),
            };
            if let Err(e) = outcome {
                error!(error = %e, "live consumer stopping");
                stop.cancel();
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        info!("live consumer stopped");
        result
    }

    async fn run_connection(
        &self,
        id: usize,
        target: StreamTarget,
        cancel: CancellationToken,
    ) -> Result<(), IngestError> {
        let mut backoff = Backoff::new(
            Duration::from_millis(self.config.reconnect_initial_ms),
            Duration::from_millis(self.config.reconnect_max_ms),
        );
        self.progress.update_stream(id, |s| s.symbols = target.symbols.len());

        loop {
            self.progress
                .update_stream(id, |s| s.status = StreamStatus::Connecting);

            match self.session(id, &target, &cancel, &mut backoff).await {
                Ok(SessionEnd::Cancelled) => break,
                Ok(SessionEnd::Closed) => {
                    warn!(conn = id, "kline WebSocket stream ended");
                }
                Err(e @ IngestError::Persistence(_)) => {
                    self.progress
                        .update_stream(id, |s| s.status = StreamStatus::Stopped);
                    return Err(e);
                }
                Err(e) => {
                    warn!(conn = id, error = %e, "kline WebSocket connection error");
                }
            }

            let delay = backoff.next_delay();
            self.progress.update_stream(id, |s| {
                s.status = StreamStatus::Reconnecting;
                s.reconnects += 1;
            });
            warn!(conn = id, delay_ms = delay.as_millis() as u64, "reconnecting kline stream");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.progress
            .update_stream(id, |s| s.status = StreamStatus::Stopped);
        debug!(conn = id, "kline stream task exiting");
        Ok(())
    }

    /// One connection lifetime: connect, consume until it ends or is cancelled.
    async fn session(
        &self,
        id: usize,
        target: &StreamTarget,
        cancel: &CancellationToken,
        backoff: &mut Backoff,
    ) -> Result<SessionEnd, IngestError> {
        info!(conn = id, url = %target.url, symbols = target.symbols.len(), "connecting to kline WebSocket");

        let connect_timeout = Duration::from_secs(self.config.connect_timeout_secs);
        let read_timeout = Duration::from_secs(self.config.read_timeout_secs);

        let (ws_stream, _response) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
            r = tokio::time::timeout(connect_timeout, connect_async(target.url.as_str())) => {
                r.map_err(|_| {
                    IngestError::Connection(format!(
                        "handshake timed out after {}s",
                        connect_timeout.as_secs()
                    ))
                })??
            }
        };

        info!(conn = id, "kline WebSocket connected");
        backoff.reset();
        self.progress
            .update_stream(id, |s| s.status = StreamStatus::Connected);

        let (mut write, mut read) = ws_stream.split();

        loop {
            let msg = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    info!(conn = id, "kline WebSocket closed on shutdown");
                    return Ok(SessionEnd::Cancelled);
                }
                msg = tokio::time::timeout(read_timeout, read.next()) => msg.map_err(|_| {
                    IngestError::Connection(format!(
                        "no frame received for {}s",
                        read_timeout.as_secs()
                    ))
                })?,
            };

            match msg {
                Some(Ok(Message::Text(text))) => self.handle_message(id, &text).await?,
                Some(Ok(Message::Close(frame))) => {
                    debug!(conn = id, frame = ?frame, "close frame received");
                    return Ok(SessionEnd::Closed);
                }
                // Ping / Pong / Binary -- tungstenite answers pings itself.
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(SessionEnd::Closed),
            }
        }
    }

    /// Decode a frame and write it through. Malformed payloads are counted
    /// and dropped; only a store failure is returned.
    pub async fn handle_message(&self, id: usize, text: &str) -> Result<(), IngestError> {
        let event = match decode_event(text) {
            Ok(Some(event)) => event,
            Ok(None) => return Ok(()),
            Err(e) => {
                self.progress.record_decode_error();
                warn!(conn = id, error = %e, "discarding malformed kline event");
                return Ok(());
            }
        };

        if !event.is_final && !self.config.persist_partial_candles {
            return Ok(());
        }

        let timestamp = event.candle.timestamp;
        debug!(
            symbol = %event.candle.symbol,
            timestamp,
            close = event.candle.close,
            closed = event.is_final,
            "candle update"
        );
        self.candles.upsert(event.candle).await?;

        self.progress.record_live_write();
        self.progress.update_stream(id, |s| {
            s.events += 1;
            s.last_event_ms = Some(timestamp);
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

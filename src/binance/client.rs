// =============================================================================
// Binance USDⓈ-M Futures REST Client — public market-data endpoints
// =============================================================================
//
// Only the two calls the ingester needs: the instrument listing and 1-minute
// klines. Failures are classified into `IngestError` so the backfill engine
// can tell a retryable hiccup from a permanent rejection.
//
// SECURITY: the API key is sent as a header only and never logged.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::binance::rate_limit::RateLimiter;
use crate::error::IngestError;
use crate::ingest::backfill::KlineSource;
use crate::ingest::universe::InstrumentSource;
use crate::types::Candle;

/// Per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

/// Response of `GET /fapi/v1/exchangeInfo` (only the fields we read).
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeInfo {
    pub symbols: Vec<InstrumentInfo>,
}

/// One listed instrument.
#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentInfo {
    pub symbol: String,
    #[serde(rename = "contractType", default)]
    pub contract_type: String,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// REST client for the futures market-data API.
#[derive(Clone)]
pub struct FuturesClient {
    base_url: String,
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
}

impl FuturesClient {
    /// Create a new client. `limiter` receives the weight headers of every
    /// response; pacing itself is driven by the caller.
    pub fn new(
        api_key: Option<&str>,
        base_url: impl Into<String>,
        limiter: Arc<RateLimiter>,
    ) -> anyhow::Result<Self> {
        let mut default_headers = HeaderMap::new();
        if let Some(key) = api_key.filter(|k| !k.is_empty()) {
            let val = HeaderValue::from_str(key).context("API key is not a valid header value")?;
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build reqwest client")?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        debug!(base_url = %base_url, "FuturesClient initialised");

        Ok(Self {
            base_url,
            client,
            limiter,
        })
    }

    /// GET /fapi/v1/exchangeInfo.
    #[instrument(skip(self), name = "binance::exchange_info")]
    pub async fn exchange_info(&self) -> Result<ExchangeInfo, IngestError> {
        let body = self.get_json("/fapi/v1/exchangeInfo").await?;
        let info: ExchangeInfo = serde_json::from_value(body)?;
        debug!(count = info.symbols.len(), "exchange info retrieved");
        Ok(info)
    }

    /// GET /fapi/v1/klines with a 1-minute interval starting at `start_ms`.
    #[instrument(skip(self), name = "binance::klines")]
    pub async fn klines(
        &self,
        symbol: &str,
        start_ms: i64,
        limit: u32,
    ) -> Result<Vec<Candle>, IngestError> {
        let path = format!(
            "/fapi/v1/klines?symbol={symbol}&interval=1m&startTime={start_ms}&limit={limit}"
        );
        let body = self.get_json(&path).await?;
        let candles = parse_kline_rows(symbol, &body)?;
        debug!(symbol, start_ms, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    async fn get_json(&self, path: &str) -> Result<serde_json::Value, IngestError> {
        let url = format!("{}{}", self.base_url, path);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| IngestError::Transient(format!("GET {path} failed: {e}")))?;

        self.limiter.update_from_headers(resp.headers());

        let status = resp.status();
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        let text = resp
            .text()
            .await
            .map_err(|e| IngestError::Transient(format!("GET {path} body read failed: {e}")))?;

        if !status.is_success() {
            return Err(classify_status(status, retry_after, text));
        }

        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait]
impl KlineSource for FuturesClient {
    async fn fetch_klines(
        &self,
        symbol: &str,
        start_ms: i64,
        limit: u32,
    ) -> Result<Vec<Candle>, IngestError> {
        self.klines(symbol, start_ms, limit).await
    }
}

#[async_trait]
impl InstrumentSource for FuturesClient {
    async fn list_instruments(&self) -> Result<ExchangeInfo, IngestError> {
        self.exchange_info().await
    }
}

impl std::fmt::Debug for FuturesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuturesClient")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a non-success HTTP status onto the error taxonomy.
///
/// 429 (too many requests) and 418 (IP auto-ban) are rate-limit rejections;
/// 408 and 5xx are transient; any other 4xx is a permanent rejection.
fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: String) -> IngestError {
    match status.as_u16() {
        429 | 418 => IngestError::RateLimited {
            status: status.as_u16(),
            retry_after,
        },
        408 => IngestError::Transient(format!("HTTP {status}: {body}")),
        s if s >= 500 => IngestError::Transient(format!("HTTP {status}: {body}")),
        s => IngestError::Rejected { status: s, body },
    }
}

/// Parse Binance's array-of-arrays kline response.
///
/// Array indices:
///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume, ...
pub fn parse_kline_rows(symbol: &str, body: &serde_json::Value) -> Result<Vec<Candle>, IngestError> {
    let raw = body
        .as_array()
        .ok_or_else(|| IngestError::Decode("klines response is not an array".into()))?;

    let mut candles = Vec::with_capacity(raw.len());
    for entry in raw {
        let arr = entry
            .as_array()
            .ok_or_else(|| IngestError::Decode("kline entry is not an array".into()))?;

        if arr.len() < 6 {
            return Err(IngestError::Decode(format!(
                "kline entry has {} elements, expected at least 6",
                arr.len()
            )));
        }

        let timestamp = arr[0]
            .as_i64()
            .ok_or_else(|| IngestError::Decode(format!("kline open time is not an integer: {}", arr[0])))?;

        candles.push(Candle {
            symbol: symbol.to_string(),
            timestamp,
            open: parse_str_f64(&arr[1])?,
            high: parse_str_f64(&arr[2])?,
            low: parse_str_f64(&arr[3])?,
            close: parse_str_f64(&arr[4])?,
            volume: parse_str_f64(&arr[5])?,
        });
    }

    Ok(candles)
}

/// Parse a JSON value that may be either a string or a number into `f64`.
pub fn parse_str_f64(val: &serde_json::Value) -> Result<f64, IngestError> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .map_err(|e| IngestError::Decode(format!("failed to parse '{s}' as f64: {e}")))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        Err(IngestError::Decode(format!("expected string or number, got: {val}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_kline_rows_ok() {
        let body = json!([
            [1700000000000i64, "1.10", "1.20", "1.00", "1.15", "5000.5", 1700000059999i64, "0", 10, "0", "0", "0"],
            [1700000060000i64, "1.15", "1.16", "1.14", "1.14", "10", 1700000119999i64, "0", 3, "0", "0", "0"]
        ]);
        let candles = parse_kline_rows("AAVEUSDT", &body).expect("should parse");
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].symbol, "AAVEUSDT");
        assert_eq!(candles[0].timestamp, 1_700_000_000_000);
        assert!((candles[0].close - 1.15).abs() < f64::EPSILON);
        assert!((candles[1].volume - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn parse_kline_rows_empty_array() {
        let candles = parse_kline_rows("AAVEUSDT", &json!([])).unwrap();
        assert!(candles.is_empty());
    }

    #[test]
    fn parse_kline_rows_rejects_malformed() {
        assert!(matches!(
            parse_kline_rows("X", &json!({"code": -1121})),
            Err(IngestError::Decode(_))
        ));
        assert!(matches!(
            parse_kline_rows("X", &json!([[1, "1", "1"]])),
            Err(IngestError::Decode(_))
        ));
        assert!(matches!(
            parse_kline_rows("X", &json!([[1, "abc", "1", "1", "1", "1"]])),
            Err(IngestError::Decode(_))
        ));
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, None, String::new()),
            IngestError::RateLimited { status: 429, .. }
        ));
        assert!(matches!(
            classify_status(StatusCode::IM_A_TEAPOT, None, String::new()),
            IngestError::RateLimited { status: 418, .. }
        ));
        assert!(classify_status(StatusCode::BAD_GATEWAY, None, String::new()).is_transient());
        assert!(classify_status(StatusCode::REQUEST_TIMEOUT, None, String::new()).is_transient());
        let rejected = classify_status(StatusCode::BAD_REQUEST, None, "Invalid symbol.".into());
        assert!(matches!(rejected, IngestError::Rejected { status: 400, .. }));
        assert!(!rejected.is_transient());
    }

    #[test]
    fn exchange_info_deserialises_listing() {
        let body = json!({
            "timezone": "UTC",
            "symbols": [
                { "symbol": "AAVEUSDT", "contractType": "PERPETUAL", "quoteAsset": "USDT", "status": "TRADING" },
                { "symbol": "BTCUSDT_250328", "contractType": "CURRENT_QUARTER", "quoteAsset": "USDT" }
            ]
        });
        let info: ExchangeInfo = serde_json::from_value(body).unwrap();
        assert_eq!(info.symbols.len(), 2);
        assert_eq!(info.symbols[1].contract_type, "CURRENT_QUARTER");
    }
}

// =============================================================================
// Runtime Configuration — ingestion settings loaded from JSON + environment
// =============================================================================
//
// Every field carries `#[serde(default)]` so that a partial (or empty) config
// file still loads. Credentials are never part of this file: the API key is
// read from the environment by main.rs.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{RunMode, SubscriptionMode};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_db_path() -> String {
    "data/raw.db".to_string()
}

fn default_rest_base_url() -> String {
    "https://fapi.binance.com".to_string()
}

fn default_ws_base_url() -> String {
    "wss://fstream.binance.com".to_string()
}

fn default_status_interval_secs() -> u64 {
    60
}

fn default_quote_asset() -> String {
    "USDT".to_string()
}

fn default_contract_type() -> String {
    "PERPETUAL".to_string()
}

fn default_denylist() -> Vec<String> {
    [
        "BTCUSDT",
        "ETHUSDT",
        "SOLUSDT",
        "XRPUSDT",
        "BNBUSDT",
        "ADAUSDT",
        "TRXUSDT",
        "STETHUSDT",
        "DOGEUSDT",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_lookback_days() -> u32 {
    5 * 365
}

fn default_page_limit() -> u32 {
    1000
}

fn default_retry_delay_ms() -> u64 {
    5_000
}

fn default_request_delay_ms() -> u64 {
    60
}

fn default_burst_threshold() -> u32 {
    1000
}

fn default_burst_pause_secs() -> u64 {
    60
}

fn default_weight_limit() -> u32 {
    2000
}

fn default_max_streams_per_connection() -> usize {
    200
}

fn default_reconnect_initial_ms() -> u64 {
    1_000
}

fn default_reconnect_max_ms() -> u64 {
    60_000
}

fn default_connect_timeout_secs() -> u64 {
    15
}

/// Binance pings every ~3 minutes, so five silent minutes means a dead link.
fn default_read_timeout_secs() -> u64 {
    300
}

// =============================================================================
// Sections
// =============================================================================

/// Instrument filter applied to the exchange listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniverseConfig {
    /// Symbols must end with this quote asset.
    #[serde(default = "default_quote_asset")]
    pub quote_asset: String,

    /// Required `contractType` value.
    #[serde(default = "default_contract_type")]
    pub contract_type: String,

    /// Symbols excluded regardless of the structural filter.
    #[serde(default = "default_denylist")]
    pub denylist: Vec<String>,
}

impl Default for UniverseConfig {
    fn default() -> Self {
        Self {
            quote_asset: default_quote_asset(),
            contract_type: default_contract_type(),
            denylist: default_denylist(),
        }
    }
}

/// Historical pagination settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillConfig {
    /// How far back a symbol without a checkpoint starts.
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,

    /// Candles requested per page (exchange maximum is 1000 for this use).
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,

    /// Fixed wait before retrying a transiently failed request.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            lookback_days: default_lookback_days(),
            page_limit: default_page_limit(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl BackfillConfig {
    pub fn lookback_ms(&self) -> i64 {
        i64::from(self.lookback_days) * 24 * 60 * 60 * 1000
    }
}

/// Request pacing for the REST path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Delay between consecutive requests.
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,

    /// Requests allowed before the long pause kicks in.
    #[serde(default = "default_burst_threshold")]
    pub burst_threshold: u32,

    /// Long pause after the threshold or on a rate-limit rejection.
    #[serde(default = "default_burst_pause_secs")]
    pub burst_pause_secs: u64,

    /// Reported 1-minute weight at which the next request takes the long pause.
    #[serde(default = "default_weight_limit")]
    pub weight_limit: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            request_delay_ms: default_request_delay_ms(),
            burst_threshold: default_burst_threshold(),
            burst_pause_secs: default_burst_pause_secs(),
            weight_limit: default_weight_limit(),
        }
    }
}

/// Live WebSocket settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    #[serde(default)]
    pub subscription_mode: SubscriptionMode,

    /// Upper bound of streams carried by one multiplexed connection.
    #[serde(default = "default_max_streams_per_connection")]
    pub max_streams_per_connection: usize,

    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,

    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,

    /// Upper bound on the WebSocket handshake.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Longest silence (no frame of any kind) before the connection is
    /// treated as dead and re-established.
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,

    /// Persist still-forming candle updates, not only closed candles.
    #[serde(default = "default_true")]
    pub persist_partial_candles: bool,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            subscription_mode: SubscriptionMode::default(),
            max_streams_per_connection: default_max_streams_per_connection(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            persist_partial_candles: default_true(),
        }
    }
}

// =============================================================================
// IngestConfig
// =============================================================================

/// Top-level configuration for the ingester.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default = "default_rest_base_url")]
    pub rest_base_url: String,

    #[serde(default = "default_ws_base_url")]
    pub ws_base_url: String,

    /// Which paths to run: all, backfill or live.
    #[serde(default)]
    pub run_mode: RunMode,

    /// Period of the progress summary log.
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,

    #[serde(default)]
    pub universe: UniverseConfig,

    #[serde(default)]
    pub backfill: BackfillConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub live: LiveConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            rest_base_url: default_rest_base_url(),
            ws_base_url: default_ws_base_url(),
            run_mode: RunMode::default(),
            status_interval_secs: default_status_interval_secs(),
            universe: UniverseConfig::default(),
            backfill: BackfillConfig::default(),
            rate_limit: RateLimitConfig::default(),
            live: LiveConfig::default(),
        }
    }
}

impl IngestConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read ingest config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse ingest config from {}", path.display()))?;

        info!(
            path = %path.display(),
            db_path = %config.db_path,
            run_mode = %config.run_mode,
            "ingest config loaded"
        );

        Ok(config)
    }

    /// Apply `INGEST_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("INGEST_DB_PATH").filter(|p| !p.trim().is_empty()) {
            self.db_path = path.trim().to_string();
        }

        if let Some(raw) = lookup("INGEST_MODE") {
            match raw.parse::<RunMode>() {
                Ok(mode) => self.run_mode = mode,
                Err(e) => warn!(error = %e, "ignoring INGEST_MODE"),
            }
        }

        if let Some(raw) = lookup("INGEST_SUBSCRIPTION_MODE") {
            match raw.parse::<SubscriptionMode>() {
                Ok(mode) => self.live.subscription_mode = mode,
                Err(e) => warn!(error = %e, "ignoring INGEST_SUBSCRIPTION_MODE"),
            }
        }

        if let Some(raw) = lookup("INGEST_DENYLIST") {
            self.universe.denylist = raw
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = IngestConfig::default();
        assert_eq!(cfg.run_mode, RunMode::All);
        assert_eq!(cfg.universe.denylist.len(), 9);
        assert!(cfg.universe.denylist.contains(&"STETHUSDT".to_string()));
        assert_eq!(cfg.universe.quote_asset, "USDT");
        assert_eq!(cfg.backfill.page_limit, 1000);
        assert_eq!(cfg.backfill.lookback_ms(), 1825 * 86_400_000);
        assert_eq!(cfg.rate_limit.request_delay_ms, 60);
        assert_eq!(cfg.rate_limit.burst_threshold, 1000);
        assert_eq!(cfg.rate_limit.burst_pause_secs, 60);
        assert_eq!(cfg.live.subscription_mode, SubscriptionMode::Multiplexed);
        assert!(cfg.live.persist_partial_candles);
        assert_eq!(cfg.live.connect_timeout_secs, 15);
        assert_eq!(cfg.live.read_timeout_secs, 300);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: IngestConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.db_path, "data/raw.db");
        assert_eq!(cfg.backfill.retry_delay_ms, 5_000);
        assert_eq!(cfg.live.max_streams_per_connection, 200);
        assert!(cfg.live.persist_partial_candles);
        assert_eq!(cfg.live.read_timeout_secs, 300);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{
            "run_mode": "live",
            "live": { "subscription_mode": "per_symbol", "persist_partial_candles": false },
            "universe": { "denylist": [] }
        }"#;
        let cfg: IngestConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.run_mode, RunMode::Live);
        assert_eq!(cfg.live.subscription_mode, SubscriptionMode::PerSymbol);
        assert!(!cfg.live.persist_partial_candles);
        assert_eq!(cfg.live.reconnect_max_ms, 60_000);
        assert!(cfg.universe.denylist.is_empty());
        assert_eq!(cfg.universe.contract_type, "PERPETUAL");
    }

    #[test]
    fn env_overrides_replace_fields() {
        let env: HashMap<&str, &str> = [
            ("INGEST_DB_PATH", "/tmp/x.db"),
            ("INGEST_MODE", "backfill"),
            ("INGEST_DENYLIST", " aaveusdt, ,ZECUSDT "),
            ("INGEST_SUBSCRIPTION_MODE", "nonsense"),
        ]
        .into_iter()
        .collect();

        let mut cfg = IngestConfig::default();
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.db_path, "/tmp/x.db");
        assert_eq!(cfg.run_mode, RunMode::Backfill);
        assert_eq!(cfg.universe.denylist, vec!["AAVEUSDT", "ZECUSDT"]);
        // Invalid value leaves the previous setting in place.
        assert_eq!(cfg.live.subscription_mode, SubscriptionMode::Multiplexed);
    }
}

// =============================================================================
// Shared types used across the ingestion pipeline
// =============================================================================

use serde::{Deserialize, Serialize};

/// Length of one kline interval in milliseconds.
pub const MINUTE_MS: i64 = 60_000;

/// A single 1-minute OHLCV candle, keyed by `(symbol, timestamp)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    /// Candle open time, milliseconds since the UNIX epoch.
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Whether this candle's minute has fully elapsed at `now_ms`.
    pub fn is_closed_at(&self, now_ms: i64) -> bool {
        self.timestamp + MINUTE_MS <= now_ms
    }
}

/// The resolved set of symbols to ingest, sorted and free of duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SymbolUniverse {
    symbols: Vec<String>,
}

impl SymbolUniverse {
    pub fn new(symbols: impl IntoIterator<Item = String>) -> Self {
        let mut symbols: Vec<String> = symbols.into_iter().collect();
        symbols.sort();
        symbols.dedup();
        Self { symbols }
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

/// How the live consumer maps symbols onto WebSocket connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionMode {
    /// Combined streams, many symbols per connection.
    Multiplexed,
    /// One connection per symbol.
    PerSymbol,
}

impl Default for SubscriptionMode {
    fn default() -> Self {
        Self::Multiplexed
    }
}

impl std::fmt::Display for SubscriptionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Multiplexed => write!(f, "multiplexed"),
            Self::PerSymbol => write!(f, "per_symbol"),
        }
    }
}

impl std::str::FromStr for SubscriptionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "multiplexed" | "multiplex" | "combined" => Ok(Self::Multiplexed),
            "per_symbol" | "per-symbol" | "single" => Ok(Self::PerSymbol),
            other => Err(format!("unknown subscription mode: {other}")),
        }
    }
}

/// Which ingestion paths the process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    All,
    Backfill,
    Live,
}

impl Default for RunMode {
    fn default() -> Self {
        Self::All
    }
}

impl RunMode {
    pub fn runs_backfill(self) -> bool {
        matches!(self, Self::All | Self::Backfill)
    }

    pub fn runs_live(self) -> bool {
        matches!(self, Self::All | Self::Live)
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Backfill => write!(f, "backfill"),
            Self::Live => write!(f, "live"),
        }
    }
}

impl std::str::FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" | "both" => Ok(Self::All),
            "backfill" | "rest" => Ok(Self::Backfill),
            "live" | "ws" => Ok(Self::Live),
            other => Err(format!("unknown run mode: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn universe_is_sorted_and_deduplicated() {
        let u = SymbolUniverse::new(vec![
            "ZECUSDT".to_string(),
            "AAVEUSDT".to_string(),
            "ZECUSDT".to_string(),
        ]);
        assert_eq!(u.symbols(), ["AAVEUSDT", "ZECUSDT"]);
    }

    #[test]
    fn candle_closed_after_its_minute() {
        let c = Candle {
            symbol: "AAVEUSDT".into(),
            timestamp: 120_000,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 0.0,
        };
        assert!(!c.is_closed_at(179_999));
        assert!(c.is_closed_at(180_000));
    }

    #[test]
    fn modes_parse_from_env_strings() {
        assert_eq!("Backfill".parse::<RunMode>(), Ok(RunMode::Backfill));
        assert_eq!("per-symbol".parse::<SubscriptionMode>(), Ok(SubscriptionMode::PerSymbol));
        assert!("bogus".parse::<RunMode>().is_err());
        assert!(RunMode::All.runs_backfill() && RunMode::All.runs_live());
        assert!(!RunMode::Live.runs_backfill());
    }
}

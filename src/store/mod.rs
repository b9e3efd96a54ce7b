// =============================================================================
// Persistence contracts shared by the backfill and live paths
// =============================================================================

pub mod sqlite;

use async_trait::async_trait;

use crate::error::IngestError;
use crate::types::Candle;

pub use sqlite::SqliteStore;

/// Candle rows keyed by `(symbol, timestamp)`; the last write for a key wins.
#[async_trait]
pub trait CandleStore: Send + Sync {
    /// Insert or overwrite a single candle.
    async fn upsert(&self, candle: Candle) -> Result<(), IngestError>;

    /// Insert or overwrite a batch atomically. Returns the number of rows
    /// written.
    async fn upsert_batch(&self, candles: Vec<Candle>) -> Result<usize, IngestError>;
}

/// Per-symbol resumption point of the backfill path.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, symbol: &str) -> Result<Option<i64>, IngestError>;

    async fn set(&self, symbol: &str, last_timestamp: i64) -> Result<(), IngestError>;
}

// =============================================================================
// SQLite store — one connection owned by a dedicated writer thread
// =============================================================================
//
// Every read and write is queued as a job and executed in arrival order on the
// writer thread, so the backfill and live paths never touch the connection
// concurrently. Callers await a oneshot reply carrying the job's result.
// =============================================================================

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::error::IngestError;
use crate::store::{CandleStore, CheckpointStore};
use crate::types::Candle;

/// Pending jobs before callers start waiting for queue space.
const MAX_QUEUED_JOBS: usize = 1024;

const UPSERT_CANDLE_SQL: &str = r#"
    INSERT INTO futures_1m (symbol, timestamp, open, high, low, close, volume)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
    ON CONFLICT(symbol, timestamp) DO UPDATE SET
        open = excluded.open,
        high = excluded.high,
        low = excluded.low,
        close = excluded.close,
        volume = excluded.volume
"#;

const SET_CHECKPOINT_SQL: &str = r#"
    INSERT INTO futures_backfill_progress (symbol, last_timestamp)
    VALUES (?1, ?2)
    ON CONFLICT(symbol) DO UPDATE SET last_timestamp = excluded.last_timestamp
"#;

type Job = Box<dyn FnOnce(&mut Connection) + Send>;

fn ensure_schema(conn: &Connection) -> rusqlite::Result<()> {
    // Pragmas (best-effort).
    let _ = conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;");

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS futures_1m (
            symbol TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            open REAL,
            high REAL,
            low REAL,
            close REAL,
            volume REAL,
            PRIMARY KEY (symbol, timestamp)
        );
        CREATE TABLE IF NOT EXISTS futures_backfill_progress (
            symbol TEXT PRIMARY KEY,
            last_timestamp INTEGER NOT NULL
        );
        "#,
    )
}

fn write_candles(conn: &mut Connection, candles: &[Candle]) -> rusqlite::Result<usize> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare_cached(UPSERT_CANDLE_SQL)?;
        for c in candles {
            stmt.execute(params![
                c.symbol, c.timestamp, c.open, c.high, c.low, c.close, c.volume
            ])?;
        }
    }
    tx.commit()?;
    Ok(candles.len())
}

/// Handle to the SQLite writer thread. Cheap to share behind an `Arc`.
pub struct SqliteStore {
    jobs: mpsc::Sender<Job>,
    location: String,
}

impl SqliteStore {
    /// Open (or create) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database {}", path.display()))?;
        Self::start(conn, path.display().to_string())
    }

    /// Private in-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        Self::start(conn, ":memory:".to_string())
    }

    fn start(conn: Connection, location: String) -> Result<Self> {
        ensure_schema(&conn).context("failed to initialise schema")?;

        let (tx, mut rx) = mpsc::channel::<Job>(MAX_QUEUED_JOBS);
        let thread_location = location.clone();
        std::thread::Builder::new()
            .name("sqlite-writer".into())
            .spawn(move || {
                let mut conn = conn;
                while let Some(job) = rx.blocking_recv() {
                    job(&mut conn);
                }
                debug!(db = %thread_location, "sqlite writer stopped");
            })
            .context("failed to spawn sqlite writer thread")?;

        info!(db = %location, "candle store opened");
        Ok(Self { jobs: tx, location })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// Run `f` on the writer thread and wait for its result.
    async fn call<T, F>(&self, f: F) -> Result<T, IngestError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move |conn| {
            let _ = reply_tx.send(f(conn));
        });

        self.jobs
            .send(job)
            .await
            .map_err(|_| IngestError::Persistence("sqlite writer is not running".into()))?;

        reply_rx
            .await
            .map_err(|_| IngestError::Persistence("sqlite writer dropped the request".into()))?
            .map_err(IngestError::from)
    }

    // -------------------------------------------------------------------------
    // Read helpers
    // -------------------------------------------------------------------------

    #[cfg(test)]
    pub async fn candle(&self, symbol: &str, timestamp: i64) -> Result<Option<Candle>, IngestError> {
        let symbol = symbol.to_string();
        self.call(move |conn| {
            conn.query_row(
                "SELECT open, high, low, close, volume FROM futures_1m
                 WHERE symbol = ?1 AND timestamp = ?2",
                params![symbol, timestamp],
                |row| {
                    Ok(Candle {
                        symbol: symbol.clone(),
                        timestamp,
                        open: row.get(0)?,
                        high: row.get(1)?,
                        low: row.get(2)?,
                        close: row.get(3)?,
                        volume: row.get(4)?,
                    })
                },
            )
            .optional()
        })
        .await
    }

    #[cfg(test)]
    pub async fn candle_count(&self, symbol: &str) -> Result<u64, IngestError> {
        let symbol = symbol.to_string();
        self.call(move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM futures_1m WHERE symbol = ?1",
                params![symbol],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n.max(0) as u64)
        })
        .await
    }

    #[cfg(test)]
    pub async fn max_timestamp(&self, symbol: &str) -> Result<Option<i64>, IngestError> {
        let symbol = symbol.to_string();
        self.call(move |conn| {
            conn.query_row(
                "SELECT MAX(timestamp) FROM futures_1m WHERE symbol = ?1",
                params![symbol],
                |row| row.get::<_, Option<i64>>(0),
            )
        })
        .await
    }

    /// All checkpoints, ordered by symbol.
    pub async fn checkpoints(&self) -> Result<Vec<(String, i64)>, IngestError> {
        self.call(|conn| {
            let mut stmt = conn.prepare(
                "SELECT symbol, last_timestamp FROM futures_backfill_progress ORDER BY symbol",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }
}

#[async_trait]
impl CandleStore for SqliteStore {
    async fn upsert(&self, candle: Candle) -> Result<(), IngestError> {
        self.call(move |conn| {
            conn.execute(
                UPSERT_CANDLE_SQL,
                params![
                    candle.symbol,
                    candle.timestamp,
                    candle.open,
                    candle.high,
                    candle.low,
                    candle.close,
                    candle.volume
                ],
            )
            .map(|_| ())
        })
        .await
    }

    async fn upsert_batch(&self, candles: Vec<Candle>) -> Result<usize, IngestError> {
        if candles.is_empty() {
            return Ok(0);
        }
        self.call(move |conn| write_candles(conn, &candles)).await
    }
}

#[async_trait]
impl CheckpointStore for SqliteStore {
    async fn get(&self, symbol: &str) -> Result<Option<i64>, IngestError> {
        let symbol = symbol.to_string();
        self.call(move |conn| {
            conn.query_row(
                "SELECT last_timestamp FROM futures_backfill_progress WHERE symbol = ?1",
                params![symbol],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    async fn set(&self, symbol: &str, last_timestamp: i64) -> Result<(), IngestError> {
        let symbol = symbol.to_string();
        self.call(move |conn| {
            conn.execute(SET_CHECKPOINT_SQL, params![symbol, last_timestamp])
                .map(|_| ())
        })
        .await
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("location", &self.location)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn candle(symbol: &str, timestamp: i64, close: f64) -> Candle {
        Candle {
            symbol: symbol.into(),
            timestamp,
            open: close - 0.5,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 42.0,
        }
    }

    #[tokio::test]
    async fn repeated_upsert_keeps_one_row_with_last_values() {
        let store = SqliteStore::open_in_memory().unwrap();
        for n in 1..=5 {
            store.upsert(candle("AAVEUSDT", 60_000, n as f64)).await.unwrap();
        }

        assert_eq!(store.candle_count("AAVEUSDT").await.unwrap(), 1);
        let stored = store.candle("AAVEUSDT", 60_000).await.unwrap().unwrap();
        assert_eq!(stored, candle("AAVEUSDT", 60_000, 5.0));
    }

    #[tokio::test]
    async fn batch_upsert_is_idempotent_and_overwrites() {
        let store = SqliteStore::open_in_memory().unwrap();
        let batch: Vec<Candle> = (0..10).map(|i| candle("ZECUSDT", i * 60_000, 10.0)).collect();

        assert_eq!(store.upsert_batch(batch.clone()).await.unwrap(), 10);
        assert_eq!(store.upsert_batch(batch).await.unwrap(), 10);
        assert_eq!(store.candle_count("ZECUSDT").await.unwrap(), 10);

        let overlap: Vec<Candle> = (5..15).map(|i| candle("ZECUSDT", i * 60_000, 11.0)).collect();
        store.upsert_batch(overlap).await.unwrap();
        assert_eq!(store.candle_count("ZECUSDT").await.unwrap(), 15);
        assert_eq!(store.max_timestamp("ZECUSDT").await.unwrap(), Some(14 * 60_000));

        let kept = store.candle("ZECUSDT", 4 * 60_000).await.unwrap().unwrap();
        assert!((kept.close - 10.0).abs() < f64::EPSILON);
        let replaced = store.candle("ZECUSDT", 5 * 60_000).await.unwrap().unwrap();
        assert!((replaced.close - 11.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn empty_batch_writes_nothing() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.upsert_batch(Vec::new()).await.unwrap(), 0);
        assert_eq!(store.max_timestamp("ZECUSDT").await.unwrap(), None);
    }

    #[tokio::test]
    async fn checkpoint_get_and_set() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.get("AAVEUSDT").await.unwrap(), None);

        store.set("AAVEUSDT", 1_000).await.unwrap();
        store.set("AAVEUSDT", 2_000).await.unwrap();
        store.set("ZECUSDT", 500).await.unwrap();

        assert_eq!(store.get("AAVEUSDT").await.unwrap(), Some(2_000));
        assert_eq!(
            store.checkpoints().await.unwrap(),
            vec![("AAVEUSDT".to_string(), 2_000), ("ZECUSDT".to_string(), 500)]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_are_serialised() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let mut handles = Vec::new();
        for worker in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..50 {
                    store
                        .upsert(candle("AAVEUSDT", i * 60_000, worker as f64))
                        .await
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.candle_count("AAVEUSDT").await.unwrap(), 50);
    }

    #[tokio::test]
    async fn file_database_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("perp-ingest-test-{}", std::process::id()));
        let path = dir.join("nested").join("raw.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.upsert(candle("AAVEUSDT", 0, 1.0)).await.unwrap();
            store.set("AAVEUSDT", 0).await.unwrap();
        }
        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.candle_count("AAVEUSDT").await.unwrap(), 1);
        assert_eq!(reopened.get("AAVEUSDT").await.unwrap(), Some(0));
        drop(reopened);
        let _ = std::fs::remove_dir_all(dir);
    }
}

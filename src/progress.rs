// =============================================================================
// Progress Board — per-symbol backfill state and live connection status
// =============================================================================
//
// Shared by both ingestion paths via `Arc<IngestProgress>`. Writers only touch
// their own entries; the status task in main.rs reads a snapshot periodically.
//
// Thread safety:
//   - parking_lot::RwLock for the keyed maps.
//   - Atomic counters for the hot live-path tallies.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Backfill
// ---------------------------------------------------------------------------

/// Per-symbol backfill state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BackfillState {
    Idle,
    Fetching,
    Persisting,
    Completed,
    Failed,
}

impl Default for BackfillState {
    fn default() -> Self {
        Self::Idle
    }
}

impl std::fmt::Display for BackfillState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Fetching => write!(f, "Fetching"),
            Self::Persisting => write!(f, "Persisting"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SymbolProgress {
    pub state: BackfillState,
    /// Next timestamp to request.
    pub cursor_ms: i64,
    pub checkpoint_ms: Option<i64>,
    pub rows_written: u64,
    pub pages: u64,
    pub retries: u64,
    pub last_error: Option<String>,
}

// ---------------------------------------------------------------------------
// Live
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StreamStatus {
    Connecting,
    Connected,
    Reconnecting,
    Stopped,
}

impl Default for StreamStatus {
    fn default() -> Self {
        Self::Connecting
    }
}

impl std::fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Reconnecting => write!(f, "Reconnecting"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// One live WebSocket connection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamProgress {
    pub symbols: usize,
    pub status: StreamStatus,
    pub events: u64,
    pub reconnects: u64,
    pub last_event_ms: Option<i64>,
}

// ---------------------------------------------------------------------------
// Board
// ---------------------------------------------------------------------------

/// Aggregated view for the periodic status log.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub symbols_total: usize,
    pub symbols_completed: usize,
    pub symbols_failed: usize,
    pub backfill_rows: u64,
    pub streams_total: usize,
    pub streams_connected: usize,
    pub live_writes: u64,
    pub decode_errors: u64,
}

#[derive(Debug, Default)]
pub struct IngestProgress {
    backfill: RwLock<BTreeMap<String, SymbolProgress>>,
    streams: RwLock<BTreeMap<usize, StreamProgress>>,
    live_writes: AtomicU64,
    decode_errors: AtomicU64,
}

impl IngestProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_symbol(&self, symbol: &str, f: impl FnOnce(&mut SymbolProgress)) {
        let mut map = self.backfill.write();
        f(map.entry(symbol.to_string()).or_default());
    }

    pub fn set_state(&self, symbol: &str, state: BackfillState) {
        self.update_symbol(symbol, |p| p.state = state);
    }

    #[cfg(test)]
    pub fn symbol(&self, symbol: &str) -> Option<SymbolProgress> {
        self.backfill.read().get(symbol).cloned()
    }

    pub fn update_stream(&self, id: usize, f: impl FnOnce(&mut StreamProgress)) {
        let mut map = self.streams.write();
        f(map.entry(id).or_default());
    }

    #[cfg(test)]
    pub fn stream(&self, id: usize) -> Option<StreamProgress> {
        self.streams.read().get(&id).cloned()
    }

    pub fn record_live_write(&self) {
        self.live_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let backfill = self.backfill.read();
        let streams = self.streams.read();
        ProgressSnapshot {
            symbols_total: backfill.len(),
            symbols_completed: backfill
                .values()
                .filter(|p| p.state == BackfillState::Completed)
                .count(),
            symbols_failed: backfill
                .values()
                .filter(|p| p.state == BackfillState::Failed)
                .count(),
            backfill_rows: backfill.values().map(|p| p.rows_written).sum(),
            streams_total: streams.len(),
            streams_connected: streams
                .values()
                .filter(|s| s.status == StreamStatus::Connected)
                .count(),
            live_writes: self.live_writes.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }

    pub fn log_summary(&self) {
        let s = self.snapshot();
        info!(
            backfill_completed = s.symbols_completed,
            backfill_failed = s.symbols_failed,
            backfill_total = s.symbols_total,
            backfill_rows = s.backfill_rows,
            streams_connected = s.streams_connected,
            streams_total = s.streams_total,
            live_writes = s.live_writes,
            decode_errors = s.decode_errors,
            "ingest status"
        );

        for (symbol, p) in self.backfill.read().iter() {
            match p.state {
                BackfillState::Failed => warn!(
                    symbol = %symbol,
                    checkpoint = ?p.checkpoint_ms,
                    error = p.last_error.as_deref().unwrap_or("unknown"),
                    "backfill failed for symbol"
                ),
                BackfillState::Fetching | BackfillState::Persisting => debug!(
                    symbol = %symbol,
                    state = %p.state,
                    cursor_ms = p.cursor_ms,
                    checkpoint = ?p.checkpoint_ms,
                    pages = p.pages,
                    retries = p.retries,
                    "backfill in progress"
                ),
                BackfillState::Idle | BackfillState::Completed => {}
            }
        }

        for (id, st) in self.streams.read().iter() {
            if st.status != StreamStatus::Connected {
                warn!(
                    conn = id,
                    status = %st.status,
                    symbols = st.symbols,
                    reconnects = st.reconnects,
                    "live stream not connected"
                );
            } else {
                debug!(
                    conn = id,
                    symbols = st.symbols,
                    events = st.events,
                    last_event_ms = ?st.last_event_ms,
                    "live stream healthy"
                );
            }
        }
    }
}

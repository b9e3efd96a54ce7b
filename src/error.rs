// =============================================================================
// Ingestion error taxonomy
// =============================================================================
//
// Transient and connection-class errors are recovered locally (retry or
// reconnect). Everything else halts the affected path: the symbol's backfill,
// or the live consumer as a whole.
// =============================================================================

use std::time::Duration;

use thiserror::Error;

/// All errors generated by the ingestion pipeline.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("symbol discovery failed: {0}")]
    Discovery(String),

    #[error("transient request failure: {0}")]
    Transient(String),

    #[error("rate limited by exchange (HTTP {status})")]
    RateLimited {
        status: u16,
        retry_after: Option<Duration>,
    },

    #[error("exchange rejected request (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("failed to decode payload: {0}")]
    Decode(String),

    #[error("stream connection error: {0}")]
    Connection(String),

    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl IngestError {
    /// Errors the backfill path retries indefinitely.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited { .. })
    }

    /// Errors that invalidate the shared store and must stop every path.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Persistence(_) | Self::Discovery(_))
    }
}

impl From<rusqlite::Error> for IngestError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Persistence(value.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for IngestError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Connection(value.to_string())
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(value: serde_json::Error) -> Self {
        Self::Decode(value.to_string())
    }
}

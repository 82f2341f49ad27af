//! Provider abstraction for market data sources.
//!
//! Two traits mirror the two kinds of upstream:
//! - [`SnapshotSource`]: stateless HTTP provider, safe to call concurrently.
//! - [`SessionSource`]: login-scoped provider whose client must never be
//!   used from two tasks at once (`&mut self` on every call).

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

use super::{Candle, DateRange, InstrumentMeta, Period, SnapshotEntry};

// ============================================================================
// Provider Error Types
// ============================================================================

/// Errors that can occur when fetching data from providers
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Timeout, refused connection, HTTP error status
    #[error("Network error: {0}")]
    Network(String),

    /// Body that is not the expected payload (anti-bot HTML, truncated JSON)
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Connection dropped mid-request
    #[error("Connection dropped: {0}")]
    Disconnected(String),

    /// Login rejected or session expired
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Provider answered but has nothing for this request
    #[error("Data not available: {0}")]
    DataNotAvailable(String),

    /// Request rejected as invalid
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Call was not attempted (circuit open, session down, pool closed)
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProviderError {
    /// Transient errors worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::MalformedResponse(_) | Self::Disconnected(_)
        )
    }

    /// Errors that count toward opening the provider's circuit.
    pub fn trips_circuit(&self) -> bool {
        matches!(self, Self::MalformedResponse(_) | Self::Disconnected(_))
    }

    /// Whether the provider was actually called.
    pub fn was_attempted(&self) -> bool {
        !matches!(self, Self::Unavailable(_))
    }

    /// Classify a transport error from the HTTP client.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_decode() {
            return Self::MalformedResponse(err.to_string());
        }
        if err.is_timeout() || err.is_connect() {
            return Self::Network(err.to_string());
        }

        let chain = error_chain(err).to_ascii_lowercase();
        let dropped = [
            "connection reset",
            "connection closed",
            "connection aborted",
            "unexpected eof",
            "broken pipe",
            "incompletemessage",
        ];
        if dropped.iter().any(|needle| chain.contains(needle)) {
            Self::Disconnected(chain)
        } else {
            Self::Network(chain)
        }
    }

    /// Classify an I/O error from a socket.
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => Self::Disconnected(err.to_string()),
            _ => Self::Network(err.to_string()),
        }
    }
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        out.push_str(": ");
        out.push_str(&inner.to_string());
        source = inner.source();
    }
    out
}

/// Result type for provider calls
pub type ProviderResult<T> = Result<T, ProviderError>;

// ============================================================================
// Provider Traits
// ============================================================================

/// Bulk snapshot provider.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Provider name used for circuits and logs
    fn name(&self) -> &'static str;

    /// Latest figures for the whole market, keyed by code.
    async fn fetch_snapshot(&self) -> ProviderResult<HashMap<String, SnapshotEntry>>;

    /// Every listed instrument.
    async fn list_instruments(&self) -> ProviderResult<Vec<InstrumentMeta>>;

    /// Bars for one instrument, oldest first.
    async fn fetch_history(
        &self,
        code: &str,
        period: Period,
        range: DateRange,
    ) -> ProviderResult<Vec<Candle>>;
}

/// Login-scoped provider. Not safe for concurrent use.
#[async_trait]
pub trait SessionSource: Send {
    /// Provider name used for circuits and logs
    fn name(&self) -> &'static str;

    /// Whether the client holds a live, authenticated connection.
    ///
    /// Must turn false whenever a call is abandoned or fails in a way that
    /// leaves the connection unusable.
    fn is_logged_in(&self) -> bool;

    async fn login(&mut self) -> ProviderResult<()>;

    async fn logout(&mut self) -> ProviderResult<()>;

    /// Forward-adjusted bars, oldest first.
    async fn query_bars(
        &mut self,
        code: &str,
        period: Period,
        range: DateRange,
    ) -> ProviderResult<Vec<Candle>>;

    /// EPS TTM reported for a quarter, `None` when the report is missing.
    async fn query_eps_ttm(
        &mut self,
        code: &str,
        year: i32,
        quarter: u32,
    ) -> ProviderResult<Option<f64>>;
}

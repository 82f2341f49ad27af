//! Market data module for A-shares.
//!
//! Acquires quotes, bar history, and the instrument universe from two
//! unreliable upstream providers and merges them into one typed view.
//!
//! # Data Sources
//! - **Eastmoney** (snapshot provider): bulk real-time snapshot, instrument
//!   list, and per-symbol klines over HTTP. Rich but prone to anti-bot pages.
//! - **Baostock** (session provider): login-scoped TCP protocol with daily
//!   bars and quarterly fundamentals. Stable but not safe for concurrent use.
//!
//! # Lookup Tiers
//! snapshot → persisted row → memory cache → session provider → snapshot provider

mod aggregator;
pub mod baostock;
mod cache;
pub mod eastmoney;
mod pool;
mod provider;
mod rate_limiter;
pub mod retry;
pub mod store;

pub use aggregator::{MarketDataConfig, MarketDataService};
pub use baostock::BaostockClient;
pub use cache::{CacheStats, CacheTtls, DataCache, TierStats, TtlCache};
pub use eastmoney::EastmoneyClient;
pub use pool::{ProviderPool, SessionGuard, SESSION_PROVIDER, SNAPSHOT_PROVIDER};
pub use provider::{ProviderError, ProviderResult, SessionSource, SnapshotSource};
pub use rate_limiter::HostRateLimiter;
pub use retry::{Backoff, RetryPolicy};
pub use store::QuoteStore;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// Core Data Types
// ============================================================================

/// Bar period for historical data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Daily,
    Weekly,
    Monthly,
}

impl Period {
    /// Parse from a query string value ("daily", "d", "weekly", ...).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "daily" | "d" | "day" => Some(Self::Daily),
            "weekly" | "w" | "week" => Some(Self::Weekly),
            "monthly" | "m" | "month" => Some(Self::Monthly),
            _ => None,
        }
    }

    /// Frequency code used by the session provider.
    pub fn session_frequency(&self) -> &'static str {
        match self {
            Self::Daily => "d",
            Self::Weekly => "w",
            Self::Monthly => "m",
        }
    }

    /// `klt` code used by the kline endpoint.
    pub fn kline_code(&self) -> &'static str {
        match self {
            Self::Daily => "101",
            Self::Weekly => "102",
            Self::Monthly => "103",
        }
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Daily => write!(f, "daily"),
            Self::Weekly => write!(f, "weekly"),
            Self::Monthly => write!(f, "monthly"),
        }
    }
}

/// Listing board, derived from the instrument code prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Market {
    /// 沪市主板
    ShanghaiMain,
    /// 深市主板
    ShenzhenMain,
    /// 创业板
    Chinext,
    /// 科创板
    Star,
    Unknown,
}

impl Market {
    /// Classify a six-digit code.
    pub fn from_code(code: &str) -> Self {
        if code.starts_with("688") {
            Self::Star
        } else if code.starts_with('6') {
            Self::ShanghaiMain
        } else if code.starts_with('0') {
            Self::ShenzhenMain
        } else if code.starts_with('3') {
            Self::Chinext
        } else {
            Self::Unknown
        }
    }

    /// Parse the serialized form or the Chinese board name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "shanghai_main" | "沪市主板" => Some(Self::ShanghaiMain),
            "shenzhen_main" | "深市主板" => Some(Self::ShenzhenMain),
            "chinext" | "创业板" => Some(Self::Chinext),
            "star" | "科创板" => Some(Self::Star),
            "unknown" | "未知" => Some(Self::Unknown),
            _ => None,
        }
    }

    /// Whether the instrument trades on the Shanghai exchange.
    pub fn is_shanghai(&self) -> bool {
        matches!(self, Self::ShanghaiMain | Self::Star)
    }
}

/// Universe member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentMeta {
    pub code: String,
    pub name: String,
    pub industry: Option<String>,
    pub market: Market,
}

impl InstrumentMeta {
    pub fn new(code: impl Into<String>, name: impl Into<String>) -> Self {
        let code = code.into();
        let market = Market::from_code(&code);
        Self {
            code,
            name: name.into(),
            industry: None,
            market,
        }
    }

    pub fn with_industry(mut self, industry: impl Into<String>) -> Self {
        self.industry = Some(industry.into());
        self
    }
}

/// Provenance of a returned quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshnessTier {
    /// Fetched just now from the session provider's latest bar
    Live,
    /// Served from the whole-market snapshot
    SnapshotCache,
    /// Read back from the persistent store
    Persisted,
    /// Fetched from the snapshot provider's kline endpoint after the session provider failed
    HistoricalFallback,
}

impl FreshnessTier {
    /// Human readable staleness of data from this tier.
    pub fn delay_description(&self) -> &'static str {
        match self {
            Self::Live => "1 trading day",
            Self::SnapshotCache => "realtime snapshot",
            Self::Persisted => "within 30 minutes",
            Self::HistoricalFallback => "a few minutes",
        }
    }
}

/// Normalized quote. Every field comes from the single source named by `freshness`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub code: String,
    pub name: String,
    pub price: f64,
    pub change_pct: f64,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    /// Volume in lots
    pub volume: f64,
    /// Traded amount in CNY
    pub turnover: f64,
    pub pe: Option<f64>,
    pub pb: Option<f64>,
    /// Total market value in CNY
    pub market_cap: Option<f64>,
    /// Trading day the figures belong to
    pub trade_date: NaiveDate,
    pub fetched_at: DateTime<Utc>,
    pub freshness: FreshnessTier,
    pub delay: String,
}

impl Quote {
    /// Build a quote from the latest bar of a history series.
    pub fn from_candle(code: &str, name: &str, candle: &Candle, tier: FreshnessTier) -> Self {
        Self {
            code: code.to_string(),
            name: name.to_string(),
            price: candle.close,
            change_pct: candle.change_pct,
            open: Some(candle.open),
            high: Some(candle.high),
            low: Some(candle.low),
            volume: candle.volume,
            turnover: candle.amount,
            pe: None,
            pb: None,
            market_cap: None,
            trade_date: candle.date,
            fetched_at: Utc::now(),
            freshness: tier,
            delay: tier.delay_description().to_string(),
        }
    }

    /// Build a quote from a snapshot row.
    pub fn from_snapshot(code: &str, entry: &SnapshotEntry) -> Self {
        let tier = FreshnessTier::SnapshotCache;
        Self {
            code: code.to_string(),
            name: entry.name.clone(),
            price: entry.price,
            change_pct: entry.change_pct,
            open: entry.open,
            high: entry.high,
            low: entry.low,
            volume: entry.volume,
            turnover: entry.amount,
            pe: entry.pe,
            pb: entry.pb,
            market_cap: entry.market_cap,
            trade_date: china_date(entry.as_of),
            fetched_at: entry.as_of,
            freshness: tier,
            delay: tier.delay_description().to_string(),
        }
    }

    /// Re-stamp the quote with another provenance tier.
    pub fn with_tier(mut self, tier: FreshnessTier) -> Self {
        self.freshness = tier;
        self.delay = tier.delay_description().to_string();
        self
    }
}

/// One row of the whole-market snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub name: String,
    pub price: f64,
    pub change_pct: f64,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub volume: f64,
    pub amount: f64,
    pub pe: Option<f64>,
    pub pb: Option<f64>,
    pub market_cap: Option<f64>,
    pub industry: Option<String>,
    pub as_of: DateTime<Utc>,
}

/// Whole-market snapshot from a single fetch cycle.
#[derive(Debug, Clone, Default)]
pub struct UniverseSnapshot {
    pub entries: HashMap<String, SnapshotEntry>,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl UniverseSnapshot {
    pub fn new(entries: HashMap<String, SnapshotEntry>) -> Self {
        Self {
            entries,
            fetched_at: Some(Utc::now()),
        }
    }

    pub fn get(&self, code: &str) -> Option<&SnapshotEntry> {
        self.entries.get(code)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub pre_close: Option<f64>,
    /// Volume in lots
    pub volume: f64,
    /// Traded amount in CNY
    pub amount: f64,
    pub change_pct: f64,
    /// close − previous close
    pub change_amount: f64,
    /// Turnover rate in percent
    pub turnover_rate: Option<f64>,
}

/// Inclusive trading-date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// The `days` calendar days ending today (China time).
    pub fn last_days(days: i64) -> Self {
        let end = china_today();
        Self {
            start: end - Duration::days(days),
            end,
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Exchange-prefixed code used by the session provider ("sh.600519").
pub fn session_code(code: &str) -> String {
    if Market::from_code(code).is_shanghai() {
        format!("sh.{code}")
    } else {
        format!("sz.{code}")
    }
}

/// Current date in China Standard Time.
pub fn china_today() -> NaiveDate {
    china_date(Utc::now())
}

/// Convert a UTC instant to its China Standard Time calendar date.
pub fn china_date(at: DateTime<Utc>) -> NaiveDate {
    match FixedOffset::east_opt(8 * 3600) {
        Some(offset) => at.with_timezone(&offset).date_naive(),
        None => at.date_naive(),
    }
}

/// Format a volume in lots with 万/亿 units.
pub fn format_volume(lots: f64) -> String {
    if !lots.is_finite() {
        return "未知".to_string();
    }
    if lots >= 1e8 {
        format!("{:.2}亿手", lots / 1e8)
    } else if lots >= 1e4 {
        format!("{:.2}万手", lots / 1e4)
    } else {
        format!("{lots}手")
    }
}

/// Format a CNY amount with 万/亿 units.
pub fn format_amount(amount: f64) -> String {
    if !amount.is_finite() {
        return "未知".to_string();
    }
    if amount >= 1e8 {
        format!("{:.2}亿", amount / 1e8)
    } else if amount >= 1e4 {
        format!("{:.2}万", amount / 1e4)
    } else {
        format!("{amount}")
    }
}

/// Round to two decimals.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

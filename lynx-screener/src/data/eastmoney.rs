//! Eastmoney adapter: the bulk snapshot provider.
//!
//! Three HTTP endpoints are used:
//! - `push2.eastmoney.com/api/qt/clist/get`: paged whole-market table, used
//!   for both the snapshot and the instrument list
//! - `push2his.eastmoney.com/api/qt/stock/kline/get`: per-symbol bars
//!
//! The site serves anti-bot HTML instead of JSON when it dislikes a client.
//! Such bodies surface as [`ProviderError::MalformedResponse`], which is
//! what the circuit breaker counts.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, REFERER, USER_AGENT};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::provider::{ProviderError, ProviderResult, SnapshotSource};
use super::rate_limiter::HostRateLimiter;
use super::{Candle, DateRange, InstrumentMeta, Market, Period, SnapshotEntry};

// ============================================================================
// Constants
// ============================================================================

const CLIST_PATH: &str = "/api/qt/clist/get";
const KLINE_PATH: &str = "/api/qt/stock/kline/get";

/// SH main + STAR, SZ main + ChiNext
const MARKET_FILTER: &str = "m:0+t:6,m:0+t:80,m:1+t:2,m:1+t:23,m:0+t:81+s:2048";

const SNAPSHOT_FIELDS: &str = "f2,f3,f5,f6,f9,f12,f14,f15,f16,f17,f18,f20,f23,f100";
const LISTING_FIELDS: &str = "f12,f14,f100";

const PAGE_SIZE: usize = 200;
const MAX_PAGES: usize = 60;

const REFERER_URL: &str = "https://quote.eastmoney.com/";

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.0.0",
];

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct ClistResponse {
    #[serde(default)]
    rc: i32,
    data: Option<ClistData>,
}

#[derive(Debug, Deserialize)]
struct ClistData {
    #[serde(default)]
    total: usize,
    #[serde(default)]
    diff: Vec<ClistRow>,
}

/// One table row. Numeric cells arrive as numbers, or as "-" when empty.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ClistRow {
    f2: Value,
    f3: Value,
    f5: Value,
    f6: Value,
    f9: Value,
    f12: Value,
    f14: Value,
    f15: Value,
    f16: Value,
    f17: Value,
    f18: Value,
    f20: Value,
    f23: Value,
    f100: Value,
}

#[derive(Debug, Deserialize)]
struct KlineResponse {
    #[serde(default)]
    rc: i32,
    data: Option<KlineData>,
}

#[derive(Debug, Deserialize)]
struct KlineData {
    #[serde(default)]
    klines: Vec<String>,
}

// ============================================================================
// Client
// ============================================================================

/// HTTP client for the eastmoney endpoints.
pub struct EastmoneyClient {
    client: reqwest::Client,
    base: String,
    hist_base: String,
    limiter: Arc<HostRateLimiter>,
    ua_cursor: AtomicUsize,
}

impl EastmoneyClient {
    /// Create a client.
    ///
    /// # Arguments
    /// * `base` - Origin serving the clist endpoint
    /// * `hist_base` - Origin serving the kline endpoint
    /// * `timeout` - Per-request timeout
    /// * `limiter` - Shared host pacing
    pub fn new(
        base: impl Into<String>,
        hist_base: impl Into<String>,
        timeout: Duration,
        limiter: Arc<HostRateLimiter>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .gzip(true)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            base: base.into().trim_end_matches('/').to_string(),
            hist_base: hist_base.into().trim_end_matches('/').to_string(),
            limiter,
            ua_cursor: AtomicUsize::new(0),
        }
    }

    pub fn from_config(
        cfg: &lynx_common::config::ProvidersConfig,
        limiter: Arc<HostRateLimiter>,
    ) -> Self {
        Self::new(
            cfg.eastmoney_base.clone(),
            cfg.eastmoney_hist_base.clone(),
            Duration::from_secs(cfg.request_timeout_secs),
            limiter,
        )
    }

    fn next_user_agent(&self) -> &'static str {
        let i = self.ua_cursor.fetch_add(1, Ordering::Relaxed);
        USER_AGENTS[i % USER_AGENTS.len()]
    }

    /// Paced GET returning a decoded JSON body.
    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> ProviderResult<T> {
        let url = reqwest::Url::parse_with_params(endpoint, query)
            .map_err(|e| ProviderError::InvalidRequest(e.to_string()))?;

        if let Some(host) = url.host_str() {
            self.limiter.wait_slot(host).await;
        }
        debug!(url = %url, "Requesting eastmoney");

        let response = self
            .client
            .get(url)
            .header(USER_AGENT, self.next_user_agent())
            .header(REFERER, REFERER_URL)
            .header(ACCEPT, "application/json, text/plain, */*")
            .header(ACCEPT_LANGUAGE, "zh-CN,zh;q=0.9,en;q=0.8")
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Network(format!("HTTP {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e))?;
        decode_body(&body)
    }

    async fn fetch_clist_page(&self, page: usize, fields: &str) -> ProviderResult<ClistData> {
        let endpoint = format!("{}{}", self.base, CLIST_PATH);
        let query = [
            ("pn", page.to_string()),
            ("pz", PAGE_SIZE.to_string()),
            ("po", "1".to_string()),
            ("np", "1".to_string()),
            ("fltt", "2".to_string()),
            ("invt", "2".to_string()),
            ("fid", "f12".to_string()),
            ("fs", MARKET_FILTER.to_string()),
            ("fields", fields.to_string()),
        ];

        let resp: ClistResponse = self.get_json(&endpoint, &query).await?;
        if resp.rc != 0 {
            return Err(ProviderError::MalformedResponse(format!("clist rc={}", resp.rc)));
        }
        Ok(resp.data.unwrap_or(ClistData {
            total: 0,
            diff: Vec::new(),
        }))
    }

    /// Walk every clist page.
    async fn fetch_clist(&self, fields: &str) -> ProviderResult<Vec<ClistRow>> {
        let mut rows = Vec::new();
        for page in 1..=MAX_PAGES {
            let data = self.fetch_clist_page(page, fields).await?;
            if data.diff.is_empty() {
                break;
            }
            rows.extend(data.diff);
            if rows.len() >= data.total {
                break;
            }
        }

        if rows.is_empty() {
            return Err(ProviderError::DataNotAvailable("empty market table".into()));
        }
        Ok(rows)
    }
}

#[async_trait]
impl SnapshotSource for EastmoneyClient {
    fn name(&self) -> &'static str {
        "eastmoney"
    }

    async fn fetch_snapshot(&self) -> ProviderResult<HashMap<String, SnapshotEntry>> {
        let rows = self.fetch_clist(SNAPSHOT_FIELDS).await?;
        let as_of = Utc::now();
        let total = rows.len();

        let entries: HashMap<String, SnapshotEntry> = rows
            .iter()
            .filter_map(|row| snapshot_entry(row, as_of))
            .collect();

        debug!(rows = total, entries = entries.len(), "Parsed market snapshot");
        Ok(entries)
    }

    async fn list_instruments(&self) -> ProviderResult<Vec<InstrumentMeta>> {
        let rows = self.fetch_clist(LISTING_FIELDS).await?;
        let mut instruments: Vec<InstrumentMeta> = rows
            .iter()
            .filter_map(|row| {
                let code = text(&row.f12)?;
                let name = text(&row.f14)?;
                let meta = InstrumentMeta::new(code, name);
                Some(match text(&row.f100) {
                    Some(industry) => meta.with_industry(industry),
                    None => meta,
                })
            })
            .filter(|meta| meta.market != Market::Unknown)
            .collect();
        instruments.sort_by(|a, b| a.code.cmp(&b.code));
        instruments.dedup_by(|a, b| a.code == b.code);
        Ok(instruments)
    }

    async fn fetch_history(
        &self,
        code: &str,
        period: Period,
        range: DateRange,
    ) -> ProviderResult<Vec<Candle>> {
        let endpoint = format!("{}{}", self.hist_base, KLINE_PATH);
        let query = [
            ("secid", secid(code)),
            ("klt", period.kline_code().to_string()),
            ("fqt", "1".to_string()),
            ("beg", range.start.format("%Y%m%d").to_string()),
            ("end", range.end.format("%Y%m%d").to_string()),
            ("fields1", "f1,f2,f3,f4,f5,f6".to_string()),
            ("fields2", "f51,f52,f53,f54,f55,f56,f57,f58,f59,f60,f61".to_string()),
        ];

        let resp: KlineResponse = self.get_json(&endpoint, &query).await?;
        if resp.rc != 0 {
            return Err(ProviderError::MalformedResponse(format!("kline rc={}", resp.rc)));
        }

        let klines = resp.data.map(|d| d.klines).unwrap_or_default();
        let candles = parse_klines(&klines);
        if candles.is_empty() {
            return Err(ProviderError::DataNotAvailable(format!("no klines for {code}")));
        }
        Ok(candles)
    }
}

// ============================================================================
// Parsing
// ============================================================================

fn decode_body<T: DeserializeOwned>(body: &str) -> ProviderResult<T> {
    let trimmed = body.trim_start();
    if trimmed.is_empty() {
        return Err(ProviderError::MalformedResponse("empty body".into()));
    }
    if trimmed.starts_with('<') {
        let preview: String = trimmed.chars().take(80).collect();
        return Err(ProviderError::MalformedResponse(format!("HTML instead of JSON: {preview}")));
    }
    serde_json::from_str(trimmed).map_err(|e| ProviderError::MalformedResponse(e.to_string()))
}

/// Market-prefixed id for the kline endpoint ("1.600519", "0.000001").
fn secid(code: &str) -> String {
    if Market::from_code(code).is_shanghai() {
        format!("1.{code}")
    } else {
        format!("0.{code}")
    }
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|v| v.is_finite())
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() && s.trim() != "-" => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Rows without a price (suspended, not yet listed) are dropped.
fn snapshot_entry(row: &ClistRow, as_of: chrono::DateTime<Utc>) -> Option<(String, SnapshotEntry)> {
    let code = text(&row.f12)?;
    let price = number(&row.f2)?;
    let entry = SnapshotEntry {
        name: text(&row.f14).unwrap_or_default(),
        price,
        change_pct: number(&row.f3).unwrap_or(0.0),
        open: number(&row.f17),
        high: number(&row.f15),
        low: number(&row.f16),
        volume: number(&row.f5).unwrap_or(0.0),
        amount: number(&row.f6).unwrap_or(0.0),
        pe: number(&row.f9),
        pb: number(&row.f23),
        market_cap: number(&row.f20),
        industry: text(&row.f100),
        as_of,
    };
    Some((code, entry))
}

/// Parse kline rows: "date,open,close,high,low,volume,amount,amplitude,pct,chg,turnover".
fn parse_klines(klines: &[String]) -> Vec<Candle> {
    let mut candles = Vec::with_capacity(klines.len());

    for line in klines {
        let parts: Vec<&str> = line.split(',').collect();
        if parts.len() < 7 {
            warn!(line = %line, "Invalid kline format");
            continue;
        }

        let Ok(date) = NaiveDate::parse_from_str(parts[0], "%Y-%m-%d") else {
            warn!(line = %line, "Invalid kline date");
            continue;
        };
        let field = |i: usize| parts.get(i).and_then(|s| s.parse::<f64>().ok());

        let (Some(open), Some(close), Some(high), Some(low)) =
            (field(1), field(2), field(3), field(4))
        else {
            warn!(line = %line, "Invalid kline prices");
            continue;
        };

        let change_amount = field(9).unwrap_or(0.0);
        candles.push(Candle {
            date,
            open,
            high,
            low,
            close,
            pre_close: field(9).map(|chg| close - chg),
            volume: field(5).unwrap_or(0.0),
            amount: field(6).unwrap_or(0.0),
            change_pct: field(8).unwrap_or(0.0),
            change_amount,
            turnover_rate: field(10),
        });
    }

    candles
}

//! HTTP routes for the screener service.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use lynx_common::{Error, Result};

use crate::circuit_breaker::CircuitSnapshot;
use crate::data::{
    format_amount, format_volume, CacheStats, Candle, DateRange, FreshnessTier, Market, Period,
};
use crate::screener::{ScreeningCriteria, ScreeningRequest, StrategyPreset};
use crate::tasks::TaskView;
use crate::ScreenerState;

const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 100;
/// Days of weekly bars scanned for the 52-week range.
const YEAR_DAYS: i64 = 365;

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub service: String,
}

#[derive(Debug, Serialize)]
pub struct ScreenAccepted {
    pub task_id: String,
    pub status: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub message: String,
    pub task_id: String,
}

#[derive(Debug, Serialize)]
pub struct TaskListResponse {
    pub tasks: Vec<TaskView>,
}

#[derive(Debug, Serialize)]
pub struct ActiveTaskResponse {
    pub active: bool,
    pub task: Option<TaskView>,
}

#[derive(Debug, Serialize)]
pub struct StrategyInfo {
    pub key: String,
    pub name: String,
    pub description: String,
    pub note: String,
    pub config: ScreeningCriteria,
}

#[derive(Debug, Serialize)]
pub struct StrategiesResponse {
    pub strategies: Vec<StrategyInfo>,
}

#[derive(Debug, Serialize)]
pub struct StockListItem {
    pub id: usize,
    pub code: String,
    pub name: String,
    pub industry: Option<String>,
    pub market: Market,
}

#[derive(Debug, Serialize)]
pub struct StockListResponse {
    pub stocks: Vec<StockListItem>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub total_pages: usize,
}

#[derive(Debug, Serialize)]
pub struct StockDetail {
    pub code: String,
    pub name: String,
    pub industry: Option<String>,
    pub market: Market,
    pub price: f64,
    pub change: f64,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub volume: String,
    pub turnover: String,
    pub pe: Option<f64>,
    pub pb: Option<f64>,
    pub market_cap: Option<String>,
    pub date: NaiveDate,
    pub freshness: FreshnessTier,
    pub is_realtime: bool,
    pub delay: String,
    pub high52w: Option<f64>,
    pub low52w: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub code: String,
    pub period: Period,
    pub data: Vec<Candle>,
}

#[derive(Debug, Serialize)]
pub struct CacheStatsResponse {
    #[serde(flatten)]
    pub cache: CacheStats,
    pub circuits: Vec<CircuitSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct ClearCacheResponse {
    pub message: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct SnapshotRefreshResponse {
    pub refreshed: bool,
    pub entries: usize,
}

// ============================================================================
// Query Types
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StockListQuery {
    pub page: Option<usize>,
    #[serde(alias = "pageSize")]
    pub page_size: Option<usize>,
    pub search: Option<String>,
    pub market: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct HistoryQuery {
    pub period: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

// ============================================================================
// Route Handlers
// ============================================================================

/// Health check endpoint
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        service: "lynx-screener".to_string(),
    })
}

/// Start a screening task.
pub async fn start_screening(
    State(state): State<Arc<ScreenerState>>,
    Json(request): Json<ScreeningRequest>,
) -> Result<(StatusCode, Json<ScreenAccepted>)> {
    let task_id = state.pipeline.submit(&request).await?;
    Ok((
        StatusCode::OK,
        Json(ScreenAccepted {
            task_id,
            status: "pending".to_string(),
            message: "screening task started".to_string(),
        }),
    ))
}

pub async fn get_task(
    State(state): State<Arc<ScreenerState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskView>> {
    let task = state
        .registry
        .get(&id)
        .await
        .ok_or_else(|| Error::NotFound(format!("task {id}")))?;
    Ok(Json(task.view(true)))
}

pub async fn cancel_task(
    State(state): State<Arc<ScreenerState>>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>> {
    state.registry.try_cancel(&id).await?;
    Ok(Json(CancelResponse {
        message: "task cancelled".to_string(),
        task_id: id,
    }))
}

pub async fn list_tasks(State(state): State<Arc<ScreenerState>>) -> Json<TaskListResponse> {
    let tasks = state
        .registry
        .list_all()
        .await
        .iter()
        .map(|task| task.view(false))
        .collect();
    Json(TaskListResponse { tasks })
}

pub async fn active_task(State(state): State<Arc<ScreenerState>>) -> Json<ActiveTaskResponse> {
    let task = state.registry.active().await.map(|task| task.view(false));
    Json(ActiveTaskResponse {
        active: task.is_some(),
        task,
    })
}

pub async fn list_strategies() -> Json<StrategiesResponse> {
    let strategies = StrategyPreset::ALL
        .iter()
        .map(|preset| StrategyInfo {
            key: preset.key().to_string(),
            name: preset.display_name().to_string(),
            description: preset.description().to_string(),
            note: preset.note().to_string(),
            config: ScreeningCriteria::from_preset(*preset),
        })
        .collect();
    Json(StrategiesResponse { strategies })
}

/// Paginated universe listing with optional search and board filter.
pub async fn list_stocks(
    State(state): State<Arc<ScreenerState>>,
    Query(query): Query<StockListQuery>,
) -> Result<Json<StockListResponse>> {
    let page = query.page.unwrap_or(1);
    let page_size = query.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
    if page == 0 {
        return Err(Error::InvalidInput("page must be at least 1".into()));
    }
    if page_size == 0 || page_size > MAX_PAGE_SIZE {
        return Err(Error::InvalidInput(format!(
            "page_size must be between 1 and {MAX_PAGE_SIZE}"
        )));
    }
    let market = match query.market.as_deref().filter(|m| !m.is_empty()) {
        Some(m) => Some(
            Market::parse(m).ok_or_else(|| Error::InvalidInput(format!("unknown market {m:?}")))?,
        ),
        None => None,
    };

    let universe = state.market.get_universe().await;
    if universe.is_empty() {
        return Err(Error::Upstream("instrument list unavailable".into()));
    }

    let search = query
        .search
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_lowercase);
    let filtered: Vec<_> = universe
        .iter()
        .filter(|meta| {
            search.as_deref().map_or(true, |needle| {
                meta.code.to_lowercase().contains(needle) || meta.name.to_lowercase().contains(needle)
            })
        })
        .filter(|meta| market.map_or(true, |m| meta.market == m))
        .collect();

    let total = filtered.len();
    let start = (page - 1).saturating_mul(page_size);
    let stocks = filtered
        .into_iter()
        .enumerate()
        .skip(start)
        .take(page_size)
        .map(|(i, meta)| StockListItem {
            id: i + 1,
            code: meta.code.clone(),
            name: meta.name.clone(),
            industry: meta.industry.clone(),
            market: meta.market,
        })
        .collect();

    Ok(Json(StockListResponse {
        stocks,
        total,
        page,
        page_size,
        total_pages: total.div_ceil(page_size),
    }))
}

/// Latest quote plus the 52-week range.
pub async fn get_stock(
    State(state): State<Arc<ScreenerState>>,
    Path(code): Path<String>,
) -> Result<Json<StockDetail>> {
    let quote = state
        .market
        .get_quote(&code)
        .await
        .ok_or_else(|| Error::NotFound(format!("no data for {code}")))?;

    let weekly = state
        .market
        .get_history(&code, Period::Weekly, Some(DateRange::last_days(YEAR_DAYS)))
        .await;
    let high52w = weekly.iter().map(|c| c.high).reduce(f64::max);
    let low52w = weekly.iter().map(|c| c.low).reduce(f64::min);

    let meta = state.market.get_instrument(&code).await;
    let (industry, market) = match meta {
        Some(meta) => (meta.industry, meta.market),
        None => (None, Market::from_code(&code)),
    };

    Ok(Json(StockDetail {
        industry,
        market,
        name: quote.name.clone(),
        price: quote.price,
        change: quote.change_pct,
        open: quote.open,
        high: quote.high,
        low: quote.low,
        volume: format_volume(quote.volume),
        turnover: format_amount(quote.turnover),
        pe: quote.pe,
        pb: quote.pb,
        market_cap: quote.market_cap.map(format_amount),
        date: quote.trade_date,
        is_realtime: quote.freshness == FreshnessTier::Live,
        freshness: quote.freshness,
        delay: quote.delay,
        high52w,
        low52w,
        code: quote.code,
    }))
}

pub async fn get_stock_history(
    State(state): State<Arc<ScreenerState>>,
    Path(code): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>> {
    let period = match query.period.as_deref() {
        None | Some("") => Period::Daily,
        Some(p) => Period::parse(p).ok_or_else(|| Error::InvalidInput(format!("unknown period {p:?}")))?,
    };
    let range = history_range(query.start_date.as_deref(), query.end_date.as_deref())?;

    let data = state.market.get_history(&code, period, range).await;
    if data.is_empty() {
        return Err(Error::NotFound(format!("no history for {code}")));
    }
    info!(code = %code, period = %period, bars = data.len(), "History served");
    Ok(Json(HistoryResponse { code, period, data }))
}

pub async fn cache_stats(State(state): State<Arc<ScreenerState>>) -> Json<CacheStatsResponse> {
    Json(CacheStatsResponse {
        cache: state.market.cache_stats(),
        circuits: state.market.circuit_states(),
    })
}

pub async fn clear_cache(State(state): State<Arc<ScreenerState>>) -> Json<ClearCacheResponse> {
    state.market.clear_cache();
    Json(ClearCacheResponse {
        message: "cache cleared".to_string(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

pub async fn refresh_snapshot(
    State(state): State<Arc<ScreenerState>>,
) -> Json<SnapshotRefreshResponse> {
    let refreshed = state.market.refresh_universe_snapshot().await;
    Json(SnapshotRefreshResponse {
        refreshed,
        entries: state.market.snapshot_len(),
    })
}

// ============================================================================
// Helpers
// ============================================================================

/// Parse `YYYYMMDD` or `YYYY-MM-DD`.
fn parse_date(s: &str) -> Result<NaiveDate> {
    let s = s.trim();
    NaiveDate::parse_from_str(s, "%Y%m%d")
        .or_else(|_| NaiveDate::parse_from_str(s, "%Y-%m-%d"))
        .map_err(|_| Error::InvalidInput(format!("invalid date {s:?}")))
}

/// Resolve optional query bounds. `None` lets the service pick its default.
fn history_range(start: Option<&str>, end: Option<&str>) -> Result<Option<DateRange>> {
    let start = start.filter(|s| !s.is_empty()).map(parse_date).transpose()?;
    let end = end.filter(|s| !s.is_empty()).map(parse_date).transpose()?;
    let range = match (start, end) {
        (None, None) => return Ok(None),
        (Some(start), None) => DateRange::new(start, DateRange::last_days(0).end),
        (None, Some(end)) => DateRange::new(end - chrono::Duration::days(90), end),
        (Some(start), Some(end)) => DateRange::new(start, end),
    };
    if range.start > range.end {
        return Err(Error::InvalidInput(format!(
            "start_date {} is after end_date {}",
            range.start, range.end
        )));
    }
    Ok(Some(range))
}

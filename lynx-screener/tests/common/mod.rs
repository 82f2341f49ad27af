//! Scripted providers shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lynx_screener::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use lynx_screener::data::{
    Backoff, CacheTtls, Candle, DataCache, DateRange, InstrumentMeta, MarketDataConfig,
    MarketDataService, Period, ProviderError, ProviderPool, ProviderResult, QuoteStore,
    RetryPolicy, SessionSource, SnapshotEntry, SnapshotSource,
};

// ─────────────────────────────────────────────────────────────────────────────
// Fixtures
// ─────────────────────────────────────────────────────────────────────────────

pub fn candle(date: NaiveDate, close: f64, change_pct: f64) -> Candle {
    Candle {
        date,
        open: close,
        high: close * 1.02,
        low: close * 0.98,
        close,
        pre_close: Some(close),
        volume: 12_000.0,
        amount: close * 1_200_000.0,
        change_pct,
        change_amount: 0.0,
        turnover_rate: Some(0.5),
    }
}

pub fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 5, d).unwrap_or_default()
}

pub fn entry(name: &str, price: f64, change_pct: f64) -> SnapshotEntry {
    SnapshotEntry {
        name: name.to_string(),
        price,
        change_pct,
        open: Some(price),
        high: Some(price),
        low: Some(price),
        volume: 10_000.0,
        amount: price * 1_000_000.0,
        pe: Some(20.0),
        pb: Some(2.0),
        market_cap: Some(1e11),
        industry: None,
        as_of: Utc::now(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Snapshot Provider
// ─────────────────────────────────────────────────────────────────────────────

/// HTTP-style provider whose answers are queued by the test.
#[derive(Default)]
pub struct ScriptedSnapshot {
    pub snapshots: Mutex<VecDeque<ProviderResult<HashMap<String, SnapshotEntry>>>>,
    pub listings: Mutex<VecDeque<ProviderResult<Vec<InstrumentMeta>>>>,
    pub history: Mutex<HashMap<String, ProviderResult<Vec<Candle>>>>,
    pub snapshot_calls: AtomicU32,
    pub listing_calls: AtomicU32,
    pub history_calls: AtomicU32,
}

impl ScriptedSnapshot {
    pub fn push_snapshot(&self, result: ProviderResult<HashMap<String, SnapshotEntry>>) {
        self.snapshots.lock().unwrap().push_back(result);
    }

    pub fn push_listing(&self, result: ProviderResult<Vec<InstrumentMeta>>) {
        self.listings.lock().unwrap().push_back(result);
    }

    pub fn set_history(&self, code: &str, result: ProviderResult<Vec<Candle>>) {
        self.history.lock().unwrap().insert(code.to_string(), result);
    }
}

#[async_trait]
impl SnapshotSource for ScriptedSnapshot {
    fn name(&self) -> &'static str {
        "eastmoney"
    }

    async fn fetch_snapshot(&self) -> ProviderResult<HashMap<String, SnapshotEntry>> {
        self.snapshot_calls.fetch_add(1, Ordering::SeqCst);
        self.snapshots
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::Network("no scripted snapshot".into())))
    }

    async fn list_instruments(&self) -> ProviderResult<Vec<InstrumentMeta>> {
        self.listing_calls.fetch_add(1, Ordering::SeqCst);
        self.listings
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::Network("no scripted listing".into())))
    }

    async fn fetch_history(
        &self,
        code: &str,
        _period: Period,
        _range: DateRange,
    ) -> ProviderResult<Vec<Candle>> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        self.history
            .lock()
            .unwrap()
            .get(code)
            .cloned()
            .unwrap_or_else(|| Err(ProviderError::DataNotAvailable(code.to_string())))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session Provider
// ─────────────────────────────────────────────────────────────────────────────

/// State behind the scripted session; the test keeps a handle to it.
///
/// Like the real client, a bar query holds the connection until it
/// completes, so an abandoned query leaves the session logged out.
#[derive(Default)]
pub struct SessionScript {
    pub bars: Mutex<HashMap<String, ProviderResult<Vec<Candle>>>>,
    pub eps: Mutex<HashMap<String, f64>>,
    pub delays: Mutex<HashMap<String, Duration>>,
    pub connected: AtomicBool,
    pub bar_calls: AtomicU32,
    pub eps_calls: AtomicU32,
    pub logins: AtomicU32,
    pub logouts: AtomicU32,
}

impl SessionScript {
    pub fn set_bars(&self, code: &str, result: ProviderResult<Vec<Candle>>) {
        self.bars.lock().unwrap().insert(code.to_string(), result);
    }

    pub fn set_eps(&self, code: &str, eps: f64) {
        self.eps.lock().unwrap().insert(code.to_string(), eps);
    }

    /// Hold bar replies for `code` back by `delay`.
    pub fn set_delay(&self, code: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(code.to_string(), delay);
    }
}

pub struct ScriptedSession(pub Arc<SessionScript>);

#[async_trait]
impl SessionSource for ScriptedSession {
    fn name(&self) -> &'static str {
        "baostock"
    }

    fn is_logged_in(&self) -> bool {
        self.0.connected.load(Ordering::SeqCst)
    }

    async fn login(&mut self) -> ProviderResult<()> {
        self.0.logins.fetch_add(1, Ordering::SeqCst);
        self.0.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn logout(&mut self) -> ProviderResult<()> {
        self.0.logouts.fetch_add(1, Ordering::SeqCst);
        self.0.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn query_bars(
        &mut self,
        code: &str,
        _period: Period,
        _range: DateRange,
    ) -> ProviderResult<Vec<Candle>> {
        self.0.bar_calls.fetch_add(1, Ordering::SeqCst);
        if !self.0.connected.swap(false, Ordering::SeqCst) {
            return Err(ProviderError::Auth("not logged in".into()));
        }
        let delay = self.0.delays.lock().unwrap().get(code).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let result = self
            .0
            .bars
            .lock()
            .unwrap()
            .get(code)
            .cloned()
            .unwrap_or_else(|| Err(ProviderError::DataNotAvailable(code.to_string())));
        if !matches!(result, Err(ProviderError::Disconnected(_))) {
            self.0.connected.store(true, Ordering::SeqCst);
        }
        result
    }

    async fn query_eps_ttm(
        &mut self,
        code: &str,
        _year: i32,
        _quarter: u32,
    ) -> ProviderResult<Option<f64>> {
        self.0.eps_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.0.eps.lock().unwrap().get(code).copied())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service Builder
// ─────────────────────────────────────────────────────────────────────────────

pub struct Harness {
    pub service: MarketDataService,
    pub snapshot: Arc<ScriptedSnapshot>,
    pub session: Arc<SessionScript>,
}

pub fn fast_config() -> MarketDataConfig {
    let retry = RetryPolicy::new(
        3,
        Backoff::Fixed {
            delay: Duration::from_millis(10),
        },
    );
    MarketDataConfig {
        universe_retry: retry.clone(),
        snapshot_retry: retry,
        ..MarketDataConfig::default()
    }
}

pub fn harness(store: Option<QuoteStore>) -> Harness {
    harness_with(store, CircuitBreakerConfig::default())
}

pub fn harness_with(store: Option<QuoteStore>, circuit: CircuitBreakerConfig) -> Harness {
    let snapshot = Arc::new(ScriptedSnapshot::default());
    let session = Arc::new(SessionScript::default());
    let pool = Arc::new(ProviderPool::new(
        snapshot.clone(),
        Box::new(ScriptedSession(Arc::clone(&session))),
        4,
    ));
    let service = MarketDataService::new(
        pool,
        Arc::new(CircuitBreakerRegistry::new(circuit)),
        Arc::new(DataCache::new(CacheTtls::default())),
        store,
        fast_config(),
    );
    Harness {
        service,
        snapshot,
        session,
    }
}

pub fn universe(codes: &[(&str, &str)]) -> Vec<InstrumentMeta> {
    codes
        .iter()
        .map(|(code, name)| InstrumentMeta::new(*code, *name))
        .collect()
}

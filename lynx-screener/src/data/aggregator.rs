//! Market data service: tiered lookups with provider failover.
//!
//! Every consumer shares one [`MarketDataService`]. Lookups walk the cache
//! tiers first and only then reach the providers, each call gated by that
//! provider's circuit. Single-entity lookups never fail loudly: a miss on
//! every tier is `None` or an empty vec.

use chrono::{Datelike, Duration as ChronoDuration, NaiveDate};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use lynx_common::Config;

use super::baostock::BaostockClient;
use super::cache::DataCache;
use super::eastmoney::EastmoneyClient;
use super::pool::{ProviderPool, SESSION_PROVIDER, SNAPSHOT_PROVIDER};
use super::provider::{ProviderError, ProviderResult, SnapshotSource};
use super::rate_limiter::HostRateLimiter;
use super::retry::{Backoff, RetryPolicy};
use super::store::QuoteStore;
use super::{
    china_today, round2, CacheStats, Candle, DateRange, FreshnessTier, InstrumentMeta, Period,
    Quote, UniverseSnapshot,
};
use crate::circuit_breaker::{CircuitBreakerRegistry, CircuitSnapshot};

/// Tunables for the service.
#[derive(Debug, Clone)]
pub struct MarketDataConfig {
    /// Oldest persisted quote still served
    pub persisted_max_age: Duration,
    /// Rows per transaction when writing the snapshot back
    pub write_back_chunk: usize,
    pub universe_retry: RetryPolicy,
    pub snapshot_retry: RetryPolicy,
    /// Calendar days of bars requested for a live quote
    pub quote_window_days: i64,
    /// Calendar days of klines requested from the fallback provider
    pub fallback_window_days: i64,
    /// Range used when a history request names none
    pub history_default_days: i64,
    /// Quarters searched for a reported EPS TTM
    pub eps_quarters: usize,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            persisted_max_age: Duration::from_secs(1800),
            write_back_chunk: 100,
            universe_retry: RetryPolicy::new(
                3,
                Backoff::Exponential {
                    base: Duration::from_secs(1),
                    factor: 2.0,
                    max: Duration::from_secs(4),
                },
            ),
            snapshot_retry: RetryPolicy::new(
                3,
                Backoff::Linear {
                    base: Duration::from_millis(1500),
                    step: Duration::from_secs(1),
                    jitter: Duration::from_millis(300),
                },
            ),
            quote_window_days: 30,
            fallback_window_days: 10,
            history_default_days: 90,
            eps_quarters: 4,
        }
    }
}

impl From<&Config> for MarketDataConfig {
    fn from(cfg: &Config) -> Self {
        Self {
            persisted_max_age: Duration::from_secs(cfg.cache.persisted_max_age_secs),
            write_back_chunk: cfg.storage.write_back_chunk,
            ..Self::default()
        }
    }
}

/// Resets the refresh flag when the refresh ends, panics included.
struct RefreshGuard(Arc<AtomicBool>);

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Shared market data service. Cheap to clone.
#[derive(Clone)]
pub struct MarketDataService {
    pool: Arc<ProviderPool>,
    circuits: Arc<CircuitBreakerRegistry>,
    cache: Arc<DataCache>,
    store: Option<QuoteStore>,
    config: MarketDataConfig,
    refreshing: Arc<AtomicBool>,
}

impl MarketDataService {
    pub fn new(
        pool: Arc<ProviderPool>,
        circuits: Arc<CircuitBreakerRegistry>,
        cache: Arc<DataCache>,
        store: Option<QuoteStore>,
        config: MarketDataConfig,
    ) -> Self {
        Self {
            pool,
            circuits,
            cache,
            store,
            config,
            refreshing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Wire up real providers, cache, and store from configuration.
    ///
    /// A store that cannot be opened is logged and skipped.
    pub fn from_config(cfg: &Config) -> Self {
        let limiter = Arc::new(HostRateLimiter::from_config(&cfg.providers));
        let eastmoney = Arc::new(EastmoneyClient::from_config(&cfg.providers, limiter));
        let baostock = Box::new(BaostockClient::from_config(&cfg.providers));
        let pool = Arc::new(ProviderPool::new(
            eastmoney,
            baostock,
            cfg.providers.concurrency,
        ));

        let store = match QuoteStore::open(&cfg.storage.db_path) {
            Ok(store) => Some(store),
            Err(e) => {
                warn!(error = %e, "Failed to initialize quote store, continuing without it");
                None
            }
        };

        Self::new(
            pool,
            Arc::new(CircuitBreakerRegistry::new((&cfg.circuit).into())),
            Arc::new(DataCache::new((&cfg.cache).into())),
            store,
            MarketDataConfig::from(cfg),
        )
    }

    // ========================================================================
    // Provider Calls
    // ========================================================================

    fn record<T>(&self, provider: &str, result: &ProviderResult<T>) {
        match result {
            Ok(_) => self.circuits.record_success(provider),
            Err(e) if e.was_attempted() => {
                self.circuits.record_failure(provider, e.trips_circuit());
            }
            Err(_) => {}
        }
    }

    /// Circuit-gated, semaphore-gated call to the snapshot provider.
    async fn call_snapshot<T, F, Fut>(&self, op: F) -> ProviderResult<T>
    where
        F: FnOnce(Arc<dyn SnapshotSource>) -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        if !self.circuits.allowed(SNAPSHOT_PROVIDER) {
            return Err(ProviderError::Unavailable(format!("{SNAPSHOT_PROVIDER} circuit open")));
        }
        let result = self.pool.with_snapshot(op).await;
        self.record(SNAPSHOT_PROVIDER, &result);
        result
    }

    /// Circuit-gated bar query on the session provider.
    async fn session_bars(
        &self,
        code: &str,
        period: Period,
        range: DateRange,
    ) -> ProviderResult<Vec<Candle>> {
        if !self.circuits.allowed(SESSION_PROVIDER) {
            return Err(ProviderError::Unavailable(format!("{SESSION_PROVIDER} circuit open")));
        }
        let mut session = self.pool.session().await?;
        let result = session.query_bars(code, period, range).await;
        drop(session);
        self.record(SESSION_PROVIDER, &result);
        result
    }

    async fn session_eps(&self, code: &str, year: i32, quarter: u32) -> ProviderResult<Option<f64>> {
        if !self.circuits.allowed(SESSION_PROVIDER) {
            return Err(ProviderError::Unavailable(format!("{SESSION_PROVIDER} circuit open")));
        }
        let mut session = self.pool.session().await?;
        let result = session.query_eps_ttm(code, year, quarter).await;
        drop(session);
        self.record(SESSION_PROVIDER, &result);
        result
    }

    // ========================================================================
    // Universe
    // ========================================================================

    /// Every listed instrument.
    ///
    /// Falls back to the last persisted list when the provider cannot be
    /// reached. Empty when neither source has anything.
    pub async fn get_universe(&self) -> Arc<Vec<InstrumentMeta>> {
        if let Some(list) = self.cache.universe.get(DataCache::UNIVERSE_KEY) {
            return list;
        }

        let result = self
            .config
            .universe_retry
            .run("list_instruments", |_| {
                self.call_snapshot(|source| async move { source.list_instruments().await })
            })
            .await;

        match result {
            Ok(list) if !list.is_empty() => {
                let list = Arc::new(list);
                info!(count = list.len(), "Loaded instrument universe");
                self.cache.universe.set(DataCache::UNIVERSE_KEY, Arc::clone(&list));
                if let Some(store) = self.store.clone() {
                    let to_save = Arc::clone(&list);
                    tokio::spawn(async move {
                        if let Err(e) = store.upsert_instruments(to_save).await {
                            warn!(error = %e, "Failed to persist instrument list");
                        }
                    });
                }
                return list;
            }
            Ok(_) => warn!("Provider returned an empty instrument universe"),
            Err(e) => warn!(error = %e, "Instrument universe fetch failed"),
        }

        // Not cached, so the next call tries the provider again
        let stored = match &self.store {
            Some(store) => store.load_instruments().await.unwrap_or_else(|e| {
                warn!(error = %e, "Failed to load stored instrument list");
                Vec::new()
            }),
            None => Vec::new(),
        };
        if stored.is_empty() {
            error!("Instrument universe unavailable");
        } else {
            warn!(count = stored.len(), "Serving stored instrument universe");
        }
        Arc::new(stored)
    }

    /// Metadata for one instrument from the universe.
    pub async fn get_instrument(&self, code: &str) -> Option<InstrumentMeta> {
        self.get_universe()
            .await
            .iter()
            .find(|meta| meta.code == code)
            .cloned()
    }

    /// Display name without touching any provider.
    fn known_name(&self, code: &str) -> String {
        if let Some(list) = self.cache.universe.get(DataCache::UNIVERSE_KEY) {
            if let Some(meta) = list.iter().find(|m| m.code == code) {
                return meta.name.clone();
            }
        }
        if let Some(snapshot) = self.cache.snapshot() {
            if let Some(entry) = snapshot.get(code) {
                return entry.name.clone();
            }
        }
        code.to_string()
    }

    // ========================================================================
    // Quotes
    // ========================================================================

    /// Latest quote, walking snapshot → persisted → memory → providers.
    pub async fn get_quote(&self, code: &str) -> Option<Quote> {
        match self.cache.fresh_snapshot() {
            Some(snapshot) => {
                if let Some(entry) = snapshot.get(code) {
                    return Some(Quote::from_snapshot(code, entry));
                }
            }
            None => self.spawn_refresh_if_due(),
        }

        if let Some(store) = &self.store {
            match store.latest_quote(code, self.config.persisted_max_age).await {
                Ok(Some(quote)) => return Some(quote),
                Ok(None) => {}
                Err(e) => debug!(code = code, error = %e, "Persisted quote lookup failed"),
            }
        }

        let key = DataCache::quote_key(code);
        if let Some(quote) = self.cache.quotes.get(&key) {
            return Some(quote);
        }

        let quote = self.fetch_live_quote(code).await?;
        self.cache.quotes.set(key, quote.clone());
        self.persist_quote(&quote);
        Some(quote)
    }

    async fn fetch_live_quote(&self, code: &str) -> Option<Quote> {
        let name = self.known_name(code);

        let range = DateRange::last_days(self.config.quote_window_days);
        match self.session_bars(code, Period::Daily, range).await {
            Ok(bars) => {
                if let Some(last) = bars.last() {
                    return Some(Quote::from_candle(code, &name, last, FreshnessTier::Live));
                }
            }
            Err(e) => debug!(code = code, provider = SESSION_PROVIDER, error = %e, "Live quote failed"),
        }

        let range = DateRange::last_days(self.config.fallback_window_days);
        let owned = code.to_string();
        let result = self
            .call_snapshot(move |source| async move {
                source.fetch_history(&owned, Period::Daily, range).await
            })
            .await;
        match result {
            Ok(bars) => bars
                .last()
                .map(|last| Quote::from_candle(code, &name, last, FreshnessTier::HistoricalFallback)),
            Err(e) => {
                debug!(code = code, provider = SNAPSHOT_PROVIDER, error = %e, "Fallback quote failed");
                None
            }
        }
    }

    fn persist_quote(&self, quote: &Quote) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let quote = quote.clone();
        tokio::spawn(async move {
            let code = quote.code.clone();
            if let Err(e) = store.upsert_quote(quote).await {
                debug!(code = %code, error = %e, "Failed to persist quote");
            }
        });
    }

    /// Quote for bulk scans: memory cache, then the session provider only.
    ///
    /// Asks for yesterday's bar first and widens to six days when that day
    /// has no trading. Never refreshes the snapshot and never calls the
    /// snapshot provider.
    pub async fn get_quote_fast(&self, code: &str) -> Option<Quote> {
        let key = DataCache::quote_key(code);
        if let Some(quote) = self.cache.quotes.get(&key) {
            return Some(quote);
        }

        let yesterday = china_today() - ChronoDuration::days(1);
        let narrow = DateRange::new(yesterday, yesterday);
        let bars = match self.session_bars(code, Period::Daily, narrow).await {
            Ok(bars) if !bars.is_empty() => bars,
            Ok(_) | Err(ProviderError::DataNotAvailable(_)) => {
                let wide = DateRange::new(yesterday - ChronoDuration::days(5), yesterday);
                match self.session_bars(code, Period::Daily, wide).await {
                    Ok(bars) => bars,
                    Err(e) => {
                        debug!(code = code, error = %e, "Fast quote failed");
                        return None;
                    }
                }
            }
            Err(e) => {
                debug!(code = code, error = %e, "Fast quote failed");
                return None;
            }
        };

        let last = bars.last()?;
        let quote = Quote::from_candle(code, &self.known_name(code), last, FreshnessTier::Live);
        self.cache.quotes.set(key, quote.clone());
        Some(quote)
    }

    // ========================================================================
    // History
    // ========================================================================

    /// Bars for `code`, oldest first. Defaults to the last 90 days.
    pub async fn get_history(
        &self,
        code: &str,
        period: Period,
        range: Option<DateRange>,
    ) -> Vec<Candle> {
        let range = range.unwrap_or_else(|| DateRange::last_days(self.config.history_default_days));
        let key = DataCache::history_key(code, period, &range);
        if let Some(bars) = self.cache.history.get(&key) {
            return bars;
        }

        let bars = match self.session_bars(code, period, range).await {
            Ok(bars) => bars,
            Err(e) => {
                debug!(code = code, provider = SESSION_PROVIDER, error = %e, "History fetch failed");
                let owned = code.to_string();
                match self
                    .call_snapshot(move |source| async move {
                        source.fetch_history(&owned, period, range).await
                    })
                    .await
                {
                    Ok(bars) => bars,
                    Err(e) => {
                        debug!(code = code, provider = SNAPSHOT_PROVIDER, error = %e, "History fallback failed");
                        Vec::new()
                    }
                }
            }
        };

        if !bars.is_empty() {
            self.cache.history.set(key, bars.clone());
        }
        bars
    }

    // ========================================================================
    // Fundamentals
    // ========================================================================

    /// Price over the most recent reported EPS TTM, rounded to cents.
    ///
    /// `None` for a non-positive price, a non-positive EPS, or no report in
    /// the searched quarters.
    pub async fn get_pe_ttm(&self, code: &str, price: f64) -> Option<f64> {
        if price.is_nan() || price <= 0.0 {
            return None;
        }

        let eps = match self.cache.fundamentals.get(code) {
            Some(eps) => eps,
            None => {
                let eps = self.find_eps_ttm(code).await?;
                self.cache.fundamentals.set(code, eps);
                eps
            }
        };

        if eps <= 0.0 {
            debug!(code = code, eps = eps, "Non-positive EPS TTM");
            return None;
        }
        Some(round2(price / eps))
    }

    async fn find_eps_ttm(&self, code: &str) -> Option<f64> {
        for (year, quarter) in recent_quarters(china_today(), self.config.eps_quarters) {
            match self.session_eps(code, year, quarter).await {
                Ok(Some(eps)) => {
                    debug!(code = code, year, quarter, eps, "Found EPS TTM");
                    return Some(eps);
                }
                Ok(None) | Err(ProviderError::DataNotAvailable(_)) => continue,
                Err(e) => {
                    debug!(code = code, error = %e, "EPS lookup failed");
                    return None;
                }
            }
        }
        None
    }

    // ========================================================================
    // Snapshot
    // ========================================================================

    fn spawn_refresh_if_due(&self) {
        if self.refreshing.load(Ordering::SeqCst) || !self.cache.snapshot_refresh_due() {
            return;
        }
        let service = self.clone();
        tokio::spawn(async move {
            service.refresh_universe_snapshot().await;
        });
    }

    /// Fetch a new whole-market snapshot and swap it in.
    ///
    /// Returns false when the circuit is open, a refresh is already running,
    /// or every attempt failed. The previous snapshot is kept on failure.
    pub async fn refresh_universe_snapshot(&self) -> bool {
        if self.refreshing.swap(true, Ordering::SeqCst) {
            debug!("Snapshot refresh already running");
            return false;
        }
        let _guard = RefreshGuard(Arc::clone(&self.refreshing));

        if !self.circuits.allowed(SNAPSHOT_PROVIDER) {
            debug!("Snapshot refresh skipped, circuit open");
            self.cache.mark_snapshot_attempt();
            return false;
        }

        let result = self
            .config
            .snapshot_retry
            .run("fetch_snapshot", |_| {
                self.call_snapshot(|source| async move { source.fetch_snapshot().await })
            })
            .await;

        let entries = match result {
            Ok(entries) if !entries.is_empty() => entries,
            Ok(_) => {
                warn!("Snapshot refresh returned no rows");
                self.cache.mark_snapshot_attempt();
                return false;
            }
            Err(e) => {
                warn!(error = %e, "Snapshot refresh failed");
                self.cache.mark_snapshot_attempt();
                return false;
            }
        };

        let count = entries.len();
        self.cache.store_snapshot(UniverseSnapshot::new(entries));
        info!(entries = count, "Market snapshot refreshed");

        if let (Some(store), Some(snapshot)) = (self.store.clone(), self.cache.snapshot()) {
            let chunk = self.config.write_back_chunk;
            tokio::spawn(async move {
                match store.bulk_upsert_snapshot(snapshot, chunk).await {
                    Ok(rows) => debug!(rows, "Snapshot written back"),
                    Err(e) => warn!(error = %e, "Snapshot write-back failed"),
                }
            });
        }
        true
    }

    /// Rows in the current snapshot, stale or not.
    pub fn snapshot_len(&self) -> usize {
        self.cache.snapshot().map_or(0, |s| s.len())
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
        info!("Market data cache cleared");
    }

    pub fn circuit_states(&self) -> Vec<CircuitSnapshot> {
        self.circuits.snapshot()
    }

    /// Log in to the session provider ahead of the first request.
    pub async fn warm_up(&self) {
        match self.pool.login().await {
            Ok(()) => info!(provider = SESSION_PROVIDER, "Session provider ready"),
            Err(e) => warn!(provider = SESSION_PROVIDER, error = %e, "Session login failed at startup"),
        }
    }

    /// Release provider resources.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
        info!("Market data service stopped");
    }
}

/// The `count` most recent (year, quarter) pairs, newest first, starting
/// with the quarter containing `today`.
pub(crate) fn recent_quarters(today: NaiveDate, count: usize) -> Vec<(i32, u32)> {
    let mut year = today.year();
    let mut quarter = (today.month() - 1) / 3 + 1;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push((year, quarter));
        if quarter == 1 {
            quarter = 4;
            year -= 1;
        } else {
            quarter -= 1;
        }
    }
    out
}

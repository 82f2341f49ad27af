//! Data cache for market data.
//!
//! In-memory TTL tiers for quotes, bar history, the instrument list, and
//! fundamentals, plus a single-slot tier holding the whole-market snapshot.
//!
//! Expiry is lazy: nothing sweeps in the background, a read that finds an
//! expired entry removes it. Tiers are `DashMap`s, so unrelated keys never
//! contend on one lock.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;

use super::{Candle, DateRange, InstrumentMeta, Period, Quote, UniverseSnapshot};

/// Cache entry with TTL
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn new(value: V, ttl: Duration) -> Self {
        Self {
            value,
            stored_at: Instant::now(),
            ttl,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) >= self.ttl
    }
}

// ============================================================================
// TTL Cache
// ============================================================================

/// Concurrent key/value store with per-entry TTL.
pub struct TtlCache<V> {
    entries: DashMap<String, CacheEntry<V>>,
    default_ttl: Duration,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
        }
    }

    /// Get a live entry. An expired entry is removed.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                return Some(entry.value.clone());
            }
        }

        // The read guard is gone; a writer may have refreshed the entry since
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        None
    }

    /// Store with the tier's default TTL.
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    /// Store with an explicit TTL.
    pub fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        self.entries.insert(key.into(), CacheEntry::new(value, ttl));
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Stored keys, expired ones included.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn stats(&self) -> TierStats {
        let now = Instant::now();
        let total_entries = self.entries.len();
        let expired_entries = self
            .entries
            .iter()
            .filter(|e| e.value().is_expired(now))
            .count();
        TierStats {
            total_entries,
            expired_entries,
            active_entries: total_entries.saturating_sub(expired_entries),
            ttl_secs: self.default_ttl.as_secs(),
        }
    }
}

/// Entry counts for one tier.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TierStats {
    pub total_entries: usize,
    pub expired_entries: usize,
    pub active_entries: usize,
    pub ttl_secs: u64,
}

// ============================================================================
// Snapshot Tier
// ============================================================================

#[derive(Default)]
struct SnapshotSlot {
    current: Option<Arc<UniverseSnapshot>>,
    stored_at: Option<Instant>,
    last_attempt: Option<Instant>,
}

// ============================================================================
// Data Cache
// ============================================================================

/// TTLs for each cache tier.
#[derive(Debug, Clone)]
pub struct CacheTtls {
    pub quote: Duration,
    pub history: Duration,
    pub universe: Duration,
    pub fundamentals: Duration,
    pub snapshot: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            quote: Duration::from_secs(300),
            history: Duration::from_secs(300),
            universe: Duration::from_secs(3600),
            fundamentals: Duration::from_secs(6 * 3600),
            snapshot: Duration::from_secs(300),
        }
    }
}

impl From<&lynx_common::config::CacheConfig> for CacheTtls {
    fn from(cfg: &lynx_common::config::CacheConfig) -> Self {
        Self {
            quote: Duration::from_secs(cfg.quote_ttl_secs),
            history: Duration::from_secs(cfg.history_ttl_secs),
            universe: Duration::from_secs(cfg.universe_ttl_secs),
            fundamentals: Duration::from_secs(cfg.fundamentals_ttl_secs),
            snapshot: Duration::from_secs(cfg.snapshot_ttl_secs),
        }
    }
}

/// Market data cache
pub struct DataCache {
    /// Single-symbol quotes: key = "quote:{code}"
    pub quotes: TtlCache<Quote>,
    /// Bar series: key = "history:{code}:{period}:{start}:{end}"
    pub history: TtlCache<Vec<Candle>>,
    /// Instrument list: key = "universe"
    pub universe: TtlCache<Arc<Vec<InstrumentMeta>>>,
    /// EPS TTM by code
    pub fundamentals: TtlCache<f64>,
    snapshot: RwLock<SnapshotSlot>,
    snapshot_ttl: Duration,
}

impl DataCache {
    /// Key of the instrument list in the universe tier.
    pub const UNIVERSE_KEY: &'static str = "universe";

    pub fn new(ttls: CacheTtls) -> Self {
        Self {
            quotes: TtlCache::new(ttls.quote),
            history: TtlCache::new(ttls.history),
            universe: TtlCache::new(ttls.universe),
            fundamentals: TtlCache::new(ttls.fundamentals),
            snapshot: RwLock::new(SnapshotSlot::default()),
            snapshot_ttl: ttls.snapshot,
        }
    }

    pub fn quote_key(code: &str) -> String {
        format!("quote:{code}")
    }

    pub fn history_key(code: &str, period: Period, range: &DateRange) -> String {
        format!("history:{code}:{period}:{}:{}", range.start, range.end)
    }

    /// Snapshot if it is younger than the snapshot TTL.
    pub fn fresh_snapshot(&self) -> Option<Arc<UniverseSnapshot>> {
        let slot = self.snapshot.read().ok()?;
        let stored_at = slot.stored_at?;
        if stored_at.elapsed() < self.snapshot_ttl {
            slot.current.clone()
        } else {
            None
        }
    }

    /// Snapshot regardless of age.
    pub fn snapshot(&self) -> Option<Arc<UniverseSnapshot>> {
        self.snapshot.read().ok()?.current.clone()
    }

    /// Replace the snapshot wholesale.
    pub fn store_snapshot(&self, snapshot: UniverseSnapshot) {
        if let Ok(mut slot) = self.snapshot.write() {
            let now = Instant::now();
            slot.current = Some(Arc::new(snapshot));
            slot.stored_at = Some(now);
            slot.last_attempt = Some(now);
        }
    }

    /// Stamp a refresh attempt without touching the stored snapshot.
    pub fn mark_snapshot_attempt(&self) {
        if let Ok(mut slot) = self.snapshot.write() {
            slot.last_attempt = Some(Instant::now());
        }
    }

    /// Whether a background refresh should be started: the snapshot is not
    /// fresh and no attempt was made within the last TTL window.
    pub fn snapshot_refresh_due(&self) -> bool {
        let Ok(slot) = self.snapshot.read() else {
            return false;
        };
        let fresh = slot
            .stored_at
            .is_some_and(|at| at.elapsed() < self.snapshot_ttl);
        let recently_attempted = slot
            .last_attempt
            .is_some_and(|at| at.elapsed() < self.snapshot_ttl);
        !fresh && !recently_attempted
    }

    /// Drop every tier.
    pub fn clear(&self) {
        self.quotes.clear();
        self.history.clear();
        self.universe.clear();
        self.fundamentals.clear();
        if let Ok(mut slot) = self.snapshot.write() {
            *slot = SnapshotSlot::default();
        }
    }

    pub fn stats(&self) -> CacheStats {
        let (snapshot_entries, snapshot_age_secs) = self
            .snapshot
            .read()
            .ok()
            .map(|slot| {
                (
                    slot.current.as_ref().map_or(0, |s| s.len()),
                    slot.stored_at.map(|at| at.elapsed().as_secs()),
                )
            })
            .unwrap_or((0, None));

        CacheStats {
            quotes: self.quotes.stats(),
            history: self.history.stats(),
            universe: self.universe.stats(),
            fundamentals: self.fundamentals.stats(),
            snapshot_entries,
            snapshot_age_secs,
            quote_keys: self.quotes.keys(),
        }
    }
}

impl Default for DataCache {
    fn default() -> Self {
        Self::new(CacheTtls::default())
    }
}

/// Cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub quotes: TierStats,
    pub history: TierStats,
    pub universe: TierStats,
    pub fundamentals: TierStats,
    pub snapshot_entries: usize,
    pub snapshot_age_secs: Option<u64>,
    pub quote_keys: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SnapshotEntry;
    use chrono::Utc;
    use std::collections::HashMap;

    fn entry(price: f64) -> SnapshotEntry {
        SnapshotEntry {
            name: "贵州茅台".into(),
            price,
            change_pct: 1.2,
            open: None,
            high: None,
            low: None,
            volume: 0.0,
            amount: 0.0,
            pe: None,
            pb: None,
            market_cap: None,
            industry: None,
            as_of: Utc::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_before_and_after_ttl() {
        let cache: TtlCache<String> = TtlCache::new(Duration::from_secs(300));
        cache.set_with_ttl("quote:600519", "v1".to_string(), Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(cache.get("quote:600519"), Some("v1".to_string()));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get("quote:600519"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_reclaimed_on_read() {
        let cache: TtlCache<u32> = TtlCache::new(Duration::from_secs(5));
        cache.set("a", 1);
        cache.set_with_ttl("b", 2, Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(6)).await;
        let stats = cache.stats();
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.expired_entries, 1);

        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.stats().total_entries, 1);
        assert_eq!(cache.get("b"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rewritten_entry_survives_expired_read() {
        let cache: TtlCache<u32> = TtlCache::new(Duration::from_secs(5));
        cache.set("k", 1);
        tokio::time::advance(Duration::from_secs(6)).await;

        cache.set("k", 2);
        assert_eq!(cache.get("k"), Some(2));
        assert_eq!(cache.stats().expired_entries, 0);
    }

    #[test]
    fn test_overwrite_resets_ttl() {
        let cache: TtlCache<u32> = TtlCache::new(Duration::from_secs(60));
        cache.set("k", 1);
        cache.set("k", 2);
        assert_eq!(cache.get("k"), Some(2));
        assert_eq!(cache.keys(), vec!["k".to_string()]);
    }

    #[test]
    fn test_concurrent_writers() {
        let cache = Arc::new(TtlCache::<usize>::new(Duration::from_secs(60)));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        cache.set(format!("{t}:{i}"), i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.stats().total_entries, 800);
        assert_eq!(cache.get("3:42"), Some(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_freshness_and_refresh_due() {
        let cache = DataCache::default();
        assert!(cache.fresh_snapshot().is_none());
        assert!(cache.snapshot_refresh_due());

        let mut entries = HashMap::new();
        entries.insert("600519".to_string(), entry(1700.0));
        cache.store_snapshot(UniverseSnapshot::new(entries));
        assert!(cache.fresh_snapshot().is_some());
        assert!(!cache.snapshot_refresh_due());

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(cache.fresh_snapshot().is_none());
        assert!(cache.snapshot().is_some());
        assert!(cache.snapshot_refresh_due());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_attempt_suppresses_refresh_storm() {
        let cache = DataCache::default();
        cache.mark_snapshot_attempt();
        assert!(!cache.snapshot_refresh_due());
        assert!(cache.snapshot().is_none());

        tokio::time::advance(Duration::from_secs(300)).await;
        assert!(cache.snapshot_refresh_due());
    }

    #[test]
    fn test_clear_drops_all_tiers() {
        let cache = DataCache::default();
        cache.fundamentals.set("600519", 68.5);
        cache.universe.set(DataCache::UNIVERSE_KEY, Arc::new(vec![]));
        let mut entries = HashMap::new();
        entries.insert("600519".to_string(), entry(1700.0));
        cache.store_snapshot(UniverseSnapshot::new(entries));

        cache.clear();

        assert!(cache.fundamentals.get("600519").is_none());
        assert!(cache.universe.get(DataCache::UNIVERSE_KEY).is_none());
        assert!(cache.snapshot().is_none());
        let stats = cache.stats();
        assert_eq!(stats.snapshot_entries, 0);
        assert!(stats.snapshot_age_secs.is_none());
    }

    #[test]
    fn test_history_key_layout() {
        let range = DateRange::new(
            chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            chrono::NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
        );
        assert_eq!(
            DataCache::history_key("000001", Period::Weekly, &range),
            "history:000001:weekly:2024-01-01:2024-03-31"
        );
    }
}

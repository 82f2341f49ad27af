//! Host-paced rate limiter for provider requests.
//!
//! Keeps a minimum spacing between consecutive requests to the same host,
//! no matter which caller sends them. Each host has its own lock, and the
//! wait-then-stamp sequence runs entirely inside it, so concurrent callers
//! queue up instead of firing together once the interval passes.

use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

type Slot = Arc<tokio::sync::Mutex<Option<Instant>>>;

/// Per-host minimum-interval limiter.
#[derive(Debug)]
pub struct HostRateLimiter {
    /// Interval by host suffix ("eastmoney.com")
    intervals: HashMap<String, Duration>,
    /// Interval for hosts with no entry
    default_interval: Duration,
    /// Upper bound of the random delay added to each wait
    jitter: Duration,
    /// Last request time per host
    slots: Mutex<HashMap<String, Slot>>,
}

impl HostRateLimiter {
    /// Create a limiter.
    ///
    /// # Arguments
    /// * `intervals` - Minimum spacing keyed by host or host suffix
    /// * `default_interval` - Spacing for hosts not listed
    pub fn new(intervals: HashMap<String, Duration>, default_interval: Duration) -> Self {
        Self {
            intervals,
            default_interval,
            jitter: Duration::from_millis(50),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Set the jitter bound.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Build from provider configuration.
    pub fn from_config(cfg: &lynx_common::config::ProvidersConfig) -> Self {
        let intervals = cfg
            .host_intervals_ms
            .iter()
            .map(|(host, ms)| (host.to_ascii_lowercase(), Duration::from_millis(*ms)))
            .collect();
        Self::new(intervals, Duration::from_millis(cfg.default_interval_ms))
            .with_jitter(Duration::from_millis(cfg.jitter_ms))
    }

    /// Minimum spacing for `host`. The longest matching suffix wins.
    pub fn min_interval(&self, host: &str) -> Duration {
        let host = host.to_ascii_lowercase();
        self.intervals
            .iter()
            .filter(|(key, _)| host == **key || host.ends_with(&format!(".{key}")))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, interval)| *interval)
            .unwrap_or(self.default_interval)
    }

    fn slot(&self, host: &str) -> Slot {
        match self.slots.lock() {
            Ok(mut slots) => Arc::clone(slots.entry(host.to_ascii_lowercase()).or_default()),
            // A poisoned map still hands out a working, if unshared, slot
            Err(_) => Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
    }

    /// Wait until `host` may be called again, then claim the slot.
    ///
    /// Returns how long the caller was held back.
    pub async fn wait_slot(&self, host: &str) -> Duration {
        let interval = self.min_interval(host);
        let slot = self.slot(host);
        let mut last = slot.lock().await;

        let mut waited = Duration::ZERO;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < interval {
                waited = interval - elapsed + self.jitter();
                debug!(host = host, wait_ms = waited.as_millis() as u64, "Pacing request");
                tokio::time::sleep(waited).await;
            }
        }

        *last = Some(Instant::now());
        waited
    }
}

impl Default for HostRateLimiter {
    fn default() -> Self {
        Self::from_config(&lynx_common::config::ProvidersConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_lookup() {
        let limiter = HostRateLimiter::default();
        assert_eq!(limiter.min_interval("push2.eastmoney.com"), Duration::from_secs(1));
        assert_eq!(limiter.min_interval("eastmoney.com"), Duration::from_secs(1));
        assert_eq!(limiter.min_interval("hq.sina.com.cn"), Duration::from_millis(800));
        assert_eq!(limiter.min_interval("www.baostock.com"), Duration::ZERO);
        assert_eq!(limiter.min_interval("example.org"), Duration::from_millis(500));
        // suffix must align on a label boundary
        assert_eq!(limiter.min_interval("noteastmoney.com"), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_call_is_immediate() {
        let limiter = HostRateLimiter::default();
        let waited = limiter.wait_slot("push2.eastmoney.com").await;
        assert_eq!(waited, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_calls_are_spaced() {
        let limiter = HostRateLimiter::default();
        let host = "push2.eastmoney.com";

        limiter.wait_slot(host).await;
        let first = Instant::now();
        limiter.wait_slot(host).await;
        let second = Instant::now();

        let gap = second - first;
        assert!(gap >= Duration::from_secs(1));
        assert!(gap < Duration::from_millis(1050));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_serialize() {
        let limiter = Arc::new(
            HostRateLimiter::new(HashMap::new(), Duration::from_millis(500))
                .with_jitter(Duration::ZERO),
        );

        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                limiter.wait_slot("example.org").await;
                Instant::now()
            }));
        }

        let mut stamps = Vec::new();
        for h in handles {
            stamps.push(h.await.unwrap());
        }
        stamps.sort();
        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(500));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hosts_do_not_block_each_other() {
        let limiter = HostRateLimiter::default();
        limiter.wait_slot("push2.eastmoney.com").await;
        let waited = limiter.wait_slot("hq.sina.com.cn").await;
        assert_eq!(waited, Duration::ZERO);
    }
}

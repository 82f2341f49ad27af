//! Circuit breaker registry for upstream providers.
//!
//! Each provider gets a binary gate. Tripping errors (malformed bodies, dropped
//! connections) are counted; once `failure_threshold` consecutive tripping
//! errors are seen the provider is skipped for `cooldown`. When the cooldown
//! ends the next call goes through as if nothing happened. There is no
//! half-open probe state.
//!
//! ```text
//! ┌─────────┐   threshold tripping failures   ┌────────┐
//! │ CLOSED  │ ──────────────────────────────▶ │  OPEN  │
//! │ (call)  │ ◀────────────────────────────── │ (skip) │
//! └─────────┘        cooldown elapsed         └────────┘
//! ```
//!
//! Generic errors are logged by callers and never reach the counter, so a
//! one-off timeout cannot take a provider out for ten minutes.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the circuit breaker registry
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive tripping failures before the circuit opens
    pub failure_threshold: u32,
    /// How long an open circuit stays open
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 2,
            cooldown: Duration::from_secs(600),
        }
    }
}

impl CircuitBreakerConfig {
    /// Set the failure threshold
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set the cooldown window
    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

impl From<&lynx_common::config::CircuitConfig> for CircuitBreakerConfig {
    fn from(cfg: &lynx_common::config::CircuitConfig) -> Self {
        Self::default()
            .failure_threshold(cfg.failure_threshold)
            .cooldown(Duration::from_secs(cfg.cooldown_secs))
    }
}

// ============================================================================
// Provider Circuit
// ============================================================================

#[derive(Debug, Default)]
struct ProviderCircuit {
    consecutive_failures: u32,
    open_until: Option<Instant>,
    times_opened: u32,
}

impl ProviderCircuit {
    fn is_open(&self, now: Instant) -> bool {
        self.open_until.is_some_and(|until| now < until)
    }
}

/// Point-in-time view of one provider's circuit.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub provider: String,
    pub open: bool,
    pub consecutive_failures: u32,
    /// Seconds until the circuit closes again, when open
    pub reopens_in_secs: Option<u64>,
    pub times_opened: u32,
}

// ============================================================================
// Registry
// ============================================================================

/// Per-provider circuit breakers.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    circuits: RwLock<HashMap<String, Arc<Mutex<ProviderCircuit>>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: RwLock::new(HashMap::new()),
        }
    }

    fn circuit(&self, provider: &str) -> Option<Arc<Mutex<ProviderCircuit>>> {
        if let Some(c) = self.circuits.read().ok()?.get(provider) {
            return Some(Arc::clone(c));
        }
        let mut map = self.circuits.write().ok()?;
        Some(Arc::clone(map.entry(provider.to_string()).or_default()))
    }

    /// Whether calls to `provider` may go through right now.
    pub fn allowed(&self, provider: &str) -> bool {
        let Some(circuit) = self.circuit(provider) else {
            return true;
        };
        let Ok(mut c) = circuit.lock() else {
            return true;
        };

        let now = Instant::now();
        if c.is_open(now) {
            return false;
        }
        if c.open_until.take().is_some() {
            debug!(provider = provider, "Circuit cooldown elapsed, allowing calls");
        }
        true
    }

    /// Record a failed call. Only `trips` failures move the counter.
    pub fn record_failure(&self, provider: &str, trips: bool) {
        if !trips {
            debug!(provider = provider, "Non-tripping provider failure");
            return;
        }
        let Some(circuit) = self.circuit(provider) else {
            return;
        };
        let Ok(mut c) = circuit.lock() else {
            return;
        };

        c.consecutive_failures += 1;
        if c.consecutive_failures >= self.config.failure_threshold {
            c.open_until = Some(Instant::now() + self.config.cooldown);
            c.consecutive_failures = 0;
            c.times_opened += 1;
            warn!(
                provider = provider,
                cooldown_secs = self.config.cooldown.as_secs(),
                "Circuit opened"
            );
        } else {
            debug!(
                provider = provider,
                failures = c.consecutive_failures,
                threshold = self.config.failure_threshold,
                "Tripping failure recorded"
            );
        }
    }

    /// Record a successful call.
    pub fn record_success(&self, provider: &str) {
        if let Some(circuit) = self.circuit(provider) {
            if let Ok(mut c) = circuit.lock() {
                c.consecutive_failures = 0;
            }
        }
    }

    /// State of every provider seen so far, sorted by name.
    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let now = Instant::now();
        let Ok(map) = self.circuits.read() else {
            return Vec::new();
        };
        let mut out: Vec<CircuitSnapshot> = map
            .iter()
            .filter_map(|(name, circuit)| {
                let c = circuit.lock().ok()?;
                let open = c.is_open(now);
                Some(CircuitSnapshot {
                    provider: name.clone(),
                    open,
                    consecutive_failures: c.consecutive_failures,
                    reopens_in_secs: c
                        .open_until
                        .filter(|_| open)
                        .map(|until| until.saturating_duration_since(now).as_secs()),
                    times_opened: c.times_opened,
                })
            })
            .collect();
        out.sort_by(|a, b| a.provider.cmp(&b.provider));
        out
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

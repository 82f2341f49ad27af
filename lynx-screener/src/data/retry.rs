//! Retry with backoff for provider calls.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use super::provider::{ProviderError, ProviderResult};

/// Backoff strategy between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Same delay after every failure.
    Fixed { delay: Duration },
    /// `base * factor^attempt`, capped at `max`.
    Exponential {
        base: Duration,
        factor: f64,
        max: Duration,
    },
    /// `base + step * attempt` plus up to `jitter` of random delay.
    Linear {
        base: Duration,
        step: Duration,
        jitter: Duration,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_secs(1),
            factor: 2.0,
            max: Duration::from_secs(4),
        }
    }
}

impl Backoff {
    /// Delay after the failed attempt `attempt` (0-based).
    pub fn delay(self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => delay,
            Self::Exponential { base, factor, max } => {
                let seconds = base.as_secs_f64() * factor.powi(attempt as i32);
                Duration::from_secs_f64(seconds.min(max.as_secs_f64()))
            }
            Self::Linear { base, step, jitter } => {
                let jitter_ms = jitter.as_millis() as u64;
                let extra = if jitter_ms == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=jitter_ms)
                };
                base + step * attempt + Duration::from_millis(extra)
            }
        }
    }
}

/// Bounded retry loop.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, first one included
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or
    /// runs out of attempts. `op` receives the 0-based attempt number.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> ProviderResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let mut last_err = ProviderError::Internal(format!("{label}: no attempt made"));
        for attempt in 0..self.max_attempts {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(op = label, attempt = attempt + 1, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(
                        op = label,
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "Attempt failed"
                    );
                    last_err = e;
                    if attempt + 1 < self.max_attempts {
                        tokio::time::sleep(self.backoff.delay(attempt)).await;
                    }
                }
            }
        }
        Err(last_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_exponential_backoff_caps() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(0), Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Duration::from_secs(2));
        assert_eq!(backoff.delay(2), Duration::from_secs(4));
        assert_eq!(backoff.delay(5), Duration::from_secs(4));
    }

    #[test]
    fn test_linear_backoff_within_jitter() {
        let backoff = Backoff::Linear {
            base: Duration::from_millis(1500),
            step: Duration::from_secs(1),
            jitter: Duration::from_millis(300),
        };
        for attempt in 0..3 {
            let delay = backoff.delay(attempt);
            let floor = Duration::from_millis(1500) + Duration::from_secs(attempt as u64);
            assert!(delay >= floor);
            assert!(delay <= floor + Duration::from_millis(300));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::default();

        let counter = Arc::clone(&calls);
        let result = policy
            .run("list", move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ProviderError::Network("timeout".into()))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(3, Backoff::Fixed { delay: Duration::from_secs(1) });

        let counter = Arc::clone(&calls);
        let result: ProviderResult<()> = policy
            .run("list", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::MalformedResponse("<html>".into())) }
            })
            .await;

        assert!(matches!(result, Err(ProviderError::MalformedResponse(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: ProviderResult<()> = RetryPolicy::default()
            .run("bars", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::DataNotAvailable("empty".into())) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

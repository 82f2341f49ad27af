//! Shared provider clients.
//!
//! The snapshot provider is stateless; up to `concurrency` calls run at once,
//! gated by a semaphore. The session provider sits behind a single async
//! mutex held across login and query, so its connection is never used by
//! two tasks at a time.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, Semaphore};
use tokio::time::Instant;
use tracing::{info, warn};

use super::provider::{ProviderError, ProviderResult, SessionSource, SnapshotSource};
use super::{Candle, DateRange, Period};

/// Circuit name of the bulk snapshot provider.
pub const SNAPSHOT_PROVIDER: &str = "eastmoney";
/// Circuit name of the session provider.
pub const SESSION_PROVIDER: &str = "baostock";

/// Minimum spacing between login attempts after a failed login.
const LOGIN_RETRY_INTERVAL: Duration = Duration::from_secs(30);

struct SessionSlot {
    source: Box<dyn SessionSource>,
    last_login_failure: Option<Instant>,
}

impl SessionSlot {
    async fn login(&mut self) -> ProviderResult<()> {
        match self.source.login().await {
            Ok(()) => {
                self.last_login_failure = None;
                Ok(())
            }
            Err(e) => {
                self.last_login_failure = Some(Instant::now());
                Err(e)
            }
        }
    }
}

/// Exclusive handle on the session provider.
///
/// Holds the session lock until dropped. Login state is read back from the
/// client after every call, so a call that lost the connection (or was
/// abandoned mid-flight) makes the next caller log in again.
pub struct SessionGuard<'a> {
    slot: MutexGuard<'a, SessionSlot>,
}

impl SessionGuard<'_> {
    fn observe<T>(&self, result: &ProviderResult<T>) {
        if !self.slot.source.is_logged_in() {
            let error = result.as_ref().err().map(ToString::to_string);
            warn!(provider = SESSION_PROVIDER, error = ?error, "Session lost, will log in again");
        }
    }

    pub async fn query_bars(
        &mut self,
        code: &str,
        period: Period,
        range: DateRange,
    ) -> ProviderResult<Vec<Candle>> {
        let result = self.slot.source.query_bars(code, period, range).await;
        self.observe(&result);
        result
    }

    pub async fn query_eps_ttm(
        &mut self,
        code: &str,
        year: i32,
        quarter: u32,
    ) -> ProviderResult<Option<f64>> {
        let result = self.slot.source.query_eps_ttm(code, year, quarter).await;
        self.observe(&result);
        result
    }
}

/// Provider clients shared by every caller.
pub struct ProviderPool {
    snapshot: Arc<dyn SnapshotSource>,
    permits: Arc<Semaphore>,
    session: Mutex<SessionSlot>,
}

impl ProviderPool {
    pub fn new(
        snapshot: Arc<dyn SnapshotSource>,
        session: Box<dyn SessionSource>,
        concurrency: usize,
    ) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            snapshot,
            permits: Arc::new(Semaphore::new(concurrency)),
            session: Mutex::new(SessionSlot {
                source: session,
                last_login_failure: None,
            }),
        }
    }

    /// Run `op` against the snapshot provider while holding a permit.
    pub async fn with_snapshot<T, F, Fut>(&self, op: F) -> ProviderResult<T>
    where
        F: FnOnce(Arc<dyn SnapshotSource>) -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ProviderError::Unavailable("provider pool closed".into()))?;
        op(Arc::clone(&self.snapshot)).await
    }

    /// Lock the session provider, logging in first when needed.
    ///
    /// After a failed login, further attempts are refused with
    /// [`ProviderError::Unavailable`] until the retry interval has passed.
    pub async fn session(&self) -> ProviderResult<SessionGuard<'_>> {
        let mut slot = self.session.lock().await;
        if !slot.source.is_logged_in() {
            if let Some(at) = slot.last_login_failure {
                if at.elapsed() < LOGIN_RETRY_INTERVAL {
                    return Err(ProviderError::Unavailable("session login backing off".into()));
                }
            }
            if let Err(e) = slot.login().await {
                warn!(provider = SESSION_PROVIDER, error = %e, "Session login failed");
                return Err(ProviderError::Unavailable(format!("session login failed: {e}")));
            }
            info!(provider = SESSION_PROVIDER, "Session re-established");
        }
        Ok(SessionGuard { slot })
    }

    /// Log in at startup. Failure leaves the session down; later calls retry.
    pub async fn login(&self) -> ProviderResult<()> {
        let mut slot = self.session.lock().await;
        if slot.source.is_logged_in() {
            return Ok(());
        }
        slot.login().await
    }

    /// Log out and stop handing out snapshot permits.
    pub async fn shutdown(&self) {
        self.permits.close();
        let mut slot = self.session.lock().await;
        if slot.source.is_logged_in() {
            if let Err(e) = slot.source.logout().await {
                warn!(provider = SESSION_PROVIDER, error = %e, "Logout failed");
            }
        }
    }
}

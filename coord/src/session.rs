//! Process-scoped leases kept alive from a background task.

use crate::store::Store;
use crate::{Error, LeaseId, Result};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

/// Default lease TTL requested from the store.
pub const DEFAULT_TTL: Duration = Duration::from_secs(10);

/// Default renewal cadence, a fifth of the default TTL.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(2);

/// Liveness of a session. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Lease is held and renewed.
    Active,
    /// `close()` was called; dependents must stop trusting the lease.
    Closing,
    /// Lease is gone or no longer renewed. Terminal.
    Dead,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub ttl: Duration,
    pub keep_alive_interval: Duration,
    /// Consecutive failed renewals tolerated before the session is declared dead.
    pub max_keep_alive_failures: u32,
    pub initial_backoff: Duration,
    /// Defaults to a quarter of the TTL.
    pub max_backoff: Option<Duration>,
    /// Per-renewal deadline. Defaults to a third of the TTL.
    pub request_timeout: Option<Duration>,
    /// Upper bound on the lease revoke performed by `close()`.
    pub close_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_KEEP_ALIVE_INTERVAL)
    }
}

impl SessionConfig {
    pub fn new(ttl: Duration, keep_alive_interval: Duration) -> Self {
        Self {
            ttl,
            keep_alive_interval,
            max_keep_alive_failures: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: None,
            request_timeout: None,
            close_timeout: Duration::from_secs(1),
        }
    }

    pub fn with_max_keep_alive_failures(mut self, failures: u32) -> Self {
        self.max_keep_alive_failures = failures;
        self
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = Some(backoff);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn max_backoff(&self) -> Duration {
        self.max_backoff.unwrap_or(self.ttl / 4)
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout.unwrap_or(self.ttl / 3)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ttl.is_zero() {
            return Err(Error::InvalidConfig("ttl must be positive".into()));
        }
        if self.keep_alive_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "keep-alive interval must be positive".into(),
            ));
        }
        if self.keep_alive_interval * 2 >= self.ttl {
            return Err(Error::InvalidConfig(format!(
                "keep-alive interval {:?} must be less than half the ttl {:?}",
                self.keep_alive_interval, self.ttl
            )));
        }
        if self.max_keep_alive_failures == 0 {
            return Err(Error::InvalidConfig(
                "max keep-alive failures must be at least 1".into(),
            ));
        }
        if self.initial_backoff.is_zero() || self.initial_backoff > self.max_backoff() {
            return Err(Error::InvalidConfig(format!(
                "initial backoff {:?} must be positive and at most the max backoff {:?}",
                self.initial_backoff,
                self.max_backoff()
            )));
        }
        if self.max_backoff() >= self.ttl {
            return Err(Error::InvalidConfig(format!(
                "max backoff {:?} must be below the ttl {:?}",
                self.max_backoff(),
                self.ttl
            )));
        }
        if self.request_timeout().is_zero() {
            return Err(Error::InvalidConfig("request timeout must be positive".into()));
        }
        Ok(())
    }

    /// Renewal cadence for a lease the store granted with `ttl`, which may be
    /// shorter than requested.
    fn interval_for(&self, ttl: Duration) -> Duration {
        self.keep_alive_interval.min(ttl / 3)
    }

    /// Delay before retry number `failures` (1-based), with up to 10% jitter.
    fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff());
        let jitter_ms = (base.as_millis() / 10) as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        (base + jitter).min(self.max_backoff())
    }
}

/// A lease held by this process.
///
/// Cloning is cheap; all clones share one lease and one keep-alive task.
/// Dropping the last clone stops renewing without revoking, so the store
/// expires the lease after its TTL.
#[derive(Debug, Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    store: Arc<dyn Store>,
    lease: LeaseId,
    ttl: Duration,
    config: SessionConfig,
    shared: Arc<Shared>,
    keep_alive: Mutex<Option<JoinHandle<()>>>,
}

/// State visible to both the handles and the keep-alive task.
#[derive(Debug)]
struct Shared {
    state: watch::Sender<SessionState>,
    cause: Mutex<Option<Error>>,
    shutdown: Notify,
}

impl Shared {
    fn current(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Moves to Dead exactly once; later calls are ignored.
    /// The cause is recorded before waiters are woken.
    fn die(&self, cause: Option<Error>) -> bool {
        self.state.send_if_modified(|state| {
            if *state == SessionState::Dead {
                false
            } else {
                *self.cause.lock() = cause;
                *state = SessionState::Dead;
                true
            }
        })
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self.keep_alive.lock().take() {
            handle.abort();
        }
    }
}

impl Session {
    /// Grants a lease and starts renewing it.
    pub async fn open(store: Arc<dyn Store>, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let grant = store.grant_lease(config.ttl).await?;
        debug!(lease = %grant.id, ttl = ?grant.ttl, "session opened");
        Ok(Self::start(store, grant.id, grant.ttl, config))
    }

    /// Adopts a lease granted earlier, e.g. by a previous run of this
    /// process, after checking with one renewal that the store still has it.
    pub async fn resume(store: Arc<dyn Store>, lease: LeaseId, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let ack = store.keep_alive(lease).await?;
        debug!(lease = %lease, ttl = ?ack.ttl, "session resumed");
        Ok(Self::start(store, lease, ack.ttl, config))
    }

    fn start(store: Arc<dyn Store>, lease: LeaseId, ttl: Duration, config: SessionConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Active);
        let shared = Arc::new(Shared {
            state,
            cause: Mutex::new(None),
            shutdown: Notify::new(),
        });
        let handle = tokio::spawn(keep_alive_loop(
            store.clone(),
            lease,
            ttl,
            config.clone(),
            shared.clone(),
        ));
        Self {
            inner: Arc::new(Inner {
                store,
                lease,
                ttl,
                config,
                shared,
                keep_alive: Mutex::new(Some(handle)),
            }),
        }
    }

    /// The session's lease; `SessionLost` once the session is closing or dead.
    pub fn lease(&self) -> Result<LeaseId> {
        if self.is_active() {
            Ok(self.inner.lease)
        } else {
            Err(Error::SessionLost)
        }
    }

    /// The lease id regardless of state, for logging and key naming.
    pub fn lease_id(&self) -> LeaseId {
        self.inner.lease
    }

    /// TTL granted by the store.
    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SessionState {
        self.inner.shared.current()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Why the session died; `None` while alive or after a clean `close()`.
    pub fn death_cause(&self) -> Option<Error> {
        self.inner.shared.cause.lock().clone()
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    /// Resolves once the session is Dead. Any number of callers may wait.
    pub async fn done(&self) {
        let mut rx = self.inner.shared.state.subscribe();
        let _ = rx.wait_for(|state| *state == SessionState::Dead).await;
    }

    /// Resolves as soon as the session stops being Active.
    pub async fn lost(&self) {
        let mut rx = self.inner.shared.state.subscribe();
        let _ = rx.wait_for(|state| *state != SessionState::Active).await;
    }

    /// Asks the store whether the lease still exists.
    ///
    /// A `LeaseNotFound` answer kills the session on the spot and yields
    /// `SessionLost`, without waiting for the next renewal to notice. Other
    /// errors are returned as they are and leave the verdict to the
    /// keep-alive task.
    pub async fn verify_lease(&self) -> Result<()> {
        let lease = self.lease()?;
        let attempt = tokio::time::timeout(
            self.inner.config.request_timeout(),
            self.inner.store.keep_alive(lease),
        )
        .await
        .unwrap_or_else(|_| Err(Error::unavailable("lease check timed out")));

        match attempt {
            Ok(_) => Ok(()),
            Err(Error::LeaseNotFound(id)) => {
                if self.inner.shared.die(Some(Error::LeaseNotFound(id))) {
                    error!(lease = %lease, "lease no longer exists, session dead");
                }
                self.inner.shared.shutdown.notify_one();
                Err(Error::SessionLost)
            }
            Err(e) => Err(e),
        }
    }

    /// Stops renewing and revokes the lease, best effort.
    ///
    /// The session is Closing from the moment this is called and Dead once the
    /// revoke finishes or `close_timeout` passes. Calling it again waits for
    /// the first call to finish.
    pub async fn close(&self) -> Result<()> {
        let shared = &self.inner.shared;
        let began = shared.state.send_if_modified(|state| {
            if *state == SessionState::Active {
                *state = SessionState::Closing;
                true
            } else {
                false
            }
        });
        if !began {
            self.done().await;
            return Ok(());
        }
        shared.shutdown.notify_one();

        let lease = self.inner.lease;
        match tokio::time::timeout(
            self.inner.config.close_timeout,
            self.inner.store.revoke_lease(lease),
        )
        .await
        {
            Ok(Ok(())) => debug!(lease = %lease, "lease revoked"),
            Ok(Err(e)) => warn!(lease = %lease, error = %e, "lease revoke failed"),
            Err(_) => warn!(lease = %lease, "lease revoke timed out"),
        }
        shared.die(None);
        Ok(())
    }
}

async fn keep_alive_loop(
    store: Arc<dyn Store>,
    lease: LeaseId,
    ttl: Duration,
    config: SessionConfig,
    shared: Arc<Shared>,
) {
    let mut interval = config.interval_for(ttl);
    let mut wait = interval;
    let mut failures = 0u32;
    let mut last_ack = Instant::now();

    loop {
        tokio::select! {
            _ = shared.shutdown.notified() => return,
            _ = tokio::time::sleep(wait) => {}
        }
        if shared.current() != SessionState::Active {
            return;
        }

        let attempt = tokio::time::timeout(config.request_timeout(), store.keep_alive(lease))
            .await
            .unwrap_or_else(|_| Err(Error::unavailable("keep-alive timed out")));

        match attempt {
            Ok(ack) => {
                if failures > 0 {
                    debug!(lease = %lease, failures, "keep-alive recovered");
                }
                failures = 0;
                last_ack = Instant::now();
                if ack.ttl < ttl {
                    let tightened = config.interval_for(ack.ttl);
                    if tightened < interval {
                        debug!(lease = %lease, ttl = ?ack.ttl, "store shortened ttl");
                        interval = tightened;
                    }
                }
                wait = interval;
                trace!(lease = %lease, "keep-alive acknowledged");
            }
            Err(Error::LeaseNotFound(id)) => {
                error!(lease = %lease, "lease no longer exists, session dead");
                shared.die(Some(Error::LeaseNotFound(id)));
                return;
            }
            Err(e) => {
                failures += 1;
                if failures >= config.max_keep_alive_failures || last_ack.elapsed() >= ttl {
                    error!(lease = %lease, failures, error = %e, "keep-alive gave up, session dead");
                    shared.die(Some(e));
                    return;
                }
                wait = config.backoff(failures);
                warn!(lease = %lease, failures, error = %e, retry_in = ?wait, "keep-alive failed");
            }
        }
    }
}

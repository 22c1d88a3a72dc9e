//! Fault injection and polling helpers for exercising sessions and elections
//! against an in-process store.

use crate::election::{Election, ParticipantState};
use crate::session::SessionConfig;
use crate::store::{KeepAliveAck, LeaseGrant, PutResponse, Snapshot, Store, TxnOutcome, WatchStream};
use crate::{Error, LeaseId, Result, Revision};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::debug;

/// Short timings for tests: 500ms TTL renewed every 100ms.
pub fn fast_config() -> SessionConfig {
    SessionConfig::new(Duration::from_millis(500), Duration::from_millis(100))
        .with_initial_backoff(Duration::from_millis(20))
        .with_max_backoff(Duration::from_millis(100))
        .with_request_timeout(Duration::from_millis(100))
}

/// Wraps a store and makes it unreachable on demand.
///
/// While partitioned every call fails with `Unavailable` and open watch
/// streams end with an `Unavailable` error, as if the network dropped.
#[derive(Debug, Clone)]
pub struct PartitionedStore {
    inner: Arc<dyn Store>,
    faults: Arc<Faults>,
}

#[derive(Debug)]
struct Faults {
    partitioned: watch::Sender<bool>,
    failing_keep_alives: AtomicU32,
    latency: Mutex<Duration>,
}

impl PartitionedStore {
    pub fn new(inner: Arc<dyn Store>) -> Self {
        let (partitioned, _) = watch::channel(false);
        Self {
            inner,
            faults: Arc::new(Faults {
                partitioned,
                failing_keep_alives: AtomicU32::new(0),
                latency: Mutex::new(Duration::ZERO),
            }),
        }
    }

    pub fn inner(&self) -> &Arc<dyn Store> {
        &self.inner
    }

    pub fn partition(&self) {
        debug!("store partitioned");
        self.faults.partitioned.send_replace(true);
    }

    pub fn heal(&self) {
        debug!("store partition healed");
        self.faults.partitioned.send_replace(false);
    }

    pub fn is_partitioned(&self) -> bool {
        *self.faults.partitioned.borrow()
    }

    /// Fails the next `count` keep-alive calls with `Unavailable`, leaving
    /// everything else working.
    pub fn fail_keep_alives(&self, count: u32) {
        self.faults.failing_keep_alives.store(count, Ordering::SeqCst);
    }

    /// Adds a fixed delay before every call.
    pub fn set_latency(&self, latency: Duration) {
        *self.faults.latency.lock() = latency;
    }

    async fn check(&self) -> Result<()> {
        let latency = *self.faults.latency.lock();
        if !latency.is_zero() {
            sleep(latency).await;
        }
        if self.is_partitioned() {
            return Err(Error::unavailable("network partition"));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for PartitionedStore {
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseGrant> {
        self.check().await?;
        self.inner.grant_lease(ttl).await
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveAck> {
        self.check().await?;
        let injected = self
            .faults
            .failing_keep_alives
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::unavailable("injected keep-alive failure"));
        }
        self.inner.keep_alive(lease).await
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        self.check().await?;
        self.inner.revoke_lease(lease).await
    }

    async fn put(&self, key: &str, value: Bytes, lease: Option<LeaseId>) -> Result<PutResponse> {
        self.check().await?;
        self.inner.put(key, value, lease).await
    }

    async fn put_if_create_revision(
        &self,
        key: &str,
        value: Bytes,
        lease: Option<LeaseId>,
        expected: Revision,
    ) -> Result<TxnOutcome> {
        self.check().await?;
        self.inner.put_if_create_revision(key, value, lease, expected).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check().await?;
        self.inner.delete(key).await
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Snapshot> {
        self.check().await?;
        self.inner.get_prefix(prefix).await
    }

    async fn watch_prefix(&self, prefix: &str, from_revision: Revision) -> Result<WatchStream> {
        self.check().await?;
        let events = self.inner.watch_prefix(prefix, from_revision).await?;
        let partitioned = self.faults.partitioned.subscribe();

        let stream = futures::stream::unfold(
            (events, partitioned, false),
            |(mut events, mut partitioned, cut)| async move {
                if cut {
                    return None;
                }
                let next = tokio::select! {
                    biased;
                    _ = async { let _ = partitioned.wait_for(|p| *p).await; } => None,
                    item = events.next() => Some(item),
                };
                match next {
                    None => Some((
                        Err(Error::unavailable("network partition")),
                        (events, partitioned, true),
                    )),
                    Some(Some(item)) => Some((item, (events, partitioned, false))),
                    Some(None) => None,
                }
            },
        );
        Ok(stream.boxed())
    }
}

/// Polls `election.state()` until it equals `target`. Returns false on
/// timeout.
pub async fn wait_for_state(election: &Election, target: ParticipantState, timeout: Duration) -> bool {
    wait_until(timeout, || election.state() == target).await
}

/// Polls `condition` every few milliseconds until it holds or `timeout`
/// passes.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    tokio::time::timeout(timeout, async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}

use super::{
    EventKind, KeepAliveAck, KeyValue, LeaseGrant, PutResponse, Snapshot, Store, TxnOutcome,
    WatchEvent, WatchStream,
};
use crate::{Error, LeaseId, Result, Revision};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

/// How often the background reaper looks for expired leases.
const REAP_INTERVAL: Duration = Duration::from_millis(5);

/// Watch history retained by [`MemoryStore::new`]. Older revisions are
/// compacted automatically.
pub const DEFAULT_HISTORY_LIMIT: usize = 10_000;

/// In-process model of the coordination store.
///
/// Every operation is linearized through one mutex, revisions are a single
/// counter, leases expire on their deadline (checked on every call and by a
/// background reaper when a Tokio runtime is available) and revoke their keys
/// in one revision, the way etcd does.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    revision: Revision,
    compact_revision: Revision,
    kvs: BTreeMap<String, KeyValue>,
    history: VecDeque<WatchEvent>,
    history_limit: usize,
    leases: HashMap<LeaseId, LeaseEntry>,
    next_lease: i64,
    watchers: Vec<Watcher>,
}

#[derive(Debug)]
struct LeaseEntry {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
}

#[derive(Debug)]
struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<Result<WatchEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    /// A store that keeps at most `limit` watch events (at least one) and
    /// compacts older revisions as new ones arrive.
    pub fn with_history_limit(limit: usize) -> Self {
        let inner = Arc::new(Mutex::new(Inner {
            history_limit: limit.max(1),
            next_lease: 0x694d_0000,
            ..Inner::default()
        }));
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(reap(Arc::downgrade(&inner)));
        }
        Self { inner }
    }

    /// Current store revision.
    pub fn revision(&self) -> Revision {
        self.inner.lock().revision
    }

    pub fn lease_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.expire_due(Instant::now());
        inner.leases.len()
    }

    pub fn get(&self, key: &str) -> Option<KeyValue> {
        let mut inner = self.inner.lock();
        inner.expire_due(Instant::now());
        inner.kvs.get(key).cloned()
    }

    /// Expires a lease right now, as if its TTL had run out.
    pub fn expire_lease(&self, lease: LeaseId) -> bool {
        let mut inner = self.inner.lock();
        debug!(lease = %lease, "forcing lease expiry");
        inner.drop_lease(lease)
    }

    /// Discards history up to `revision` and cancels every open watch with
    /// `WatchCompacted`, modelling a compaction that overtook all watchers.
    pub fn compact(&self, revision: Revision) {
        let mut inner = self.inner.lock();
        let compact_revision = revision.min(inner.revision);
        inner.compact_revision = inner.compact_revision.max(compact_revision);
        while inner
            .history
            .front()
            .is_some_and(|ev| ev.revision <= compact_revision)
        {
            inner.history.pop_front();
        }
        for watcher in inner.watchers.drain(..) {
            let _ = watcher.tx.send(Err(Error::WatchCompacted { compact_revision }));
        }
        debug!(compact_revision, "store compacted");
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

async fn reap(inner: Weak<Mutex<Inner>>) {
    let mut interval = tokio::time::interval(REAP_INTERVAL);
    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.lock().expire_due(Instant::now());
    }
}

impl Inner {
    fn expire_due(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for lease in expired {
            trace!(lease = %lease, "lease expired");
            self.drop_lease(lease);
        }
    }

    /// Removes a lease and deletes its keys in a single revision.
    fn drop_lease(&mut self, lease: LeaseId) -> bool {
        let Some(entry) = self.leases.remove(&lease) else {
            return false;
        };
        if entry.keys.is_empty() {
            return true;
        }
        self.revision += 1;
        let revision = self.revision;
        for key in entry.keys {
            if let Some(mut kv) = self.kvs.remove(&key) {
                kv.mod_revision = revision;
                self.publish(WatchEvent {
                    kind: EventKind::Delete,
                    kv,
                    revision,
                });
            }
        }
        true
    }

    fn put(&mut self, key: &str, value: Bytes, lease: Option<LeaseId>) -> Result<PutResponse> {
        if let Some(lease) = lease {
            if !self.leases.contains_key(&lease) {
                return Err(Error::LeaseNotFound(lease));
            }
        }
        self.revision += 1;
        let revision = self.revision;
        let previous = self.kvs.get(key).cloned();
        let create_revision = previous.as_ref().map_or(revision, |kv| kv.create_revision);

        if let Some(old) = previous.and_then(|kv| kv.lease) {
            if Some(old) != lease {
                if let Some(entry) = self.leases.get_mut(&old) {
                    entry.keys.remove(key);
                }
            }
        }
        if let Some(lease) = lease {
            if let Some(entry) = self.leases.get_mut(&lease) {
                entry.keys.insert(key.to_string());
            }
        }

        let kv = KeyValue {
            key: key.to_string(),
            value,
            create_revision,
            mod_revision: revision,
            lease,
        };
        self.kvs.insert(key.to_string(), kv.clone());
        self.publish(WatchEvent {
            kind: EventKind::Put,
            kv,
            revision,
        });
        Ok(PutResponse {
            revision,
            create_revision,
        })
    }

    fn publish(&mut self, event: WatchEvent) {
        self.watchers.retain(|watcher| {
            if !event.kv.key.starts_with(&watcher.prefix) {
                return !watcher.tx.is_closed();
            }
            watcher.tx.send(Ok(event.clone())).is_ok()
        });
        self.history.push_back(event);
        if self.history.len() > self.history_limit {
            self.trim_history();
        }
    }

    /// Drops the oldest revisions until the history fits again. Whole
    /// revisions go at once so a watch never resumes halfway through one.
    fn trim_history(&mut self) {
        while self.history.len() > self.history_limit {
            let Some(oldest) = self.history.pop_front() else {
                break;
            };
            self.compact_revision = self.compact_revision.max(oldest.revision);
            while self
                .history
                .front()
                .is_some_and(|ev| ev.revision <= self.compact_revision)
            {
                self.history.pop_front();
            }
        }
        trace!(compact_revision = self.compact_revision, "history trimmed");
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseGrant> {
        if ttl.is_zero() {
            return Err(Error::InvalidConfig("lease TTL must be positive".into()));
        }
        let mut inner = self.inner.lock();
        inner.next_lease += 1;
        let id = LeaseId(inner.next_lease);
        inner.leases.insert(
            id,
            LeaseEntry {
                ttl,
                deadline: Instant::now() + ttl,
                keys: BTreeSet::new(),
            },
        );
        trace!(lease = %id, ?ttl, "lease granted");
        Ok(LeaseGrant { id, ttl })
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveAck> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.expire_due(now);
        let entry = inner
            .leases
            .get_mut(&lease)
            .ok_or(Error::LeaseNotFound(lease))?;
        entry.deadline = now + entry.ttl;
        Ok(KeepAliveAck { ttl: entry.ttl })
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.expire_due(Instant::now());
        if inner.drop_lease(lease) {
            trace!(lease = %lease, "lease revoked");
        }
        Ok(())
    }

    async fn put(&self, key: &str, value: Bytes, lease: Option<LeaseId>) -> Result<PutResponse> {
        let mut inner = self.inner.lock();
        inner.expire_due(Instant::now());
        inner.put(key, value, lease)
    }

    async fn put_if_create_revision(
        &self,
        key: &str,
        value: Bytes,
        lease: Option<LeaseId>,
        expected: Revision,
    ) -> Result<TxnOutcome> {
        let mut inner = self.inner.lock();
        inner.expire_due(Instant::now());
        let current = inner.kvs.get(key).cloned();
        let actual = current.as_ref().map_or(0, |kv| kv.create_revision);
        if actual != expected {
            return Ok(TxnOutcome::Failed(current));
        }
        inner.put(key, value, lease).map(TxnOutcome::Succeeded)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        inner.expire_due(Instant::now());
        let Some(mut kv) = inner.kvs.remove(key) else {
            return Ok(false);
        };
        if let Some(lease) = kv.lease {
            if let Some(entry) = inner.leases.get_mut(&lease) {
                entry.keys.remove(key);
            }
        }
        inner.revision += 1;
        let revision = inner.revision;
        kv.mod_revision = revision;
        inner.publish(WatchEvent {
            kind: EventKind::Delete,
            kv,
            revision,
        });
        Ok(true)
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Snapshot> {
        let mut inner = self.inner.lock();
        inner.expire_due(Instant::now());
        let mut kvs: Vec<KeyValue> = inner
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, kv)| kv.clone())
            .collect();
        kvs.sort_by_key(|kv| kv.create_revision);
        Ok(Snapshot {
            revision: inner.revision,
            kvs,
        })
    }

    async fn watch_prefix(&self, prefix: &str, from_revision: Revision) -> Result<WatchStream> {
        let mut inner = self.inner.lock();
        inner.expire_due(Instant::now());
        if from_revision > 0 && from_revision <= inner.compact_revision {
            return Err(Error::WatchCompacted {
                compact_revision: inner.compact_revision,
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        for event in inner
            .history
            .iter()
            .filter(|ev| ev.revision >= from_revision && ev.kv.key.starts_with(prefix))
        {
            let _ = tx.send(Ok(event.clone()));
        }
        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }
}

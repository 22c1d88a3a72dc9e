//! Leader election participants and observers.
//!
//! Each participant owns one candidacy key, `<election>/<lease-id-hex>`,
//! attached to its session's lease. Candidates are ranked by the revision at
//! which the store created their key; the lowest live revision leads. Nothing
//! here caches "I am leader" beyond what a snapshot or watch event has just
//! confirmed.

use crate::queue::{Candidate, ElectionQueue, QueueChange};
use crate::session::Session;
use crate::store::{Store, TxnOutcome, WatchStream};
use crate::{Error, LeaseId, Result, Revision};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantState {
    Idle,
    /// Candidacy being registered or verified.
    Campaigning,
    /// Registered, waiting for the candidates ahead to go away.
    Following,
    Leading,
    /// Terminal: resigned, or the session was lost.
    Resigned,
}

/// A resolved candidacy key, usually the current leader's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderKey {
    pub key: String,
    /// The identity the candidate published.
    pub value: Bytes,
    pub create_revision: Revision,
    pub lease: Option<LeaseId>,
}

impl LeaderKey {
    pub fn value_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.value)
    }
}

impl From<&Candidate> for LeaderKey {
    fn from(c: &Candidate) -> Self {
        Self {
            key: c.key.clone(),
            value: c.value.clone(),
            create_revision: c.create_revision,
            lease: c.lease,
        }
    }
}

#[derive(Debug, Clone)]
struct Candidacy {
    create_revision: Revision,
    value: Bytes,
}

/// One participant in a named election, bound to a session.
#[derive(Debug)]
pub struct Election {
    session: Session,
    name: String,
    prefix: String,
    key: String,
    state: watch::Sender<ParticipantState>,
    candidacy: Mutex<Option<Candidacy>>,
}

impl Election {
    pub fn new(session: &Session, name: impl Into<String>) -> Self {
        let name = name.into();
        let prefix = format!("{name}/");
        let key = format!("{prefix}{}", session.lease_id());
        let (state, _) = watch::channel(ParticipantState::Idle);
        Self {
            session: session.clone(),
            name,
            prefix,
            key,
            state,
            candidacy: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// This participant's candidacy key.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> ParticipantState {
        if !self.session.is_active() {
            self.transition(ParticipantState::Resigned);
        }
        *self.state.borrow()
    }

    pub fn is_leader(&self) -> bool {
        self.state() == ParticipantState::Leading
    }

    /// Waits until this participant leads the election.
    ///
    /// Fails with `SessionLost` if the session stops being active first, in
    /// which case the participant is Resigned.
    pub async fn campaign(&self, identity: impl Into<Bytes>) -> Result<LeaderKey> {
        self.campaign_until(identity, std::future::pending::<()>()).await
    }

    /// Like [`campaign`](Self::campaign), but gives up when `cancel`
    /// completes: the candidacy key is deleted and `Cancelled` returned.
    pub async fn campaign_until<F>(&self, identity: impl Into<Bytes>, cancel: F) -> Result<LeaderKey>
    where
        F: Future<Output = ()>,
    {
        let identity = identity.into();
        let lease = match self.session.lease() {
            Ok(lease) => lease,
            Err(e) => {
                self.transition(ParticipantState::Resigned);
                return Err(e);
            }
        };
        let mut rejected = None;
        self.state.send_if_modified(|state| match *state {
            ParticipantState::Idle => {
                *state = ParticipantState::Campaigning;
                true
            }
            other => {
                rejected = Some(other);
                false
            }
        });
        match rejected {
            None => {}
            Some(ParticipantState::Resigned) => {
                return Err(Error::InvalidState("participant has resigned".into()));
            }
            Some(other) => {
                return Err(Error::InvalidState(format!("campaign already running ({other:?})")));
            }
        }
        debug!(election = %self.name, key = %self.key, "campaign started");

        let outcome = tokio::select! {
            biased;
            _ = self.session.lost() => Err(Error::SessionLost),
            _ = cancel => Err(Error::Cancelled),
            result = self.run_campaign(lease, identity) => result,
        };

        match outcome {
            Ok(leader) => {
                if self.transition(ParticipantState::Leading) {
                    info!(election = %self.name, key = %self.key, revision = leader.create_revision, "elected leader");
                    Ok(leader)
                } else {
                    // resigned underneath us
                    Err(Error::Cancelled)
                }
            }
            Err(Error::SessionLost) => {
                warn!(election = %self.name, key = %self.key, "session lost during campaign");
                self.candidacy.lock().take();
                self.transition(ParticipantState::Resigned);
                Err(Error::SessionLost)
            }
            Err(Error::CandidacyLost) => {
                warn!(election = %self.name, key = %self.key, "candidacy key deleted during campaign");
                self.candidacy.lock().take();
                self.transition(ParticipantState::Idle);
                Err(Error::CandidacyLost)
            }
            Err(e) => {
                debug!(election = %self.name, key = %self.key, error = %e, "campaign abandoned");
                self.withdraw().await;
                self.transition(ParticipantState::Idle);
                Err(e)
            }
        }
    }

    async fn run_campaign(&self, lease: LeaseId, identity: Bytes) -> Result<LeaderKey> {
        let store = self.session.store().clone();
        let my_revision = self.register(store.as_ref(), lease, identity).await?;
        let mut queue = ElectionQueue::new(self.prefix.clone());

        loop {
            let snapshot = store.get_prefix(&self.prefix).await?;
            queue.reset(&snapshot);
            let evaluated = match self.evaluate(&queue) {
                Err(Error::CandidacyLost) => return Err(self.own_key_gone().await),
                other => other?,
            };
            if let Some(leader) = evaluated {
                return Ok(leader);
            }
            self.transition(ParticipantState::Following);

            let mut events = match store.watch_prefix(&self.prefix, snapshot.revision + 1).await {
                Ok(events) => events,
                Err(Error::WatchCompacted { compact_revision }) => {
                    debug!(election = %self.name, compact_revision, "watch compacted, resyncing");
                    continue;
                }
                Err(e) => return Err(e),
            };

            // Wait for a deletion ahead of us that leaves us first, then go
            // back round and confirm it against a fresh snapshot.
            loop {
                match events.next().await {
                    Some(Ok(event)) => {
                        if event.is_delete() && event.kv.key == self.key {
                            return Err(self.own_key_gone().await);
                        }
                        if let QueueChange::Removed { create_revision } = queue.apply(&event) {
                            trace!(election = %self.name, removed = %event.kv.key, "candidate left");
                            if create_revision < my_revision && queue.is_first(&self.key) {
                                break;
                            }
                        }
                    }
                    Some(Err(Error::WatchCompacted { compact_revision })) => {
                        debug!(election = %self.name, compact_revision, "watch compacted, resyncing");
                        break;
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Err(Error::unavailable("watch stream closed")),
                }
            }
        }
    }

    /// Creates the candidacy key, or re-joins it at its original position if
    /// an earlier run holding the same lease left it behind.
    async fn register(&self, store: &dyn Store, lease: LeaseId, identity: Bytes) -> Result<Revision> {
        let outcome = store
            .put_if_create_revision(&self.key, identity.clone(), Some(lease), 0)
            .await
            .map_err(lease_error_to_session_lost)?;

        let create_revision = match outcome {
            TxnOutcome::Succeeded(put) => put.create_revision,
            TxnOutcome::Failed(Some(existing)) => {
                debug!(election = %self.name, key = %self.key, revision = existing.create_revision, "re-joining existing candidacy");
                if existing.value == identity && existing.lease == Some(lease) {
                    existing.create_revision
                } else {
                    match store
                        .put_if_create_revision(&self.key, identity.clone(), Some(lease), existing.create_revision)
                        .await
                        .map_err(lease_error_to_session_lost)?
                    {
                        TxnOutcome::Succeeded(put) => put.create_revision,
                        TxnOutcome::Failed(_) => return Err(Error::CandidacyLost),
                    }
                }
            }
            TxnOutcome::Failed(None) => {
                return Err(Error::Protocol("create comparison failed on an absent key".into()));
            }
        };

        *self.candidacy.lock() = Some(Candidacy {
            create_revision,
            value: identity,
        });
        trace!(election = %self.name, key = %self.key, revision = create_revision, "candidacy registered");
        Ok(create_revision)
    }

    fn evaluate(&self, queue: &ElectionQueue) -> Result<Option<LeaderKey>> {
        match queue.position(&self.key) {
            None => Err(Error::CandidacyLost),
            Some(0) => Ok(queue.leader().map(LeaderKey::from)),
            Some(position) => {
                debug!(
                    election = %self.name,
                    position,
                    ahead = queue.predecessor(&self.key).map(|c| c.key.as_str()).unwrap_or(""),
                    "waiting behind other candidates"
                );
                Ok(None)
            }
        }
    }

    /// Deletes the candidacy key and leaves the election for good.
    ///
    /// Idempotent, and valid in every state. When the session is no longer
    /// active nothing is deleted; the lease takes the key with it.
    pub async fn resign(&self) -> Result<()> {
        if self.session.is_active() {
            self.session.store().delete(&self.key).await?;
        }
        self.candidacy.lock().take();
        if self.transition(ParticipantState::Resigned) {
            info!(election = %self.name, key = %self.key, "resigned");
        }
        Ok(())
    }

    /// Best-effort delete used when a campaign is abandoned.
    async fn withdraw(&self) {
        self.candidacy.lock().take();
        if let Err(e) = self.session.store().delete(&self.key).await {
            warn!(election = %self.name, key = %self.key, error = %e, "could not withdraw candidacy");
        }
    }

    /// Republishes this participant's identity without giving up its place.
    pub async fn proclaim(&self, identity: impl Into<Bytes>) -> Result<()> {
        let identity = identity.into();
        let lease = self.session.lease()?;
        let create_revision = self
            .candidacy
            .lock()
            .as_ref()
            .map(|c| c.create_revision)
            .ok_or_else(|| Error::InvalidState("no candidacy to proclaim on".into()))?;

        match self
            .session
            .store()
            .put_if_create_revision(&self.key, identity.clone(), Some(lease), create_revision)
            .await
            .map_err(lease_error_to_session_lost)?
        {
            TxnOutcome::Succeeded(_) => {
                if let Some(candidacy) = self.candidacy.lock().as_mut() {
                    candidacy.value = identity;
                }
                debug!(election = %self.name, key = %self.key, "identity proclaimed");
                Ok(())
            }
            TxnOutcome::Failed(_) => Err(self.own_key_gone().await),
        }
    }

    /// Tells apart the two ways our key can vanish. A lease expiry or revoke
    /// deletes the key before the keep-alive task hears about it, so the
    /// lease is checked first; only a live lease means someone else deleted
    /// the key.
    async fn own_key_gone(&self) -> Error {
        match self.session.verify_lease().await {
            Ok(()) => Error::CandidacyLost,
            Err(Error::SessionLost) => Error::SessionLost,
            Err(e) => {
                debug!(election = %self.name, key = %self.key, error = %e, "could not check lease after losing key");
                if self.session.is_active() {
                    Error::CandidacyLost
                } else {
                    Error::SessionLost
                }
            }
        }
    }

    /// The current leader's key, read from a fresh snapshot.
    pub async fn leader_key(&self) -> Result<LeaderKey> {
        leader_key(self.session.store().as_ref(), &self.name).await
    }

    /// Watches leadership changes in this election without campaigning.
    pub fn observe(&self) -> Observer {
        Observer::new(self.session.store().clone(), &self.name)
    }

    /// Resolves when whatever leadership or candidacy this participant holds
    /// becomes void: `SessionLost` once the session stops being active,
    /// `CandidacyLost` if the key is deleted by someone else.
    ///
    /// Transient store errors are not reported here; the session's keep-alive
    /// decides whether they are fatal.
    pub async fn lost(&self) -> Error {
        let cause = tokio::select! {
            biased;
            _ = self.session.lost() => Error::SessionLost,
            cause = self.watch_own_key() => cause,
        };
        self.candidacy.lock().take();
        match cause {
            Error::SessionLost => self.transition(ParticipantState::Resigned),
            _ => self.transition(ParticipantState::Idle),
        };
        info!(election = %self.name, key = %self.key, cause = %cause, "leadership lost");
        cause
    }

    async fn watch_own_key(&self) -> Error {
        let store = self.session.store().clone();
        let retry = self.session.config().keep_alive_interval;
        loop {
            let snapshot = match store.get_prefix(&self.key).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    trace!(key = %self.key, error = %e, "candidacy check failed, retrying");
                    tokio::time::sleep(retry).await;
                    continue;
                }
            };
            if !snapshot.kvs.iter().any(|kv| kv.key == self.key) {
                return self.own_key_gone().await;
            }
            let mut events = match store.watch_prefix(&self.key, snapshot.revision + 1).await {
                Ok(events) => events,
                Err(e) => {
                    trace!(key = %self.key, error = %e, "candidacy watch failed, retrying");
                    tokio::time::sleep(retry).await;
                    continue;
                }
            };
            while let Some(event) = events.next().await {
                match event {
                    Ok(event) if event.is_delete() && event.kv.key == self.key => {
                        return self.own_key_gone().await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        trace!(key = %self.key, error = %e, "candidacy watch interrupted");
                        break;
                    }
                }
            }
        }
    }

    /// Applies a state change unless the participant already resigned.
    fn transition(&self, to: ParticipantState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ParticipantState::Resigned || *state == to {
                false
            } else {
                trace!(election = %self.name, from = ?*state, ?to, "participant state");
                *state = to;
                true
            }
        })
    }
}

fn lease_error_to_session_lost(e: Error) -> Error {
    match e {
        Error::LeaseNotFound(_) => Error::SessionLost,
        other => other,
    }
}

/// Resolves the leader of election `name` from a fresh snapshot.
pub async fn leader_key(store: &dyn Store, name: &str) -> Result<LeaderKey> {
    let prefix = format!("{name}/");
    let snapshot = store.get_prefix(&prefix).await?;
    let queue = ElectionQueue::from_snapshot(prefix, &snapshot);
    queue.leader().map(LeaderKey::from).ok_or(Error::NoLeader)
}

/// Lazy sequence of leaders of one election, one item per change of holder.
///
/// The first item is the leader at subscription time (as soon as there is
/// one). Compacted watches are resynchronized transparently; any other error
/// is yielded once and the following call starts over from a fresh snapshot.
pub struct Observer {
    store: Arc<dyn Store>,
    name: String,
    queue: ElectionQueue,
    events: Option<WatchStream>,
    last: Option<(String, Revision)>,
}

impl std::fmt::Debug for Observer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observer")
            .field("name", &self.name)
            .field("queue", &self.queue)
            .field("watching", &self.events.is_some())
            .field("last", &self.last)
            .finish()
    }
}

impl Observer {
    pub fn new(store: Arc<dyn Store>, name: &str) -> Self {
        Self {
            store,
            name: name.to_string(),
            queue: ElectionQueue::new(format!("{name}/")),
            events: None,
            last: None,
        }
    }

    /// Next leader change. Never yields `None`; the `Option` keeps the
    /// signature stream-shaped.
    pub async fn next(&mut self) -> Option<Result<LeaderKey>> {
        loop {
            let Some(events) = self.events.as_mut() else {
                if let Err(e) = self.resync().await {
                    return Some(Err(e));
                }
                if let Some(leader) = self.changed_leader() {
                    return Some(Ok(leader));
                }
                continue;
            };

            match events.next().await {
                Some(Ok(event)) => {
                    self.queue.apply(&event);
                    if let Some(leader) = self.changed_leader() {
                        return Some(Ok(leader));
                    }
                }
                Some(Err(Error::WatchCompacted { compact_revision })) => {
                    debug!(election = %self.name, compact_revision, "observer resyncing after compaction");
                    self.events = None;
                }
                Some(Err(e)) => {
                    self.events = None;
                    return Some(Err(e));
                }
                None => {
                    self.events = None;
                    return Some(Err(Error::unavailable("watch stream closed")));
                }
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<LeaderKey>> + Send {
        futures::stream::unfold(self, |mut observer| async move {
            observer.next().await.map(|item| (item, observer))
        })
    }

    async fn resync(&mut self) -> Result<()> {
        loop {
            let snapshot = self.store.get_prefix(self.queue.prefix()).await?;
            self.queue.reset(&snapshot);
            match self
                .store
                .watch_prefix(self.queue.prefix(), snapshot.revision + 1)
                .await
            {
                Ok(events) => {
                    self.events = Some(events);
                    return Ok(());
                }
                Err(Error::WatchCompacted { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn changed_leader(&mut self) -> Option<LeaderKey> {
        let leader = self.queue.leader();
        let holder = leader.map(|c| (c.key.clone(), c.create_revision));
        if holder == self.last {
            return None;
        }
        self.last = holder;
        let leader = leader.map(LeaderKey::from);
        if let Some(leader) = &leader {
            debug!(election = %self.name, key = %leader.key, "leader changed");
        }
        leader
    }
}

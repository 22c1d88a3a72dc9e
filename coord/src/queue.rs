//! Revision-ordered view of the live candidacies under one election prefix.

use crate::store::{EventKind, Snapshot, WatchEvent};
use crate::{LeaseId, Revision};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};

/// One live candidacy key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub key: String,
    pub value: Bytes,
    /// Position in the election: lower wins.
    pub create_revision: Revision,
    pub lease: Option<LeaseId>,
}

/// What an applied event did to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueChange {
    /// Duplicate, stale, or outside the prefix.
    Ignored,
    Inserted,
    /// Known key rewritten in place; its position is unchanged.
    Updated,
    Removed {
        create_revision: Revision,
    },
}

/// Sorted view of candidacy keys, maintained from a snapshot plus watch
/// events. Holds no I/O; callers feed it.
#[derive(Debug, Clone, Default)]
pub struct ElectionQueue {
    prefix: String,
    by_revision: BTreeMap<Revision, Candidate>,
    by_key: HashMap<String, Revision>,
    /// Highest revision reflected in the view.
    revision: Revision,
}

impl ElectionQueue {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Self::default()
        }
    }

    pub fn from_snapshot(prefix: impl Into<String>, snapshot: &Snapshot) -> Self {
        let mut queue = Self::new(prefix);
        queue.reset(snapshot);
        queue
    }

    /// Drops everything and rebuilds from a fresh snapshot read.
    pub fn reset(&mut self, snapshot: &Snapshot) {
        self.by_revision.clear();
        self.by_key.clear();
        let prefix = std::mem::take(&mut self.prefix);
        for kv in snapshot.kvs.iter().filter(|kv| kv.key.starts_with(&prefix)) {
            self.insert(Candidate {
                key: kv.key.clone(),
                value: kv.value.clone(),
                create_revision: revision_or(kv.create_revision, kv.mod_revision),
                lease: kv.lease,
            });
        }
        self.prefix = prefix;
        self.revision = snapshot.revision;
    }

    pub fn apply(&mut self, event: &WatchEvent) -> QueueChange {
        // Several events may share one revision (a lease revoke deleting many
        // keys), so only strictly older events are stale.
        if event.revision < self.revision || !event.kv.key.starts_with(&self.prefix) {
            return QueueChange::Ignored;
        }
        self.revision = event.revision;

        match event.kind {
            EventKind::Put => {
                if let Some(rev) = self.by_key.get(&event.kv.key) {
                    let Some(existing) = self.by_revision.get_mut(rev) else {
                        return QueueChange::Ignored;
                    };
                    if existing.value == event.kv.value && existing.lease == event.kv.lease {
                        return QueueChange::Ignored;
                    }
                    existing.value = event.kv.value.clone();
                    existing.lease = event.kv.lease;
                    return QueueChange::Updated;
                }
                let create_revision = revision_or(event.kv.create_revision, event.revision);
                if self.by_revision.contains_key(&create_revision) {
                    return QueueChange::Ignored;
                }
                self.insert(Candidate {
                    key: event.kv.key.clone(),
                    value: event.kv.value.clone(),
                    create_revision,
                    lease: event.kv.lease,
                });
                QueueChange::Inserted
            }
            EventKind::Delete => match self.by_key.remove(&event.kv.key) {
                Some(create_revision) => {
                    self.by_revision.remove(&create_revision);
                    QueueChange::Removed { create_revision }
                }
                None => QueueChange::Ignored,
            },
        }
    }

    /// Zero-based rank of `key`; `Some(0)` means leader.
    pub fn position(&self, key: &str) -> Option<usize> {
        let rev = self.by_key.get(key)?;
        Some(self.by_revision.range(..*rev).count())
    }

    pub fn is_first(&self, key: &str) -> bool {
        self.leader().is_some_and(|leader| leader.key == key)
    }

    pub fn leader(&self) -> Option<&Candidate> {
        self.by_revision.values().next()
    }

    /// The candidate immediately ahead of `key`.
    pub fn predecessor(&self, key: &str) -> Option<&Candidate> {
        let rev = self.by_key.get(key)?;
        self.by_revision.range(..*rev).next_back().map(|(_, c)| c)
    }

    pub fn get(&self, key: &str) -> Option<&Candidate> {
        self.by_key.get(key).and_then(|rev| self.by_revision.get(rev))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.by_revision.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_revision.is_empty()
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Candidates in election order.
    pub fn iter(&self) -> impl Iterator<Item = &Candidate> {
        self.by_revision.values()
    }

    fn insert(&mut self, candidate: Candidate) {
        self.by_key
            .insert(candidate.key.clone(), candidate.create_revision);
        self.by_revision.insert(candidate.create_revision, candidate);
    }
}

fn revision_or(create_revision: Revision, fallback: Revision) -> Revision {
    if create_revision > 0 {
        create_revision
    } else {
        fallback
    }
}

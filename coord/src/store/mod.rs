//! The contract this crate needs from the coordination store, plus the two
//! implementations shipped with it.

pub mod gateway;
pub mod memory;

use crate::{LeaseId, Result, Revision};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::time::Duration;

/// A key as stored, with the revisions the store assigned to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Bytes,
    /// Revision of the write that created the key; `0` when unknown.
    pub create_revision: Revision,
    /// Revision of the last write (or of the delete, in a delete event).
    pub mod_revision: Revision,
    pub lease: Option<LeaseId>,
}

/// A consistent read of every key under a prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Store revision the read was served at.
    pub revision: Revision,
    /// Live keys, ordered by `create_revision`.
    pub kvs: Vec<KeyValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub kv: KeyValue,
    pub revision: Revision,
}

impl WatchEvent {
    pub fn is_delete(&self) -> bool {
        self.kind == EventKind::Delete
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseGrant {
    pub id: LeaseId,
    /// TTL actually granted; the store may round the request.
    pub ttl: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveAck {
    pub ttl: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutResponse {
    /// Revision of this write.
    pub revision: Revision,
    /// Creation revision of the key after the write. Equals `revision` for a
    /// new key, and the original creation revision for an overwrite.
    pub create_revision: Revision,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOutcome {
    Succeeded(PutResponse),
    /// The comparison failed; carries the key as it currently is, if present.
    Failed(Option<KeyValue>),
}

/// Ordered, gap-free change events. Ends after yielding an error.
pub type WatchStream = BoxStream<'static, Result<WatchEvent>>;

#[async_trait]
pub trait Store: Send + Sync + std::fmt::Debug {
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseGrant>;

    /// Renews a lease once. Fails with `LeaseNotFound` if the store has
    /// forgotten it.
    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveAck>;

    /// Revokes a lease and every key attached to it. Revoking an unknown
    /// lease succeeds.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;

    async fn put(&self, key: &str, value: Bytes, lease: Option<LeaseId>) -> Result<PutResponse>;

    /// Puts `value` only if the key's creation revision equals `expected`;
    /// `expected == 0` means "only if the key does not exist".
    async fn put_if_create_revision(
        &self,
        key: &str,
        value: Bytes,
        lease: Option<LeaseId>,
        expected: Revision,
    ) -> Result<TxnOutcome>;

    /// Returns whether a key was actually removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn get_prefix(&self, prefix: &str) -> Result<Snapshot>;

    /// Streams changes under `prefix` starting at `from_revision` (inclusive).
    /// Fails with `WatchCompacted` when that history is no longer retained.
    async fn watch_prefix(&self, prefix: &str, from_revision: Revision) -> Result<WatchStream>;
}

/// Exclusive end of the key range covering every key that starts with
/// `prefix`.
pub fn prefix_end(prefix: &str) -> Vec<u8> {
    let mut end = prefix.as_bytes().to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    // Empty or all-0xff prefix: the whole keyspace.
    vec![0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_end() {
        assert_eq!(prefix_end("election/"), b"election0".to_vec());
        assert_eq!(prefix_end("a"), b"b".to_vec());
        assert_eq!(prefix_end(""), vec![0]);
    }

    #[test]
    fn test_prefix_end_bounds_every_prefixed_key() {
        let end = prefix_end("jobs/");
        for key in ["jobs/", "jobs/a", "jobs/\u{7f}", "jobs/zzz"] {
            assert!(key.as_bytes() < end.as_slice(), "{key} escaped the range");
        }
        assert!(b"jobs0".as_slice() >= end.as_slice());
    }
}

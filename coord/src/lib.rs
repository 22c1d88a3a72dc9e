//! Sessions and leader election on top of an etcd-class key-value store.
//!
//! A [`Session`] owns one store lease and keeps it alive from a background
//! task. An [`Election`] participant registers a lease-attached candidacy key
//! under an election prefix; the live candidacy with the lowest creation
//! revision is the leader. When the session dies every candidacy attached to
//! it dies with it, so leadership fails over without any client-side locking.
//!
//! ```ignore
//! use std::sync::Arc;
//! use coord::{Election, MemoryStore, Session, SessionConfig};
//!
//! let store = Arc::new(MemoryStore::new());
//! let session = Session::open(store, SessionConfig::default()).await?;
//! let election = Election::new(&session, "scheduler");
//!
//! let leader = election.campaign("worker-1").await?;
//! // ... do leader work until `election.lost()` resolves ...
//! election.resign().await?;
//! session.close().await?;
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod election;
pub mod error;
pub mod queue;
pub mod session;
pub mod store;

pub mod test_utils;

pub use election::{Election, LeaderKey, Observer, ParticipantState};
pub use error::{Error, Result};
pub use queue::{Candidate, ElectionQueue, QueueChange};
pub use session::{Session, SessionConfig, SessionState};
pub use store::{
    gateway::GatewayStore, memory::MemoryStore, prefix_end, EventKind, KeepAliveAck, KeyValue,
    LeaseGrant, PutResponse, Snapshot, Store, TxnOutcome, WatchEvent, WatchStream,
};

/// The store's logical clock, assigned atomically to every write.
pub type Revision = i64;

/// Store-issued lease handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeaseId(pub i64);

impl std::fmt::Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl std::str::FromStr for LeaseId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let digits = s.trim_start_matches("0x");
        i64::from_str_radix(digits, 16)
            .map(LeaseId)
            .map_err(|e| Error::InvalidConfig(format!("bad lease id {s:?}: {e}")))
    }
}

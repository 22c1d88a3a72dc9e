use thiserror::Error;

use crate::{LeaseId, Revision};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Lease {0} not found")]
    LeaseNotFound(LeaseId),

    #[error("Session lost")]
    SessionLost,

    #[error("Watch history compacted at revision {compact_revision}")]
    WatchCompacted { compact_revision: Revision },

    #[error("No leader elected")]
    NoLeader,

    #[error("Candidacy key deleted while the session was alive")]
    CandidacyLost,

    #[error("Campaign cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid participant state: {0}")]
    InvalidState(String),

    #[error("Malformed store response: {0}")]
    Protocol(String),
}

impl Error {
    /// Errors a caller may retry without changing anything locally.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Unavailable(_))
    }

    pub(crate) fn unavailable(reason: impl std::fmt::Display) -> Self {
        Error::Unavailable(reason.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

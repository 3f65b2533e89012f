//! Error types for the coordination engine.
//!
//! Failures are split by blast radius:
//!
//! - Store and source errors describe a single call against a backend.
//! - [`LeaseError`] is what the lease manager reports after the updater has
//!   done its bounded conflict retries.
//! - [`ProcessingError`] terminates one supervised partition. It never stops
//!   the whole processor; the lease is released (or split) and becomes
//!   eligible for re-acquisition.
//! - [`ChangeFeedError`] is surfaced from `start()` and the reporting APIs.

use std::time::Duration;

use thiserror::Error;

use crate::interface::observer::CloseReason;

pub type ObserverError = Box<dyn std::error::Error + Send + Sync>;

/// Errors returned by a lease store backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LeaseStoreError {
    /// The supplied concurrency token no longer matches the stored lease.
    #[error("lease {0} was modified concurrently")]
    Conflict(String),

    #[error("lease {0} not found")]
    NotFound(String),

    #[error("lease {0} already exists")]
    AlreadyExists(String),

    /// Anything else the backend reported (network, permissions, missing table).
    #[error("lease store error: {0}")]
    Backend(String),
}

/// Errors from lease manager operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LeaseError {
    /// Another host owns the lease, or it was deleted.
    #[error("lease {0} lost")]
    Lost(String),

    /// The write kept conflicting after the bounded retries. Callers keep
    /// their local copy and try again later.
    #[error("lease {lease_token} still conflicting after {attempts} attempts")]
    Conflict { lease_token: String, attempts: usize },

    #[error(transparent)]
    Store(#[from] LeaseStoreError),
}

impl LeaseError {
    pub fn is_lost(&self) -> bool {
        matches!(self, LeaseError::Lost(_))
    }
}

/// Classified errors raised by a data source.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("partition {0} not found")]
    NotFound(String),

    /// The partition was split or merged and will not produce more data.
    #[error("partition {0} is gone")]
    Gone(String),

    #[error("response payload too large")]
    TooLarge,

    #[error("request throttled, retry after {retry_after:?}")]
    Throttled { retry_after: Duration },

    #[error("transient source error: {0}")]
    Transient(String),

    #[error("source error: {0}")]
    Other(String),
}

/// Terminal outcome of one supervised partition.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("lease {0} lost")]
    LeaseLost(String),

    #[error("partition {0} split or merged")]
    LeaseGone(String),

    #[error("observer failed on lease {lease_token}: {source}")]
    Observer {
        lease_token: String,
        #[source]
        source: ObserverError,
    },

    #[error("lease {lease_token} made no progress for {idle:?}")]
    Stalled { lease_token: String, idle: Duration },

    #[error("processing of lease {lease_token} failed: {reason}")]
    Undefined { lease_token: String, reason: String },
}

impl ProcessingError {
    pub fn close_reason(&self) -> CloseReason {
        match self {
            ProcessingError::LeaseLost(_) => CloseReason::LeaseLost,
            ProcessingError::LeaseGone(_) => CloseReason::LeaseGone,
            ProcessingError::Observer { .. } => CloseReason::ObserverError,
            ProcessingError::Stalled { .. } | ProcessingError::Undefined { .. } => {
                CloseReason::Unknown
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum SynchronizerError {
    /// The parent reported a split but no child partitions are listed yet.
    #[error("no child partitions found for lease {0}")]
    ChildrenNotFound(String),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Store(#[from] LeaseStoreError),
}

/// Errors surfaced by the processor's public API.
#[derive(Debug, Error)]
pub enum ChangeFeedError {
    /// Misconfiguration detected at build or start time. Never retried.
    #[error("fatal configuration error: {0}")]
    FatalConfig(String),

    #[error("change feed processor is already running")]
    AlreadyRunning,

    #[error("start was cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] LeaseStoreError),
}

pub type Result<T, E = ChangeFeedError> = std::result::Result<T, E>;

use std::{fmt, sync::Arc};

use async_trait::async_trait;

use super::record::ChangeRecord;
use crate::{
    error::{LeaseError, ObserverError},
    partition::checkpointer::PartitionCheckpointer,
};

/// Why an observer is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Shutdown,
    LeaseLost,
    /// The partition was split or merged; child partitions take over.
    LeaseGone,
    ObserverError,
    Unknown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CloseReason::Shutdown => "SHUTDOWN",
            CloseReason::LeaseLost => "LEASE_LOST",
            CloseReason::LeaseGone => "LEASE_GONE",
            CloseReason::ObserverError => "OBSERVER_ERROR",
            CloseReason::Unknown => "UNKNOWN",
        };
        f.write_str(label)
    }
}

/// Handed to the observer with every callback.
#[derive(Clone)]
pub struct ObserverContext {
    lease_token: String,
    host: String,
    continuation: Option<String>,
    checkpointer: Arc<PartitionCheckpointer>,
}

impl ObserverContext {
    pub(crate) fn new(
        lease_token: String,
        host: String,
        checkpointer: Arc<PartitionCheckpointer>,
    ) -> Self {
        Self {
            lease_token,
            host,
            continuation: None,
            checkpointer,
        }
    }

    pub(crate) fn for_batch(&self, continuation: Option<String>) -> Self {
        Self {
            continuation,
            ..self.clone()
        }
    }

    pub fn lease_token(&self) -> &str {
        &self.lease_token
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Position after the batch being processed, if any.
    pub fn continuation(&self) -> Option<&str> {
        self.continuation.as_deref()
    }

    /// Durably records that everything up to this batch has been handled.
    /// A no-op outside `process_changes`.
    pub async fn checkpoint(&self) -> Result<(), LeaseError> {
        match &self.continuation {
            Some(continuation) => self.checkpointer.checkpoint(continuation).await,
            None => Ok(()),
        }
    }
}

/// User logic invoked for the changes of one partition.
#[async_trait]
pub trait ChangeFeedObserver: Send + Sync {
    async fn open(&self, _context: &ObserverContext) -> Result<(), ObserverError> {
        Ok(())
    }

    /// An error stops processing of the partition and releases its lease.
    async fn process_changes(
        &self,
        context: &ObserverContext,
        changes: Vec<ChangeRecord>,
    ) -> Result<(), ObserverError>;

    async fn close(&self, _context: &ObserverContext, _reason: CloseReason) {}
}

/// Creates one observer per supervised partition.
pub type ObserverFactory = Arc<dyn Fn() -> Arc<dyn ChangeFeedObserver> + Send + Sync>;

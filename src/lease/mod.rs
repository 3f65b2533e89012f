use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::LeaseStoreError;

pub mod dynamo;
pub mod manager;
pub mod memory;
pub(crate) mod renewer;
pub(crate) mod taker;
pub(crate) mod updater;

/// Schema version stamped on every lease this crate writes.
pub const LEASE_SCHEMA_VERSION: u32 = 1;

/// Ownership and read progress for one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub lease_token: String,
    pub owner: Option<String>,
    pub continuation_token: Option<String>,
    /// Version stamp assigned by the store; every write must present the
    /// current value.
    pub concurrency_token: Option<String>,
    /// Milliseconds since the Unix epoch of the last successful write.
    pub timestamp: u64,
    pub properties: HashMap<String, String>,
    pub parent_tokens: BTreeSet<String>,
    pub version: u32,
}

impl Lease {
    /// An unowned lease with no progress, as created by the synchronizer.
    pub fn new(lease_token: impl Into<String>) -> Self {
        Self {
            lease_token: lease_token.into(),
            owner: None,
            continuation_token: None,
            concurrency_token: None,
            timestamp: 0,
            properties: HashMap::new(),
            parent_tokens: BTreeSet::new(),
            version: LEASE_SCHEMA_VERSION,
        }
    }

    pub fn is_owned_by(&self, host: &str) -> bool {
        self.owner.as_deref() == Some(host)
    }

    /// True once the last write is strictly older than `expiration`.
    pub fn is_expired(&self, now_millis: u64, expiration: Duration) -> bool {
        now_millis.saturating_sub(self.timestamp) > expiration.as_millis() as u64
    }
}

/// The in-memory copy of a supervised lease, shared by its renewer and
/// checkpointer.
pub type SharedLease = Arc<RwLock<Lease>>;

/// Keyed lease persistence with optimistic concurrency.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn list_all(&self) -> Result<Vec<Lease>, LeaseStoreError>;

    async fn read(&self, lease_token: &str) -> Result<Option<Lease>, LeaseStoreError>;

    /// Creates an unowned lease. Fails with `AlreadyExists` if the token is taken.
    async fn try_create(
        &self,
        lease_token: &str,
        seed_continuation: Option<String>,
        properties: HashMap<String, String>,
        parent_tokens: BTreeSet<String>,
    ) -> Result<Lease, LeaseStoreError>;

    /// Replaces the stored lease if its concurrency token still equals
    /// `expected_concurrency_token`. Returns the lease with its new token.
    async fn try_update(
        &self,
        lease: &Lease,
        expected_concurrency_token: Option<&str>,
    ) -> Result<Lease, LeaseStoreError>;

    /// Deleting a lease that does not exist is not an error.
    async fn delete(&self, lease: &Lease) -> Result<(), LeaseStoreError>;
}

/// Store-level state used only while bootstrapping.
#[async_trait]
pub trait InitializationStore: Send + Sync {
    async fn is_initialized(&self) -> Result<bool, LeaseStoreError>;

    async fn mark_initialized(&self) -> Result<(), LeaseStoreError>;

    /// Takes the initialization lock for `lock_time` unless another host holds
    /// an unexpired one.
    async fn acquire_initialization_lock(
        &self,
        host: &str,
        lock_time: Duration,
    ) -> Result<bool, LeaseStoreError>;

    async fn release_initialization_lock(&self, host: &str) -> Result<bool, LeaseStoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_is_strictly_greater_than_interval() {
        let mut lease = Lease::new("0");
        lease.timestamp = 1_000;
        let expiration = Duration::from_millis(500);

        assert!(!lease.is_expired(1_000, expiration));
        assert!(!lease.is_expired(1_500, expiration));
        assert!(lease.is_expired(1_501, expiration));
    }

    #[test]
    fn ownership_check() {
        let mut lease = Lease::new("0");
        assert!(!lease.is_owned_by("host-a"));
        lease.owner = Some("host-a".to_string());
        assert!(lease.is_owned_by("host-a"));
        assert!(!lease.is_owned_by("host-b"));
    }
}

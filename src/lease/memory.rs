use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{InitializationStore, Lease, LeaseStore, LEASE_SCHEMA_VERSION};
use crate::{error::LeaseStoreError, util::now_millis};

#[derive(Default)]
struct StoreState {
    leases: HashMap<String, Lease>,
    next_version: u64,
    initialized: bool,
    lock: Option<InitializationLock>,
}

struct InitializationLock {
    owner: String,
    expires_at: u64,
}

impl StoreState {
    fn stamp(&mut self, lease: &mut Lease) {
        self.next_version += 1;
        lease.concurrency_token = Some(self.next_version.to_string());
    }
}

/// Process-local lease store. Hosts sharing one instance (behind an `Arc`)
/// coordinate exactly as they would through a remote store.
#[derive(Default)]
pub struct InMemoryLeaseStore {
    state: Mutex<StoreState>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites a lease unconditionally, assigning a fresh
    /// concurrency token. Meant for seeding fixtures.
    pub fn put(&self, mut lease: Lease) -> Lease {
        let mut state = self.state.lock();
        state.stamp(&mut lease);
        state.leases.insert(lease.lease_token.clone(), lease.clone());
        lease
    }

    pub fn len(&self) -> usize {
        self.state.lock().leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn list_all(&self) -> Result<Vec<Lease>, LeaseStoreError> {
        let state = self.state.lock();
        let mut leases: Vec<Lease> = state.leases.values().cloned().collect();
        leases.sort_by(|a, b| a.lease_token.cmp(&b.lease_token));
        Ok(leases)
    }

    async fn read(&self, lease_token: &str) -> Result<Option<Lease>, LeaseStoreError> {
        Ok(self.state.lock().leases.get(lease_token).cloned())
    }

    async fn try_create(
        &self,
        lease_token: &str,
        seed_continuation: Option<String>,
        properties: HashMap<String, String>,
        parent_tokens: BTreeSet<String>,
    ) -> Result<Lease, LeaseStoreError> {
        let mut state = self.state.lock();
        if state.leases.contains_key(lease_token) {
            return Err(LeaseStoreError::AlreadyExists(lease_token.to_string()));
        }

        let mut lease = Lease::new(lease_token);
        lease.continuation_token = seed_continuation;
        lease.properties = properties;
        lease.parent_tokens = parent_tokens;
        lease.timestamp = now_millis();
        lease.version = LEASE_SCHEMA_VERSION;
        state.stamp(&mut lease);
        state.leases.insert(lease_token.to_string(), lease.clone());
        Ok(lease)
    }

    async fn try_update(
        &self,
        lease: &Lease,
        expected_concurrency_token: Option<&str>,
    ) -> Result<Lease, LeaseStoreError> {
        let mut state = self.state.lock();
        let current = match state.leases.get(&lease.lease_token) {
            Some(current) => current,
            None => return Err(LeaseStoreError::NotFound(lease.lease_token.clone())),
        };
        if current.concurrency_token.as_deref() != expected_concurrency_token {
            return Err(LeaseStoreError::Conflict(lease.lease_token.clone()));
        }

        let mut updated = lease.clone();
        state.stamp(&mut updated);
        state
            .leases
            .insert(updated.lease_token.clone(), updated.clone());
        Ok(updated)
    }

    async fn delete(&self, lease: &Lease) -> Result<(), LeaseStoreError> {
        self.state.lock().leases.remove(&lease.lease_token);
        Ok(())
    }
}

#[async_trait]
impl InitializationStore for InMemoryLeaseStore {
    async fn is_initialized(&self) -> Result<bool, LeaseStoreError> {
        Ok(self.state.lock().initialized)
    }

    async fn mark_initialized(&self) -> Result<(), LeaseStoreError> {
        self.state.lock().initialized = true;
        Ok(())
    }

    async fn acquire_initialization_lock(
        &self,
        host: &str,
        lock_time: Duration,
    ) -> Result<bool, LeaseStoreError> {
        let now = now_millis();
        let mut state = self.state.lock();
        if let Some(lock) = &state.lock {
            if lock.expires_at > now && lock.owner != host {
                return Ok(false);
            }
        }
        state.lock = Some(InitializationLock {
            owner: host.to_string(),
            expires_at: now + lock_time.as_millis() as u64,
        });
        Ok(true)
    }

    async fn release_initialization_lock(&self, host: &str) -> Result<bool, LeaseStoreError> {
        let mut state = self.state.lock();
        match &state.lock {
            Some(lock) if lock.owner == host => {
                state.lock = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, info};

use super::{updater::LeaseUpdater, Lease, LeaseStore};
use crate::{
    error::{LeaseError, LeaseStoreError},
    util::now_millis,
};

/// Lease operations on behalf of one host.
pub struct LeaseStoreManager {
    host: String,
    store: Arc<dyn LeaseStore>,
    updater: LeaseUpdater,
}

impl LeaseStoreManager {
    pub fn new(host: impl Into<String>, store: Arc<dyn LeaseStore>) -> Self {
        Self {
            host: host.into(),
            updater: LeaseUpdater::new(store.clone()),
            store,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub async fn list_all_leases(&self) -> Result<Vec<Lease>, LeaseStoreError> {
        self.store.list_all().await
    }

    pub async fn list_owned_leases(&self) -> Result<Vec<Lease>, LeaseStoreError> {
        Ok(self
            .store
            .list_all()
            .await?
            .into_iter()
            .filter(|lease| lease.is_owned_by(&self.host))
            .collect())
    }

    pub async fn read(&self, lease_token: &str) -> Result<Option<Lease>, LeaseStoreError> {
        self.store.read(lease_token).await
    }

    /// Returns `None` when another host created the lease first.
    pub async fn create_lease_if_not_exist(
        &self,
        lease_token: &str,
        continuation: Option<String>,
        properties: HashMap<String, String>,
        parent_tokens: BTreeSet<String>,
    ) -> Result<Option<Lease>, LeaseStoreError> {
        match self
            .store
            .try_create(lease_token, continuation, properties, parent_tokens)
            .await
        {
            Ok(lease) => {
                info!(lease_token, "Created lease");
                Ok(Some(lease))
            }
            Err(LeaseStoreError::AlreadyExists(_)) => {
                debug!(lease_token, "Lease already exists");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Claims `lease` for this host with a single compare-and-swap against the
    /// concurrency token it was listed with. Losing the race is a
    /// `LeaseStoreError::Conflict`; no retry is attempted.
    pub async fn acquire(&self, lease: &Lease) -> Result<Lease, LeaseStoreError> {
        let mut claimed = lease.clone();
        let previous_owner = claimed.owner.replace(self.host.clone());
        claimed.timestamp = now_millis();

        let acquired = self
            .store
            .try_update(&claimed, lease.concurrency_token.as_deref())
            .await?;
        info!(
            lease_token = %lease.lease_token,
            previous_owner = ?previous_owner,
            "Acquired lease"
        );
        Ok(acquired)
    }

    /// Rewrites the lease with no content change, extending its freshness.
    pub async fn renew(&self, lease: &Lease) -> Result<Lease, LeaseError> {
        self.check_owned(lease)?;
        self.updater.update(lease.clone(), |_| {}).await
    }

    /// Gives the lease up so any host may take it on its next balancing pass.
    pub async fn release(&self, lease: &Lease) -> Result<Lease, LeaseError> {
        self.check_owned(lease)?;
        let released = self
            .updater
            .update(lease.clone(), |l| {
                l.owner = None;
            })
            .await?;
        info!(lease_token = %lease.lease_token, "Released lease");
        Ok(released)
    }

    pub async fn checkpoint(&self, lease: &Lease, continuation: &str) -> Result<Lease, LeaseError> {
        self.check_owned(lease)?;
        let checkpointed = self
            .updater
            .update(lease.clone(), |l| {
                l.continuation_token = Some(continuation.to_string());
            })
            .await?;
        debug!(lease_token = %lease.lease_token, continuation, "Checkpointed lease");
        Ok(checkpointed)
    }

    pub async fn update_properties(
        &self,
        lease: &Lease,
        properties: HashMap<String, String>,
    ) -> Result<Lease, LeaseError> {
        self.check_owned(lease)?;
        let updated = self
            .updater
            .update(lease.clone(), |l| {
                l.properties = properties.clone();
            })
            .await?;
        debug!(lease_token = %lease.lease_token, count = updated.properties.len(), "Updated lease properties");
        Ok(updated)
    }

    pub async fn delete(&self, lease: &Lease) -> Result<(), LeaseStoreError> {
        self.store.delete(lease).await?;
        info!(lease_token = %lease.lease_token, "Deleted lease");
        Ok(())
    }

    fn check_owned(&self, lease: &Lease) -> Result<(), LeaseError> {
        if lease.is_owned_by(&self.host) {
            Ok(())
        } else {
            Err(LeaseError::Lost(lease.lease_token.clone()))
        }
    }
}

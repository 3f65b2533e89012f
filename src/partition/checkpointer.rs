use std::sync::Arc;

use crate::{
    error::LeaseError,
    lease::{manager::LeaseStoreManager, SharedLease},
};

/// Persists read progress for one supervised partition.
pub struct PartitionCheckpointer {
    lease: SharedLease,
    lease_manager: Arc<LeaseStoreManager>,
}

impl PartitionCheckpointer {
    pub(crate) fn new(lease: SharedLease, lease_manager: Arc<LeaseStoreManager>) -> Self {
        Self {
            lease,
            lease_manager,
        }
    }

    pub(crate) async fn checkpoint(&self, continuation: &str) -> Result<(), LeaseError> {
        let cached = self.lease.read().await.clone();
        if cached.continuation_token.as_deref() == Some(continuation) {
            return Ok(());
        }
        let updated = self.lease_manager.checkpoint(&cached, continuation).await?;
        *self.lease.write().await = updated;
        Ok(())
    }
}

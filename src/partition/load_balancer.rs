use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::controller::PartitionController;
use crate::{
    error::LeaseStoreError,
    lease::{manager::LeaseStoreManager, taker::EqualPartitionsBalancingStrategy},
    util::{now_millis, runnable::PeriodicRunnable},
};

/// Periodically claims this host's share of the leases and hands them to the
/// controller.
pub(crate) struct PartitionLoadBalancer {
    lease_manager: Arc<LeaseStoreManager>,
    controller: Arc<PartitionController>,
    strategy: EqualPartitionsBalancingStrategy,
}

impl PartitionLoadBalancer {
    pub(crate) fn new(
        lease_manager: Arc<LeaseStoreManager>,
        controller: Arc<PartitionController>,
        strategy: EqualPartitionsBalancingStrategy,
    ) -> Self {
        Self {
            lease_manager,
            controller,
            strategy,
        }
    }

    async fn balance(&self) -> Result<usize, LeaseStoreError> {
        let all_leases = self.lease_manager.list_all_leases().await?;
        let mut acquired = 0;
        for lease in self.strategy.select_leases_to_take(&all_leases, now_millis()) {
            match self.lease_manager.acquire(&lease).await {
                Ok(owned) => {
                    acquired += 1;
                    self.controller.add_or_update_lease(owned);
                }
                Err(LeaseStoreError::Conflict(_)) | Err(LeaseStoreError::NotFound(_)) => {
                    debug!(lease_token = %lease.lease_token, "Lease changed since listing, skipping");
                }
                Err(err) => {
                    warn!(lease_token = %lease.lease_token, error = %err, "Failed to acquire lease");
                }
            }
        }
        Ok(acquired)
    }
}

#[async_trait]
impl PeriodicRunnable for PartitionLoadBalancer {
    async fn run_once(&self) {
        match self.balance().await {
            Ok(0) => {}
            Ok(acquired) => info!(host = %self.lease_manager.host(), acquired, "Acquired leases"),
            Err(err) => warn!(error = %err, "Failed to list leases for balancing"),
        }
    }

    async fn before_shutdown_complete(&self) {
        debug!(host = %self.lease_manager.host(), "Load balancer stopped");
    }
}

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{manager::LeaseStoreManager, SharedLease};
use crate::{
    error::{LeaseError, ProcessingError},
    util::sleep_or_cancelled,
};

/// Keeps one owned lease fresh independently of processing progress.
pub(crate) struct LeaseRenewer {
    lease: SharedLease,
    lease_manager: Arc<LeaseStoreManager>,
    renew_interval: Duration,
    result: Mutex<Option<ProcessingError>>,
}

impl LeaseRenewer {
    pub(crate) fn new(
        lease: SharedLease,
        lease_manager: Arc<LeaseStoreManager>,
        renew_interval: Duration,
    ) -> Self {
        Self {
            lease,
            lease_manager,
            renew_interval,
            result: Mutex::new(None),
        }
    }

    pub(crate) async fn run(&self, token: CancellationToken) {
        // The lease was just written when acquired.
        if !sleep_or_cancelled(self.renew_interval / 2, &token).await {
            return;
        }

        while !token.is_cancelled() {
            if let Err(err) = self.renew().await {
                let lease_token = self.lease.read().await.lease_token.clone();
                info!(lease_token = %lease_token, error = %err, "Lease lost during renewal");
                *self.result.lock() = Some(ProcessingError::LeaseLost(lease_token));
                return;
            }

            if !sleep_or_cancelled(self.renew_interval, &token).await {
                return;
            }
        }
    }

    /// Returns an error only when the lease is lost; soft conflicts and store
    /// errors are logged and retried on the next interval.
    async fn renew(&self) -> Result<(), LeaseError> {
        let cached = self.lease.read().await.clone();
        match self.lease_manager.renew(&cached).await {
            Ok(renewed) => {
                debug!(lease_token = %renewed.lease_token, "Renewed lease");
                *self.lease.write().await = renewed;
                Ok(())
            }
            Err(err) if err.is_lost() => Err(err),
            Err(err) => {
                warn!(
                    lease_token = %cached.lease_token,
                    error = %err,
                    "Failed to renew lease (will retry)"
                );
                Ok(())
            }
        }
    }

    pub(crate) fn has_failed(&self) -> bool {
        self.result.lock().is_some()
    }

    pub(crate) fn take_result(&self) -> Option<ProcessingError> {
        self.result.lock().take()
    }
}

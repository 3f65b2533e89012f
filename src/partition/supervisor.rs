use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{
    checkpointer::PartitionCheckpointer,
    processor::{PartitionProcessor, ProcessorSettings},
};
use crate::{
    config::ChangeFeedConfig,
    error::ProcessingError,
    interface::observer::{ChangeFeedObserver, CloseReason, ObserverContext},
    lease::{manager::LeaseStoreManager, renewer::LeaseRenewer, SharedLease},
    source::DataSource,
    util::sleep_or_cancelled,
};

/// Owns the observer of one leased partition and the two tasks that serve
/// it: a processor reading changes and a renewer keeping the lease fresh.
pub(crate) struct PartitionSupervisor {
    lease: SharedLease,
    lease_manager: Arc<LeaseStoreManager>,
    source: Arc<dyn DataSource>,
    observer: Arc<dyn ChangeFeedObserver>,
    config: ChangeFeedConfig,
}

impl PartitionSupervisor {
    pub(crate) fn new(
        lease: SharedLease,
        lease_manager: Arc<LeaseStoreManager>,
        source: Arc<dyn DataSource>,
        observer: Arc<dyn ChangeFeedObserver>,
        config: ChangeFeedConfig,
    ) -> Self {
        Self {
            lease,
            lease_manager,
            source,
            observer,
            config,
        }
    }

    /// Runs until `shutdown` fires (`Ok`) or either task stops on its own.
    pub(crate) async fn run(&self, shutdown: CancellationToken) -> Result<(), ProcessingError> {
        let lease = self.lease.read().await.clone();
        let checkpointer = Arc::new(PartitionCheckpointer::new(
            self.lease.clone(),
            self.lease_manager.clone(),
        ));
        let context = ObserverContext::new(
            lease.lease_token.clone(),
            self.lease_manager.host().to_string(),
            checkpointer,
        );

        if let Err(source) = self.observer.open(&context).await {
            warn!(lease_token = %lease.lease_token, error = %source, "Observer failed to open");
            self.observer.close(&context, CloseReason::ObserverError).await;
            return Err(ProcessingError::Observer {
                lease_token: lease.lease_token,
                source,
            });
        }

        let processor = Arc::new(PartitionProcessor::new(
            lease.lease_token.clone(),
            lease.continuation_token.clone(),
            self.source.clone(),
            self.observer.clone(),
            context.clone(),
            ProcessorSettings::from(&self.config),
        ));
        let renewer = Arc::new(LeaseRenewer::new(
            self.lease.clone(),
            self.lease_manager.clone(),
            self.config.lease_renew_interval,
        ));

        let children = shutdown.child_token();
        let processor_task = tokio::spawn({
            let processor = processor.clone();
            let token = children.clone();
            async move { processor.run(token).await }
        });
        let renewer_task = tokio::spawn({
            let renewer = renewer.clone();
            let token = children.clone();
            async move { renewer.run(token).await }
        });
        info!(lease_token = %lease.lease_token, "Supervising partition");

        let stale_after = self.config.stale_processor_threshold();
        loop {
            if processor.has_failed()
                || renewer.has_failed()
                || processor_task.is_finished()
                || renewer_task.is_finished()
            {
                break;
            }
            if processor.last_processed_time().elapsed() > stale_after {
                break;
            }
            if !sleep_or_cancelled(self.config.supervisor_tick, &shutdown).await {
                break;
            }
        }

        children.cancel();
        let processor_panic = join_quietly(processor_task, &lease.lease_token).await;
        let renewer_panic = join_quietly(renewer_task, &lease.lease_token).await;

        let outcome = if shutdown.is_cancelled() {
            Ok(())
        } else if let Some(err) = processor.take_result() {
            Err(err)
        } else if let Some(err) = renewer.take_result() {
            Err(err)
        } else if let Some(reason) = processor_panic.or(renewer_panic) {
            Err(ProcessingError::Undefined {
                lease_token: lease.lease_token.clone(),
                reason,
            })
        } else {
            Err(ProcessingError::Stalled {
                lease_token: lease.lease_token.clone(),
                idle: processor.last_processed_time().elapsed(),
            })
        };

        let reason = match &outcome {
            Ok(()) => CloseReason::Shutdown,
            Err(err) => err.close_reason(),
        };
        info!(lease_token = %lease.lease_token, %reason, "Closing observer");
        self.observer.close(&context, reason).await;
        outcome
    }
}

/// Awaits a finished child task, returning a description if it panicked.
async fn join_quietly(task: JoinHandle<()>, lease_token: &str) -> Option<String> {
    match task.await {
        Ok(()) => None,
        Err(err) => {
            warn!(lease_token, error = %err, "Partition task panicked");
            Some(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        lease::LeaseStore,
        partition::processor::tests::{fixture, Fixture, RecordingObserver},
    };

    fn supervisor(fixture: &Fixture, observer: Arc<RecordingObserver>, config: ChangeFeedConfig) -> PartitionSupervisor {
        PartitionSupervisor::new(
            fixture.lease.clone(),
            fixture.manager.clone(),
            fixture.source.clone(),
            observer,
            config,
        )
    }

    fn config() -> ChangeFeedConfig {
        ChangeFeedConfig::default().with_lease_renew_interval(Duration::from_secs(10))
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_with_shutdown_reason() {
        let fixture = fixture().await;
        fixture.source.push("0", "doc");
        let observer = Arc::new(RecordingObserver::default());
        let supervisor = supervisor(&fixture, observer.clone(), config());
        let token = CancellationToken::new();
        let handle = tokio::spawn({
            let token = token.clone();
            async move { supervisor.run(token).await }
        });

        tokio::time::sleep(Duration::from_secs(3)).await;
        token.cancel();

        assert!(handle.await.unwrap().is_ok());
        assert_eq!(*observer.closed.lock(), vec![CloseReason::Shutdown]);
        assert_eq!(observer.batches.lock().len(), 1);
        // The lease is left for the caller to release.
        let stored = fixture.store.read("0").await.unwrap().unwrap();
        assert!(stored.is_owned_by("host-a"));
    }

    #[tokio::test(start_paused = true)]
    async fn lost_lease_closes_with_lease_lost() {
        let fixture = fixture().await;
        let current = fixture.store.read("0").await.unwrap().unwrap();
        LeaseStoreManager::new("host-b", fixture.store.clone())
            .acquire(&current)
            .await
            .unwrap();

        let observer = Arc::new(RecordingObserver::default());
        let result = supervisor(&fixture, observer.clone(), config())
            .run(CancellationToken::new())
            .await;

        assert!(matches!(result, Err(ProcessingError::LeaseLost(_))));
        assert_eq!(*observer.closed.lock(), vec![CloseReason::LeaseLost]);
    }

    #[tokio::test(start_paused = true)]
    async fn split_partition_closes_with_lease_gone() {
        let fixture = fixture().await;
        fixture.source.split("0", &["1", "2"]);

        let observer = Arc::new(RecordingObserver::default());
        let result = supervisor(&fixture, observer.clone(), config())
            .run(CancellationToken::new())
            .await;

        assert!(matches!(result, Err(ProcessingError::LeaseGone(_))));
        assert_eq!(*observer.closed.lock(), vec![CloseReason::LeaseGone]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_open_never_reads() {
        let fixture = fixture().await;
        let observer = Arc::new(RecordingObserver {
            fail_open: true,
            ..Default::default()
        });

        let result = supervisor(&fixture, observer.clone(), config())
            .run(CancellationToken::new())
            .await;

        assert!(matches!(result, Err(ProcessingError::Observer { .. })));
        assert_eq!(*observer.closed.lock(), vec![CloseReason::ObserverError]);
        assert!(fixture.source.read_log("0").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_processor_is_eventually_declared_stalled() {
        let fixture = fixture().await;
        let observer = Arc::new(RecordingObserver::default());
        let config = ChangeFeedConfig::default().with_lease_renew_interval(Duration::from_secs(1));

        let result = supervisor(&fixture, observer.clone(), config)
            .run(CancellationToken::new())
            .await;

        match result {
            Err(ProcessingError::Stalled { idle, .. }) => assert!(idle > Duration::from_secs(25)),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(*observer.closed.lock(), vec![CloseReason::Unknown]);
    }
}

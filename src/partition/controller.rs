use std::sync::Arc;

use dashmap::{mapref::entry::Entry, DashMap};
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{supervisor::PartitionSupervisor, synchronizer::PartitionSynchronizer};
use crate::{
    config::ChangeFeedConfig,
    error::{LeaseStoreError, ProcessingError},
    interface::observer::ObserverFactory,
    lease::{manager::LeaseStoreManager, Lease, SharedLease},
    source::DataSource,
};

/// Tracks the partitions this host supervises and retires their leases when
/// supervision ends.
pub(crate) struct PartitionController {
    lease_manager: Arc<LeaseStoreManager>,
    synchronizer: Arc<PartitionSynchronizer>,
    source: Arc<dyn DataSource>,
    observer_factory: ObserverFactory,
    config: ChangeFeedConfig,
    supervised: DashMap<String, Supervised>,
    shutdown: CancellationToken,
}

struct Supervised {
    handle: JoinHandle<()>,
    /// Set once the supervisor returned and its lease is being retired.
    exiting: bool,
    /// The latest lease handed over while exiting; supervised again once the
    /// exit is done.
    handoff: Option<Lease>,
}

impl PartitionController {
    pub(crate) fn new(
        lease_manager: Arc<LeaseStoreManager>,
        synchronizer: Arc<PartitionSynchronizer>,
        source: Arc<dyn DataSource>,
        observer_factory: ObserverFactory,
        config: ChangeFeedConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            lease_manager,
            synchronizer,
            source,
            observer_factory,
            config,
            supervised: DashMap::new(),
            shutdown,
        }
    }

    /// Resumes supervision of every lease this host still owns, e.g. after a
    /// restart within the expiration interval.
    pub(crate) async fn initialize(self: &Arc<Self>) -> Result<(), LeaseStoreError> {
        for lease in self.lease_manager.list_owned_leases().await? {
            match self.lease_manager.renew(&lease).await {
                Ok(renewed) => self.add_or_update_lease(renewed),
                Err(err) if err.is_lost() => {
                    debug!(lease_token = %lease.lease_token, "Owned lease was lost before resuming");
                }
                Err(err) => {
                    warn!(lease_token = %lease.lease_token, error = %err, "Failed to renew lease on resume");
                    self.add_or_update_lease(lease);
                }
            }
        }
        Ok(())
    }

    /// Starts supervising `lease` unless it already is.
    pub(crate) fn add_or_update_lease(self: &Arc<Self>, lease: Lease) {
        if self.shutdown.is_cancelled() {
            return;
        }

        match self.supervised.entry(lease.lease_token.clone()) {
            Entry::Occupied(mut entry) if entry.get().exiting => {
                debug!(lease_token = %lease.lease_token, "Lease handed over while exiting");
                entry.get_mut().handoff = Some(lease);
            }
            Entry::Occupied(_) => {
                debug!(lease_token = %lease.lease_token, "Lease is already supervised");
            }
            Entry::Vacant(entry) => {
                let lease_token = lease.lease_token.clone();
                let shared: SharedLease = Arc::new(RwLock::new(lease));
                let supervisor = PartitionSupervisor::new(
                    shared.clone(),
                    self.lease_manager.clone(),
                    self.source.clone(),
                    (self.observer_factory)(),
                    self.config.clone(),
                );
                let token = self.shutdown.child_token();
                let controller = self.clone();
                let handle = tokio::spawn(async move {
                    let result = supervisor.run(token).await;
                    if let Some(mut entry) = controller.supervised.get_mut(&lease_token) {
                        entry.exiting = true;
                    }
                    controller.on_supervisor_exit(shared, result).await;
                    let handoff = controller
                        .supervised
                        .remove(&lease_token)
                        .and_then(|(_, supervised)| supervised.handoff);
                    if let Some(lease) = handoff {
                        controller.add_or_update_lease(lease);
                    }
                });
                entry.insert(Supervised {
                    handle,
                    exiting: false,
                    handoff: None,
                });
            }
        }
    }

    async fn on_supervisor_exit(&self, lease: SharedLease, result: Result<(), ProcessingError>) {
        let lease = lease.read().await.clone();
        match result {
            Err(ProcessingError::LeaseLost(_)) => {
                info!(lease_token = %lease.lease_token, "Stopped supervising lost lease");
            }
            Err(ProcessingError::LeaseGone(_)) => self.handle_split(&lease).await,
            Ok(()) => self.release(&lease).await,
            Err(err) => {
                warn!(lease_token = %lease.lease_token, error = %err, "Partition processing failed");
                self.release(&lease).await;
            }
        }
    }

    async fn handle_split(&self, lease: &Lease) {
        match self.synchronizer.split_partition(lease).await {
            Ok(children) => {
                info!(
                    lease_token = %lease.lease_token,
                    children = children.len(),
                    "Retiring split partition"
                );
                if let Err(err) = self.lease_manager.delete(lease).await {
                    warn!(lease_token = %lease.lease_token, error = %err, "Failed to delete parent lease");
                }
            }
            Err(err) => {
                warn!(lease_token = %lease.lease_token, error = %err, "Split handling failed, releasing lease");
                self.release(lease).await;
            }
        }
    }

    async fn release(&self, lease: &Lease) {
        match self.lease_manager.release(lease).await {
            Ok(_) => {}
            Err(err) if err.is_lost() => {
                debug!(lease_token = %lease.lease_token, "Lease already taken by another host");
            }
            Err(err) => {
                warn!(lease_token = %lease.lease_token, error = %err, "Failed to release lease");
            }
        }
    }

    pub(crate) fn supervised_tokens(&self) -> Vec<String> {
        let mut tokens: Vec<String> = self.supervised.iter().map(|e| e.key().clone()).collect();
        tokens.sort();
        tokens
    }

    /// Stops every supervisor and waits for their leases to be released.
    pub(crate) async fn shutdown(&self) {
        self.shutdown.cancel();
        let tokens = self.supervised_tokens();
        let handles: Vec<_> = tokens
            .iter()
            .filter_map(|token| {
                self.supervised
                    .remove(token)
                    .map(|(_, supervised)| supervised.handle)
            })
            .collect();
        info!(count = handles.len(), "Waiting for partition supervisors to stop");
        for result in futures::future::join_all(handles).await {
            if let Err(err) = result {
                warn!(error = %err, "Partition supervisor panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, collections::HashMap, time::Duration};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::{
        error::SourceError,
        interface::observer::ChangeFeedObserver,
        lease::{memory::InMemoryLeaseStore, LeaseStore},
        partition::{enumerator::PartitionEnumerator, processor::tests::RecordingObserver},
        source::memory::InMemoryDataSource,
    };

    struct Harness {
        store: Arc<InMemoryLeaseStore>,
        source: Arc<InMemoryDataSource>,
        manager: Arc<LeaseStoreManager>,
        controller: Arc<PartitionController>,
    }

    /// Stalls for `release_delay` after writing a release, leaving a window
    /// in which the lease is free but its supervisor is still exiting. The
    /// next creation of `reject_create` fails.
    struct ScriptedStore {
        inner: Arc<InMemoryLeaseStore>,
        release_delay: Duration,
        reject_create: Mutex<Option<String>>,
    }

    #[async_trait]
    impl LeaseStore for ScriptedStore {
        async fn list_all(&self) -> Result<Vec<Lease>, LeaseStoreError> {
            self.inner.list_all().await
        }

        async fn read(&self, lease_token: &str) -> Result<Option<Lease>, LeaseStoreError> {
            self.inner.read(lease_token).await
        }

        async fn try_create(
            &self,
            lease_token: &str,
            seed_continuation: Option<String>,
            properties: HashMap<String, String>,
            parent_tokens: BTreeSet<String>,
        ) -> Result<Lease, LeaseStoreError> {
            let rejected = {
                let mut reject_create = self.reject_create.lock();
                if reject_create.as_deref() == Some(lease_token) {
                    reject_create.take();
                    true
                } else {
                    false
                }
            };
            if rejected {
                return Err(LeaseStoreError::Backend("write capacity exceeded".into()));
            }
            self.inner
                .try_create(lease_token, seed_continuation, properties, parent_tokens)
                .await
        }

        async fn try_update(
            &self,
            lease: &Lease,
            expected_concurrency_token: Option<&str>,
        ) -> Result<Lease, LeaseStoreError> {
            let updated = self.inner.try_update(lease, expected_concurrency_token).await;
            if lease.owner.is_none() {
                tokio::time::sleep(self.release_delay).await;
            }
            updated
        }

        async fn delete(&self, lease: &Lease) -> Result<(), LeaseStoreError> {
            self.inner.delete(lease).await
        }
    }

    fn harness(source: InMemoryDataSource) -> Harness {
        scripted_harness(source, Duration::ZERO, None)
    }

    fn scripted_harness(
        source: InMemoryDataSource,
        release_delay: Duration,
        reject_create: Option<&str>,
    ) -> Harness {
        let store = Arc::new(InMemoryLeaseStore::new());
        let source = Arc::new(source);
        let manager = Arc::new(LeaseStoreManager::new(
            "host-a",
            Arc::new(ScriptedStore {
                inner: store.clone(),
                release_delay,
                reject_create: Mutex::new(reject_create.map(str::to_string)),
            }),
        ));
        let enumerator = Arc::new(PartitionEnumerator::new(source.clone(), Duration::ZERO));
        let synchronizer = Arc::new(PartitionSynchronizer::new(enumerator, manager.clone()));
        let factory: ObserverFactory = Arc::new(|| {
            Arc::new(RecordingObserver::default()) as Arc<dyn ChangeFeedObserver>
        });
        let controller = Arc::new(PartitionController::new(
            manager.clone(),
            synchronizer,
            source.clone(),
            factory,
            ChangeFeedConfig::default().with_lease_renew_interval(Duration::from_secs(10)),
            CancellationToken::new(),
        ));
        Harness {
            store,
            source,
            manager,
            controller,
        }
    }

    async fn acquire(harness: &Harness, token: &str) -> Lease {
        let created = harness
            .store
            .try_create(token, None, HashMap::new(), BTreeSet::new())
            .await
            .unwrap();
        harness.manager.acquire(&created).await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_releases_supervised_leases() {
        let harness = harness(InMemoryDataSource::with_partitions(2));
        for token in ["0", "1"] {
            let lease = acquire(&harness, token).await;
            harness.controller.add_or_update_lease(lease.clone());
            // A second hand-off of the same lease is ignored.
            harness.controller.add_or_update_lease(lease);
        }
        assert_eq!(harness.controller.supervised_tokens(), vec!["0", "1"]);

        tokio::time::sleep(Duration::from_secs(2)).await;
        harness.controller.shutdown().await;

        assert!(harness.controller.supervised_tokens().is_empty());
        for lease in harness.store.list_all().await.unwrap() {
            assert_eq!(lease.owner, None);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn split_replaces_parent_with_children() {
        let harness = harness(InMemoryDataSource::with_partitions(1));
        let lease = acquire(&harness, "0").await;
        harness.source.split("0", &["1", "2"]);

        harness.controller.add_or_update_lease(lease);
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(harness.controller.supervised_tokens().is_empty());
        let tokens: Vec<String> = harness
            .store
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.lease_token)
            .collect();
        assert_eq!(tokens, vec!["1", "2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_split_keeps_and_releases_parent() {
        let harness = harness(InMemoryDataSource::with_partitions(1));
        let lease = acquire(&harness, "0").await;
        harness.source.inject_fault("0", crate::error::SourceError::Gone("0".into()));

        harness.controller.add_or_update_lease(lease);
        tokio::time::sleep(Duration::from_secs(3)).await;

        let parent = harness.store.read("0").await.unwrap().unwrap();
        assert_eq!(parent.owner, None);
        assert_eq!(harness.store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn partially_created_children_keep_the_parent() {
        let harness = scripted_harness(
            InMemoryDataSource::with_partitions(1),
            Duration::ZERO,
            Some("2"),
        );
        let lease = acquire(&harness, "0").await;
        harness.source.split("0", &["1", "2"]);

        harness.controller.add_or_update_lease(lease);
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(harness.controller.supervised_tokens().is_empty());
        let parent = harness.store.read("0").await.unwrap().unwrap();
        assert_eq!(parent.owner, None);
        assert!(harness.store.read("1").await.unwrap().is_some());
        assert!(harness.store.read("2").await.unwrap().is_none());

        // Whoever takes the parent next finishes the split.
        let owned = harness.manager.acquire(&parent).await.unwrap();
        harness.controller.add_or_update_lease(owned);
        tokio::time::sleep(Duration::from_secs(3)).await;

        let tokens: Vec<String> = harness
            .store
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.lease_token)
            .collect();
        assert_eq!(tokens, vec!["1", "2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_lease_is_left_to_its_new_owner() {
        let harness = harness(InMemoryDataSource::with_partitions(1));
        let lease = acquire(&harness, "0").await;
        harness.controller.add_or_update_lease(lease);

        let current = harness.store.read("0").await.unwrap().unwrap();
        LeaseStoreManager::new("host-b", harness.store.clone())
            .acquire(&current)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(8)).await;

        assert!(harness.controller.supervised_tokens().is_empty());
        let stored = harness.store.read("0").await.unwrap().unwrap();
        assert!(stored.is_owned_by("host-b"));
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_resumes_owned_leases() {
        let harness = harness(InMemoryDataSource::with_partitions(3));
        acquire(&harness, "0").await;
        acquire(&harness, "2").await;
        harness
            .store
            .try_create("1", None, HashMap::new(), BTreeSet::new())
            .await
            .unwrap();

        harness.controller.initialize().await.unwrap();

        assert_eq!(harness.controller.supervised_tokens(), vec!["0", "2"]);
        harness.controller.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn lease_reacquired_while_exiting_is_supervised_again() {
        let harness = scripted_harness(
            InMemoryDataSource::with_partitions(1),
            Duration::from_secs(5),
            None,
        );
        let lease = acquire(&harness, "0").await;
        harness
            .source
            .inject_fault("0", SourceError::Other("disk on fire".into()));
        harness.controller.add_or_update_lease(lease);

        // The failed supervisor has released the lease but not yet left the map.
        tokio::time::sleep(Duration::from_millis(2500)).await;
        let released = harness.store.read("0").await.unwrap().unwrap();
        assert_eq!(released.owner, None);
        assert_eq!(harness.controller.supervised_tokens(), vec!["0"]);

        let owned = harness.manager.acquire(&released).await.unwrap();
        harness.controller.add_or_update_lease(owned);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(harness.controller.supervised_tokens(), vec!["0"]);
        let stored = harness.store.read("0").await.unwrap().unwrap();
        assert!(stored.is_owned_by("host-a"));

        harness.controller.shutdown().await;
    }
}

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::synchronizer::PartitionSynchronizer;
use crate::{
    config::{ChangeFeedConfig, SchemaValidation},
    error::ChangeFeedError,
    lease::{InitializationStore, LeaseStore, LEASE_SCHEMA_VERSION},
    util::sleep_or_cancelled,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BootstrapState {
    Uninitialized,
    AcquiringLock,
    CreatingLeases,
    Initialized,
}

/// Creates the initial lease set exactly once per store, no matter how many
/// hosts start at the same time.
pub(crate) struct Bootstrapper {
    host: String,
    synchronizer: Arc<PartitionSynchronizer>,
    lease_store: Arc<dyn LeaseStore>,
    init_store: Arc<dyn InitializationStore>,
    config: ChangeFeedConfig,
}

impl Bootstrapper {
    pub(crate) fn new(
        host: impl Into<String>,
        synchronizer: Arc<PartitionSynchronizer>,
        lease_store: Arc<dyn LeaseStore>,
        init_store: Arc<dyn InitializationStore>,
        config: ChangeFeedConfig,
    ) -> Self {
        Self {
            host: host.into(),
            synchronizer,
            lease_store,
            init_store,
            config,
        }
    }

    pub(crate) async fn initialize(&self, token: &CancellationToken) -> Result<(), ChangeFeedError> {
        let mut state = BootstrapState::Uninitialized;
        loop {
            if token.is_cancelled() {
                return Err(ChangeFeedError::Cancelled);
            }

            match self.init_store.is_initialized().await {
                Ok(true) => {
                    self.transition(&mut state, BootstrapState::Initialized);
                    return self.validate_schema().await;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(host = %self.host, error = %err, "Failed to read initialization state");
                    if !sleep_or_cancelled(self.config.bootstrap_sleep_time, token).await {
                        return Err(ChangeFeedError::Cancelled);
                    }
                    continue;
                }
            }

            self.transition(&mut state, BootstrapState::AcquiringLock);
            let locked = match self
                .init_store
                .acquire_initialization_lock(&self.host, self.config.lock_time)
                .await
            {
                Ok(locked) => locked,
                Err(err) => {
                    warn!(host = %self.host, error = %err, "Failed to acquire initialization lock");
                    false
                }
            };

            if !locked {
                info!(host = %self.host, "Another host is initializing the lease store, waiting");
                if !sleep_or_cancelled(self.config.bootstrap_sleep_time, token).await {
                    return Err(ChangeFeedError::Cancelled);
                }
                continue;
            }

            self.transition(&mut state, BootstrapState::CreatingLeases);
            let initialized = self.create_leases_under_lock().await;
            if let Err(err) = self.init_store.release_initialization_lock(&self.host).await {
                warn!(host = %self.host, error = %err, "Failed to release initialization lock");
            }

            if initialized {
                self.transition(&mut state, BootstrapState::Initialized);
                return self.validate_schema().await;
            }
            if !sleep_or_cancelled(self.config.bootstrap_sleep_time, token).await {
                return Err(ChangeFeedError::Cancelled);
            }
        }
    }

    /// Errors are logged and reported as "not initialized" so the outer loop
    /// simply tries again.
    async fn create_leases_under_lock(&self) -> bool {
        let created = match self.synchronizer.create_missing_leases().await {
            Ok(created) => created,
            Err(err) => {
                warn!(host = %self.host, error = %err, "Failed to create initial leases");
                return false;
            }
        };
        match self.init_store.mark_initialized().await {
            Ok(()) => {
                info!(host = %self.host, created, "Lease store initialized");
                true
            }
            Err(err) => {
                warn!(host = %self.host, error = %err, "Failed to mark lease store initialized");
                false
            }
        }
    }

    async fn validate_schema(&self) -> Result<(), ChangeFeedError> {
        let leases = self.lease_store.list_all().await.map_err(|err| {
            ChangeFeedError::FatalConfig(format!("cannot read lease store: {}", err))
        })?;
        let incompatible: Vec<_> = leases
            .iter()
            .filter(|lease| lease.version != LEASE_SCHEMA_VERSION)
            .map(|lease| lease.lease_token.as_str())
            .collect();
        if incompatible.is_empty() {
            return Ok(());
        }

        match self.config.schema_validation {
            SchemaValidation::Strict => Err(ChangeFeedError::FatalConfig(format!(
                "leases {:?} use a schema other than version {}",
                incompatible, LEASE_SCHEMA_VERSION
            ))),
            SchemaValidation::Lenient => {
                warn!(
                    leases = ?incompatible,
                    expected = LEASE_SCHEMA_VERSION,
                    "Lease store contains leases of another schema version"
                );
                Ok(())
            }
        }
    }

    fn transition(&self, state: &mut BootstrapState, next: BootstrapState) {
        if *state != next {
            info!(host = %self.host, from = ?state, to = ?next, "Bootstrap state change");
            *state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;

    use super::*;
    use crate::{
        error::LeaseStoreError,
        lease::{manager::LeaseStoreManager, memory::InMemoryLeaseStore, Lease},
        partition::enumerator::PartitionEnumerator,
        source::memory::InMemoryDataSource,
    };

    fn bootstrapper(
        host: &str,
        store: &Arc<InMemoryLeaseStore>,
        source: &Arc<InMemoryDataSource>,
        config: ChangeFeedConfig,
    ) -> Bootstrapper {
        let enumerator = Arc::new(PartitionEnumerator::new(source.clone(), Duration::ZERO));
        let manager = Arc::new(LeaseStoreManager::new(host, store.clone()));
        let synchronizer = Arc::new(PartitionSynchronizer::new(enumerator, manager));
        Bootstrapper::new(host, synchronizer, store.clone(), store.clone(), config)
    }

    /// Fails the first `failures` reads of the initialized flag.
    struct UnreachableInitStore {
        inner: Arc<InMemoryLeaseStore>,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl InitializationStore for UnreachableInitStore {
        async fn is_initialized(&self) -> Result<bool, LeaseStoreError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(LeaseStoreError::Backend("throttled".into()));
            }
            self.inner.is_initialized().await
        }

        async fn mark_initialized(&self) -> Result<(), LeaseStoreError> {
            self.inner.mark_initialized().await
        }

        async fn acquire_initialization_lock(
            &self,
            host: &str,
            lock_time: Duration,
        ) -> Result<bool, LeaseStoreError> {
            self.inner.acquire_initialization_lock(host, lock_time).await
        }

        async fn release_initialization_lock(&self, host: &str) -> Result<bool, LeaseStoreError> {
            self.inner.release_initialization_lock(host).await
        }
    }

    #[tokio::test]
    async fn initializes_once() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let source = Arc::new(InMemoryDataSource::with_partitions(4));
        let token = CancellationToken::new();

        bootstrapper("a", &store, &source, ChangeFeedConfig::default())
            .initialize(&token)
            .await
            .unwrap();
        assert!(store.is_initialized().await.unwrap());
        assert_eq!(store.len(), 4);

        // New partitions after initialization are not the bootstrapper's concern.
        source.add_partition(crate::source::PartitionDescriptor::new("9"));
        bootstrapper("b", &store, &source, ChangeFeedConfig::default())
            .initialize(&token)
            .await
            .unwrap();
        assert_eq!(store.len(), 4);
        // The lock was released.
        assert!(store
            .acquire_initialization_lock("c", Duration::from_secs(1))
            .await
            .unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn waits_while_another_host_holds_the_lock() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let source = Arc::new(InMemoryDataSource::with_partitions(2));
        store
            .acquire_initialization_lock("other", Duration::from_secs(3600))
            .await
            .unwrap();

        let token = CancellationToken::new();
        let config =
            ChangeFeedConfig::default().with_bootstrap_timing(Duration::from_secs(30), Duration::from_secs(5));
        let bootstrapper = bootstrapper("a", &store, &source, config);
        let handle = tokio::spawn({
            let token = token.clone();
            async move { bootstrapper.initialize(&token).await }
        });

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(!handle.is_finished());
        assert!(store.is_empty());

        // The holder finishes and marks the store initialized.
        store.mark_initialized().await.unwrap();
        store.release_initialization_lock("other").await.unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_retry_loop() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let source = Arc::new(InMemoryDataSource::with_partitions(1));
        store
            .acquire_initialization_lock("other", Duration::from_secs(3600))
            .await
            .unwrap();

        let token = CancellationToken::new();
        let bootstrapper = bootstrapper("a", &store, &source, ChangeFeedConfig::default());
        let handle = tokio::spawn({
            let token = token.clone();
            async move { bootstrapper.initialize(&token).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();

        assert!(matches!(
            handle.await.unwrap(),
            Err(ChangeFeedError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn strict_validation_rejects_foreign_schema() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let source = Arc::new(InMemoryDataSource::with_partitions(1));
        let mut legacy = Lease::new("legacy");
        legacy.version = LEASE_SCHEMA_VERSION + 1;
        store.put(legacy);
        store.mark_initialized().await.unwrap();
        let token = CancellationToken::new();

        let strict = bootstrapper("a", &store, &source, ChangeFeedConfig::default());
        assert!(matches!(
            strict.initialize(&token).await,
            Err(ChangeFeedError::FatalConfig(_))
        ));

        let lenient = bootstrapper(
            "a",
            &store,
            &source,
            ChangeFeedConfig::default().with_schema_validation(SchemaValidation::Lenient),
        );
        assert!(lenient.initialize(&token).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_initialization_state_is_retried() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let source = Arc::new(InMemoryDataSource::with_partitions(2));
        let init_store = Arc::new(UnreachableInitStore {
            inner: store.clone(),
            failures: AtomicUsize::new(1),
        });
        let enumerator = Arc::new(PartitionEnumerator::new(source.clone(), Duration::ZERO));
        let manager = Arc::new(LeaseStoreManager::new("a", store.clone()));
        let bootstrapper = Bootstrapper::new(
            "a",
            Arc::new(PartitionSynchronizer::new(enumerator, manager)),
            store.clone(),
            init_store,
            ChangeFeedConfig::default()
                .with_bootstrap_timing(Duration::from_secs(30), Duration::from_secs(5)),
        );

        let token = CancellationToken::new();
        let handle = tokio::spawn({
            let token = token.clone();
            async move { bootstrapper.initialize(&token).await }
        });

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!handle.is_finished());
        assert!(store.is_empty());

        tokio::time::sleep(Duration::from_secs(4)).await;
        handle.await.unwrap().unwrap();
        assert!(store.is_initialized().await.unwrap());
        assert_eq!(store.len(), 2);
    }
}

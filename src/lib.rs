use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tokio::{sync::Mutex as AsyncMutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use lease::{manager::LeaseStoreManager, taker::EqualPartitionsBalancingStrategy};
use partition::{
    bootstrapper::Bootstrapper, controller::PartitionController, enumerator::PartitionEnumerator,
    load_balancer::PartitionLoadBalancer, synchronizer::PartitionSynchronizer,
};
use util::runnable::run_at_fixed_interval;

pub mod config;
pub mod error;
pub mod interface;
pub mod lease;
pub mod partition;
pub mod source;
mod util;

pub use config::{ChangeFeedConfig, SchemaValidation, StartPosition};
pub use error::{ChangeFeedError, LeaseError, LeaseStoreError, ProcessingError, SourceError};
pub use interface::{
    observer::{ChangeFeedObserver, CloseReason, ObserverContext, ObserverFactory},
    record::ChangeRecord,
};
pub use lease::{InitializationStore, Lease, LeaseStore};
pub use source::DataSource;

/// Progress and ownership of one lease, as reported by
/// [`ChangeFeedProcessor::get_current_state`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseState {
    pub lease_token: String,
    pub owner: Option<String>,
    pub continuation_token: Option<String>,
    /// `None` when the lag could not be estimated.
    pub estimated_lag: Option<u64>,
}

struct Running {
    token: CancellationToken,
    controller: Arc<PartitionController>,
    balancer: JoinHandle<()>,
}

/// Distributes the partitions of a change feed across every host sharing the
/// same lease store and feeds their changes to per-partition observers.
pub struct ChangeFeedProcessor {
    lease_store: Arc<dyn LeaseStore>,
    init_store: Arc<dyn InitializationStore>,
    source: Arc<dyn DataSource>,
    observer_factory: ObserverFactory,
    config: ChangeFeedConfig,
    lease_manager: Arc<LeaseStoreManager>,

    running: AsyncMutex<Option<Running>>,
    is_running: AtomicBool,
    lifecycle: Mutex<CancellationToken>,
}

impl ChangeFeedProcessor {
    pub fn builder() -> ChangeFeedProcessorBuilder {
        ChangeFeedProcessorBuilder::default()
    }

    pub fn host_name(&self) -> &str {
        self.lease_manager.host()
    }

    /// Bootstraps the lease store if needed, resumes leases this host still
    /// owns and starts balancing. Returns once processing is underway.
    pub async fn start(&self) -> Result<(), ChangeFeedError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ChangeFeedError::AlreadyRunning);
        }

        let token = CancellationToken::new();
        *self.lifecycle.lock() = token.clone();

        let enumerator = Arc::new(PartitionEnumerator::new(
            self.source.clone(),
            self.config.partition_cache_ttl,
        ));
        let synchronizer = Arc::new(PartitionSynchronizer::new(
            enumerator,
            self.lease_manager.clone(),
        ));
        Bootstrapper::new(
            self.host_name(),
            synchronizer.clone(),
            self.lease_store.clone(),
            self.init_store.clone(),
            self.config.clone(),
        )
        .initialize(&token)
        .await?;

        let controller = Arc::new(PartitionController::new(
            self.lease_manager.clone(),
            synchronizer,
            self.source.clone(),
            self.observer_factory.clone(),
            self.config.clone(),
            token.child_token(),
        ));
        if let Err(err) = controller.initialize().await {
            controller.shutdown().await;
            return Err(err.into());
        }

        let strategy = EqualPartitionsBalancingStrategy::new(
            self.host_name(),
            self.config.min_scale_count,
            self.config.max_scale_count,
            self.config.lease_expiration_interval,
        );
        let balancer = Arc::new(PartitionLoadBalancer::new(
            self.lease_manager.clone(),
            controller.clone(),
            strategy,
        ));
        let balancer = tokio::spawn(run_at_fixed_interval(
            balancer,
            self.config.lease_acquire_interval,
            token.child_token(),
        ));

        *running = Some(Running {
            token,
            controller,
            balancer,
        });
        self.is_running.store(true, Ordering::SeqCst);
        info!(host = %self.host_name(), "Change feed processor started");
        Ok(())
    }

    /// Stops balancing, closes every observer and releases this host's
    /// leases. Calling it on a stopped processor does nothing.
    pub async fn stop(&self) {
        // Unblocks a start() still waiting in bootstrap.
        self.lifecycle.lock().cancel();

        let running = match self.running.lock().await.take() {
            Some(running) => running,
            None => return,
        };
        running.token.cancel();
        if let Err(err) = running.balancer.await {
            warn!(error = %err, "Load balancer task panicked");
        }
        running.controller.shutdown().await;
        self.is_running.store(false, Ordering::SeqCst);
        info!(host = %self.host_name(), "Change feed processor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Remaining changes per lease, keyed by lease token.
    pub async fn get_estimated_lag(&self) -> Result<HashMap<String, Option<u64>>, ChangeFeedError> {
        Ok(self
            .get_current_state()
            .await?
            .into_iter()
            .map(|state| (state.lease_token, state.estimated_lag))
            .collect())
    }

    pub async fn get_current_state(&self) -> Result<Vec<LeaseState>, ChangeFeedError> {
        let leases = self.lease_manager.list_all_leases().await?;
        let lags = futures::future::join_all(leases.iter().map(|lease| {
            self.source
                .estimate_lag(&lease.lease_token, lease.continuation_token.as_deref())
        }))
        .await;

        Ok(leases
            .into_iter()
            .zip(lags)
            .map(|(lease, lag)| LeaseState {
                lease_token: lease.lease_token,
                owner: lease.owner,
                continuation_token: lease.continuation_token,
                estimated_lag: lag.ok(),
            })
            .collect())
    }
}

#[derive(Default)]
pub struct ChangeFeedProcessorBuilder {
    host_name: Option<String>,
    lease_store: Option<Arc<dyn LeaseStore>>,
    init_store: Option<Arc<dyn InitializationStore>>,
    source: Option<Arc<dyn DataSource>>,
    observer_factory: Option<ObserverFactory>,
    config: ChangeFeedConfig,
}

impl ChangeFeedProcessorBuilder {
    /// Identifies this host as a lease owner; must be unique among hosts
    /// sharing the lease store.
    pub fn host_name(mut self, host_name: impl Into<String>) -> Self {
        self.host_name = Some(host_name.into());
        self
    }

    pub fn lease_store<S>(mut self, store: Arc<S>) -> Self
    where
        S: LeaseStore + InitializationStore + 'static,
    {
        self.lease_store = Some(store.clone());
        self.init_store = Some(store);
        self
    }

    pub fn data_source(mut self, source: Arc<dyn DataSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn observer_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn ChangeFeedObserver> + Send + Sync + 'static,
    {
        self.observer_factory = Some(Arc::new(factory));
        self
    }

    pub fn config(mut self, config: ChangeFeedConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<ChangeFeedProcessor, ChangeFeedError> {
        self.config.validate()?;
        let host_name = self
            .host_name
            .filter(|host| !host.is_empty())
            .ok_or_else(|| missing("host_name"))?;
        let lease_store = self.lease_store.ok_or_else(|| missing("lease_store"))?;
        let init_store = self.init_store.ok_or_else(|| missing("lease_store"))?;
        let source = self.source.ok_or_else(|| missing("data_source"))?;
        let observer_factory = self
            .observer_factory
            .ok_or_else(|| missing("observer_factory"))?;

        Ok(ChangeFeedProcessor {
            lease_manager: Arc::new(LeaseStoreManager::new(host_name, lease_store.clone())),
            lease_store,
            init_store,
            source,
            observer_factory,
            config: self.config,
            running: AsyncMutex::new(None),
            is_running: AtomicBool::new(false),
            lifecycle: Mutex::new(CancellationToken::new()),
        })
    }
}

fn missing(part: &str) -> ChangeFeedError {
    ChangeFeedError::FatalConfig(format!("{} is required", part))
}

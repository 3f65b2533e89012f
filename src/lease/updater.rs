use std::{sync::Arc, time::Duration};

use futures_retry::FutureRetry;
use parking_lot::Mutex;
use tracing::debug;

use super::{Lease, LeaseStore};
use crate::{
    error::{LeaseError, LeaseStoreError},
    util::{
        now_millis,
        retry::{FixedCountWithDelayStrategy, Retryable},
    },
};

/// Attempts per update, including the first.
pub(crate) const MAX_UPDATE_ATTEMPTS: usize = 5;

impl Retryable for LeaseError {
    fn is_retryable(&self) -> bool {
        matches!(self, LeaseError::Conflict { .. })
    }
}

/// Read-modify-write over a single lease with bounded conflict retries.
pub(crate) struct LeaseUpdater {
    store: Arc<dyn LeaseStore>,
}

impl LeaseUpdater {
    pub(crate) fn new(store: Arc<dyn LeaseStore>) -> Self {
        Self { store }
    }

    /// Applies `mutate` to `cached` and writes it back conditionally.
    ///
    /// On conflict the server copy is re-read: if its owner differs from
    /// `cached.owner` the lease is lost, otherwise the continuation and
    /// concurrency token are refreshed and `mutate` is applied again.
    pub(crate) async fn update<F>(&self, cached: Lease, mutate: F) -> Result<Lease, LeaseError>
    where
        F: Fn(&mut Lease) + Send + Sync,
    {
        let expected_owner = cached.owner.clone();
        let local = Mutex::new(cached);

        let local = &local;
        let mutate = &mutate;
        let expected_owner = expected_owner.as_deref();
        let result = FutureRetry::new(
            move || self.try_update_once(local, mutate, expected_owner),
            FixedCountWithDelayStrategy::new(MAX_UPDATE_ATTEMPTS, Duration::ZERO),
        )
        .await;

        match result {
            Ok((lease, _attempts)) => Ok(lease),
            Err((LeaseError::Conflict { lease_token, .. }, attempts)) => {
                Err(LeaseError::Conflict {
                    lease_token,
                    attempts,
                })
            }
            Err((err, _attempts)) => Err(err),
        }
    }

    async fn try_update_once<F>(
        &self,
        local: &Mutex<Lease>,
        mutate: &F,
        expected_owner: Option<&str>,
    ) -> Result<Lease, LeaseError>
    where
        F: Fn(&mut Lease) + Send + Sync,
    {
        let mut candidate = local.lock().clone();
        mutate(&mut candidate);
        candidate.timestamp = now_millis();
        let expected = candidate.concurrency_token.clone();

        match self.store.try_update(&candidate, expected.as_deref()).await {
            Ok(updated) => Ok(updated),
            Err(LeaseStoreError::NotFound(token)) => Err(LeaseError::Lost(token)),
            Err(LeaseStoreError::Conflict(token)) => {
                let server = match self.store.read(&token).await? {
                    Some(server) => server,
                    None => return Err(LeaseError::Lost(token)),
                };
                if server.owner.as_deref() != expected_owner {
                    debug!(
                        lease_token = %token,
                        owner = ?server.owner,
                        "Lease owner changed during update"
                    );
                    return Err(LeaseError::Lost(token));
                }

                {
                    let mut refreshed = local.lock();
                    refreshed.continuation_token = server.continuation_token;
                    refreshed.concurrency_token = server.concurrency_token;
                }
                debug!(lease_token = %token, "Lease update conflicted, retrying");
                Err(LeaseError::Conflict {
                    lease_token: token,
                    attempts: 1,
                })
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeSet, HashMap};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::lease::memory::InMemoryLeaseStore;

    async fn owned_lease(store: &InMemoryLeaseStore, owner: &str) -> Lease {
        let mut lease = Lease::new("0");
        lease.owner = Some(owner.to_string());
        store.put(lease)
    }

    #[tokio::test]
    async fn applies_mutation() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let lease = owned_lease(&store, "host-a").await;
        let updater = LeaseUpdater::new(store.clone());

        let updated = updater
            .update(lease.clone(), |l| l.continuation_token = Some("42".into()))
            .await
            .unwrap();

        assert_eq!(updated.continuation_token.as_deref(), Some("42"));
        assert_ne!(updated.concurrency_token, lease.concurrency_token);
        assert_eq!(store.read("0").await.unwrap().unwrap(), updated);
    }

    #[tokio::test]
    async fn refreshes_on_conflict_when_owner_unchanged() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let stale = owned_lease(&store, "host-a").await;

        // A concurrent checkpoint by the same owner bumps the token.
        let mut concurrent = stale.clone();
        concurrent.continuation_token = Some("7".into());
        store
            .try_update(&concurrent, stale.concurrency_token.as_deref())
            .await
            .unwrap();

        let updater = LeaseUpdater::new(store.clone());
        let updated = updater
            .update(stale, |l| {
                l.properties.insert("k".into(), "v".into());
            })
            .await
            .unwrap();

        assert_eq!(updated.continuation_token.as_deref(), Some("7"));
        assert_eq!(updated.properties.get("k").map(String::as_str), Some("v"));
    }

    #[tokio::test]
    async fn conflict_with_new_owner_is_lost() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let stale = owned_lease(&store, "host-a").await;

        let mut stolen = stale.clone();
        stolen.owner = Some("host-b".into());
        store
            .try_update(&stolen, stale.concurrency_token.as_deref())
            .await
            .unwrap();

        let updater = LeaseUpdater::new(store.clone());
        let err = updater.update(stale, |_| {}).await.unwrap_err();
        assert_eq!(err, LeaseError::Lost("0".into()));
    }

    #[tokio::test]
    async fn missing_lease_is_lost() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let lease = owned_lease(&store, "host-a").await;
        store.delete(&lease).await.unwrap();

        let updater = LeaseUpdater::new(store.clone());
        let err = updater.update(lease, |_| {}).await.unwrap_err();
        assert!(err.is_lost());
    }

    /// Bumps the stored lease before every conditional write so each attempt
    /// loses the race.
    struct AlwaysRacing {
        inner: InMemoryLeaseStore,
        writes: AtomicUsize,
    }

    #[async_trait]
    impl LeaseStore for AlwaysRacing {
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
            self.inner
                .try_create(lease_token, seed_continuation, properties, parent_tokens)
                .await
        }

        async fn try_update(
            &self,
            lease: &Lease,
            expected_concurrency_token: Option<&str>,
        ) -> Result<Lease, LeaseStoreError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if let Some(current) = self.inner.read(&lease.lease_token).await? {
                self.inner.put(current);
            }
            self.inner.try_update(lease, expected_concurrency_token).await
        }

        async fn delete(&self, lease: &Lease) -> Result<(), LeaseStoreError> {
            self.inner.delete(lease).await
        }
    }

    #[tokio::test]
    async fn gives_up_softly_after_bounded_attempts() {
        let store = Arc::new(AlwaysRacing {
            inner: InMemoryLeaseStore::new(),
            writes: AtomicUsize::new(0),
        });
        let lease = owned_lease(&store.inner, "host-a").await;

        let updater = LeaseUpdater::new(store.clone());
        let err = updater.update(lease, |_| {}).await.unwrap_err();

        assert_eq!(
            err,
            LeaseError::Conflict {
                lease_token: "0".into(),
                attempts: MAX_UPDATE_ATTEMPTS
            }
        );
        assert_eq!(store.writes.load(Ordering::SeqCst), MAX_UPDATE_ATTEMPTS);
    }
}

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::RwLock;

use crate::{
    error::SourceError,
    source::{DataSource, KeyRange, PartitionDescriptor},
};

struct PartitionCache {
    partitions: Vec<PartitionDescriptor>,
    last_cache_update: Option<Instant>,
    cache_ttl: Duration,
}

impl PartitionCache {
    fn new(cache_ttl: Duration) -> Self {
        Self {
            partitions: Vec::new(),
            last_cache_update: None,
            cache_ttl,
        }
    }

    fn get_all(&self) -> Option<Vec<PartitionDescriptor>> {
        if self.cache_is_expired() {
            None
        } else {
            Some(self.partitions.clone())
        }
    }

    fn refresh(&mut self, partitions: Vec<PartitionDescriptor>) {
        self.partitions = partitions;
        self.last_cache_update = Some(Instant::now());
    }

    fn cache_is_expired(&self) -> bool {
        match self.last_cache_update {
            Some(last_updated_time) => last_updated_time + self.cache_ttl <= Instant::now(),
            None => true,
        }
    }
}

/// Lists the data source's current partitions, cached for a short TTL.
pub(crate) struct PartitionEnumerator {
    source: Arc<dyn DataSource>,
    range: KeyRange,
    cache: RwLock<PartitionCache>,
}

impl PartitionEnumerator {
    pub(crate) fn new(source: Arc<dyn DataSource>, cache_ttl: Duration) -> Self {
        Self {
            source,
            range: KeyRange::full(),
            cache: RwLock::new(PartitionCache::new(cache_ttl)),
        }
    }

    pub(crate) async fn list_partitions(&self) -> Result<Vec<PartitionDescriptor>, SourceError> {
        if let Some(partitions) = self.cache.read().await.get_all() {
            return Ok(partitions);
        }
        self.refresh().await
    }

    /// Bypasses the cache; used whenever the topology is known to have changed.
    pub(crate) async fn refresh(&self) -> Result<Vec<PartitionDescriptor>, SourceError> {
        let partitions = self.source.list_partitions(&self.range).await?;
        self.cache.write().await.refresh(partitions.clone());
        Ok(partitions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::memory::InMemoryDataSource;

    #[tokio::test]
    async fn serves_cached_listing_until_refreshed() {
        let source = Arc::new(InMemoryDataSource::with_partitions(1));
        let enumerator = PartitionEnumerator::new(source.clone(), Duration::from_secs(3600));

        assert_eq!(enumerator.list_partitions().await.unwrap().len(), 1);

        source.split("0", &["1", "2"]);
        let cached = enumerator.list_partitions().await.unwrap();
        assert_eq!(cached[0].id, "0");

        let refreshed = enumerator.refresh().await.unwrap();
        assert_eq!(refreshed.len(), 2);
        assert_eq!(enumerator.list_partitions().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn zero_ttl_always_lists_from_source() {
        let source = Arc::new(InMemoryDataSource::with_partitions(1));
        let enumerator = PartitionEnumerator::new(source.clone(), Duration::ZERO);

        enumerator.list_partitions().await.unwrap();
        source.split("0", &["1"]);
        let listed = enumerator.list_partitions().await.unwrap();
        assert_eq!(listed[0].id, "1");
    }
}

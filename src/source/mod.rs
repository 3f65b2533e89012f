use async_trait::async_trait;

use crate::{config::StartPosition, error::SourceError, interface::record::ChangeRecord};

pub mod kinesis;
pub mod memory;

/// Half-open key range `[min_inclusive, max_exclusive)` compared
/// lexicographically. `max_exclusive == None` is unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyRange {
    pub min_inclusive: String,
    pub max_exclusive: Option<String>,
}

impl KeyRange {
    pub fn new(min_inclusive: impl Into<String>, max_exclusive: impl Into<String>) -> Self {
        Self {
            min_inclusive: min_inclusive.into(),
            max_exclusive: Some(max_exclusive.into()),
        }
    }

    /// The whole key space.
    pub fn full() -> Self {
        Self {
            min_inclusive: String::new(),
            max_exclusive: None,
        }
    }

    pub fn overlaps(&self, other: &KeyRange) -> bool {
        let starts_before_other_ends = match &other.max_exclusive {
            Some(max) => self.min_inclusive < *max,
            None => true,
        };
        let other_starts_before_end = match &self.max_exclusive {
            Some(max) => other.min_inclusive < *max,
            None => true,
        };
        starts_before_other_ends && other_starts_before_end
    }
}

/// A physical partition as currently reported by the data source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionDescriptor {
    pub id: String,
    /// Partitions this one was split or merged from.
    pub parent_ids: Vec<String>,
    pub range: KeyRange,
}

impl PartitionDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent_ids: Vec::new(),
            range: KeyRange::full(),
        }
    }

    pub fn with_parents<I, S>(mut self, parents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parent_ids = parents.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_range(mut self, range: KeyRange) -> Self {
        self.range = range;
        self
    }
}

/// Result of one bounded read.
#[derive(Debug, Clone, Default)]
pub struct ChangeBatch {
    pub items: Vec<ChangeRecord>,
    /// Position to resume from after this batch. `None` means the source had
    /// no better position than the one it was read from.
    pub continuation: Option<String>,
}

impl ChangeBatch {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// A partitioned change feed.
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn list_partitions(&self, range: &KeyRange)
        -> Result<Vec<PartitionDescriptor>, SourceError>;

    /// Reads at most `max_items` changes after `continuation`, or from `start`
    /// when there is no continuation.
    async fn read_batch(
        &self,
        partition_id: &str,
        continuation: Option<&str>,
        start: StartPosition,
        max_items: usize,
    ) -> Result<ChangeBatch, SourceError>;

    /// How far `continuation` trails the head of the partition, in
    /// source-specific units.
    async fn estimate_lag(
        &self,
        partition_id: &str,
        continuation: Option<&str>,
    ) -> Result<u64, SourceError>;
}

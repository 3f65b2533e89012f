use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::{ChangeBatch, DataSource, KeyRange, PartitionDescriptor};
use crate::{config::StartPosition, error::SourceError, interface::record::ChangeRecord};

struct PartitionState {
    descriptor: PartitionDescriptor,
    records: Vec<ChangeRecord>,
    gone: bool,
    faults: VecDeque<SourceError>,
    max_payload_items: Option<usize>,
}

impl PartitionState {
    fn new(descriptor: PartitionDescriptor) -> Self {
        Self {
            descriptor,
            records: Vec::new(),
            gone: false,
            faults: VecDeque::new(),
            max_payload_items: None,
        }
    }
}

/// A change feed held in memory, with split/merge simulation and fault
/// injection.
///
/// Continuations have the form `"{partition}:{offset}"`. A continuation that
/// names another partition (a parent's, inherited through a split) resumes
/// the child from its first record.
#[derive(Default)]
pub struct InMemoryDataSource {
    partitions: Mutex<BTreeMap<String, PartitionState>>,
    read_log: Mutex<HashMap<String, Vec<usize>>>,
}

impl InMemoryDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// A source with `count` unrelated partitions named `"0"`, `"1"`, ...
    pub fn with_partitions(count: usize) -> Self {
        let source = Self::new();
        for id in 0..count {
            source.add_partition(PartitionDescriptor::new(id.to_string()));
        }
        source
    }

    pub fn add_partition(&self, descriptor: PartitionDescriptor) {
        self.partitions
            .lock()
            .insert(descriptor.id.clone(), PartitionState::new(descriptor));
    }

    /// Appends a record and returns its position.
    pub fn push(&self, partition_id: &str, data: impl Into<Bytes>) -> Option<String> {
        let mut partitions = self.partitions.lock();
        let partition = partitions.get_mut(partition_id)?;
        let position = partition.records.len().to_string();
        partition
            .records
            .push(ChangeRecord::new(position.clone(), data.into()));
        Some(position)
    }

    /// Retires `parent` and creates `children` covering its key range.
    pub fn split(&self, parent: &str, children: &[&str]) {
        let mut partitions = self.partitions.lock();
        let range = match partitions.get_mut(parent) {
            Some(state) => {
                state.gone = true;
                state.descriptor.range.clone()
            }
            None => return,
        };
        for child in children {
            let descriptor = PartitionDescriptor::new(*child)
                .with_parents(vec![parent])
                .with_range(range.clone());
            partitions.insert(child.to_string(), PartitionState::new(descriptor));
        }
    }

    /// Retires every partition in `parents` and creates `child` in their place.
    pub fn merge(&self, parents: &[&str], child: &str) {
        let mut partitions = self.partitions.lock();
        for parent in parents {
            if let Some(state) = partitions.get_mut(*parent) {
                state.gone = true;
            }
        }
        let descriptor = PartitionDescriptor::new(child).with_parents(parents.iter().copied());
        partitions.insert(child.to_string(), PartitionState::new(descriptor));
    }

    /// Deletes the partition outright; later reads report `NotFound`.
    pub fn remove_partition(&self, partition_id: &str) {
        self.partitions.lock().remove(partition_id);
    }

    /// Queues an error returned by the next read of `partition_id`.
    pub fn inject_fault(&self, partition_id: &str, fault: SourceError) {
        if let Some(state) = self.partitions.lock().get_mut(partition_id) {
            state.faults.push_back(fault);
        }
    }

    /// Reads asking for more than `limit` items fail with `TooLarge`.
    pub fn set_max_payload_items(&self, partition_id: &str, limit: Option<usize>) {
        if let Some(state) = self.partitions.lock().get_mut(partition_id) {
            state.max_payload_items = limit;
        }
    }

    /// The `max_items` of every read issued against `partition_id`, in order.
    pub fn read_log(&self, partition_id: &str) -> Vec<usize> {
        self.read_log
            .lock()
            .get(partition_id)
            .cloned()
            .unwrap_or_default()
    }

    fn resume_offset(partition_id: &str, continuation: Option<&str>) -> Option<usize> {
        let (owner, offset) = continuation?.rsplit_once(':')?;
        if owner == partition_id {
            offset.parse().ok()
        } else {
            Some(0)
        }
    }
}

#[async_trait]
impl DataSource for InMemoryDataSource {
    async fn list_partitions(
        &self,
        range: &KeyRange,
    ) -> Result<Vec<PartitionDescriptor>, SourceError> {
        Ok(self
            .partitions
            .lock()
            .values()
            .filter(|state| !state.gone && state.descriptor.range.overlaps(range))
            .map(|state| state.descriptor.clone())
            .collect())
    }

    async fn read_batch(
        &self,
        partition_id: &str,
        continuation: Option<&str>,
        start: StartPosition,
        max_items: usize,
    ) -> Result<ChangeBatch, SourceError> {
        self.read_log
            .lock()
            .entry(partition_id.to_string())
            .or_default()
            .push(max_items);

        let mut partitions = self.partitions.lock();
        let state = partitions
            .get_mut(partition_id)
            .ok_or_else(|| SourceError::NotFound(partition_id.to_string()))?;
        if let Some(fault) = state.faults.pop_front() {
            return Err(fault);
        }
        if state.gone {
            return Err(SourceError::Gone(partition_id.to_string()));
        }
        if matches!(state.max_payload_items, Some(limit) if max_items > limit) {
            return Err(SourceError::TooLarge);
        }

        let offset = match Self::resume_offset(partition_id, continuation) {
            Some(offset) => offset,
            None if continuation.is_some() => {
                return Err(SourceError::Other(format!(
                    "malformed continuation {:?}",
                    continuation
                )))
            }
            None => match start {
                StartPosition::Beginning => 0,
                StartPosition::Now => state.records.len(),
            },
        };
        let offset = offset.min(state.records.len());
        let end = (offset + max_items).min(state.records.len());
        Ok(ChangeBatch {
            items: state.records[offset..end].to_vec(),
            continuation: Some(format!("{}:{}", partition_id, end)),
        })
    }

    async fn estimate_lag(
        &self,
        partition_id: &str,
        continuation: Option<&str>,
    ) -> Result<u64, SourceError> {
        let partitions = self.partitions.lock();
        let state = partitions
            .get(partition_id)
            .ok_or_else(|| SourceError::NotFound(partition_id.to_string()))?;
        let offset = Self::resume_offset(partition_id, continuation).unwrap_or(0);
        Ok(state.records.len().saturating_sub(offset) as u64)
    }
}

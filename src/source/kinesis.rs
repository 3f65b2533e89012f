//! Kinesis Data Streams as a change feed.
//!
//! Shards are partitions and their parent/adjacent-parent links describe
//! splits and merges. Reads are stateless: each batch fetches a fresh shard
//! iterator from the continuation, which is `"{shard_id}:{sequence_number}"`
//! (or `"{shard_id}:@{millis}"` when only a read time is known). A child shard
//! handed its parent's continuation starts from its own trim horizon.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rusoto_core::RusotoError;
use rusoto_kinesis::{
    GetRecordsError, GetRecordsInput, GetRecordsOutput, GetShardIteratorError,
    GetShardIteratorInput, Kinesis, KinesisClient, ListShardsError, ListShardsInput, Record, Shard,
};

use super::{ChangeBatch, DataSource, KeyRange, PartitionDescriptor};
use crate::{
    config::StartPosition, error::SourceError, interface::record::ChangeRecord, util::now_millis,
};

const THROTTLE_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct StreamDescriptor {
    pub stream_name: String,
}

pub struct KinesisDataSource {
    descriptor: StreamDescriptor,
    kinesis_client: KinesisClient,
}

enum IteratorStart {
    AfterSequenceNumber(String),
    AtTimestamp(u64),
    TrimHorizon,
    Latest,
}

impl KinesisDataSource {
    pub fn new(descriptor: StreamDescriptor, kinesis_client: KinesisClient) -> Self {
        Self {
            descriptor,
            kinesis_client,
        }
    }

    async fn get_shards(&self) -> Result<Vec<Shard>, RusotoError<ListShardsError>> {
        let mut result = Vec::new();
        let request = ListShardsInput {
            stream_name: Some(self.descriptor.stream_name.clone()),
            ..Default::default()
        };
        let mut response = self.kinesis_client.list_shards(request).await?;
        result.extend(response.shards.take().unwrap_or_default());
        while let Some(next_token) = response.next_token.take() {
            // The stream name must be omitted when paging with a token.
            let request = ListShardsInput {
                next_token: Some(next_token),
                ..Default::default()
            };
            response = self.kinesis_client.list_shards(request).await?;
            result.extend(response.shards.take().unwrap_or_default());
        }
        Ok(result)
    }

    fn iterator_start(
        shard_id: &str,
        continuation: Option<&str>,
        start: StartPosition,
    ) -> IteratorStart {
        match continuation.and_then(|c| c.split_once(':')) {
            Some((owner, position)) if owner == shard_id => {
                match position.strip_prefix('@').map(str::parse::<u64>) {
                    Some(Ok(millis)) => IteratorStart::AtTimestamp(millis),
                    _ => IteratorStart::AfterSequenceNumber(position.to_string()),
                }
            }
            // Inherited from a parent shard: the child starts at its beginning.
            Some(_) => IteratorStart::TrimHorizon,
            None => match start {
                StartPosition::Beginning => IteratorStart::TrimHorizon,
                StartPosition::Now => IteratorStart::Latest,
            },
        }
    }

    async fn shard_iterator(
        &self,
        shard_id: &str,
        start: IteratorStart,
    ) -> Result<Option<String>, SourceError> {
        let mut request = GetShardIteratorInput {
            shard_id: shard_id.to_string(),
            stream_name: self.descriptor.stream_name.clone(),
            ..Default::default()
        };
        match start {
            IteratorStart::AfterSequenceNumber(sequence_number) => {
                request.shard_iterator_type = "AFTER_SEQUENCE_NUMBER".to_string();
                request.starting_sequence_number = Some(sequence_number);
            }
            IteratorStart::AtTimestamp(millis) => {
                request.shard_iterator_type = "AT_TIMESTAMP".to_string();
                request.timestamp = Some(millis as f64 / 1000.0);
            }
            IteratorStart::TrimHorizon => request.shard_iterator_type = "TRIM_HORIZON".to_string(),
            IteratorStart::Latest => request.shard_iterator_type = "LATEST".to_string(),
        }

        match self.kinesis_client.get_shard_iterator(request).await {
            Ok(response) => Ok(response.shard_iterator),
            Err(RusotoError::Service(GetShardIteratorError::ResourceNotFound(_))) => {
                Err(SourceError::NotFound(shard_id.to_string()))
            }
            Err(RusotoError::Service(GetShardIteratorError::ProvisionedThroughputExceeded(_))) => {
                Err(SourceError::Throttled {
                    retry_after: THROTTLE_BACKOFF,
                })
            }
            Err(RusotoError::HttpDispatch(err)) => Err(SourceError::Transient(err.to_string())),
            Err(err) => Err(SourceError::Other(err.to_string())),
        }
    }

    async fn get_records(
        &self,
        shard_id: &str,
        shard_iterator: String,
        limit: usize,
    ) -> Result<GetRecordsOutput, SourceError> {
        let request = GetRecordsInput {
            limit: Some(limit as i64),
            shard_iterator,
            ..Default::default()
        };
        match self.kinesis_client.get_records(request).await {
            Ok(response) => Ok(response),
            Err(RusotoError::Service(GetRecordsError::ResourceNotFound(_))) => {
                Err(SourceError::NotFound(shard_id.to_string()))
            }
            Err(RusotoError::Service(GetRecordsError::ProvisionedThroughputExceeded(_)))
            | Err(RusotoError::Service(GetRecordsError::KMSThrottling(_))) => {
                Err(SourceError::Throttled {
                    retry_after: THROTTLE_BACKOFF,
                })
            }
            Err(RusotoError::Service(GetRecordsError::ExpiredIterator(message))) => {
                Err(SourceError::Transient(message))
            }
            Err(RusotoError::HttpDispatch(err)) => Err(SourceError::Transient(err.to_string())),
            Err(err) => Err(SourceError::Other(err.to_string())),
        }
    }
}

fn parse_hash_key(hash_key: &str) -> Option<u128> {
    hash_key.parse::<u128>().ok()
}

/// Kinesis hash keys are decimal u128 strings; ranges are rendered as
/// fixed-width hex so they order correctly under string comparison.
fn shard_to_partition(shard: Shard) -> PartitionDescriptor {
    let start = parse_hash_key(&shard.hash_key_range.starting_hash_key).unwrap_or(0);
    let end_exclusive = parse_hash_key(&shard.hash_key_range.ending_hash_key)
        .and_then(|end| end.checked_add(1));
    let range = KeyRange {
        min_inclusive: format!("{:032x}", start),
        max_exclusive: end_exclusive.map(|end| format!("{:032x}", end)),
    };
    let parents = shard
        .parent_shard_id
        .into_iter()
        .chain(shard.adjacent_parent_shard_id)
        .collect::<Vec<_>>();
    PartitionDescriptor::new(shard.shard_id)
        .with_parents(parents)
        .with_range(range)
}

fn to_change_record(record: Record) -> ChangeRecord {
    ChangeRecord {
        position: record.sequence_number,
        partition_key: Some(record.partition_key),
        // rusoto 0.45 is on bytes 0.5.
        data: Bytes::copy_from_slice(&record.data[..]),
        arrival_timestamp_millis: record
            .approximate_arrival_timestamp
            .map(|seconds| (seconds * 1000.0) as u64),
    }
}

#[async_trait]
impl DataSource for KinesisDataSource {
    async fn list_partitions(
        &self,
        range: &KeyRange,
    ) -> Result<Vec<PartitionDescriptor>, SourceError> {
        let shards = match self.get_shards().await {
            Ok(shards) => shards,
            Err(RusotoError::Service(ListShardsError::ResourceNotFound(message))) => {
                return Err(SourceError::NotFound(message))
            }
            Err(RusotoError::Service(ListShardsError::LimitExceeded(_))) => {
                return Err(SourceError::Throttled {
                    retry_after: THROTTLE_BACKOFF,
                })
            }
            Err(err) => return Err(SourceError::Other(err.to_string())),
        };
        Ok(shards
            .into_iter()
            .map(shard_to_partition)
            .filter(|partition| partition.range.overlaps(range))
            .collect())
    }

    async fn read_batch(
        &self,
        partition_id: &str,
        continuation: Option<&str>,
        start: StartPosition,
        max_items: usize,
    ) -> Result<ChangeBatch, SourceError> {
        if max_items > 10_000 {
            return Err(SourceError::TooLarge);
        }
        let read_at = now_millis();
        let iterator_start = Self::iterator_start(partition_id, continuation, start);
        let resumable = matches!(
            iterator_start,
            IteratorStart::AfterSequenceNumber(_) | IteratorStart::AtTimestamp(_)
        );
        let shard_iterator = match self.shard_iterator(partition_id, iterator_start).await? {
            Some(iterator) => iterator,
            None => return Err(SourceError::Gone(partition_id.to_string())),
        };

        let response = self
            .get_records(partition_id, shard_iterator, max_items)
            .await?;
        if response.records.is_empty() && response.next_shard_iterator.is_none() {
            return Err(SourceError::Gone(partition_id.to_string()));
        }

        let continuation = match response.records.last() {
            Some(last) => Some(format!("{}:{}", partition_id, last.sequence_number)),
            None if resumable => continuation.map(str::to_string),
            // Nothing read from LATEST; pin the position to the read time.
            None => Some(format!("{}:@{}", partition_id, read_at)),
        };
        Ok(ChangeBatch {
            items: response.records.into_iter().map(to_change_record).collect(),
            continuation,
        })
    }

    async fn estimate_lag(
        &self,
        partition_id: &str,
        continuation: Option<&str>,
    ) -> Result<u64, SourceError> {
        let iterator_start =
            Self::iterator_start(partition_id, continuation, StartPosition::Beginning);
        let shard_iterator = match self.shard_iterator(partition_id, iterator_start).await? {
            Some(iterator) => iterator,
            None => return Ok(0),
        };
        let response = self.get_records(partition_id, shard_iterator, 1).await?;
        Ok(response.millis_behind_latest.unwrap_or(0).max(0) as u64)
    }
}

use bytes::Bytes;

/// One change read from a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    /// Source-specific position of this record within its partition.
    pub position: String,
    pub partition_key: Option<String>,
    pub data: Bytes,
    pub arrival_timestamp_millis: Option<u64>,
}

impl ChangeRecord {
    pub fn new(position: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            position: position.into(),
            partition_key: None,
            data: data.into(),
            arrival_timestamp_millis: None,
        }
    }

    pub fn with_partition_key(mut self, partition_key: impl Into<String>) -> Self {
        self.partition_key = Some(partition_key.into());
        self
    }
}

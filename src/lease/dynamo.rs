//! DynamoDB lease store.
//!
//! All leases live in one table keyed by `lease_token`. The concurrency token
//! is a numeric `version` attribute bumped on every write and enforced with
//! condition expressions. Two reserved items share the table: the
//! initialization marker and the initialization lock.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use dynomite::{
    dynamodb::{
        AttributeValue, DeleteItemError, DeleteItemInput, DynamoDb, DynamoDbClient, GetItemInput,
        PutItemError, PutItemInput, ScanInput,
    },
    Attribute, AttributeError, Attributes, FromAttributes, Item,
};
use rusoto_core::RusotoError;
use tracing::warn;

use super::{InitializationStore, Lease, LeaseStore, LEASE_SCHEMA_VERSION};
use crate::{error::LeaseStoreError, util::now_millis};

const PARTITION_KEY: &str = "lease_token";
const INITIALIZED_KEY: &str = ".initialized";
const LOCK_KEY: &str = ".lock";

#[derive(Item, Debug, Clone)]
struct LeaseItem {
    #[dynomite(partition_key)]
    lease_token: String,
    owner: Option<String>,
    continuation_token: Option<String>,
    version: u64,
    timestamp: u64,
    properties: HashMap<String, String>,
    // DynamoDB rejects empty string sets, so "no parents" is stored as NULL.
    parent_tokens: Option<HashSet<String>>,
    schema_version: u64,
}

impl LeaseItem {
    fn from_lease(lease: &Lease, version: u64) -> Self {
        Self {
            lease_token: lease.lease_token.clone(),
            owner: lease.owner.clone(),
            continuation_token: lease.continuation_token.clone(),
            version,
            timestamp: lease.timestamp,
            properties: lease.properties.clone(),
            parent_tokens: if lease.parent_tokens.is_empty() {
                None
            } else {
                Some(lease.parent_tokens.iter().cloned().collect())
            },
            schema_version: u64::from(lease.version),
        }
    }

    fn into_lease(self) -> Lease {
        Lease {
            lease_token: self.lease_token,
            owner: self.owner,
            continuation_token: self.continuation_token,
            concurrency_token: Some(self.version.to_string()),
            timestamp: self.timestamp,
            properties: self.properties,
            parent_tokens: self
                .parent_tokens
                .map(|parents| parents.into_iter().collect())
                .unwrap_or_default(),
            version: self.schema_version as u32,
        }
    }
}

pub struct DynamoLeaseStore {
    client: DynamoDbClient,
    table_name: String,
}

impl DynamoLeaseStore {
    pub fn new(client: DynamoDbClient, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
        }
    }

    fn key(lease_token: &str) -> Attributes {
        let mut key = HashMap::new();
        key.insert(PARTITION_KEY.to_string(), lease_token.to_string().into_attr());
        key
    }

    async fn get(&self, key: &str) -> Result<Option<Attributes>, LeaseStoreError> {
        let input = GetItemInput {
            table_name: self.table_name.clone(),
            key: Self::key(key),
            consistent_read: Some(true),
            ..Default::default()
        };
        let output = self.client.get_item(input).await.map_err(backend)?;
        Ok(output.item)
    }

    /// Conditional put. `Ok(false)` means the condition did not hold.
    async fn put_if(
        &self,
        item: Attributes,
        condition: &str,
        names: HashMap<String, String>,
        values: HashMap<String, AttributeValue>,
    ) -> Result<bool, LeaseStoreError> {
        let input = PutItemInput {
            table_name: self.table_name.clone(),
            item,
            condition_expression: Some(condition.to_string()),
            expression_attribute_names: if names.is_empty() { None } else { Some(names) },
            expression_attribute_values: if values.is_empty() {
                None
            } else {
                Some(values)
            },
            ..Default::default()
        };
        match self.client.put_item(input).await {
            Ok(_) => Ok(true),
            Err(RusotoError::Service(PutItemError::ConditionalCheckFailed(_))) => Ok(false),
            Err(err) => Err(backend(err)),
        }
    }
}

fn backend<E: std::error::Error + 'static>(err: RusotoError<E>) -> LeaseStoreError {
    LeaseStoreError::Backend(err.to_string())
}

fn decode(attrs: Attributes) -> Result<Lease, LeaseStoreError> {
    LeaseItem::from_attrs(attrs)
        .map(LeaseItem::into_lease)
        .map_err(|err| match err {
            AttributeError::MissingField { name } => {
                LeaseStoreError::Backend(format!("lease attribute '{}' was missing", name))
            }
            other => LeaseStoreError::Backend(format!("malformed lease item: {:?}", other)),
        })
}

fn is_reserved(attrs: &Attributes) -> bool {
    attrs
        .get(PARTITION_KEY)
        .and_then(|value| value.s.as_deref())
        .map(|key| key == INITIALIZED_KEY || key == LOCK_KEY)
        .unwrap_or(false)
}

#[async_trait]
impl LeaseStore for DynamoLeaseStore {
    async fn list_all(&self) -> Result<Vec<Lease>, LeaseStoreError> {
        let mut leases = Vec::new();
        let mut start_key = None;
        loop {
            let input = ScanInput {
                table_name: self.table_name.clone(),
                consistent_read: Some(true),
                exclusive_start_key: start_key.take(),
                ..Default::default()
            };
            let output = self.client.scan(input).await.map_err(backend)?;
            for attrs in output.items.unwrap_or_default() {
                if !is_reserved(&attrs) {
                    leases.push(decode(attrs)?);
                }
            }
            match output.last_evaluated_key {
                Some(key) if !key.is_empty() => start_key = Some(key),
                _ => break,
            }
        }
        Ok(leases)
    }

    async fn read(&self, lease_token: &str) -> Result<Option<Lease>, LeaseStoreError> {
        self.get(lease_token).await?.map(decode).transpose()
    }

    async fn try_create(
        &self,
        lease_token: &str,
        seed_continuation: Option<String>,
        properties: HashMap<String, String>,
        parent_tokens: BTreeSet<String>,
    ) -> Result<Lease, LeaseStoreError> {
        let mut lease = Lease::new(lease_token);
        lease.continuation_token = seed_continuation;
        lease.properties = properties;
        lease.parent_tokens = parent_tokens;
        lease.timestamp = now_millis();
        lease.version = LEASE_SCHEMA_VERSION;

        let item = LeaseItem::from_lease(&lease, 1);
        let mut names = HashMap::new();
        names.insert("#k".to_string(), PARTITION_KEY.to_string());
        if self
            .put_if(item.clone().into(), "attribute_not_exists(#k)", names, HashMap::new())
            .await?
        {
            Ok(item.into_lease())
        } else {
            Err(LeaseStoreError::AlreadyExists(lease_token.to_string()))
        }
    }

    async fn try_update(
        &self,
        lease: &Lease,
        expected_concurrency_token: Option<&str>,
    ) -> Result<Lease, LeaseStoreError> {
        let expected = match expected_concurrency_token.and_then(|t| t.parse::<u64>().ok()) {
            Some(version) => version,
            None => return Err(LeaseStoreError::Conflict(lease.lease_token.clone())),
        };

        let item = LeaseItem::from_lease(lease, expected + 1);
        let mut names = HashMap::new();
        names.insert("#k".to_string(), PARTITION_KEY.to_string());
        names.insert("#v".to_string(), "version".to_string());
        let mut values = HashMap::new();
        values.insert(":expected".to_string(), expected.into_attr());

        if self
            .put_if(
                item.clone().into(),
                "attribute_exists(#k) AND #v = :expected",
                names,
                values,
            )
            .await?
        {
            return Ok(item.into_lease());
        }

        match self.get(&lease.lease_token).await? {
            Some(_) => Err(LeaseStoreError::Conflict(lease.lease_token.clone())),
            None => Err(LeaseStoreError::NotFound(lease.lease_token.clone())),
        }
    }

    async fn delete(&self, lease: &Lease) -> Result<(), LeaseStoreError> {
        let input = DeleteItemInput {
            table_name: self.table_name.clone(),
            key: Self::key(&lease.lease_token),
            ..Default::default()
        };
        self.client.delete_item(input).await.map_err(backend)?;
        Ok(())
    }
}

#[async_trait]
impl InitializationStore for DynamoLeaseStore {
    async fn is_initialized(&self) -> Result<bool, LeaseStoreError> {
        Ok(self.get(INITIALIZED_KEY).await?.is_some())
    }

    async fn mark_initialized(&self) -> Result<(), LeaseStoreError> {
        let mut item = Self::key(INITIALIZED_KEY);
        item.insert("initialized_at".to_string(), now_millis().into_attr());
        let input = PutItemInput {
            table_name: self.table_name.clone(),
            item,
            ..Default::default()
        };
        self.client.put_item(input).await.map_err(backend)?;
        Ok(())
    }

    async fn acquire_initialization_lock(
        &self,
        host: &str,
        lock_time: Duration,
    ) -> Result<bool, LeaseStoreError> {
        let now = now_millis();
        let mut item = Self::key(LOCK_KEY);
        item.insert("lock_owner".to_string(), host.to_string().into_attr());
        item.insert(
            "expires_at".to_string(),
            (now + lock_time.as_millis() as u64).into_attr(),
        );

        let mut names = HashMap::new();
        names.insert("#k".to_string(), PARTITION_KEY.to_string());
        names.insert("#o".to_string(), "lock_owner".to_string());
        names.insert("#e".to_string(), "expires_at".to_string());
        let mut values = HashMap::new();
        values.insert(":now".to_string(), now.into_attr());
        values.insert(":host".to_string(), host.to_string().into_attr());

        self.put_if(
            item,
            "attribute_not_exists(#k) OR #e < :now OR #o = :host",
            names,
            values,
        )
        .await
    }

    async fn release_initialization_lock(&self, host: &str) -> Result<bool, LeaseStoreError> {
        let mut names = HashMap::new();
        names.insert("#o".to_string(), "lock_owner".to_string());
        let mut values = HashMap::new();
        values.insert(":host".to_string(), host.to_string().into_attr());

        let input = DeleteItemInput {
            table_name: self.table_name.clone(),
            key: Self::key(LOCK_KEY),
            condition_expression: Some("#o = :host".to_string()),
            expression_attribute_names: Some(names),
            expression_attribute_values: Some(values),
            ..Default::default()
        };
        match self.client.delete_item(input).await {
            Ok(_) => Ok(true),
            Err(RusotoError::Service(DeleteItemError::ConditionalCheckFailed(_))) => {
                warn!(host, "Initialization lock was not held by this host");
                Ok(false)
            }
            Err(err) => Err(backend(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_item_round_trips_through_attributes() {
        let mut lease = Lease::new("shardId-000000000001");
        lease.owner = Some("host-a".to_string());
        lease.continuation_token = Some("shardId-000000000001:49590".to_string());
        lease.timestamp = 1_700_000_000_000;
        lease.properties.insert("group".to_string(), "g1".to_string());
        lease.parent_tokens.insert("shardId-000000000000".to_string());

        let attrs: Attributes = LeaseItem::from_lease(&lease, 7).into();
        let decoded = decode(attrs).unwrap();

        assert_eq!(decoded.concurrency_token.as_deref(), Some("7"));
        assert_eq!(decoded.owner, lease.owner);
        assert_eq!(decoded.continuation_token, lease.continuation_token);
        assert_eq!(decoded.parent_tokens, lease.parent_tokens);
        assert_eq!(decoded.properties, lease.properties);
        assert_eq!(decoded.version, LEASE_SCHEMA_VERSION);
    }

    #[test]
    fn reserved_items_are_recognized() {
        assert!(is_reserved(&DynamoLeaseStore::key(LOCK_KEY)));
        assert!(is_reserved(&DynamoLeaseStore::key(INITIALIZED_KEY)));
        assert!(!is_reserved(&DynamoLeaseStore::key("shardId-000000000000")));
    }
}

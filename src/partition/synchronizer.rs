use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tracing::{info, warn};

use super::enumerator::PartitionEnumerator;
use crate::{
    error::SynchronizerError,
    lease::{manager::LeaseStoreManager, Lease},
    source::PartitionDescriptor,
};

/// Keeps the lease set in step with the data source's partition layout.
pub(crate) struct PartitionSynchronizer {
    enumerator: Arc<PartitionEnumerator>,
    lease_manager: Arc<LeaseStoreManager>,
}

impl PartitionSynchronizer {
    pub(crate) fn new(
        enumerator: Arc<PartitionEnumerator>,
        lease_manager: Arc<LeaseStoreManager>,
    ) -> Self {
        Self {
            enumerator,
            lease_manager,
        }
    }

    /// Creates an unowned, progress-free lease for every partition not yet
    /// covered. A partition is covered by its own lease, or by an ancestor
    /// that still has a lease or is still listed: split handling on that
    /// ancestor mints it later. Returns the number of leases created.
    pub(crate) async fn create_missing_leases(&self) -> Result<usize, SynchronizerError> {
        let partitions = self.enumerator.refresh().await?;
        let existing: HashSet<String> = self
            .lease_manager
            .list_all_leases()
            .await?
            .into_iter()
            .map(|lease| lease.lease_token)
            .collect();
        let listed: HashSet<&str> = partitions.iter().map(|p| p.id.as_str()).collect();

        let mut created = 0;
        for partition in &partitions {
            if existing.contains(&partition.id) {
                continue;
            }
            let ancestor_covered = partition
                .parent_ids
                .iter()
                .any(|parent| existing.contains(parent) || listed.contains(parent.as_str()));
            if ancestor_covered {
                continue;
            }

            let parents: BTreeSet<String> = partition.parent_ids.iter().cloned().collect();
            if self
                .lease_manager
                .create_lease_if_not_exist(&partition.id, None, HashMap::new(), parents)
                .await?
                .is_some()
            {
                created += 1;
            }
        }

        info!(
            partitions = partitions.len(),
            created, "Synchronized leases with partitions"
        );
        Ok(created)
    }

    /// Mints leases for the children of a split or merged partition, seeded
    /// with the parent's continuation and properties.
    ///
    /// Either every child lease exists when this returns `Ok`, or an error is
    /// returned and the parent must be kept. Children that already exist (a
    /// retried split, or the other parent of a merge) are read back as is.
    pub(crate) async fn split_partition(&self, lease: &Lease) -> Result<Vec<Lease>, SynchronizerError> {
        let children_of = |partitions: Vec<PartitionDescriptor>| -> Vec<PartitionDescriptor> {
            partitions
                .into_iter()
                .filter(|partition| partition.parent_ids.contains(&lease.lease_token))
                .collect()
        };
        // A cached listing taken before the split cannot show the children.
        let mut children = children_of(self.enumerator.list_partitions().await?);
        if children.is_empty() {
            children = children_of(self.enumerator.refresh().await?);
        }
        if children.is_empty() {
            warn!(lease_token = %lease.lease_token, "Partition is gone but has no visible children yet");
            return Err(SynchronizerError::ChildrenNotFound(lease.lease_token.clone()));
        }

        let mut ancestry = lease.parent_tokens.clone();
        ancestry.insert(lease.lease_token.clone());

        let mut child_leases = Vec::with_capacity(children.len());
        for child in children {
            let created = self
                .lease_manager
                .create_lease_if_not_exist(
                    &child.id,
                    lease.continuation_token.clone(),
                    lease.properties.clone(),
                    ancestry.clone(),
                )
                .await?;
            let child_lease = match created {
                Some(child_lease) => child_lease,
                None => self
                    .lease_manager
                    .read(&child.id)
                    .await?
                    .ok_or_else(|| SynchronizerError::ChildrenNotFound(lease.lease_token.clone()))?,
            };
            child_leases.push(child_lease);
        }

        info!(
            lease_token = %lease.lease_token,
            children = ?child_leases.iter().map(|l| l.lease_token.as_str()).collect::<Vec<_>>(),
            "Created child leases for split partition"
        );
        Ok(child_leases)
    }
}

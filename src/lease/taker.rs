use std::{collections::HashSet, time::Duration};

use rand::seq::SliceRandom;
use tracing::debug;

use super::Lease;

/// Picks leases so every active host ends up owning roughly the same number.
///
/// Only unowned leases and leases whose last write is older than the
/// expiration interval are candidates; a fresh lease of another host is never
/// taken.
pub(crate) struct EqualPartitionsBalancingStrategy {
    host: String,
    min_scale_count: usize,
    max_scale_count: usize,
    expiration: Duration,
}

impl EqualPartitionsBalancingStrategy {
    pub(crate) fn new(
        host: impl Into<String>,
        min_scale_count: usize,
        max_scale_count: usize,
        expiration: Duration,
    ) -> Self {
        Self {
            host: host.into(),
            min_scale_count,
            max_scale_count,
            expiration,
        }
    }

    pub(crate) fn select_leases_to_take(&self, all_leases: &[Lease], now_millis: u64) -> Vec<Lease> {
        let mut owned_by_me = 0;
        let mut unowned = Vec::new();
        let mut stealable = Vec::new();
        let mut active_hosts = HashSet::new();
        active_hosts.insert(self.host.as_str());

        for lease in all_leases {
            match lease.owner.as_deref() {
                None => unowned.push(lease.clone()),
                Some(_) if lease.is_expired(now_millis, self.expiration) => {
                    stealable.push(lease.clone())
                }
                Some(owner) => {
                    active_hosts.insert(owner);
                    if owner == self.host {
                        owned_by_me += 1;
                    }
                }
            }
        }

        let target = self.target_lease_count(all_leases.len(), active_hosts.len());
        let needed = target.saturating_sub(owned_by_me);
        debug!(
            host = %self.host,
            total = all_leases.len(),
            active_hosts = active_hosts.len(),
            target,
            owned = owned_by_me,
            unowned = unowned.len(),
            stealable = stealable.len(),
            "Computed lease balance"
        );
        if needed == 0 {
            return Vec::new();
        }

        let mut rng = rand::thread_rng();
        unowned.shuffle(&mut rng);
        stealable.shuffle(&mut rng);
        unowned.into_iter().chain(stealable).take(needed).collect()
    }

    fn target_lease_count(&self, total: usize, hosts: usize) -> usize {
        let mut target = (total + hosts - 1) / hosts;
        if self.max_scale_count > 0 && target > self.max_scale_count {
            target = self.max_scale_count;
        }
        if self.min_scale_count > 0 && target < self.min_scale_count {
            target = self.min_scale_count;
        }
        target
    }
}

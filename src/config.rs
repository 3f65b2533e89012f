//! Processor configuration.

use std::time::Duration;

use crate::error::ChangeFeedError;

/// Where a partition without a continuation starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// Oldest retained change.
    Beginning,
    /// Only changes written after the first read.
    Now,
}

/// What the bootstrapper does when it finds leases written with another
/// schema version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaValidation {
    /// Fail `start()` with a fatal configuration error.
    Strict,
    /// Log a warning and carry on.
    Lenient,
}

/// Tunables for one change feed processor host.
#[derive(Debug, Clone)]
pub struct ChangeFeedConfig {
    /// How often an owned lease is renewed.
    pub lease_renew_interval: Duration,
    /// How often the load balancer looks for leases to take.
    pub lease_acquire_interval: Duration,
    /// Age after which another host's lease may be stolen.
    pub lease_expiration_interval: Duration,
    /// Wait between reads of a partition that returned nothing.
    pub feed_poll_delay: Duration,
    pub max_items_per_batch: usize,
    pub start_position: StartPosition,
    /// Checkpoint after every successfully dispatched batch. When off, only
    /// `ObserverContext::checkpoint` persists progress.
    pub auto_checkpoint: bool,
    /// Lower bound on the number of leases this host tries to own. 0 = none.
    pub min_scale_count: usize,
    /// Upper bound on the number of leases this host tries to own. 0 = none.
    pub max_scale_count: usize,
    /// How often a supervisor checks its processor and renewer.
    pub supervisor_tick: Duration,
    pub partition_cache_ttl: Duration,
    /// Expiry of the bootstrap lock, so a crashed holder cannot wedge the fleet.
    pub lock_time: Duration,
    /// Wait between bootstrap attempts while another host holds the lock.
    pub bootstrap_sleep_time: Duration,
    pub schema_validation: SchemaValidation,
}

impl Default for ChangeFeedConfig {
    fn default() -> Self {
        Self {
            lease_renew_interval: Duration::from_secs(17),
            lease_acquire_interval: Duration::from_secs(13),
            lease_expiration_interval: Duration::from_secs(60),
            feed_poll_delay: Duration::from_secs(5),
            max_items_per_batch: 100,
            start_position: StartPosition::Beginning,
            auto_checkpoint: true,
            min_scale_count: 0,
            max_scale_count: 0,
            supervisor_tick: Duration::from_secs(1),
            partition_cache_ttl: Duration::from_secs(30),
            lock_time: Duration::from_secs(30),
            bootstrap_sleep_time: Duration::from_secs(15),
            schema_validation: SchemaValidation::Strict,
        }
    }
}

impl ChangeFeedConfig {
    pub fn with_lease_renew_interval(mut self, interval: Duration) -> Self {
        self.lease_renew_interval = interval;
        self
    }

    pub fn with_lease_acquire_interval(mut self, interval: Duration) -> Self {
        self.lease_acquire_interval = interval;
        self
    }

    pub fn with_lease_expiration_interval(mut self, interval: Duration) -> Self {
        self.lease_expiration_interval = interval;
        self
    }

    pub fn with_feed_poll_delay(mut self, delay: Duration) -> Self {
        self.feed_poll_delay = delay;
        self
    }

    pub fn with_max_items_per_batch(mut self, max_items: usize) -> Self {
        self.max_items_per_batch = max_items;
        self
    }

    pub fn with_start_position(mut self, position: StartPosition) -> Self {
        self.start_position = position;
        self
    }

    pub fn with_auto_checkpoint(mut self, enabled: bool) -> Self {
        self.auto_checkpoint = enabled;
        self
    }

    pub fn with_scale_bounds(mut self, min: usize, max: usize) -> Self {
        self.min_scale_count = min;
        self.max_scale_count = max;
        self
    }

    pub fn with_supervisor_tick(mut self, tick: Duration) -> Self {
        self.supervisor_tick = tick;
        self
    }

    pub fn with_partition_cache_ttl(mut self, ttl: Duration) -> Self {
        self.partition_cache_ttl = ttl;
        self
    }

    pub fn with_bootstrap_timing(mut self, lock_time: Duration, sleep_time: Duration) -> Self {
        self.lock_time = lock_time;
        self.bootstrap_sleep_time = sleep_time;
        self
    }

    pub fn with_schema_validation(mut self, validation: SchemaValidation) -> Self {
        self.schema_validation = validation;
        self
    }

    /// Renewal silence after which a supervisor gives up on its processor.
    pub(crate) fn stale_processor_threshold(&self) -> Duration {
        self.lease_renew_interval * 25
    }

    pub fn validate(&self) -> Result<(), ChangeFeedError> {
        let non_zero = [
            ("lease_renew_interval", self.lease_renew_interval),
            ("lease_acquire_interval", self.lease_acquire_interval),
            ("lease_expiration_interval", self.lease_expiration_interval),
            ("supervisor_tick", self.supervisor_tick),
            ("lock_time", self.lock_time),
        ];
        for (name, value) in non_zero.iter() {
            if value.is_zero() {
                return Err(ChangeFeedError::FatalConfig(format!("{} must be non-zero", name)));
            }
        }
        if self.lease_renew_interval >= self.lease_expiration_interval {
            return Err(ChangeFeedError::FatalConfig(format!(
                "lease_renew_interval ({:?}) must be shorter than lease_expiration_interval ({:?})",
                self.lease_renew_interval, self.lease_expiration_interval
            )));
        }
        if self.max_items_per_batch == 0 {
            return Err(ChangeFeedError::FatalConfig(
                "max_items_per_batch must be at least 1".to_string(),
            ));
        }
        if self.max_scale_count > 0 && self.min_scale_count > self.max_scale_count {
            return Err(ChangeFeedError::FatalConfig(format!(
                "min_scale_count ({}) exceeds max_scale_count ({})",
                self.min_scale_count, self.max_scale_count
            )));
        }
        Ok(())
    }
}

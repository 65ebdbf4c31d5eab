use std::num::NonZeroUsize;
use std::time::Duration;

const DEFAULT_SHARDS: usize = 128;
const DEFAULT_CAPACITY_HINT_PER_SHARD: usize = 1024;

/// What to do when a new key arrives and the registry already tracks
/// [`LimiterOptions::max_keys`] keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Drop the least recently used key to make room.
    #[default]
    EvictLeastRecent,
    /// Refuse the call with [`LimitError::CapacityExceeded`](crate::LimitError::CapacityExceeded).
    Reject,
}

/// How an existing bucket reacts to a call that passes different
/// parameters from the ones it was created with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReconfigurePolicy {
    /// Adopt the new capacity and refill rate immediately, scaling the
    /// current token count to the new capacity.
    #[default]
    Rescale,
    /// Keep whatever the first call for the key asked for.
    Sticky,
}

/// Configuration for a [`KeyedLimiter`](crate::KeyedLimiter).
#[derive(Clone, Debug)]
pub struct LimiterOptions {
    /// Number of independently locked shards in the registry.
    ///
    /// Rounded up to a power of two, with a minimum of 2.
    pub shards: usize,
    /// Pre-allocated key slots per shard.
    pub capacity_hint_per_shard: usize,
    /// Upper bound on tracked keys. `None` means unbounded.
    ///
    /// The bound is soft: racing first-time callers may overshoot it by a
    /// few entries.
    pub max_keys: Option<NonZeroUsize>,
    /// Behaviour once `max_keys` is reached.
    pub overflow: OverflowPolicy,
    /// Behaviour when an existing key is called with new parameters.
    pub reconfigure: ReconfigurePolicy,
}

impl Default for LimiterOptions {
    fn default() -> Self {
        Self {
            shards: DEFAULT_SHARDS,
            capacity_hint_per_shard: DEFAULT_CAPACITY_HINT_PER_SHARD,
            max_keys: None,
            overflow: OverflowPolicy::default(),
            reconfigure: ReconfigurePolicy::default(),
        }
    }
}

impl LimiterOptions {
    /// Set the shard count.
    pub fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }

    /// Set the number of key slots reserved up front in each shard.
    pub fn with_capacity_hint_per_shard(mut self, hint: usize) -> Self {
        self.capacity_hint_per_shard = hint;
        self
    }

    /// Bound the number of tracked keys.
    pub fn with_max_keys(mut self, max_keys: NonZeroUsize) -> Self {
        self.max_keys = Some(max_keys);
        self
    }

    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    pub fn with_reconfigure(mut self, reconfigure: ReconfigurePolicy) -> Self {
        self.reconfigure = reconfigure;
        self
    }

    /// The shard count actually used: a power of two, at least 2.
    pub(crate) fn shard_amount(&self) -> usize {
        self.shards.max(2).next_power_of_two()
    }

    pub(crate) fn initial_capacity(&self) -> usize {
        self.capacity_hint_per_shard.saturating_mul(self.shard_amount())
    }
}

/// Cadence and threshold for the idle sweeper.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SweepOptions {
    /// Time between sweeps.
    pub interval: Duration,
    /// Keys untouched for longer than this are removed.
    pub idle_timeout: Duration,
}

impl Default for SweepOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(5 * 60),
        }
    }
}

impl SweepOptions {
    pub fn new(interval: Duration, idle_timeout: Duration) -> Self {
        Self {
            interval,
            idle_timeout,
        }
    }
}

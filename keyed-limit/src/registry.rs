use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use parking_lot::Mutex;
use parking_lot::MutexGuard;

use crate::Limit;
use crate::LimitError;
use crate::LimiterOptions;
use crate::OverflowPolicy;
use crate::TokenBucket;
use crate::metrics::EvictionReason;
use crate::metrics::LimiterMetrics;

/// A bucket plus the bookkeeping the registry needs to evict it.
///
/// `last_access_ns` is only ever read by eviction; the bucket's own refill
/// clock is untouched by it.
#[derive(Debug)]
pub(crate) struct BucketEntry {
    bucket: Mutex<TokenBucket>,
    last_access_ns: AtomicU64,
}

impl BucketEntry {
    fn new(limit: Limit, now_ns: u64) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(limit, now_ns)),
            last_access_ns: AtomicU64::new(now_ns),
        }
    }

    /// Exclusive access to the bucket. Same-key callers serialise here.
    #[inline]
    pub(crate) fn lock(&self) -> MutexGuard<'_, TokenBucket> {
        self.bucket.lock()
    }

    #[inline]
    fn touch(&self, now_ns: u64) {
        self.last_access_ns.fetch_max(now_ns, Ordering::Relaxed);
    }

    pub(crate) fn last_access_ns(&self) -> u64 {
        self.last_access_ns.load(Ordering::Relaxed)
    }

    fn is_idle(&self, now_ns: u64, idle_ns: u64) -> bool {
        now_ns.saturating_sub(self.last_access_ns()) > idle_ns
    }
}

/// Concurrent `key -> bucket` map.
///
/// The map is a sharded [`DashMap`]; the shard lock is only held long enough
/// to find, insert or remove an `Arc<BucketEntry>`. Token math happens under
/// the entry's own mutex after the shard lock has been released, so a hot key
/// never blocks unrelated keys in the same shard.
#[derive(Debug)]
pub(crate) struct Registry {
    entries: DashMap<String, Arc<BucketEntry>>,
    max_keys: Option<NonZeroUsize>,
    overflow: OverflowPolicy,
    metrics: LimiterMetrics,
}

impl Registry {
    pub(crate) fn new(options: &LimiterOptions, metrics: LimiterMetrics) -> Self {
        Self {
            entries: DashMap::with_capacity_and_shard_amount(
                options.initial_capacity(),
                options.shard_amount(),
            ),
            max_keys: options.max_keys,
            overflow: options.overflow,
            metrics,
        }
    }

    /// Find the entry for `key`, creating a full bucket for `limit` if there
    /// is none. At most one bucket is ever created per key, however many
    /// callers race on first use.
    pub(crate) fn get_or_create(
        &self,
        key: &str,
        limit: Limit,
        now_ns: u64,
    ) -> Result<Arc<BucketEntry>, LimitError> {
        // Fast path: shared shard lock only
        let existing = self.entries.get(key).map(|entry| Arc::clone(entry.value()));
        if let Some(entry) = existing {
            entry.touch(now_ns);
            return Ok(entry);
        }

        self.make_room(key)?;

        let entry = Arc::clone(
            self.entries
                .entry(key.to_owned())
                .or_insert_with(|| {
                    tracing::trace!(
                        key,
                        capacity = limit.capacity().get(),
                        refill_per_sec = limit.refill_per_sec(),
                        "creating bucket"
                    );
                    self.metrics.bucket_created();
                    Arc::new(BucketEntry::new(limit, now_ns))
                })
                .value(),
        );
        entry.touch(now_ns);
        Ok(entry)
    }

    /// Remove every entry not touched within `idle_ns` of `now_ns`.
    ///
    /// Returns the number of entries removed.
    pub(crate) fn evict_idle(&self, now_ns: u64, idle_ns: u64) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let idle = entry.is_idle(now_ns, idle_ns);
            if idle {
                removed += 1;
            }
            !idle
        });
        self.metrics.evicted(EvictionReason::Idle, removed);
        removed
    }

    pub(crate) fn clear(&self) {
        let count = self.entries.len();
        self.entries.clear();
        self.metrics.evicted(EvictionReason::Cleared, count);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// A copy of the bucket for `key`, without touching it.
    pub(crate) fn snapshot(&self, key: &str) -> Option<TokenBucket> {
        let entry = self.entries.get(key).map(|entry| Arc::clone(entry.value()))?;
        let bucket = entry.lock().clone();
        Some(bucket)
    }

    fn make_room(&self, key: &str) -> Result<(), LimitError> {
        let Some(max_keys) = self.max_keys else {
            return Ok(());
        };

        if self.entries.len() < max_keys.get() {
            return Ok(());
        }

        // Another caller may have inserted `key` since the fast path missed
        if self.entries.contains_key(key) {
            return Ok(());
        }

        match self.overflow {
            OverflowPolicy::Reject => {
                tracing::warn!(max_keys = max_keys.get(), "key limit reached; rejecting new key");
                Err(LimitError::CapacityExceeded {
                    max_keys: max_keys.get(),
                })
            }
            OverflowPolicy::EvictLeastRecent => {
                self.evict_least_recent();
                Ok(())
            }
        }
    }

    /// Drop the entry with the oldest `last_access_ns`.
    ///
    /// The scan is O(keys) and only runs on the insert path once the key
    /// limit has been reached. If the chosen entry is touched between the
    /// scan and the removal it is left alone.
    fn evict_least_recent(&self) -> bool {
        let mut oldest: Option<(u64, String)> = None;
        for entry in self.entries.iter() {
            let at = entry.value().last_access_ns();
            if oldest.as_ref().is_none_or(|(min, _)| at < *min) {
                oldest = Some((at, entry.key().clone()));
            }
        }

        let Some((at, key)) = oldest else {
            return false;
        };

        let removed = self
            .entries
            .remove_if(&key, |_, entry| entry.last_access_ns() == at)
            .is_some();
        if removed {
            tracing::debug!(key = %key, last_access_ns = at, "evicted least recently used key");
            self.metrics.evicted(EvictionReason::Lru, 1);
        }
        removed
    }
}

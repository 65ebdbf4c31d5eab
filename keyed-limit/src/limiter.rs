use std::time::Duration;

use quanta::Clock;

use crate::Decision;
use crate::InvalidArgument;
use crate::KeyedStrategy;
use crate::Limit;
use crate::LimitError;
use crate::LimiterOptions;
use crate::ReconfigurePolicy;
use crate::TokenBucket;
use crate::clock::MonotonicClock;
use crate::metrics::LimiterMetrics;
use crate::registry::Registry;

/// Per-key token bucket rate limiter.
///
/// Each limiter owns its own registry; there is no process-wide state, so
/// any number of independent limiters can coexist. Dropping the limiter drops
/// every bucket it holds.
///
/// `KeyedLimiter` is `Send + Sync`. Share it behind an `Arc` (which is also
/// what [`spawn_sweeper`](KeyedLimiter::spawn_sweeper) expects).
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
///
/// use keyed_limit::KeyedLimiter;
/// use keyed_limit::LimiterOptions;
/// use quanta::Clock;
///
/// let (clock, mock) = Clock::mock();
/// let limiter = KeyedLimiter::with_clock(LimiterOptions::default(), clock);
///
/// assert!(limiter.allow("ip:10.0.0.1", 1, 1.0)?.allowed);
/// assert!(!limiter.allow("ip:10.0.0.1", 1, 1.0)?.allowed);
///
/// mock.increment(Duration::from_secs(1));
/// assert!(limiter.allow("ip:10.0.0.1", 1, 1.0)?.allowed);
/// # Ok::<(), keyed_limit::LimitError>(())
/// ```
#[derive(Debug)]
pub struct KeyedLimiter {
    registry: Registry,
    clock: MonotonicClock,
    reconfigure: ReconfigurePolicy,
    metrics: LimiterMetrics,
}

impl Default for KeyedLimiter {
    fn default() -> Self {
        Self::new(LimiterOptions::default())
    }
}

impl KeyedLimiter {
    /// Create a limiter driven by the system's monotonic clock.
    pub fn new(options: LimiterOptions) -> Self {
        Self::with_clock(options, Clock::new())
    }

    /// Create a limiter driven by `clock`.
    ///
    /// Use [`Clock::mock`] for deterministic tests.
    pub fn with_clock(options: LimiterOptions, clock: Clock) -> Self {
        let metrics = LimiterMetrics::new();
        Self {
            registry: Registry::new(&options, metrics.clone()),
            clock: MonotonicClock::new(clock),
            reconfigure: options.reconfigure,
            metrics,
        }
    }

    /// Decide whether one request for `key` is admitted.
    ///
    /// `capacity` is the bucket size (and burst size); `refill_per_sec` is
    /// the steady-state replenishment rate, which may be fractional or zero.
    ///
    /// # Errors
    ///
    /// - [`LimitError::InvalidArgument`] for an empty key, a zero capacity or
    ///   a negative / non-finite refill rate. Nothing is registered.
    /// - [`LimitError::CapacityExceeded`] if the key is new, the registry is
    ///   at its key limit and the overflow policy is `Reject`.
    pub fn allow(
        &self,
        key: &str,
        capacity: u64,
        refill_per_sec: f64,
    ) -> Result<Decision, LimitError> {
        let limit = Limit::new(capacity, refill_per_sec)?;
        self.allow_limit(key, &limit)
    }

    /// Same as [`allow`](KeyedLimiter::allow), with pre-validated parameters.
    pub fn allow_limit(&self, key: &str, limit: &Limit) -> Result<Decision, LimitError> {
        if key.is_empty() {
            return Err(InvalidArgument::EmptyKey.into());
        }

        let now = self.clock.now_ns();
        let entry = self.registry.get_or_create(key, *limit, now)?;

        let decision = {
            let mut bucket = entry.lock();
            if self.reconfigure == ReconfigurePolicy::Rescale && bucket.limit() != *limit {
                bucket.adopt(*limit, now);
            }
            bucket.consume(now)
        };

        self.metrics.decision(decision.allowed);
        Ok(decision)
    }

    /// Remove every key not seen for longer than `idle`.
    ///
    /// Returns the number of keys removed. A removed key that is used again
    /// starts over with a full bucket.
    pub fn evict_idle(&self, idle: Duration) -> usize {
        let idle_ns = u64::try_from(idle.as_nanos()).unwrap_or(u64::MAX);
        let removed = self.registry.evict_idle(self.clock.now_ns(), idle_ns);
        tracing::debug!(removed, remaining = self.registry.len(), "idle sweep complete");
        removed
    }

    /// Forget every key.
    pub fn clear(&self) {
        self.registry.clear();
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.registry.contains_key(key)
    }

    /// A copy of the bucket currently held for `key`.
    ///
    /// Reading a snapshot neither refills the bucket nor counts as an access
    /// for eviction purposes.
    pub fn snapshot(&self, key: &str) -> Option<TokenBucket> {
        self.registry.snapshot(key)
    }
}

impl KeyedStrategy for KeyedLimiter {
    fn check(&self, key: &str, limit: &Limit) -> Result<Decision, LimitError> {
        self.allow_limit(key, limit)
    }

    fn clear(&self) {
        KeyedLimiter::clear(self)
    }

    fn len(&self) -> usize {
        KeyedLimiter::len(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mocked() -> (KeyedLimiter, std::sync::Arc<quanta::Mock>) {
        let (clock, mock) = Clock::mock();
        (KeyedLimiter::with_clock(LimiterOptions::default(), clock), mock)
    }

    #[test]
    fn it_rejects_invalid_arguments_without_registering() {
        let (rl, _mock) = mocked();

        let err = rl.allow("", 5, 1.0).unwrap_err();
        assert!(matches!(
            err,
            LimitError::InvalidArgument(InvalidArgument::EmptyKey)
        ));

        let err = rl.allow("k", 0, 1.0).unwrap_err();
        assert!(matches!(
            err,
            LimitError::InvalidArgument(InvalidArgument::ZeroCapacity)
        ));

        for rate in [-1.0, f64::NAN, f64::INFINITY] {
            let err = rl.allow("k", 5, rate).unwrap_err();
            assert!(err.is_invalid_argument());
        }

        assert!(rl.is_empty());
        assert!(!rl.contains_key("k"));
    }

    #[test]
    fn it_rescales_on_new_parameters_by_default() {
        let (rl, _mock) = mocked();
        for _ in 0..5 {
            let _ = rl.allow("k", 10, 0.0).unwrap();
        }

        // Half full at capacity 10 becomes half full at capacity 20
        let decision = rl.allow("k", 20, 0.0).unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 9);
        assert_eq!(rl.snapshot("k").unwrap().capacity(), 20);
    }

    #[test]
    fn sticky_policy_keeps_first_parameters() {
        let (clock, _mock) = Clock::mock();
        let rl = KeyedLimiter::with_clock(
            LimiterOptions::default().with_reconfigure(ReconfigurePolicy::Sticky),
            clock,
        );

        assert_eq!(rl.allow("k", 2, 0.0).unwrap().remaining, 1);
        // A bigger capacity is ignored
        assert_eq!(rl.allow("k", 100, 0.0).unwrap().remaining, 0);
        assert!(!rl.allow("k", 100, 0.0).unwrap().allowed);
        assert_eq!(rl.snapshot("k").unwrap().capacity(), 2);
    }

    #[test]
    fn it_evicts_idle_keys_by_clock() {
        let (rl, mock) = mocked();
        let _ = rl.allow("a", 1, 1.0).unwrap();

        mock.increment(Duration::from_secs(30));
        let _ = rl.allow("b", 1, 1.0).unwrap();

        mock.increment(Duration::from_secs(40));
        assert_eq!(rl.evict_idle(Duration::from_secs(60)), 1);
        assert!(!rl.contains_key("a"));
        assert!(rl.contains_key("b"));
    }

    #[test]
    fn snapshot_does_not_refill() {
        let (rl, mock) = mocked();
        let _ = rl.allow("k", 2, 1.0).unwrap();

        mock.increment(Duration::from_secs(5));
        let bucket = rl.snapshot("k").unwrap();
        assert_eq!(bucket.tokens(), 1.0);
        assert!(rl.snapshot("missing").is_none());
    }

    #[test]
    fn it_works_through_the_strategy_trait() {
        let (rl, _mock) = mocked();
        let strategy: &dyn KeyedStrategy = &rl;
        let limit = Limit::new(1, 0.0).unwrap();

        assert!(strategy.check("k", &limit).unwrap().allowed);
        assert!(!strategy.check("k", &limit).unwrap().allowed);
        assert_eq!(strategy.len(), 1);

        strategy.clear();
        assert!(strategy.is_empty());
        assert!(strategy.check("k", &limit).unwrap().allowed);
    }
}

//! # keyed-limit
//!
//! `keyed-limit` is an in-process, per-key token bucket rate limiter.
//!
//! ## Core Philosophy
//!
//! Every key (a user id, an IP, an API token...) gets its own bucket, created
//! lazily at full capacity on first use. Buckets for different keys never
//! share a lock while their tokens are being computed, so one hot key cannot
//! slow down the rest. Calls for the same key are serialised on that key's
//! bucket, which makes each key's sequence of decisions linearizable.
//!
//! ## Key Concepts
//!
//! * **Lazy Evaluation**: Tokens are recalculated from elapsed time at the
//!   moment of the request. No timers run per key.
//! * **Sharded Registry**: Keys live in a sharded concurrent map; the shard
//!   lock is dropped before any bucket is touched.
//! * **Bounded Memory**: Idle keys can be swept away on demand or by a
//!   background [`Sweeper`], and the registry can be capped with an LRU or
//!   reject policy.
//! * **Injectable Time**: Build a limiter with a mocked [`quanta::Clock`] to
//!   drive time by hand.
//!
//! ## Example
//!
//! ```rust
//! use keyed_limit::KeyedLimiter;
//!
//! let limiter = KeyedLimiter::default();
//!
//! // 10 request burst, refilled at 5 per second
//! let decision = limiter.allow("user_123", 10, 5.0)?;
//! assert!(decision.allowed);
//! assert_eq!(decision.remaining, 9);
//! # Ok::<(), keyed_limit::LimitError>(())
//! ```

use std::num::NonZeroU64;
use std::time::Duration;

mod clock;
mod error;
mod limiter;
mod metrics;
mod options;
mod registry;
mod sweeper;
mod token_bucket;


pub use error::InvalidArgument;
pub use error::LimitError;
pub use limiter::KeyedLimiter;
pub use options::LimiterOptions;
pub use options::OverflowPolicy;
pub use options::ReconfigurePolicy;
pub use options::SweepOptions;
pub use sweeper::Sweeper;
#[cfg(any(feature = "tokio", test))]
pub use sweeper::SweeperTask;
pub use token_bucket::TokenBucket;

/// The outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request is admitted.
    pub allowed: bool,
    /// Whole tokens left after this decision.
    pub remaining: u64,
    /// Milliseconds until the bucket is full again (when allowed) or until
    /// the next token is available (when denied).
    ///
    /// `u64::MAX` when the bucket never refills.
    pub reset_ms: u64,
}

impl Decision {
    /// How long a denied caller should wait before trying again.
    ///
    /// `None` for admitted requests, and for buckets that never refill.
    pub fn retry_after(&self) -> Option<Duration> {
        if self.allowed || self.reset_ms == u64::MAX {
            None
        } else {
            Some(Duration::from_millis(self.reset_ms))
        }
    }
}

/// Validated bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limit {
    capacity: NonZeroU64,
    refill_per_sec: f64,
}

impl Limit {
    /// Build a limit of `capacity` tokens refilled at `refill_per_sec`.
    ///
    /// # Errors
    ///
    /// Fails if `capacity` is zero or `refill_per_sec` is negative, NaN or
    /// infinite. A refill rate of zero is allowed and means "never refill".
    pub fn new(capacity: u64, refill_per_sec: f64) -> Result<Self, InvalidArgument> {
        let capacity = NonZeroU64::new(capacity).ok_or(InvalidArgument::ZeroCapacity)?;
        if !refill_per_sec.is_finite() || refill_per_sec < 0.0 {
            return Err(InvalidArgument::RefillRate(refill_per_sec));
        }
        Ok(Self {
            capacity,
            refill_per_sec,
        })
    }

    pub fn capacity(&self) -> NonZeroU64 {
        self.capacity
    }

    pub fn refill_per_sec(&self) -> f64 {
        self.refill_per_sec
    }
}

/// A keyed admission strategy.
///
/// Implementors must be safe to share across threads.
pub trait KeyedStrategy: Send + Sync {
    /// Decide whether one request for `key` is admitted under `limit`.
    ///
    /// # Errors
    ///
    /// Returns a [`LimitError`] if the key is unusable or the strategy cannot
    /// track another key.
    fn check(&self, key: &str, limit: &Limit) -> Result<Decision, LimitError>;

    /// Forget every key.
    fn clear(&self);

    /// Number of keys currently tracked.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Reasons an `allow` call can be refused before any state is touched.
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum InvalidArgument {
    /// The key was the empty string.
    #[error("key must not be empty")]
    EmptyKey,

    /// The requested bucket capacity was zero.
    #[error("capacity must be greater than 0")]
    ZeroCapacity,

    /// The refill rate was negative, NaN or infinite.
    #[error("refill rate must be a finite, non-negative number; got {0}")]
    RefillRate(f64),
}

/// Errors produced by the keyed limiter.
#[derive(Debug, thiserror::Error)]
pub enum LimitError {
    /// The call's arguments were rejected. No bucket was created or mutated.
    #[error("invalid argument: {0}")]
    InvalidArgument(#[from] InvalidArgument),

    /// The registry is at its configured key limit and the overflow policy
    /// is [`OverflowPolicy::Reject`](crate::OverflowPolicy::Reject).
    #[error("registry is full; {max_keys} keys already tracked")]
    CapacityExceeded {
        /// The configured maximum number of keys.
        max_keys: usize,
    },

    /// The background sweeper thread could not be started.
    #[error("failed to spawn sweeper thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl LimitError {
    /// Returns `true` if this is an [`LimitError::InvalidArgument`].
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument(_))
    }
}

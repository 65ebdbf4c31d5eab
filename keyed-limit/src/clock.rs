use quanta::Clock;
use quanta::Instant;

/// Monotonic nanosecond time source.
///
/// Wraps a [`quanta::Clock`] together with a fixed anchor so that every
/// timestamp handed to a bucket is a plain `u64` of nanoseconds since the
/// limiter was built. Pass a mocked clock (see [`Clock::mock`]) to drive time
/// by hand in tests.
#[derive(Debug, Clone)]
pub(crate) struct MonotonicClock {
    clock: Clock,
    /// A fixed point in time to calculate deltas from.
    anchor: Instant,
}

impl MonotonicClock {
    pub(crate) fn new(clock: Clock) -> Self {
        let anchor = clock.now();
        Self { clock, anchor }
    }

    /// Nanoseconds elapsed since the anchor.
    ///
    /// A reading earlier than the anchor saturates to zero.
    #[inline]
    pub(crate) fn now_ns(&self) -> u64 {
        let elapsed = self.clock.now().saturating_duration_since(self.anchor);
        u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX)
    }
}

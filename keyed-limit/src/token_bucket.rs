use crate::Decision;
use crate::Limit;

/// Fixed-point scale: one token is this many nano-tokens.
///
/// With nanosecond timestamps, `elapsed_ns * rate` is then exactly the number
/// of nano-tokens accrued, so whole-number rates refill without rounding.
const NANOS_PER_TOKEN: u128 = 1_000_000_000;
const NANOS_PER_MILLI: u128 = 1_000_000;

/// A single lazily refilled token bucket.
///
/// Tokens are held as integer nano-tokens so that sub-second refill rates
/// accumulate between calls without drift, and very large capacities still
/// drain one token at a time. Nothing happens in the background: tokens are
/// recalculated from the elapsed time at the moment of each
/// [`consume`](TokenBucket::consume).
///
/// Timestamps are monotonic nanoseconds supplied by the caller. A timestamp
/// older than the last one seen is treated as "no time has passed".
///
/// A `TokenBucket` is not synchronised. [`KeyedLimiter`](crate::KeyedLimiter)
/// keeps each one behind its own lock; standalone users must do the same if
/// they share it across threads.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    limit: Limit,
    nano_tokens: u128,
    last_refill_ns: u64,
}

/// `rate` as an integer, if it is a whole number of tokens per second.
#[inline]
fn whole_rate(rate: f64) -> Option<u128> {
    (rate.fract() == 0.0 && rate <= u64::MAX as f64).then_some(rate as u128)
}

/// Nano-tokens accrued over `elapsed_ns` at `rate` tokens per second.
fn accrued(elapsed_ns: u64, rate: f64) -> u128 {
    match whole_rate(rate) {
        Some(rate) => u128::from(elapsed_ns).saturating_mul(rate),
        // Float-to-int casts floor and saturate
        None => (elapsed_ns as f64 * rate) as u128,
    }
}

/// Nanoseconds until `deficit` nano-tokens have accrued at `rate` (> 0).
fn wait_ns(deficit: u128, rate: f64) -> u128 {
    match whole_rate(rate) {
        Some(rate) => deficit.div_ceil(rate),
        None => {
            let mut wait = (deficit as f64 / rate).ceil() as u128;
            if wait < u64::MAX as u128 && accrued(wait as u64, rate) < deficit {
                wait += 1;
            }
            wait
        }
    }
}

impl TokenBucket {
    /// Creates a full bucket for `limit`, with its refill clock set to `now_ns`.
    pub fn new(limit: Limit, now_ns: u64) -> Self {
        Self {
            limit,
            nano_tokens: Self::full(limit),
            last_refill_ns: now_ns,
        }
    }

    #[inline]
    fn full(limit: Limit) -> u128 {
        u128::from(limit.capacity().get()) * NANOS_PER_TOKEN
    }

    /// Refills the bucket up to `now_ns` and tries to take one token.
    pub fn consume(&mut self, now_ns: u64) -> Decision {
        self.refill(now_ns);

        let allowed = if self.nano_tokens >= NANOS_PER_TOKEN {
            self.nano_tokens -= NANOS_PER_TOKEN;
            true
        } else {
            false
        };

        Decision {
            allowed,
            remaining: self.remaining(),
            reset_ms: self.reset_ms(allowed),
        }
    }

    /// Brings the bucket up to `now_ns` under its current parameters, then
    /// switches to `limit`.
    ///
    /// When the capacity changes the current token count is scaled by
    /// `new_capacity / old_capacity`, so a half-full bucket stays half full.
    pub fn adopt(&mut self, limit: Limit, now_ns: u64) {
        self.refill(now_ns);

        let old = u128::from(self.capacity());
        let new = u128::from(limit.capacity().get());
        if new != old {
            let scaled = self
                .nano_tokens
                .checked_mul(new)
                .map(|n| n / old)
                .unwrap_or_else(|| (self.nano_tokens as f64 * new as f64 / old as f64) as u128);
            self.nano_tokens = scaled.min(Self::full(limit));
        }
        self.limit = limit;
    }

    /// The parameters this bucket currently enforces.
    pub fn limit(&self) -> Limit {
        self.limit
    }

    pub fn capacity(&self) -> u64 {
        self.limit.capacity().get()
    }

    pub fn refill_per_sec(&self) -> f64 {
        self.limit.refill_per_sec()
    }

    /// The fractional token count as of the last refill.
    pub fn tokens(&self) -> f64 {
        self.nano_tokens as f64 / NANOS_PER_TOKEN as f64
    }

    pub fn last_refill_ns(&self) -> u64 {
        self.last_refill_ns
    }

    /// Whole tokens available as of the last refill.
    pub fn remaining(&self) -> u64 {
        // Never above capacity, so always fits
        u64::try_from(self.nano_tokens / NANOS_PER_TOKEN).unwrap_or(u64::MAX)
    }

    fn refill(&mut self, now_ns: u64) {
        let Some(elapsed_ns) = now_ns.checked_sub(self.last_refill_ns) else {
            tracing::trace!(
                now_ns,
                last_refill_ns = self.last_refill_ns,
                "clock went backwards; treating as no elapsed time"
            );
            return;
        };

        if elapsed_ns == 0 {
            return;
        }

        let rate = self.refill_per_sec();
        if rate > 0.0 {
            self.nano_tokens = self
                .nano_tokens
                .saturating_add(accrued(elapsed_ns, rate))
                .min(Self::full(self.limit));
        }
        self.last_refill_ns = now_ns;
    }

    /// Milliseconds until the bucket is full (after an admission) or holds
    /// one whole token (after a denial).
    ///
    /// Rounded up, so any outstanding deficit reports at least 1ms.
    fn reset_ms(&self, allowed: bool) -> u64 {
        let target = if allowed {
            Self::full(self.limit)
        } else {
            NANOS_PER_TOKEN
        };
        let deficit = target.saturating_sub(self.nano_tokens);
        let rate = self.refill_per_sec();

        if deficit == 0 {
            return 0;
        }
        if rate == 0.0 {
            return u64::MAX;
        }

        let ms = wait_ns(deficit, rate).div_ceil(NANOS_PER_MILLI).max(1);
        u64::try_from(ms).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use more_asserts::assert_ge;
    use more_asserts::assert_le;

    use super::*;

    const SEC: u64 = 1_000_000_000;

    fn bucket(capacity: u64, refill_per_sec: f64) -> TokenBucket {
        TokenBucket::new(Limit::new(capacity, refill_per_sec).unwrap(), 0)
    }

    #[test]
    fn it_starts_full() {
        let mut rl = bucket(5, 10.0);
        assert_eq!(rl.remaining(), 5);

        let decision = rl.consume(0);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
        // 1 missing token at 10/s
        assert_eq!(decision.reset_ms, 100);
    }

    #[test]
    fn it_bursts_then_blocks_without_refill() {
        let mut rl = bucket(5, 0.0);

        for expected in [4, 3, 2, 1, 0] {
            let decision = rl.consume(0);
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected);
            assert_eq!(decision.reset_ms, u64::MAX);
        }

        let decision = rl.consume(0);
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.reset_ms, u64::MAX);

        // Time alone never helps a bucket that doesn't refill
        assert!(!rl.consume(3600 * SEC).allowed);
    }

    #[test]
    fn it_refills_steadily() {
        let mut rl = bucket(1, 1.0);

        let first = rl.consume(0);
        assert!(first.allowed);
        assert_eq!(first.remaining, 0);
        assert_eq!(first.reset_ms, 1000);

        let second = rl.consume(SEC / 2);
        assert!(!second.allowed);
        assert_eq!(second.remaining, 0);
        assert_eq!(second.reset_ms, 500);

        let third = rl.consume(SEC);
        assert!(third.allowed);
        assert_eq!(third.remaining, 0);
    }

    #[test]
    fn it_accumulates_fractional_tokens() {
        // One token every two seconds
        let mut rl = bucket(1, 0.5);
        assert!(rl.consume(0).allowed);

        let denied = rl.consume(SEC);
        assert!(!denied.allowed);
        assert_eq!(denied.reset_ms, 1000);
        assert_eq!(rl.tokens(), 0.5);

        assert!(rl.consume(2 * SEC).allowed);
    }

    #[test]
    fn it_clamps_refill_to_capacity() {
        let mut rl = bucket(1, 10.0);
        assert!(rl.consume(0).allowed);
        assert!(!rl.consume(0).allowed);

        // 0.15s at 10/s is 1.5 tokens, clamped to 1
        let decision = rl.consume(150_000_000);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert!(!rl.consume(150_000_000).allowed);
    }

    #[test]
    fn it_ignores_time_going_backwards() {
        let mut rl = bucket(2, 1.0);
        assert!(rl.consume(10 * SEC).allowed);
        assert!(rl.consume(10 * SEC).allowed);

        let decision = rl.consume(4 * SEC);
        assert!(!decision.allowed);
        assert_eq!(rl.tokens(), 0.0);
        assert_eq!(rl.last_refill_ns(), 10 * SEC);

        // Refill resumes from the last good reading, not the bogus one
        assert!(!rl.consume(10 * SEC + SEC / 2).allowed);
        assert!(rl.consume(11 * SEC).allowed);
    }

    #[test]
    fn it_never_loses_tokens_to_the_passage_of_time() {
        let mut rl = bucket(10, 3.0);
        for _ in 0..10 {
            let _ = rl.consume(0);
        }

        let mut last = rl.tokens();
        for step in 1..=50u64 {
            rl.refill(step * 37_000_000);
            assert_ge!(rl.tokens(), last);
            last = rl.tokens();
        }
    }

    #[test]
    fn it_stays_within_bounds() {
        let mut rl = bucket(7, 2.5);
        let mut now = 0u64;

        // A jittery schedule: bursts, pauses and the odd backwards reading
        for step in 0..1_000u64 {
            now = match step % 11 {
                0 => now + 900_000_000,
                3 => now.saturating_sub(5_000_000),
                7 => now + 13_000_000,
                _ => now,
            };
            let decision = rl.consume(now);
            assert_ge!(rl.tokens(), 0.0);
            assert_le!(rl.tokens(), 7.0);
            assert_le!(decision.remaining, 7);
        }
    }

    #[test]
    fn it_rescales_tokens_when_capacity_changes() {
        let mut rl = bucket(10, 0.0);
        for _ in 0..5 {
            let _ = rl.consume(0);
        }
        assert_eq!(rl.remaining(), 5);

        rl.adopt(Limit::new(20, 0.0).unwrap(), 0);
        assert_eq!(rl.capacity(), 20);
        assert_eq!(rl.remaining(), 10);

        rl.adopt(Limit::new(4, 0.0).unwrap(), 0);
        assert_eq!(rl.capacity(), 4);
        assert_eq!(rl.remaining(), 2);
    }

    #[test]
    fn it_refills_under_old_rate_before_adopting_new_rate() {
        let mut rl = bucket(10, 1.0);
        for _ in 0..10 {
            let _ = rl.consume(0);
        }

        // 2s at the old 1/s, then switch to 4/s
        rl.adopt(Limit::new(10, 4.0).unwrap(), 2 * SEC);
        assert_eq!(rl.tokens(), 2.0);
        assert_eq!(rl.refill_per_sec(), 4.0);

        rl.refill(3 * SEC);
        assert_eq!(rl.tokens(), 6.0);
    }

    #[test]
    fn full_bucket_reports_zero_reset() {
        let mut rl = bucket(3, 1.0);
        let _ = rl.consume(0);
        // Full again after exactly one second
        let decision = rl.consume(SEC);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 2);
        assert_eq!(decision.reset_ms, 1000);

        rl.refill(10 * SEC);
        assert_eq!(rl.reset_ms(true), 0);
    }

    #[test]
    fn it_admits_exactly_when_a_token_has_accrued_in_small_steps() {
        let mut rl = bucket(1, 1.0);
        assert!(rl.consume(0).allowed);

        for step in 1..10u64 {
            let decision = rl.consume(step * 100_000_000);
            assert!(!decision.allowed);
            assert_eq!(decision.reset_ms, 1000 - step * 100);
        }

        assert_eq!(rl.tokens(), 0.9);
        let decision = rl.consume(SEC);
        assert!(decision.allowed, "{decision:?}");
        assert_eq!(rl.tokens(), 0.0);
    }

    #[test]
    fn fractional_rates_do_not_drift_in_small_steps() {
        // 2.5 tokens per second over 4s of 10ms polls
        let mut rl = bucket(10, 2.5);
        for _ in 0..10 {
            let _ = rl.consume(0);
        }

        let mut admitted = 0;
        for step in 1..=400u64 {
            if rl.consume(step * 10_000_000).allowed {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }

    #[test]
    fn denied_decisions_never_report_zero_reset() {
        let mut rl = bucket(1, 3.0);
        assert!(rl.consume(0).allowed);

        // Just short of a whole token
        let decision = rl.consume(333_333_333);
        assert!(!decision.allowed);
        assert_eq!(decision.reset_ms, 1);
        assert_eq!(decision.retry_after(), Some(std::time::Duration::from_millis(1)));

        for ns in [1, 999_999, 1_000_001, 250_000_000] {
            let mut rl = bucket(1, 0.7);
            let _ = rl.consume(0);
            let decision = rl.consume(ns);
            assert!(!decision.allowed);
            assert_ge!(decision.reset_ms, 1);
        }
    }

    #[test]
    fn huge_capacities_still_drain() {
        let mut rl = bucket(u64::MAX, 0.0);

        let decision = rl.consume(0);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, u64::MAX - 1);

        let decision = rl.consume(0);
        assert_eq!(decision.remaining, u64::MAX - 2);
    }
}

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;

/// Why an entry left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EvictionReason {
    Idle,
    Lru,
    Cleared,
}

impl EvictionReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Lru => "lru",
            Self::Cleared => "cleared",
        }
    }
}

/// Counters reported through the global OpenTelemetry meter.
///
/// These are no-ops until the host installs a meter provider.
#[derive(Clone, Debug)]
pub(crate) struct LimiterMetrics {
    decisions: Counter<u64>,
    buckets_created: Counter<u64>,
    evictions: Counter<u64>,
}

impl LimiterMetrics {
    pub(crate) fn new() -> Self {
        let meter = global::meter("keyed_limit");
        Self {
            decisions: meter.u64_counter("keyed_limit.decisions").build(),
            buckets_created: meter.u64_counter("keyed_limit.buckets_created").build(),
            evictions: meter.u64_counter("keyed_limit.evictions").build(),
        }
    }

    #[inline]
    pub(crate) fn decision(&self, allowed: bool) {
        let outcome = if allowed { "allowed" } else { "denied" };
        self.decisions.add(1, &[KeyValue::new("outcome", outcome)]);
    }

    pub(crate) fn bucket_created(&self) {
        self.buckets_created.add(1, &[]);
    }

    pub(crate) fn evicted(&self, reason: EvictionReason, count: usize) {
        if count == 0 {
            return;
        }
        self.evictions.add(count as u64, &[KeyValue::new("reason", reason.as_str())]);
    }
}

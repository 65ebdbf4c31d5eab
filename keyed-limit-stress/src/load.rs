use std::sync::Arc;
use std::sync::Barrier;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use anyhow::anyhow;
use hdrhistogram::Histogram;
use keyed_limit::KeyedLimiter;
use keyed_limit::Limit;
use rand::Rng;

/// Which keys the load threads pick.
#[derive(Debug, Clone, Copy)]
pub enum KeyPattern {
    /// Uniformly random over this many keys.
    Uniform(usize),
    /// Every call uses the same key.
    Hot,
}

#[derive(Debug, Clone)]
pub struct LoadConfig {
    pub threads: usize,
    pub pattern: KeyPattern,
    pub capacity: u64,
    pub refill_per_sec: f64,
    pub duration: Duration,
}

#[derive(Default)]
struct Counts {
    allowed: u64,
    denied: u64,
    errors: u64,
}

pub struct LoadReport {
    elapsed: Duration,
    counts: Counts,
    /// Per-call latency in nanoseconds.
    latency: Histogram<u64>,
}

fn new_histogram() -> anyhow::Result<Histogram<u64>> {
    Histogram::<u64>::new_with_bounds(1, 60_000_000_000, 3).context("invalid histogram bounds")
}

pub fn run_load_test(
    limiter: &Arc<KeyedLimiter>,
    config: &LoadConfig,
) -> anyhow::Result<LoadReport> {
    let limit = Limit::new(config.capacity, config.refill_per_sec)?;
    let keys: Arc<Vec<String>> = Arc::new(match config.pattern {
        KeyPattern::Uniform(n) => (0..n.max(1)).map(|i| format!("key_{i}")).collect(),
        KeyPattern::Hot => vec!["hot".to_string()],
    });

    let barrier = Arc::new(Barrier::new(config.threads + 1));
    let mut handles = Vec::with_capacity(config.threads);

    for _ in 0..config.threads {
        let limiter = Arc::clone(limiter);
        let keys = Arc::clone(&keys);
        let bar = Arc::clone(&barrier);
        let duration = config.duration;

        handles.push(thread::spawn(move || -> anyhow::Result<(Counts, Histogram<u64>)> {
            let mut hist = new_histogram()?;
            let mut counts = Counts::default();
            let mut rng = rand::rng();

            bar.wait();
            let deadline = Instant::now() + duration;
            while Instant::now() < deadline {
                let key = &keys[rng.random_range(0..keys.len())];
                let start = Instant::now();
                let outcome = limiter.allow_limit(key, &limit);
                hist.saturating_record(start.elapsed().as_nanos().max(1) as u64);

                match outcome {
                    Ok(d) if d.allowed => counts.allowed += 1,
                    Ok(_) => counts.denied += 1,
                    Err(_) => counts.errors += 1,
                }
            }
            Ok((counts, hist))
        }));
    }

    // Synchronize the start across all threads
    barrier.wait();
    let start = Instant::now();

    let mut counts = Counts::default();
    let mut latency = new_histogram()?;
    for handle in handles {
        let (c, hist) = handle.join().map_err(|_| anyhow!("load thread panicked"))??;
        counts.allowed += c.allowed;
        counts.denied += c.denied;
        counts.errors += c.errors;
        latency.add(&hist).context("failed to merge latency histograms")?;
    }

    Ok(LoadReport {
        elapsed: start.elapsed(),
        counts,
        latency,
    })
}

impl LoadReport {
    pub fn print(&self, name: &str, tracked_keys: usize) {
        let total = self.counts.allowed + self.counts.denied + self.counts.errors;
        let throughput = total as f64 / self.elapsed.as_secs_f64();
        let goodput = self.counts.allowed as f64 / self.elapsed.as_secs_f64();

        println!("--- {} ---", name);
        println!("Total Duration:  {:.2?}", self.elapsed);
        println!("Allowed/Total:   {}/{}", self.counts.allowed, total);
        println!("Denied:          {}", self.counts.denied);
        println!("Total Rate:      {:.2} calls/sec", throughput);
        println!("Allowed Rate:    {:.2} calls/sec", goodput);
        println!("Tracked Keys:    {}", tracked_keys);

        if total > 0 {
            println!("P50 (Call):      {}ns", self.latency.value_at_quantile(0.5));
            println!("P99 (Call):      {}ns", self.latency.value_at_quantile(0.99));
            println!("P99.9 (Call):    {}ns", self.latency.value_at_quantile(0.999));
            println!("Max (Call):      {}ns", self.latency.max());
        }

        if self.counts.errors > 0 {
            println!("Errors:          {}", self.counts.errors);
        }
        println!();
    }
}

use std::io::BufRead;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Args;
use clap::Parser;
use clap::Subcommand;
use keyed_limit::KeyedLimiter;
use keyed_limit::LimiterOptions;
use keyed_limit::SweepOptions;
use tracing_subscriber::EnvFilter;

mod load;

use load::KeyPattern;
use load::LoadConfig;

/// Drive a keyed-limit limiter by hand or under load.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Registry shard count (rounded up to a power of two)
    #[arg(long, default_value_t = 128)]
    shards: usize,

    /// Key slots reserved per shard
    #[arg(long, default_value_t = 1024)]
    capacity_hint_per_shard: usize,

    /// Cap on tracked keys; least recently used keys are evicted beyond it
    #[arg(long)]
    max_keys: Option<NonZeroUsize>,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Read keys from stdin, one per line, and print each decision
    Interactive {
        #[arg(long, default_value_t = 10)]
        capacity: u64,
        #[arg(long, default_value_t = 5.0)]
        refill: f64,
    },
    /// Spread calls across many keys from several threads
    Uniform(LoadArgs),
    /// Hammer a single key from several threads
    Hot(LoadArgs),
}

#[derive(Args, Debug, Clone)]
struct LoadArgs {
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Distinct keys to pick from (uniform mode only)
    #[arg(long, default_value_t = 100_000)]
    keys: usize,

    #[arg(long, default_value_t = 10)]
    capacity: u64,

    #[arg(long, default_value_t = 1_000.0)]
    refill: f64,

    /// How long to generate load, e.g. "5s" or "1m"
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    duration: Duration,

    /// Run the idle sweeper at this interval while under load
    #[arg(long, value_parser = humantime::parse_duration)]
    sweep_every: Option<Duration>,

    /// Idle threshold used by the sweeper
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    idle_timeout: Duration,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut options = LimiterOptions::default()
        .with_shards(cli.shards)
        .with_capacity_hint_per_shard(cli.capacity_hint_per_shard);
    if let Some(max_keys) = cli.max_keys {
        options = options.with_max_keys(max_keys);
    }
    let limiter = Arc::new(KeyedLimiter::new(options));

    match cli.mode {
        Mode::Interactive { capacity, refill } => run_interactive(&limiter, capacity, refill),
        Mode::Uniform(args) => run_load(
            &limiter,
            "Uniform Keys",
            KeyPattern::Uniform(args.keys),
            &args,
        ),
        Mode::Hot(args) => run_load(&limiter, "Hot Key", KeyPattern::Hot, &args),
    }
}

fn run_interactive(limiter: &KeyedLimiter, capacity: u64, refill: f64) -> anyhow::Result<()> {
    println!("Enter keys (Ctrl+D to exit). Using capacity={capacity}, refill={refill}/s");

    for line in std::io::stdin().lock().lines() {
        let key = line.context("failed to read key from stdin")?;
        match limiter.allow(&key, capacity, refill) {
            Ok(d) => println!(
                "{key} -> allowed={} remaining={} reset_ms={}",
                if d.allowed { "yes" } else { "no" },
                d.remaining,
                d.reset_ms
            ),
            Err(e) => println!("{key} -> error: {e}"),
        }
    }
    Ok(())
}

fn run_load(
    limiter: &Arc<KeyedLimiter>,
    name: &str,
    pattern: KeyPattern,
    args: &LoadArgs,
) -> anyhow::Result<()> {
    let sweeper = args
        .sweep_every
        .map(|every| limiter.spawn_sweeper(SweepOptions::new(every, args.idle_timeout)))
        .transpose()?;

    let config = LoadConfig {
        threads: args.threads.max(1),
        pattern,
        capacity: args.capacity,
        refill_per_sec: args.refill,
        duration: args.duration,
    };
    let report = load::run_load_test(limiter, &config)?;
    report.print(name, limiter.len());

    if let Some(sweeper) = sweeper {
        sweeper.stop();
    }
    Ok(())
}

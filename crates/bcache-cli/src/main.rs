#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use bcache_block::{
    BlockDevice, BufferCache, ByteBlockDevice, CacheMetricsSnapshot, DeviceTable, FileByteDevice,
    geometry_error,
};
use bcache_error::BcacheError;
use bcache_types::{BlockNumber, CacheConfig, CacheGeometry, DeviceId};
use serde::Serialize;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Instant;
use tracing::info;

const STRESS_DEVICE: DeviceId = DeviceId(1);

#[derive(Debug, Serialize)]
struct StressReport {
    image: String,
    block_count: u64,
    writable: bool,
    threads: usize,
    ops_per_thread: u64,
    elapsed_ms: u128,
    exhausted_retries: u64,
    geometry: CacheGeometry,
    shard_occupancy: Vec<usize>,
    hit_rate: f64,
    metrics: CacheMetricsSnapshot,
}

#[derive(Debug)]
struct StressArgs {
    image: PathBuf,
    threads: usize,
    ops: u64,
    config: Option<PathBuf>,
    json: bool,
}

fn main() {
    init_tracing();
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "stress" => {
            let remaining: Vec<String> = args.collect();
            let stress = parse_stress_args(&remaining)?;
            stress_cmd(&stress)
        }
        "config" => {
            let remaining: Vec<String> = args.collect();
            let config_path = flag_value(&remaining, "--config")?.map(PathBuf::from);
            config_cmd(config_path.as_deref())
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("bcache-cli\n");
    println!("USAGE:");
    println!("  bcache-cli stress <image-path> [--threads N] [--ops N] [--config FILE] [--json]");
    println!("  bcache-cli config [--config FILE]");
}

/// Value following `flag`, if the flag is present.
fn flag_value<'a>(args: &'a [String], flag: &str) -> Result<Option<&'a str>> {
    match args.iter().position(|arg| arg == flag) {
        None => Ok(None),
        Some(idx) => args
            .get(idx + 1)
            .map(|value| Some(value.as_str()))
            .with_context(|| format!("{flag} requires a value")),
    }
}

fn parse_stress_args(args: &[String]) -> Result<StressArgs> {
    let Some(image) = args.first().filter(|arg| !arg.starts_with("--")) else {
        bail!("stress requires an image path");
    };
    let threads = flag_value(args, "--threads")?
        .map(str::parse::<usize>)
        .transpose()
        .context("--threads must be a positive integer")?
        .unwrap_or(4);
    let ops = flag_value(args, "--ops")?
        .map(str::parse::<u64>)
        .transpose()
        .context("--ops must be a non-negative integer")?
        .unwrap_or(10_000);
    if threads == 0 {
        bail!("--threads must be at least 1");
    }
    Ok(StressArgs {
        image: PathBuf::from(image),
        threads,
        ops,
        config: flag_value(args, "--config")?.map(PathBuf::from),
        json: args.iter().any(|arg| arg == "--json"),
    })
}

fn load_config(path: Option<&Path>) -> Result<CacheConfig> {
    let Some(path) = path else {
        return Ok(CacheConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

fn config_cmd(path: Option<&Path>) -> Result<()> {
    let config = load_config(path)?;
    let geometry = config
        .validate()
        .map_err(geometry_error)
        .context("invalid cache configuration")?;
    println!(
        "{}",
        serde_json::to_string_pretty(&geometry).context("serialize geometry")?
    );
    Ok(())
}

fn stress_cmd(args: &StressArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let geometry = config
        .validate()
        .map_err(geometry_error)
        .context("invalid cache configuration")?;

    let file = FileByteDevice::open(&args.image)
        .with_context(|| format!("failed to open image {}", args.image.display()))?;
    let writable = file.is_writable();
    let device = ByteBlockDevice::new(file, geometry.block_size())
        .with_context(|| format!("image {} is not usable", args.image.display()))?;
    let block_count = device.block_count();
    if block_count == 0 {
        bail!("image {} holds no whole blocks", args.image.display());
    }

    let table = DeviceTable::new(geometry.block_size());
    let device: Arc<dyn BlockDevice> = Arc::new(device);
    table.attach(STRESS_DEVICE, device)?;
    let cache = Arc::new(BufferCache::new(geometry, table)?);

    info!(
        image = %args.image.display(),
        block_count,
        writable,
        threads = args.threads,
        ops = args.ops,
        "stress: starting"
    );

    let exhausted_retries = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(args.threads));
    let started = Instant::now();
    let workers: Vec<_> = (0..args.threads)
        .map(|tid| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            let exhausted = Arc::clone(&exhausted_retries);
            let ops = args.ops;
            thread::spawn(move || -> Result<()> {
                barrier.wait();
                let mut rng = Xorshift::seeded(tid as u64);
                for op in 0..ops {
                    let block = BlockNumber(rng.next_u64() % block_count);
                    let handle = match cache.bread(STRESS_DEVICE, block) {
                        Ok(handle) => handle,
                        Err(BcacheError::CacheExhausted { .. }) => {
                            exhausted.fetch_add(1, Ordering::Relaxed);
                            thread::yield_now();
                            continue;
                        }
                        Err(err) => {
                            return Err(err).with_context(|| format!("reading block {block}"));
                        }
                    };
                    // Writes put back the bytes just read, so the image is unchanged.
                    if writable && op % 8 == 0 {
                        cache
                            .write(&handle)
                            .with_context(|| format!("writing block {block}"))?;
                    }
                    cache.release(handle)?;
                }
                Ok(())
            })
        })
        .collect();

    for worker in workers {
        match worker.join() {
            Ok(result) => result?,
            Err(_) => bail!("stress worker panicked"),
        }
    }
    let elapsed = started.elapsed();
    cache.transport().sync_all().context("sync image")?;

    let metrics = cache.metrics();
    let report = StressReport {
        image: args.image.display().to_string(),
        block_count,
        writable,
        threads: args.threads,
        ops_per_thread: args.ops,
        elapsed_ms: elapsed.as_millis(),
        exhausted_retries: exhausted_retries.load(Ordering::Relaxed),
        geometry: *cache.geometry(),
        shard_occupancy: cache.shard_occupancy(),
        hit_rate: metrics.hit_rate(),
        metrics,
    };

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize report")?
        );
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &StressReport) {
    println!("bcache stress");
    println!("image: {}", report.image);
    println!("block_count: {}", report.block_count);
    println!("writable: {}", report.writable);
    println!(
        "geometry: {} slots / {} shards / {} byte blocks",
        report.geometry.slot_count(),
        report.geometry.shard_count(),
        report.geometry.block_size()
    );
    println!(
        "workload: {} threads x {} ops in {} ms",
        report.threads, report.ops_per_thread, report.elapsed_ms
    );
    println!("hits: {}", report.metrics.hits);
    println!("misses: {}", report.metrics.misses);
    println!("local_evictions: {}", report.metrics.local_evictions);
    println!("steals: {}", report.metrics.steals);
    println!("exhausted: {}", report.metrics.exhausted);
    println!("device_reads: {}", report.metrics.device_reads);
    println!("device_writes: {}", report.metrics.device_writes);
    println!("hit_rate: {:.3}", report.hit_rate);
    println!("shard_occupancy: {:?}", report.shard_occupancy);
}

/// Small deterministic generator for block picks.
struct Xorshift(u64);

impl Xorshift {
    fn seeded(seed: u64) -> Self {
        Self(seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1)
    }

    fn next_u64(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }
}

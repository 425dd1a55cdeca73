//! tidewal driver
//!
//! Pushes a batch of writes through the journal against a simulated block
//! device and waits for every one to be checkpointed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tidewal_core::sim::SimulatedBlockDevice;
use tidewal_core::{
    BlockDevice, Journal, JournalConfig, Operation, WriteClient, WriteId, DEFAULT_BUFFER_SIZE,
    DEFAULT_MAX_REQUESTS,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// tidewal - write-ahead journaling pipeline driver
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of writes to submit
    #[arg(short, long, default_value_t = 16)]
    writes: usize,

    /// Capacity of each stage queue
    #[arg(long, default_value_t = DEFAULT_BUFFER_SIZE)]
    buffer_size: usize,

    /// Number of request slots (write ids wrap around this)
    #[arg(long, default_value_t = DEFAULT_MAX_REQUESTS)]
    max_requests: usize,

    /// Simulated completion latency for every operation, in microseconds
    #[arg(long)]
    latency_us: Option<u64>,

    /// Delay the first journal txe by this many milliseconds
    #[arg(long)]
    slow_txe_ms: Option<u64>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn build_device(args: &Args) -> Result<SimulatedBlockDevice> {
    if args.latency_us.is_none() && args.slow_txe_ms.is_none() {
        return Ok(SimulatedBlockDevice::inline());
    }

    let mut builder = SimulatedBlockDevice::builder();
    if let Some(us) = args.latency_us {
        builder = builder.latency(Duration::from_micros(us));
    }
    if let Some(ms) = args.slow_txe_ms {
        builder = builder.delay_first(Operation::JournalTxe, Duration::from_millis(ms));
    }
    builder.build().context("failed to start simulated device")
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("tidewal={0},tidewal_core={0}", args.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting tidewal");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = JournalConfig::builder()
        .buffer_size(args.buffer_size)
        .max_requests(args.max_requests)
        .build();
    let device: Arc<dyn BlockDevice> = Arc::new(build_device(&args)?);
    let client: Arc<dyn WriteClient> = Arc::new(|id: WriteId| info!("write complete {id}"));

    let journal = Journal::start(config, device, client).context("failed to start journal")?;

    let started = Instant::now();
    for i in 0..args.writes {
        let write_id = i % args.max_requests;
        info!("request write {write_id}");
        journal
            .request_write(write_id)
            .with_context(|| format!("failed to submit write {write_id}"))?;
    }
    journal.wait_for_all();

    let stats = journal.stats();
    for stage in &stats.stages {
        info!(
            "{} stage: {} writes, {} producer stalls",
            stage.stage, stage.processed, stage.queue.push_blocked
        );
    }
    info!(
        "{} writes checkpointed in {:?}",
        args.writes,
        started.elapsed()
    );

    Ok(())
}

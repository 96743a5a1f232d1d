//! accel-dense: device discovery and transfer benchmarks.
//!
//! `devices` lists what the configured platform exposes. `bench` times
//! fill, upload, download and swap of device vectors across a range of
//! sizes and prints one JSON report per size.

use clap::Parser;
use tracing::{info, warn};

use accel_dense::bench;
use accel_dense::config::{Cli, Command, Config};
use accel_dense::runtime::{CommandQueue, Context, Platform};
use accel_dense::Library;

// Not `#[tokio::main]`: queue drains block on the worker thread, which is
// not allowed from inside an async runtime.
fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "accel_dense=debug"
    } else {
        "accel_dense=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("accel-dense v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Config::load(&cli.config)?;
    let platform = Platform::from_config(&config.platform)?;

    match cli.command {
        Command::Devices => {
            for device in platform.devices() {
                println!("{}", serde_json::to_string(device.info())?);
            }
        }
        Command::Bench { sizes, iterations } => {
            let sizes = sizes.unwrap_or(config.bench.sizes);
            let iterations = iterations.unwrap_or(config.bench.iterations);

            let _library = Library::for_platform(&config.platform)?;
            let device = platform.default_device()?;
            let context = Context::new(&device);
            let queue = CommandQueue::for_context(&context)?;

            info!(
                device = %device,
                sizes = sizes.len(),
                iterations,
                "Starting transfer benchmark"
            );

            for size in sizes {
                match bench::run_size(size, iterations, config.bench.fill_value, &queue) {
                    Ok(report) => println!("{}", serde_json::to_string(&report)?),
                    Err(err) => {
                        warn!(size, error = %err, "Benchmark size failed");
                        return Err(err.into());
                    }
                }
            }

            let stats = queue.stats();
            info!(
                h2d_bytes = stats.total_h2d_bytes,
                d2h_bytes = stats.total_d2h_bytes,
                drains = stats.total_drains,
                "Benchmark complete"
            );
        }
    }

    Ok(())
}

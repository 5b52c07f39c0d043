#![doc = include_str!("../README.md")]

mod config;
mod simulation;
mod telemetry;

use clap::Parser;
use config::{CliArgs, SimulationConfig};

// mimalloc holds up better than the system allocator when many instance
// threads allocate at once, especially on musl.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = SimulationConfig::try_from(args)?;

    telemetry::init_tracing();
    log_startup_info(&config);

    let report = simulation::run(&config)?;
    report.verify()?;

    println!("{report}");
    Ok(())
}

fn log_startup_info(_config: &SimulationConfig) {
    if cfg!(debug_assertions) {
        #[cfg(feature = "tracing")]
        tracing::info!("Starting simulation with full config: {:#?}", _config);
    } else {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting simulation of {} instances over {} objects",
            _config.num_instances,
            _config.num_objects
        );
    }
}

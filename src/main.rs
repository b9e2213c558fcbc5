// SPDX-License-Identifier: GPL-3.0-only

use camera_lifecycle::config::LifecycleConfig;
use camera_lifecycle::constants::app_info;
use camera_lifecycle::device::ApiType;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cli;

#[derive(Parser)]
#[command(name = "camera-lifecycle")]
#[command(about = "Drive the camera device lifecycle against simulated hardware")]
#[command(version = app_info::version())]
struct Cli {
    /// Configuration file (default: <config dir>/camera-lifecycle/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a camera, switch to another one, then shut down
    Demo {
        /// Camera API to open through
        #[arg(short, long, default_value = "camera2")]
        api: ApiType,
    },

    /// Run concurrent open/release cycles and check only one device is ever open
    Cycle {
        /// Number of simulated cameras
        #[arg(long, default_value = "3")]
        cameras: u32,

        /// Open/release iterations per worker
        #[arg(short, long, default_value = "20")]
        iterations: usize,

        /// Number of concurrent workers
        #[arg(long, default_value = "4")]
        concurrency: usize,
    },

    /// Replay a JSON script of open, release, wait and shutdown steps
    Script {
        /// Path to the script
        path: PathBuf,
    },

    /// Print the effective configuration
    Config {
        /// Also write it to this path
        #[arg(short, long)]
        write: Option<PathBuf>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = LifecycleConfig::load(cli.config.as_deref())?;

    // Initialize logging
    // RUST_LOG takes precedence over the configured filter
    // Examples: RUST_LOG=debug, RUST_LOG=camera_lifecycle=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_filter)),
        )
        .with_target(true)
        .with_level(true)
        .init();

    match cli.command {
        Commands::Demo { api } => cli::run_demo(config, api),
        Commands::Cycle {
            cameras,
            iterations,
            concurrency,
        } => cli::run_cycle(config, cameras, iterations, concurrency),
        Commands::Script { path } => cli::run_script(config, &path),
        Commands::Config { write } => cli::show_config(&config, write),
    }
}

//! Tracegrab CLI - trace replayer
//!
//! # Commands
//!
//! - `tracegrab replay` - Replay a trace and write the result summary
//! - `tracegrab info` - Validate a trace and print its header and metadata
//!
//! # Usage
//!
//! ```bash
//! # Replay frames 100-200 three times and capture frame 150
//! tracegrab replay game.vktrace --loop-start-frame 100 --loop-end-frame 200 \
//!     --num-loops 3 --screenshot 150
//!
//! # Any option by its short name
//! tracegrab replay game.vktrace -O pmp=80 -O pltf=true
//! ```

mod info;
mod replay;

use clap::{Parser, Subcommand};
use std::process::ExitCode;
use tracegrab_core::Verbosity;
use tracing_subscriber::EnvFilter;

/// Tracegrab - API trace replayer
#[derive(Parser)]
#[command(name = "tracegrab")]
#[command(about = "Replay API traces and measure frame rates")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a trace
    Replay(replay::ReplayArgs),

    /// Validate a trace and print what it contains
    Info(info::InfoArgs),
}

/// Install the stderr subscriber; `RUST_LOG` wins over `verbosity`
pub(crate) fn init_logging(verbosity: Verbosity) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(verbosity.filter_directive())),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Replay(args) => replay::execute(args),
        Commands::Info(args) => info::execute(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

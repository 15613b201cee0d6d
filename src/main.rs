// SPDX-License-Identifier: GPL-3.0-only

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

mod cli;

#[derive(Parser)]
#[command(name = "camera-pipeline")]
#[command(about = "V4L2 capture with GPU pixel-format conversion")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every subcommand
#[derive(Args, Debug, Clone)]
pub struct DeviceArgs {
    /// Capture device node
    #[arg(short, long)]
    device: Option<PathBuf>,

    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Extra key=value options (width, height, format, fps_min, ...)
    #[arg(short = 'o', long = "option", value_name = "KEY=VALUE")]
    options: Vec<String>,

    /// Use the built-in virtual device instead of hardware
    #[arg(long = "virtual")]
    use_virtual: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the device's formats, sizes, rates and controls as JSON
    Report {
        #[command(flatten)]
        device: DeviceArgs,
    },

    /// List the device's controls and their current values
    Controls {
        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Capture frames and save the last one as RGBA
    Capture {
        #[command(flatten)]
        device: DeviceArgs,

        /// Number of frames to capture
        #[arg(short = 'n', long, default_value = "30")]
        frames: u64,

        /// Output image path (PNG)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Convert on the CPU even when a GPU is available
        #[arg(long)]
        software: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set RUST_LOG environment variable to control log level
    // Examples: RUST_LOG=debug, RUST_LOG=camera_pipeline=debug
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(true)
        .with_level(true)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Report { device } => cli::print_report(&device),
        Commands::Controls { device } => cli::list_controls(&device),
        Commands::Capture {
            device,
            frames,
            output,
            software,
        } => cli::capture(&device, frames, output, software),
    }
}

// SPDX-License-Identifier: GPL-3.0-only

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cli;

#[derive(Parser)]
#[command(name = "mmal-camera")]
#[command(about = "Camera pipeline driven on simulated hardware")]
#[command(version)]
struct Cli {
    /// Pipeline configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Grab preview frames and save the last one as PNG
    Preview {
        /// Number of frames to grab
        #[arg(short, long, default_value = "30")]
        frames: u32,

        /// Use the still preview port instead of the video branch
        #[arg(short, long)]
        still: bool,

        /// Output file path (default: ~/Pictures/Camera/preview_TIMESTAMP.png)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Record an H.264 elementary stream
    Record {
        /// Recording duration in seconds
        #[arg(short, long, default_value = "10")]
        duration: u64,

        /// Output file path (default: ~/Videos/Camera/video_TIMESTAMP.h264)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Capture one JPEG
    Still {
        /// Output file path (default: ~/Pictures/Camera/photo_TIMESTAMP.jpg)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the effective configuration as JSON
    Config,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    // Set RUST_LOG environment variable to control log level
    // Examples: RUST_LOG=debug, RUST_LOG=mmal_camera=trace, RUST_LOG=info
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(true)
        .with_level(true)
        .init();

    let cli = Cli::parse();
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Preview {
            frames,
            still,
            output,
        } => cli::preview(config, frames, still, output),
        Commands::Record { duration, output } => cli::record_video(config, duration, output),
        Commands::Still { output } => cli::take_still(config, output),
        Commands::Config => cli::print_config(config),
    }
}

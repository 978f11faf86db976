// SPDX-License-Identifier: GPL-3.0-only

//! CLI commands for camera operations
//!
//! Every command builds a pipeline on [`SimulatedHardware`], so the
//! binary runs anywhere.

use chrono::Local;
use mmal_camera::media::convert;
use mmal_camera::{CameraPipeline, PipelineConfig, SimulatedHardware};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

type CliResult = Result<(), Box<dyn std::error::Error>>;

fn load_config(path: Option<&Path>) -> Result<PipelineConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(PipelineConfig::load(path)?),
        None => Ok(PipelineConfig::default()),
    }
}

fn open_pipeline(config: Option<&Path>) -> Result<CameraPipeline, Box<dyn std::error::Error>> {
    let config = load_config(config)?;
    let hal = Arc::new(SimulatedHardware::new());
    Ok(CameraPipeline::new(hal, config)?)
}

/// Grab `frames` preview frames and save the last one
pub fn preview(config: Option<&Path>, frames: u32, still: bool, output: Option<PathBuf>) -> CliResult {
    let mut pipeline = open_pipeline(config)?;
    if still {
        pipeline.start_still_preview()?;
    } else {
        pipeline.start_video_preview()?;
    }

    let source = pipeline.frame_source().ok_or("Preview did not start")?;
    let layout = source.layout();
    println!(
        "Preview: {}x{} {}",
        layout.width(),
        layout.height(),
        layout.format()
    );

    let mut frame = vec![0u8; source.frame_size()];
    let mut len = 0;
    let start = Instant::now();
    for _ in 0..frames.max(1) {
        pipeline.grab()?;
        len = pipeline.retrieve(&mut frame)?;
    }
    println!(
        "Grabbed {} frames in {:.2}s",
        frames.max(1),
        start.elapsed().as_secs_f64()
    );

    let rgb = convert::to_rgb(layout.format(), &frame[..len], layout.width(), layout.height());
    let image = image::RgbImage::from_raw(layout.width(), layout.height(), rgb)
        .ok_or("Frame does not match the preview size")?;

    let path = output_path(output, get_default_photo_dir(), "preview", "png")?;
    image.save(&path)?;
    pipeline.release();

    println!("Preview frame saved: {}", path.display());
    Ok(())
}

/// Record for `duration` seconds or until Ctrl+C
pub fn record_video(config: Option<&Path>, duration: u64, output: Option<PathBuf>) -> CliResult {
    let mut pipeline = open_pipeline(config)?;
    let path = output_path(output, get_default_video_dir(), "video", "h264")?;

    println!("Output: {}", path.display());
    println!("Duration: {} seconds", duration);

    // Set up Ctrl+C handler
    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_flag_clone = stop_flag.clone();
    ctrlc::set_handler(move || {
        stop_flag_clone.store(true, Ordering::SeqCst);
    })?;

    println!();
    println!("Recording... (press Ctrl+C to stop early)");
    pipeline.start_video_record(&path)?;

    let start = Instant::now();
    let target_duration = Duration::from_secs(duration);
    while start.elapsed() < target_duration {
        if stop_flag.load(Ordering::SeqCst) {
            println!();
            println!("Stopping early...");
            break;
        }

        let elapsed = start.elapsed().as_secs();
        print!("\rRecording: {:02}:{:02}", elapsed / 60, elapsed % 60);
        std::io::Write::flush(&mut std::io::stdout())?;

        std::thread::sleep(Duration::from_millis(100));
    }
    println!();

    pipeline.stop_video_record()?;
    pipeline.release();

    let bytes = std::fs::metadata(&path)?.len();
    println!("Video saved: {} ({} bytes)", path.display(), bytes);
    Ok(())
}

/// Capture one still image
pub fn take_still(config: Option<&Path>, output: Option<PathBuf>) -> CliResult {
    let mut pipeline = open_pipeline(config)?;
    let path = output_path(output, get_default_photo_dir(), "photo", "jpg")?;

    let size = pipeline.config().still_record_size;
    println!("Capturing {}x{}...", size.width, size.height);
    let bytes = pipeline.start_still_record(&path)?;
    pipeline.release();

    println!("Photo saved: {} ({} bytes)", path.display(), bytes);
    Ok(())
}

/// Print the configuration the other commands would use
pub fn print_config(config: Option<&Path>) -> CliResult {
    let config = load_config(config)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

/// Use `output` as given, or a timestamped file under `dir`
fn output_path(
    output: Option<PathBuf>,
    dir: PathBuf,
    prefix: &str,
    extension: &str,
) -> Result<PathBuf, Box<dyn std::error::Error>> {
    if let Some(path) = output {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        return Ok(path);
    }

    std::fs::create_dir_all(&dir)?;
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    Ok(dir.join(format!("{}_{}.{}", prefix, timestamp, extension)))
}

/// Default folder name for saving photos and videos
const DEFAULT_SAVE_FOLDER: &str = "Camera";

/// Get default photo directory
fn get_default_photo_dir() -> PathBuf {
    dirs::picture_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join(DEFAULT_SAVE_FOLDER)
}

/// Get default video directory
fn get_default_video_dir() -> PathBuf {
    dirs::video_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join(DEFAULT_SAVE_FOLDER)
}

// SPDX-License-Identifier: GPL-3.0-only

//! Pipeline configuration
//!
//! Stored as JSON. Every field has a default, so a partial file (or no
//! file at all) yields a usable configuration.

use crate::constants::{defaults, hardware, limits};
use crate::errors::{PipelineError, PipelineResult};
use crate::media::layout::PreviewFormat;
use crate::pipeline::parameters::CameraParameters;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// Width and height of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Clamp into `1..=max` in both dimensions
    pub fn capped(self, max: FrameSize) -> Self {
        Self {
            width: self.width.clamp(1, max.width),
            height: self.height.clamp(1, max.height),
        }
    }
}

pub const MAX_VIDEO_SIZE: FrameSize =
    FrameSize::new(hardware::MAX_VIDEO_WIDTH, hardware::MAX_VIDEO_HEIGHT);

pub const MAX_PHOTO_SIZE: FrameSize =
    FrameSize::new(hardware::MAX_PHOTO_WIDTH, hardware::MAX_PHOTO_HEIGHT);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Size of frames returned by video preview
    pub video_preview_size: FrameSize,
    /// Pixel format of preview frames (video and still)
    pub preview_format: PreviewFormat,
    /// Size of the recorded H.264 stream
    pub video_record_size: FrameSize,
    /// Size of frames returned by still preview
    pub still_preview_size: FrameSize,
    /// Size of captured JPEG images
    pub still_record_size: FrameSize,
    /// H.264 target bitrate in bits per second
    pub video_bitrate: u32,
    pub jpeg_quality: u32,
    /// Settings committed every time the camera opens
    pub parameters: CameraParameters,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            video_preview_size: FrameSize::new(
                defaults::VIDEO_PREVIEW_WIDTH,
                defaults::VIDEO_PREVIEW_HEIGHT,
            ),
            preview_format: PreviewFormat::Rgb24,
            video_record_size: FrameSize::new(
                defaults::VIDEO_RECORD_WIDTH,
                defaults::VIDEO_RECORD_HEIGHT,
            ),
            still_preview_size: FrameSize::new(
                defaults::STILL_PREVIEW_WIDTH,
                defaults::STILL_PREVIEW_HEIGHT,
            ),
            still_record_size: FrameSize::new(
                defaults::STILL_RECORD_WIDTH,
                defaults::STILL_RECORD_HEIGHT,
            ),
            video_bitrate: defaults::VIDEO_BITRATE,
            jpeg_quality: defaults::JPEG_QUALITY,
            parameters: CameraParameters::default(),
        }
    }
}

impl PipelineConfig {
    /// Load from a JSON file; a missing file yields the defaults
    pub fn load(path: &Path) -> PipelineResult<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No configuration file, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))?;
        let config: PipelineConfig = serde_json::from_str(&text)?;
        info!(path = %path.display(), "Configuration loaded");
        Ok(config.normalized())
    }

    pub fn save(&self, path: &Path) -> PipelineResult<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)
            .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))?;
        debug!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Apply every cap and clamp
    pub fn normalized(mut self) -> Self {
        self.video_preview_size = self.video_preview_size.capped(MAX_VIDEO_SIZE);
        self.video_record_size = self.video_record_size.capped(MAX_VIDEO_SIZE);
        self.still_preview_size = self.still_preview_size.capped(MAX_VIDEO_SIZE);
        self.still_record_size = self.still_record_size.capped(MAX_PHOTO_SIZE);
        self.jpeg_quality = self
            .jpeg_quality
            .clamp(limits::JPEG_QUALITY_MIN, limits::JPEG_QUALITY_MAX);
        self.parameters = self.parameters.normalized();
        self
    }
}

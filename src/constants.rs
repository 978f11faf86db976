// SPDX-License-Identifier: GPL-3.0-only

//! Pipeline-wide constants

use std::time::Duration;

/// Hardware limits and port layout of the camera stack
pub mod hardware {
    /// Largest frame the video path (preview, record) will accept
    pub const MAX_VIDEO_WIDTH: u32 = 1920;
    pub const MAX_VIDEO_HEIGHT: u32 = 1080;

    /// Largest frame the still capture path will accept
    pub const MAX_PHOTO_WIDTH: u32 = 4056;
    pub const MAX_PHOTO_HEIGHT: u32 = 3040;

    /// Committed frame widths are padded to this many pixels
    pub const WIDTH_ALIGNMENT: u32 = 32;

    /// Committed frame heights are padded to this many rows
    pub const HEIGHT_ALIGNMENT: u32 = 16;

    /// Camera output carrying the live preview stream
    pub const CAMERA_PREVIEW_PORT: u8 = 0;

    /// Camera output carrying the video stream (splitter input)
    pub const CAMERA_VIDEO_PORT: u8 = 1;

    /// Camera output carrying still captures
    pub const CAMERA_CAPTURE_PORT: u8 = 2;

    /// Splitter output feeding the video preview resizer
    pub const SPLITTER_PREVIEW_PORT: u8 = 0;

    /// Splitter output feeding the H.264 encoder
    pub const SPLITTER_RECORD_PORT: u8 = 1;

    /// Streaming stages never run with fewer buffers than this
    pub const STREAMING_BUFFER_FLOOR: u32 = 3;

    /// Size of an opaque (handle-only) buffer payload
    pub const OPAQUE_BUFFER_SIZE: u32 = 128;
}

/// Defaults applied when no configuration file overrides them
pub mod defaults {
    pub const VIDEO_PREVIEW_WIDTH: u32 = 960;
    pub const VIDEO_PREVIEW_HEIGHT: u32 = 540;

    pub const VIDEO_RECORD_WIDTH: u32 = 1920;
    pub const VIDEO_RECORD_HEIGHT: u32 = 1080;

    pub const STILL_PREVIEW_WIDTH: u32 = 960;
    pub const STILL_PREVIEW_HEIGHT: u32 = 540;

    pub const STILL_RECORD_WIDTH: u32 = 4056;
    pub const STILL_RECORD_HEIGHT: u32 = 3040;

    pub const FRAMERATE: u32 = 30;

    /// H.264 target bitrate in bits per second
    pub const VIDEO_BITRATE: u32 = 17_000_000;

    pub const JPEG_QUALITY: u32 = 85;

    /// AWB gains are applied with a 1/65536 denominator
    pub const AWB_GAIN_DENOMINATOR: i32 = 65536;
}

/// Bounds enforced by the parameter setters
pub mod limits {
    pub const BRIGHTNESS_MAX: u32 = 100;

    /// Sharpness, contrast and saturation share this symmetric range
    pub const SIGNED_LEVEL_MIN: i32 = -100;
    pub const SIGNED_LEVEL_MAX: i32 = 100;

    pub const EXPOSURE_COMPENSATION_MIN: i32 = -10;
    pub const EXPOSURE_COMPENSATION_MAX: i32 = 10;

    /// Longest manual shutter in microseconds
    pub const SHUTTER_SPEED_MAX_US: u32 = 330_000;

    pub const FRAMERATE_MIN: u32 = 1;
    pub const FRAMERATE_MAX: u32 = 90;

    pub const JPEG_QUALITY_MIN: u32 = 1;
    pub const JPEG_QUALITY_MAX: u32 = 100;
}

/// Timing constants
pub mod timing {
    use super::Duration;

    /// Frame counter modulo for periodic logging
    pub const FRAME_LOG_INTERVAL: u64 = 30;

    /// Delivery interval of the simulated sensor (about 30fps)
    pub const SIMULATED_FRAME_INTERVAL: Duration = Duration::from_millis(33);
}

/// Round `value` up to the next multiple of `alignment`
pub fn align_up(value: u32, alignment: u32) -> u32 {
    if alignment == 0 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

/// Number of preview frames the sensor keeps in flight for a given framerate
///
/// Three frames cover 30fps; every further 10fps needs one more.
pub fn preview_frame_count(framerate: u32) -> u32 {
    3 + framerate.saturating_sub(30) / 10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 32), 0);
        assert_eq!(align_up(1, 32), 32);
        assert_eq!(align_up(960, 32), 960);
        assert_eq!(align_up(1080, 16), 1088);
        assert_eq!(align_up(4056, 32), 4064);
        assert_eq!(align_up(7, 0), 7);
    }

    #[test]
    fn test_preview_frame_count() {
        assert_eq!(preview_frame_count(15), 3);
        assert_eq!(preview_frame_count(30), 3);
        assert_eq!(preview_frame_count(39), 3);
        assert_eq!(preview_frame_count(40), 4);
        assert_eq!(preview_frame_count(90), 9);
    }
}

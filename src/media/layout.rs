// SPDX-License-Identifier: GPL-3.0-only

//! Row-padded frame layouts
//!
//! Hardware ports hand out frames whose rows are padded to a 32-pixel
//! stride and whose planes are padded to 16 rows. [`FrameLayout`]
//! describes both shapes of a frame and converts the padded one into
//! the tightly packed one the host wants.

use crate::backends::mmal::Encoding;
use crate::constants::{align_up, hardware};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Pixel formats a preview can be delivered in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PreviewFormat {
    I420,
    #[default]
    Rgb24,
    Bgr24,
}

impl PreviewFormat {
    pub const ALL: [PreviewFormat; 3] = [
        PreviewFormat::I420,
        PreviewFormat::Rgb24,
        PreviewFormat::Bgr24,
    ];

    pub fn encoding(&self) -> Encoding {
        match self {
            PreviewFormat::I420 => Encoding::I420,
            PreviewFormat::Rgb24 => Encoding::Rgb24,
            PreviewFormat::Bgr24 => Encoding::Bgr24,
        }
    }

    pub fn from_encoding(encoding: Encoding) -> Option<Self> {
        match encoding {
            Encoding::I420 => Some(PreviewFormat::I420),
            Encoding::Rgb24 => Some(PreviewFormat::Rgb24),
            Encoding::Bgr24 => Some(PreviewFormat::Bgr24),
            _ => None,
        }
    }
}

impl fmt::Display for PreviewFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encoding())
    }
}

/// One plane of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plane {
    /// Byte offset of the plane inside the padded frame
    pub offset: usize,
    /// Padded bytes per row
    pub stride: usize,
    /// Visible bytes per row
    pub row_bytes: usize,
    /// Visible rows
    pub rows: usize,
}

/// Padded and packed geometry of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    format: PreviewFormat,
    width: u32,
    height: u32,
}

impl FrameLayout {
    /// `width` and `height` are the visible (cropped) dimensions
    pub fn new(format: PreviewFormat, width: u32, height: u32) -> Self {
        Self {
            format,
            width,
            height,
        }
    }

    pub fn format(&self) -> PreviewFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    fn padded_width(&self) -> usize {
        align_up(self.width, hardware::WIDTH_ALIGNMENT) as usize
    }

    fn padded_height(&self) -> usize {
        align_up(self.height, hardware::HEIGHT_ALIGNMENT) as usize
    }

    /// Planes of the padded frame, in memory order
    pub fn planes(&self) -> Vec<Plane> {
        let w = self.width as usize;
        let h = self.height as usize;
        let stride = self.padded_width();
        let rows = self.padded_height();
        match self.format {
            PreviewFormat::Rgb24 | PreviewFormat::Bgr24 => vec![Plane {
                offset: 0,
                stride: stride * 3,
                row_bytes: w * 3,
                rows: h,
            }],
            PreviewFormat::I420 => {
                let luma = stride * rows;
                let chroma = (stride / 2) * (rows / 2);
                let chroma_plane = |offset| Plane {
                    offset,
                    stride: stride / 2,
                    row_bytes: w.div_ceil(2),
                    rows: h.div_ceil(2),
                };
                vec![
                    Plane {
                        offset: 0,
                        stride,
                        row_bytes: w,
                        rows: h,
                    },
                    chroma_plane(luma),
                    chroma_plane(luma + chroma),
                ]
            }
        }
    }

    /// Bytes of one frame as the port delivers it
    pub fn padded_size(&self) -> usize {
        let stride = self.padded_width();
        let rows = self.padded_height();
        match self.format {
            PreviewFormat::Rgb24 | PreviewFormat::Bgr24 => stride * 3 * rows,
            PreviewFormat::I420 => stride * rows + 2 * (stride / 2) * (rows / 2),
        }
    }

    /// Bytes of one frame with all padding removed
    pub fn packed_size(&self) -> usize {
        self.planes().iter().map(|p| p.row_bytes * p.rows).sum()
    }

    /// Strip row and plane padding from `src` into `dst`
    ///
    /// Returns the number of bytes written. Rows missing from a short
    /// `src` are skipped, so a truncated frame yields fewer bytes.
    /// `dst` must hold at least [`FrameLayout::packed_size`] bytes.
    pub fn pack(&self, src: &[u8], dst: &mut [u8]) -> usize {
        let mut written = 0;
        for plane in self.planes() {
            for row in 0..plane.rows {
                let start = plane.offset + row * plane.stride;
                let end = start + plane.row_bytes;
                if end > src.len() || written + plane.row_bytes > dst.len() {
                    return written;
                }
                dst[written..written + plane.row_bytes].copy_from_slice(&src[start..end]);
                written += plane.row_bytes;
            }
        }
        written
    }
}

// SPDX-License-Identifier: GPL-3.0-only
//! Synthetic sensor and encoder output
//!
//! Raw frames are padded exactly like a hardware port pads them, with
//! padding bytes set to [`PAD_BYTE`]. Pixel values follow a fixed
//! pattern so consumers can check that rows were de-padded correctly:
//!
//! - RGB: `(x + seq, y, x + y)` per pixel, in RGB or BGR order
//! - I420: luma `x + y + seq`, chroma `128 + x` (U) and `128 + y` (V)
//!
//! All values wrap at 256.

use crate::backends::mmal::BufferFlags;
use crate::media::layout::{FrameLayout, PreviewFormat};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};

/// Value written into row and plane padding
pub const PAD_BYTE: u8 = 0xEE;

/// Marker at the start of every side-information buffer
pub const SIDE_INFO_MARKER: &[u8] = b"MVSI";

/// Start code + NAL header of the synthetic sequence parameter set
pub const H264_SPS_PREFIX: &[u8] = &[0, 0, 0, 1, 0x67];

/// Side information is emitted after every this many encoded frames
const SIDE_INFO_INTERVAL: u64 = 10;

/// Keyframe period of the synthetic encoder
const GOP_LENGTH: u64 = 30;

/// One unit of output waiting for a buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub bytes: Vec<u8>,
    pub flags: BufferFlags,
}

/// Split `bytes` into buffer-sized chunks, flagging the last one
pub fn split(bytes: &[u8], max: usize, last_flags: BufferFlags) -> Vec<Chunk> {
    let max = max.max(1);
    let count = bytes.len().div_ceil(max).max(1);
    (0..count)
        .map(|i| {
            let start = i * max;
            let end = (start + max).min(bytes.len());
            Chunk {
                bytes: bytes[start..end].to_vec(),
                flags: if i + 1 == count {
                    last_flags
                } else {
                    BufferFlags::empty()
                },
            }
        })
        .collect()
}

/// A padded raw frame in `layout`
pub fn raw_frame(layout: &FrameLayout, seq: u64) -> Vec<u8> {
    let mut frame = vec![PAD_BYTE; layout.padded_size()];
    let s = seq as usize;
    let planes = layout.planes();

    match layout.format() {
        PreviewFormat::Rgb24 | PreviewFormat::Bgr24 => {
            let plane = planes[0];
            let bgr = layout.format() == PreviewFormat::Bgr24;
            for y in 0..plane.rows {
                let row = plane.offset + y * plane.stride;
                for x in 0..plane.row_bytes / 3 {
                    let r = (x + s) as u8;
                    let g = y as u8;
                    let b = (x + y) as u8;
                    let px = row + x * 3;
                    let [c0, c2] = if bgr { [b, r] } else { [r, b] };
                    frame[px] = c0;
                    frame[px + 1] = g;
                    frame[px + 2] = c2;
                }
            }
        }
        PreviewFormat::I420 => {
            for (index, plane) in planes.iter().enumerate() {
                for y in 0..plane.rows {
                    let row = plane.offset + y * plane.stride;
                    for x in 0..plane.row_bytes {
                        frame[row + x] = match index {
                            0 => (x + y + s) as u8,
                            1 => (128 + x) as u8,
                            _ => (128 + y) as u8,
                        };
                    }
                }
            }
        }
    }

    frame
}

/// Encoded output of one H.264 frame
///
/// The first frame is preceded by SPS/PPS flagged as config data.
/// Side information follows every tenth frame.
pub fn h264_frame(seq: u64, width: u32, height: u32, bitrate: u32, max_chunk: usize) -> Vec<Chunk> {
    let mut chunks = Vec::new();

    if seq == 0 {
        let mut header = H264_SPS_PREFIX.to_vec();
        header.extend_from_slice(&[0x64, 0x00, 0x28]);
        header.extend_from_slice(&width.to_be_bytes());
        header.extend_from_slice(&height.to_be_bytes());
        header.extend_from_slice(&[0, 0, 0, 1, 0x68, 0xEE, 0x3C, 0x80]);
        chunks.extend(split(&header, max_chunk, BufferFlags::CONFIG));
    }

    let keyframe = seq % GOP_LENGTH == 0;
    let payload_len = ((bitrate / 8 / 30) as usize).clamp(64, 4096);
    let mut picture = vec![0, 0, 0, 1, if keyframe { 0x65 } else { 0x41 }];
    picture.extend((0..payload_len).map(|i| (i as u64 ^ seq) as u8 | 0x01));
    let mut flags = BufferFlags::FRAME_END;
    if keyframe {
        flags.insert(BufferFlags::KEYFRAME);
    }
    chunks.extend(split(&picture, max_chunk, flags));

    if (seq + 1) % SIDE_INFO_INTERVAL == 0 {
        let mut side = SIDE_INFO_MARKER.to_vec();
        side.extend_from_slice(&seq.to_le_bytes());
        chunks.extend(split(&side, max_chunk, BufferFlags::CODECSIDEINFO));
    }

    chunks
}

/// A JPEG of the given size, split into buffer-sized chunks
///
/// The last chunk carries the frame-end flag.
pub fn jpeg_image(width: u32, height: u32, quality: u32, max_chunk: usize) -> Vec<Chunk> {
    let image = RgbImage::from_fn(width.max(1), height.max(1), |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
    });

    let mut encoded = Vec::new();
    let quality = quality.clamp(1, 100) as u8;
    if let Err(e) = image.write_with_encoder(JpegEncoder::new_with_quality(&mut encoded, quality)) {
        tracing::warn!(error = %e, "Synthetic JPEG encoding failed");
        encoded.clear();
    }

    split(&encoded, max_chunk, BufferFlags::FRAME_END)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_flags_last_chunk() {
        let chunks = split(&[1, 2, 3, 4, 5], 2, BufferFlags::FRAME_END);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].bytes, vec![5]);
        assert_eq!(chunks[0].flags, BufferFlags::empty());
        assert_eq!(chunks[2].flags, BufferFlags::FRAME_END);
    }

    #[test]
    fn test_raw_frame_padding() {
        let layout = FrameLayout::new(PreviewFormat::Rgb24, 4, 2);
        let frame = raw_frame(&layout, 0);
        assert_eq!(frame.len(), layout.padded_size());
        // First pixel of row 1, then padding after the visible row
        assert_eq!(&frame[96..99], &[0, 1, 1]);
        assert_eq!(frame[12], PAD_BYTE);
    }

    #[test]
    fn test_h264_header_and_side_info() {
        let first = h264_frame(0, 64, 32, 17_000_000, 65536);
        assert!(first[0].flags.contains(BufferFlags::CONFIG));
        assert!(first[0].bytes.starts_with(H264_SPS_PREFIX));

        let tenth = h264_frame(9, 64, 32, 17_000_000, 65536);
        let last = tenth.last().map(|c| c.flags).unwrap_or_default();
        assert!(last.contains(BufferFlags::CODECSIDEINFO));
    }

    #[test]
    fn test_jpeg_markers() {
        let chunks = jpeg_image(32, 16, 85, 512);
        let bytes: Vec<u8> = chunks.iter().flat_map(|c| c.bytes.clone()).collect();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        assert_eq!(&bytes[bytes.len() - 2..], &[0xFF, 0xD9]);
        assert!(chunks.last().is_some_and(|c| c.flags.contains(BufferFlags::FRAME_END)));
    }
}

// SPDX-License-Identifier: GPL-3.0-only
//! Packed preview frame to RGB conversion
//!
//! Used when a retrieved preview frame has to be written out as an image.
//! Input is always the packed layout produced by
//! [`FrameLayout::pack`](super::layout::FrameLayout::pack).

use super::layout::PreviewFormat;

/// Convert a packed preview frame of any [`PreviewFormat`] to RGB
pub fn to_rgb(format: PreviewFormat, data: &[u8], width: u32, height: u32) -> Vec<u8> {
    match format {
        PreviewFormat::Rgb24 => data.to_vec(),
        PreviewFormat::Bgr24 => bgr_to_rgb(data),
        PreviewFormat::I420 => i420_to_rgb(data, width, height),
    }
}

/// Swap the red and blue channels of packed BGR
pub fn bgr_to_rgb(bgr: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(bgr.len());
    for chunk in bgr.chunks_exact(3) {
        rgb.push(chunk[2]);
        rgb.push(chunk[1]);
        rgb.push(chunk[0]);
    }
    rgb
}

/// Convert packed I420 (Y plane, then U, then V) to RGB
///
/// Uses BT.601 coefficients. Chroma is sampled once per 2x2 block.
pub fn i420_to_rgb(data: &[u8], width: u32, height: u32) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;
    let cw = w.div_ceil(2);
    let ch = h.div_ceil(2);
    let u_offset = w * h;
    let v_offset = u_offset + cw * ch;

    let mut rgb = Vec::with_capacity(w * h * 3);
    if data.len() < v_offset + cw * ch {
        return rgb;
    }

    for row in 0..h {
        for col in 0..w {
            let y = data[row * w + col] as f32;
            let chroma = (row / 2) * cw + col / 2;
            let u = data[u_offset + chroma] as f32 - 128.0;
            let v = data[v_offset + chroma] as f32 - 128.0;

            rgb.push((y + 1.402 * v).clamp(0.0, 255.0) as u8);
            rgb.push((y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8);
            rgb.push((y + 1.772 * u).clamp(0.0, 255.0) as u8);
        }
    }

    rgb
}

// SPDX-License-Identifier: GPL-3.0-only

//! Frame layout and pixel conversion utilities
//!
//! Hardware ports deliver raw frames with padded rows and planes. The
//! pipeline hands them to the host tightly packed:
//!
//! - [`layout`]: padded/packed geometry of preview frames and de-padding
//! - [`convert`]: packed preview frames to RGB for image export

pub mod convert;
pub mod layout;

pub use layout::{FrameLayout, PreviewFormat};

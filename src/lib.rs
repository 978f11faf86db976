// SPDX-License-Identifier: GPL-3.0-only

//! Camera media pipeline on a stage/port/connection hardware API
//!
//! The crate builds, wires and tears down a graph of fixed-function
//! stages (camera, splitter, resizer, H.264 and JPEG encoders) and turns
//! their callback-driven buffer delivery into blocking, one-frame-at-a-time
//! calls.
//!
//! # Architecture
//!
//! - [`backends`]: the hardware trait and its simulated implementation
//! - [`pipeline`]: stages, connections, pools, rendezvous and the
//!   [`CameraPipeline`] state machine
//! - [`media`]: preview frame layouts and colour conversion
//! - [`config`]: persisted pipeline configuration
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mmal_camera::{CameraPipeline, PipelineConfig, SimulatedHardware};
//!
//! let hal = Arc::new(SimulatedHardware::new());
//! let mut pipeline = CameraPipeline::new(hal, PipelineConfig::default())?;
//! pipeline.start_video_preview()?;
//! pipeline.grab()?;
//! let frame = pipeline.retrieve_frame();
//! # Ok::<(), mmal_camera::PipelineError>(())
//! ```

pub mod backends;
pub mod config;
pub mod constants;
pub mod errors;
pub mod media;
pub mod pipeline;

// Re-export commonly used types
pub use backends::mmal::MmalHal;
pub use backends::simulated::{FailPoint, SimulatedHardware};
pub use config::{FrameSize, PipelineConfig};
pub use errors::{PipelineError, PipelineResult, StateViolation};
pub use media::PreviewFormat;
pub use pipeline::{
    CameraParameters, CameraPipeline, EncodedSink, FileSink, FrameSource, MemorySink,
    SessionState,
};

// SPDX-License-Identifier: GPL-3.0-only

//! Hardware layer
//!
//! ```text
//! ┌─────────────────────────────┐
//! │       CameraPipeline        │
//! └──────────────┬──────────────┘
//!                │ Arc<dyn MmalHal>
//! ┌──────────────┴──────────────┐
//! │   mmal: trait + data types  │
//! │  ┌───────────────────────┐  │
//! │  │   SimulatedHardware   │  │
//! │  └───────────────────────┘  │
//! └─────────────────────────────┘
//! ```
//!
//! Pipeline code only ever talks to [`mmal::MmalHal`].

pub mod mmal;
pub mod simulated;

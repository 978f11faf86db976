// SPDX-License-Identifier: GPL-3.0-only

//! Error types for the camera pipeline

use crate::backends::mmal::{ComponentKind, HalError};
use std::fmt;
use tracing::error;

/// Result type alias using PipelineError
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Main pipeline error type
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// A hardware step failed while building a stage or branch
    Construction {
        stage: ComponentKind,
        step: ConstructionStep,
        source: HalError,
    },
    /// Operation not allowed in the current session state
    InvalidState(StateViolation),
    /// Camera hardware is owned by another pipeline
    Busy,
    /// Destination buffer cannot hold a packed frame
    BufferTooSmall { needed: usize, got: usize },
    /// Encoded output could not be written
    Io(String),
    /// Configuration could not be loaded or saved
    Config(String),
}

/// Step of stage construction that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstructionStep {
    Create,
    MissingPorts,
    CommitFormat,
    ConfigureBuffers,
    CreatePool,
    Connect,
    EnablePort,
    EnableComponent,
    SetParameter,
    PrimeBuffers,
}

/// Session state rule an operation would break
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateViolation {
    /// Camera is already open
    AlreadyOpen,
    /// Camera is not open
    NotOpen,
    /// No video or still preview is running
    NoActivePreview,
    /// Video preview or recording is running
    VideoGraphActive,
    /// Still preview is running
    StillGraphActive,
    /// A capture was interrupted by teardown
    CaptureAborted,
}

impl PipelineError {
    /// Build a construction error and log it where it happened
    pub fn construction(stage: ComponentKind, step: ConstructionStep, source: HalError) -> Self {
        error!(stage = %stage, step = %step, error = %source, "Stage construction failed");
        PipelineError::Construction {
            stage,
            step,
            source,
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Construction {
                stage,
                step,
                source,
            } => write!(f, "Failed to {} for {}: {}", step, stage, source),
            PipelineError::InvalidState(v) => write!(f, "Invalid state: {}", v),
            PipelineError::Busy => write!(f, "Camera is busy"),
            PipelineError::BufferTooSmall { needed, got } => write!(
                f,
                "Buffer too small: need {} bytes, got {}",
                needed, got
            ),
            PipelineError::Io(msg) => write!(f, "I/O error: {}", msg),
            PipelineError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl fmt::Display for ConstructionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            ConstructionStep::Create => "create component",
            ConstructionStep::MissingPorts => "find ports",
            ConstructionStep::CommitFormat => "commit format",
            ConstructionStep::ConfigureBuffers => "configure buffers",
            ConstructionStep::CreatePool => "create buffer pool",
            ConstructionStep::Connect => "connect",
            ConstructionStep::EnablePort => "enable port",
            ConstructionStep::EnableComponent => "enable component",
            ConstructionStep::SetParameter => "set parameter",
            ConstructionStep::PrimeBuffers => "prime buffers",
        };
        write!(f, "{}", step)
    }
}

impl fmt::Display for StateViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateViolation::AlreadyOpen => write!(f, "camera already open"),
            StateViolation::NotOpen => write!(f, "camera not open"),
            StateViolation::NoActivePreview => write!(f, "no preview running"),
            StateViolation::VideoGraphActive => write!(f, "video graph is active"),
            StateViolation::StillGraphActive => write!(f, "still preview is active"),
            StateViolation::CaptureAborted => write!(f, "capture aborted"),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Construction { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<StateViolation> for PipelineError {
    fn from(v: StateViolation) -> Self {
        PipelineError::InvalidState(v)
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Config(err.to_string())
    }
}

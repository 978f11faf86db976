// SPDX-License-Identifier: GPL-3.0-only

//! Stage lifecycle
//!
//! A [`Stage`] wraps one hardware component from creation to destruction.
//! Dropping it disables and destroys the component, so a half-built
//! branch unwinds simply by letting its locals go out of scope.

use crate::backends::mmal::{
    BufferConfig, BufferRequirements, ComponentInfo, ComponentKind, Encoding, EsFormat, MmalHal,
    Parameter, PortCallback, PortId, Rational, Rect,
};
use crate::constants::{align_up, hardware};
use crate::errors::{ConstructionStep, PipelineError, PipelineResult};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How many buffers a port should run with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferPolicy {
    /// Port's recommendation, raised to its minimum
    Recommended,
    /// As `Recommended`, but never below the streaming floor
    Streaming,
}

impl BufferPolicy {
    /// Resolve a port's requirements into an actual configuration
    pub fn resolve(&self, requirements: &BufferRequirements) -> BufferConfig {
        let mut num = requirements.num_recommended.max(requirements.num_min);
        if *self == BufferPolicy::Streaming {
            num = num.max(hardware::STREAMING_BUFFER_FLOOR);
        }
        let size = requirements.size_recommended.max(requirements.size_min);
        BufferConfig { num, size }
    }
}

/// Requested shape of a port format
///
/// Applied on top of an existing format, so fields not named here (for
/// example the opaque variant of an inherited format) are carried over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatSpec {
    pub encoding: Encoding,
    pub encoding_variant: Option<Encoding>,
    pub width: u32,
    pub height: u32,
    pub frame_rate: Rational,
    pub bitrate: u32,
}

impl FormatSpec {
    pub fn new(encoding: Encoding, width: u32, height: u32) -> Self {
        Self {
            encoding,
            encoding_variant: None,
            width,
            height,
            frame_rate: Rational::new(0, 1),
            bitrate: 0,
        }
    }

    pub fn variant(mut self, variant: Encoding) -> Self {
        self.encoding_variant = Some(variant);
        self
    }

    pub fn frame_rate(mut self, frame_rate: Rational) -> Self {
        self.frame_rate = frame_rate;
        self
    }

    pub fn bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = bitrate;
        self
    }

    /// Build the committed format from `base`
    ///
    /// Padded encodings get their width aligned to 32 and height to 16;
    /// the crop always covers exactly the requested size.
    pub fn apply(&self, base: &EsFormat) -> EsFormat {
        let (width, height) = if self.encoding.requires_alignment() {
            (
                align_up(self.width, hardware::WIDTH_ALIGNMENT),
                align_up(self.height, hardware::HEIGHT_ALIGNMENT),
            )
        } else {
            (self.width, self.height)
        };
        EsFormat {
            encoding: self.encoding,
            encoding_variant: self.encoding_variant,
            width,
            height,
            crop: Rect::sized(self.width, self.height),
            frame_rate: self.frame_rate,
            bitrate: if self.encoding.is_compressed() {
                self.bitrate
            } else {
                base.bitrate
            },
        }
    }
}

/// One live hardware component
pub struct Stage {
    hal: Arc<dyn MmalHal>,
    info: ComponentInfo,
}

impl Stage {
    /// Create a component and check it has at least the ports the caller needs
    pub fn create(
        hal: &Arc<dyn MmalHal>,
        kind: ComponentKind,
        inputs: u8,
        outputs: u8,
    ) -> PipelineResult<Self> {
        let info = hal
            .component_create(kind)
            .map_err(|e| PipelineError::construction(kind, ConstructionStep::Create, e))?;

        let stage = Self {
            hal: Arc::clone(hal),
            info,
        };
        if info.inputs < inputs || info.outputs < outputs {
            return Err(PipelineError::construction(
                kind,
                ConstructionStep::MissingPorts,
                crate::backends::mmal::HalError::InvalidArgument(format!(
                    "{} has {} inputs and {} outputs",
                    kind, info.inputs, info.outputs
                )),
            ));
        }

        debug!(stage = %kind, name = kind.hardware_name(), "Stage created");
        Ok(stage)
    }

    pub fn hal(&self) -> &Arc<dyn MmalHal> {
        &self.hal
    }

    fn missing(&self, what: &str) -> PipelineError {
        PipelineError::construction(
            self.info.kind,
            ConstructionStep::MissingPorts,
            crate::backends::mmal::HalError::NotFound(what.to_string()),
        )
    }

    pub fn input(&self, index: u8) -> PipelineResult<PortId> {
        self.info
            .input(index)
            .ok_or_else(|| self.missing(&format!("input {}", index)))
    }

    pub fn output(&self, index: u8) -> PipelineResult<PortId> {
        self.info
            .output(index)
            .ok_or_else(|| self.missing(&format!("output {}", index)))
    }

    pub fn control(&self) -> PortId {
        self.info.control()
    }

    pub fn is_enabled(&self) -> bool {
        self.hal.component_is_enabled(self.info.id)
    }

    pub fn enable(&self) -> PipelineResult<()> {
        self.hal.component_enable(self.info.id).map_err(|e| {
            PipelineError::construction(self.info.kind, ConstructionStep::EnableComponent, e)
        })
    }

    pub fn format(&self, port: PortId) -> PipelineResult<EsFormat> {
        self.hal.port_format(port).map_err(|e| {
            PipelineError::construction(self.info.kind, ConstructionStep::CommitFormat, e)
        })
    }

    /// Commit `spec` on top of the port's current format
    pub fn commit(&self, port: PortId, spec: &FormatSpec) -> PipelineResult<EsFormat> {
        let format = spec.apply(&self.format(port)?);
        self.commit_format(port, &format)?;
        Ok(format)
    }

    pub fn commit_format(&self, port: PortId, format: &EsFormat) -> PipelineResult<()> {
        self.hal.port_format_commit(port, format).map_err(|e| {
            PipelineError::construction(self.info.kind, ConstructionStep::CommitFormat, e)
        })
    }

    /// Copy the format of `upstream` onto `port` and commit it
    pub fn inherit(&self, upstream: PortId, port: PortId) -> PipelineResult<EsFormat> {
        let format = self.format(upstream)?;
        self.commit_format(port, &format)?;
        Ok(format)
    }

    /// Size the port's buffers according to `policy`
    pub fn configure_buffers(&self, port: PortId, policy: BufferPolicy) -> PipelineResult<BufferConfig> {
        let step = |e| PipelineError::construction(self.info.kind, ConstructionStep::ConfigureBuffers, e);
        let requirements = self.hal.port_buffer_requirements(port).map_err(step)?;
        let config = policy.resolve(&requirements);
        self.hal.port_set_buffers(port, config).map_err(step)?;
        debug!(port = %port, num = config.num, size = config.size, "Buffers configured");
        Ok(config)
    }

    pub fn set_parameter(&self, port: PortId, parameter: &Parameter) -> PipelineResult<()> {
        self.hal.port_parameter_set(port, parameter).map_err(|e| {
            PipelineError::construction(self.info.kind, ConstructionStep::SetParameter, e)
        })
    }
}

impl Drop for Stage {
    fn drop(&mut self) {
        let kind = self.info.kind;
        if self.hal.component_is_enabled(self.info.id)
            && let Err(e) = self.hal.component_disable(self.info.id)
        {
            warn!(stage = %kind, error = %e, "Failed to disable stage");
        }
        match self.hal.component_destroy(self.info.id) {
            Ok(()) => info!(stage = %kind, "Stage destroyed"),
            Err(e) => warn!(stage = %kind, error = %e, "Failed to destroy stage"),
        }
    }
}

/// Output port enabled with a host callback
///
/// Disabled again on drop, which returns the port's queued buffers to
/// their pool through the callback.
pub struct CallbackPort {
    hal: Arc<dyn MmalHal>,
    port: PortId,
}

impl CallbackPort {
    pub fn enable(
        hal: &Arc<dyn MmalHal>,
        stage: ComponentKind,
        port: PortId,
        callback: PortCallback,
    ) -> PipelineResult<Self> {
        hal.port_enable(port, callback)
            .map_err(|e| PipelineError::construction(stage, ConstructionStep::EnablePort, e))?;
        Ok(Self {
            hal: Arc::clone(hal),
            port,
        })
    }
}

impl Drop for CallbackPort {
    fn drop(&mut self) {
        if self.hal.port_is_enabled(self.port)
            && let Err(e) = self.hal.port_disable(self.port)
        {
            warn!(port = %self.port, error = %e, "Failed to disable port");
        }
    }
}

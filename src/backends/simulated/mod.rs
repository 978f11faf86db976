// SPDX-License-Identifier: GPL-3.0-only

//! Software model of the camera media stack
//!
//! [`SimulatedHardware`] implements [`MmalHal`] without firmware. It keeps
//! the rules a real stack enforces (format alignment, disabled ports for
//! commits, disable-before-destroy) and produces output on delivery
//! threads only while the graph feeding a port is live:
//!
//! - camera output 0 streams whenever the camera is enabled
//! - camera output 1 streams while its capture flag is set
//! - camera output 2 produces one frame per capture trigger
//! - every other output streams while its component is enabled and its
//!   input is tunnelled to a live output
//!
//! Failures can be injected per step with [`FailPoint`], and the
//! inspection helpers report what is still alive so tests can check
//! teardown.

pub mod delivery;
pub mod synth;

pub use delivery::{DeliveryLoop, LoopAction};

use crate::backends::mmal::{
    BufferConfig, BufferFlags, BufferHeader, BufferRequirements, ComponentId, ComponentInfo, ComponentKind,
    ConnectionId, EsFormat, Encoding, HalError, HalResult, MmalHal, Parameter, ParameterId,
    PoolId, PortCallback, PortDirection, PortId, Rational, Rect,
};
use crate::constants::{align_up, defaults, hardware, timing};
use crate::media::layout::{FrameLayout, PreviewFormat};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use synth::Chunk;
use tracing::{debug, info, warn};

/// Hardware step that can be forced to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    ComponentCreate(ComponentKind),
    ComponentEnable(ComponentKind),
    FormatCommit(ComponentKind),
    PoolCreate(ComponentKind),
    PortEnable(ComponentKind),
    ConnectionCreate,
    ConnectionEnable,
    ParameterSet(ParameterId),
    /// Spawning the delivery thread of an output port
    DeliveryThread,
}

/// Upstream origin of a live output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    /// Continuous stream
    Stream,
    /// One frame per trigger on the given camera port
    Still(PortId),
}

struct SimPort {
    format: EsFormat,
    committed: bool,
    requirements: BufferRequirements,
    buffers: BufferConfig,
    /// Enabled with a host callback
    enabled: bool,
    /// Enabled through a tunnelled connection
    tunnelled: bool,
    callback: Option<PortCallback>,
    held: VecDeque<BufferHeader>,
    pending: VecDeque<Chunk>,
    delivery: Option<DeliveryLoop>,
    capture: bool,
    produced: u64,
}

impl SimPort {
    fn new(format: EsFormat, committed: bool) -> Self {
        Self {
            format,
            committed,
            requirements: BufferRequirements::default(),
            buffers: BufferConfig::default(),
            enabled: false,
            tunnelled: false,
            callback: None,
            held: VecDeque::new(),
            pending: VecDeque::new(),
            delivery: None,
            capture: false,
            produced: 0,
        }
    }

    fn chunk_size(&self) -> usize {
        let size = if self.buffers.size > 0 {
            self.buffers.size
        } else {
            self.requirements.size_recommended
        };
        size.max(1) as usize
    }
}

struct SimComponent {
    kind: ComponentKind,
    enabled: bool,
    control: SimPort,
    inputs: Vec<SimPort>,
    outputs: Vec<SimPort>,
}

struct SimConnection {
    output: PortId,
    input: PortId,
    enabled: bool,
}

struct SimPool {
    port: PortId,
    count: u32,
}

/// Output to render outside the state lock
enum Job {
    Raw { layout: FrameLayout, seq: u64, max_chunk: usize },
    Opaque { max_chunk: usize },
    H264 { seq: u64, width: u32, height: u32, bitrate: u32, max_chunk: usize },
    Jpeg { width: u32, height: u32, quality: u32, max_chunk: usize },
}

impl Job {
    fn render(self) -> Vec<Chunk> {
        match self {
            Job::Raw { layout, seq, max_chunk } => synth::split(
                &synth::raw_frame(&layout, seq),
                max_chunk,
                BufferFlags::FRAME_END,
            ),
            Job::Opaque { max_chunk } => synth::split(
                &[0u8; hardware::OPAQUE_BUFFER_SIZE as usize],
                max_chunk,
                BufferFlags::FRAME_END,
            ),
            Job::H264 { seq, width, height, bitrate, max_chunk } => {
                synth::h264_frame(seq, width, height, bitrate, max_chunk)
            }
            Job::Jpeg { width, height, quality, max_chunk } => {
                synth::jpeg_image(width, height, quality, max_chunk)
            }
        }
    }
}

#[derive(Default)]
struct SimState {
    claimed: bool,
    next_handle: u32,
    components_created: usize,
    components: HashMap<ComponentId, SimComponent>,
    connections: HashMap<ConnectionId, SimConnection>,
    pools: HashMap<PoolId, SimPool>,
    parameter_log: Vec<(ComponentKind, PortId, Parameter)>,
    failures: HashSet<FailPoint>,
    leaked_buffers: usize,
}

impl SimState {
    fn handle(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    fn check(&self, point: FailPoint) -> HalResult<()> {
        if self.failures.contains(&point) {
            debug!(?point, "Injecting failure");
            return Err(HalError::Injected(format!("{:?}", point)));
        }
        Ok(())
    }

    fn component(&self, id: ComponentId) -> HalResult<&SimComponent> {
        self.components
            .get(&id)
            .ok_or_else(|| HalError::NotFound(format!("component {}", id.0)))
    }

    fn component_mut(&mut self, id: ComponentId) -> HalResult<&mut SimComponent> {
        self.components
            .get_mut(&id)
            .ok_or_else(|| HalError::NotFound(format!("component {}", id.0)))
    }

    fn port(&self, id: PortId) -> HalResult<&SimPort> {
        let component = self.component(id.component)?;
        let port = match id.direction {
            PortDirection::Control => Some(&component.control),
            PortDirection::Input => component.inputs.get(id.index as usize),
            PortDirection::Output => component.outputs.get(id.index as usize),
        };
        port.ok_or_else(|| HalError::NotFound(format!("port {}", id)))
    }

    fn port_mut(&mut self, id: PortId) -> HalResult<&mut SimPort> {
        let component = self.component_mut(id.component)?;
        let port = match id.direction {
            PortDirection::Control => Some(&mut component.control),
            PortDirection::Input => component.inputs.get_mut(id.index as usize),
            PortDirection::Output => component.outputs.get_mut(id.index as usize),
        };
        port.ok_or_else(|| HalError::NotFound(format!("port {}", id)))
    }

    fn kind_of(&self, id: PortId) -> HalResult<ComponentKind> {
        Ok(self.component(id.component)?.kind)
    }

    /// Whether an output currently has data flowing into it
    fn output_source(&self, output: PortId) -> Option<Source> {
        let component = self.components.get(&output.component)?;
        if !component.enabled {
            return None;
        }
        match component.kind {
            ComponentKind::Camera => {
                let port = component.outputs.get(output.index as usize)?;
                match output.index {
                    hardware::CAMERA_PREVIEW_PORT => Some(Source::Stream),
                    hardware::CAMERA_VIDEO_PORT if port.capture => Some(Source::Stream),
                    hardware::CAMERA_CAPTURE_PORT if port.capture => Some(Source::Still(output)),
                    _ => None,
                }
            }
            _ => self.input_source(PortId::input(output.component, 0)),
        }
    }

    fn input_source(&self, input: PortId) -> Option<Source> {
        let connection = self
            .connections
            .values()
            .find(|c| c.enabled && c.input == input)?;
        self.output_source(connection.output)
    }

    /// Decide what an output should produce next, consuming still triggers
    fn plan(&mut self, output: PortId) -> Option<Job> {
        let source = self.output_source(output)?;
        let component = self.components.get(&output.component)?;
        let port = component.outputs.get(output.index as usize)?;
        let max_chunk = port.chunk_size();
        let seq = port.produced;
        let crop = port.format.crop;

        let job = match (component.kind, port.format.encoding) {
            (ComponentKind::ImageEncoder, Encoding::Jpeg) => {
                if !matches!(source, Source::Still(_)) {
                    return None;
                }
                let quality = self
                    .parameter_log
                    .iter()
                    .rev()
                    .find_map(|(_, p, param)| match param {
                        Parameter::JpegQuality(q) if *p == output => Some(*q),
                        _ => None,
                    })
                    .unwrap_or(defaults::JPEG_QUALITY);
                Job::Jpeg {
                    width: crop.width,
                    height: crop.height,
                    quality,
                    max_chunk,
                }
            }
            (ComponentKind::VideoEncoder, Encoding::H264) => Job::H264 {
                seq,
                width: crop.width,
                height: crop.height,
                bitrate: port.format.bitrate,
                max_chunk,
            },
            (_, Encoding::Opaque) => Job::Opaque { max_chunk },
            (_, encoding) => Job::Raw {
                layout: FrameLayout::new(
                    PreviewFormat::from_encoding(encoding)?,
                    crop.width,
                    crop.height,
                ),
                seq,
                max_chunk,
            },
        };

        if let Source::Still(trigger) = source
            && let Ok(port) = self.port_mut(trigger)
        {
            port.capture = false;
        }
        if let Ok(port) = self.port_mut(output) {
            port.produced += 1;
        }
        Some(job)
    }
}

struct Shared {
    state: Mutex<SimState>,
    frame_interval: Duration,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// One delivery iteration for a callback port
    fn deliver(&self, output: PortId) -> LoopAction {
        let job = {
            let mut state = self.lock();
            let idle = match state.port(output) {
                Ok(port) if port.enabled && port.callback.is_some() => {
                    port.pending.is_empty() && !port.held.is_empty()
                }
                _ => return LoopAction::Stop,
            };
            if idle { state.plan(output) } else { None }
        };

        let chunks = job.map(Job::render);

        let (callback, filled) = {
            let mut state = self.lock();
            let Ok(port) = state.port_mut(output) else {
                return LoopAction::Stop;
            };
            if !port.enabled {
                return LoopAction::Stop;
            }
            let Some(callback) = port.callback.clone() else {
                return LoopAction::Stop;
            };
            if let Some(chunks) = chunks {
                port.pending.extend(chunks);
            }

            let pts = port.produced * self.frame_interval.as_micros() as u64;
            let mut filled = Vec::new();
            while !port.pending.is_empty() && !port.held.is_empty() {
                let (Some(chunk), Some(mut buffer)) = (port.pending.pop_front(), port.held.pop_front())
                else {
                    break;
                };
                buffer.fill(&chunk.bytes);
                buffer.set_flags(chunk.flags);
                buffer.set_pts(Some(pts));
                filled.push(buffer);
            }
            (callback, filled)
        };

        for buffer in filled {
            callback(buffer);
        }
        LoopAction::Continue
    }
}

/// In-process stand-in for the camera media stack
pub struct SimulatedHardware {
    shared: Arc<Shared>,
}

impl Default for SimulatedHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedHardware {
    pub fn new() -> Self {
        Self::with_frame_interval(timing::SIMULATED_FRAME_INTERVAL)
    }

    /// Simulator whose sensor delivers one frame per `interval`
    pub fn with_frame_interval(interval: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SimState::default()),
                frame_interval: interval,
            }),
        }
    }

    /// Make every future attempt of `point` fail
    pub fn fail_on(&self, point: FailPoint) {
        self.shared.lock().failures.insert(point);
    }

    pub fn clear_failures(&self) {
        self.shared.lock().failures.clear();
    }

    pub fn is_claimed(&self) -> bool {
        self.shared.lock().claimed
    }

    /// Kinds of all live components, in creation order
    pub fn live_components(&self) -> Vec<ComponentKind> {
        let state = self.shared.lock();
        let mut live: Vec<_> = state.components.iter().map(|(id, c)| (*id, c.kind)).collect();
        live.sort_by_key(|(id, _)| *id);
        live.into_iter().map(|(_, kind)| kind).collect()
    }

    pub fn count_components(&self, kind: ComponentKind) -> usize {
        let state = self.shared.lock();
        state.components.values().filter(|c| c.kind == kind).count()
    }

    /// Components created over the simulator's lifetime
    pub fn components_created(&self) -> usize {
        self.shared.lock().components_created
    }

    pub fn live_connections(&self) -> usize {
        self.shared.lock().connections.len()
    }

    pub fn live_pools(&self) -> usize {
        self.shared.lock().pools.len()
    }

    /// Output ports currently enabled with a host callback
    pub fn enabled_callback_ports(&self) -> usize {
        let state = self.shared.lock();
        state
            .components
            .values()
            .flat_map(|c| c.outputs.iter())
            .filter(|p| p.enabled)
            .count()
    }

    /// Buffers that were not returned when their pool was destroyed
    pub fn leaked_buffers(&self) -> usize {
        self.shared.lock().leaked_buffers
    }

    /// Every parameter set on components of `kind`, oldest first
    pub fn parameter_history(&self, kind: ComponentKind) -> Vec<(PortId, Parameter)> {
        let state = self.shared.lock();
        state
            .parameter_log
            .iter()
            .filter(|(k, _, _)| *k == kind)
            .map(|(_, port, param)| (*port, *param))
            .collect()
    }

    /// Most recent value of a parameter on components of `kind`
    pub fn latest_parameter(&self, kind: ComponentKind, id: ParameterId) -> Option<Parameter> {
        let state = self.shared.lock();
        state
            .parameter_log
            .iter()
            .rev()
            .find(|(k, _, param)| *k == kind && param.id() == id)
            .map(|(_, _, param)| *param)
    }

    /// Format of an output port on the oldest live component of `kind`
    pub fn output_format(&self, kind: ComponentKind, index: u8) -> Option<EsFormat> {
        let state = self.shared.lock();
        let id = state
            .components
            .iter()
            .filter(|(_, c)| c.kind == kind)
            .map(|(id, _)| *id)
            .min()?;
        state.port(PortId::output(id, index)).ok().map(|p| p.format)
    }

    fn port_layout(kind: ComponentKind) -> (u8, u8) {
        match kind {
            ComponentKind::Camera => (0, 3),
            ComponentKind::Splitter => (1, 2),
            ComponentKind::Resizer | ComponentKind::VideoEncoder | ComponentKind::ImageEncoder => {
                (1, 1)
            }
        }
    }

    /// Formats a freshly created camera reports on its outputs
    fn camera_default_format(index: u8) -> EsFormat {
        let (width, height) = if index == hardware::CAMERA_CAPTURE_PORT {
            (hardware::MAX_PHOTO_WIDTH, hardware::MAX_PHOTO_HEIGHT)
        } else {
            (hardware::MAX_VIDEO_WIDTH, hardware::MAX_VIDEO_HEIGHT)
        };
        EsFormat {
            encoding: Encoding::Opaque,
            encoding_variant: Some(Encoding::I420),
            width: align_up(width, hardware::WIDTH_ALIGNMENT),
            height: align_up(height, hardware::HEIGHT_ALIGNMENT),
            crop: Rect::sized(width, height),
            frame_rate: Rational::new(defaults::FRAMERATE as i32, 1),
            bitrate: 0,
        }
    }

    fn max_size(kind: ComponentKind, port: PortId) -> (u32, u32) {
        let (w, h) = match (kind, port.direction, port.index) {
            (ComponentKind::Camera, PortDirection::Output, hardware::CAMERA_CAPTURE_PORT)
            | (ComponentKind::ImageEncoder, _, _) => {
                (hardware::MAX_PHOTO_WIDTH, hardware::MAX_PHOTO_HEIGHT)
            }
            (ComponentKind::Camera, _, _) => (hardware::MAX_VIDEO_WIDTH, hardware::MAX_VIDEO_HEIGHT),
            _ => (hardware::MAX_PHOTO_WIDTH, hardware::MAX_PHOTO_HEIGHT),
        };
        (
            align_up(w, hardware::WIDTH_ALIGNMENT),
            align_up(h, hardware::HEIGHT_ALIGNMENT),
        )
    }

    fn encoding_allowed(kind: ComponentKind, direction: PortDirection, encoding: Encoding) -> bool {
        let raw_or_opaque = encoding.is_raw() || encoding == Encoding::Opaque;
        match (kind, direction) {
            (_, PortDirection::Control) => false,
            (ComponentKind::Resizer, PortDirection::Output) => encoding.is_raw(),
            (ComponentKind::VideoEncoder, PortDirection::Output) => encoding == Encoding::H264,
            (ComponentKind::ImageEncoder, PortDirection::Output) => encoding == Encoding::Jpeg,
            _ => raw_or_opaque,
        }
    }

    fn requirements_for(kind: ComponentKind, direction: PortDirection, format: &EsFormat) -> BufferRequirements {
        let frame_size = |encoding: Encoding| {
            PreviewFormat::from_encoding(encoding)
                .map(|f| FrameLayout::new(f, format.crop.width, format.crop.height).padded_size() as u32)
                .unwrap_or(hardware::OPAQUE_BUFFER_SIZE)
        };
        let (size_min, size_recommended) = match format.encoding {
            Encoding::H264 => (65536, 65536),
            Encoding::Jpeg => (16384, 81920),
            Encoding::Opaque => (hardware::OPAQUE_BUFFER_SIZE, hardware::OPAQUE_BUFFER_SIZE),
            raw => (frame_size(raw), frame_size(raw)),
        };
        let (num_min, num_recommended) = match (kind, direction) {
            (ComponentKind::VideoEncoder, PortDirection::Output) => (1, 2),
            (ComponentKind::ImageEncoder, PortDirection::Output) => (1, 3),
            (ComponentKind::Resizer, PortDirection::Output) => (1, 3),
            _ => (1, 1),
        };
        BufferRequirements {
            num_min,
            num_recommended,
            size_min,
            size_recommended,
        }
    }

    fn validate_format(kind: ComponentKind, port: PortId, format: &EsFormat) -> HalResult<()> {
        if !Self::encoding_allowed(kind, port.direction, format.encoding) {
            return Err(HalError::InvalidArgument(format!(
                "{} not supported on {} port {}",
                format.encoding, kind, port
            )));
        }
        if format.width == 0 || format.height == 0 {
            return Err(HalError::InvalidArgument("empty frame".into()));
        }
        if format.encoding.requires_alignment()
            && (format.width % hardware::WIDTH_ALIGNMENT != 0
                || format.height % hardware::HEIGHT_ALIGNMENT != 0)
        {
            return Err(HalError::InvalidArgument(format!(
                "{}x{} is not aligned",
                format.width, format.height
            )));
        }
        let crop = format.crop;
        if crop.width == 0
            || crop.height == 0
            || crop.x + crop.width > format.width
            || crop.y + crop.height > format.height
        {
            return Err(HalError::InvalidArgument("crop outside frame".into()));
        }
        let (max_w, max_h) = Self::max_size(kind, port);
        if format.width > max_w || format.height > max_h {
            return Err(HalError::InvalidArgument(format!(
                "{}x{} exceeds {}x{}",
                format.width, format.height, max_w, max_h
            )));
        }
        Ok(())
    }
}

impl Drop for SimulatedHardware {
    fn drop(&mut self) {
        let enabled: Vec<PortId> = {
            let state = self.shared.lock();
            state
                .components
                .iter()
                .flat_map(|(id, c)| {
                    c.outputs
                        .iter()
                        .enumerate()
                        .filter(|(_, p)| p.enabled)
                        .map(move |(i, _)| PortId::output(*id, i as u8))
                })
                .collect()
        };
        for port in enabled {
            let _ = self.port_disable(port);
        }
    }
}

impl MmalHal for SimulatedHardware {
    fn claim(&self) -> HalResult<()> {
        let mut state = self.shared.lock();
        if state.claimed {
            return Err(HalError::Busy);
        }
        state.claimed = true;
        Ok(())
    }

    fn unclaim(&self) {
        self.shared.lock().claimed = false;
    }

    fn component_create(&self, kind: ComponentKind) -> HalResult<ComponentInfo> {
        let mut state = self.shared.lock();
        state.check(FailPoint::ComponentCreate(kind))?;

        let id = ComponentId(state.handle());
        let (inputs, outputs) = Self::port_layout(kind);
        let component = SimComponent {
            kind,
            enabled: false,
            control: SimPort::new(EsFormat::default(), false),
            inputs: (0..inputs)
                .map(|_| SimPort::new(EsFormat::default(), false))
                .collect(),
            outputs: (0..outputs)
                .map(|i| match kind {
                    ComponentKind::Camera => {
                        let format = Self::camera_default_format(i);
                        let mut port = SimPort::new(format, true);
                        port.requirements =
                            Self::requirements_for(kind, PortDirection::Output, &format);
                        port
                    }
                    _ => SimPort::new(EsFormat::default(), false),
                })
                .collect(),
        };
        state.components.insert(id, component);
        state.components_created += 1;

        debug!(component = %kind, name = kind.hardware_name(), id = id.0, "Component created");
        Ok(ComponentInfo {
            id,
            kind,
            inputs,
            outputs,
        })
    }

    fn component_enable(&self, id: ComponentId) -> HalResult<()> {
        let mut state = self.shared.lock();
        let kind = state.component(id)?.kind;
        state.check(FailPoint::ComponentEnable(kind))?;
        state.component_mut(id)?.enabled = true;
        Ok(())
    }

    fn component_disable(&self, id: ComponentId) -> HalResult<()> {
        let mut state = self.shared.lock();
        state.component_mut(id)?.enabled = false;
        Ok(())
    }

    fn component_destroy(&self, id: ComponentId) -> HalResult<()> {
        let mut state = self.shared.lock();
        let component = state.component(id)?;
        if component.outputs.iter().any(|p| p.enabled) {
            return Err(HalError::InvalidState("port still enabled".into()));
        }
        if state
            .connections
            .values()
            .any(|c| c.output.component == id || c.input.component == id)
        {
            return Err(HalError::InvalidState("port still connected".into()));
        }
        if state.pools.values().any(|p| p.port.component == id) {
            return Err(HalError::InvalidState("pool still allocated".into()));
        }
        if let Some(component) = state.components.remove(&id) {
            debug!(component = %component.kind, id = id.0, "Component destroyed");
        }
        Ok(())
    }

    fn component_is_enabled(&self, id: ComponentId) -> bool {
        self.shared
            .lock()
            .component(id)
            .map(|c| c.enabled)
            .unwrap_or(false)
    }

    fn port_format(&self, port: PortId) -> HalResult<EsFormat> {
        Ok(self.shared.lock().port(port)?.format)
    }

    fn port_format_commit(&self, port: PortId, format: &EsFormat) -> HalResult<()> {
        let mut state = self.shared.lock();
        let kind = state.kind_of(port)?;
        state.check(FailPoint::FormatCommit(kind))?;

        let current = state.port(port)?;
        if current.enabled || current.tunnelled {
            return Err(HalError::InvalidState(format!("port {} is enabled", port)));
        }
        Self::validate_format(kind, port, format)?;

        let requirements = Self::requirements_for(kind, port.direction, format);
        let target = state.port_mut(port)?;
        target.format = *format;
        target.committed = true;
        target.requirements = requirements;
        target.buffers = BufferConfig::default();
        debug!(
            port = %port,
            encoding = %format.encoding,
            width = format.width,
            height = format.height,
            "Format committed"
        );
        Ok(())
    }

    fn port_buffer_requirements(&self, port: PortId) -> HalResult<BufferRequirements> {
        let state = self.shared.lock();
        let port = state.port(port)?;
        if !port.committed {
            return Err(HalError::InvalidState("format not committed".into()));
        }
        Ok(port.requirements)
    }

    fn port_set_buffers(&self, port: PortId, config: BufferConfig) -> HalResult<()> {
        let mut state = self.shared.lock();
        let target = state.port_mut(port)?;
        if config.num < target.requirements.num_min || config.size < target.requirements.size_min {
            return Err(HalError::InvalidArgument(format!(
                "{} x {} bytes below minimum {} x {}",
                config.num, config.size, target.requirements.num_min, target.requirements.size_min
            )));
        }
        target.buffers = config;
        Ok(())
    }

    fn port_enable(&self, port: PortId, callback: PortCallback) -> HalResult<()> {
        let mut state = self.shared.lock();
        let kind = state.kind_of(port)?;
        state.check(FailPoint::PortEnable(kind))?;

        if port.direction != PortDirection::Output {
            return Err(HalError::InvalidArgument(format!("{} is not an output", port)));
        }
        let target = state.port(port)?;
        if target.enabled {
            return Err(HalError::AlreadyEnabled);
        }
        if target.tunnelled {
            return Err(HalError::InvalidState(format!("{} is tunnelled", port)));
        }
        if !target.committed {
            return Err(HalError::InvalidState("format not committed".into()));
        }

        state.check(FailPoint::DeliveryThread)?;
        let shared = Arc::clone(&self.shared);
        let delivery = DeliveryLoop::start(
            &format!("sim-{}", port),
            self.shared.frame_interval,
            move || shared.deliver(port),
        )
        .map_err(|_| HalError::NoMemory)?;

        let target = state.port_mut(port)?;
        target.enabled = true;
        target.callback = Some(callback);
        target.delivery = Some(delivery);
        debug!(port = %port, component = %kind, "Port enabled");
        Ok(())
    }

    fn port_disable(&self, port: PortId) -> HalResult<()> {
        let (delivery, callback, held) = {
            let mut state = self.shared.lock();
            let target = state.port_mut(port)?;
            if !target.enabled {
                return Err(HalError::NotEnabled);
            }
            target.enabled = false;
            target.pending.clear();
            let held: Vec<BufferHeader> = target.held.drain(..).collect();
            (target.delivery.take(), target.callback.take(), held)
        };

        if let Some(mut delivery) = delivery {
            delivery.stop();
        }

        // Flush buffers the port still held back to their owner
        if let Some(callback) = callback {
            for mut buffer in held {
                buffer.reset();
                callback(buffer);
            }
        }

        debug!(port = %port, "Port disabled");
        Ok(())
    }

    fn port_is_enabled(&self, port: PortId) -> bool {
        self.shared
            .lock()
            .port(port)
            .map(|p| p.enabled || p.tunnelled)
            .unwrap_or(false)
    }

    fn port_send_buffer(
        &self,
        port: PortId,
        mut buffer: BufferHeader,
    ) -> Result<(), (BufferHeader, HalError)> {
        let mut state = self.shared.lock();
        match state.pools.get(&buffer.pool()) {
            Some(pool) if pool.port == port => {}
            _ => {
                return Err((
                    buffer,
                    HalError::InvalidArgument("buffer does not belong to this port".into()),
                ));
            }
        }
        let target = match state.port_mut(port) {
            Ok(target) => target,
            Err(e) => return Err((buffer, e)),
        };
        if !target.enabled {
            return Err((buffer, HalError::NotEnabled));
        }
        buffer.reset();
        target.held.push_back(buffer);
        Ok(())
    }

    fn port_parameter_set(&self, port: PortId, parameter: &Parameter) -> HalResult<()> {
        let mut state = self.shared.lock();
        state.check(FailPoint::ParameterSet(parameter.id()))?;
        let kind = state.kind_of(port)?;
        let component_enabled = state.component(port.component)?.enabled;

        match parameter {
            Parameter::Capture(on) => {
                if kind != ComponentKind::Camera || port.direction != PortDirection::Output {
                    return Err(HalError::InvalidArgument("capture needs a camera output".into()));
                }
                state.port_mut(port)?.capture = *on;
            }
            Parameter::CameraConfig(_) => {
                if kind != ComponentKind::Camera || port.direction != PortDirection::Control {
                    return Err(HalError::InvalidArgument(
                        "camera config needs the camera control port".into(),
                    ));
                }
                if component_enabled {
                    return Err(HalError::InvalidState("camera already enabled".into()));
                }
            }
            _ => {
                state.port(port)?;
            }
        }

        state.parameter_log.push((kind, port, *parameter));
        Ok(())
    }

    fn pool_create(&self, port: PortId, num: u32, size: u32) -> HalResult<(PoolId, Vec<BufferHeader>)> {
        let mut state = self.shared.lock();
        let kind = state.kind_of(port)?;
        state.check(FailPoint::PoolCreate(kind))?;
        if num == 0 || size == 0 {
            return Err(HalError::InvalidArgument("empty pool".into()));
        }
        state.port(port)?;

        let id = PoolId(state.handle());
        state.pools.insert(id, SimPool { port, count: num });
        let buffers = (0..num)
            .map(|i| BufferHeader::new(id, i, size as usize))
            .collect();
        debug!(port = %port, pool = id.0, num, size, "Pool created");
        Ok((id, buffers))
    }

    fn pool_destroy(&self, pool: PoolId, buffers: Vec<BufferHeader>) -> HalResult<()> {
        let mut state = self.shared.lock();
        let Some(entry) = state.pools.get(&pool) else {
            return Err(HalError::NotFound(format!("pool {}", pool.0)));
        };
        let port = entry.port;
        let count = entry.count as usize;
        if state.port(port).map(|p| p.enabled).unwrap_or(false) {
            return Err(HalError::InvalidState(format!("port {} still enabled", port)));
        }

        let returned = buffers.iter().filter(|b| b.pool() == pool).count();
        if returned < count {
            warn!(pool = pool.0, missing = count - returned, "Pool destroyed with buffers outstanding");
            state.leaked_buffers += count - returned;
        }
        state.pools.remove(&pool);
        debug!(pool = pool.0, "Pool destroyed");
        Ok(())
    }

    fn connection_create(&self, output: PortId, input: PortId) -> HalResult<ConnectionId> {
        let mut state = self.shared.lock();
        state.check(FailPoint::ConnectionCreate)?;
        if output.direction != PortDirection::Output || input.direction != PortDirection::Input {
            return Err(HalError::InvalidArgument("connection must run output to input".into()));
        }
        if state.port(output)?.enabled || state.port(input)?.enabled {
            return Err(HalError::InvalidState("port already enabled".into()));
        }
        if state
            .connections
            .values()
            .any(|c| c.output == output || c.input == input)
        {
            return Err(HalError::InvalidState("port already connected".into()));
        }

        let id = ConnectionId(state.handle());
        state.connections.insert(
            id,
            SimConnection {
                output,
                input,
                enabled: false,
            },
        );
        debug!(output = %output, input = %input, connection = id.0, "Connection created");
        Ok(id)
    }

    fn connection_enable(&self, id: ConnectionId) -> HalResult<()> {
        let mut state = self.shared.lock();
        state.check(FailPoint::ConnectionEnable)?;
        let Some(connection) = state.connections.get(&id) else {
            return Err(HalError::NotFound(format!("connection {}", id.0)));
        };
        if connection.enabled {
            return Err(HalError::AlreadyEnabled);
        }
        let (output, input) = (connection.output, connection.input);

        let out_format = state.port(output)?.format;
        let in_format = state.port(input)?.format;
        if out_format.encoding != in_format.encoding
            || out_format.width != in_format.width
            || out_format.height != in_format.height
        {
            return Err(HalError::InvalidArgument(format!(
                "format mismatch between {} and {}",
                output, input
            )));
        }

        state.port_mut(output)?.tunnelled = true;
        state.port_mut(input)?.tunnelled = true;
        if let Some(connection) = state.connections.get_mut(&id) {
            connection.enabled = true;
        }
        Ok(())
    }

    fn connection_disable(&self, id: ConnectionId) -> HalResult<()> {
        let mut state = self.shared.lock();
        let Some(connection) = state.connections.get_mut(&id) else {
            return Err(HalError::NotFound(format!("connection {}", id.0)));
        };
        if !connection.enabled {
            return Err(HalError::NotEnabled);
        }
        connection.enabled = false;
        let (output, input) = (connection.output, connection.input);
        if let Ok(port) = state.port_mut(output) {
            port.tunnelled = false;
        }
        if let Ok(port) = state.port_mut(input) {
            port.tunnelled = false;
        }
        Ok(())
    }

    fn connection_destroy(&self, id: ConnectionId) -> HalResult<()> {
        let mut state = self.shared.lock();
        match state.connections.get(&id) {
            None => Err(HalError::NotFound(format!("connection {}", id.0))),
            Some(c) if c.enabled => Err(HalError::InvalidState("connection still enabled".into())),
            Some(_) => {
                state.connections.remove(&id);
                debug!(connection = id.0, "Connection destroyed");
                Ok(())
            }
        }
    }

    fn connection_is_enabled(&self, id: ConnectionId) -> bool {
        self.shared
            .lock()
            .connections
            .get(&id)
            .map(|c| c.enabled)
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for SimulatedHardware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("SimulatedHardware")
            .field("claimed", &state.claimed)
            .field("components", &state.components.len())
            .field("connections", &state.connections.len())
            .field("pools", &state.pools.len())
            .finish()
    }
}

impl SimulatedHardware {
    /// Log a one-line summary of live objects
    pub fn log_summary(&self) {
        let state = self.shared.lock();
        info!(
            components = state.components.len(),
            connections = state.connections.len(),
            pools = state.pools.len(),
            leaked_buffers = state.leaked_buffers,
            "Simulated hardware state"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn rgb_format(width: u32, height: u32) -> EsFormat {
        EsFormat {
            encoding: Encoding::Rgb24,
            encoding_variant: None,
            width: align_up(width, 32),
            height: align_up(height, 16),
            crop: Rect::sized(width, height),
            frame_rate: Rational::new(0, 1),
            bitrate: 0,
        }
    }

    #[test]
    fn test_claim_is_exclusive() {
        let sim = SimulatedHardware::new();
        assert!(sim.claim().is_ok());
        assert_eq!(sim.claim(), Err(HalError::Busy));
        sim.unclaim();
        assert!(sim.claim().is_ok());
    }

    #[test]
    fn test_commit_rejects_unaligned() {
        let sim = SimulatedHardware::new();
        let camera = sim.component_create(ComponentKind::Camera).unwrap();
        let preview = camera.output(0).unwrap();

        let mut format = rgb_format(100, 50);
        format.width = 100;
        assert!(matches!(
            sim.port_format_commit(preview, &format),
            Err(HalError::InvalidArgument(_))
        ));
        assert!(sim.port_format_commit(preview, &rgb_format(100, 50)).is_ok());

        let requirements = sim.port_buffer_requirements(preview).unwrap();
        assert_eq!(requirements.size_recommended as usize, 128 * 3 * 64);
    }

    #[test]
    fn test_destroy_order_enforced() {
        let sim = SimulatedHardware::new();
        let camera = sim.component_create(ComponentKind::Camera).unwrap();
        let splitter = sim.component_create(ComponentKind::Splitter).unwrap();
        let input = splitter.input(0).unwrap();
        let video = camera.output(1).unwrap();
        sim.port_format_commit(input, &sim.port_format(video).unwrap()).unwrap();

        let connection = sim.connection_create(video, input).unwrap();
        sim.connection_enable(connection).unwrap();
        assert!(sim.port_is_enabled(input));

        assert!(sim.connection_destroy(connection).is_err());
        assert!(sim.component_destroy(splitter.id).is_err());

        sim.connection_disable(connection).unwrap();
        sim.connection_destroy(connection).unwrap();
        sim.component_destroy(splitter.id).unwrap();
        sim.component_destroy(camera.id).unwrap();
        assert!(sim.live_components().is_empty());
    }

    #[test]
    fn test_preview_port_delivers_frames() {
        let sim = SimulatedHardware::with_frame_interval(Duration::from_millis(2));
        let camera = sim.component_create(ComponentKind::Camera).unwrap();
        let preview = camera.output(0).unwrap();
        sim.port_format_commit(preview, &rgb_format(64, 32)).unwrap();
        sim.component_enable(camera.id).unwrap();

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        sim.port_enable(
            preview,
            Arc::new(move |buffer: BufferHeader| {
                let _ = tx
                    .lock()
                    .unwrap()
                    .send((buffer.len(), buffer.flags()));
            }),
        )
        .unwrap();

        let (pool, buffers) = sim.pool_create(preview, 1, 64 * 3 * 32).unwrap();
        for buffer in buffers {
            sim.port_send_buffer(preview, buffer).unwrap();
        }

        let (len, flags) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(len, 64 * 3 * 32);
        assert!(flags.contains(BufferFlags::FRAME_END));

        sim.port_disable(preview).unwrap();
        sim.pool_destroy(pool, Vec::new()).unwrap();
        assert_eq!(sim.leaked_buffers(), 1);
    }

    #[test]
    fn test_disable_flushes_held_buffers() {
        let sim = SimulatedHardware::with_frame_interval(Duration::from_secs(60));
        let camera = sim.component_create(ComponentKind::Camera).unwrap();
        let preview = camera.output(0).unwrap();
        sim.port_format_commit(preview, &rgb_format(32, 16)).unwrap();

        let returned = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&returned);
        sim.port_enable(
            preview,
            Arc::new(move |buffer: BufferHeader| sink.lock().unwrap().push(buffer)),
        )
        .unwrap();

        let (pool, buffers) = sim.pool_create(preview, 2, 32 * 3 * 16).unwrap();
        for buffer in buffers {
            sim.port_send_buffer(preview, buffer).unwrap();
        }
        sim.port_disable(preview).unwrap();

        let buffers: Vec<BufferHeader> = returned.lock().unwrap().drain(..).collect();
        assert_eq!(buffers.len(), 2);
        assert!(buffers.iter().all(|b| b.is_empty()));
        sim.pool_destroy(pool, buffers).unwrap();
        assert_eq!(sim.leaked_buffers(), 0);
    }

    #[test]
    fn test_fail_point() {
        let sim = SimulatedHardware::new();
        sim.fail_on(FailPoint::ComponentCreate(ComponentKind::Resizer));
        assert!(matches!(
            sim.component_create(ComponentKind::Resizer),
            Err(HalError::Injected(_))
        ));
        assert!(sim.component_create(ComponentKind::Camera).is_ok());
        sim.clear_failures();
        assert!(sim.component_create(ComponentKind::Resizer).is_ok());
    }

    #[test]
    fn test_port_stays_disabled_without_delivery_thread() {
        let sim = SimulatedHardware::new();
        let camera = sim.component_create(ComponentKind::Camera).unwrap();
        let preview = camera.output(0).unwrap();
        sim.port_format_commit(preview, &rgb_format(32, 16)).unwrap();

        sim.fail_on(FailPoint::DeliveryThread);
        assert!(sim.port_enable(preview, Arc::new(|_: BufferHeader| {})).is_err());
        assert!(!sim.port_is_enabled(preview));
        assert_eq!(sim.enabled_callback_ports(), 0);

        sim.clear_failures();
        sim.port_enable(preview, Arc::new(|_: BufferHeader| {})).unwrap();
        assert!(sim.port_is_enabled(preview));
        sim.port_disable(preview).unwrap();
    }

    #[test]
    fn test_capture_only_on_camera_outputs() {
        let sim = SimulatedHardware::new();
        let resizer = sim.component_create(ComponentKind::Resizer).unwrap();
        let output = resizer.output(0).unwrap();
        assert!(sim.port_parameter_set(output, &Parameter::Capture(true)).is_err());
    }
}

// SPDX-License-Identifier: GPL-3.0-only

//! Shared vocabulary of the hardware media layer
//!
//! Components, ports, formats, buffer headers and parameters as the
//! pipeline sees them. Nothing in here talks to hardware; the
//! [`MmalHal`](super::MmalHal) trait does.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

/// Kind of hardware component a stage wraps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentKind {
    /// Image sensor with preview, video and still outputs
    Camera,
    /// One input duplicated onto two outputs
    Splitter,
    /// ISP resizer / format converter
    Resizer,
    /// H.264 encoder
    VideoEncoder,
    /// JPEG encoder
    ImageEncoder,
}

impl ComponentKind {
    /// Name of the component in the firmware registry
    pub fn hardware_name(&self) -> &'static str {
        match self {
            ComponentKind::Camera => "vc.ril.camera",
            ComponentKind::Splitter => "vc.ril.video_splitter",
            ComponentKind::Resizer => "vc.ril.isp",
            ComponentKind::VideoEncoder => "vc.ril.video_encode",
            ComponentKind::ImageEncoder => "vc.ril.image_encode",
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ComponentKind::Camera => "camera",
            ComponentKind::Splitter => "splitter",
            ComponentKind::Resizer => "resizer",
            ComponentKind::VideoEncoder => "video encoder",
            ComponentKind::ImageEncoder => "image encoder",
        };
        write!(f, "{}", name)
    }
}

/// Handle of a live component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(pub u32);

/// Handle of a live tunnelled connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u32);

/// Handle of a buffer pool bound to a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortDirection {
    Control,
    Input,
    Output,
}

/// Address of one port on one component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortId {
    pub component: ComponentId,
    pub direction: PortDirection,
    pub index: u8,
}

impl PortId {
    pub fn control(component: ComponentId) -> Self {
        Self {
            component,
            direction: PortDirection::Control,
            index: 0,
        }
    }

    pub fn input(component: ComponentId, index: u8) -> Self {
        Self {
            component,
            direction: PortDirection::Input,
            index,
        }
    }

    pub fn output(component: ComponentId, index: u8) -> Self {
        Self {
            component,
            direction: PortDirection::Output,
            index,
        }
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = match self.direction {
            PortDirection::Control => "ctl",
            PortDirection::Input => "in",
            PortDirection::Output => "out",
        };
        write!(f, "c{}:{}{}", self.component.0, dir, self.index)
    }
}

/// What a freshly created component reports about itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentInfo {
    pub id: ComponentId,
    pub kind: ComponentKind,
    pub inputs: u8,
    pub outputs: u8,
}

impl ComponentInfo {
    pub fn input(&self, index: u8) -> Option<PortId> {
        (index < self.inputs).then(|| PortId::input(self.id, index))
    }

    pub fn output(&self, index: u8) -> Option<PortId> {
        (index < self.outputs).then(|| PortId::output(self.id, index))
    }

    pub fn control(&self) -> PortId {
        PortId::control(self.id)
    }
}

/// Elementary stream encodings understood by the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Encoding {
    /// GPU-side handle, only valid on tunnelled ports
    Opaque,
    /// Planar YUV 4:2:0
    I420,
    /// Packed 8-bit RGB
    Rgb24,
    /// Packed 8-bit BGR
    Bgr24,
    H264,
    Jpeg,
}

impl Encoding {
    /// Raw pixel encodings readable by the host
    pub fn is_raw(&self) -> bool {
        matches!(self, Encoding::I420 | Encoding::Rgb24 | Encoding::Bgr24)
    }

    /// Encodings whose committed width and height must be padded
    pub fn requires_alignment(&self) -> bool {
        self.is_raw() || *self == Encoding::Opaque
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, Encoding::H264 | Encoding::Jpeg)
    }

    pub fn fourcc(&self) -> &'static str {
        match self {
            Encoding::Opaque => "OPQV",
            Encoding::I420 => "I420",
            Encoding::Rgb24 => "RGB3",
            Encoding::Bgr24 => "BGR3",
            Encoding::H264 => "H264",
            Encoding::Jpeg => "JPEG",
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fourcc())
    }
}

/// Fraction used for frame rates and the camera's rational controls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    pub fn new(num: i32, den: i32) -> Self {
        Self {
            num,
            den: if den == 0 { 1 } else { den },
        }
    }

    pub fn as_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn sized(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }
}

/// Elementary stream format of a port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EsFormat {
    pub encoding: Encoding,
    /// Pixel layout behind an opaque encoding
    pub encoding_variant: Option<Encoding>,
    /// Padded width
    pub width: u32,
    /// Padded height
    pub height: u32,
    /// Visible region inside the padded frame
    pub crop: Rect,
    /// 0/1 lets the port run at whatever rate upstream delivers
    pub frame_rate: Rational,
    /// Target bitrate of compressed encodings, 0 otherwise
    pub bitrate: u32,
}

impl Default for EsFormat {
    fn default() -> Self {
        Self {
            encoding: Encoding::Opaque,
            encoding_variant: None,
            width: 0,
            height: 0,
            crop: Rect::default(),
            frame_rate: Rational::new(0, 1),
            bitrate: 0,
        }
    }
}

/// Buffer counts and sizes a port asks for after a format commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferRequirements {
    pub num_min: u32,
    pub num_recommended: u32,
    pub size_min: u32,
    pub size_recommended: u32,
}

/// Buffer count and size actually configured on a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferConfig {
    pub num: u32,
    pub size: u32,
}

/// Per-buffer flags set by the producing port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BufferFlags(u32);

impl BufferFlags {
    pub const EOS: BufferFlags = BufferFlags(1 << 0);
    pub const FRAME_START: BufferFlags = BufferFlags(1 << 1);
    pub const FRAME_END: BufferFlags = BufferFlags(1 << 2);
    pub const KEYFRAME: BufferFlags = BufferFlags(1 << 3);
    /// Stream headers (SPS/PPS) rather than picture data
    pub const CONFIG: BufferFlags = BufferFlags(1 << 5);
    /// Encoder side information that is not part of the bitstream
    pub const CODECSIDEINFO: BufferFlags = BufferFlags(1 << 7);

    pub const fn empty() -> Self {
        BufferFlags(0)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: BufferFlags) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn intersects(&self, other: BufferFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: BufferFlags) {
        self.0 |= other.0;
    }
}

impl BitOr for BufferFlags {
    type Output = BufferFlags;

    fn bitor(self, rhs: BufferFlags) -> BufferFlags {
        BufferFlags(self.0 | rhs.0)
    }
}

/// One buffer header owned by a pool
///
/// The header moves by value: held by the pool while idle, by the port
/// while queued, and by the callback while it is being consumed.
#[derive(Debug)]
pub struct BufferHeader {
    pool: PoolId,
    index: u32,
    data: Vec<u8>,
    length: usize,
    flags: BufferFlags,
    pts: Option<u64>,
}

impl BufferHeader {
    pub fn new(pool: PoolId, index: u32, capacity: usize) -> Self {
        Self {
            pool,
            index,
            data: vec![0; capacity],
            length: 0,
            flags: BufferFlags::empty(),
            pts: None,
        }
    }

    pub fn pool(&self) -> PoolId {
        self.pool
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Valid bytes of the buffer
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.length]
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Copy as much of `bytes` as fits; returns the number of bytes taken
    pub fn fill(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.data.len());
        self.data[..n].copy_from_slice(&bytes[..n]);
        self.length = n;
        n
    }

    pub fn flags(&self) -> BufferFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: BufferFlags) {
        self.flags = flags;
    }

    pub fn pts(&self) -> Option<u64> {
        self.pts
    }

    pub fn set_pts(&mut self, pts: Option<u64>) {
        self.pts = pts;
    }

    /// Clear payload metadata before the header goes back to a pool
    pub fn reset(&mut self) {
        self.length = 0;
        self.flags = BufferFlags::empty();
        self.pts = None;
    }
}

/// Callback invoked on the delivery thread for every filled buffer
///
/// The callback takes ownership of the header and must hand it back to
/// its pool when done.
pub type PortCallback = Arc<dyn Fn(BufferHeader) + Send + Sync>;

/// Sensor-wide configuration set once before the camera is enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraConfig {
    pub max_stills_width: u32,
    pub max_stills_height: u32,
    pub stills_yuv422: bool,
    pub one_shot_stills: bool,
    pub max_preview_video_width: u32,
    pub max_preview_video_height: u32,
    pub num_preview_video_frames: u32,
    pub stills_capture_circular_buffer_height: u32,
    pub fast_preview_resume: bool,
    pub use_stc_timestamp: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ExposureMode {
    Off,
    #[default]
    Auto,
    Night,
    NightPreview,
    Backlight,
    Spotlight,
    Sports,
    Snow,
    Beach,
    VeryLong,
    FixedFps,
    AntiShake,
    Fireworks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MeteringMode {
    #[default]
    Average,
    Spot,
    Backlit,
    Matrix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AwbMode {
    Off,
    #[default]
    Auto,
    Sunlight,
    Cloudy,
    Shade,
    Tungsten,
    Fluorescent,
    Incandescent,
    Flash,
    Horizon,
    GreyWorld,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ImageEffect {
    #[default]
    None,
    Negative,
    Solarize,
    Posterize,
    Whiteboard,
    Blackboard,
    Sketch,
    Denoise,
    Emboss,
    Oilpaint,
    Hatch,
    Gpen,
    Pastel,
    Watercolour,
    Film,
    Blur,
    Saturation,
    ColourSwap,
    WashedOut,
    ColourPoint,
    ColourBalance,
    Cartoon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MirrorMode {
    #[default]
    None,
    Horizontal,
    Vertical,
    Both,
}

impl MirrorMode {
    pub fn from_flips(hflip: bool, vflip: bool) -> Self {
        match (hflip, vflip) {
            (false, false) => MirrorMode::None,
            (true, false) => MirrorMode::Horizontal,
            (false, true) => MirrorMode::Vertical,
            (true, true) => MirrorMode::Both,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum H264Profile {
    Baseline,
    Main,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum H264Level {
    Level4,
    Level41,
    Level42,
}

/// Control values set on component ports
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Parameter {
    CameraConfig(CameraConfig),
    /// Starts or stops frame production on a camera output
    Capture(bool),
    Brightness(Rational),
    Sharpness(Rational),
    Contrast(Rational),
    Saturation(Rational),
    Iso(u32),
    /// Microseconds, 0 = automatic
    ShutterSpeed(u32),
    ExposureMode(ExposureMode),
    ExposureCompensation(i32),
    MeteringMode(MeteringMode),
    AwbMode(AwbMode),
    AwbGains { red: Rational, blue: Rational },
    ImageEffect(ImageEffect),
    /// Degrees, multiple of 90
    Rotation(i32),
    Mirror(MirrorMode),
    VideoStabilisation(bool),
    VideoProfile {
        profile: H264Profile,
        level: H264Level,
    },
    JpegQuality(u32),
}

/// Discriminant of [`Parameter`], used as a lookup key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterId {
    CameraConfig,
    Capture,
    Brightness,
    Sharpness,
    Contrast,
    Saturation,
    Iso,
    ShutterSpeed,
    ExposureMode,
    ExposureCompensation,
    MeteringMode,
    AwbMode,
    AwbGains,
    ImageEffect,
    Rotation,
    Mirror,
    VideoStabilisation,
    VideoProfile,
    JpegQuality,
}

impl Parameter {
    pub fn id(&self) -> ParameterId {
        match self {
            Parameter::CameraConfig(_) => ParameterId::CameraConfig,
            Parameter::Capture(_) => ParameterId::Capture,
            Parameter::Brightness(_) => ParameterId::Brightness,
            Parameter::Sharpness(_) => ParameterId::Sharpness,
            Parameter::Contrast(_) => ParameterId::Contrast,
            Parameter::Saturation(_) => ParameterId::Saturation,
            Parameter::Iso(_) => ParameterId::Iso,
            Parameter::ShutterSpeed(_) => ParameterId::ShutterSpeed,
            Parameter::ExposureMode(_) => ParameterId::ExposureMode,
            Parameter::ExposureCompensation(_) => ParameterId::ExposureCompensation,
            Parameter::MeteringMode(_) => ParameterId::MeteringMode,
            Parameter::AwbMode(_) => ParameterId::AwbMode,
            Parameter::AwbGains { .. } => ParameterId::AwbGains,
            Parameter::ImageEffect(_) => ParameterId::ImageEffect,
            Parameter::Rotation(_) => ParameterId::Rotation,
            Parameter::Mirror(_) => ParameterId::Mirror,
            Parameter::VideoStabilisation(_) => ParameterId::VideoStabilisation,
            Parameter::VideoProfile { .. } => ParameterId::VideoProfile,
            Parameter::JpegQuality(_) => ParameterId::JpegQuality,
        }
    }
}

/// Status codes returned by the hardware layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HalError {
    /// Out of hardware slots or delivery threads
    NoMemory,
    /// Request rejected by the port or component
    InvalidArgument(String),
    /// Port is not enabled
    NotEnabled,
    /// Port is already enabled
    AlreadyEnabled,
    /// Operation not allowed in the current object state
    InvalidState(String),
    /// Handle does not refer to a live object
    NotFound(String),
    /// Hardware is already claimed by another owner
    Busy,
    /// Failure forced by the test harness
    Injected(String),
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HalError::NoMemory => write!(f, "Out of memory"),
            HalError::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            HalError::NotEnabled => write!(f, "Port not enabled"),
            HalError::AlreadyEnabled => write!(f, "Port already enabled"),
            HalError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            HalError::NotFound(msg) => write!(f, "Not found: {}", msg),
            HalError::Busy => write!(f, "Hardware busy"),
            HalError::Injected(msg) => write!(f, "Injected failure: {}", msg),
        }
    }
}

impl std::error::Error for HalError {}

/// Result type for hardware layer calls
pub type HalResult<T> = Result<T, HalError>;

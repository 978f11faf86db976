// SPDX-License-Identifier: GPL-3.0-only

//! Stage graphs built and torn down by the pipeline
//!
//! ```text
//!                      ┌─ out0 ─▶ resizer ──▶ host (video preview)
//! camera out1 ─▶ splitter
//!                      └─ out1 ─▶ H.264 encoder ──▶ sink (video record)
//! camera out0 ─────────────────────────────────▶ host (still preview)
//! camera out2 ─▶ JPEG encoder ─────────────────▶ sink (still record)
//! ```
//!
//! Every branch struct declares its fields in teardown order: the
//! callback port is disabled first, then the connection, then the pool,
//! then the stage. Builders create those pieces in locals, so an early
//! return unwinds whatever was built in the reverse order.

use super::callbacks::{self, RecordTap, StillTap};
use super::connection::Connection;
use super::parameters::ControlChannel;
use super::pool::{BufferPool, OwnedPool};
use super::rendezvous::{FrameEvent, Rendezvous};
use super::sink::EncodedSink;
use super::stage::{BufferPolicy, CallbackPort, FormatSpec, Stage};
use crate::backends::mmal::{
    CameraConfig, ComponentKind, Encoding, H264Level, H264Profile, HalError, MmalHal, Parameter,
    PortId, Rational,
};
use crate::config::{FrameSize, PipelineConfig};
use crate::constants::{hardware, preview_frame_count};
use crate::errors::{ConstructionStep, PipelineError, PipelineResult, StateViolation};
use crate::media::layout::{FrameLayout, PreviewFormat};
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Queue the whole pool on its port; an empty port would never deliver
fn prime(pool: &BufferPool, stage: ComponentKind) -> PipelineResult<()> {
    if pool.prime() == 0 {
        return Err(PipelineError::construction(
            stage,
            ConstructionStep::PrimeBuffers,
            HalError::NotEnabled,
        ));
    }
    Ok(())
}

/// Camera component with its video port configured and enabled
pub struct CameraStage {
    stage: Stage,
    preview: PortId,
    video: PortId,
    still: PortId,
}

impl CameraStage {
    pub fn build(hal: &Arc<dyn MmalHal>, config: &PipelineConfig) -> PipelineResult<Self> {
        let stage = Stage::create(hal, ComponentKind::Camera, 0, 3)?;
        let preview = stage.output(hardware::CAMERA_PREVIEW_PORT)?;
        let video = stage.output(hardware::CAMERA_VIDEO_PORT)?;
        let still = stage.output(hardware::CAMERA_CAPTURE_PORT)?;

        let fps = config.parameters.framerate();
        stage.set_parameter(
            stage.control(),
            &Parameter::CameraConfig(CameraConfig {
                max_stills_width: hardware::MAX_PHOTO_WIDTH,
                max_stills_height: hardware::MAX_PHOTO_HEIGHT,
                stills_yuv422: false,
                one_shot_stills: false,
                max_preview_video_width: hardware::MAX_VIDEO_WIDTH,
                max_preview_video_height: hardware::MAX_VIDEO_HEIGHT,
                num_preview_video_frames: preview_frame_count(fps),
                stills_capture_circular_buffer_height: 0,
                fast_preview_resume: false,
                use_stc_timestamp: true,
            }),
        )?;

        let record = config.video_record_size;
        stage.commit(
            video,
            &FormatSpec::new(Encoding::Opaque, record.width, record.height)
                .variant(Encoding::I420)
                .frame_rate(Rational::new(fps as i32, 1)),
        )?;
        stage.configure_buffers(video, BufferPolicy::Streaming)?;
        stage.enable()?;

        info!(
            width = record.width,
            height = record.height,
            fps,
            "Camera stage enabled"
        );
        Ok(Self {
            stage,
            preview,
            video,
            still,
        })
    }

    pub fn control_channel(&self) -> ControlChannel<'_> {
        ControlChannel::new(
            self.stage.hal().as_ref(),
            self.stage.control(),
            [self.preview, self.video, self.still],
        )
    }

    /// Start frame production on the video port
    pub fn start_capture(&self) -> PipelineResult<()> {
        self.stage
            .set_parameter(self.video, &Parameter::Capture(true))
    }
}

impl Drop for CameraStage {
    fn drop(&mut self) {
        if let Err(e) = self
            .stage
            .hal()
            .port_parameter_set(self.video, &Parameter::Capture(false))
        {
            debug!(error = %e, "Failed to stop capture");
        }
    }
}

/// Splitter fed by the camera video port
pub struct SplitterGraph {
    _connection: Connection,
    _stage: Stage,
    preview_output: PortId,
    record_output: PortId,
}

impl SplitterGraph {
    pub fn build(hal: &Arc<dyn MmalHal>, camera: &CameraStage) -> PipelineResult<Self> {
        let kind = ComponentKind::Splitter;
        let stage = Stage::create(hal, kind, 1, 2)?;
        let input = stage.input(0)?;
        let preview_output = stage.output(hardware::SPLITTER_PREVIEW_PORT)?;
        let record_output = stage.output(hardware::SPLITTER_RECORD_PORT)?;

        stage.inherit(camera.video, input)?;
        stage.configure_buffers(input, BufferPolicy::Streaming)?;
        for output in [preview_output, record_output] {
            stage.inherit(input, output)?;
        }

        let connection = Connection::connect(hal, kind, camera.video, input)?;
        stage.enable()?;

        info!("Splitter stage enabled");
        Ok(Self {
            _connection: connection,
            _stage: stage,
            preview_output,
            record_output,
        })
    }

    pub fn preview_output(&self) -> PortId {
        self.preview_output
    }

    pub fn record_output(&self) -> PortId {
        self.record_output
    }
}

/// Consumer side of a preview branch
///
/// Cheap to clone and usable from any thread. Once the branch is torn
/// down every call fails or returns nothing.
#[derive(Clone)]
pub struct FrameSource {
    rendezvous: Arc<Rendezvous>,
    layout: FrameLayout,
}

impl FrameSource {
    fn new(format: PreviewFormat, size: FrameSize) -> Self {
        let layout = FrameLayout::new(format, size.width, size.height);
        Self {
            rendezvous: Arc::new(Rendezvous::with_capacity(
                FrameEvent::FrameReady,
                layout.padded_size(),
            )),
            layout,
        }
    }

    pub fn layout(&self) -> FrameLayout {
        self.layout
    }

    /// Bytes of one packed frame
    pub fn frame_size(&self) -> usize {
        self.layout.packed_size()
    }

    /// Block until the next frame arrives
    pub fn grab(&self) -> PipelineResult<()> {
        if self.rendezvous.wait_for_next() {
            trace!(bytes = self.rendezvous.held_len(), "Frame grabbed");
            Ok(())
        } else {
            Err(StateViolation::NoActivePreview.into())
        }
    }

    /// Copy the grabbed frame into `dst` without padding
    ///
    /// Returns 0 when nothing was grabbed or the frame was already taken.
    pub fn retrieve(&self, dst: &mut [u8]) -> PipelineResult<usize> {
        if self.rendezvous.held_len() == 0 {
            return Ok(0);
        }
        let needed = self.layout.packed_size();
        if dst.len() < needed {
            return Err(PipelineError::BufferTooSmall {
                needed,
                got: dst.len(),
            });
        }
        Ok(self
            .rendezvous
            .take_with(|src| self.layout.pack(src, dst))
            .unwrap_or(0))
    }

    /// As [`FrameSource::retrieve`], allocating the destination
    pub fn retrieve_vec(&self) -> Option<Vec<u8>> {
        let mut frame = vec![0; self.layout.packed_size()];
        match self.retrieve(&mut frame) {
            Ok(0) | Err(_) => None,
            Ok(n) => {
                frame.truncate(n);
                Some(frame)
            }
        }
    }

    fn close(&self) {
        self.rendezvous.close();
    }
}

/// Resizer on the splitter's preview output, delivering to the host
pub struct PreviewBranch {
    _output: CallbackPort,
    _connection: Connection,
    _pool: OwnedPool,
    _stage: Stage,
    source: FrameSource,
}

impl PreviewBranch {
    pub fn build(
        hal: &Arc<dyn MmalHal>,
        upstream: PortId,
        size: FrameSize,
        format: PreviewFormat,
    ) -> PipelineResult<Self> {
        let kind = ComponentKind::Resizer;
        let stage = Stage::create(hal, kind, 1, 1)?;
        let input = stage.input(0)?;
        let output = stage.output(0)?;

        let input_format = stage.inherit(upstream, input)?;
        stage.configure_buffers(input, BufferPolicy::Streaming)?;

        let output_format =
            FormatSpec::new(format.encoding(), size.width, size.height).apply(&input_format);
        stage.commit_format(output, &output_format)?;
        let buffers = stage.configure_buffers(output, BufferPolicy::Recommended)?;

        let pool = OwnedPool::create(hal, kind, output, buffers)?;
        let connection = Connection::connect(hal, kind, upstream, input)?;

        let source = FrameSource::new(format, size);
        let port = CallbackPort::enable(
            hal,
            kind,
            output,
            callbacks::preview(pool.shared(), Arc::clone(&source.rendezvous)),
        )?;
        stage.enable()?;
        prime(&pool, kind)?;

        info!(
            width = size.width,
            height = size.height,
            format = %format,
            "Video preview started"
        );
        Ok(Self {
            _output: port,
            _connection: connection,
            _pool: pool,
            _stage: stage,
            source,
        })
    }

    pub fn source(&self) -> &FrameSource {
        &self.source
    }
}

impl Drop for PreviewBranch {
    fn drop(&mut self) {
        self.source.close();
    }
}

/// H.264 encoder on the splitter's record output, writing to a sink
pub struct RecordBranch {
    output: CallbackPort,
    connection: Connection,
    pool: OwnedPool,
    stage: Stage,
    tap: Arc<RecordTap>,
}

impl RecordBranch {
    pub fn build(
        hal: &Arc<dyn MmalHal>,
        upstream: PortId,
        bitrate: u32,
        sink: Box<dyn EncodedSink>,
    ) -> PipelineResult<Self> {
        let kind = ComponentKind::VideoEncoder;
        let stage = Stage::create(hal, kind, 1, 1)?;
        let input = stage.input(0)?;
        let output = stage.output(0)?;

        let crop = stage.inherit(upstream, input)?.crop;
        stage.commit(
            output,
            &FormatSpec::new(Encoding::H264, crop.width, crop.height).bitrate(bitrate),
        )?;
        let buffers = stage.configure_buffers(output, BufferPolicy::Recommended)?;
        stage.set_parameter(
            output,
            &Parameter::VideoProfile {
                profile: H264Profile::High,
                level: H264Level::Level4,
            },
        )?;
        stage.enable()?;

        let pool = OwnedPool::create(hal, kind, output, buffers)?;
        let connection = Connection::connect(hal, kind, upstream, input)?;

        let tap = Arc::new(RecordTap::new(sink));
        let port = CallbackPort::enable(
            hal,
            kind,
            output,
            callbacks::record(pool.shared(), Arc::clone(&tap)),
        )?;
        prime(&pool, kind)?;

        info!(bitrate, "Video recording started");
        Ok(Self {
            output: port,
            connection,
            pool,
            stage,
            tap,
        })
    }

    /// Tear the encoder down and hand back the sink with the byte count
    pub fn stop(self) -> (Option<Box<dyn EncodedSink>>, u64) {
        let RecordBranch {
            output,
            connection,
            pool,
            stage,
            tap,
        } = self;
        drop(output);
        drop(connection);
        drop(pool);
        drop(stage);
        (tap.take_sink(), tap.bytes_written())
    }
}

/// Camera preview port delivering straight to the host
pub struct StillPreviewBranch {
    _output: CallbackPort,
    _pool: OwnedPool,
    source: FrameSource,
}

impl StillPreviewBranch {
    pub fn build(
        hal: &Arc<dyn MmalHal>,
        camera: &CameraStage,
        size: FrameSize,
        format: PreviewFormat,
        fps: u32,
    ) -> PipelineResult<Self> {
        let kind = ComponentKind::Camera;
        let port = camera.preview;

        camera.stage.commit(
            port,
            &FormatSpec::new(format.encoding(), size.width, size.height)
                .frame_rate(Rational::new(fps as i32, 1)),
        )?;
        let buffers = camera.stage.configure_buffers(port, BufferPolicy::Streaming)?;
        let pool = OwnedPool::create(hal, kind, port, buffers)?;

        let source = FrameSource::new(format, size);
        let output = CallbackPort::enable(
            hal,
            kind,
            port,
            callbacks::preview(pool.shared(), Arc::clone(&source.rendezvous)),
        )?;
        prime(&pool, kind)?;

        info!(
            width = size.width,
            height = size.height,
            format = %format,
            "Still preview started"
        );
        Ok(Self {
            _output: output,
            _pool: pool,
            source,
        })
    }

    pub fn source(&self) -> &FrameSource {
        &self.source
    }
}

impl Drop for StillPreviewBranch {
    fn drop(&mut self) {
        self.source.close();
    }
}

/// JPEG encoder on the camera capture port, built for one capture
pub struct StillRecordBranch {
    _output: CallbackPort,
    _connection: Connection,
    _pool: OwnedPool,
    stage: Stage,
    tap: Arc<StillTap>,
    trigger: PortId,
}

impl StillRecordBranch {
    pub fn build(
        hal: &Arc<dyn MmalHal>,
        camera: &CameraStage,
        size: FrameSize,
        quality: u32,
    ) -> PipelineResult<Self> {
        let still = camera.still;
        camera.stage.commit(
            still,
            &FormatSpec::new(Encoding::Opaque, size.width, size.height).variant(Encoding::I420),
        )?;
        camera.stage.configure_buffers(still, BufferPolicy::Recommended)?;

        let kind = ComponentKind::ImageEncoder;
        let stage = Stage::create(hal, kind, 1, 1)?;
        let input = stage.input(0)?;
        let output = stage.output(0)?;

        let crop = stage.inherit(still, input)?.crop;
        stage.configure_buffers(input, BufferPolicy::Recommended)?;

        stage.commit(output, &FormatSpec::new(Encoding::Jpeg, crop.width, crop.height))?;
        let buffers = stage.configure_buffers(output, BufferPolicy::Recommended)?;
        stage.set_parameter(output, &Parameter::JpegQuality(quality))?;

        let pool = OwnedPool::create(hal, kind, output, buffers)?;
        let connection = Connection::connect(hal, kind, still, input)?;

        let tap = Arc::new(StillTap::new(Rendezvous::new(FrameEvent::EncodeComplete)));
        let port = CallbackPort::enable(
            hal,
            kind,
            output,
            callbacks::still(pool.shared(), Arc::clone(&tap)),
        )?;
        stage.enable()?;
        prime(&pool, kind)?;

        debug!(width = size.width, height = size.height, quality, "Still encoder ready");
        Ok(Self {
            _output: port,
            _connection: connection,
            _pool: pool,
            stage,
            tap,
            trigger: still,
        })
    }

    /// Trigger one capture and block until the encoded image is complete
    pub fn capture(&self) -> PipelineResult<Vec<u8>> {
        let rendezvous = self.tap.rendezvous();
        self.tap.reset();
        if !rendezvous.arm() {
            return Err(StateViolation::CaptureAborted.into());
        }

        self.stage
            .hal()
            .port_parameter_set(self.trigger, &Parameter::Capture(true))
            .map_err(|e| {
                PipelineError::construction(ComponentKind::Camera, ConstructionStep::SetParameter, e)
            })?;

        if !rendezvous.wait() {
            return Err(StateViolation::CaptureAborted.into());
        }
        rendezvous
            .take()
            .ok_or(PipelineError::InvalidState(StateViolation::CaptureAborted))
    }
}

impl Drop for StillRecordBranch {
    fn drop(&mut self) {
        self.tap.rendezvous().close();
    }
}

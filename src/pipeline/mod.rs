// SPDX-License-Identifier: GPL-3.0-only

//! Camera pipeline state machine
//!
//! [`CameraPipeline`] owns the camera stage and every branch built on
//! top of it. Operations that need the camera open it on demand; video
//! preview and video recording share a splitter that exists exactly
//! while either of them runs.

pub mod callbacks;
pub mod connection;
pub mod graph;
pub mod parameters;
pub mod pool;
pub mod rendezvous;
pub mod sink;
pub mod stage;

pub use graph::FrameSource;
pub use parameters::{CameraParameters, Setting};
pub use sink::{EncodedSink, FileSink, MemorySink};

use crate::backends::mmal::{AwbMode, ExposureMode, ImageEffect, MeteringMode, MmalHal};
use crate::config::{FrameSize, MAX_PHOTO_SIZE, MAX_VIDEO_SIZE, PipelineConfig};
use crate::constants::timing;
use crate::errors::{PipelineError, PipelineResult, StateViolation};
use crate::media::layout::PreviewFormat;
use graph::{
    CameraStage, PreviewBranch, RecordBranch, SplitterGraph, StillPreviewBranch,
    StillRecordBranch,
};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Which parts of the pipeline currently exist
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionState {
    pub opened: bool,
    pub splitter: bool,
    pub video_preview: bool,
    pub video_record: bool,
    pub still_preview: bool,
}

impl SessionState {
    pub fn video_graph_active(&self) -> bool {
        self.video_preview || self.video_record
    }
}

/// The camera pipeline bound to one hardware instance
pub struct CameraPipeline {
    hal: Arc<dyn MmalHal>,
    config: PipelineConfig,
    camera: Option<CameraStage>,
    splitter: Option<SplitterGraph>,
    video_preview: Option<PreviewBranch>,
    video_record: Option<RecordBranch>,
    still_preview: Option<StillPreviewBranch>,
    frames_grabbed: u64,
}

impl CameraPipeline {
    /// Bind a pipeline to `hal`
    ///
    /// Fails with [`PipelineError::Busy`] while another pipeline holds it.
    pub fn new(hal: Arc<dyn MmalHal>, config: PipelineConfig) -> PipelineResult<Self> {
        if let Err(e) = hal.claim() {
            warn!(error = %e, "Camera hardware already claimed");
            return Err(PipelineError::Busy);
        }
        Ok(Self {
            hal,
            config: config.normalized(),
            camera: None,
            splitter: None,
            video_preview: None,
            video_record: None,
            still_preview: None,
            frames_grabbed: 0,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn parameters(&self) -> &CameraParameters {
        &self.config.parameters
    }

    pub fn state(&self) -> SessionState {
        SessionState {
            opened: self.camera.is_some(),
            splitter: self.splitter.is_some(),
            video_preview: self.video_preview.is_some(),
            video_record: self.video_record.is_some(),
            still_preview: self.still_preview.is_some(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.camera.is_some()
    }

    /// Build the camera stage, commit every parameter and start capture
    pub fn open(&mut self) -> PipelineResult<()> {
        if self.camera.is_some() {
            return Err(StateViolation::AlreadyOpen.into());
        }

        let camera = CameraStage::build(&self.hal, &self.config)?;
        camera
            .control_channel()
            .commit_all(&mut self.config.parameters);
        camera.start_capture()?;

        self.camera = Some(camera);
        self.frames_grabbed = 0;
        info!("Camera opened");
        Ok(())
    }

    fn ensure_open(&mut self) -> PipelineResult<()> {
        if self.camera.is_none() {
            self.open()?;
        }
        Ok(())
    }

    fn camera(&self) -> PipelineResult<&CameraStage> {
        self.camera
            .as_ref()
            .ok_or(PipelineError::InvalidState(StateViolation::NotOpen))
    }

    /// Stop every branch and tear the camera down
    pub fn release(&mut self) {
        if self.camera.is_none() {
            debug!("Release on a closed pipeline");
            return;
        }

        if let Err(e) = self.stop_video_record() {
            warn!(error = %e, "Failed to finish recording during release");
        }
        self.video_preview = None;
        self.still_preview = None;
        self.splitter = None;
        self.camera = None;
        info!("Camera released");
    }

    fn ensure_splitter(&mut self) -> PipelineResult<&SplitterGraph> {
        self.ensure_open()?;
        if self.splitter.is_none() {
            let splitter = SplitterGraph::build(&self.hal, self.camera()?)?;
            self.splitter = Some(splitter);
        }
        self.splitter
            .as_ref()
            .ok_or(PipelineError::InvalidState(StateViolation::NotOpen))
    }

    fn release_splitter_if_idle(&mut self) {
        if self.video_preview.is_none() && self.video_record.is_none() && self.splitter.is_some() {
            self.splitter = None;
            debug!("Splitter released");
        }
    }

    fn ensure_no_still_graph(&self) -> PipelineResult<()> {
        if self.still_preview.is_some() {
            return Err(StateViolation::StillGraphActive.into());
        }
        Ok(())
    }

    fn ensure_no_video_graph(&self) -> PipelineResult<()> {
        if self.video_preview.is_some() || self.video_record.is_some() {
            return Err(StateViolation::VideoGraphActive.into());
        }
        Ok(())
    }

    pub fn start_video_preview(&mut self) -> PipelineResult<()> {
        if self.video_preview.is_some() {
            debug!("Video preview already running");
            return Ok(());
        }
        self.ensure_no_still_graph()?;

        let upstream = self.ensure_splitter()?.preview_output();
        match PreviewBranch::build(
            &self.hal,
            upstream,
            self.config.video_preview_size,
            self.config.preview_format,
        ) {
            Ok(branch) => {
                self.video_preview = Some(branch);
                Ok(())
            }
            Err(e) => {
                self.release_splitter_if_idle();
                Err(e)
            }
        }
    }

    pub fn stop_video_preview(&mut self) {
        if self.video_preview.take().is_some() {
            info!("Video preview stopped");
        }
        self.release_splitter_if_idle();
    }

    /// Record H.264 appended to the file at `path`
    ///
    /// A file created by this call is removed again if the encoder
    /// cannot be built.
    pub fn start_video_record(&mut self, path: impl AsRef<Path>) -> PipelineResult<()> {
        if self.video_record.is_some() {
            debug!("Video recording already running");
            return Ok(());
        }
        self.ensure_no_still_graph()?;

        let path = path.as_ref();
        let existed = path.exists();
        let sink = FileSink::append(path)?;
        let result = self.start_video_record_with(Box::new(sink));
        if result.is_err()
            && !existed
            && let Err(e) = std::fs::remove_file(path)
        {
            warn!(path = %path.display(), error = %e, "Failed to remove output file");
        }
        result
    }

    /// Record H.264 into `sink`
    pub fn start_video_record_with(&mut self, sink: Box<dyn EncodedSink>) -> PipelineResult<()> {
        if self.video_record.is_some() {
            debug!("Video recording already running");
            return Ok(());
        }
        self.ensure_no_still_graph()?;

        let upstream = self.ensure_splitter()?.record_output();
        match RecordBranch::build(&self.hal, upstream, self.config.video_bitrate, sink) {
            Ok(branch) => {
                self.video_record = Some(branch);
                Ok(())
            }
            Err(e) => {
                self.release_splitter_if_idle();
                Err(e)
            }
        }
    }

    /// Tear the encoder down, then finish the sink
    pub fn stop_video_record(&mut self) -> PipelineResult<()> {
        let Some(branch) = self.video_record.take() else {
            return Ok(());
        };
        let (sink, bytes) = branch.stop();
        self.release_splitter_if_idle();

        if let Some(mut sink) = sink {
            sink.finish()?;
        }
        info!(bytes, "Video recording stopped");
        Ok(())
    }

    pub fn start_still_preview(&mut self) -> PipelineResult<()> {
        if self.still_preview.is_some() {
            debug!("Still preview already running");
            return Ok(());
        }
        self.ensure_no_video_graph()?;
        self.ensure_open()?;

        let branch = StillPreviewBranch::build(
            &self.hal,
            self.camera()?,
            self.config.still_preview_size,
            self.config.preview_format,
            self.config.parameters.framerate(),
        )?;
        self.still_preview = Some(branch);
        Ok(())
    }

    pub fn stop_still_preview(&mut self) {
        if self.still_preview.take().is_some() {
            info!("Still preview stopped");
        }
    }

    /// Capture one JPEG, blocking until the encoder has finished it
    ///
    /// The encoder stage exists only for the duration of the call.
    pub fn capture_still(&mut self) -> PipelineResult<Vec<u8>> {
        self.ensure_no_video_graph()?;
        self.ensure_open()?;

        let branch = StillRecordBranch::build(
            &self.hal,
            self.camera()?,
            self.config.still_record_size,
            self.config.jpeg_quality,
        )?;
        let image = branch.capture();
        drop(branch);

        let image = image?;
        info!(bytes = image.len(), "Still captured");
        Ok(image)
    }

    /// Capture one JPEG into the file at `path`, returning its size
    ///
    /// The file is only created once the image is complete.
    pub fn start_still_record(&mut self, path: impl AsRef<Path>) -> PipelineResult<usize> {
        let image = self.capture_still()?;
        let mut sink = FileSink::create(path)?;
        sink.write_all(&image)?;
        sink.finish()?;
        Ok(image.len())
    }

    /// Capture one JPEG into `sink`, returning its size
    pub fn start_still_record_with(&mut self, mut sink: Box<dyn EncodedSink>) -> PipelineResult<usize> {
        let image = self.capture_still()?;
        sink.write_all(&image)?;
        sink.finish()?;
        Ok(image.len())
    }

    /// Consumer handle of the running preview, video first
    pub fn frame_source(&self) -> Option<FrameSource> {
        self.active_source().cloned()
    }

    fn active_source(&self) -> Option<&FrameSource> {
        self.video_preview
            .as_ref()
            .map(PreviewBranch::source)
            .or_else(|| self.still_preview.as_ref().map(StillPreviewBranch::source))
    }

    /// Bytes of one packed frame from the running preview
    pub fn preview_frame_size(&self) -> Option<usize> {
        self.active_source().map(FrameSource::frame_size)
    }

    /// Block until the running preview delivers its next frame
    pub fn grab(&mut self) -> PipelineResult<()> {
        let source = self
            .active_source()
            .ok_or(PipelineError::InvalidState(StateViolation::NoActivePreview))?;
        source.grab()?;

        self.frames_grabbed += 1;
        if self.frames_grabbed % timing::FRAME_LOG_INTERVAL == 0 {
            debug!(frames = self.frames_grabbed, "Preview frames grabbed");
        }
        Ok(())
    }

    /// Copy the grabbed frame into `dst` without row padding
    ///
    /// Returns the bytes written; 0 when no frame is held.
    pub fn retrieve(&self, dst: &mut [u8]) -> PipelineResult<usize> {
        match self.active_source() {
            Some(source) => source.retrieve(dst),
            None => Ok(0),
        }
    }

    /// As [`CameraPipeline::retrieve`], allocating the destination
    pub fn retrieve_frame(&self) -> Option<Vec<u8>> {
        self.active_source().and_then(FrameSource::retrieve_vec)
    }

    fn commit(&mut self, setting: Setting) {
        if let Some(camera) = &self.camera {
            camera
                .control_channel()
                .commit(&mut self.config.parameters, setting);
        }
    }

    /// Takes effect the next time the camera opens
    pub fn set_frame_rate(&mut self, fps: u32) {
        self.config.parameters.set_framerate(fps);
    }

    pub fn set_brightness(&mut self, value: u32) {
        self.config.parameters.set_brightness(value);
        self.commit(Setting::Brightness);
    }

    pub fn set_sharpness(&mut self, value: i32) {
        self.config.parameters.set_sharpness(value);
        self.commit(Setting::Sharpness);
    }

    pub fn set_contrast(&mut self, value: i32) {
        self.config.parameters.set_contrast(value);
        self.commit(Setting::Contrast);
    }

    pub fn set_saturation(&mut self, value: i32) {
        self.config.parameters.set_saturation(value);
        self.commit(Setting::Saturation);
    }

    pub fn set_iso(&mut self, value: u32) {
        self.config.parameters.set_iso(value);
        self.commit(Setting::Iso);
    }

    pub fn set_video_stabilisation(&mut self, on: bool) {
        self.config.parameters.set_video_stabilisation(on);
        self.commit(Setting::VideoStabilisation);
    }

    pub fn set_exposure_compensation(&mut self, value: i32) {
        self.config.parameters.set_exposure_compensation(value);
        self.commit(Setting::ExposureCompensation);
    }

    /// Microseconds; 0 returns to automatic exposure time
    pub fn set_shutter_speed(&mut self, micros: u32) {
        self.config.parameters.set_shutter_speed(micros);
        self.commit(Setting::Exposure);
    }

    pub fn set_exposure_mode(&mut self, mode: ExposureMode) {
        self.config.parameters.set_exposure_mode(mode);
        self.commit(Setting::Exposure);
    }

    pub fn set_metering_mode(&mut self, mode: MeteringMode) {
        self.config.parameters.set_metering_mode(mode);
        self.commit(Setting::Metering);
    }

    pub fn set_awb_mode(&mut self, mode: AwbMode) {
        self.config.parameters.set_awb_mode(mode);
        self.commit(Setting::AwbMode);
    }

    pub fn set_awb_gains(&mut self, red: f32, blue: f32) {
        self.config.parameters.set_awb_gains(red, blue);
        self.commit(Setting::AwbGains);
    }

    pub fn set_image_effect(&mut self, effect: ImageEffect) {
        self.config.parameters.set_image_effect(effect);
        self.commit(Setting::ImageEffect);
    }

    pub fn set_rotation(&mut self, degrees: i32) {
        self.config.parameters.set_rotation(degrees);
        self.commit(Setting::Rotation);
    }

    pub fn set_flips(&mut self, hflip: bool, vflip: bool) {
        self.config.parameters.set_flips(hflip, vflip);
        self.commit(Setting::Flip);
    }

    /// Applies the next time video preview starts
    pub fn set_video_preview_size(&mut self, width: u32, height: u32) {
        self.config.video_preview_size = FrameSize::new(width, height).capped(MAX_VIDEO_SIZE);
    }

    /// Applies the next time the camera opens
    pub fn set_video_record_size(&mut self, width: u32, height: u32) {
        self.config.video_record_size = FrameSize::new(width, height).capped(MAX_VIDEO_SIZE);
    }

    /// Applies the next time still preview starts
    pub fn set_still_preview_size(&mut self, width: u32, height: u32) {
        self.config.still_preview_size = FrameSize::new(width, height).capped(MAX_VIDEO_SIZE);
    }

    /// Applies to the next still capture
    pub fn set_still_record_size(&mut self, width: u32, height: u32) {
        self.config.still_record_size = FrameSize::new(width, height).capped(MAX_PHOTO_SIZE);
    }

    /// Applies the next time a preview starts
    pub fn set_preview_format(&mut self, format: PreviewFormat) {
        self.config.preview_format = format;
    }
}

impl Drop for CameraPipeline {
    fn drop(&mut self) {
        self.release();
        self.hal.unclaim();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::mmal::ComponentKind;
    use crate::backends::simulated::{FailPoint, SimulatedHardware};
    use std::time::Duration;

    fn small_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.video_preview_size = FrameSize::new(64, 32);
        config.video_record_size = FrameSize::new(128, 64);
        config.still_preview_size = FrameSize::new(64, 32);
        config.still_record_size = FrameSize::new(96, 64);
        config
    }

    fn pipeline() -> (Arc<SimulatedHardware>, CameraPipeline) {
        let sim = Arc::new(SimulatedHardware::with_frame_interval(Duration::from_millis(2)));
        let pipeline = CameraPipeline::new(sim.clone(), small_config()).unwrap();
        (sim, pipeline)
    }

    #[test]
    fn test_open_twice_fails() {
        let (_sim, mut pipeline) = pipeline();
        pipeline.open().unwrap();
        assert_eq!(
            pipeline.open(),
            Err(PipelineError::InvalidState(StateViolation::AlreadyOpen))
        );
        assert!(pipeline.is_open());
    }

    #[test]
    fn test_splitter_follows_video_branches() {
        let (sim, mut pipeline) = pipeline();
        pipeline.start_video_preview().unwrap();
        assert!(pipeline.state().splitter);

        pipeline
            .start_video_record_with(Box::new(MemorySink::new()))
            .unwrap();
        pipeline.stop_video_preview();
        assert!(pipeline.state().splitter);

        pipeline.stop_video_record().unwrap();
        let state = pipeline.state();
        assert!(state.opened);
        assert!(!state.splitter);
        assert_eq!(sim.count_components(ComponentKind::Splitter), 0);
    }

    #[test]
    fn test_grab_without_preview() {
        let (_sim, mut pipeline) = pipeline();
        assert_eq!(
            pipeline.grab(),
            Err(PipelineError::InvalidState(StateViolation::NoActivePreview))
        );
        let mut dst = [0u8; 16];
        assert_eq!(pipeline.retrieve(&mut dst), Ok(0));
    }

    #[test]
    fn test_failed_preview_releases_splitter() {
        let (sim, mut pipeline) = pipeline();
        sim.fail_on(FailPoint::ComponentCreate(ComponentKind::Resizer));

        assert!(pipeline.start_video_preview().is_err());
        let state = pipeline.state();
        assert!(state.opened);
        assert!(!state.splitter);
        assert!(!state.video_preview);
        assert_eq!(sim.live_connections(), 0);
    }

    #[test]
    fn test_setter_commits_when_open() {
        let (sim, mut pipeline) = pipeline();
        pipeline.set_brightness(70);
        assert!(sim.parameter_history(ComponentKind::Camera).is_empty());

        pipeline.open().unwrap();
        let committed = sim.parameter_history(ComponentKind::Camera).len();
        pipeline.set_brightness(150);
        assert_eq!(pipeline.parameters().brightness(), 100);
        assert_eq!(
            sim.parameter_history(ComponentKind::Camera).len(),
            committed + 1
        );
    }
}

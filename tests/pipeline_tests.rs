// SPDX-License-Identifier: MPL-2.0

//! Integration tests for the camera pipeline on simulated hardware

use mmal_camera::backends::mmal::{ComponentKind, Encoding, ExposureMode, Parameter, ParameterId};
use mmal_camera::backends::simulated::synth::{H264_SPS_PREFIX, SIDE_INFO_MARKER};
use mmal_camera::{
    CameraPipeline, FailPoint, FrameSize, MemorySink, PipelineConfig, PipelineError,
    PreviewFormat, SimulatedHardware, StateViolation,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.video_preview_size = FrameSize::new(60, 30);
    config.video_record_size = FrameSize::new(100, 50);
    config.still_preview_size = FrameSize::new(64, 32);
    config.still_record_size = FrameSize::new(96, 64);
    config
}

fn setup() -> (Arc<SimulatedHardware>, CameraPipeline) {
    let sim = Arc::new(SimulatedHardware::with_frame_interval(Duration::from_millis(2)));
    let pipeline = CameraPipeline::new(sim.clone(), test_config()).unwrap();
    (sim, pipeline)
}

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("mmal-camera-it-{}-{}", std::process::id(), name))
}

fn wait_for_bytes(sink: &MemorySink, bytes: usize) {
    let start = Instant::now();
    while sink.contents().len() < bytes {
        assert!(
            start.elapsed() < Duration::from_secs(5),
            "Encoder produced no output"
        );
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn assert_only_camera_left(sim: &SimulatedHardware) {
    assert_eq!(sim.live_components(), vec![ComponentKind::Camera]);
    assert_eq!(sim.live_connections(), 0);
    assert_eq!(sim.live_pools(), 0);
    assert_eq!(sim.enabled_callback_ports(), 0);
}

#[test]
fn test_committed_formats_are_aligned() {
    let (sim, mut pipeline) = setup();
    pipeline.start_video_preview().unwrap();

    let video = sim.output_format(ComponentKind::Camera, 1).unwrap();
    assert_eq!((video.width, video.height), (128, 64));
    assert_eq!((video.crop.width, video.crop.height), (100, 50));

    let preview = sim.output_format(ComponentKind::Resizer, 0).unwrap();
    assert_eq!((preview.width, preview.height), (64, 32));
    assert_eq!((preview.crop.width, preview.crop.height), (60, 30));
}

#[test]
fn test_grab_then_retrieve_yields_one_packed_frame() {
    let (_sim, mut pipeline) = setup();
    pipeline.start_video_preview().unwrap();

    let size = pipeline.preview_frame_size().unwrap();
    assert_eq!(size, 60 * 30 * 3);

    let mut frame = vec![0u8; size];
    pipeline.grab().unwrap();
    assert_eq!(pipeline.retrieve(&mut frame).unwrap(), size);

    // Rows are tightly packed: green carries the row index, blue x + y
    for y in 0..30 {
        for x in 0..60 {
            let px = (y * 60 + x) * 3;
            assert_eq!(frame[px + 1], y as u8, "green at ({}, {})", x, y);
            assert_eq!(frame[px + 2], (x + y) as u8, "blue at ({}, {})", x, y);
        }
    }

    assert_eq!(pipeline.retrieve(&mut frame).unwrap(), 0);
}

#[test]
fn test_retrieve_i420_frame() {
    let (_sim, mut pipeline) = setup();
    pipeline.set_preview_format(PreviewFormat::I420);
    pipeline.set_video_preview_size(64, 32);
    pipeline.start_video_preview().unwrap();

    pipeline.grab().unwrap();
    let frame = pipeline.retrieve_frame().unwrap();
    assert_eq!(frame.len(), 64 * 32 * 3 / 2);

    // First chroma plane starts right after the luma plane
    assert_eq!(frame[64 * 32], 128);
    assert!(pipeline.retrieve_frame().is_none());
}

#[test]
fn test_retrieve_into_small_buffer() {
    let (_sim, mut pipeline) = setup();
    pipeline.start_video_preview().unwrap();
    pipeline.grab().unwrap();

    let mut small = vec![0u8; 16];
    assert_eq!(
        pipeline.retrieve(&mut small),
        Err(PipelineError::BufferTooSmall {
            needed: 60 * 30 * 3,
            got: 16
        })
    );
    // The frame is still held
    assert!(pipeline.retrieve_frame().is_some());
}

#[test]
fn test_preview_start_stop_cycles() {
    let (sim, mut pipeline) = setup();

    for _ in 0..5 {
        pipeline.start_video_preview().unwrap();
        assert!(pipeline.state().splitter);
        pipeline.grab().unwrap();

        pipeline.stop_video_preview();
        let state = pipeline.state();
        assert!(!state.splitter);
        assert!(!state.video_preview);
        assert_only_camera_left(&sim);
    }

    pipeline.release();
    assert!(sim.live_components().is_empty());
    assert_eq!(sim.leaked_buffers(), 0);
}

#[test]
fn test_start_preview_twice_is_noop() {
    let (sim, mut pipeline) = setup();
    pipeline.start_video_preview().unwrap();
    pipeline.start_video_preview().unwrap();
    assert_eq!(sim.count_components(ComponentKind::Resizer), 1);
    assert_eq!(sim.count_components(ComponentKind::Splitter), 1);
}

#[test]
fn test_stop_wakes_waiting_consumer() {
    let (_sim, mut pipeline) = setup();
    pipeline.start_video_preview().unwrap();
    let source = pipeline.frame_source().unwrap();

    let consumer = std::thread::spawn(move || {
        let mut frames = 0u32;
        while source.grab().is_ok() {
            frames += 1;
        }
        (frames, source.retrieve_vec())
    });

    std::thread::sleep(Duration::from_millis(30));
    pipeline.stop_video_preview();

    let (_frames, last) = consumer.join().unwrap();
    assert!(last.is_none());
}

#[test]
fn test_still_preview_delivers_frames() {
    let (sim, mut pipeline) = setup();
    pipeline.start_still_preview().unwrap();
    assert!(!pipeline.state().splitter);
    assert_eq!(sim.count_components(ComponentKind::Resizer), 0);

    pipeline.grab().unwrap();
    let frame = pipeline.retrieve_frame().unwrap();
    assert_eq!(frame.len(), 64 * 32 * 3);

    pipeline.stop_still_preview();
    assert_only_camera_left(&sim);
}

#[test]
fn test_still_record_writes_complete_jpeg() {
    let (sim, mut pipeline) = setup();
    let path = temp_path("still.jpg");

    let bytes = pipeline.start_still_record(&path).unwrap();
    let data = std::fs::read(&path).unwrap();
    assert_eq!(data.len(), bytes);
    assert_eq!(&data[..2], &[0xFF, 0xD8]);
    assert_eq!(&data[data.len() - 2..], &[0xFF, 0xD9]);

    let image = image::load_from_memory(&data).unwrap();
    assert_eq!((image.width(), image.height()), (96, 64));

    assert_eq!(sim.count_components(ComponentKind::ImageEncoder), 0);
    assert_only_camera_left(&sim);
    std::fs::remove_file(&path).ok();
}

#[test]
fn test_still_record_uses_jpeg_quality() {
    let sim = Arc::new(SimulatedHardware::with_frame_interval(Duration::from_millis(2)));
    let mut config = test_config();
    config.jpeg_quality = 40;
    let mut pipeline = CameraPipeline::new(sim.clone(), config).unwrap();

    let sink = MemorySink::new();
    let bytes = pipeline
        .start_still_record_with(Box::new(sink.clone()))
        .unwrap();
    assert_eq!(sink.contents().len(), bytes);
    assert!(sink.is_finished());
    assert_eq!(
        sim.latest_parameter(ComponentKind::ImageEncoder, ParameterId::JpegQuality),
        Some(Parameter::JpegQuality(40))
    );
}

#[test]
fn test_repeated_still_captures() {
    let (sim, mut pipeline) = setup();
    for _ in 0..3 {
        let image = pipeline.capture_still().unwrap();
        assert_eq!(&image[..2], &[0xFF, 0xD8]);
    }
    assert_only_camera_left(&sim);
    assert_eq!(sim.leaked_buffers(), 0);
}

#[test]
fn test_video_record_stream() {
    let (sim, mut pipeline) = setup();
    let sink = MemorySink::new();

    pipeline
        .start_video_record_with(Box::new(sink.clone()))
        .unwrap();
    assert!(pipeline.state().video_record);
    wait_for_bytes(&sink, 2048);
    pipeline.stop_video_record().unwrap();

    let stream = sink.contents();
    assert!(sink.is_finished());
    assert!(stream.starts_with(H264_SPS_PREFIX));
    assert!(
        !stream
            .windows(SIDE_INFO_MARKER.len())
            .any(|w| w == SIDE_INFO_MARKER),
        "side information leaked into the stream"
    );

    assert!(!pipeline.state().splitter);
    assert_only_camera_left(&sim);
}

#[test]
fn test_encoder_outputs_use_visible_size() {
    let (sim, mut pipeline) = setup();
    let bitrate = pipeline.config().video_bitrate;

    pipeline
        .start_video_record_with(Box::new(MemorySink::new()))
        .unwrap();
    let h264 = sim.output_format(ComponentKind::VideoEncoder, 0).unwrap();
    assert_eq!(h264.encoding, Encoding::H264);
    assert_eq!(h264.encoding_variant, None);
    assert_eq!((h264.width, h264.height), (100, 50));
    assert_eq!((h264.crop.width, h264.crop.height), (100, 50));
    assert_eq!(h264.bitrate, bitrate);
    assert_eq!(h264.frame_rate.num, 0);
    pipeline.stop_video_record().unwrap();

    let sink = MemorySink::new();
    pipeline.start_still_record_with(Box::new(sink.clone())).unwrap();
    let image = image::load_from_memory(&sink.contents()).unwrap();
    assert_eq!((image.width(), image.height()), (96, 64));
}

#[test]
fn test_video_record_appends_to_file() {
    let (_sim, mut pipeline) = setup();
    let path = temp_path("record.h264");
    std::fs::write(&path, b"abc").unwrap();

    pipeline.start_video_record(&path).unwrap();
    let start = Instant::now();
    while std::fs::metadata(&path).unwrap().len() <= 3 && start.elapsed() < Duration::from_secs(5) {
        std::thread::sleep(Duration::from_millis(20));
    }
    std::thread::sleep(Duration::from_millis(20));
    pipeline.stop_video_record().unwrap();

    let data = std::fs::read(&path).unwrap();
    assert!(data.starts_with(b"abc"));
    assert!(data[3..].starts_with(H264_SPS_PREFIX));
    std::fs::remove_file(&path).ok();
}

#[test]
fn test_preview_and_record_share_splitter() {
    let (sim, mut pipeline) = setup();
    let sink = MemorySink::new();

    pipeline.start_video_preview().unwrap();
    pipeline
        .start_video_record_with(Box::new(sink.clone()))
        .unwrap();
    assert_eq!(sim.count_components(ComponentKind::Splitter), 1);

    pipeline.grab().unwrap();
    assert!(pipeline.retrieve_frame().is_some());
    wait_for_bytes(&sink, 1);

    pipeline.stop_video_record().unwrap();
    assert!(pipeline.state().splitter);
    pipeline.grab().unwrap();

    pipeline.stop_video_preview();
    assert!(!pipeline.state().splitter);
}

#[test]
fn test_video_and_still_graphs_exclude_each_other() {
    let (sim, mut pipeline) = setup();
    let path = temp_path("excluded.jpg");
    std::fs::remove_file(&path).ok();

    pipeline.start_video_preview().unwrap();
    let before = pipeline.state();
    assert_eq!(
        pipeline.start_still_preview(),
        Err(PipelineError::InvalidState(StateViolation::VideoGraphActive))
    );
    assert_eq!(
        pipeline.start_still_record(&path),
        Err(PipelineError::InvalidState(StateViolation::VideoGraphActive))
    );
    assert!(!path.exists());
    assert_eq!(pipeline.state(), before);
    pipeline.stop_video_preview();

    pipeline.start_still_preview().unwrap();
    assert_eq!(
        pipeline.start_video_preview(),
        Err(PipelineError::InvalidState(StateViolation::StillGraphActive))
    );
    assert_eq!(
        pipeline.start_video_record(&path),
        Err(PipelineError::InvalidState(StateViolation::StillGraphActive))
    );
    assert!(!path.exists());
    assert_eq!(sim.count_components(ComponentKind::Splitter), 0);

    // Stills can still be captured next to the still preview
    assert!(pipeline.capture_still().is_ok());
}

#[test]
fn test_operations_open_lazily() {
    let (_sim, mut pipeline) = setup();
    assert!(!pipeline.is_open());
    pipeline.start_still_preview().unwrap();
    assert!(pipeline.is_open());
}

#[test]
fn test_release_is_idempotent() {
    let (sim, mut pipeline) = setup();
    pipeline.release();
    assert!(!pipeline.is_open());

    pipeline.start_video_preview().unwrap();
    pipeline
        .start_video_record_with(Box::new(MemorySink::new()))
        .unwrap();
    pipeline.release();
    pipeline.release();

    assert_eq!(pipeline.state(), Default::default());
    assert!(sim.live_components().is_empty());
    assert_eq!(sim.live_connections(), 0);
    assert_eq!(sim.live_pools(), 0);
}

#[test]
fn test_second_pipeline_is_busy() {
    let (sim, pipeline) = setup();
    assert!(matches!(
        CameraPipeline::new(sim.clone(), test_config()),
        Err(PipelineError::Busy)
    ));

    drop(pipeline);
    assert!(!sim.is_claimed());
    assert!(CameraPipeline::new(sim, test_config()).is_ok());
}

#[test]
fn test_open_rolls_back_on_failure() {
    for point in [
        FailPoint::ComponentCreate(ComponentKind::Camera),
        FailPoint::FormatCommit(ComponentKind::Camera),
        FailPoint::ComponentEnable(ComponentKind::Camera),
        FailPoint::ParameterSet(ParameterId::CameraConfig),
        FailPoint::ParameterSet(ParameterId::Capture),
    ] {
        let (sim, mut pipeline) = setup();
        sim.fail_on(point);

        assert!(pipeline.open().is_err(), "{:?} should fail open", point);
        assert!(!pipeline.is_open());
        assert!(sim.live_components().is_empty(), "{:?} left components", point);

        sim.clear_failures();
        pipeline.open().unwrap();
    }
}

#[test]
fn test_preview_rolls_back_on_failure() {
    for point in [
        FailPoint::ComponentCreate(ComponentKind::Splitter),
        FailPoint::ConnectionCreate,
        FailPoint::ConnectionEnable,
        FailPoint::FormatCommit(ComponentKind::Resizer),
        FailPoint::PoolCreate(ComponentKind::Resizer),
        FailPoint::PortEnable(ComponentKind::Resizer),
        FailPoint::DeliveryThread,
        FailPoint::ComponentEnable(ComponentKind::Resizer),
    ] {
        let (sim, mut pipeline) = setup();
        pipeline.open().unwrap();
        sim.fail_on(point);

        let result = pipeline.start_video_preview();
        assert!(
            matches!(result, Err(PipelineError::Construction { .. })),
            "{:?} gave {:?}",
            point,
            result
        );
        assert!(!pipeline.state().splitter);
        assert_only_camera_left(&sim);

        sim.clear_failures();
        pipeline.start_video_preview().unwrap();
        pipeline.grab().unwrap();
    }
}

#[test]
fn test_record_rolls_back_on_failure() {
    for point in [
        FailPoint::ComponentCreate(ComponentKind::VideoEncoder),
        FailPoint::ComponentEnable(ComponentKind::VideoEncoder),
        FailPoint::PoolCreate(ComponentKind::VideoEncoder),
        FailPoint::PortEnable(ComponentKind::VideoEncoder),
        FailPoint::ParameterSet(ParameterId::VideoProfile),
    ] {
        let (sim, mut pipeline) = setup();
        pipeline.start_video_preview().unwrap();
        sim.fail_on(point);

        assert!(
            pipeline
                .start_video_record_with(Box::new(MemorySink::new()))
                .is_err(),
            "{:?} should fail recording",
            point
        );
        assert_eq!(sim.count_components(ComponentKind::VideoEncoder), 0);
        // The running preview keeps its splitter
        assert!(pipeline.state().splitter);
        pipeline.grab().unwrap();
    }
}

#[test]
fn test_failed_record_start_removes_new_file() {
    let (sim, mut pipeline) = setup();
    let path = temp_path("failed-record.h264");
    std::fs::remove_file(&path).ok();
    sim.fail_on(FailPoint::ComponentCreate(ComponentKind::VideoEncoder));

    assert!(pipeline.start_video_record(&path).is_err());
    assert!(!path.exists());
    assert!(!pipeline.state().video_record);
    assert_only_camera_left(&sim);

    // An existing file is left as it was
    std::fs::write(&path, b"earlier take").unwrap();
    assert!(pipeline.start_video_record(&path).is_err());
    assert_eq!(std::fs::read(&path).unwrap(), b"earlier take");
    std::fs::remove_file(&path).ok();
}

#[test]
fn test_still_record_rolls_back_on_failure() {
    for point in [
        FailPoint::ComponentCreate(ComponentKind::ImageEncoder),
        FailPoint::PoolCreate(ComponentKind::ImageEncoder),
        FailPoint::ConnectionEnable,
        FailPoint::ParameterSet(ParameterId::JpegQuality),
    ] {
        let (sim, mut pipeline) = setup();
        pipeline.open().unwrap();
        sim.fail_on(point);

        assert!(pipeline.capture_still().is_err(), "{:?} should fail", point);
        assert_only_camera_left(&sim);

        sim.clear_failures();
        assert!(pipeline.capture_still().is_ok());
    }
}

#[test]
fn test_setters_clamp() {
    let (_sim, mut pipeline) = setup();
    pipeline.set_brightness(150);
    pipeline.set_rotation(-90);
    pipeline.set_shutter_speed(500_000);
    pipeline.set_exposure_compensation(-25);
    pipeline.set_saturation(101);

    let params = pipeline.parameters();
    assert_eq!(params.brightness(), 100);
    assert_eq!(params.rotation(), 270);
    assert_eq!(params.shutter_speed(), 330_000);
    assert_eq!(params.exposure_compensation(), -10);
    assert_eq!(params.saturation(), 100);
}

#[test]
fn test_parameters_committed_in_order_on_open() {
    let (sim, mut pipeline) = setup();
    pipeline.open().unwrap();

    let mut ids: Vec<ParameterId> = Vec::new();
    for (_, parameter) in sim.parameter_history(ComponentKind::Camera) {
        let id = parameter.id();
        if ids.last() != Some(&id) && id != ParameterId::CameraConfig && id != ParameterId::Capture {
            ids.push(id);
        }
    }
    assert_eq!(
        ids,
        vec![
            ParameterId::Saturation,
            ParameterId::Sharpness,
            ParameterId::Contrast,
            ParameterId::Brightness,
            ParameterId::Iso,
            ParameterId::ExposureMode,
            ParameterId::ExposureCompensation,
            ParameterId::MeteringMode,
            ParameterId::ImageEffect,
            ParameterId::Rotation,
            ParameterId::Mirror,
            ParameterId::VideoStabilisation,
            ParameterId::AwbMode,
            ParameterId::AwbGains,
        ]
    );
}

#[test]
fn test_manual_shutter_forces_fixed_fps() {
    let (sim, mut pipeline) = setup();
    pipeline.set_shutter_speed(10_000);
    pipeline.open().unwrap();

    let history: Vec<Parameter> = sim
        .parameter_history(ComponentKind::Camera)
        .into_iter()
        .map(|(_, p)| p)
        .collect();
    let shutter = history
        .iter()
        .position(|p| *p == Parameter::ShutterSpeed(10_000))
        .unwrap();
    assert_eq!(
        history[shutter + 1],
        Parameter::ExposureMode(ExposureMode::FixedFps)
    );
    assert_eq!(pipeline.parameters().exposure_mode(), ExposureMode::FixedFps);
}

#[test]
fn test_rotation_written_to_outputs_rounded() {
    let (sim, mut pipeline) = setup();
    pipeline.open().unwrap();
    pipeline.set_rotation(200);

    assert_eq!(pipeline.parameters().rotation(), 200);
    let writes = sim
        .parameter_history(ComponentKind::Camera)
        .into_iter()
        .filter(|(_, p)| *p == Parameter::Rotation(180))
        .count();
    assert_eq!(writes, 3);
}

// SPDX-License-Identifier: GPL-3.0-only

//! Camera parameters and their commit to the control channel

use crate::backends::mmal::{
    AwbMode, ExposureMode, ImageEffect, MeteringMode, MirrorMode, MmalHal, Parameter, PortId,
    Rational,
};
use crate::constants::{defaults, limits};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// User-facing camera settings
///
/// Setters clamp into the range the sensor accepts. Values loaded from a
/// file go through [`CameraParameters::normalized`] for the same reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraParameters {
    framerate: u32,
    sharpness: i32,
    contrast: i32,
    brightness: u32,
    saturation: i32,
    iso: u32,
    video_stabilisation: bool,
    exposure_compensation: i32,
    /// Microseconds, 0 = automatic
    shutter_speed: u32,
    exposure_mode: ExposureMode,
    metering_mode: MeteringMode,
    awb_mode: AwbMode,
    image_effect: ImageEffect,
    /// Degrees in [0, 360)
    rotation: u32,
    hflip: bool,
    vflip: bool,
    awb_red_gain: f32,
    awb_blue_gain: f32,
}

impl Default for CameraParameters {
    fn default() -> Self {
        Self {
            framerate: defaults::FRAMERATE,
            sharpness: 0,
            contrast: 0,
            brightness: 50,
            saturation: 0,
            iso: 100,
            video_stabilisation: false,
            exposure_compensation: 0,
            shutter_speed: 0,
            exposure_mode: ExposureMode::Auto,
            metering_mode: MeteringMode::Average,
            awb_mode: AwbMode::Auto,
            image_effect: ImageEffect::None,
            rotation: 0,
            hflip: false,
            vflip: false,
            awb_red_gain: 0.0,
            awb_blue_gain: 0.0,
        }
    }
}

impl CameraParameters {
    /// Re-apply every clamp, for values that bypassed the setters
    pub fn normalized(mut self) -> Self {
        self.set_framerate(self.framerate);
        self.set_sharpness(self.sharpness);
        self.set_contrast(self.contrast);
        self.set_brightness(self.brightness);
        self.set_saturation(self.saturation);
        self.set_exposure_compensation(self.exposure_compensation);
        self.set_shutter_speed(self.shutter_speed);
        self.set_rotation(self.rotation as i32);
        self.set_awb_gains(self.awb_red_gain, self.awb_blue_gain);
        self
    }

    pub fn framerate(&self) -> u32 {
        self.framerate
    }

    pub fn set_framerate(&mut self, fps: u32) {
        self.framerate = fps.clamp(limits::FRAMERATE_MIN, limits::FRAMERATE_MAX);
    }

    pub fn sharpness(&self) -> i32 {
        self.sharpness
    }

    pub fn set_sharpness(&mut self, value: i32) {
        self.sharpness = value.clamp(limits::SIGNED_LEVEL_MIN, limits::SIGNED_LEVEL_MAX);
    }

    pub fn contrast(&self) -> i32 {
        self.contrast
    }

    pub fn set_contrast(&mut self, value: i32) {
        self.contrast = value.clamp(limits::SIGNED_LEVEL_MIN, limits::SIGNED_LEVEL_MAX);
    }

    pub fn brightness(&self) -> u32 {
        self.brightness
    }

    pub fn set_brightness(&mut self, value: u32) {
        self.brightness = value.min(limits::BRIGHTNESS_MAX);
    }

    pub fn saturation(&self) -> i32 {
        self.saturation
    }

    pub fn set_saturation(&mut self, value: i32) {
        self.saturation = value.clamp(limits::SIGNED_LEVEL_MIN, limits::SIGNED_LEVEL_MAX);
    }

    pub fn iso(&self) -> u32 {
        self.iso
    }

    pub fn set_iso(&mut self, value: u32) {
        self.iso = value;
    }

    pub fn video_stabilisation(&self) -> bool {
        self.video_stabilisation
    }

    pub fn set_video_stabilisation(&mut self, on: bool) {
        self.video_stabilisation = on;
    }

    pub fn exposure_compensation(&self) -> i32 {
        self.exposure_compensation
    }

    pub fn set_exposure_compensation(&mut self, value: i32) {
        self.exposure_compensation = value.clamp(
            limits::EXPOSURE_COMPENSATION_MIN,
            limits::EXPOSURE_COMPENSATION_MAX,
        );
    }

    pub fn shutter_speed(&self) -> u32 {
        self.shutter_speed
    }

    pub fn set_shutter_speed(&mut self, micros: u32) {
        self.shutter_speed = micros.min(limits::SHUTTER_SPEED_MAX_US);
    }

    pub fn exposure_mode(&self) -> ExposureMode {
        self.exposure_mode
    }

    pub fn set_exposure_mode(&mut self, mode: ExposureMode) {
        self.exposure_mode = mode;
    }

    pub fn metering_mode(&self) -> MeteringMode {
        self.metering_mode
    }

    pub fn set_metering_mode(&mut self, mode: MeteringMode) {
        self.metering_mode = mode;
    }

    pub fn awb_mode(&self) -> AwbMode {
        self.awb_mode
    }

    pub fn set_awb_mode(&mut self, mode: AwbMode) {
        self.awb_mode = mode;
    }

    pub fn image_effect(&self) -> ImageEffect {
        self.image_effect
    }

    pub fn set_image_effect(&mut self, effect: ImageEffect) {
        self.image_effect = effect;
    }

    pub fn rotation(&self) -> u32 {
        self.rotation
    }

    /// Any angle is accepted and folded into [0, 360)
    pub fn set_rotation(&mut self, degrees: i32) {
        self.rotation = degrees.rem_euclid(360) as u32;
    }

    pub fn flips(&self) -> (bool, bool) {
        (self.hflip, self.vflip)
    }

    pub fn set_flips(&mut self, hflip: bool, vflip: bool) {
        self.hflip = hflip;
        self.vflip = vflip;
    }

    pub fn awb_gains(&self) -> (f32, f32) {
        (self.awb_red_gain, self.awb_blue_gain)
    }

    pub fn set_awb_gains(&mut self, red: f32, blue: f32) {
        let sane = |g: f32| if g.is_finite() { g.max(0.0) } else { 0.0 };
        self.awb_red_gain = sane(red);
        self.awb_blue_gain = sane(blue);
    }

    /// Hardware writes for one setting
    pub fn hardware_values(&self, setting: Setting) -> Vec<(PortScope, Parameter)> {
        let level = |v: i32| Rational::new(v, 100);
        let control = |p| vec![(PortScope::Control, p)];
        match setting {
            Setting::Saturation => control(Parameter::Saturation(level(self.saturation))),
            Setting::Sharpness => control(Parameter::Sharpness(level(self.sharpness))),
            Setting::Contrast => control(Parameter::Contrast(level(self.contrast))),
            Setting::Brightness => control(Parameter::Brightness(level(self.brightness as i32))),
            Setting::Iso => control(Parameter::Iso(self.iso)),
            Setting::Exposure => {
                let mut values = Vec::new();
                if self.shutter_speed != 0 {
                    values.push((PortScope::Control, Parameter::ShutterSpeed(self.shutter_speed)));
                }
                values.push((PortScope::Control, Parameter::ExposureMode(self.exposure_mode)));
                values
            }
            Setting::ExposureCompensation => {
                control(Parameter::ExposureCompensation(self.exposure_compensation))
            }
            Setting::Metering => control(Parameter::MeteringMode(self.metering_mode)),
            Setting::ImageEffect => control(Parameter::ImageEffect(self.image_effect)),
            Setting::Rotation => vec![(
                PortScope::Outputs,
                Parameter::Rotation((self.rotation / 90 * 90) as i32),
            )],
            Setting::Flip => vec![(
                PortScope::Outputs,
                Parameter::Mirror(MirrorMode::from_flips(self.hflip, self.vflip)),
            )],
            Setting::VideoStabilisation => {
                control(Parameter::VideoStabilisation(self.video_stabilisation))
            }
            Setting::AwbMode => control(Parameter::AwbMode(self.awb_mode)),
            Setting::AwbGains => {
                let fixed = |g: f32| {
                    Rational::new(
                        (g * defaults::AWB_GAIN_DENOMINATOR as f32) as i32,
                        defaults::AWB_GAIN_DENOMINATOR,
                    )
                };
                control(Parameter::AwbGains {
                    red: fixed(self.awb_red_gain),
                    blue: fixed(self.awb_blue_gain),
                })
            }
        }
    }
}

/// One independently committable camera setting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting {
    Saturation,
    Sharpness,
    Contrast,
    Brightness,
    Iso,
    /// Shutter speed together with exposure mode
    Exposure,
    ExposureCompensation,
    Metering,
    ImageEffect,
    Rotation,
    Flip,
    VideoStabilisation,
    AwbMode,
    AwbGains,
}

impl Setting {
    /// Order of a bulk commit
    pub const COMMIT_ORDER: [Setting; 14] = [
        Setting::Saturation,
        Setting::Sharpness,
        Setting::Contrast,
        Setting::Brightness,
        Setting::Iso,
        Setting::Exposure,
        Setting::ExposureCompensation,
        Setting::Metering,
        Setting::ImageEffect,
        Setting::Rotation,
        Setting::Flip,
        Setting::VideoStabilisation,
        Setting::AwbMode,
        Setting::AwbGains,
    ];
}

/// Where a camera parameter is written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortScope {
    /// Camera control port
    Control,
    /// All three camera outputs
    Outputs,
}

/// Write access to the camera's control and output ports
pub struct ControlChannel<'a> {
    hal: &'a dyn MmalHal,
    control: PortId,
    outputs: [PortId; 3],
}

impl<'a> ControlChannel<'a> {
    pub fn new(hal: &'a dyn MmalHal, control: PortId, outputs: [PortId; 3]) -> Self {
        Self {
            hal,
            control,
            outputs,
        }
    }

    /// Write one setting; failures are logged and otherwise ignored
    ///
    /// A manual shutter speed switches the stored exposure mode to
    /// fixed-fps before it is written.
    pub fn commit(&self, params: &mut CameraParameters, setting: Setting) {
        if setting == Setting::Exposure && params.shutter_speed != 0 {
            params.exposure_mode = ExposureMode::FixedFps;
        }

        for (scope, parameter) in params.hardware_values(setting) {
            let ports: &[PortId] = match scope {
                PortScope::Control => std::slice::from_ref(&self.control),
                PortScope::Outputs => &self.outputs,
            };
            for port in ports {
                if let Err(e) = self.hal.port_parameter_set(*port, &parameter) {
                    warn!(?setting, port = %port, error = %e, "Failed to apply camera setting");
                }
            }
        }
    }

    /// Write every setting in [`Setting::COMMIT_ORDER`]
    pub fn commit_all(&self, params: &mut CameraParameters) {
        for setting in Setting::COMMIT_ORDER {
            self.commit(params, setting);
        }
        debug!("Camera parameters committed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setter_clamps() {
        let mut params = CameraParameters::default();
        params.set_brightness(150);
        assert_eq!(params.brightness(), 100);
        params.set_rotation(-90);
        assert_eq!(params.rotation(), 270);
        params.set_rotation(720);
        assert_eq!(params.rotation(), 0);
        params.set_shutter_speed(500_000);
        assert_eq!(params.shutter_speed(), 330_000);
        params.set_sharpness(-250);
        assert_eq!(params.sharpness(), -100);
        params.set_exposure_compensation(11);
        assert_eq!(params.exposure_compensation(), 10);
        params.set_awb_gains(-1.0, f32::NAN);
        assert_eq!(params.awb_gains(), (0.0, 0.0));
    }

    #[test]
    fn test_rotation_rounds_down() {
        let mut params = CameraParameters::default();
        params.set_rotation(200);
        let values = params.hardware_values(Setting::Rotation);
        assert_eq!(values, vec![(PortScope::Outputs, Parameter::Rotation(180))]);
    }

    #[test]
    fn test_rational_levels() {
        let mut params = CameraParameters::default();
        params.set_contrast(-40);
        assert_eq!(
            params.hardware_values(Setting::Contrast),
            vec![(PortScope::Control, Parameter::Contrast(Rational::new(-40, 100)))]
        );
        params.set_awb_gains(1.5, 0.5);
        assert_eq!(
            params.hardware_values(Setting::AwbGains),
            vec![(
                PortScope::Control,
                Parameter::AwbGains {
                    red: Rational::new(98304, 65536),
                    blue: Rational::new(32768, 65536),
                }
            )]
        );
    }

    #[test]
    fn test_auto_exposure_skips_shutter() {
        let params = CameraParameters::default();
        assert_eq!(
            params.hardware_values(Setting::Exposure),
            vec![(PortScope::Control, Parameter::ExposureMode(ExposureMode::Auto))]
        );
    }

    #[test]
    fn test_normalized_after_deserialize() {
        let params: CameraParameters =
            serde_json::from_str(r#"{"brightness": 400, "rotation": 450}"#).unwrap();
        let params = params.normalized();
        assert_eq!(params.brightness(), 100);
        assert_eq!(params.rotation(), 90);
        assert_eq!(params.iso(), 100);
    }
}

//! Value types passed to the Imaging Machine.
//!
//! These types carry no range checks: the device validates arguments and
//! answers `ERR` when one is out of range. They only fix the *shape* of each
//! argument (which light source spellings exist, which fields a camera ROI
//! has) so that every command line the client writes is well-formed.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::protocol::ProtocolError;

/// Number of fluorescence LEDs addressable through a light source code.
pub const FLUO_LED_COUNT: usize = 6;

/// Operating mode of the Imaging Machine software.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Interactive mode of the GUI. The default after connecting or closing.
    #[default]
    Live,
    /// Deterministic, metadata-tagged acquisition mode.
    Script,
}

impl Mode {
    /// Wire spelling of the mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Live => "live",
            Mode::Script => "script",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "live" => Ok(Mode::Live),
            "script" => Ok(Mode::Script),
            other => Err(ProtocolError::InvalidValue(format!("unknown mode '{other}'"))),
        }
    }
}

/// Selection of fluorescence LEDs, written as a 6-digit code such as `"100000"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FluoChannels([bool; FLUO_LED_COUNT]);

impl FluoChannels {
    /// Selection with only the given LED (1-based) switched on.
    ///
    /// Returns `None` when `led` is not in `1..=6`.
    pub fn single(led: usize) -> Option<Self> {
        if !(1..=FLUO_LED_COUNT).contains(&led) {
            return None;
        }
        let mut leds = [false; FLUO_LED_COUNT];
        leds[led - 1] = true;
        Some(Self(leds))
    }

    /// Selection from explicit on/off flags, LED 1 first.
    pub fn from_flags(leds: [bool; FLUO_LED_COUNT]) -> Self {
        Self(leds)
    }

    /// On/off flags, LED 1 first.
    pub fn flags(&self) -> [bool; FLUO_LED_COUNT] {
        self.0
    }

    /// True when no LED is selected.
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|on| !on)
    }
}

impl fmt::Display for FluoChannels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for on in self.0 {
            f.write_str(if on { "1" } else { "0" })?;
        }
        Ok(())
    }
}

impl FromStr for FluoChannels {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != FLUO_LED_COUNT {
            return Err(ProtocolError::InvalidValue(format!(
                "fluorescence code '{s}' must have {FLUO_LED_COUNT} digits"
            )));
        }
        let mut leds = [false; FLUO_LED_COUNT];
        for (slot, c) in leds.iter_mut().zip(s.chars()) {
            *slot = match c {
                '0' => false,
                '1' => true,
                _ => {
                    return Err(ProtocolError::InvalidValue(format!(
                        "fluorescence code '{s}' may only contain 0 and 1"
                    )))
                }
            };
        }
        Ok(Self(leds))
    }
}

/// Light source used for imaging or software autofocus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LightSource {
    /// Transmitted brightfield illumination.
    Brightfield,
    /// One or more fluorescence LEDs.
    Fluo(FluoChannels),
}

impl fmt::Display for LightSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LightSource::Brightfield => f.write_str("brightfield"),
            LightSource::Fluo(leds) => leds.fmt(f),
        }
    }
}

impl FromStr for LightSource {
    type Err = ProtocolError;

    /// Accepts `"bf"`, `"brightfield"` (any case) or a 6-digit LED code.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("bf") || trimmed.eq_ignore_ascii_case("brightfield") {
            return Ok(LightSource::Brightfield);
        }
        trimmed
            .parse::<FluoChannels>()
            .map(LightSource::Fluo)
            .map_err(|_| ProtocolError::InvalidValue(format!("unknown light source '{trimmed}'")))
    }
}

/// Camera region of interest and binning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraRoi {
    /// Left edge in sensor pixels.
    pub x: u32,
    /// Top edge in sensor pixels.
    pub y: u32,
    /// Width in sensor pixels.
    pub width: u32,
    /// Height in sensor pixels.
    pub height: u32,
    /// Binning factor (1, 2 or 4 on the device).
    pub binning: u8,
}

impl CameraRoi {
    /// Sensor width of the Imaging Machine camera.
    pub const SENSOR_WIDTH: u32 = 2048;
    /// Sensor height of the Imaging Machine camera.
    pub const SENSOR_HEIGHT: u32 = 2048;

    /// Full sensor without binning, as restored by `reset_camera`.
    pub fn full_frame() -> Self {
        Self {
            x: 0,
            y: 0,
            width: Self::SENSOR_WIDTH,
            height: Self::SENSOR_HEIGHT,
            binning: 1,
        }
    }
}

impl Default for CameraRoi {
    fn default() -> Self {
        Self::full_frame()
    }
}

/// Z-stack geometry shared by acquisitions and software autofocus.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StackSettings {
    /// Centre of the stack in µm.
    pub z_center: f64,
    /// Number of slices. 1 acquires a single plane.
    pub n_slices: u32,
    /// Distance between slices in µm.
    pub z_step: f64,
}

impl StackSettings {
    /// Stack of `n_slices` planes spaced by `z_step` around `z_center`.
    pub fn new(z_center: f64, n_slices: u32, z_step: f64) -> Self {
        Self {
            z_center,
            n_slices,
            z_step,
        }
    }

    /// Single plane at `z`.
    pub fn single_plane(z: f64) -> Self {
        Self::new(z, 1, 0.0)
    }

    /// Distance covered by the stack: `(n_slices - 1) * z_step`.
    pub fn search_range(&self) -> f64 {
        f64::from(self.n_slices.saturating_sub(1)) * self.z_step
    }

    /// Z position of every slice, bottom first.
    pub fn slice_positions(&self) -> Vec<f64> {
        let half = f64::from(self.n_slices.saturating_sub(1)) / 2.0;
        (0..self.n_slices)
            .map(|i| self.z_center + (f64::from(i) - half) * self.z_step)
            .collect()
    }
}

/// Illumination and detection settings for one channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LightSettings {
    /// Channel number, written to the `CO` filename tag.
    pub channel: u32,
    /// Light source.
    pub light_source: LightSource,
    /// Detection filter slot (1..=4 on the device).
    pub detection_filter: u8,
    /// Relative light intensity in percent.
    pub intensity: u8,
    /// Exposure time in ms.
    pub exposure_ms: u32,
    /// Keep the light on between slices instead of strobing.
    pub light_constant_on: bool,
}

impl LightSettings {
    /// Settings with the light strobed (the device default).
    pub fn new(
        channel: u32,
        light_source: LightSource,
        detection_filter: u8,
        intensity: u8,
        exposure_ms: u32,
    ) -> Self {
        Self {
            channel,
            light_source,
            detection_filter,
            intensity,
            exposure_ms,
            light_constant_on: false,
        }
    }

    /// Keep the light constantly on.
    pub fn with_light_constant_on(mut self, on: bool) -> Self {
        self.light_constant_on = on;
        self
    }
}

/// Parameters of a software autofocus run.
///
/// The objective and camera settings in effect on the device are used.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AutofocusSettings {
    /// Light source used to image the focus stack.
    pub light_source: LightSource,
    /// Detection filter slot.
    pub detection_filter: u8,
    /// Relative light intensity in percent.
    pub intensity: u8,
    /// Exposure time in ms.
    pub exposure_ms: u32,
    /// Stack searched for the best-focus plane.
    pub stack: StackSettings,
}

/// Full argument set of an acquire command.
#[derive(Debug, Clone, PartialEq)]
pub struct Acquisition {
    /// Channel and illumination.
    pub light: LightSettings,
    /// Stack to acquire.
    pub stack: StackSettings,
    /// Output directory. `None` saves into the default project folder under
    /// a plate-specific directory. Created by the device if missing.
    pub save_directory: Option<String>,
}

impl Acquisition {
    /// Start building an acquisition with the mandatory arguments.
    pub fn builder(light: LightSettings, stack: StackSettings) -> AcquisitionBuilder {
        AcquisitionBuilder {
            light,
            stack,
            save_directory: None,
        }
    }
}

/// Builder for [`Acquisition`], defaulting the optional arguments.
#[derive(Debug, Clone)]
pub struct AcquisitionBuilder {
    light: LightSettings,
    stack: StackSettings,
    save_directory: Option<String>,
}

impl AcquisitionBuilder {
    /// Keep the light constantly on (default: strobed).
    pub fn light_constant_on(mut self, on: bool) -> Self {
        self.light.light_constant_on = on;
        self
    }

    /// Save into `dir` instead of the default project folder.
    ///
    /// An empty string is treated like no directory.
    pub fn save_directory(mut self, dir: impl Into<String>) -> Self {
        let dir = dir.into();
        self.save_directory = if dir.is_empty() { None } else { Some(dir) };
        self
    }

    /// Finish the acquisition.
    pub fn build(self) -> Acquisition {
        Acquisition {
            light: self.light,
            stack: self.stack,
            save_directory: self.save_directory,
        }
    }
}

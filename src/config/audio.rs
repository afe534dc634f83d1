//! Capture configuration handed to the device manager.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Sample rates offered to the user. The platform may support only a subset.
pub const SUPPORTED_SAMPLE_RATES: [u32; 6] = [8000, 11025, 16000, 22050, 44100, 48000];

/// Default sample rate (CD quality, supported by nearly every device).
pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

/// Bytes per sample for 16-bit linear PCM.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Where audio is captured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum InputSource {
    /// Default microphone
    #[default]
    Microphone,
    /// Microphone oriented with the camera (webcam mic on desktops)
    CameraMic,
}

impl InputSource {
    pub fn name(&self) -> &'static str {
        match self {
            InputSource::Microphone => "microphone",
            InputSource::CameraMic => "camera-mic",
        }
    }
}

impl std::fmt::Display for InputSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Immutable capture configuration. Encoding is always 16-bit PCM and the
/// channel layout is always mono, so neither is a field.
///
/// A changed value is applied by restarting the pipeline, never by mutating a
/// config that devices were opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    #[serde(default)]
    pub input_source: InputSource,
}

impl AudioConfig {
    pub const CHANNELS: u16 = 1;

    pub fn new(sample_rate: u32, input_source: InputSource) -> Self {
        Self { sample_rate, input_source }
    }

    /// Bytes for `millis` of audio at this rate, rounded down to whole samples.
    pub fn bytes_for_millis(&self, millis: u32) -> usize {
        self.sample_rate as usize * millis as usize / 1000 * BYTES_PER_SAMPLE
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_RATE, InputSource::Microphone)
    }
}

impl std::fmt::Display for AudioConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} Hz mono 16-bit from {}", self.sample_rate, self.input_source)
    }
}

/// Parse a sample rate restricted to [`SUPPORTED_SAMPLE_RATES`].
pub fn parse_sample_rate(s: &str) -> Result<u32, String> {
    let rate: u32 = s.trim().parse().map_err(|_| format!("'{}' is not a valid sample rate", s))?;
    if SUPPORTED_SAMPLE_RATES.contains(&rate) {
        Ok(rate)
    } else {
        Err(format!("sample rate must be one of {:?}, got {}", SUPPORTED_SAMPLE_RATES, rate))
    }
}

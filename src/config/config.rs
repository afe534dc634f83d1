//! Application configuration and CLI argument parsing.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::audio::{AudioConfig, InputSource, parse_sample_rate};

/// Audio mirror application configuration.
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(name = "audio-mirror")]
#[command(author, version, about = "Hear your microphone through your speakers or headset", long_about = None)]
pub struct AppConfig {
    /// Capture and playback sample rate (overrides the saved preference)
    #[arg(long, short = 'r', env = "AUDIO_MIRROR_SAMPLE_RATE", value_parser = parse_sample_rate)]
    pub sample_rate: Option<u32>,

    /// Input source to capture from (overrides the saved preference)
    #[arg(long, short = 'i', value_enum)]
    pub input_source: Option<InputSource>,

    /// File holding the saved capture preferences
    #[arg(long, env = "AUDIO_MIRROR_PREFS", default_value_os_t = default_prefs_file())]
    pub prefs_file: PathBuf,

    /// Start with the pipeline muted
    #[arg(long)]
    pub start_muted: bool,

    /// How often to check the default output device for route changes (0 disables)
    #[arg(long, default_value = "500")]
    pub route_poll_ms: u64,

    /// Enable verbose logging
    #[arg(long, short = 'v')]
    pub verbose: bool,
}

impl AppConfig {
    /// Parse configuration from command line arguments.
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Apply command-line overrides on top of the saved preference.
    pub fn overrides(&self, saved: AudioConfig) -> AudioConfig {
        AudioConfig {
            sample_rate: self.sample_rate.unwrap_or(saved.sample_rate),
            input_source: self.input_source.unwrap_or(saved.input_source),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.prefs_file.is_dir() {
            anyhow::bail!("Preferences path is a directory: {}", self.prefs_file.display());
        }

        if self.route_poll_ms > 0 && self.route_poll_ms < 50 {
            anyhow::bail!("Route poll interval must be 0 (disabled) or at least 50ms");
        }

        Ok(())
    }

    /// Log the current configuration.
    pub fn log_config(&self, audio: &AudioConfig) {
        info!("Configuration:");
        info!("  Sample rate: {} Hz", audio.sample_rate);
        info!("  Input source: {}", audio.input_source);
        info!("  Preferences: {}", self.prefs_file.display());
        info!("  Start muted: {}", self.start_muted);
        if self.route_poll_ms > 0 {
            info!("  Route poll: {}ms", self.route_poll_ms);
        } else {
            info!("  Route poll: disabled");
        }
    }
}

/// Get the default preferences file (~/.audio-mirror/prefs.json).
fn default_prefs_file() -> PathBuf {
    if let Some(home_dir) = dirs::home_dir() {
        home_dir.join(".audio-mirror").join("prefs.json")
    } else {
        PathBuf::from("audio-mirror-prefs.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_replace_saved_values() {
        let config = AppConfig::parse_from(["audio-mirror", "--sample-rate", "16000"]);
        let saved = AudioConfig::new(48000, InputSource::CameraMic);
        assert_eq!(config.overrides(saved), AudioConfig::new(16000, InputSource::CameraMic));
    }

    #[test]
    fn test_rejects_unoffered_rate() {
        assert!(AppConfig::try_parse_from(["audio-mirror", "--sample-rate", "96000"]).is_err());
    }

    #[test]
    fn test_input_source_flag() {
        let config = AppConfig::parse_from(["audio-mirror", "--input-source", "camera-mic"]);
        assert_eq!(config.input_source, Some(InputSource::CameraMic));
    }

    #[test]
    fn test_validate_route_poll() {
        let config = AppConfig::parse_from(["audio-mirror", "--route-poll-ms", "10"]);
        assert!(config.validate().is_err());
    }
}

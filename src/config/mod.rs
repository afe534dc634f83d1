//! Configuration module for the audio mirror.
//!
//! Provides CLI argument parsing, the capture configuration type, and the
//! persisted preferences that supply it.

pub mod audio;
#[allow(clippy::module_inception)]
mod config;
pub mod source;

pub use audio::{AudioConfig, InputSource};
pub use config::AppConfig;
pub use source::{ConfigSource, PreferencesSource};

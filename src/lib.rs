//! Live audio mirroring from an input device to an output device.
//!
//! The [`control::PipelineController`] owns the capture-to-playback worker
//! and sequences mute, unmute, stop and restart commands against it. Devices
//! are reached through [`audio::DeviceManager`], backed by cpal on desktop
//! hosts.

pub mod audio;
pub mod config;
pub mod control;
pub mod error;
#[cfg(test)]
mod testing;

//! Audio I/O module for mirroring capture to playback.
//!
//! This module provides the device abstraction, a cpal-backed platform
//! implementation, the mute gate, and the worker loop that moves audio.

mod cpal_backend;
pub mod device;
pub mod gate;
mod pipeline;
pub mod util;

pub use cpal_backend::CpalBackend;
pub use device::{AudioBackend, DeviceHandles, DeviceManager};
pub use gate::MuteGate;
pub use pipeline::{AudioPipeline, RunStats};

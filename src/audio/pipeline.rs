//! The capture-to-playback loop run by the audio worker.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::device::{DeviceHandles, DeviceManager};
use super::gate::{MuteGate, Wake};
use crate::error::DeviceError;

/// Counters for one pipeline run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub frames: u64,
    pub bytes_read: u64,
    pub short_writes: u64,
}

/// Releases the handles through the device manager on every exit path.
struct ActiveDevices<'a> {
    manager: &'a DeviceManager,
    handles: Option<DeviceHandles>,
}

impl Drop for ActiveDevices<'_> {
    fn drop(&mut self) {
        if let Some(handles) = self.handles.take() {
            self.manager.release(handles);
        }
    }
}

/// One run of the mirroring loop over an acquired device pair.
///
/// Operates only on what it was given at spawn: the handles, the gate, and
/// the stop signal. It never reads shared configuration.
pub struct AudioPipeline {
    handles: DeviceHandles,
    manager: DeviceManager,
    gate: Arc<MuteGate>,
    stop: CancellationToken,
}

impl AudioPipeline {
    pub fn new(handles: DeviceHandles, manager: DeviceManager, gate: Arc<MuteGate>, stop: CancellationToken) -> Self {
        Self {
            handles,
            manager,
            gate,
            stop,
        }
    }

    /// Run until the stop signal is set or a device call fails.
    ///
    /// Blocks the calling thread. Devices are released before this returns,
    /// whether it returns `Ok` or `Err`.
    pub fn run(self) -> Result<RunStats, DeviceError> {
        let AudioPipeline {
            handles,
            manager,
            gate,
            stop,
        } = self;

        let mut devices = ActiveDevices {
            manager: &manager,
            handles: Some(handles),
        };

        let result = match devices.handles.as_mut() {
            Some(handles) => mirror(handles, &gate, &stop),
            None => Ok(RunStats::default()),
        };
        match &result {
            Ok(stats) => info!(
                "Audio pipeline stopped after {} frames ({} bytes, {} short writes)",
                stats.frames, stats.bytes_read, stats.short_writes
            ),
            Err(e) => error!("Audio pipeline failed: {}", e),
        }
        result
    }
}

fn mirror(handles: &mut DeviceHandles, gate: &MuteGate, stop: &CancellationToken) -> Result<RunStats, DeviceError> {
    handles.capture.start()?;
    handles.playback.start()?;
    debug!("Capture and playback started ({} byte frames)", handles.frame_buffer_size);

    let mut buffer = vec![0u8; handles.frame_buffer_size];
    let mut stats = RunStats::default();

    while !stop.is_cancelled() {
        if gate.is_muted() {
            debug!("Muted, parking audio worker");
            match gate.wait_while_muted(stop) {
                Wake::Stopped => break,
                Wake::Unmuted => {
                    debug!("Unmuted, resuming audio worker (generation {})", gate.generation());
                    continue;
                }
            }
        }

        let read = handles.capture.read(&mut buffer)?;
        if read == 0 {
            continue;
        }

        // Only the bytes actually read; the tail still holds the previous frame.
        let written = handles.playback.write(&buffer[..read])?;
        if written < read {
            stats.short_writes += 1;
            if stats.short_writes.is_power_of_two() {
                warn!("Playback accepted {} of {} bytes ({} short writes)", written, read, stats.short_writes);
            }
        }

        stats.frames += 1;
        stats.bytes_read += read as u64;
    }

    Ok(stats)
}

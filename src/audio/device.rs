//! Acquisition and release of the capture/playback device pair.
//!
//! The platform is reached through [`AudioBackend`] so the manager can size
//! buffers and open devices the same way against cpal or a scripted fake.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::audio::{BYTES_PER_SAMPLE, SUPPORTED_SAMPLE_RATES};
use crate::config::{AudioConfig, InputSource};
use crate::error::DeviceError;

/// Blocking source of raw 16-bit mono PCM bytes.
pub trait CaptureDevice: Send {
    fn start(&mut self) -> Result<(), DeviceError>;

    /// Read up to `buf.len()` bytes, returning how many were filled.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError>;

    /// Stop streaming. Must be safe to call repeatedly.
    fn stop(&mut self);
}

/// Blocking sink for raw 16-bit mono PCM bytes.
pub trait PlaybackDevice: Send {
    fn start(&mut self) -> Result<(), DeviceError>;

    /// Write `buf`, returning how many bytes were accepted.
    fn write(&mut self, buf: &[u8]) -> Result<usize, DeviceError>;

    /// Stop streaming. Must be safe to call repeatedly.
    fn stop(&mut self);
}

/// Platform audio subsystem.
pub trait AudioBackend: Send + Sync {
    /// Minimum capture buffer in bytes for `config`, or 0 if unsupported.
    fn min_capture_buffer_size(&self, config: &AudioConfig) -> usize;

    /// Minimum playback buffer in bytes for `config`, or 0 if unsupported.
    fn min_playback_buffer_size(&self, config: &AudioConfig) -> usize;

    fn open_capture(&self, config: &AudioConfig, buffer_size: usize) -> Result<Box<dyn CaptureDevice>, DeviceError>;

    /// Open the media output route.
    fn open_playback(&self, config: &AudioConfig, buffer_size: usize) -> Result<Box<dyn PlaybackDevice>, DeviceError>;
}

/// An opened capture/playback pair, owned by one pipeline run.
pub struct DeviceHandles {
    pub capture: Box<dyn CaptureDevice>,
    pub playback: Box<dyn PlaybackDevice>,
    pub frame_buffer_size: usize,
    config: AudioConfig,
    released: bool,
}

impl DeviceHandles {
    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    fn close(&mut self) {
        if self.released {
            return;
        }
        self.capture.stop();
        self.playback.stop();
        self.released = true;
    }
}

impl Drop for DeviceHandles {
    fn drop(&mut self) {
        if !self.released {
            warn!("Device handles dropped without release, closing");
            self.close();
        }
    }
}

/// Opens and releases device pairs for a given [`AudioConfig`].
#[derive(Clone)]
pub struct DeviceManager {
    backend: Arc<dyn AudioBackend>,
}

impl DeviceManager {
    pub fn new(backend: Arc<dyn AudioBackend>) -> Self {
        Self { backend }
    }

    /// Whether both devices report a usable buffer size for `config`.
    pub fn supports(&self, config: &AudioConfig) -> bool {
        self.backend.min_capture_buffer_size(config) > 0 && self.backend.min_playback_buffer_size(config) > 0
    }

    /// The offered sample rates this platform can run for `source`.
    pub fn supported_sample_rates(&self, source: InputSource) -> Vec<u32> {
        SUPPORTED_SAMPLE_RATES
            .into_iter()
            .filter(|&rate| self.supports(&AudioConfig::new(rate, source)))
            .collect()
    }

    /// Reject a config the platform cannot run before it is saved or applied.
    ///
    /// # Errors
    /// `UnsupportedConfig` when either buffer-size query is non-positive.
    pub fn check_supported(&self, config: &AudioConfig) -> Result<(), DeviceError> {
        if self.supports(config) {
            Ok(())
        } else {
            Err(DeviceError::UnsupportedConfig {
                sample_rate: config.sample_rate,
                source_name: config.input_source.name(),
            })
        }
    }

    /// Size the buffers for `config` and open both devices.
    ///
    /// # Errors
    /// - `UnsupportedConfig` if either buffer-size query is non-positive
    /// - `AcquisitionFailed` if either device cannot be opened
    pub fn acquire(&self, config: AudioConfig) -> Result<DeviceHandles, DeviceError> {
        let capture_size = self.backend.min_capture_buffer_size(&config);
        let playback_size = self.backend.min_playback_buffer_size(&config);
        if capture_size == 0 || playback_size == 0 {
            return Err(DeviceError::UnsupportedConfig {
                sample_rate: config.sample_rate,
                source_name: config.input_source.name(),
            });
        }

        // Whole samples only, so a full read never splits a sample.
        let frame_buffer_size = capture_size.div_ceil(BYTES_PER_SAMPLE) * BYTES_PER_SAMPLE;

        let capture = self.backend.open_capture(&config, frame_buffer_size)?;
        let playback = match self.backend.open_playback(&config, playback_size) {
            Ok(playback) => playback,
            Err(e) => {
                let mut capture = capture;
                capture.stop();
                return Err(e);
            }
        };

        info!(
            "Acquired devices for {} (frame buffer {} bytes, playback buffer {} bytes)",
            config, frame_buffer_size, playback_size
        );

        Ok(DeviceHandles {
            capture,
            playback,
            frame_buffer_size,
            config,
            released: false,
        })
    }

    /// Stop and close both devices. Safe on handles that are already stopped.
    pub fn release(&self, mut handles: DeviceHandles) {
        if handles.released {
            debug!("Device handles already released");
            return;
        }
        handles.close();
        info!("Released devices for {}", handles.config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Event, FakeBackend};

    #[test]
    fn test_frame_buffer_size_positive_for_supported_rates() {
        let backend = Arc::new(FakeBackend::new());
        let manager = DeviceManager::new(backend);
        for rate in crate::config::audio::SUPPORTED_SAMPLE_RATES {
            let handles = manager.acquire(AudioConfig::new(rate, InputSource::Microphone)).unwrap();
            assert!(handles.frame_buffer_size > 0, "rate {} gave empty buffer", rate);
            assert_eq!(handles.frame_buffer_size % BYTES_PER_SAMPLE, 0);
            manager.release(handles);
        }
    }

    #[test]
    fn test_zero_buffer_size_is_unsupported() {
        let backend = Arc::new(FakeBackend::new());
        backend.set_unsupported_rate(11025);
        let manager = DeviceManager::new(backend.clone());

        let result = manager.acquire(AudioConfig::new(11025, InputSource::Microphone));
        assert!(matches!(result, Err(DeviceError::UnsupportedConfig { sample_rate: 11025, .. })));
        assert!(backend.events().is_empty(), "no device should be opened");
    }

    #[test]
    fn test_supported_rates_filtered_by_platform() {
        let backend = Arc::new(FakeBackend::new());
        backend.set_unsupported_rate(8000);
        backend.set_unsupported_rate(11025);
        let manager = DeviceManager::new(backend.clone());

        assert_eq!(manager.supported_sample_rates(InputSource::Microphone), vec![16000, 22050, 44100, 48000]);
        assert!(matches!(
            manager.check_supported(&AudioConfig::new(8000, InputSource::CameraMic)),
            Err(DeviceError::UnsupportedConfig { sample_rate: 8000, source_name: "camera-mic" })
        ));
        assert_eq!(manager.check_supported(&AudioConfig::new(48000, InputSource::Microphone)), Ok(()));
        assert!(backend.events().is_empty(), "checks must not open devices");
    }

    #[test]
    fn test_playback_failure_closes_capture() {
        let backend = Arc::new(FakeBackend::new());
        backend.fail_playback_open(true);
        let manager = DeviceManager::new(backend.clone());

        let result = manager.acquire(AudioConfig::default());
        assert!(matches!(result, Err(DeviceError::AcquisitionFailed { .. })));
        assert_eq!(backend.events(), vec![Event::OpenCapture(1), Event::StopCapture(1)]);
    }

    #[test]
    fn test_release_stops_each_device_once() {
        let backend = Arc::new(FakeBackend::new());
        let manager = DeviceManager::new(backend.clone());

        let handles = manager.acquire(AudioConfig::default()).unwrap();
        manager.release(handles);

        assert_eq!(
            backend.events(),
            vec![Event::OpenCapture(1), Event::OpenPlayback(1), Event::StopCapture(1), Event::StopPlayback(1)]
        );
    }
}

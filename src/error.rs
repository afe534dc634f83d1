//! Error taxonomy for the mirroring pipeline.
//!
//! Device errors come from acquiring or streaming through the platform audio
//! devices. Lifecycle errors come from the controller's command sequencing.

/// Failures while acquiring or using the capture/playback devices.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// The platform reported a non-positive minimum buffer size for the config.
    #[error("unsupported audio config: {sample_rate} Hz from {source_name}")]
    UnsupportedConfig { sample_rate: u32, source_name: &'static str },

    /// A device could not be opened or started.
    #[error("failed to acquire {device}: {reason}")]
    AcquisitionFailed { device: &'static str, reason: String },

    /// A read or write failed mid-stream.
    #[error("{device} I/O failed: {reason}")]
    IoFailed { device: &'static str, reason: String },
}

impl DeviceError {
    pub fn acquisition(device: &'static str, reason: impl ToString) -> Self {
        Self::AcquisitionFailed { device, reason: reason.to_string() }
    }

    pub fn io(device: &'static str, reason: impl ToString) -> Self {
        Self::IoFailed { device, reason: reason.to_string() }
    }
}

/// Failures in sequencing controller commands.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    /// Another start/stop/restart holds the sequencing lock. Retry once it completes.
    #[error("another pipeline transition is in progress")]
    ConcurrentTransition,

    /// The audio worker panicked instead of returning.
    #[error("audio worker panicked")]
    WorkerPanicked,
}

/// Everything a controller command can report to its issuer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("microphone permission denied")]
    PermissionDenied,

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

//! Microphone permission check consulted before any device is acquired.

use cpal::traits::{DeviceTrait, HostTrait};
use tracing::debug;

pub trait PermissionGate: Send + Sync {
    fn is_granted(&self) -> bool;
}

/// Treats the microphone as granted when the default input device can be
/// queried for its configurations. Desktop platforms refuse that query (or
/// expose no device) when the user has denied microphone access.
#[derive(Debug, Default, Clone, Copy)]
pub struct InputPermission;

impl PermissionGate for InputPermission {
    fn is_granted(&self) -> bool {
        let host = cpal::default_host();
        let Some(device) = host.default_input_device() else {
            debug!("No default input device, treating microphone as not granted");
            return false;
        };

        match device.supported_input_configs() {
            Ok(mut configs) => configs.next().is_some(),
            Err(e) => {
                debug!("Input device query refused: {}", e);
                false
            }
        }
    }
}

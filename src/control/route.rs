//! Output route watcher.
//!
//! Desktop hosts expose no "audio becoming noisy" broadcast, so the default
//! output device is polled instead. Any change of route (headphones pulled,
//! output switched) mutes the pipeline before audio leaks to the new device.

use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use cpal::traits::HostTrait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::command::CommandSender;
use super::controller::Command;
use crate::audio::util::get_device_name;

/// Remembers the last seen output route and reports changes.
#[derive(Debug, Default)]
pub struct RouteTracker {
    last: Option<String>,
    primed: bool,
}

impl RouteTracker {
    /// Record the current route. Returns `true` when it differs from the
    /// previous observation; the first observation never counts as a change.
    pub fn observe(&mut self, current: Option<String>) -> bool {
        let changed = self.primed && current != self.last;
        self.primed = true;
        self.last = current;
        changed
    }
}

pub struct RouteWatcher;

impl RouteWatcher {
    /// Poll the default output device every `interval` until `stop` is set,
    /// sending `Mute` whenever the route changes.
    pub fn spawn(interval: Duration, sender: CommandSender, stop: CancellationToken) -> Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("audio-mirror-route".to_string())
            .spawn(move || {
                let mut tracker = RouteTracker::default();
                while !stop.is_cancelled() {
                    let current = cpal::default_host().default_output_device().map(|device| get_device_name(&device));
                    if tracker.observe(current.clone()) {
                        info!("Output route changed to {}, muting", current.as_deref().unwrap_or("none"));
                        if !sender.send(Command::Mute) {
                            break;
                        }
                    }
                    std::thread::sleep(interval);
                }
                debug!("Route watcher exiting");
            })
            .context("Failed to spawn route watcher")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_observation_is_not_a_change() {
        let mut tracker = RouteTracker::default();
        assert!(!tracker.observe(Some("Speakers".to_string())));
        assert!(!tracker.observe(Some("Speakers".to_string())));
    }

    #[test]
    fn test_route_switch_and_loss_are_changes() {
        let mut tracker = RouteTracker::default();
        tracker.observe(Some("Headphones".to_string()));
        assert!(tracker.observe(Some("Speakers".to_string())));
        assert!(tracker.observe(None));
        assert!(!tracker.observe(None));
    }
}

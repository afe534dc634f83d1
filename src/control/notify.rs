//! Console rendering of the pipeline state, standing in for the persistent
//! "mirroring active" notification.

use parking_lot::Mutex;
use tracing::{info, warn};

use super::controller::{PipelineState, StateObserver, StateSnapshot};
use crate::error::PipelineError;

/// What the notification shows for a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    pub title: &'static str,
    pub icon: &'static str,
    /// Label of the toggle action.
    pub action: &'static str,
    /// Ongoing notifications cannot be dismissed by the user.
    pub ongoing: bool,
}

impl Notification {
    /// Render a snapshot, or `None` when the notification should be removed.
    pub fn render(snapshot: StateSnapshot) -> Option<Self> {
        match snapshot.state {
            PipelineState::Stopped => None,
            _ if snapshot.muted => Some(Self {
                title: "Mirroring muted",
                icon: "mic_off",
                action: "Unmute",
                ongoing: false,
            }),
            _ => Some(Self {
                title: "Mirroring active",
                icon: "mic",
                action: "Mute",
                ongoing: true,
            }),
        }
    }
}

/// Logs a notification line on every transition.
#[derive(Default)]
pub struct ConsoleNotifier {
    shown: Mutex<Option<Notification>>,
}

impl ConsoleNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Notification> {
        *self.shown.lock()
    }
}

impl StateObserver for ConsoleNotifier {
    fn state_changed(&self, snapshot: StateSnapshot) {
        let next = Notification::render(snapshot);
        let mut shown = self.shown.lock();
        match next {
            Some(n) => info!("🔔 [{}] {} (action: {})", n.icon, n.title, n.action.to_lowercase()),
            None if shown.is_some() => info!("🔕 Mirroring stopped"),
            None => {}
        }
        *shown = next;
    }

    fn failed(&self, error: &PipelineError) {
        match error {
            PipelineError::PermissionDenied => warn!("🎙️  Microphone permission is required to mirror audio"),
            other => warn!("⚠️  Audio mirror error: {}", other),
        }
    }
}

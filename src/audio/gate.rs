//! Mute gate that parks the audio worker while muted.
//!
//! A monitor (mutex + condition variable) holding the mute flag and a wake
//! generation. `unmute` and `wake` bump the generation so a parked worker can
//! tell an intended wake from a spurious one.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Upper bound on one park before re-checking the stop signal. Wakes never
/// depend on it firing; it only bounds how long a missed stop could go unseen.
const PARK_SLICE: Duration = Duration::from_millis(250);

#[derive(Debug, Default)]
struct GateState {
    muted: bool,
    generation: u64,
    parked: bool,
}

/// Why [`MuteGate::wait_while_muted`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// The gate is open (unmuted).
    Unmuted,
    /// The stop signal is set.
    Stopped,
}

#[derive(Debug, Default)]
pub struct MuteGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl MuteGate {
    pub fn new(muted: bool) -> Self {
        Self {
            state: Mutex::new(GateState { muted, ..Default::default() }),
            cond: Condvar::new(),
        }
    }

    /// Close the gate. Never blocks on the worker.
    pub fn mute(&self) {
        self.state.lock().muted = true;
    }

    /// Open the gate and wake the worker.
    pub fn unmute(&self) {
        let mut state = self.state.lock();
        state.muted = false;
        state.generation += 1;
        drop(state);
        self.cond.notify_all();
    }

    /// Wake a parked worker without opening the gate, so it observes a stop.
    pub fn wake(&self) {
        self.state.lock().generation += 1;
        self.cond.notify_all();
    }

    pub fn is_muted(&self) -> bool {
        self.state.lock().muted
    }

    /// Whether a worker is currently parked in [`wait_while_muted`](Self::wait_while_muted).
    pub fn is_parked(&self) -> bool {
        self.state.lock().parked
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Park the caller while the gate is muted.
    ///
    /// Returns as soon as the gate is unmuted or `stop` is set. Callers must
    /// still check `stop` after an `Unmuted` wake, because a stop may race it.
    pub fn wait_while_muted(&self, stop: &CancellationToken) -> Wake {
        let mut state = self.state.lock();
        state.parked = true;

        let wake = loop {
            if stop.is_cancelled() {
                break Wake::Stopped;
            }
            if !state.muted {
                break Wake::Unmuted;
            }

            let seen = state.generation;
            let timed_out = self.cond.wait_for(&mut state, PARK_SLICE).timed_out();
            if state.generation == seen && !timed_out {
                debug!("Spurious wake in mute gate");
            }
        };

        state.parked = false;
        wake
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_open_gate_returns_immediately() {
        let gate = MuteGate::new(false);
        assert_eq!(gate.wait_while_muted(&CancellationToken::new()), Wake::Unmuted);
    }

    #[test]
    fn test_unmute_wakes_parked_worker_promptly() {
        let gate = Arc::new(MuteGate::new(true));
        let stop = CancellationToken::new();

        let worker_gate = gate.clone();
        let worker_stop = stop.clone();
        let worker = std::thread::spawn(move || worker_gate.wait_while_muted(&worker_stop));

        assert!(crate::testing::wait_until(Duration::from_secs(2), || gate.is_parked()));
        let unmuted_at = Instant::now();
        gate.unmute();

        assert_eq!(worker.join().unwrap(), Wake::Unmuted);
        assert!(unmuted_at.elapsed() < PARK_SLICE, "wake took {:?}", unmuted_at.elapsed());
        assert_eq!(gate.generation(), 1);
        assert!(!gate.is_parked());
    }

    #[test]
    fn test_stop_with_wake_releases_parked_worker() {
        let gate = Arc::new(MuteGate::new(true));
        let stop = CancellationToken::new();

        let worker_gate = gate.clone();
        let worker_stop = stop.clone();
        let worker = std::thread::spawn(move || worker_gate.wait_while_muted(&worker_stop));

        assert!(crate::testing::wait_until(Duration::from_secs(2), || gate.is_parked()));
        stop.cancel();
        gate.wake();

        assert_eq!(worker.join().unwrap(), Wake::Stopped);
        assert!(gate.is_muted(), "stop must not open the gate");
    }

    #[test]
    fn test_mute_does_not_bump_generation() {
        let gate = MuteGate::new(false);
        gate.mute();
        gate.mute();
        assert!(gate.is_muted());
        assert_eq!(gate.generation(), 0);
    }
}

//! Scripted audio backend for exercising the pipeline without hardware.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::audio::device::{AudioBackend, CaptureDevice, PlaybackDevice};
use crate::config::AudioConfig;
use crate::error::DeviceError;

/// How long a fake read waits for a queued frame before returning a short (empty) read.
const READ_WAIT: Duration = Duration::from_millis(5);

/// Default minimum buffer size reported for supported rates.
pub const FAKE_BUFFER_SIZE: usize = 64;

/// Device lifecycle events, tagged with the acquisition number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    OpenCapture(usize),
    OpenPlayback(usize),
    StopCapture(usize),
    StopPlayback(usize),
}

#[derive(Default)]
struct State {
    events: Vec<Event>,
    unsupported_rates: HashSet<u32>,
    fail_playback_open: bool,
    opened: usize,
    frames: VecDeque<Vec<u8>>,
    fail_next_read: Option<String>,
    write_limit: Option<usize>,
    writes: Vec<Vec<u8>>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    changed: Condvar,
}

/// Backend whose devices are driven by the test.
#[derive(Clone, Default)]
pub struct FakeBackend {
    shared: Arc<Shared>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unsupported_rate(&self, rate: u32) {
        self.shared.state.lock().unsupported_rates.insert(rate);
    }

    pub fn fail_playback_open(&self, fail: bool) {
        self.shared.state.lock().fail_playback_open = fail;
    }

    /// Queue one captured frame.
    pub fn push_frame(&self, frame: Vec<u8>) {
        self.shared.state.lock().frames.push_back(frame);
        self.shared.changed.notify_all();
    }

    pub fn fail_next_read(&self, reason: &str) {
        self.shared.state.lock().fail_next_read = Some(reason.to_string());
        self.shared.changed.notify_all();
    }

    /// Cap how many bytes each playback write accepts.
    pub fn set_write_limit(&self, limit: Option<usize>) {
        self.shared.state.lock().write_limit = limit;
    }

    pub fn events(&self) -> Vec<Event> {
        self.shared.state.lock().events.clone()
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.shared.state.lock().writes.clone()
    }

    pub fn pending_frames(&self) -> usize {
        self.shared.state.lock().frames.len()
    }

    /// Block until at least `count` writes were recorded or `timeout` passes.
    pub fn wait_for_writes(&self, count: usize, timeout: Duration) -> Vec<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while state.writes.len() < count {
            if self.shared.changed.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.writes.clone()
    }
}

impl AudioBackend for FakeBackend {
    fn min_capture_buffer_size(&self, config: &AudioConfig) -> usize {
        if self.shared.state.lock().unsupported_rates.contains(&config.sample_rate) { 0 } else { FAKE_BUFFER_SIZE }
    }

    fn min_playback_buffer_size(&self, config: &AudioConfig) -> usize {
        self.min_capture_buffer_size(config)
    }

    fn open_capture(&self, _config: &AudioConfig, _buffer_size: usize) -> Result<Box<dyn CaptureDevice>, DeviceError> {
        let mut state = self.shared.state.lock();
        state.opened += 1;
        let id = state.opened;
        state.events.push(Event::OpenCapture(id));
        Ok(Box::new(FakeCapture {
            id,
            shared: self.shared.clone(),
        }))
    }

    fn open_playback(&self, _config: &AudioConfig, _buffer_size: usize) -> Result<Box<dyn PlaybackDevice>, DeviceError> {
        let mut state = self.shared.state.lock();
        if state.fail_playback_open {
            return Err(DeviceError::acquisition("playback", "scripted failure"));
        }
        let id = state.opened;
        state.events.push(Event::OpenPlayback(id));
        Ok(Box::new(FakePlayback {
            id,
            shared: self.shared.clone(),
        }))
    }
}

struct FakeCapture {
    id: usize,
    shared: Arc<Shared>,
}

impl CaptureDevice for FakeCapture {
    fn start(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError> {
        let mut state = self.shared.state.lock();
        if state.frames.is_empty() && state.fail_next_read.is_none() {
            self.shared.changed.wait_for(&mut state, READ_WAIT);
        }
        if let Some(reason) = state.fail_next_read.take() {
            return Err(DeviceError::io("capture", reason));
        }
        let Some(mut frame) = state.frames.pop_front() else {
            return Ok(0);
        };
        let n = frame.len().min(buf.len());
        buf[..n].copy_from_slice(&frame[..n]);
        if n < frame.len() {
            state.frames.push_front(frame.split_off(n));
        }
        Ok(n)
    }

    fn stop(&mut self) {
        self.shared.state.lock().events.push(Event::StopCapture(self.id));
    }
}

struct FakePlayback {
    id: usize,
    shared: Arc<Shared>,
}

impl PlaybackDevice for FakePlayback {
    fn start(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, DeviceError> {
        let mut state = self.shared.state.lock();
        let accepted = state.write_limit.map_or(buf.len(), |limit| limit.min(buf.len()));
        state.writes.push(buf.to_vec());
        drop(state);
        self.shared.changed.notify_all();
        Ok(accepted)
    }

    fn stop(&mut self) {
        self.shared.state.lock().events.push(Event::StopPlayback(self.id));
    }
}

/// Build `count` frames of `len` bytes, each filled with its index.
pub fn numbered_frames(count: usize, len: usize) -> Vec<Vec<u8>> {
    (0..count).map(|i| vec![i as u8; len]).collect()
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// Permission answer fixed at construction.
pub struct StaticPermission(pub bool);

impl crate::control::PermissionGate for StaticPermission {
    fn is_granted(&self) -> bool {
        self.0
    }
}

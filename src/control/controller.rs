//! Pipeline state machine.
//!
//! Sequences start/mute/unmute/stop/restart, owns the audio worker thread, and
//! announces every completed transition to the registered observers.
//!
//! All transitions happen while holding the sequencing lock, so at most one
//! worker is alive at a time and a restart always joins the old worker (which
//! releases its devices) before acquiring new ones.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::permission::PermissionGate;
use crate::audio::{AudioPipeline, DeviceManager, MuteGate, RunStats};
use crate::config::{AudioConfig, ConfigSource};
use crate::error::{DeviceError, LifecycleError, PipelineError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    Stopped,
    Running,
    Muted,
    Stopping,
    Restarting,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PipelineState::Stopped => "stopped",
            PipelineState::Running => "running",
            PipelineState::Muted => "muted",
            PipelineState::Stopping => "stopping",
            PipelineState::Restarting => "restarting",
        };
        f.write_str(name)
    }
}

/// What observers see after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSnapshot {
    pub state: PipelineState,
    pub muted: bool,
}

impl From<PipelineState> for StateSnapshot {
    fn from(state: PipelineState) -> Self {
        Self {
            state,
            muted: state == PipelineState::Muted,
        }
    }
}

/// Receives completed transitions, e.g. to re-render a notification.
pub trait StateObserver: Send + Sync {
    fn state_changed(&self, snapshot: StateSnapshot);

    fn failed(&self, _error: &PipelineError) {}
}

/// Symbolic control commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Mute,
    Unmute,
    /// Mute when running, unmute when muted, start when stopped.
    Toggle,
    Stop,
    /// Restart with the given config, or the config source's current one.
    Restart(Option<AudioConfig>),
}

impl std::str::FromStr for Command {
    type Err = String;

    /// Parse a toggle-action or console verb. `restart` uses the current config.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" => Ok(Command::Start),
            "mute" => Ok(Command::Mute),
            "unmute" => Ok(Command::Unmute),
            "toggle" => Ok(Command::Toggle),
            "stop" => Ok(Command::Stop),
            "restart" => Ok(Command::Restart(None)),
            other => Err(format!("unknown command '{}'", other)),
        }
    }
}

type ExitHook = Arc<dyn Fn() + Send + Sync>;

struct Worker {
    handle: JoinHandle<Result<RunStats, DeviceError>>,
    stop: CancellationToken,
    /// Set once `run` has returned and the devices are released.
    exited: Arc<AtomicBool>,
    config: AudioConfig,
}

/// Guarded by the sequencing lock.
#[derive(Default)]
struct Sequencer {
    worker: Option<Worker>,
}

pub struct PipelineController {
    devices: DeviceManager,
    config: Arc<dyn ConfigSource>,
    permission: Arc<dyn PermissionGate>,
    gate: Arc<MuteGate>,
    state: RwLock<PipelineState>,
    sequencer: Mutex<Sequencer>,
    observers: Mutex<Vec<Arc<dyn StateObserver>>>,
    exit_hook: Mutex<Option<ExitHook>>,
}

impl PipelineController {
    pub fn new(devices: DeviceManager, config: Arc<dyn ConfigSource>, permission: Arc<dyn PermissionGate>) -> Self {
        Self {
            devices,
            config,
            permission,
            gate: Arc::new(MuteGate::new(false)),
            state: RwLock::new(PipelineState::Stopped),
            sequencer: Mutex::new(Sequencer::default()),
            observers: Mutex::new(Vec::new()),
            exit_hook: Mutex::new(None),
        }
    }

    pub fn add_observer(&self, observer: Arc<dyn StateObserver>) {
        self.observers.lock().push(observer);
    }

    /// Called from the worker thread after it exits and released its devices.
    /// Must not block; the usual hook queues a [`reap_worker`](Self::reap_worker) call.
    pub fn on_worker_exit(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.exit_hook.lock() = Some(Arc::new(hook));
    }

    pub fn state(&self) -> PipelineState {
        *self.state.read()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.state().into()
    }

    /// Config the running worker was started with.
    pub fn active_config(&self) -> Option<AudioConfig> {
        self.sequencer.lock().worker.as_ref().map(|worker| worker.config)
    }

    /// Apply a command, waiting for any in-flight transition to finish first.
    pub fn handle(&self, command: Command) -> Result<PipelineState, PipelineError> {
        let mut seq = self.sequencer.lock();
        self.apply(&mut seq, command)
    }

    /// Apply a command only if no other transition is in flight.
    ///
    /// # Errors
    /// `LifecycleError::ConcurrentTransition` if another command holds the
    /// sequencing lock. Retrying after it completes is safe.
    pub fn try_handle(&self, command: Command) -> Result<PipelineState, PipelineError> {
        let mut seq = self.sequencer.try_lock().ok_or(LifecycleError::ConcurrentTransition)?;
        self.apply(&mut seq, command)
    }

    pub fn start(&self) -> Result<PipelineState, PipelineError> {
        self.handle(Command::Start)
    }

    /// Start with the gate already closed, so no frame reaches playback
    /// before the first unmute. A no-op unless stopped.
    pub fn start_muted(&self) -> Result<PipelineState, PipelineError> {
        let mut seq = self.sequencer.lock();
        self.reap_finished(&mut seq);
        let result = self.do_start(&mut seq, None, true);
        self.report("start muted", result)
    }

    pub fn mute(&self) -> Result<PipelineState, PipelineError> {
        self.handle(Command::Mute)
    }

    pub fn unmute(&self) -> Result<PipelineState, PipelineError> {
        self.handle(Command::Unmute)
    }

    pub fn stop(&self) -> Result<PipelineState, PipelineError> {
        self.handle(Command::Stop)
    }

    pub fn restart(&self, config: Option<AudioConfig>) -> Result<PipelineState, PipelineError> {
        self.handle(Command::Restart(config))
    }

    /// Join a worker that exited on its own and fall back to `Stopped`.
    ///
    /// Returns `None` when no worker has exited.
    pub fn reap_worker(&self) -> Option<Result<RunStats, PipelineError>> {
        let mut seq = self.sequencer.lock();
        self.reap_finished(&mut seq)
    }

    fn apply(&self, seq: &mut Sequencer, command: Command) -> Result<PipelineState, PipelineError> {
        // A failure nobody has collected yet belongs to the next caller that
        // would otherwise only see the resulting `Stopped`.
        if let Some(Err(e)) = self.reap_finished(seq)
            && matches!(command, Command::Mute | Command::Unmute | Command::Stop)
        {
            return Err(e);
        }

        debug!("Handling {:?} in state {}", command, self.state());
        let result = match command {
            Command::Start => self.do_start(seq, None, false),
            Command::Mute => Ok(self.do_mute(seq)),
            Command::Unmute => Ok(self.do_unmute(seq)),
            Command::Toggle => match self.state() {
                PipelineState::Running => Ok(self.do_mute(seq)),
                PipelineState::Muted => Ok(self.do_unmute(seq)),
                _ => self.do_start(seq, None, false),
            },
            Command::Stop => Ok(self.do_stop(seq)),
            Command::Restart(config) => self.do_restart(seq, config),
        };
        self.report(format_args!("{:?}", command), result)
    }

    fn report(&self, what: impl std::fmt::Display, result: Result<PipelineState, PipelineError>) -> Result<PipelineState, PipelineError> {
        if let Err(e) = &result {
            warn!("{} failed: {}", what, e);
            self.notify_failure(e);
        }
        result
    }

    fn do_start(&self, seq: &mut Sequencer, config: Option<AudioConfig>, muted: bool) -> Result<PipelineState, PipelineError> {
        if self.state() != PipelineState::Stopped {
            debug!("Already started ({})", self.state());
            return Ok(self.state());
        }

        // The gate is set before the worker exists so its first frame already obeys it.
        if muted {
            self.gate.mute();
        } else {
            self.gate.unmute();
        }
        let config = config.unwrap_or_else(|| self.config.current());
        seq.worker = Some(self.spawn_worker(config)?);
        let state = if muted { PipelineState::Muted } else { PipelineState::Running };
        Ok(self.transition(seq, state))
    }

    fn do_mute(&self, seq: &mut Sequencer) -> PipelineState {
        match self.state() {
            PipelineState::Running => {
                self.gate.mute();
                self.transition(seq, PipelineState::Muted)
            }
            state => {
                debug!("Mute ignored while {}", state);
                state
            }
        }
    }

    fn do_unmute(&self, seq: &mut Sequencer) -> PipelineState {
        match self.state() {
            PipelineState::Muted => {
                self.gate.unmute();
                self.transition(seq, PipelineState::Running)
            }
            state => {
                debug!("Unmute ignored while {}", state);
                state
            }
        }
    }

    fn do_stop(&self, seq: &mut Sequencer) -> PipelineState {
        if self.state() == PipelineState::Stopped {
            debug!("Already stopped");
            return PipelineState::Stopped;
        }

        self.set_state(seq, PipelineState::Stopping);
        self.join_worker(seq);
        self.transition(seq, PipelineState::Stopped)
    }

    fn do_restart(&self, seq: &mut Sequencer, config: Option<AudioConfig>) -> Result<PipelineState, PipelineError> {
        if self.state() == PipelineState::Stopped {
            return self.do_start(seq, config, false);
        }

        let was_muted = self.gate.is_muted();
        self.set_state(seq, PipelineState::Restarting);
        self.join_worker(seq);

        let config = config.unwrap_or_else(|| self.config.current());
        info!("Restarting audio pipeline with {}", config);
        match self.spawn_worker(config) {
            Ok(worker) => {
                seq.worker = Some(worker);
                let state = if was_muted { PipelineState::Muted } else { PipelineState::Running };
                Ok(self.transition(seq, state))
            }
            Err(e) => {
                self.transition(seq, PipelineState::Stopped);
                Err(e)
            }
        }
    }

    fn spawn_worker(&self, config: AudioConfig) -> Result<Worker, PipelineError> {
        if !self.permission.is_granted() {
            return Err(PipelineError::PermissionDenied);
        }

        let handles = self.devices.acquire(config)?;
        let stop = CancellationToken::new();
        let pipeline = AudioPipeline::new(handles, self.devices.clone(), self.gate.clone(), stop.clone());
        let exit_hook = self.exit_hook.lock().clone();
        let exited = Arc::new(AtomicBool::new(false));
        let worker_exited = exited.clone();

        let handle = std::thread::Builder::new()
            .name("audio-mirror-worker".to_string())
            .spawn(move || {
                let result = pipeline.run();
                worker_exited.store(true, Ordering::Release);
                if let Some(hook) = exit_hook {
                    hook();
                }
                result
            })
            .map_err(|e| DeviceError::acquisition("worker thread", e))?;

        info!("Audio worker started ({})", config);
        Ok(Worker {
            handle,
            stop,
            exited,
            config,
        })
    }

    /// Signal the worker, wake it if parked, and wait for it to release its devices.
    fn join_worker(&self, seq: &mut Sequencer) {
        let Some(worker) = seq.worker.take() else {
            return;
        };

        worker.stop.cancel();
        self.gate.wake();
        match worker.handle.join() {
            Ok(Ok(_)) => debug!("Audio worker joined"),
            Ok(Err(e)) => warn!("Audio worker had already failed: {}", e),
            Err(_) => error!("{}", LifecycleError::WorkerPanicked),
        }
    }

    fn reap_finished(&self, seq: &mut Sequencer) -> Option<Result<RunStats, PipelineError>> {
        // `exited` is set before the exit hook runs, so the join below only
        // waits for the thread to return its result.
        if !seq.worker.as_ref().is_some_and(|worker| worker.exited.load(Ordering::Acquire) || worker.handle.is_finished()) {
            return None;
        }
        let worker = seq.worker.take()?;

        let result = match worker.handle.join() {
            Ok(Ok(stats)) => Ok(stats),
            Ok(Err(e)) => Err(PipelineError::Device(e)),
            Err(_) => Err(PipelineError::Lifecycle(LifecycleError::WorkerPanicked)),
        };

        if let Err(e) = &result {
            error!("Audio worker exited: {}", e);
            self.notify_failure(e);
        }
        self.transition(seq, PipelineState::Stopped);
        Some(result)
    }

    fn set_state(&self, _seq: &mut Sequencer, state: PipelineState) {
        *self.state.write() = state;
    }

    /// Complete a transition and announce it if the state changed.
    fn transition(&self, seq: &mut Sequencer, state: PipelineState) -> PipelineState {
        let previous = self.state();
        self.set_state(seq, state);
        if previous != state {
            info!("Pipeline {} -> {}", previous, state);
        }

        let observers: Vec<_> = self.observers.lock().clone();
        for observer in observers {
            observer.state_changed(state.into());
        }
        state
    }

    fn notify_failure(&self, error: &PipelineError) {
        let observers: Vec<_> = self.observers.lock().clone();
        for observer in observers {
            observer.failed(error);
        }
    }
}

impl Drop for PipelineController {
    fn drop(&mut self) {
        let seq = self.sequencer.get_mut();
        if let Some(worker) = seq.worker.take() {
            worker.stop.cancel();
            self.gate.wake();
            if worker.handle.join().is_err() {
                error!("{}", LifecycleError::WorkerPanicked);
            }
        }
    }
}

//! Command delivery to the controller.
//!
//! Commands arrive asynchronously from stdin, the route watcher, signal
//! handling and preference changes. They are funnelled through one channel
//! into a single control thread, which applies them to the controller in
//! order. Restarts queued back to back collapse into one.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use super::controller::{Command, PipelineController};
use crate::audio::DeviceManager;
use crate::config::audio::parse_sample_rate;
use crate::config::{AudioConfig, ConfigSource, InputSource, PreferencesSource};

enum Request {
    Command(Command),
    WorkerExited,
    Shutdown,
}

/// Cloneable handle for submitting commands to the control thread.
#[derive(Clone)]
pub struct CommandSender {
    tx: Sender<Request>,
}

impl CommandSender {
    /// Queue a command. Returns `false` once the control thread has shut down.
    pub fn send(&self, command: Command) -> bool {
        self.tx.send(Request::Command(command)).is_ok()
    }
}

/// The control thread and its inbound channel.
pub struct CommandQueue {
    tx: Sender<Request>,
    thread: Option<JoinHandle<()>>,
}

impl CommandQueue {
    /// Spawn the control thread for `controller`.
    ///
    /// Also routes worker exits back through the queue so a failed worker is
    /// reaped on the control thread.
    pub fn spawn(controller: Arc<PipelineController>) -> Result<Self> {
        let (tx, rx) = mpsc::channel();

        let exit_tx = tx.clone();
        controller.on_worker_exit(move || {
            let _ = exit_tx.send(Request::WorkerExited);
        });

        let thread = std::thread::Builder::new()
            .name("audio-mirror-control".to_string())
            .spawn(move || run_queue(rx, controller))
            .context("Failed to spawn control thread")?;

        Ok(Self { tx, thread: Some(thread) })
    }

    pub fn sender(&self) -> CommandSender {
        CommandSender { tx: self.tx.clone() }
    }

    /// Map preference changes to restarts carrying the new config.
    pub fn follow_config(&self, source: &dyn ConfigSource) {
        let sender = self.sender();
        source.on_change(Box::new(move |config| {
            info!("Capture preferences changed to {}", config);
            if !sender.send(Command::Restart(Some(config))) {
                debug!("Control thread gone, dropping config change");
            }
        }));
    }

    /// Drain queued commands and stop the control thread.
    pub fn shutdown(mut self) {
        self.join();
    }

    fn join(&mut self) {
        let _ = self.tx.send(Request::Shutdown);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("Control thread panicked");
        }
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        self.join();
    }
}

fn run_queue(rx: Receiver<Request>, controller: Arc<PipelineController>) {
    debug!("Control thread started");

    while let Ok(first) = rx.recv() {
        let mut batch = vec![first];
        batch.extend(rx.try_iter());

        for request in coalesce(batch) {
            match request {
                Request::Command(command) => match controller.handle(command) {
                    Ok(state) => debug!("{:?} -> {}", command, state),
                    Err(e) => warn!("Command {:?} rejected: {}", command, e),
                },
                Request::WorkerExited => {
                    if let Some(Err(e)) = controller.reap_worker() {
                        warn!("Audio pipeline stopped after failure: {}", e);
                    }
                }
                Request::Shutdown => {
                    debug!("Control thread exiting");
                    return;
                }
            }
        }
    }
}

/// Collapse runs of consecutive restarts into the last one. A restart without
/// a config inherits the config of the restart it replaces.
fn coalesce(batch: Vec<Request>) -> Vec<Request> {
    let mut out: Vec<Request> = Vec::with_capacity(batch.len());
    for request in batch {
        if let Request::Command(Command::Restart(config)) = request
            && let Some(Request::Command(Command::Restart(previous))) = out.last_mut()
        {
            debug!("Coalescing queued restart");
            *previous = config.or(*previous);
            continue;
        }
        out.push(request);
    }
    out
}

/// Save `next` as the capture preference, provided the platform can run it.
///
/// An unsupported rate or source is refused before it is persisted, so it never
/// reaches the controller as a restart that would drop the pipeline to stopped.
pub fn save_preference(prefs: &PreferencesSource, devices: &DeviceManager, next: AudioConfig) -> Result<()> {
    if let Err(e) = devices.check_supported(&next) {
        let usable = devices.supported_sample_rates(next.input_source);
        anyhow::bail!("{} (usable rates for {}: {:?})", e, next.input_source, usable);
    }
    prefs.set(next).context("Failed to save preferences")
}

/// One line of console input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleInput {
    Command(Command),
    SetSampleRate(u32),
    SetInputSource(InputSource),
    Status,
    Quit,
}

impl FromStr for ConsoleInput {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or_else(|| "empty command".to_string())?.to_ascii_lowercase();
        let arg = words.next();

        let input = match (verb.as_str(), arg) {
            ("rate", Some(rate)) => ConsoleInput::SetSampleRate(parse_sample_rate(rate)?),
            ("source", Some(source)) => ConsoleInput::SetInputSource(
                <InputSource as clap::ValueEnum>::from_str(source, true).map_err(|_| format!("unknown input source '{}'", source))?,
            ),
            ("status", None) => ConsoleInput::Status,
            ("quit" | "exit", None) => ConsoleInput::Quit,
            (verb, None) => ConsoleInput::Command(verb.parse::<Command>().map_err(|_| format!("unrecognised command '{}'", line.trim()))?),
            _ => return Err(format!("unrecognised command '{}'", line.trim())),
        };

        if words.next().is_some() {
            return Err(format!("unexpected arguments in '{}'", line.trim()));
        }
        Ok(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::PipelineState;
    use crate::testing::{Event, FakeBackend, StaticPermission, wait_until};
    use std::time::Duration;

    fn commands(batch: Vec<Request>) -> Vec<Command> {
        batch
            .into_iter()
            .filter_map(|r| match r {
                Request::Command(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_coalesce_consecutive_restarts() {
        let a = AudioConfig::new(16000, InputSource::Microphone);
        let batch = vec![
            Request::Command(Command::Mute),
            Request::Command(Command::Restart(Some(a))),
            Request::Command(Command::Restart(None)),
            Request::Command(Command::Unmute),
            Request::Command(Command::Restart(None)),
        ];

        assert_eq!(
            commands(coalesce(batch)),
            vec![Command::Mute, Command::Restart(Some(a)), Command::Unmute, Command::Restart(None)]
        );
    }

    #[test]
    fn test_parse_console_input() {
        assert_eq!("mute".parse::<ConsoleInput>(), Ok(ConsoleInput::Command(Command::Mute)));
        assert_eq!(" Restart ".parse::<ConsoleInput>(), Ok(ConsoleInput::Command(Command::Restart(None))));
        assert_eq!("rate 22050".parse::<ConsoleInput>(), Ok(ConsoleInput::SetSampleRate(22050)));
        assert_eq!("source camera-mic".parse::<ConsoleInput>(), Ok(ConsoleInput::SetInputSource(InputSource::CameraMic)));
        assert_eq!("exit".parse::<ConsoleInput>(), Ok(ConsoleInput::Quit));
        assert!("rate 1".parse::<ConsoleInput>().is_err());
        assert!("mute now".parse::<ConsoleInput>().is_err());
        assert!("".parse::<ConsoleInput>().is_err());
    }

    #[test]
    fn test_unsupported_rate_is_not_saved() {
        let backend = FakeBackend::new();
        backend.set_unsupported_rate(8000);
        let devices = DeviceManager::new(Arc::new(backend.clone()));
        let prefs = PreferencesSource::in_memory(AudioConfig::default());
        let changes = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = changes.clone();
        prefs.on_change(Box::new(move |_| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));

        let refused = save_preference(&prefs, &devices, AudioConfig::new(8000, InputSource::Microphone));
        assert!(refused.unwrap_err().to_string().contains("8000"));
        assert_eq!(prefs.current(), AudioConfig::default());
        assert_eq!(changes.load(std::sync::atomic::Ordering::SeqCst), 0);

        let chosen = AudioConfig::new(16000, InputSource::Microphone);
        save_preference(&prefs, &devices, chosen).unwrap();
        assert_eq!(prefs.current(), chosen);
        assert_eq!(changes.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(backend.events().is_empty());
    }

    #[test]
    fn test_config_change_restarts_through_queue() {
        let backend = FakeBackend::new();
        let prefs = Arc::new(PreferencesSource::in_memory(AudioConfig::default()));
        let controller = Arc::new(PipelineController::new(
            DeviceManager::new(Arc::new(backend.clone())),
            prefs.clone(),
            Arc::new(StaticPermission(true)),
        ));

        let queue = CommandQueue::spawn(controller.clone()).unwrap();
        queue.follow_config(prefs.as_ref());
        let sender = queue.sender();

        assert!(sender.send(Command::Start));
        assert!(wait_until(Duration::from_secs(2), || controller.state() == PipelineState::Running));

        let chosen = AudioConfig::new(22050, InputSource::CameraMic);
        prefs.set(chosen).unwrap();
        assert!(wait_until(Duration::from_secs(2), || controller.active_config() == Some(chosen)));

        assert!(sender.send(Command::Stop));
        queue.shutdown();
        assert_eq!(controller.state(), PipelineState::Stopped);
        assert_eq!(backend.events().iter().filter(|e| matches!(e, Event::OpenCapture(_))).count(), 2);
    }

    #[test]
    fn test_failed_worker_reaped_by_queue() {
        let backend = FakeBackend::new();
        let controller = Arc::new(PipelineController::new(
            DeviceManager::new(Arc::new(backend.clone())),
            Arc::new(PreferencesSource::in_memory(AudioConfig::default())),
            Arc::new(StaticPermission(true)),
        ));
        let queue = CommandQueue::spawn(controller.clone()).unwrap();

        queue.sender().send(Command::Start);
        assert!(wait_until(Duration::from_secs(2), || controller.state() == PipelineState::Running));

        backend.fail_next_read("disconnected");
        assert!(wait_until(Duration::from_secs(2), || controller.state() == PipelineState::Stopped));
        queue.shutdown();
    }
}

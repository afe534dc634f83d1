//! Audio Mirror - hear your microphone through your speakers or headset.
//!
//! Captures 16-bit mono PCM from an input device and plays it straight back
//! on the default output with as little delay as the devices allow. Mute,
//! unmute, restart and capture settings can be changed while it runs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::LocalTime;

use audio_mirror::audio::{CpalBackend, DeviceManager};
use audio_mirror::config::{AppConfig, AudioConfig, ConfigSource, PreferencesSource};
use audio_mirror::control::{
    CommandQueue, CommandSender, ConsoleInput, ConsoleNotifier, InputPermission, PipelineController, RouteWatcher, save_preference,
};
use audio_mirror::error::{DeviceError, PipelineError};

/// Forward stdin lines from a plain thread. The thread is detached so a
/// pending read never holds up process exit.
fn spawn_stdin_reader() -> Result<mpsc::UnboundedReceiver<String>> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::Builder::new()
        .name("audio-mirror-stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("Failed to read stdin: {}", e);
                        return;
                    }
                }
            }
            debug!("stdin closed, console commands disabled");
        })
        .context("Failed to spawn stdin reader")?;
    Ok(rx)
}

/// Apply console input until shutdown.
///
/// Lifecycle commands go through the control queue; preference edits go to
/// the preference store, whose change callback queues the restart.
async fn read_console(
    mut lines: mpsc::UnboundedReceiver<String>,
    sender: CommandSender,
    prefs: Arc<PreferencesSource>,
    devices: DeviceManager,
    controller: Arc<PipelineController>,
    shutdown: CancellationToken,
) {
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };

        if line.trim().is_empty() {
            continue;
        }

        match line.parse::<ConsoleInput>() {
            Ok(ConsoleInput::Command(command)) => {
                if !sender.send(command) {
                    break;
                }
            }
            Ok(ConsoleInput::SetSampleRate(sample_rate)) => {
                let next = AudioConfig { sample_rate, ..prefs.current() };
                if let Err(e) = save_preference(&prefs, &devices, next) {
                    warn!("{:#}", e);
                }
            }
            Ok(ConsoleInput::SetInputSource(input_source)) => {
                let next = AudioConfig { input_source, ..prefs.current() };
                if let Err(e) = save_preference(&prefs, &devices, next) {
                    warn!("{:#}", e);
                }
            }
            Ok(ConsoleInput::Status) => {
                let snapshot = controller.snapshot();
                match controller.active_config() {
                    Some(active) => info!("📊 Pipeline {} ({})", snapshot.state, active),
                    None => info!("📊 Pipeline {}", snapshot.state),
                }
            }
            Ok(ConsoleInput::Quit) => {
                shutdown.cancel();
                break;
            }
            Err(e) => {
                warn!("{} (try: start, mute, unmute, toggle, stop, restart, rate <hz>, source <name>, status, quit)", e);
            }
        }
    }
}

/// Wait for shutdown signal (Ctrl+C, SIGTERM, or a quit command).
async fn wait_for_shutdown(shutdown: CancellationToken) {
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("🛑 Received Ctrl+C, shutting down...");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                    }
                    Err(e) => {
                        warn!("Failed to register SIGTERM handler: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("🛑 Received SIGTERM, shutting down...");
        }
        _ = shutdown.cancelled() => {
            info!("🛑 Quit requested, shutting down...");
        }
    }

    shutdown.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let config = AppConfig::from_args();

    // Respect RUST_LOG env var, fallback to verbose flag, default to info
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| if config.verbose { EnvFilter::try_new("debug") } else { EnvFilter::try_new("info") })
        .context("Invalid log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_timer(LocalTime::new(time::macros::format_description!("[hour]:[minute]:[second]")))
        .init();

    info!("🎧 Audio Mirror v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = config.validate() {
        error!("❌ Configuration error: {}", e);
        std::process::exit(1);
    }

    let devices = DeviceManager::new(Arc::new(CpalBackend::new()));

    // Saved preference, with command-line overrides written back as the new preference
    let prefs = Arc::new(PreferencesSource::load(&config.prefs_file, AudioConfig::default()));
    let audio_config = config.overrides(prefs.current());
    if audio_config != prefs.current()
        && let Err(e) = save_preference(&prefs, &devices, audio_config)
    {
        error!("❌ {:#}", e);
        std::process::exit(1);
    }
    config.log_config(&audio_config);

    let controller = Arc::new(PipelineController::new(devices.clone(), prefs.clone(), Arc::new(InputPermission)));
    controller.add_observer(Arc::new(ConsoleNotifier::new()));

    let queue = CommandQueue::spawn(controller.clone())?;
    queue.follow_config(prefs.as_ref());

    // Start synchronously so permission and device problems are reported at launch
    let started = if config.start_muted { controller.start_muted() } else { controller.start() };
    if let Err(e) = started {
        match e {
            PipelineError::PermissionDenied => error!("❌ Microphone access denied. Grant microphone permission and try again."),
            PipelineError::Device(DeviceError::UnsupportedConfig { sample_rate, .. }) => error!(
                "❌ {} Hz is not supported by your devices. Usable rates: {:?}",
                sample_rate,
                devices.supported_sample_rates(audio_config.input_source)
            ),
            other => error!("❌ Failed to start audio mirror: {}", other),
        }
        queue.shutdown();
        std::process::exit(1);
    }

    let shutdown = CancellationToken::new();

    let route_watcher = if config.route_poll_ms > 0 {
        Some(RouteWatcher::spawn(Duration::from_millis(config.route_poll_ms), queue.sender(), shutdown.clone())?)
    } else {
        None
    };

    info!("Mirroring. Type 'mute', 'unmute', 'restart', 'rate <hz>', 'source <name>', 'status' or 'quit'.");
    let console = tokio::spawn(read_console(
        spawn_stdin_reader()?,
        queue.sender(),
        prefs.clone(),
        devices.clone(),
        controller.clone(),
        shutdown.clone(),
    ));

    // Wait for shutdown signal
    wait_for_shutdown(shutdown.clone()).await;

    // Drain queued commands, then stop the worker so devices are released before exit
    queue.shutdown();
    if let Err(e) = controller.stop() {
        warn!("Audio pipeline had already failed: {}", e);
    }

    if let Some(watcher) = route_watcher
        && watcher.join().is_err()
    {
        warn!("Route watcher panicked");
    }
    console.abort();

    info!("✅ Audio mirror stopped");
    Ok(())
}

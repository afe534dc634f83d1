//! Persisted capture preferences and change notification.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::audio::AudioConfig;

/// Callback invoked with the new config whenever the preference changes.
pub type ChangeCallback = Box<dyn Fn(AudioConfig) + Send + Sync>;

/// Supplies the current capture configuration and reports changes.
pub trait ConfigSource: Send + Sync {
    fn current(&self) -> AudioConfig;
    fn on_change(&self, callback: ChangeCallback);
}

/// JSON-file backed preferences (`~/.audio-mirror/prefs.json` by default).
pub struct PreferencesSource {
    path: Option<PathBuf>,
    current: Mutex<AudioConfig>,
    callbacks: Mutex<Vec<Arc<ChangeCallback>>>,
}

impl PreferencesSource {
    /// Load preferences from `path`, falling back to `fallback` when the file
    /// is missing or unreadable.
    pub fn load(path: impl Into<PathBuf>, fallback: AudioConfig) -> Self {
        let path = path.into();
        let current = match read_prefs(&path) {
            Ok(Some(config)) => {
                info!("Loaded preferences from {}: {}", path.display(), config);
                config
            }
            Ok(None) => {
                debug!("No preferences at {}, using {}", path.display(), fallback);
                fallback
            }
            Err(e) => {
                warn!("Ignoring unreadable preferences at {}: {:#}", path.display(), e);
                fallback
            }
        };

        Self {
            path: Some(path),
            current: Mutex::new(current),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Preferences that live only in memory.
    pub fn in_memory(config: AudioConfig) -> Self {
        Self {
            path: None,
            current: Mutex::new(config),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Store a new config, persist it, and notify listeners if it changed.
    pub fn set(&self, config: AudioConfig) -> Result<()> {
        {
            let mut current = self.current.lock();
            if *current == config {
                debug!("Preferences unchanged ({})", config);
                return Ok(());
            }
            *current = config;
        }

        if let Some(path) = &self.path {
            write_prefs(path, &config)?;
            debug!("Saved preferences to {}", path.display());
        }

        // Snapshot so callbacks may register further callbacks without deadlocking.
        let callbacks: Vec<_> = self.callbacks.lock().iter().cloned().collect();
        for callback in callbacks {
            callback(config);
        }
        Ok(())
    }
}

impl ConfigSource for PreferencesSource {
    fn current(&self) -> AudioConfig {
        *self.current.lock()
    }

    fn on_change(&self, callback: ChangeCallback) {
        self.callbacks.lock().push(Arc::new(callback));
    }
}

fn read_prefs(path: &Path) -> Result<Option<AudioConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let config = serde_json::from_str(&text).context("Invalid preferences JSON")?;
    Ok(Some(config))
}

fn write_prefs(path: &Path, config: &AudioConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let text = serde_json::to_string_pretty(config)?;
    fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))
}

//! Host application state shared by the console and the event forwarders.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;
use repeater_core::{ConfigUpdate, DeviceSelection, EngineConfig, RepeaterEngine, RepeaterMode};
use tracing::{debug, warn};

use crate::settings::{save_settings, AppSettings};

/// Cheap to clone; every field is shared.
#[derive(Clone)]
pub struct AppState {
    /// The core engine. Wrapped in `Arc` so blocking command tasks can hold it.
    pub engine: Arc<RepeaterEngine>,
    /// Persisted settings cache; mirrors the engine after every accepted change.
    pub settings: Arc<Mutex<AppSettings>>,
    /// Absolute path to `settings.json`.
    pub settings_path: Arc<PathBuf>,
}

impl AppState {
    pub fn new(engine: RepeaterEngine, settings: AppSettings, settings_path: PathBuf) -> Self {
        Self {
            engine: Arc::new(engine),
            settings: Arc::new(Mutex::new(settings)),
            settings_path: Arc::new(settings_path),
        }
    }

    /// Write the current settings to disk.
    pub fn persist(&self) -> anyhow::Result<()> {
        let settings = self.settings.lock().clone();
        save_settings(&self.settings_path, &settings).with_context(|| {
            format!("failed to save settings to {}", self.settings_path.display())
        })?;
        debug!(path = %self.settings_path.display(), "settings saved");
        Ok(())
    }

    /// Persist, logging instead of failing. Used where a save error must not
    /// abort the operation that triggered it.
    pub fn persist_or_warn(&self) {
        if let Err(e) = self.persist() {
            warn!("{e:#}");
        }
    }

    /// Forward a partial update to the engine; on acceptance, store and save it.
    pub fn update_config(&self, update: &ConfigUpdate) -> anyhow::Result<EngineConfig> {
        let accepted = self.engine.update_config(update)?;
        self.settings.lock().set_engine_config(&accepted);
        self.persist_or_warn();
        Ok(accepted)
    }

    pub fn switch_mode(&self, mode: RepeaterMode) -> anyhow::Result<()> {
        self.engine.switch_mode(mode)?;
        self.settings.lock().mode = mode;
        self.persist_or_warn();
        Ok(())
    }

    /// Change device selection; applied at the next start.
    pub fn set_devices(&self, devices: DeviceSelection) {
        {
            let mut settings = self.settings.lock();
            settings.input_device = devices.input.clone();
            settings.output_device = devices.output.clone();
        }
        self.engine.set_devices(devices);
        self.persist_or_warn();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repeater_core::audio::memory::MemoryBackend;

    fn state(name: &str) -> AppState {
        let (backend, _feed, _out) = MemoryBackend::new();
        let engine = RepeaterEngine::with_backend(EngineConfig::default(), backend).unwrap();
        let path = std::env::temp_dir()
            .join(format!("repeater-state-{}-{name}", std::process::id()))
            .join("settings.json");
        AppState::new(engine, AppSettings::default(), path)
    }

    #[test]
    fn accepted_update_is_saved() {
        let state = state("accepted");
        state
            .update_config(&ConfigUpdate {
                dead_time_seconds: Some(4.0),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(state.settings.lock().dead_time_seconds, 4.0);
        let saved = crate::settings::load_settings(&state.settings_path);
        assert_eq!(saved.dead_time_seconds, 4.0);
        let _ = std::fs::remove_dir_all(state.settings_path.parent().unwrap());
    }

    #[test]
    fn rejected_update_leaves_settings_alone() {
        let state = state("rejected");
        let before = state.settings.lock().clone();
        assert!(state
            .update_config(&ConfigUpdate {
                stop_threshold: Some(5000.0),
                ..Default::default()
            })
            .is_err());
        assert_eq!(*state.settings.lock(), before);
        assert!(!state.settings_path.exists());
    }

    #[test]
    fn mode_and_devices_follow_the_engine() {
        let state = state("mode");
        state.switch_mode(RepeaterMode::Duplex).unwrap();
        state.set_devices(DeviceSelection {
            input: Some("Mic".into()),
            output: None,
        });
        assert_eq!(state.engine.mode(), RepeaterMode::Duplex);
        assert_eq!(state.engine.devices().input.as_deref(), Some("Mic"));
        let settings = state.settings.lock().clone();
        assert_eq!(settings.mode, RepeaterMode::Duplex);
        assert_eq!(settings.input_device.as_deref(), Some("Mic"));
        let _ = std::fs::remove_dir_all(state.settings_path.parent().unwrap());
    }
}

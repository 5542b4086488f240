//! Persistent application settings (JSON file in the app data directory).

use std::fs;
use std::path::{Path, PathBuf};

use repeater_core::{
    dsp::equalizer::{BAND_COUNT, MAX_GAIN_DB, MIN_GAIN_DB},
    engine::config::{
        MAX_DEAD_TIME_SECONDS, MAX_OUTPUT_GAIN_DB, MAX_QUEUE_CAPACITY, MAX_RECORD_SECONDS,
        MAX_SILENCE_TIMEOUT_SECONDS, MAX_SMOOTHING_MS, MAX_THRESHOLD, MIN_QUEUE_CAPACITY,
        MIN_RECORD_SECONDS, MIN_SILENCE_TIMEOUT_SECONDS,
    },
    DeviceSelection, EngineConfig, RepeaterMode,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Everything the host remembers between runs.
///
/// Older config files used snake_case keys and shorter time names
/// (`rise_time`, `record_time`, ...); those are accepted on load and the file
/// is rewritten in the current format on the next save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    #[serde(alias = "input_device")]
    pub input_device: Option<String>,
    #[serde(alias = "output_device")]
    pub output_device: Option<String>,
    pub mode: RepeaterMode,
    #[serde(alias = "start_threshold")]
    pub start_threshold: f32,
    #[serde(alias = "stop_threshold")]
    pub stop_threshold: f32,
    #[serde(alias = "rise_time")]
    pub attack_ms: f32,
    #[serde(alias = "fall_time")]
    pub release_ms: f32,
    #[serde(alias = "record_time")]
    pub max_record_seconds: f32,
    #[serde(alias = "stop_time")]
    pub silence_timeout_seconds: f32,
    #[serde(alias = "dead_time")]
    pub dead_time_seconds: f32,
    pub output_gain_db: f32,
    pub eq_gains_db: [f32; BAND_COUNT],
    pub queue_capacity: usize,
}

impl Default for AppSettings {
    fn default() -> Self {
        let mut settings = Self {
            input_device: None,
            output_device: None,
            mode: RepeaterMode::default(),
            start_threshold: 0.0,
            stop_threshold: 0.0,
            attack_ms: 0.0,
            release_ms: 0.0,
            max_record_seconds: 0.0,
            silence_timeout_seconds: 0.0,
            dead_time_seconds: 0.0,
            output_gain_db: 0.0,
            eq_gains_db: [0.0; BAND_COUNT],
            queue_capacity: 0,
        };
        settings.set_engine_config(&EngineConfig::default());
        settings
    }
}

impl AppSettings {
    /// Clamp every value into its accepted range. A stop threshold above the
    /// start threshold is lowered to it.
    pub fn normalize(&mut self) {
        self.input_device = normalize_device_name(self.input_device.as_deref());
        self.output_device = normalize_device_name(self.output_device.as_deref());

        self.start_threshold = clamp_finite(self.start_threshold, 0.0, MAX_THRESHOLD, 1000.0);
        self.stop_threshold = clamp_finite(self.stop_threshold, 0.0, MAX_THRESHOLD, 100.0);
        if self.stop_threshold > self.start_threshold {
            self.stop_threshold = self.start_threshold;
        }
        self.attack_ms = clamp_finite(self.attack_ms, 0.0, MAX_SMOOTHING_MS, 0.0);
        self.release_ms = clamp_finite(self.release_ms, 0.0, MAX_SMOOTHING_MS, 100.0);
        self.max_record_seconds = clamp_finite(
            self.max_record_seconds,
            MIN_RECORD_SECONDS,
            MAX_RECORD_SECONDS,
            30.0,
        );
        self.silence_timeout_seconds = clamp_finite(
            self.silence_timeout_seconds,
            MIN_SILENCE_TIMEOUT_SECONDS,
            MAX_SILENCE_TIMEOUT_SECONDS,
            0.5,
        );
        self.dead_time_seconds =
            clamp_finite(self.dead_time_seconds, 0.0, MAX_DEAD_TIME_SECONDS, 2.0);
        self.output_gain_db = clamp_finite(
            self.output_gain_db,
            -MAX_OUTPUT_GAIN_DB,
            MAX_OUTPUT_GAIN_DB,
            0.0,
        );
        for gain in &mut self.eq_gains_db {
            *gain = clamp_finite(*gain, MIN_GAIN_DB, MAX_GAIN_DB, 0.0);
        }
        self.queue_capacity = self
            .queue_capacity
            .clamp(MIN_QUEUE_CAPACITY, MAX_QUEUE_CAPACITY);
    }

    /// Engine parameters carried by these settings.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            start_threshold: self.start_threshold,
            stop_threshold: self.stop_threshold,
            attack_ms: self.attack_ms,
            release_ms: self.release_ms,
            max_record_seconds: self.max_record_seconds,
            silence_timeout_seconds: self.silence_timeout_seconds,
            dead_time_seconds: self.dead_time_seconds,
            output_gain_db: self.output_gain_db,
            eq_gains_db: self.eq_gains_db,
            queue_capacity: self.queue_capacity,
        }
    }

    /// Copy an accepted engine configuration back into the settings.
    pub fn set_engine_config(&mut self, config: &EngineConfig) {
        self.start_threshold = config.start_threshold;
        self.stop_threshold = config.stop_threshold;
        self.attack_ms = config.attack_ms;
        self.release_ms = config.release_ms;
        self.max_record_seconds = config.max_record_seconds;
        self.silence_timeout_seconds = config.silence_timeout_seconds;
        self.dead_time_seconds = config.dead_time_seconds;
        self.output_gain_db = config.output_gain_db;
        self.eq_gains_db = config.eq_gains_db;
        self.queue_capacity = config.queue_capacity;
    }

    pub fn devices(&self) -> DeviceSelection {
        DeviceSelection {
            input: self.input_device.clone(),
            output: self.output_device.clone(),
        }
    }
}

fn clamp_finite(value: f32, min: f32, max: f32, fallback: f32) -> f32 {
    if value.is_finite() {
        value.clamp(min, max)
    } else {
        fallback
    }
}

pub fn normalize_device_name(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string)
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Lattice Labs")
            .join("Repeater")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("repeater")
            .join("settings.json")
    }
}

/// Missing or unreadable files fall back to defaults.
pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str::<AppSettings>(&raw).unwrap_or_else(|e| {
            warn!(path = %path.display(), "ignoring corrupt settings file: {e}");
            AppSettings::default()
        }),
        Err(_) => AppSettings::default(),
    };
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

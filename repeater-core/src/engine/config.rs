//! Engine parameters, validation, and the shared handle the loops read from.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::audio::SAMPLE_RATE;
use crate::dsp::equalizer::{BAND_COUNT, MAX_GAIN_DB, MIN_GAIN_DB};
use crate::error::{RepeaterError, Result};

pub const MAX_THRESHOLD: f32 = 10_000.0;
pub const MAX_SMOOTHING_MS: f32 = 1_000.0;
pub const MIN_RECORD_SECONDS: f32 = 1.0;
pub const MAX_RECORD_SECONDS: f32 = 120.0;
pub const MIN_SILENCE_TIMEOUT_SECONDS: f32 = 0.1;
pub const MAX_SILENCE_TIMEOUT_SECONDS: f32 = 5.0;
pub const MAX_DEAD_TIME_SECONDS: f32 = 10.0;
pub const MAX_OUTPUT_GAIN_DB: f32 = 24.0;
pub const MIN_QUEUE_CAPACITY: usize = 1;
pub const MAX_QUEUE_CAPACITY: usize = 16;

/// Capture/playback arrangement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeaterMode {
    /// Record, then play back; never both at once.
    #[default]
    Simplex,
    /// Capture and playback run concurrently.
    Duplex,
}

impl fmt::Display for RepeaterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepeaterMode::Simplex => f.write_str("simplex"),
            RepeaterMode::Duplex => f.write_str("duplex"),
        }
    }
}

impl FromStr for RepeaterMode {
    type Err = RepeaterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simplex" | "half" | "half-duplex" => Ok(RepeaterMode::Simplex),
            "duplex" | "full" | "full-duplex" => Ok(RepeaterMode::Duplex),
            other => Err(RepeaterError::InvalidConfig(format!(
                "unknown mode '{other}' (expected simplex or duplex)"
            ))),
        }
    }
}

/// Configuration for `RepeaterEngine`.
///
/// Thresholds are smoothed mean-absolute levels in `i16` sample units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct EngineConfig {
    /// Level at or above which recording starts. Default: 1000.
    pub start_threshold: f32,
    /// Level at or below which the silence timer runs. Default: 100.
    pub stop_threshold: f32,
    /// Rise time constant of the level detector. Default: 0 ms (instant).
    pub attack_ms: f32,
    /// Fall time constant of the level detector. Default: 100 ms.
    pub release_ms: f32,
    /// Recording length cap. Default: 30 s.
    pub max_record_seconds: f32,
    /// Continuous quiet time that ends a recording. Default: 0.5 s.
    pub silence_timeout_seconds: f32,
    /// Simplex only: input ignored for this long after playback. Default: 2 s.
    pub dead_time_seconds: f32,
    /// Flat gain applied after the equalizer. Default: 0 dB.
    pub output_gain_db: f32,
    /// Equalizer band gains, low to high. Default: all 0 dB.
    pub eq_gains_db: [f32; BAND_COUNT],
    /// Duplex only: completed buffers waiting for playback. Default: 4.
    pub queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            start_threshold: 1_000.0,
            stop_threshold: 100.0,
            attack_ms: 0.0,
            release_ms: 100.0,
            max_record_seconds: 30.0,
            silence_timeout_seconds: 0.5,
            dead_time_seconds: 2.0,
            output_gain_db: 0.0,
            eq_gains_db: [0.0; BAND_COUNT],
            queue_capacity: 4,
        }
    }
}

fn check_range(name: &str, value: f32, min: f32, max: f32) -> Result<()> {
    if !value.is_finite() || value < min || value > max {
        return Err(RepeaterError::InvalidConfig(format!(
            "{name} must be between {min} and {max}, got {value}"
        )));
    }
    Ok(())
}

impl EngineConfig {
    /// Check every parameter and the threshold ordering.
    pub fn validate(&self) -> Result<()> {
        check_range("start_threshold", self.start_threshold, 0.0, MAX_THRESHOLD)?;
        check_range("stop_threshold", self.stop_threshold, 0.0, MAX_THRESHOLD)?;
        if self.stop_threshold > self.start_threshold {
            return Err(RepeaterError::InvalidConfig(format!(
                "stop_threshold ({}) must not exceed start_threshold ({})",
                self.stop_threshold, self.start_threshold
            )));
        }
        check_range("attack_ms", self.attack_ms, 0.0, MAX_SMOOTHING_MS)?;
        check_range("release_ms", self.release_ms, 0.0, MAX_SMOOTHING_MS)?;
        check_range(
            "max_record_seconds",
            self.max_record_seconds,
            MIN_RECORD_SECONDS,
            MAX_RECORD_SECONDS,
        )?;
        check_range(
            "silence_timeout_seconds",
            self.silence_timeout_seconds,
            MIN_SILENCE_TIMEOUT_SECONDS,
            MAX_SILENCE_TIMEOUT_SECONDS,
        )?;
        check_range(
            "dead_time_seconds",
            self.dead_time_seconds,
            0.0,
            MAX_DEAD_TIME_SECONDS,
        )?;
        check_range(
            "output_gain_db",
            self.output_gain_db,
            -MAX_OUTPUT_GAIN_DB,
            MAX_OUTPUT_GAIN_DB,
        )?;
        for (band, gain) in self.eq_gains_db.iter().enumerate() {
            check_range(&format!("eq band {}", band + 1), *gain, MIN_GAIN_DB, MAX_GAIN_DB)?;
        }
        if !(MIN_QUEUE_CAPACITY..=MAX_QUEUE_CAPACITY).contains(&self.queue_capacity) {
            return Err(RepeaterError::InvalidConfig(format!(
                "queue_capacity must be between {MIN_QUEUE_CAPACITY} and {MAX_QUEUE_CAPACITY}, got {}",
                self.queue_capacity
            )));
        }
        Ok(())
    }

    /// Inclusive capture buffer cap in samples.
    pub fn max_record_samples(&self) -> usize {
        seconds_to_samples(self.max_record_seconds)
    }

    /// Quiet samples needed to end a recording.
    pub fn silence_timeout_samples(&self) -> usize {
        seconds_to_samples(self.silence_timeout_seconds)
    }

    /// Samples of input ignored after simplex playback.
    pub fn dead_time_samples(&self) -> usize {
        seconds_to_samples(self.dead_time_seconds)
    }
}

fn seconds_to_samples(seconds: f32) -> usize {
    (f64::from(seconds.max(0.0)) * f64::from(SAMPLE_RATE)).round() as usize
}

/// Partial configuration change. `None` fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct ConfigUpdate {
    pub start_threshold: Option<f32>,
    pub stop_threshold: Option<f32>,
    pub attack_ms: Option<f32>,
    pub release_ms: Option<f32>,
    pub max_record_seconds: Option<f32>,
    pub silence_timeout_seconds: Option<f32>,
    pub dead_time_seconds: Option<f32>,
    pub output_gain_db: Option<f32>,
    pub eq_gains_db: Option<[f32; BAND_COUNT]>,
    /// Single-band change: `(band index 0..5, gain_db)`.
    pub eq_band: Option<(usize, f32)>,
    pub queue_capacity: Option<usize>,
}

impl ConfigUpdate {
    /// Merge onto `base` and validate the result. `base` is left untouched.
    pub fn apply_to(&self, base: &EngineConfig) -> Result<EngineConfig> {
        let mut next = base.clone();
        macro_rules! merge {
            ($($field:ident),* $(,)?) => {
                $(if let Some(v) = self.$field { next.$field = v; })*
            };
        }
        merge!(
            start_threshold,
            stop_threshold,
            attack_ms,
            release_ms,
            max_record_seconds,
            silence_timeout_seconds,
            dead_time_seconds,
            output_gain_db,
            eq_gains_db,
            queue_capacity,
        );
        if let Some((band, gain)) = self.eq_band {
            let slot = next.eq_gains_db.get_mut(band).ok_or_else(|| {
                RepeaterError::InvalidConfig(format!(
                    "eq band must be between 1 and {BAND_COUNT}, got {}",
                    band + 1
                ))
            })?;
            *slot = gain;
        }
        next.validate()?;
        Ok(next)
    }

    pub fn is_empty(&self) -> bool {
        self == &ConfigUpdate::default()
    }
}

impl From<EngineConfig> for ConfigUpdate {
    fn from(c: EngineConfig) -> Self {
        Self {
            start_threshold: Some(c.start_threshold),
            stop_threshold: Some(c.stop_threshold),
            attack_ms: Some(c.attack_ms),
            release_ms: Some(c.release_ms),
            max_record_seconds: Some(c.max_record_seconds),
            silence_timeout_seconds: Some(c.silence_timeout_seconds),
            dead_time_seconds: Some(c.dead_time_seconds),
            output_gain_db: Some(c.output_gain_db),
            eq_gains_db: Some(c.eq_gains_db),
            eq_band: None,
            queue_capacity: Some(c.queue_capacity),
        }
    }
}

/// Latest valid configuration, shared between the control side and the loops.
///
/// Writers swap the whole value and bump `generation`; loops compare the
/// generation at each iteration boundary and clone only when it moved.
#[derive(Debug)]
pub struct SharedConfig {
    current: RwLock<EngineConfig>,
    generation: AtomicU64,
}

impl SharedConfig {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            current: RwLock::new(config),
            generation: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> EngineConfig {
        self.current.read().clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Validate and publish an update. On error the previous value stays.
    pub fn update(&self, update: &ConfigUpdate) -> Result<EngineConfig> {
        let mut guard = self.current.write();
        let next = update.apply_to(&guard)?;
        *guard = next.clone();
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(next)
    }

    /// Replace the whole configuration after validating it.
    pub fn replace(&self, config: EngineConfig) -> Result<()> {
        config.validate()?;
        *self.current.write() = config;
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

/// Per-loop cached copy of the shared configuration.
#[derive(Debug)]
pub struct ConfigView {
    config: EngineConfig,
    generation: u64,
}

impl ConfigView {
    pub fn new(shared: &SharedConfig) -> Self {
        let generation = shared.generation();
        Self {
            config: shared.snapshot(),
            generation,
        }
    }

    /// Pick up a newer configuration if one was published. Returns `true` on change.
    pub fn refresh(&mut self, shared: &SharedConfig) -> bool {
        let generation = shared.generation();
        if generation == self.generation {
            return false;
        }
        self.config = shared.snapshot();
        self.generation = generation;
        true
    }

    pub fn get(&self) -> &EngineConfig {
        &self.config
    }
}

//! Observation events published by the engine.
//!
//! ## Channels
//!
//! | Event | Subscribe with | Rate |
//! |-------|----------------|------|
//! | `LevelEvent` | `RepeaterEngine::subscribe_levels` | at most once per frame |
//! | `EngineStatusEvent` | `RepeaterEngine::subscribe_status` | on every state change, warning, or error |
//!
//! Both are lossy broadcast feeds: a slow subscriber skips ahead instead of
//! holding the engine back.

use serde::{Deserialize, Serialize};

use crate::engine::RepeaterMode;

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

/// Simplex cycle position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimplexState {
    #[default]
    Idle,
    Listening,
    Recording,
    Playing,
    DeadTime,
}

/// Duplex capture loop: is a recording window open?
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureState {
    #[default]
    Idle,
    Active,
}

/// Duplex playback loop: is a buffer being played?
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    #[default]
    Idle,
    Active,
}

/// Engine state for display, tagged by mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum StateSnapshot {
    Simplex {
        state: SimplexState,
    },
    Duplex {
        capture: CaptureState,
        playback: PlaybackState,
        /// `false` until started and after stop.
        running: bool,
    },
}

impl StateSnapshot {
    /// The resting state for `mode`.
    pub fn idle(mode: RepeaterMode) -> Self {
        match mode {
            RepeaterMode::Simplex => StateSnapshot::Simplex {
                state: SimplexState::Idle,
            },
            RepeaterMode::Duplex => StateSnapshot::Duplex {
                capture: CaptureState::Idle,
                playback: PlaybackState::Idle,
                running: false,
            },
        }
    }

    pub fn mode(&self) -> RepeaterMode {
        match self {
            StateSnapshot::Simplex { .. } => RepeaterMode::Simplex,
            StateSnapshot::Duplex { .. } => RepeaterMode::Duplex,
        }
    }

    pub fn is_idle(&self) -> bool {
        match self {
            StateSnapshot::Simplex { state } => *state == SimplexState::Idle,
            StateSnapshot::Duplex { running, .. } => !running,
        }
    }
}

impl std::fmt::Display for StateSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateSnapshot::Simplex { state } => write!(f, "simplex/{state:?}"),
            StateSnapshot::Duplex {
                running: false, ..
            } => f.write_str("duplex/Idle"),
            StateSnapshot::Duplex {
                capture, playback, ..
            } => write!(f, "duplex/capture={capture:?},playback={playback:?}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Level events
// ---------------------------------------------------------------------------

/// Meter reading for one processed frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    /// Smoothed level, in `i16` sample units.
    pub level: f32,
    /// Unsmoothed mean absolute value of the frame.
    pub raw_level: f32,
    pub state: StateSnapshot,
    /// Recording fill (0-100 %) or remaining playback (100-0 %).
    pub progress: Option<f32>,
    /// Seconds left before the simplex loop listens again.
    pub dead_time_remaining: Option<f32>,
}

// ---------------------------------------------------------------------------
// Engine status events
// ---------------------------------------------------------------------------

/// Emitted whenever the lifecycle status or the engine state changes, and for
/// warnings such as a duplex queue overflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatusEvent {
    pub status: EngineStatus,
    pub state: StateSnapshot,
    /// Optional human-readable detail (error message, warning).
    pub detail: Option<String>,
    /// Total buffers dropped by queue overflow, on overflow warnings.
    pub dropped_buffers: Option<usize>,
}

/// Lifecycle of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    /// Created, never started.
    Idle,
    /// Loops active.
    Running,
    /// Stopped on request; may be restarted.
    Stopped,
    /// A loop failed (usually a device error). Restart required.
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_event_serializes_with_camel_case_and_tagged_state() {
        let event = LevelEvent {
            seq: 7,
            level: 1234.5,
            raw_level: 2000.0,
            state: StateSnapshot::Simplex {
                state: SimplexState::DeadTime,
            },
            progress: None,
            dead_time_remaining: Some(1.5),
        };

        let json = serde_json::to_value(&event).expect("serialize level event");
        assert_eq!(json["seq"], 7);
        assert_eq!(json["rawLevel"], 2000.0);
        assert_eq!(json["state"]["mode"], "simplex");
        assert_eq!(json["state"]["state"], "deadtime");
        assert_eq!(json["deadTimeRemaining"], 1.5);
        assert!(json["progress"].is_null());

        let round_trip: LevelEvent = serde_json::from_value(json).expect("deserialize level event");
        assert_eq!(round_trip.state, event.state);
    }

    #[test]
    fn duplex_snapshot_carries_both_sub_states() {
        let state = StateSnapshot::Duplex {
            capture: CaptureState::Active,
            playback: PlaybackState::Idle,
            running: true,
        };
        let json = serde_json::to_value(state).expect("serialize snapshot");
        assert_eq!(json["mode"], "duplex");
        assert_eq!(json["capture"], "active");
        assert_eq!(json["playback"], "idle");
        assert!(!state.is_idle());
        assert_eq!(state.mode(), RepeaterMode::Duplex);
    }

    #[test]
    fn engine_status_event_serializes_with_lowercase_status() {
        let event = EngineStatusEvent {
            status: EngineStatus::Error,
            state: StateSnapshot::idle(RepeaterMode::Simplex),
            detail: Some("device unplugged".into()),
            dropped_buffers: None,
        };

        let json = serde_json::to_value(&event).expect("serialize status event");
        assert_eq!(json["status"], "error");
        assert_eq!(json["detail"], "device unplugged");
        assert_eq!(json["state"]["state"], "idle");

        let round_trip: EngineStatusEvent =
            serde_json::from_value(json).expect("deserialize status event");
        assert_eq!(round_trip.status, EngineStatus::Error);
        assert!(round_trip.state.is_idle());
    }

    #[test]
    fn status_rejects_non_lowercase_values() {
        assert!(serde_json::from_str::<EngineStatus>(r#""Running""#).is_err());
    }
}

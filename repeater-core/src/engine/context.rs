//! State shared between the engine handle and its loop threads.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, warn};

use super::config::SharedConfig;
use crate::error::RepeaterError;
use crate::ipc::events::{EngineStatus, EngineStatusEvent, LevelEvent, StateSnapshot};

/// Counters for observability. Reset on every start.
#[derive(Debug, Default)]
pub struct EngineDiagnostics {
    pub frames_in: AtomicUsize,
    pub samples_out: AtomicUsize,
    pub recordings_started: AtomicUsize,
    pub buffers_played: AtomicUsize,
    pub buffers_dropped: AtomicUsize,
    pub device_errors: AtomicUsize,
}

impl EngineDiagnostics {
    pub fn reset(&self) {
        self.frames_in.store(0, Ordering::Relaxed);
        self.samples_out.store(0, Ordering::Relaxed);
        self.recordings_started.store(0, Ordering::Relaxed);
        self.buffers_played.store(0, Ordering::Relaxed);
        self.buffers_dropped.store(0, Ordering::Relaxed);
        self.device_errors.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            samples_out: self.samples_out.load(Ordering::Relaxed),
            recordings_started: self.recordings_started.load(Ordering::Relaxed),
            buffers_played: self.buffers_played.load(Ordering::Relaxed),
            buffers_dropped: self.buffers_dropped.load(Ordering::Relaxed),
            device_errors: self.device_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub frames_in: usize,
    pub samples_out: usize,
    pub recordings_started: usize,
    pub buffers_played: usize,
    pub buffers_dropped: usize,
    pub device_errors: usize,
}

/// Everything a loop thread needs, passed as one struct so the spawn closures
/// stay tidy.
#[derive(Clone)]
pub struct LoopContext {
    pub running: Arc<AtomicBool>,
    pub config: Arc<SharedConfig>,
    pub status: Arc<Mutex<EngineStatus>>,
    pub state: Arc<Mutex<StateSnapshot>>,
    pub level_tx: broadcast::Sender<LevelEvent>,
    pub status_tx: broadcast::Sender<EngineStatusEvent>,
    pub seq: Arc<AtomicU64>,
    pub diagnostics: Arc<EngineDiagnostics>,
}

impl LoopContext {
    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn state(&self) -> StateSnapshot {
        *self.state.lock()
    }

    /// Apply `change` to the published state; emits a status event when it
    /// actually changed anything.
    pub fn update_state(&self, change: impl FnOnce(&mut StateSnapshot)) {
        let next = {
            let mut state = self.state.lock();
            let before = *state;
            change(&mut state);
            if *state == before {
                return;
            }
            *state
        };
        let status = *self.status.lock();
        let _ = self.status_tx.send(EngineStatusEvent {
            status,
            state: next,
            detail: None,
            dropped_buffers: None,
        });
    }

    pub fn emit_level(
        &self,
        level: f32,
        raw_level: f32,
        progress: Option<f32>,
        dead_time_remaining: Option<f32>,
    ) {
        // No subscribers is the normal headless case.
        if self.level_tx.receiver_count() == 0 {
            return;
        }
        let _ = self.level_tx.send(LevelEvent {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            level,
            raw_level,
            state: self.state(),
            progress,
            dead_time_remaining,
        });
    }

    /// Report a duplex queue overflow. Never fatal.
    pub fn report_overflow(&self, dropped_id: u64, dropped_total: usize) {
        self.diagnostics.buffers_dropped.fetch_add(1, Ordering::Relaxed);
        warn!(dropped_id, dropped_total, "playback queue full: dropped oldest buffer");
        let status = *self.status.lock();
        let _ = self.status_tx.send(EngineStatusEvent {
            status,
            state: self.state(),
            detail: Some(format!(
                "playback queue full: dropped recording #{dropped_id}"
            )),
            dropped_buffers: Some(dropped_total),
        });
    }

    /// Stop every loop after an unrecoverable error and publish it.
    pub fn fail(&self, err: &RepeaterError) {
        error!("engine loop failed: {err}");
        if err.is_device_error() {
            self.diagnostics.device_errors.fetch_add(1, Ordering::Relaxed);
        }
        // Only the first failing loop reports; the others see `running == false`.
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let idle = {
            let mut state = self.state.lock();
            let mode = state.mode();
            *state = StateSnapshot::idle(mode);
            *state
        };
        *self.status.lock() = EngineStatus::Error;
        let _ = self.status_tx.send(EngineStatusEvent {
            status: EngineStatus::Error,
            state: idle,
            detail: Some(err.to_string()),
            dropped_buffers: None,
        });
    }
}

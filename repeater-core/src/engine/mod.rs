//! `RepeaterEngine`: top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! RepeaterEngine::new(config)
//!     ├─► switch_mode(m)     → only while stopped
//!     └─► start()            → devices open, loop thread(s) spawned, status = Running
//!         ├─► update_config  → picked up by the loops at the next frame
//!         └─► stop()         → running=false, loops joined, status = Stopped
//! ```
//!
//! `start()`, `stop()` and `switch_mode()` are idempotent-safe: calling them
//! in the wrong state returns an error rather than panicking, and leaves the
//! engine as it was.
//!
//! ## Threading
//!
//! Simplex runs one loop thread; duplex runs a capture thread and a playback
//! thread joined by a bounded queue. `cpal::Stream` is `!Send` on Windows/macOS,
//! so every device is opened *inside* the thread that uses it. A sync channel
//! carries each open result back to the `start()` caller.

pub mod config;
pub mod context;
pub mod duplex;
pub mod recorder;
pub mod simplex;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    mpsc, Arc,
};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub use config::{ConfigUpdate, ConfigView, EngineConfig, RepeaterMode, SharedConfig};
pub use context::{DiagnosticsSnapshot, EngineDiagnostics, LoopContext};
pub use duplex::PlaybackMachine;
pub use recorder::{GateStep, RecordGate, StopReason};
pub use simplex::{SimplexMachine, Transition};

use crate::{
    audio::{AudioBackend, CpalBackend, DeviceSelection},
    buffering::queue::buffer_queue,
    error::{RepeaterError, Result},
    ipc::events::{
        CaptureState, EngineStatus, EngineStatusEvent, LevelEvent, PlaybackState, StateSnapshot,
    },
};

/// Broadcast channel capacity: 256 events buffered for slow subscribers.
const BROADCAST_CAP: usize = 256;

/// The top-level engine handle.
///
/// `RepeaterEngine` is `Send + Sync`; all fields use interior mutability.
/// Wrap it in an `Arc` to share it between a command handler and event
/// forwarding tasks.
pub struct RepeaterEngine {
    backend: Arc<dyn AudioBackend>,
    devices: Mutex<DeviceSelection>,
    mode: Mutex<RepeaterMode>,
    config: Arc<SharedConfig>,
    /// `true` while loop threads are active.
    running: Arc<AtomicBool>,
    status: Arc<Mutex<EngineStatus>>,
    state: Arc<Mutex<StateSnapshot>>,
    level_tx: broadcast::Sender<LevelEvent>,
    status_tx: broadcast::Sender<EngineStatusEvent>,
    seq: Arc<AtomicU64>,
    diagnostics: Arc<EngineDiagnostics>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Serializes start/stop/switch_mode.
    lifecycle: Mutex<()>,
}

impl RepeaterEngine {
    /// Engine on the real audio devices. Does not open anything until `start()`.
    ///
    /// # Errors
    /// `RepeaterError::InvalidConfig` if `config` fails validation.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_backend(config, CpalBackend::new())
    }

    /// Engine on a custom device backend (WAV input, in-memory test devices).
    pub fn with_backend(config: EngineConfig, backend: impl AudioBackend) -> Result<Self> {
        config.validate()?;
        let (level_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let mode = RepeaterMode::default();

        Ok(Self {
            backend: Arc::new(backend),
            devices: Mutex::new(DeviceSelection::default()),
            mode: Mutex::new(mode),
            config: Arc::new(SharedConfig::new(config)),
            running: Arc::new(AtomicBool::new(false)),
            status: Arc::new(Mutex::new(EngineStatus::Idle)),
            state: Arc::new(Mutex::new(StateSnapshot::idle(mode))),
            level_tx,
            status_tx,
            seq: Arc::new(AtomicU64::new(0)),
            diagnostics: Arc::new(EngineDiagnostics::default()),
            workers: Mutex::new(Vec::new()),
            lifecycle: Mutex::new(()),
        })
    }

    /// Devices used by the next `start()`. `None` names mean the system default.
    pub fn set_devices(&self, devices: DeviceSelection) {
        *self.devices.lock() = devices;
    }

    pub fn devices(&self) -> DeviceSelection {
        self.devices.lock().clone()
    }

    /// Open the devices and start the loops for the current mode.
    ///
    /// Blocks until every device is confirmed open (or one fails), then returns.
    ///
    /// # Errors
    /// - `RepeaterError::AlreadyRunning` if already started.
    /// - A device error if an input or output cannot be opened; nothing keeps
    ///   running in that case.
    pub fn start(&self) -> Result<()> {
        let _guard = self.lifecycle.lock();
        if self.running.load(Ordering::SeqCst) {
            return Err(RepeaterError::AlreadyRunning);
        }
        // Reap loops that ended on their own after a device error.
        self.join_workers();

        let mode = *self.mode.lock();
        let devices = self.devices();
        self.diagnostics.reset();
        *self.state.lock() = match mode {
            RepeaterMode::Simplex => StateSnapshot::idle(mode),
            RepeaterMode::Duplex => StateSnapshot::Duplex {
                capture: CaptureState::Idle,
                playback: PlaybackState::Idle,
                running: true,
            },
        };
        self.running.store(true, Ordering::SeqCst);
        // Published once the devices are confirmed open.
        *self.status.lock() = EngineStatus::Running;

        let (open_tx, open_rx) = mpsc::channel::<Result<()>>();
        let spawned = match mode {
            RepeaterMode::Simplex => self.spawn_simplex(&devices, open_tx),
            RepeaterMode::Duplex => self.spawn_duplex(&devices, open_tx),
        };

        let outcome = spawned.and_then(|expected| {
            let mut first_err = None;
            for _ in 0..expected {
                match open_rx.recv() {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        first_err.get_or_insert(e);
                    }
                    Err(_) => {
                        // Sender dropped before reporting: the thread panicked.
                        first_err.get_or_insert(RepeaterError::Other(anyhow::anyhow!(
                            "engine loop died during device open"
                        )));
                        break;
                    }
                }
            }
            first_err.map_or(Ok(()), Err)
        });

        match outcome {
            Ok(()) => {
                // Held across the check so a loop failing now publishes Error after us.
                let mut status = self.status.lock();
                if !self.running.load(Ordering::SeqCst) {
                    drop(status);
                    self.join_workers();
                    warn!(%mode, "engine loop stopped before start completed");
                    return Err(RepeaterError::Other(anyhow::anyhow!(
                        "engine loop stopped right after the devices opened"
                    )));
                }
                *status = EngineStatus::Running;
                let _ = self.status_tx.send(EngineStatusEvent {
                    status: EngineStatus::Running,
                    state: self.state(),
                    detail: None,
                    dropped_buffers: None,
                });
                drop(status);
                info!(%mode, "engine started");
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                self.join_workers();
                *self.state.lock() = StateSnapshot::idle(mode);
                self.set_status(EngineStatus::Error, Some(e.to_string()));
                warn!("engine failed to start: {e}");
                Err(e)
            }
        }
    }

    /// Stop the loops. In-flight recordings and playback are discarded.
    ///
    /// Returns once every loop thread has exited (at most about one frame
    /// period), so devices are released when this returns.
    ///
    /// # Errors
    /// - `RepeaterError::NotRunning` if not currently running.
    pub fn stop(&self) -> Result<()> {
        let _guard = self.lifecycle.lock();
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(RepeaterError::NotRunning);
        }
        self.join_workers();
        let mode = *self.mode.lock();
        *self.state.lock() = StateSnapshot::idle(mode);
        self.set_status(EngineStatus::Stopped, None);
        info!("engine stopped");
        Ok(())
    }

    /// Change between simplex and duplex. Only allowed while stopped.
    ///
    /// # Errors
    /// `RepeaterError::ModeSwitchWhileRunning` if any loop is active; the
    /// engine state is left unchanged.
    pub fn switch_mode(&self, target: RepeaterMode) -> Result<()> {
        let _guard = self.lifecycle.lock();
        if self.running.load(Ordering::SeqCst) {
            warn!(%target, "mode switch rejected while running");
            return Err(RepeaterError::ModeSwitchWhileRunning { target });
        }
        let mut mode = self.mode.lock();
        if *mode == target {
            return Ok(());
        }
        *mode = target;
        drop(mode);
        *self.state.lock() = StateSnapshot::idle(target);
        let status = *self.status.lock();
        self.set_status(status, Some(format!("mode set to {target}")));
        info!(%target, "mode switched");
        Ok(())
    }

    /// Validate and apply a partial configuration change. The loops pick it up
    /// at their next iteration.
    ///
    /// # Errors
    /// `RepeaterError::InvalidConfig`; the previous configuration is kept.
    pub fn update_config(&self, update: &ConfigUpdate) -> Result<EngineConfig> {
        match self.config.update(update) {
            Ok(next) => {
                debug!(?update, "configuration updated");
                if update.queue_capacity.is_some() && self.is_running() {
                    info!("queue capacity change takes effect on next start");
                }
                Ok(next)
            }
            Err(e) => {
                warn!("configuration rejected: {e}");
                Err(e)
            }
        }
    }

    /// Replace the whole configuration after validating it.
    pub fn replace_config(&self, config: EngineConfig) -> Result<()> {
        self.config.replace(config)
    }

    /// Current configuration (snapshot).
    pub fn config(&self) -> EngineConfig {
        self.config.snapshot()
    }

    pub fn mode(&self) -> RepeaterMode {
        *self.mode.lock()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Current lifecycle status (snapshot).
    pub fn status(&self) -> EngineStatus {
        *self.status.lock()
    }

    /// Current simplex state or duplex sub-states (snapshot).
    pub fn state(&self) -> StateSnapshot {
        *self.state.lock()
    }

    /// Subscribe to per-frame level readings.
    pub fn subscribe_levels(&self) -> broadcast::Receiver<LevelEvent> {
        self.level_tx.subscribe()
    }

    /// Subscribe to status, state-change, and warning events.
    pub fn subscribe_status(&self) -> broadcast::Receiver<EngineStatusEvent> {
        self.status_tx.subscribe()
    }

    /// Snapshot of loop counters for observability.
    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn loop_context(&self) -> LoopContext {
        LoopContext {
            running: Arc::clone(&self.running),
            config: Arc::clone(&self.config),
            status: Arc::clone(&self.status),
            state: Arc::clone(&self.state),
            level_tx: self.level_tx.clone(),
            status_tx: self.status_tx.clone(),
            seq: Arc::clone(&self.seq),
            diagnostics: Arc::clone(&self.diagnostics),
        }
    }

    /// Spawn the simplex loop. Returns how many open results to wait for.
    fn spawn_simplex(&self, devices: &DeviceSelection, open_tx: mpsc::Sender<Result<()>>) -> Result<usize> {
        let ctx = self.loop_context();
        let backend = Arc::clone(&self.backend);
        let devices = devices.clone();

        let handle = thread::Builder::new()
            .name("repeater-simplex".into())
            .spawn(move || {
                // ── Open devices (must happen on THIS thread: cpal::Stream is !Send) ──
                let opened = backend.open_input(devices.input.as_deref()).and_then(|source| {
                    backend
                        .open_output(devices.output.as_deref())
                        .map(|sink| (source, sink))
                });
                let (source, sink) = match opened {
                    Ok(pair) => {
                        let _ = open_tx.send(Ok(()));
                        pair
                    }
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        return;
                    }
                };
                simplex::run(ctx, source, sink);
            })?;
        self.workers.lock().push(handle);
        Ok(1)
    }

    /// Spawn the duplex capture and playback loops around a fresh queue.
    fn spawn_duplex(&self, devices: &DeviceSelection, open_tx: mpsc::Sender<Result<()>>) -> Result<usize> {
        let (producer, consumer) = buffer_queue(self.config.snapshot().queue_capacity);

        let capture = {
            let ctx = self.loop_context();
            let backend = Arc::clone(&self.backend);
            let device = devices.input.clone();
            let open_tx = open_tx.clone();
            thread::Builder::new()
                .name("repeater-capture".into())
                .spawn(move || match backend.open_input(device.as_deref()) {
                    Ok(source) => {
                        let _ = open_tx.send(Ok(()));
                        duplex::run_capture(ctx, source, producer);
                    }
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                    }
                })?
        };
        self.workers.lock().push(capture);

        let playback = {
            let ctx = self.loop_context();
            let backend = Arc::clone(&self.backend);
            let device = devices.output.clone();
            thread::Builder::new()
                .name("repeater-playback".into())
                .spawn(move || match backend.open_output(device.as_deref()) {
                    Ok(sink) => {
                        let _ = open_tx.send(Ok(()));
                        duplex::run_playback(ctx, sink, consumer);
                    }
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                    }
                })?
        };
        self.workers.lock().push(playback);
        Ok(2)
    }

    fn join_workers(&self) {
        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            let name = handle.thread().name().unwrap_or("engine loop").to_owned();
            if handle.join().is_err() {
                warn!(thread = name.as_str(), "engine loop panicked");
            }
        }
    }

    fn set_status(&self, new_status: EngineStatus, detail: Option<String>) {
        *self.status.lock() = new_status;
        let _ = self.status_tx.send(EngineStatusEvent {
            status: new_status,
            state: self.state(),
            detail,
            dropped_buffers: None,
        });
    }
}

impl Drop for RepeaterEngine {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.join_workers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::memory::MemoryBackend;

    fn engine() -> RepeaterEngine {
        let (backend, _feed, _out) = MemoryBackend::new();
        RepeaterEngine::with_backend(EngineConfig::default(), backend).unwrap()
    }

    #[test]
    fn invalid_initial_config_is_rejected() {
        let (backend, _feed, _out) = MemoryBackend::new();
        let config = EngineConfig {
            stop_threshold: 2000.0,
            start_threshold: 1000.0,
            ..EngineConfig::default()
        };
        assert!(matches!(
            RepeaterEngine::with_backend(config, backend),
            Err(RepeaterError::InvalidConfig(_))
        ));
    }

    #[test]
    fn stop_when_idle_is_rejected() {
        let engine = engine();
        assert!(matches!(engine.stop(), Err(RepeaterError::NotRunning)));
        assert_eq!(engine.status(), EngineStatus::Idle);
    }

    #[test]
    fn mode_switch_while_stopped_updates_state() {
        let engine = engine();
        engine.switch_mode(RepeaterMode::Duplex).unwrap();
        assert_eq!(engine.mode(), RepeaterMode::Duplex);
        assert_eq!(engine.state(), StateSnapshot::idle(RepeaterMode::Duplex));
        // Same mode again is a no-op.
        engine.switch_mode(RepeaterMode::Duplex).unwrap();
    }

    #[test]
    fn rejected_update_keeps_previous_config() {
        let engine = engine();
        let before = engine.config();
        let bad = ConfigUpdate {
            stop_threshold: Some(5000.0),
            ..ConfigUpdate::default()
        };
        assert!(matches!(
            engine.update_config(&bad),
            Err(RepeaterError::InvalidConfig(_))
        ));
        assert_eq!(engine.config(), before);
    }

    #[test]
    fn failed_device_open_leaves_engine_stopped() {
        let (backend, _feed, _out) = MemoryBackend::new();
        let engine =
            RepeaterEngine::with_backend(EngineConfig::default(), backend.failing_output("busy"))
                .unwrap();
        let mut status = engine.subscribe_status();

        assert!(matches!(engine.start(), Err(RepeaterError::AudioDevice(_))));
        assert!(!engine.is_running());
        assert_eq!(engine.status(), EngineStatus::Error);
        assert!(engine.state().is_idle());

        let event = status.try_recv().expect("error event");
        assert_eq!(event.status, EngineStatus::Error);
        assert_eq!(event.detail.as_deref(), Some("audio device error: busy"));
    }

    #[test]
    fn loop_failing_during_start_is_never_reported_running() {
        // The input feed is already closed, so every loop fails on its first read.
        let engine = engine();
        for attempt in 0..200 {
            let started = engine.start();
            let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
            while engine.is_running() && std::time::Instant::now() < deadline {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
            assert!(!engine.is_running(), "attempt {attempt}: loop kept running");
            assert_eq!(
                engine.status(),
                EngineStatus::Error,
                "attempt {attempt}: started={started:?}"
            );
            assert!(engine.state().is_idle());
        }
    }
}

//! Simplex repeater: listen, record, play back, wait, repeat.
//!
//! ```text
//!   Idle ──start──► Listening ──level ≥ start──► Recording
//!                       ▲                            │ silence timeout / cap
//!                       │                            ▼
//!                   DeadTime ◄──playback done──── Playing
//!          (skipped when dead_time_seconds = 0)
//! ```
//!
//! Recording and playback never overlap. While Playing the loop does not
//! process input at all: whatever the device captured is discarded, so the
//! repeater never records its own output. Dead time is counted in input
//! samples, which keeps the machine deterministic under test.

use std::sync::atomic::Ordering;

use tracing::{debug, info, info_span};

use super::config::{ConfigView, EngineConfig};
use super::context::LoopContext;
use super::recorder::{GateStep, RecordGate, StopReason};
use crate::audio::{FrameSink, FrameSource, FRAME_PERIOD, FRAME_SAMPLES, SAMPLE_RATE};
use crate::buffering::{capture::CaptureBuffer, frame::AudioFrame};
use crate::dsp::{apply_gain_db, Equalizer};
use crate::error::Result;
use crate::ipc::events::{SimplexState, StateSnapshot};

/// One state change of the simplex machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: SimplexState,
    pub to: SimplexState,
}

/// The simplex state machine, free of any device or thread.
#[derive(Debug)]
pub struct SimplexMachine {
    state: SimplexState,
    gate: RecordGate,
    eq: Equalizer,
    playback: Vec<i16>,
    played: usize,
    playing_id: Option<u64>,
    dead_remaining: usize,
}

impl SimplexMachine {
    pub fn new(config: &EngineConfig) -> Self {
        let mut eq = Equalizer::new(SAMPLE_RATE);
        eq.set_gains(&config.eq_gains_db);
        Self {
            state: SimplexState::Idle,
            gate: RecordGate::new(config),
            eq,
            playback: Vec::new(),
            played: 0,
            playing_id: None,
            dead_remaining: 0,
        }
    }

    pub fn state(&self) -> SimplexState {
        self.state
    }

    fn go(&mut self, to: SimplexState) -> Transition {
        let from = self.state;
        self.state = to;
        Transition { from, to }
    }

    /// Idle → Listening. `None` when already started.
    pub fn start(&mut self) -> Option<Transition> {
        (self.state == SimplexState::Idle).then(|| self.go(SimplexState::Listening))
    }

    /// Any state → Idle, dropping the recording or playback in flight.
    pub fn stop(&mut self) -> Option<Transition> {
        if self.state == SimplexState::Idle {
            return None;
        }
        if let Some(id) = self.gate.abandon() {
            debug!(id, "discarding unfinished recording");
        }
        if let Some(id) = self.playing_id.take() {
            debug!(id, remaining = self.playback.len() - self.played, "abandoning playback");
        }
        self.playback.clear();
        self.played = 0;
        self.dead_remaining = 0;
        self.gate.reset();
        Some(self.go(SimplexState::Idle))
    }

    /// Take up changed smoothing times and equalizer gains.
    pub fn apply_config(&mut self, config: &EngineConfig) {
        self.gate.apply_config(config);
        self.eq.set_gains(&config.eq_gains_db);
    }

    /// Feed one input frame. Frames are ignored while Idle or Playing.
    pub fn on_frame(&mut self, frame: &AudioFrame, config: &EngineConfig) -> Option<Transition> {
        match self.state {
            SimplexState::Idle | SimplexState::Playing => None,
            SimplexState::Listening | SimplexState::Recording => {
                match self.gate.process(frame, config) {
                    GateStep::Waiting | GateStep::Recording => None,
                    GateStep::Started { id } => {
                        info!(id, "recording");
                        Some(self.go(SimplexState::Recording))
                    }
                    GateStep::Completed { buffer, reason } => {
                        Some(self.begin_playback(buffer, reason, config))
                    }
                }
            }
            SimplexState::DeadTime => {
                self.gate.meter(frame);
                self.dead_remaining = self.dead_remaining.saturating_sub(frame.len());
                (self.dead_remaining == 0).then(|| self.go(SimplexState::Listening))
            }
        }
    }

    fn begin_playback(
        &mut self,
        buffer: CaptureBuffer,
        reason: StopReason,
        config: &EngineConfig,
    ) -> Transition {
        let id = buffer.id();
        info!(id, seconds = buffer.duration_secs(), ?reason, "playing back");
        let mut samples = buffer.into_samples();
        // Each recording starts from silence.
        self.eq.reset();
        self.eq.apply_in_place(&mut samples);
        apply_gain_db(&mut samples, config.output_gain_db);
        self.playback = samples;
        self.played = 0;
        self.playing_id = Some(id);
        self.go(SimplexState::Playing)
    }

    /// The next block to write while Playing, at most one frame long.
    pub fn pending_output(&self) -> &[i16] {
        if self.state != SimplexState::Playing {
            return &[];
        }
        let end = (self.played + FRAME_SAMPLES).min(self.playback.len());
        &self.playback[self.played..end]
    }

    /// Record that `written` samples of [`pending_output`] reached the device.
    /// Finishing the buffer moves to DeadTime, or straight to Listening when
    /// dead time is zero.
    ///
    /// [`pending_output`]: SimplexMachine::pending_output
    pub fn advance_output(&mut self, written: usize, config: &EngineConfig) -> Option<Transition> {
        if self.state != SimplexState::Playing {
            return None;
        }
        self.played = (self.played + written).min(self.playback.len());
        if self.played < self.playback.len() {
            return None;
        }
        if let Some(id) = self.playing_id.take() {
            debug!(id, "playback complete");
        }
        self.playback = Vec::new();
        self.played = 0;
        self.dead_remaining = config.dead_time_samples();
        if self.dead_remaining == 0 {
            Some(self.go(SimplexState::Listening))
        } else {
            Some(self.go(SimplexState::DeadTime))
        }
    }

    /// Recording fill, or remaining playback, in percent.
    pub fn progress(&self) -> Option<f32> {
        match self.state {
            SimplexState::Recording => self.gate.progress(),
            SimplexState::Playing if !self.playback.is_empty() => {
                let left = self.playback.len() - self.played;
                Some((left as f64 / self.playback.len() as f64 * 100.0) as f32)
            }
            _ => None,
        }
    }

    pub fn dead_time_remaining_secs(&self) -> Option<f32> {
        (self.state == SimplexState::DeadTime)
            .then(|| (self.dead_remaining as f64 / f64::from(SAMPLE_RATE)) as f32)
    }

    pub fn level(&self) -> f32 {
        self.gate.level()
    }

    pub fn raw_level(&self) -> f32 {
        self.gate.raw_level()
    }
}

fn publish(ctx: &LoopContext, transition: Transition) {
    debug!(from = ?transition.from, to = ?transition.to, "simplex transition");
    ctx.update_state(|s| *s = StateSnapshot::Simplex { state: transition.to });
}

/// Run the simplex loop until `ctx.running` becomes false or a device fails.
///
/// Owns the source and sink; they are dropped on this thread on return.
pub fn run(ctx: LoopContext, mut source: Box<dyn FrameSource>, mut sink: Box<dyn FrameSink>) {
    let _span = info_span!("simplex").entered();
    info!("simplex loop started");

    let mut view = ConfigView::new(&ctx.config);
    let mut machine = SimplexMachine::new(view.get());
    if let Some(t) = machine.start() {
        publish(&ctx, t);
    }

    while ctx.is_running() {
        if view.refresh(&ctx.config) {
            machine.apply_config(view.get());
            debug!("configuration refreshed");
        }

        let step = if machine.state() == SimplexState::Playing {
            play_step(&ctx, &mut machine, source.as_mut(), sink.as_mut(), view.get())
        } else {
            listen_step(&ctx, &mut machine, source.as_mut(), view.get())
        };

        if let Err(e) = step {
            ctx.fail(&e);
            break;
        }
    }

    machine.stop();
    info!("simplex loop exited");
}

fn listen_step(
    ctx: &LoopContext,
    machine: &mut SimplexMachine,
    source: &mut dyn FrameSource,
    config: &EngineConfig,
) -> Result<()> {
    let Some(frame) = source.read_frame(FRAME_PERIOD)? else {
        return Ok(());
    };
    ctx.diagnostics.frames_in.fetch_add(1, Ordering::Relaxed);

    if let Some(t) = machine.on_frame(&frame, config) {
        if t.from == SimplexState::Listening {
            ctx.diagnostics.recordings_started.fetch_add(1, Ordering::Relaxed);
        }
        if t.to == SimplexState::Playing {
            // Anything queued behind the closing frame belongs to playback time.
            source.discard_pending();
        }
        publish(ctx, t);
    }

    ctx.emit_level(
        machine.level(),
        machine.raw_level(),
        machine.progress(),
        machine.dead_time_remaining_secs(),
    );
    Ok(())
}

fn play_step(
    ctx: &LoopContext,
    machine: &mut SimplexMachine,
    source: &mut dyn FrameSource,
    sink: &mut dyn FrameSink,
    config: &EngineConfig,
) -> Result<()> {
    let written = match machine.pending_output() {
        [] => 0,
        chunk => sink.write(chunk, FRAME_PERIOD)?,
    };
    ctx.diagnostics.samples_out.fetch_add(written, Ordering::Relaxed);

    let dropped = source.discard_pending();
    if dropped > 0 {
        debug!(dropped, "discarded input during playback");
    }

    let transition = machine.advance_output(written, config);
    ctx.emit_level(machine.level(), machine.raw_level(), machine.progress(), None);

    if let Some(t) = transition {
        ctx.diagnostics.buffers_played.fetch_add(1, Ordering::Relaxed);
        source.discard_pending();
        publish(ctx, t);
    }
    Ok(())
}

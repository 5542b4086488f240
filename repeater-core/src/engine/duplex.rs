//! Duplex repeater: capture and playback run at the same time on two threads.
//!
//! ```text
//!  input ─► capture loop ─(RecordGate)─► QueueProducer ═══ bounded FIFO ═══► QueueConsumer ─► playback loop ─► EQ ─► output
//! ```
//!
//! The loops share nothing but the queue. The capture loop never waits for
//! playback: when the queue is full the oldest unplayed buffer is evicted and
//! reported. The playback loop streams buffers back-to-back in completion
//! order, one frame at a time, with no gap between consecutive buffers.

use std::sync::atomic::Ordering;

use tracing::{debug, info, info_span};

use super::config::{ConfigView, EngineConfig};
use super::context::LoopContext;
use super::recorder::{GateStep, RecordGate};
use crate::audio::{FrameSink, FrameSource, FRAME_PERIOD, FRAME_SAMPLES, SAMPLE_RATE};
use crate::buffering::capture::CaptureBuffer;
use crate::buffering::queue::{PushOutcome, QueueConsumer, QueuePop, QueueProducer};
use crate::dsp::{apply_gain_db, Equalizer};
use crate::error::Result;
use crate::ipc::events::{CaptureState, PlaybackState, StateSnapshot};

fn set_capture(ctx: &LoopContext, next: CaptureState) {
    ctx.update_state(|s| {
        if let StateSnapshot::Duplex { capture, .. } = s {
            *capture = next;
        }
    });
}

fn set_playback(ctx: &LoopContext, next: PlaybackState) {
    ctx.update_state(|s| {
        if let StateSnapshot::Duplex { playback, .. } = s {
            *playback = next;
        }
    });
}

// ---------------------------------------------------------------------------
// Capture loop
// ---------------------------------------------------------------------------

/// Run the capture loop until `ctx.running` becomes false or the input fails.
pub fn run_capture(ctx: LoopContext, mut source: Box<dyn FrameSource>, queue: QueueProducer) {
    let _span = info_span!("duplex_capture").entered();
    info!(capacity = queue.capacity(), "duplex capture loop started");

    let mut view = ConfigView::new(&ctx.config);
    let mut gate = RecordGate::new(view.get());

    while ctx.is_running() {
        if view.refresh(&ctx.config) {
            gate.apply_config(view.get());
        }
        if let Err(e) = capture_step(&ctx, &mut gate, source.as_mut(), &queue, view.get()) {
            ctx.fail(&e);
            break;
        }
    }

    if let Some(id) = gate.abandon() {
        debug!(id, "discarding unfinished recording");
    }
    info!("duplex capture loop exited");
}

fn capture_step(
    ctx: &LoopContext,
    gate: &mut RecordGate,
    source: &mut dyn FrameSource,
    queue: &QueueProducer,
    config: &EngineConfig,
) -> Result<()> {
    let Some(frame) = source.read_frame(FRAME_PERIOD)? else {
        return Ok(());
    };
    ctx.diagnostics.frames_in.fetch_add(1, Ordering::Relaxed);

    match gate.process(&frame, config) {
        GateStep::Waiting | GateStep::Recording => {}
        GateStep::Started { id } => {
            ctx.diagnostics.recordings_started.fetch_add(1, Ordering::Relaxed);
            debug!(id, "capture window opened");
            set_capture(ctx, CaptureState::Active);
        }
        GateStep::Completed { buffer, reason } => {
            let id = buffer.id();
            debug!(id, samples = buffer.len(), ?reason, "capture window closed");
            match queue.push(buffer) {
                PushOutcome::Enqueued => {}
                PushOutcome::DroppedOldest { dropped } => {
                    ctx.report_overflow(dropped.id(), queue.dropped_total());
                }
                PushOutcome::Closed => debug!(id, "playback loop gone, buffer discarded"),
            }
            set_capture(ctx, CaptureState::Idle);
        }
    }

    ctx.emit_level(gate.level(), gate.raw_level(), gate.progress(), None);
    Ok(())
}

// ---------------------------------------------------------------------------
// Playback loop
// ---------------------------------------------------------------------------

/// Streams queued buffers through the equalizer one frame at a time.
///
/// Filter memory carries across back-to-back buffers, so consecutive
/// recordings join without a discontinuity. It is cleared only when playback
/// resumes after the queue ran dry.
#[derive(Debug)]
pub struct PlaybackMachine {
    eq: Equalizer,
    current: Option<CaptureBuffer>,
    position: usize,
    block: Vec<i16>,
    block_written: usize,
    from_silence: bool,
}

impl PlaybackMachine {
    pub fn new(config: &EngineConfig) -> Self {
        let mut eq = Equalizer::new(SAMPLE_RATE);
        eq.set_gains(&config.eq_gains_db);
        Self {
            eq,
            current: None,
            position: 0,
            block: Vec::with_capacity(FRAME_SAMPLES),
            block_written: 0,
            from_silence: true,
        }
    }

    pub fn apply_config(&mut self, config: &EngineConfig) {
        self.eq.set_gains(&config.eq_gains_db);
    }

    pub fn state(&self) -> PlaybackState {
        if self.current.is_some() {
            PlaybackState::Active
        } else {
            PlaybackState::Idle
        }
    }

    pub fn is_idle(&self) -> bool {
        self.current.is_none()
    }

    /// Note that the output went quiet; the next buffer starts with fresh filters.
    pub fn mark_gap(&mut self) {
        self.from_silence = true;
    }

    /// Begin playing `buffer`. Only valid while idle.
    pub fn load(&mut self, buffer: CaptureBuffer) {
        if self.from_silence {
            self.eq.reset();
            self.from_silence = false;
        }
        self.current = Some(buffer);
        self.position = 0;
        self.block.clear();
        self.block_written = 0;
    }

    /// The samples the sink should take next: the unwritten rest of the
    /// current block, or a freshly processed block.
    pub fn next_block(&mut self, config: &EngineConfig) -> &[i16] {
        if self.block_written >= self.block.len() {
            self.block.clear();
            self.block_written = 0;
            if let Some(buffer) = &self.current {
                let end = (self.position + FRAME_SAMPLES).min(buffer.len());
                self.block.extend_from_slice(&buffer.samples()[self.position..end]);
                self.position = end;
                self.eq.apply_in_place(&mut self.block);
                apply_gain_db(&mut self.block, config.output_gain_db);
            }
        }
        &self.block[self.block_written..]
    }

    /// Record that `written` samples of [`next_block`] were accepted. Returns
    /// the id of the buffer that just finished, if any.
    ///
    /// [`next_block`]: PlaybackMachine::next_block
    pub fn consume(&mut self, written: usize) -> Option<u64> {
        self.block_written = (self.block_written + written).min(self.block.len());
        let block_done = self.block_written >= self.block.len();
        let buffer_done = self
            .current
            .as_ref()
            .is_some_and(|b| self.position >= b.len());
        if block_done && buffer_done {
            self.block.clear();
            self.block_written = 0;
            return self.current.take().map(|b| b.id());
        }
        None
    }

    /// Remaining playback of the current buffer, in percent.
    pub fn progress(&self) -> Option<f32> {
        let buffer = self.current.as_ref()?;
        if buffer.is_empty() {
            return None;
        }
        let left = buffer.len() - self.position + (self.block.len() - self.block_written);
        Some((left as f64 / buffer.len() as f64 * 100.0) as f32)
    }

    /// Drop the buffer in flight without playing the rest.
    pub fn abandon(&mut self) -> Option<u64> {
        self.block.clear();
        self.block_written = 0;
        self.position = 0;
        self.current.take().map(|b| b.id())
    }
}

/// Run the playback loop until `ctx.running` becomes false or the output fails.
pub fn run_playback(ctx: LoopContext, mut sink: Box<dyn FrameSink>, queue: QueueConsumer) {
    let _span = info_span!("duplex_playback").entered();
    info!("duplex playback loop started");

    let mut view = ConfigView::new(&ctx.config);
    let mut machine = PlaybackMachine::new(view.get());

    while ctx.is_running() {
        if view.refresh(&ctx.config) {
            machine.apply_config(view.get());
        }

        if machine.is_idle() {
            match queue.pop_timeout(FRAME_PERIOD) {
                QueuePop::Buffer(buffer) => {
                    debug!(id = buffer.id(), samples = buffer.len(), "playing buffer");
                    machine.load(buffer);
                    set_playback(&ctx, PlaybackState::Active);
                }
                QueuePop::Empty => {
                    machine.mark_gap();
                    continue;
                }
                QueuePop::Closed => break,
            }
        }

        if let Err(e) = playback_step(&ctx, &mut machine, sink.as_mut(), &queue, view.get()) {
            ctx.fail(&e);
            break;
        }
    }

    if let Some(id) = machine.abandon() {
        debug!(id, "abandoning playback");
    }
    // Buffers still queued are dropped with the consumer.
    info!(unplayed = queue.len(), "duplex playback loop exited");
}

fn playback_step(
    ctx: &LoopContext,
    machine: &mut PlaybackMachine,
    sink: &mut dyn FrameSink,
    queue: &QueueConsumer,
    config: &EngineConfig,
) -> Result<()> {
    let written = match machine.next_block(config) {
        [] => 0,
        block => sink.write(block, FRAME_PERIOD)?,
    };
    ctx.diagnostics.samples_out.fetch_add(written, Ordering::Relaxed);

    if let Some(id) = machine.consume(written) {
        ctx.diagnostics.buffers_played.fetch_add(1, Ordering::Relaxed);
        debug!(id, "buffer played");
        // Stay active across back-to-back buffers.
        if queue.is_empty() {
            set_playback(ctx, PlaybackState::Idle);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn play_all(machine: &mut PlaybackMachine, cfg: &EngineConfig, chunk_limit: usize) -> Vec<i16> {
        let mut out = Vec::new();
        while !machine.is_idle() {
            let block = machine.next_block(cfg);
            let take = block.len().min(chunk_limit);
            out.extend_from_slice(&block[..take]);
            machine.consume(take);
        }
        out
    }

    #[test]
    fn partial_writes_keep_output_contiguous() {
        let cfg = EngineConfig::default();
        let samples: Vec<i16> = (0..3000).map(|i| i as i16).collect();
        let mut m = PlaybackMachine::new(&cfg);
        m.load(CaptureBuffer::from_samples(1, samples.clone()));
        assert_eq!(m.state(), PlaybackState::Active);
        assert_eq!(play_all(&mut m, &cfg, 700), samples);
        assert_eq!(m.state(), PlaybackState::Idle);
    }

    #[test]
    fn consume_reports_finished_buffer_once() {
        let cfg = EngineConfig::default();
        let mut m = PlaybackMachine::new(&cfg);
        m.load(CaptureBuffer::from_samples(9, vec![1; 10]));
        let n = m.next_block(&cfg).len();
        assert_eq!(n, 10);
        assert_eq!(m.consume(n), Some(9));
        assert_eq!(m.consume(0), None);
    }

    #[test]
    fn progress_counts_down() {
        let cfg = EngineConfig::default();
        let mut m = PlaybackMachine::new(&cfg);
        m.load(CaptureBuffer::from_samples(1, vec![0; 4 * FRAME_SAMPLES]));
        assert_eq!(m.progress(), Some(100.0));
        let n = m.next_block(&cfg).len();
        m.consume(n);
        assert_eq!(m.progress(), Some(75.0));
    }

    #[test]
    fn abandon_discards_the_rest() {
        let cfg = EngineConfig::default();
        let mut m = PlaybackMachine::new(&cfg);
        m.load(CaptureBuffer::from_samples(3, vec![5; 5000]));
        m.next_block(&cfg);
        assert_eq!(m.abandon(), Some(3));
        assert!(m.is_idle());
        assert!(m.next_block(&cfg).is_empty());
    }

    #[test]
    fn equalizer_runs_on_streamed_blocks() {
        let cfg = EngineConfig {
            eq_gains_db: [0.0, 0.0, 12.0, 0.0, 0.0],
            ..EngineConfig::default()
        };
        let tone: Vec<i16> = (0..8192)
            .map(|n| (4000.0 * (2.0 * std::f64::consts::PI * 910.0 * n as f64 / 44_100.0).sin()) as i16)
            .collect();
        let mut whole = Equalizer::new(SAMPLE_RATE);
        whole.set_gains(&cfg.eq_gains_db);
        let expected = whole.apply(&tone);

        let mut m = PlaybackMachine::new(&cfg);
        m.load(CaptureBuffer::from_samples(1, tone));
        assert_eq!(play_all(&mut m, &cfg, FRAME_SAMPLES), expected);
    }

    #[test]
    fn filter_state_carries_across_buffers_until_a_gap() {
        let cfg = EngineConfig {
            eq_gains_db: [6.0, 0.0, -9.0, 12.0, 0.0],
            ..EngineConfig::default()
        };
        let tone = |len: usize, hz: f64| -> Vec<i16> {
            (0..len)
                .map(|n| (5000.0 * (2.0 * std::f64::consts::PI * hz * n as f64 / 44_100.0).sin()) as i16)
                .collect()
        };
        let a = tone(3000, 180.0);
        let b = tone(2500, 2600.0);
        let c = tone(2000, 910.0);

        let mut continuous = Equalizer::new(SAMPLE_RATE);
        continuous.set_gains(&cfg.eq_gains_db);
        let joined: Vec<i16> = a.iter().chain(&b).copied().collect();
        let expected_ab = continuous.apply(&joined);
        let carried_c = continuous.apply(&c);

        let mut fresh = Equalizer::new(SAMPLE_RATE);
        fresh.set_gains(&cfg.eq_gains_db);
        let expected_c = fresh.apply(&c);
        assert_ne!(carried_c, expected_c);

        let mut m = PlaybackMachine::new(&cfg);
        m.load(CaptureBuffer::from_samples(1, a));
        let mut out = play_all(&mut m, &cfg, FRAME_SAMPLES);
        m.load(CaptureBuffer::from_samples(2, b));
        out.extend(play_all(&mut m, &cfg, 700));
        assert_eq!(out, expected_ab);

        m.mark_gap();
        m.load(CaptureBuffer::from_samples(3, c));
        assert_eq!(play_all(&mut m, &cfg, FRAME_SAMPLES), expected_c);
    }
}

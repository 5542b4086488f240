use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use repeater_core::audio::memory::MemoryBackend;
use repeater_core::audio::{AudioBackend, FRAME_SAMPLES};
use repeater_core::buffering::capture::CaptureBuffer;
use repeater_core::buffering::queue::{buffer_queue, PushOutcome};
use repeater_core::engine::duplex::{run_capture, run_playback};
use repeater_core::engine::{
    EngineConfig, EngineDiagnostics, LoopContext, RepeaterEngine, RepeaterMode, SharedConfig,
};
use repeater_core::ipc::events::{
    CaptureState, EngineStatus, EngineStatusEvent, PlaybackState, StateSnapshot,
};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

fn duplex_config() -> EngineConfig {
    EngineConfig {
        start_threshold: 2000.0,
        stop_threshold: 500.0,
        attack_ms: 0.0,
        release_ms: 0.0,
        max_record_seconds: 1.0,
        silence_timeout_seconds: 0.1,
        ..EngineConfig::default()
    }
}

fn context(config: EngineConfig) -> (LoopContext, broadcast::Receiver<EngineStatusEvent>) {
    let (level_tx, _) = broadcast::channel(256);
    let (status_tx, status_rx) = broadcast::channel(256);
    let ctx = LoopContext {
        running: Arc::new(AtomicBool::new(true)),
        config: Arc::new(SharedConfig::new(config)),
        status: Arc::new(Mutex::new(EngineStatus::Running)),
        state: Arc::new(Mutex::new(StateSnapshot::Duplex {
            capture: CaptureState::Idle,
            playback: PlaybackState::Idle,
            running: true,
        })),
        level_tx,
        status_tx,
        seq: Arc::new(AtomicU64::new(0)),
        diagnostics: Arc::new(EngineDiagnostics::default()),
    };
    (ctx, status_rx)
}

fn ramp(start: i16, len: usize) -> Vec<i16> {
    (0..len).map(|i| start.wrapping_add((i % 512) as i16)).collect()
}

fn playback_of(ev: &EngineStatusEvent) -> Option<PlaybackState> {
    match ev.state {
        StateSnapshot::Duplex { playback, .. } => Some(playback),
        StateSnapshot::Simplex { .. } => None,
    }
}

fn wait_for_event(
    rx: &mut broadcast::Receiver<EngineStatusEvent>,
    timeout: Duration,
    mut seen: impl FnMut(&EngineStatusEvent) -> bool,
) {
    let start = Instant::now();
    loop {
        match rx.try_recv() {
            Ok(ev) if seen(&ev) => return,
            Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty) => {
                if start.elapsed() >= timeout {
                    panic!("timed out waiting for status event");
                }
                thread::sleep(Duration::from_millis(2));
            }
            Err(TryRecvError::Closed) => panic!("status channel closed unexpectedly"),
        }
    }
}

/// One loud trigger frame then enough quiet frames to close on silence
/// (0.1 s = 4410 samples, reached on the 5th quiet frame).
fn push_recording(feed: &repeater_core::audio::memory::MemoryFeed, loud: i16) {
    feed.push_constant(loud, 1);
    feed.push_constant(100, 5);
}

#[test]
fn queued_buffers_play_back_to_back_without_gaps() {
    let cfg = duplex_config();
    let (ctx, mut status_rx) = context(cfg);
    let (backend, _feed, out) = MemoryBackend::new();
    let (producer, consumer) = buffer_queue(4);

    let a = ramp(1000, 3000);
    let b = ramp(-2000, 2500);
    assert!(matches!(
        producer.push(CaptureBuffer::from_samples(1, a.clone())),
        PushOutcome::Enqueued
    ));
    assert!(matches!(
        producer.push(CaptureBuffer::from_samples(2, b.clone())),
        PushOutcome::Enqueued
    ));

    let worker = {
        let ctx = ctx.clone();
        thread::spawn(move || {
            let sink = backend.open_output(None).expect("memory sink");
            run_playback(ctx, sink, consumer);
        })
    };

    let mut transitions = Vec::new();
    wait_for_event(&mut status_rx, Duration::from_secs(2), |ev| {
        let playback = playback_of(ev);
        transitions.extend(playback);
        playback == Some(PlaybackState::Idle)
    });

    ctx.running.store(false, Ordering::Release);
    worker.join().expect("playback thread panicked");
    drop(producer);

    // One Active for the whole run: no Idle between A and B.
    assert_eq!(transitions, vec![PlaybackState::Active, PlaybackState::Idle]);

    let expected: Vec<i16> = a.iter().chain(b.iter()).copied().collect();
    assert_eq!(out.len(), expected.len());
    assert_eq!(out.samples(), expected);

    let diag = ctx.diagnostics.snapshot();
    assert_eq!(diag.buffers_played, 2);
    assert_eq!(diag.samples_out, 5500);
}

#[test]
fn full_queue_drops_oldest_and_keeps_order() {
    let mut cfg = duplex_config();
    cfg.queue_capacity = 2;
    let (ctx, mut status_rx) = context(cfg);
    let (backend, feed, _out) = MemoryBackend::new();
    let (producer, consumer) = buffer_queue(2);

    let worker = {
        let ctx = ctx.clone();
        thread::spawn(move || {
            let source = backend.open_input(None).expect("memory source");
            run_capture(ctx, source, producer);
        })
    };

    push_recording(&feed, 3000);
    push_recording(&feed, 4000);
    push_recording(&feed, 5000);

    let mut detail = None;
    wait_for_event(&mut status_rx, Duration::from_secs(2), |ev| {
        if ev.dropped_buffers.is_some() {
            detail = ev.detail.clone();
            assert_eq!(ev.dropped_buffers, Some(1));
            true
        } else {
            false
        }
    });
    assert!(detail.unwrap_or_default().contains("#1"));

    ctx.running.store(false, Ordering::Release);
    worker.join().expect("capture thread panicked");

    let second = consumer.try_pop().expect("second recording queued");
    let third = consumer.try_pop().expect("third recording queued");
    assert!(consumer.try_pop().is_none());
    assert_eq!((second.id(), second.samples()[0]), (2, 4000));
    assert_eq!((third.id(), third.samples()[0]), (3, 5000));
    assert_eq!(second.len(), 6 * FRAME_SAMPLES);

    let diag = ctx.diagnostics.snapshot();
    assert_eq!(diag.recordings_started, 3);
    assert_eq!(diag.buffers_dropped, 1);
    assert_eq!(diag.frames_in, 18);
}

#[test]
fn duplex_engine_repeats_every_recording_in_order() {
    let (backend, feed, out) = MemoryBackend::new();
    let engine = RepeaterEngine::with_backend(duplex_config(), backend).unwrap();
    engine.switch_mode(RepeaterMode::Duplex).unwrap();
    engine.start().unwrap();
    assert_eq!(engine.status(), EngineStatus::Running);
    assert!(matches!(
        engine.state(),
        StateSnapshot::Duplex { running: true, .. }
    ));

    push_recording(&feed, 3000);
    push_recording(&feed, 6000);

    let total = 12 * FRAME_SAMPLES;
    assert_eq!(out.wait_for_len(total, Duration::from_secs(3)), total);
    let expected: Vec<i16> = [
        vec![3000; FRAME_SAMPLES],
        vec![100; 5 * FRAME_SAMPLES],
        vec![6000; FRAME_SAMPLES],
        vec![100; 5 * FRAME_SAMPLES],
    ]
    .concat();
    assert_eq!(out.samples(), expected);

    engine.stop().unwrap();
    assert!(matches!(
        engine.state(),
        StateSnapshot::Duplex { running: false, .. }
    ));
    let diag = engine.diagnostics_snapshot();
    assert_eq!(diag.recordings_started, 2);
    assert_eq!(diag.buffers_played, 2);
    assert_eq!(diag.buffers_dropped, 0);
}

//! Sample storage: device ring buffers, frames, capture buffers, and the
//! duplex buffer queue.
//!
//! The device rings use `ringbuf::HeapRb<i16>`, whose `push_slice` and
//! `pop_slice` are wait-free and safe to call from a real-time audio callback.

pub mod capture;
pub mod frame;
pub mod queue;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Producer};

/// Producer half, held by an input callback or an output-writing loop.
pub type SampleProducer = ringbuf::HeapProd<i16>;

/// Consumer half, held by an input-reading loop or an output callback.
pub type SampleConsumer = ringbuf::HeapCons<i16>;

/// Input ring: 64 frames ≈ 1.5 s at 44.1 kHz. Enough to ride out a slow
/// equalizer pass without the callback dropping samples.
pub const INPUT_RING_CAPACITY: usize = 1 << 16;

/// Output ring: 4 frames ≈ 93 ms. Small on purpose, so that writing into it
/// paces the playback loop at device speed.
pub const OUTPUT_RING_CAPACITY: usize = 4 * crate::audio::FRAME_SAMPLES;

/// Create a matched producer/consumer pair backed by a heap-allocated ring buffer.
pub fn create_sample_ring(capacity: usize) -> (SampleProducer, SampleConsumer) {
    HeapRb::<i16>::new(capacity).split()
}

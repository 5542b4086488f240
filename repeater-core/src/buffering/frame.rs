//! Typed audio frame handed from the device layer to the engine loops.

use std::sync::Arc;

use crate::audio::{FRAME_SAMPLES, SAMPLE_RATE};

/// One block of mono `i16` PCM at [`SAMPLE_RATE`].
///
/// Device sources always produce [`FRAME_SAMPLES`] samples per frame. The
/// sample storage is shared and never mutated after construction, so cloning
/// a frame is cheap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Arc<[i16]>,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>) -> Self {
        Self {
            samples: samples.into(),
        }
    }

    /// A full-length frame of digital silence.
    pub fn silence() -> Self {
        Self::new(vec![0; FRAME_SAMPLES])
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration of this frame in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / SAMPLE_RATE as f64
    }
}

impl From<Vec<i16>> for AudioFrame {
    fn from(samples: Vec<i16>) -> Self {
        Self::new(samples)
    }
}

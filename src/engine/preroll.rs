//! Rolling buffer of recent audio replayed through the wake detector when
//! the input gate opens, recovering a wake phrase whose onset landed while
//! the gate was still closed.

use std::collections::VecDeque;

/// Bounded rolling window of the most recent frames while the gate is shut.
pub struct PrerollBuffer {
    frames: VecDeque<Vec<f32>>,
    total_samples: usize,
    capacity_samples: usize,
}

impl PrerollBuffer {
    /// Sizes the window to hold `window_ms` of audio at `sample_rate`.
    pub fn new(window_ms: u32, sample_rate: u32) -> Self {
        let capacity_samples = (window_ms as usize * sample_rate as usize) / 1000;
        Self {
            frames: VecDeque::new(),
            total_samples: 0,
            capacity_samples,
        }
    }

    /// Appends a frame, evicting oldest frames until the window fits again.
    ///
    /// Callers feed fixed blocks no longer than the window; a single frame
    /// exceeding it is kept whole, so `len_samples` can sit above the cap
    /// until the next push evicts it.
    pub fn push(&mut self, samples: &[f32]) {
        if self.capacity_samples == 0 {
            return;
        }
        self.total_samples += samples.len();
        self.frames.push_back(samples.to_vec());
        // Keep at least the newest frame even if it alone exceeds the window.
        while self.total_samples > self.capacity_samples && self.frames.len() > 1 {
            if let Some(evicted) = self.frames.pop_front() {
                self.total_samples -= evicted.len();
            }
        }
    }

    /// Buffered frames, oldest first. Does not clear the buffer.
    pub fn snapshot(&self) -> Vec<Vec<f32>> {
        self.frames.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
        self.total_samples = 0;
    }

    pub fn len_samples(&self) -> usize {
        self.total_samples
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

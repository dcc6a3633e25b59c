//! Wake phrase detection seam.
//!
//! The engine talks to detectors through [`WakewordDetector`] so a model
//! backend can be slotted in without touching the state machine. The
//! built-in [`EnergyBurstDetector`] is a thresholding stand-in that lets
//! the whole pipeline run without model files.

use std::sync::{Arc, Mutex};

use crate::audio::rms;
use crate::engine::events::WakeEvent;

/// A streaming wake phrase detector.
pub trait WakewordDetector: Send {
    /// Feeds one frame; returns a detection if the phrase completed on it.
    fn process(&mut self, samples: &[f32]) -> Option<WakeEvent>;

    /// Drops all internal state, as after a detection.
    fn reset(&mut self);

    /// Discards buffered audio while a gate is closed. Backends that keep
    /// a rolling feature window may implement this more cheaply than a
    /// full reset; by default it is one.
    fn clear(&mut self) {
        self.reset();
    }
}

/// Stand-in detector: fires after a run of consecutive loud frames.
pub struct EnergyBurstDetector {
    keyword: String,
    threshold: f32,
    required_frames: u32,
    streak: u32,
}

impl EnergyBurstDetector {
    pub fn new(keyword: impl Into<String>, threshold: f32, required_frames: u32) -> Self {
        Self {
            keyword: keyword.into(),
            threshold,
            required_frames: required_frames.max(1),
            streak: 0,
        }
    }
}

impl WakewordDetector for EnergyBurstDetector {
    fn process(&mut self, samples: &[f32]) -> Option<WakeEvent> {
        if rms(samples) >= self.threshold {
            self.streak += 1;
        } else {
            self.streak = 0;
        }
        if self.streak >= self.required_frames {
            self.streak = 0;
            return Some(WakeEvent::new(self.keyword.clone()).with_score(1.0));
        }
        None
    }

    fn reset(&mut self) {
        self.streak = 0;
    }
}

/// Counters shared with tests that script a [`MockWakeword`].
#[derive(Debug, Default)]
pub struct MockWakewordStats {
    pub process_calls: usize,
    pub clear_calls: usize,
    pub reset_calls: usize,
}

/// Detector scripted to fire on specific process() call indices.
pub struct MockWakeword {
    fire_on_calls: Vec<usize>,
    stats: Arc<Mutex<MockWakewordStats>>,
}

impl MockWakeword {
    /// `fire_on_calls` are zero-based indices of process() invocations
    /// that should report a detection.
    pub fn new(fire_on_calls: Vec<usize>) -> Self {
        Self {
            fire_on_calls,
            stats: Arc::new(Mutex::new(MockWakewordStats::default())),
        }
    }

    pub fn stats(&self) -> Arc<Mutex<MockWakewordStats>> {
        self.stats.clone()
    }
}

#[allow(clippy::unwrap_used)]
impl WakewordDetector for MockWakeword {
    fn process(&mut self, _samples: &[f32]) -> Option<WakeEvent> {
        let call = {
            let mut stats = self.stats.lock().unwrap();
            let call = stats.process_calls;
            stats.process_calls += 1;
            call
        };
        if self.fire_on_calls.contains(&call) {
            Some(WakeEvent::new("mock"))
        } else {
            None
        }
    }

    fn reset(&mut self) {
        self.stats.lock().unwrap().reset_calls += 1;
    }

    fn clear(&mut self) {
        self.stats.lock().unwrap().clear_calls += 1;
    }
}

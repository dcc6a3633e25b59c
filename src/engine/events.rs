//! Engine states, emitted signals, and the listener seam.

use std::time::Instant;

/// The two phases of the utterance engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Scanning incoming audio for the wake phrase.
    ListenWakeword,
    /// Accumulating an utterance after a wake detection.
    CaptureUtterance,
}

/// Coarse status signals published to listeners, in the order they occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateSignal {
    Idle,
    WakeDetected,
    CapturingUtterance,
    UtteranceComplete,
    UtteranceTimeout,
}

impl StateSignal {
    /// Stable wire/log name for this signal.
    pub fn name(&self) -> &'static str {
        match self {
            StateSignal::Idle => "idle",
            StateSignal::WakeDetected => "wake_detected",
            StateSignal::CapturingUtterance => "capturing_utterance",
            StateSignal::UtteranceComplete => "utterance_complete",
            StateSignal::UtteranceTimeout => "utterance_timeout",
        }
    }
}

/// A wake phrase detection.
#[derive(Debug, Clone)]
pub struct WakeEvent {
    /// Which keyword fired, as reported by the detector.
    pub keyword: String,
    /// Detector confidence where the backend provides one.
    pub score: Option<f32>,
    /// When the detection was made.
    pub detected_at: Instant,
}

impl WakeEvent {
    pub fn new(keyword: impl Into<String>) -> Self {
        Self {
            keyword: keyword.into(),
            score: None,
            detected_at: Instant::now(),
        }
    }

    pub fn with_score(mut self, score: f32) -> Self {
        self.score = Some(score);
        self
    }
}

/// Why an utterance capture ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The voice activity detector reported a finished segment.
    VadSegment,
    /// The capture window elapsed with no segment boundary.
    Timeout,
}

impl EndReason {
    pub fn name(&self) -> &'static str {
        match self {
            EndReason::VadSegment => "vad_segment",
            EndReason::Timeout => "timeout",
        }
    }
}

/// A completed utterance handed to listeners.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub reason: EndReason,
}

impl Utterance {
    /// Duration of the captured audio in seconds.
    pub fn duration_secs(&self) -> f32 {
        self.samples.len() as f32 / self.sample_rate as f32
    }
}

/// Receives engine callbacks. All methods default to no-ops so callers
/// implement only what they need. A panicking listener is contained and
/// logged; it never takes the engine down.
pub trait EngineListener: Send {
    fn on_wake(&mut self, _event: &WakeEvent) {}
    fn on_utterance(&mut self, _utterance: &Utterance) {}
    fn on_state(&mut self, _signal: StateSignal) {}
}

/// Listener that does nothing, for callers who only want log output.
pub struct NullListener;

impl EngineListener for NullListener {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_names_are_stable() {
        assert_eq!(StateSignal::Idle.name(), "idle");
        assert_eq!(StateSignal::WakeDetected.name(), "wake_detected");
        assert_eq!(StateSignal::CapturingUtterance.name(), "capturing_utterance");
        assert_eq!(StateSignal::UtteranceComplete.name(), "utterance_complete");
        assert_eq!(StateSignal::UtteranceTimeout.name(), "utterance_timeout");
    }

    #[test]
    fn test_end_reason_names() {
        assert_eq!(EndReason::VadSegment.name(), "vad_segment");
        assert_eq!(EndReason::Timeout.name(), "timeout");
    }

    #[test]
    fn test_utterance_duration() {
        let utterance = Utterance {
            samples: vec![0.0; 16_000],
            sample_rate: 16_000,
            reason: EndReason::VadSegment,
        };
        assert!((utterance.duration_secs() - 1.0).abs() < 1e-6);
    }
}

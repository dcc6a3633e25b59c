//! Scripted audio source for deterministic engine tests.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::audio::{AudioFrame, AudioSource, FrameRead};
use crate::defaults;
use crate::error::{Result, WakefrontError};

/// A phase of scripted audio: the same frame repeated `count` times.
#[derive(Debug, Clone)]
struct FramePhase {
    samples: Vec<f32>,
    count: usize,
}

/// Audio source that replays a scripted sequence of frames and then reports
/// the stream as closed, so engine runs terminate on their own.
pub struct MockAudioSource {
    sample_rate: u32,
    phases: VecDeque<FramePhase>,
    sequence: u64,
    started: bool,
    stop_calls: usize,
    fail_start: bool,
    fail_after_frames: bool,
}

impl MockAudioSource {
    pub fn new() -> Self {
        Self {
            sample_rate: defaults::SAMPLE_RATE,
            phases: VecDeque::new(),
            sequence: 0,
            started: false,
            stop_calls: 0,
            fail_start: false,
            fail_after_frames: false,
        }
    }

    /// Appends `count` copies of a constant-amplitude frame.
    pub fn with_frames(mut self, amplitude: f32, count: usize) -> Self {
        self.phases.push_back(FramePhase {
            samples: vec![amplitude; defaults::BLOCK_SIZE],
            count,
        });
        self
    }

    /// Appends `count` copies of an arbitrary frame.
    pub fn with_raw_frames(mut self, samples: Vec<f32>, count: usize) -> Self {
        self.phases.push_back(FramePhase { samples, count });
        self
    }

    /// Makes start() fail, for exercising fatal-startup paths.
    pub fn with_failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    /// Reports a capture fault once the scripted frames run out, instead of
    /// a clean close, mimicking a device dying mid-stream.
    pub fn with_read_failure(mut self) -> Self {
        self.fail_after_frames = true;
        self
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls
    }

    pub fn frames_remaining(&self) -> usize {
        self.phases.iter().map(|p| p.count).sum()
    }
}

impl Default for MockAudioSource {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSource for MockAudioSource {
    fn start(&mut self) -> Result<()> {
        if self.fail_start {
            return Err(WakefrontError::AudioCapture {
                message: "scripted start failure".to_string(),
            });
        }
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.started = false;
        self.stop_calls += 1;
        Ok(())
    }

    fn read_frame(&mut self, _timeout: Duration) -> FrameRead {
        if !self.started {
            return FrameRead::Closed;
        }
        let Some(phase) = self.phases.front_mut() else {
            if self.fail_after_frames {
                return FrameRead::Failed(WakefrontError::AudioCapture {
                    message: "scripted capture fault".to_string(),
                });
            }
            return FrameRead::Closed;
        };
        let samples = phase.samples.clone();
        phase.count -= 1;
        if phase.count == 0 {
            self.phases.pop_front();
        }
        let frame = AudioFrame::new(samples, Instant::now(), self.sequence);
        self.sequence += 1;
        FrameRead::Frame(frame)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replays_phases_in_order_then_closes() {
        let mut source = MockAudioSource::new()
            .with_frames(0.0, 2)
            .with_frames(0.5, 1);
        source.start().unwrap();

        let timeout = Duration::from_millis(1);
        for expected in [0.0, 0.0, 0.5] {
            match source.read_frame(timeout) {
                FrameRead::Frame(frame) => assert_eq!(frame.samples[0], expected),
                other => panic!("expected frame, got {:?}", other),
            }
        }
        assert!(matches!(source.read_frame(timeout), FrameRead::Closed));
    }

    #[test]
    fn test_sequence_numbers_are_monotonic() {
        let mut source = MockAudioSource::new().with_frames(0.1, 3);
        source.start().unwrap();
        let mut last = None;
        while let FrameRead::Frame(frame) = source.read_frame(Duration::from_millis(1)) {
            if let Some(prev) = last {
                assert_eq!(frame.sequence, prev + 1);
            }
            last = Some(frame.sequence);
        }
    }

    #[test]
    fn test_closed_before_start_and_after_stop() {
        let mut source = MockAudioSource::new().with_frames(0.1, 1);
        assert!(matches!(
            source.read_frame(Duration::from_millis(1)),
            FrameRead::Closed
        ));
        source.start().unwrap();
        source.stop().unwrap();
        assert!(matches!(
            source.read_frame(Duration::from_millis(1)),
            FrameRead::Closed
        ));
        assert_eq!(source.stop_calls(), 1);
    }

    #[test]
    fn test_failing_start() {
        let mut source = MockAudioSource::new().with_failing_start();
        assert!(source.start().is_err());
    }

    #[test]
    fn test_read_failure_after_scripted_frames() {
        let mut source = MockAudioSource::new().with_frames(0.1, 1).with_read_failure();
        source.start().unwrap();
        assert!(matches!(
            source.read_frame(Duration::from_millis(1)),
            FrameRead::Frame(_)
        ));
        assert!(matches!(
            source.read_frame(Duration::from_millis(1)),
            FrameRead::Failed(WakefrontError::AudioCapture { .. })
        ));
    }
}

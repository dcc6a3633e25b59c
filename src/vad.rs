//! Voice activity detection seam used to find the end of an utterance.

use std::sync::{Arc, Mutex};

use crate::audio::rms;
use crate::defaults;

/// Segments speech out of the post-wake audio stream.
///
/// Lifecycle per capture: `reset()`, then `accept()` every frame until
/// `segment_ready()` turns true or the capture window times out, then
/// `extract()` with `flush` set only on timeout.
pub trait VoiceActivityDetector: Send {
    /// Drops all state ahead of a fresh capture.
    fn reset(&mut self);

    /// Discards buffered audio without starting a capture. Called while
    /// the gate stays closed so stale audio cannot leak into the next
    /// segment.
    fn clear(&mut self) {
        self.reset();
    }

    /// Feeds one frame of capture audio.
    fn accept(&mut self, samples: &[f32]);

    /// True once a complete speech segment is delimited.
    fn segment_ready(&mut self) -> bool;

    /// Returns the segmented audio. With `flush` set, an open segment is
    /// forced closed and returned as-is.
    fn extract(&mut self, flush: bool) -> Vec<f32>;
}

/// Configuration for the energy-threshold detector.
#[derive(Debug, Clone, Copy)]
pub struct EnergyVadConfig {
    /// RMS level treated as speech.
    pub threshold: f32,
    /// Silence run that closes a segment, in milliseconds.
    pub silence_ms: u32,
    pub sample_rate: u32,
}

impl Default for EnergyVadConfig {
    fn default() -> Self {
        Self {
            threshold: defaults::VAD_THRESHOLD,
            silence_ms: defaults::VAD_SILENCE_MS,
            sample_rate: defaults::SAMPLE_RATE,
        }
    }
}

/// Energy-threshold segmenter. Buffers audio from the first loud frame
/// and closes the segment after a configured run of silence.
pub struct EnergyVad {
    cfg: EnergyVadConfig,
    buffer: Vec<f32>,
    in_speech: bool,
    trailing_silence_samples: usize,
    silence_limit_samples: usize,
    ready: bool,
}

impl EnergyVad {
    pub fn new(cfg: EnergyVadConfig) -> Self {
        let silence_limit_samples =
            (cfg.silence_ms as usize * cfg.sample_rate as usize) / 1000;
        Self {
            cfg,
            buffer: Vec::new(),
            in_speech: false,
            trailing_silence_samples: 0,
            silence_limit_samples,
            ready: false,
        }
    }
}

impl VoiceActivityDetector for EnergyVad {
    fn reset(&mut self) {
        self.buffer.clear();
        self.in_speech = false;
        self.trailing_silence_samples = 0;
        self.ready = false;
    }

    fn accept(&mut self, samples: &[f32]) {
        if self.ready {
            return;
        }
        let loud = rms(samples) >= self.cfg.threshold;
        if loud {
            self.in_speech = true;
            self.trailing_silence_samples = 0;
        }
        if self.in_speech {
            self.buffer.extend_from_slice(samples);
            if !loud {
                self.trailing_silence_samples += samples.len();
                if self.trailing_silence_samples >= self.silence_limit_samples {
                    self.ready = true;
                }
            }
        }
    }

    fn segment_ready(&mut self) -> bool {
        self.ready
    }

    fn extract(&mut self, flush: bool) -> Vec<f32> {
        if self.ready || flush {
            let audio = std::mem::take(&mut self.buffer);
            self.in_speech = false;
            self.trailing_silence_samples = 0;
            self.ready = false;
            audio
        } else {
            Vec::new()
        }
    }
}

/// Call counts shared with tests scripting a [`MockVad`].
#[derive(Debug, Default)]
pub struct MockVadStats {
    pub reset_calls: usize,
    pub clear_calls: usize,
    pub accept_calls: usize,
    pub extract_flushes: Vec<bool>,
}

/// Detector scripted to report a segment after a fixed number of frames.
pub struct MockVad {
    ready_after_accepts: Option<usize>,
    buffer: Vec<f32>,
    stats: Arc<Mutex<MockVadStats>>,
}

#[allow(clippy::unwrap_used)]
impl MockVad {
    /// `ready_after_accepts`: segment_ready() turns true once that many
    /// frames have been accepted since the last reset; None never
    /// delimits, forcing the timeout path.
    pub fn new(ready_after_accepts: Option<usize>) -> Self {
        Self {
            ready_after_accepts,
            buffer: Vec::new(),
            stats: Arc::new(Mutex::new(MockVadStats::default())),
        }
    }

    pub fn stats(&self) -> Arc<Mutex<MockVadStats>> {
        self.stats.clone()
    }

    fn accepted(&self) -> usize {
        self.stats.lock().unwrap().accept_calls
    }
}

#[allow(clippy::unwrap_used)]
impl VoiceActivityDetector for MockVad {
    fn reset(&mut self) {
        let mut stats = self.stats.lock().unwrap();
        stats.reset_calls += 1;
        stats.accept_calls = 0;
        drop(stats);
        self.buffer.clear();
    }

    fn clear(&mut self) {
        self.stats.lock().unwrap().clear_calls += 1;
        self.buffer.clear();
    }

    fn accept(&mut self, samples: &[f32]) {
        self.stats.lock().unwrap().accept_calls += 1;
        self.buffer.extend_from_slice(samples);
    }

    fn segment_ready(&mut self) -> bool {
        match self.ready_after_accepts {
            Some(n) => self.accepted() >= n,
            None => false,
        }
    }

    fn extract(&mut self, flush: bool) -> Vec<f32> {
        self.stats.lock().unwrap().extract_flushes.push(flush);
        std::mem::take(&mut self.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> EnergyVadConfig {
        EnergyVadConfig {
            threshold: 0.1,
            silence_ms: 100, // 1600 samples, five 320-sample frames
            sample_rate: 16_000,
        }
    }

    fn loud() -> Vec<f32> {
        vec![0.5; 320]
    }

    fn quiet() -> Vec<f32> {
        vec![0.0; 320]
    }

    #[test]
    fn test_segment_closes_after_silence_run() {
        let mut vad = EnergyVad::new(cfg());
        vad.accept(&loud());
        for _ in 0..4 {
            vad.accept(&quiet());
            assert!(!vad.segment_ready());
        }
        vad.accept(&quiet());
        assert!(vad.segment_ready());
        let audio = vad.extract(false);
        // Speech frame plus the trailing silence that delimited it.
        assert_eq!(audio.len(), 6 * 320);
    }

    #[test]
    fn test_leading_silence_is_not_buffered() {
        let mut vad = EnergyVad::new(cfg());
        for _ in 0..10 {
            vad.accept(&quiet());
        }
        vad.accept(&loud());
        assert!(!vad.segment_ready());
        let audio = vad.extract(true);
        assert_eq!(audio.len(), 320);
    }

    #[test]
    fn test_speech_resets_silence_run() {
        let mut vad = EnergyVad::new(cfg());
        vad.accept(&loud());
        for _ in 0..4 {
            vad.accept(&quiet());
        }
        vad.accept(&loud());
        for _ in 0..4 {
            vad.accept(&quiet());
        }
        assert!(!vad.segment_ready());
    }

    #[test]
    fn test_extract_without_segment_or_flush_is_empty() {
        let mut vad = EnergyVad::new(cfg());
        vad.accept(&loud());
        assert!(vad.extract(false).is_empty());
        // Audio is still buffered for a later flush.
        assert_eq!(vad.extract(true).len(), 320);
    }

    #[test]
    fn test_reset_discards_pending_audio() {
        let mut vad = EnergyVad::new(cfg());
        vad.accept(&loud());
        vad.reset();
        assert!(vad.extract(true).is_empty());
    }

    #[test]
    fn test_accept_after_ready_is_ignored() {
        let mut vad = EnergyVad::new(cfg());
        vad.accept(&loud());
        for _ in 0..5 {
            vad.accept(&quiet());
        }
        assert!(vad.segment_ready());
        let before = 6 * 320;
        vad.accept(&loud());
        assert_eq!(vad.extract(false).len(), before);
    }
}

//! The two-phase utterance engine.
//!
//! One consumer thread owns the whole decision path: it pulls frames off
//! the capture queue, runs the gate, the wake detector, and the voice
//! activity detector, and publishes signals to listeners. The capture
//! backend and the gate poller are the only other threads.

pub mod clock;
pub mod events;
pub mod preroll;

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::audio::{AudioSource, FrameRead};
use crate::defaults;
use crate::error::Result;
use crate::gate::WakeGate;
use crate::vad::VoiceActivityDetector;
use crate::wake::WakewordDetector;

use clock::{Clock, SystemClock};
use events::{EndReason, EngineListener, EngineState, StateSignal, Utterance, WakeEvent};
use preroll::PrerollBuffer;

/// Engine timing and shaping knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub sample_rate: u32,
    pub block_size: usize,
    /// Linear gain applied to every frame before analysis.
    pub input_gain: f32,
    /// Hard cap on a single capture, in seconds.
    pub max_utterance_s: f32,
    pub preroll_enabled: bool,
    pub preroll_ms: u32,
    /// How long one queue read may block; bounds shutdown latency.
    pub read_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: defaults::SAMPLE_RATE,
            block_size: defaults::BLOCK_SIZE,
            input_gain: 1.0,
            max_utterance_s: defaults::MAX_UTTERANCE_S,
            preroll_enabled: true,
            preroll_ms: defaults::PREROLL_MS,
            read_timeout: Duration::from_millis(defaults::FRAME_READ_TIMEOUT_MS),
        }
    }
}

/// Cancellation handle for a running engine. Clone freely; `stop` is
/// idempotent and safe from any thread or signal context.
#[derive(Clone)]
pub struct EngineHandle {
    running: Arc<AtomicBool>,
}

impl EngineHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Wake-then-capture state machine over a gated audio stream.
pub struct UtteranceEngine {
    cfg: EngineConfig,
    source: Box<dyn AudioSource>,
    wakeword: Box<dyn WakewordDetector>,
    vad: Box<dyn VoiceActivityDetector>,
    gate: WakeGate,
    listeners: Vec<Box<dyn EngineListener>>,
    clock: Arc<dyn Clock>,
    running: Arc<AtomicBool>,

    state: EngineState,
    preroll: PrerollBuffer,
    last_gate_open: Option<bool>,
    utterance_buf: Vec<f32>,
    capture_start: Option<Instant>,
}

impl UtteranceEngine {
    pub fn new(
        cfg: EngineConfig,
        source: Box<dyn AudioSource>,
        wakeword: Box<dyn WakewordDetector>,
        vad: Box<dyn VoiceActivityDetector>,
        gate: WakeGate,
    ) -> Self {
        let preroll_ms = if cfg.preroll_enabled { cfg.preroll_ms } else { 0 };
        let preroll = PrerollBuffer::new(preroll_ms, cfg.sample_rate);
        Self {
            cfg,
            source,
            wakeword,
            vad,
            gate,
            listeners: Vec::new(),
            clock: Arc::new(SystemClock),
            running: Arc::new(AtomicBool::new(true)),
            state: EngineState::ListenWakeword,
            preroll,
            last_gate_open: None,
            utterance_buf: Vec::new(),
            capture_start: None,
        }
    }

    pub fn add_listener(&mut self, listener: Box<dyn EngineListener>) {
        self.listeners.push(listener);
    }

    /// Replaces the clock, for tests that script time.
    pub fn set_clock(&mut self, clock: Arc<dyn Clock>) {
        self.clock = clock;
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            running: self.running.clone(),
        }
    }

    /// Runs until the source closes or the handle stops the engine.
    /// A source that fails to start, or dies mid-stream, is fatal: the
    /// engine shuts down and the error propagates to the caller.
    pub fn run(&mut self) -> Result<()> {
        self.source.start()?;
        let preroll_ms = if self.cfg.preroll_enabled { self.cfg.preroll_ms } else { 0 };
        info!(
            sample_rate = self.cfg.sample_rate,
            block_size = self.cfg.block_size,
            preroll_ms,
            "engine started"
        );
        self.emit_signal(StateSignal::Idle);

        while self.running.load(Ordering::SeqCst) {
            let frame = match self.source.read_frame(self.cfg.read_timeout) {
                FrameRead::Frame(frame) => frame,
                FrameRead::TimedOut => continue,
                FrameRead::Closed => {
                    debug!("audio source closed");
                    break;
                }
                FrameRead::Failed(err) => {
                    warn!(error = %err, "audio source failed");
                    self.shutdown();
                    return Err(err);
                }
            };

            let samples = self.shape_frame(frame.samples);
            match self.state {
                EngineState::ListenWakeword => self.listen_frame(&samples),
                EngineState::CaptureUtterance => self.capture_frame(&samples),
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Applies gain and pads a trailing short frame out to the block size,
    /// so downstream detectors always see uniform frames.
    fn shape_frame(&self, mut samples: Vec<f32>) -> Vec<f32> {
        if (self.cfg.input_gain - 1.0).abs() > f32::EPSILON {
            for s in &mut samples {
                *s = (*s * self.cfg.input_gain).clamp(-1.0, 1.0);
            }
        }
        if samples.len() < self.cfg.block_size {
            samples.resize(self.cfg.block_size, 0.0);
        }
        samples
    }

    fn listen_frame(&mut self, samples: &[f32]) {
        if self.cfg.preroll_enabled {
            self.preroll.push(samples);
        }

        let open = self.gate.is_open(samples);
        let just_opened = open && self.last_gate_open != Some(true);
        if self.last_gate_open != Some(open) {
            let metrics = self.gate.metrics();
            info!(
                open,
                mode = metrics.mode.name(),
                energy = metrics.energy,
                "gate transition"
            );
            self.last_gate_open = Some(open);
        }

        if !open {
            // Closed-gate frames must not linger inside the detector, or
            // stale audio would color the next scan.
            self.wakeword.clear();
            return;
        }

        if just_opened && self.cfg.preroll_enabled {
            // The phrase may have started while the gate was shut. Replay
            // the recent window, oldest first; the current frame is the
            // newest entry, so it is not fed again. Stop at the first
            // detection.
            let replay = self.preroll.snapshot();
            debug!(frames = replay.len(), "replaying pre-roll window");
            for buffered in replay {
                if self.feed_wakeword(&buffered) {
                    return;
                }
            }
            return;
        }

        self.feed_wakeword(samples);
    }

    /// Feeds one frame to the wake detector; on a detection, flips the
    /// engine into capture. Returns whether a detection fired.
    fn feed_wakeword(&mut self, samples: &[f32]) -> bool {
        match self.wakeword.process(samples) {
            Some(event) => {
                info!(keyword = %event.keyword, score = event.score, "wake phrase detected");
                self.begin_capture(event, samples);
                true
            }
            None => {
                // No detection on this frame; drop any partial VAD state
                // accumulated from earlier noise.
                self.vad.clear();
                false
            }
        }
    }

    fn begin_capture(&mut self, event: WakeEvent, samples: &[f32]) {
        self.emit_wake(&event);
        self.vad.reset();
        self.utterance_buf.clear();
        self.utterance_buf.extend_from_slice(samples);
        self.preroll.clear();
        self.capture_start = Some(self.clock.now());
        self.state = EngineState::CaptureUtterance;
        self.emit_signal(StateSignal::WakeDetected);
        self.emit_signal(StateSignal::CapturingUtterance);
    }

    fn capture_frame(&mut self, samples: &[f32]) {
        self.vad.accept(samples);
        self.utterance_buf.extend_from_slice(samples);

        // The segment check wins over the deadline when both hold on the
        // same frame.
        let segment_ready = self.vad.segment_ready();
        let timed_out = match self.capture_start {
            Some(start) => {
                let elapsed = self.clock.now().saturating_duration_since(start);
                elapsed >= Duration::from_secs_f32(self.cfg.max_utterance_s)
            }
            None => false,
        };
        if !segment_ready && !timed_out {
            return;
        }

        let reason = if segment_ready {
            EndReason::VadSegment
        } else {
            EndReason::Timeout
        };
        let mut audio = self.vad.extract(reason == EndReason::Timeout);
        if audio.is_empty() {
            // The detector delimited nothing usable; hand over the raw
            // capture window instead of an empty utterance.
            audio = std::mem::take(&mut self.utterance_buf);
        }

        let utterance = Utterance {
            samples: audio,
            sample_rate: self.cfg.sample_rate,
            reason,
        };
        info!(
            reason = reason.name(),
            duration_s = utterance.duration_secs(),
            "utterance captured"
        );
        self.emit_utterance(&utterance);

        self.vad.reset();
        self.utterance_buf.clear();
        self.capture_start = None;
        self.state = EngineState::ListenWakeword;
        self.emit_signal(match reason {
            EndReason::VadSegment => StateSignal::UtteranceComplete,
            EndReason::Timeout => StateSignal::UtteranceTimeout,
        });
        self.emit_signal(StateSignal::Idle);
    }

    fn shutdown(&mut self) {
        if let Err(e) = self.source.stop() {
            warn!(error = %e, "audio source stop failed");
        }
        self.gate.close();
        self.emit_signal(StateSignal::Idle);
        info!("engine stopped");
    }

    fn emit_signal(&mut self, signal: StateSignal) {
        for listener in &mut self.listeners {
            let call = catch_unwind(AssertUnwindSafe(|| listener.on_state(signal)));
            if call.is_err() {
                warn!(signal = signal.name(), "listener panicked in on_state");
            }
        }
    }

    fn emit_wake(&mut self, event: &WakeEvent) {
        for listener in &mut self.listeners {
            let call = catch_unwind(AssertUnwindSafe(|| listener.on_wake(event)));
            if call.is_err() {
                warn!("listener panicked in on_wake");
            }
        }
    }

    fn emit_utterance(&mut self, utterance: &Utterance) {
        for listener in &mut self.listeners {
            let call = catch_unwind(AssertUnwindSafe(|| listener.on_utterance(utterance)));
            if call.is_err() {
                warn!("listener panicked in on_utterance");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::mock::MockAudioSource;
    use crate::gate::{GateConfig, GateMode};
    use crate::vad::MockVad;
    use crate::wake::MockWakeword;

    fn open_gate() -> WakeGate {
        let cfg = GateConfig {
            mode: GateMode::Rms,
            rms_threshold: 0.0,
            ..GateConfig::default()
        };
        WakeGate::new(cfg).unwrap()
    }

    #[test]
    fn test_handle_stop_is_idempotent() {
        let engine = UtteranceEngine::new(
            EngineConfig::default(),
            Box::new(MockAudioSource::new()),
            Box::new(MockWakeword::new(vec![])),
            Box::new(MockVad::new(None)),
            open_gate(),
        );
        let handle = engine.handle();
        assert!(handle.is_running());
        handle.stop();
        handle.stop();
        assert!(!handle.is_running());
    }

    #[test]
    fn test_failing_source_start_is_fatal() {
        let mut engine = UtteranceEngine::new(
            EngineConfig::default(),
            Box::new(MockAudioSource::new().with_failing_start()),
            Box::new(MockWakeword::new(vec![])),
            Box::new(MockVad::new(None)),
            open_gate(),
        );
        assert!(engine.run().is_err());
    }

    #[test]
    fn test_shape_frame_pads_and_clamps() {
        let mut cfg = EngineConfig::default();
        cfg.block_size = 4;
        cfg.input_gain = 4.0;
        let engine = UtteranceEngine::new(
            cfg,
            Box::new(MockAudioSource::new()),
            Box::new(MockWakeword::new(vec![])),
            Box::new(MockVad::new(None)),
            open_gate(),
        );
        let shaped = engine.shape_frame(vec![0.5, -0.5]);
        assert_eq!(shaped, vec![1.0, -1.0, 0.0, 0.0]);
    }
}

//! Default configuration constants for wakefront.
//!
//! Shared across the config types and the component defaults so the tuned
//! values live in exactly one place.

/// Default audio sample rate in Hz.
///
/// 16kHz is the standard for speech pipelines and what the wakeword and VAD
/// models downstream expect.
pub const SAMPLE_RATE: u32 = 16_000;

/// Default capture block size in samples (20ms at 16kHz).
pub const BLOCK_SIZE: usize = 320;

/// Capacity of the bounded frame queue between the capture thread and the
/// engine consumer (~1s of audio at 20ms blocks).
///
/// On overflow the oldest frame is dropped; the capture callback never
/// blocks, because stalling it causes audible artifacts and underruns.
pub const FRAME_QUEUE_CAPACITY: usize = 50;

/// Default RMS threshold above which the wake gate opens.
///
/// Tuned for typical far-field microphone levels; the separate VAD threshold
/// is intentionally higher.
pub const WAKE_RMS_THRESHOLD: f32 = 0.0035;

/// Frames the rms gate stays open after the signal drops below threshold.
pub const WAKE_RMS_HOLD_FRAMES: u32 = 8;

/// Default hardware speech-energy thresholds for the array controller.
///
/// These are raw beamformer energies, not normalized levels.
pub const SPEECH_ENERGY_HIGH: f32 = 50_000.0;
pub const SPEECH_ENERGY_LOW: f32 = 5_000.0;

/// Consecutive polls at or above `SPEECH_ENERGY_HIGH` required to open the
/// hardware gate. Kept low so speech onset is not clipped.
pub const OPEN_CONSECUTIVE_POLLS: u32 = 2;

/// Consecutive polls at or below `SPEECH_ENERGY_LOW` required to close the
/// hardware gate. Higher than the open count so transient dips during an
/// utterance do not flap the gate shut.
pub const CLOSE_CONSECUTIVE_POLLS: u32 = 5;

/// Hardware energy poll interval in milliseconds.
pub const POLL_INTERVAL_MS: u64 = 50;

/// Default pre-roll window retained while idle, in milliseconds.
///
/// Replayed through the wake detector on every gate-open transition so the
/// first phonemes clipped by gate latency are still decoded.
pub const PREROLL_MS: u32 = 400;

/// Maximum utterance capture length in seconds before a forced timeout.
pub const MAX_UTTERANCE_S: f32 = 10.0;

/// Default VAD RMS threshold for the built-in energy segmenter.
pub const VAD_THRESHOLD: f32 = 0.015;

/// Silence following speech before the energy VAD closes a segment (ms).
pub const VAD_SILENCE_MS: u32 = 1_000;

/// How long the engine blocks on the frame queue per pull (ms).
///
/// Bounds shutdown latency: the consumer re-checks its running flag at this
/// cadence when the producer stalls.
pub const FRAME_READ_TIMEOUT_MS: u64 = 100;

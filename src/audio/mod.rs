//! Audio capture: frame types, the source trait and the bounded frame queue.
//!
//! All capture backends produce fixed-length mono `f32` frames in [-1, 1]
//! through a bounded single-producer/single-consumer queue. The producer
//! (audio callback or reader thread) never blocks: on overflow the oldest
//! frame is dropped and a warning recorded.

pub mod arecord;
#[cfg(feature = "cpal-audio")]
pub mod capture;
pub mod mock;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use tracing::warn;

use crate::error::{Result, WakefrontError};

/// One block of mono float samples captured from the microphone.
///
/// Immutable once queued; ownership transfers to the consumer on dequeue.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// PCM samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Timestamp when this frame was captured.
    pub timestamp: Instant,
    /// Sequence number for ordering and gap detection.
    pub sequence: u64,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, timestamp: Instant, sequence: u64) -> Self {
        Self {
            samples,
            timestamp,
            sequence,
        }
    }
}

/// Outcome of a single bounded-wait pull from an audio source.
#[derive(Debug)]
pub enum FrameRead {
    /// A frame is ready.
    Frame(AudioFrame),
    /// Nothing arrived within the timeout; the source is still live.
    TimedOut,
    /// The source was stopped deliberately; no further frames will arrive.
    Closed,
    /// The stream died mid-capture. Fatal to the run.
    Failed(WakefrontError),
}

/// Trait for audio capture backends.
///
/// `start` begins capture (a device that cannot be opened is a fatal,
/// propagated error). `stop` halts capture and releases the device and is
/// idempotent. `read_frame` blocks up to `timeout` for the next frame; the
/// consumer distinguishes a transiently empty queue (`TimedOut`) from a
/// deliberately stopped source (`Closed`) from one that died on a device
/// fault (`Failed`).
pub trait AudioSource: Send {
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    fn read_frame(&mut self, timeout: Duration) -> FrameRead;

    /// Sample rate of the frames this source produces.
    fn sample_rate(&self) -> u32;
}

/// Producer half of the bounded frame queue with drop-oldest semantics.
///
/// Holds its own receiver clone so that on a full queue it can evict the
/// oldest frame instead of blocking. Cloning the underlying channel is what
/// makes this safe: eviction and insertion are two lock-free operations, and
/// the capture path never waits on the consumer.
pub struct FrameSender {
    tx: Sender<AudioFrame>,
    drain: Receiver<AudioFrame>,
    sequence: u64,
    dropped: Arc<AtomicU64>,
}

impl FrameSender {
    /// Pushes a frame, evicting the oldest one first when the queue is full.
    pub fn push(&mut self, samples: Vec<f32>) {
        let frame = AudioFrame::new(samples, Instant::now(), self.sequence);
        self.sequence += 1;

        match self.tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                let _ = self.drain.try_recv();
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(dropped_total = total, "frame queue full, dropped oldest frame");
                // A second producer cannot exist, so after one eviction this
                // insert can only fail if the consumer disconnected.
                let _ = self.tx.try_send(frame);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Total frames dropped to backpressure since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Creates the bounded frame queue shared by a capture backend and its
/// consumer.
pub fn frame_queue(capacity: usize) -> (FrameSender, Receiver<AudioFrame>) {
    let (tx, rx) = bounded(capacity);
    let sender = FrameSender {
        tx,
        drain: rx.clone(),
        sequence: 0,
        dropped: Arc::new(AtomicU64::new(0)),
    };
    (sender, rx)
}

/// First fault recorded by a backend's producer side, for the consumer to
/// pick up once the queue stops yielding frames. Later faults are dropped;
/// the first one names the actual cause.
#[derive(Clone, Default)]
pub(crate) struct FaultSlot(Arc<Mutex<Option<WakefrontError>>>);

impl FaultSlot {
    pub(crate) fn record(&self, err: WakefrontError) {
        let mut slot = self.0.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    pub(crate) fn take(&self) -> Option<WakefrontError> {
        self.0.lock().unwrap_or_else(|p| p.into_inner()).take()
    }
}

/// Shared receive helper used by the capture backends.
pub(crate) fn read_from_queue(
    rx: &Receiver<AudioFrame>,
    running: bool,
    timeout: Duration,
) -> FrameRead {
    if !running {
        return FrameRead::Closed;
    }
    match rx.recv_timeout(timeout) {
        Ok(frame) => FrameRead::Frame(frame),
        Err(RecvTimeoutError::Timeout) => FrameRead::TimedOut,
        Err(RecvTimeoutError::Disconnected) => FrameRead::Closed,
    }
}

/// Converts one 16-bit PCM sample to float. The divisor matches the S16_LE
/// wire decode so both backends normalize identically; full-scale negative
/// maps to exactly -1.0.
pub(crate) fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Root-mean-square energy of a frame, in [0, 1] for in-range samples.
///
/// The epsilon keeps the result finite for all-zero frames.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    ((sum_squares / samples.len() as f64) + 1e-12).sqrt() as f32
}

/// Selects one channel out of interleaved multi-channel samples.
///
/// Array microphones put different signals on each channel (the non-selected
/// one may carry a residual, not voice), so downmix picks a channel rather
/// than averaging.
pub fn select_channel(interleaved: &[f32], channels: usize, channel: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    let channel = channel.min(channels - 1);
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame[channel])
        .collect()
}

/// Writes float mono [-1, 1] audio to a 16-bit PCM WAV file.
pub fn write_wav_mono_16bit(path: &Path, audio: &[f32], sample_rate: u32) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).map_err(|e| {
        crate::error::WakefrontError::Other(format!(
            "Failed to create WAV at {}: {}",
            path.display(),
            e
        ))
    })?;
    for &s in audio {
        let clipped = s.clamp(-1.0, 1.0);
        writer
            .write_sample((clipped * 32767.0) as i16)
            .map_err(|e| crate::error::WakefrontError::Other(format!("WAV write failed: {}", e)))?;
    }
    writer
        .finalize()
        .map_err(|e| crate::error::WakefrontError::Other(format!("WAV finalize failed: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rms_silence_is_near_zero() {
        let silence = vec![0.0f32; 320];
        assert!(rms(&silence) < 1e-5);
    }

    #[test]
    fn test_rms_full_scale() {
        let loud = vec![1.0f32; 320];
        let value = rms(&loud);
        assert!((value - 1.0).abs() < 0.001, "expected ~1.0, got {}", value);
    }

    #[test]
    fn test_rms_empty_is_zero() {
        assert_eq!(rms(&[]), 0.0);
    }

    #[test]
    fn test_rms_mixed_signs() {
        let mut mixed = vec![0.03f32; 160];
        mixed.extend(vec![-0.03f32; 160]);
        let value = rms(&mixed);
        assert!((value - 0.03).abs() < 0.001, "expected ~0.03, got {}", value);
    }

    #[test]
    fn test_select_channel_mono_passthrough() {
        let samples = vec![0.1, 0.2, 0.3];
        assert_eq!(select_channel(&samples, 1, 0), samples);
    }

    #[test]
    fn test_select_channel_picks_not_averages() {
        // Stereo: left carries voice, right carries residual.
        let interleaved = vec![0.5, -0.9, 0.6, -0.8, 0.7, -0.7];
        assert_eq!(select_channel(&interleaved, 2, 0), vec![0.5, 0.6, 0.7]);
        assert_eq!(select_channel(&interleaved, 2, 1), vec![-0.9, -0.8, -0.7]);
    }

    #[test]
    fn test_select_channel_clamps_out_of_range_index() {
        let interleaved = vec![0.1, 0.2, 0.3, 0.4];
        assert_eq!(select_channel(&interleaved, 2, 9), vec![0.2, 0.4]);
    }

    #[test]
    fn test_frame_queue_preserves_order() {
        let (mut tx, rx) = frame_queue(4);
        tx.push(vec![0.0; 4]);
        tx.push(vec![0.1; 4]);
        tx.push(vec![0.2; 4]);

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.sequence, 0);
        assert_eq!(second.sequence, 1);
    }

    #[test]
    fn test_frame_queue_drops_oldest_on_overflow() {
        let (mut tx, rx) = frame_queue(2);
        tx.push(vec![0.0; 4]);
        tx.push(vec![0.1; 4]);
        tx.push(vec![0.2; 4]); // evicts sequence 0

        assert_eq!(tx.dropped(), 1);
        assert_eq!(rx.try_recv().unwrap().sequence, 1);
        assert_eq!(rx.try_recv().unwrap().sequence, 2);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_frame_queue_producer_never_blocks() {
        let (mut tx, _rx) = frame_queue(2);
        for _ in 0..100 {
            tx.push(vec![0.0; 4]);
        }
        assert_eq!(tx.dropped(), 98);
    }

    #[test]
    fn test_read_from_queue_distinguishes_stopped_from_empty() {
        let (_tx, rx) = frame_queue(2);
        assert!(matches!(
            read_from_queue(&rx, true, Duration::from_millis(1)),
            FrameRead::TimedOut
        ));
        assert!(matches!(
            read_from_queue(&rx, false, Duration::from_millis(1)),
            FrameRead::Closed
        ));
    }

    #[test]
    fn test_read_from_queue_closed_when_sender_dropped() {
        let (tx, rx) = frame_queue(2);
        drop(tx);
        assert!(matches!(
            read_from_queue(&rx, true, Duration::from_millis(1)),
            FrameRead::Closed
        ));
    }

    #[test]
    fn test_fault_slot_keeps_first_fault() {
        let slot = FaultSlot::default();
        assert!(slot.take().is_none());
        slot.record(WakefrontError::AudioCapture {
            message: "first".to_string(),
        });
        slot.record(WakefrontError::AudioCapture {
            message: "second".to_string(),
        });
        match slot.take() {
            Some(WakefrontError::AudioCapture { message }) => assert_eq!(message, "first"),
            other => panic!("expected the first fault, got {:?}", other),
        }
        assert!(slot.take().is_none(), "take empties the slot");
    }

    #[test]
    fn test_i16_to_f32_normalization() {
        assert_eq!(i16_to_f32(0), 0.0);
        assert_eq!(i16_to_f32(i16::MIN), -1.0);
        assert_eq!(i16_to_f32(16_384), 0.5);
        assert!((i16_to_f32(i16::MAX) - 32_767.0 / 32_768.0).abs() < 1e-7);
    }

    #[test]
    fn test_write_wav_round_trip_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("utterance.wav");
        let audio = vec![0.0f32, 0.5, -0.5, 1.5, -1.5]; // out-of-range values clip
        write_wav_mono_16bit(&path, &audio, 16_000).unwrap();

        let reader = hound::WavReader::open(&path).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_rate, 16_000);
        assert_eq!(spec.bits_per_sample, 16);
        let samples: Vec<i16> = reader.into_samples().map(|s| s.unwrap()).collect();
        assert_eq!(samples.len(), 5);
        assert_eq!(samples[3], 32767);
        assert_eq!(samples[4], -32767);
    }
}

//! Capture backend that shells out to an external ALSA recorder.
//!
//! Some array microphones present an ALSA capture device that CPAL cannot
//! negotiate cleanly. This backend spawns `arecord` emitting raw S16_LE PCM
//! on stdout and reads fixed-size blocks on a dedicated reader thread,
//! feeding the same bounded drop-oldest queue as the callback backend.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Receiver;
use tracing::{debug, warn};

use crate::audio::{
    AudioFrame, AudioSource, FaultSlot, FrameRead, frame_queue, i16_to_f32, read_from_queue,
    select_channel,
};
use crate::defaults;
use crate::error::{Result, WakefrontError};

/// Configuration for the external-recorder backend.
#[derive(Debug, Clone)]
pub struct ArecordConfig {
    /// ALSA device string, e.g. "hw:2,0".
    pub device: String,
    pub sample_rate: u32,
    /// Channels to capture; the array device typically presents stereo.
    pub channels: u16,
    /// Which channel carries the processed voice signal.
    pub channel_select: usize,
    /// Frame length in samples (per channel).
    pub block_size: usize,
    /// Recorder executable; overridable for tests.
    pub program: String,
}

impl ArecordConfig {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            sample_rate: defaults::SAMPLE_RATE,
            channels: 2,
            channel_select: 0,
            block_size: defaults::BLOCK_SIZE,
            program: "arecord".to_string(),
        }
    }
}

/// Audio source backed by a spawned recorder process.
pub struct ArecordAudioSource {
    cfg: ArecordConfig,
    child: Option<Child>,
    reader: Option<JoinHandle<()>>,
    rx: Receiver<AudioFrame>,
    running: Arc<AtomicBool>,
    fault: FaultSlot,
}

impl ArecordAudioSource {
    pub fn new(cfg: ArecordConfig) -> Self {
        let (_sender, rx) = frame_queue(1);
        Self {
            cfg,
            child: None,
            reader: None,
            rx,
            running: Arc::new(AtomicBool::new(false)),
            fault: FaultSlot::default(),
        }
    }
}

impl AudioSource for ArecordAudioSource {
    fn start(&mut self) -> Result<()> {
        if self.child.is_some() {
            return Ok(()); // Already started
        }

        let mut child = Command::new(&self.cfg.program)
            .args([
                "-q",
                "-D",
                &self.cfg.device,
                "-f",
                "S16_LE",
                "-r",
                &self.cfg.sample_rate.to_string(),
                "-c",
                &self.cfg.channels.to_string(),
                "-t",
                "raw",
                "-",
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| WakefrontError::AudioCapture {
                message: format!(
                    "Failed to spawn {} for device {}: {}",
                    self.cfg.program, self.cfg.device, e
                ),
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WakefrontError::AudioCapture {
                message: "Recorder process has no stdout".to_string(),
            })?;

        let (mut sender, rx) = frame_queue(defaults::FRAME_QUEUE_CAPACITY);
        self.rx = rx;
        self.fault = FaultSlot::default();
        self.running.store(true, Ordering::SeqCst);

        let running = self.running.clone();
        let fault = self.fault.clone();
        let channels = self.cfg.channels as usize;
        let channel_select = self.cfg.channel_select;
        let block_bytes = self.cfg.block_size * channels * 2;

        let reader = std::thread::Builder::new()
            .name("arecord-reader".to_string())
            .spawn(move || {
                let mut stdout = stdout;
                let mut buf = vec![0u8; block_bytes];
                while running.load(Ordering::SeqCst) {
                    if let Err(e) = read_exact_block(&mut stdout, &mut buf) {
                        // EOF after stop() killed the recorder is the normal
                        // teardown; EOF while running is a device fault the
                        // consumer must see.
                        if running.load(Ordering::SeqCst) {
                            debug!(error = %e, "recorder stream ended");
                            fault.record(WakefrontError::AudioCapture {
                                message: format!("recorder stream ended: {}", e),
                            });
                        }
                        break;
                    }
                    let interleaved = decode_s16le(&buf);
                    let mono = select_channel(&interleaved, channels, channel_select);
                    sender.push(mono);
                }
                // Dropping the sender disconnects the queue so the consumer
                // observes Closed.
            })
            .map_err(|e| WakefrontError::AudioCapture {
                message: format!("Failed to spawn reader thread: {}", e),
            })?;

        self.child = Some(child);
        self.reader = Some(reader);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);

        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                debug!(error = %e, "recorder process already exited");
            }
            let _ = child.wait();
        }

        if let Some(reader) = self.reader.take()
            && reader.join().is_err()
        {
            warn!("recorder reader thread panicked");
        }
        Ok(())
    }

    fn read_frame(&mut self, timeout: Duration) -> FrameRead {
        match read_from_queue(&self.rx, self.running.load(Ordering::SeqCst), timeout) {
            FrameRead::Frame(frame) => FrameRead::Frame(frame),
            // Queued frames drain first; once the queue stops yielding, a
            // recorded fault outranks a plain close.
            other => match self.fault.take() {
                Some(err) => FrameRead::Failed(err),
                None => other,
            },
        }
    }

    fn sample_rate(&self) -> u32 {
        self.cfg.sample_rate
    }
}

impl Drop for ArecordAudioSource {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Fills `buf` completely, treating EOF as an error so partial trailing
/// blocks at process exit are discarded rather than emitted short.
fn read_exact_block(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<()> {
    reader.read_exact(buf)
}

/// Decodes little-endian 16-bit PCM into floats in [-1, 1].
fn decode_s16le(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16_to_f32(i16::from_le_bytes([pair[0], pair[1]])))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_s16le_known_values() {
        let bytes = [0x00, 0x00, 0xFF, 0x7F, 0x00, 0x80];
        let floats = decode_s16le(&bytes);
        assert_eq!(floats.len(), 3);
        assert_eq!(floats[0], 0.0);
        assert!((floats[1] - (32767.0 / 32768.0)).abs() < 1e-6);
        assert_eq!(floats[2], -1.0);
    }

    #[test]
    fn test_decode_s16le_ignores_trailing_byte() {
        let bytes = [0x00, 0x00, 0x01];
        assert_eq!(decode_s16le(&bytes).len(), 1);
    }

    #[test]
    fn test_decode_then_select_extracts_one_channel() {
        // Raw S16_LE stereo: left channel ramps, right channel is constant.
        let mut bytes = Vec::new();
        for i in 0..640i16 {
            bytes.extend_from_slice(&i.to_le_bytes()); // left
            bytes.extend_from_slice(&1000i16.to_le_bytes()); // right
        }
        let interleaved = decode_s16le(&bytes);
        let mono = select_channel(&interleaved, 2, 1);
        assert_eq!(mono.len(), 640);
        assert!(mono.iter().all(|&s| (s - 1000.0 / 32768.0).abs() < 1e-6));
    }

    #[test]
    fn test_stop_without_start_is_ok() {
        let mut source = ArecordAudioSource::new(ArecordConfig::new("hw:0,0"));
        assert!(source.stop().is_ok());
        assert!(source.stop().is_ok());
    }

    #[test]
    fn test_read_frame_before_start_reports_closed() {
        let mut source = ArecordAudioSource::new(ArecordConfig::new("hw:0,0"));
        assert!(matches!(
            source.read_frame(Duration::from_millis(1)),
            FrameRead::Closed
        ));
    }

    #[test]
    fn test_recorder_death_surfaces_as_failure() {
        // `true` exits at once with no output: an immediate EOF on stdout,
        // the same thing a yanked device produces.
        let mut cfg = ArecordConfig::new("hw:0,0");
        cfg.program = "true".to_string();
        let mut source = ArecordAudioSource::new(cfg);
        source.start().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            match source.read_frame(Duration::from_millis(10)) {
                FrameRead::TimedOut if std::time::Instant::now() < deadline => continue,
                FrameRead::Failed(WakefrontError::AudioCapture { .. }) => break,
                other => panic!("expected a capture fault, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_start_with_missing_program_is_fatal() {
        let mut cfg = ArecordConfig::new("hw:0,0");
        cfg.program = "definitely-not-a-recorder-binary".to_string();
        let mut source = ArecordAudioSource::new(cfg);
        assert!(matches!(
            source.start(),
            Err(WakefrontError::AudioCapture { .. })
        ));
    }
}

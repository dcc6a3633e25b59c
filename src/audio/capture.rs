//! Microphone capture using CPAL (Cross-Platform Audio Library).
//!
//! The CPAL data callback runs on the audio subsystem's own thread. It only
//! ever slices frames into the bounded queue; on overflow the oldest frame
//! is evicted so the callback never waits on the consumer.

use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::Receiver;
use tracing::{info, warn};

use crate::audio::{
    AudioFrame, AudioSource, FaultSlot, FrameRead, FrameSender, frame_queue, i16_to_f32,
    read_from_queue, select_channel,
};
use crate::defaults;
use crate::error::{Result, WakefrontError};

/// Run a closure with stderr temporarily redirected to /dev/null.
///
/// This suppresses noisy ALSA/JACK/PipeWire messages that CPAL triggers
/// when probing audio backends. The messages are harmless but confusing.
///
/// # Safety
/// Uses `libc::dup`/`libc::dup2` to save and restore file descriptor 2
/// (stderr). Safe as long as no other thread is concurrently manipulating
/// fd 2.
fn with_suppressed_stderr<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    unsafe {
        let saved_fd = libc::dup(2);
        let devnull = libc::open(c"/dev/null".as_ptr(), libc::O_WRONLY);
        if saved_fd >= 0 && devnull >= 0 {
            libc::dup2(devnull, 2);
            libc::close(devnull);
        }

        let result = f();

        if saved_fd >= 0 {
            libc::dup2(saved_fd, 2);
            libc::close(saved_fd);
        }

        result
    }
}

/// Preferred device names for desktop/PipeWire environments.
const PREFERRED_DEVICES: &[&str] = &["pipewire", "pulse", "PulseAudio"];

/// Device name patterns to filter out (not useful for voice input).
const FILTERED_PATTERNS: &[&str] = &[
    "surround",
    "front:",
    "rear:",
    "center:",
    "side:",
    "Digital Output",
    "HDMI",
    "S/PDIF",
];

fn should_filter_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    FILTERED_PATTERNS
        .iter()
        .any(|pattern| lower.contains(&pattern.to_lowercase()))
}

fn is_preferred_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    PREFERRED_DEVICES
        .iter()
        .any(|pref| lower.contains(&pref.to_lowercase()))
}

/// List available audio input devices with filtering and recommendations.
///
/// Preferred devices are marked with "\[recommended\]"; obviously unusable
/// devices (surround channels, HDMI outputs) are dropped.
///
/// # Errors
/// Returns `WakefrontError::AudioCapture` if device enumeration fails.
pub fn list_devices() -> Result<Vec<String>> {
    let (host, devices) = with_suppressed_stderr(|| {
        let host = cpal::default_host();
        let devices = host.input_devices();
        (host, devices)
    });
    let _ = host; // keep host alive while iterating devices
    let devices = devices.map_err(|e| WakefrontError::AudioCapture {
        message: format!("Failed to enumerate input devices: {}", e),
    })?;

    let mut device_names = Vec::new();
    for device in devices {
        if let Ok(name) = device.name() {
            if should_filter_device(&name) {
                continue;
            }
            if is_preferred_device(&name) {
                device_names.push(format!("{} [recommended]", name));
            } else {
                device_names.push(name);
            }
        }
    }

    Ok(device_names)
}

/// Get the best default input device, preferring PipeWire/PulseAudio over
/// raw ALSA nodes so the desktop's device selection is respected.
fn get_best_default_device() -> Result<cpal::Device> {
    with_suppressed_stderr(|| {
        let host = cpal::default_host();

        if let Ok(devices) = host.input_devices() {
            for device in devices {
                if let Ok(name) = device.name()
                    && is_preferred_device(&name)
                {
                    return Ok(device);
                }
            }
        }

        host.default_input_device()
            .ok_or_else(|| WakefrontError::AudioDeviceNotFound {
                device: "default".to_string(),
            })
    })
}

/// Wrapper for cpal::Stream to make it Send.
///
/// SAFETY: the stream is only touched from the thread that owns the source;
/// its methods are called synchronously and never cross thread boundaries.
struct SendableStream(cpal::Stream);

unsafe impl Send for SendableStream {}

/// Configuration for the CPAL capture backend.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Device name, or None for the best default.
    pub device: Option<String>,
    pub sample_rate: u32,
    /// Channels to request from the device.
    pub channels: u16,
    /// Which channel to keep when the device is multi-channel.
    pub channel_select: usize,
    /// Frame length in samples (per channel).
    pub block_size: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: defaults::SAMPLE_RATE,
            channels: 1,
            channel_select: 0,
            block_size: defaults::BLOCK_SIZE,
        }
    }
}

/// Per-stream state owned by the data callback: accumulates arbitrary-size
/// callback buffers into fixed-length mono frames.
struct FrameSlicer {
    sender: FrameSender,
    carry: Vec<f32>,
    block_size: usize,
    channels: usize,
    channel_select: usize,
}

impl FrameSlicer {
    fn feed(&mut self, interleaved: &[f32]) {
        let mono = select_channel(interleaved, self.channels, self.channel_select);
        self.carry.extend_from_slice(&mono);
        while self.carry.len() >= self.block_size {
            let rest = self.carry.split_off(self.block_size);
            let block = std::mem::replace(&mut self.carry, rest);
            self.sender.push(block);
        }
    }
}

/// Microphone capture via a CPAL input stream.
///
/// Tries f32 at the requested config first, then i16 with conversion, then
/// the device's native config with software channel selection and
/// resampling. Some PipeWire-ALSA setups accept non-native configs but
/// never fire the data callback, so the native path is kept as a fallback.
pub struct CpalAudioSource {
    device: cpal::Device,
    cfg: CaptureConfig,
    stream: Option<SendableStream>,
    rx: Receiver<AudioFrame>,
    running: bool,
    fault: FaultSlot,
}

impl CpalAudioSource {
    /// Opens the named device (or the best default) without starting capture.
    ///
    /// # Errors
    /// `AudioDeviceNotFound` if the named device does not exist.
    pub fn new(cfg: CaptureConfig) -> Result<Self> {
        let device = with_suppressed_stderr(|| match cfg.device.as_deref() {
            Some(name) => {
                let devices = cpal::default_host().input_devices().map_err(|e| {
                    WakefrontError::AudioCapture {
                        message: format!("Failed to enumerate devices: {}", e),
                    }
                })?;
                for dev in devices {
                    if let Ok(dev_name) = dev.name()
                        && dev_name == name
                    {
                        return Ok(dev);
                    }
                }
                Err(WakefrontError::AudioDeviceNotFound {
                    device: name.to_string(),
                })
            }
            None => get_best_default_device(),
        })?;

        // Placeholder queue; start() installs the live one.
        let (_sender, rx) = frame_queue(1);

        Ok(Self {
            device,
            cfg,
            stream: None,
            rx,
            running: false,
            fault: FaultSlot::default(),
        })
    }

    /// Error callback for the stream builders. CPAL stops invoking the data
    /// callback after a stream error, so the queue goes silent rather than
    /// disconnecting; recording the fault lets `read_frame` tell the
    /// difference.
    fn make_err_callback(&self) -> impl FnMut(cpal::StreamError) + Send + 'static {
        let fault = self.fault.clone();
        move |err| {
            warn!(error = %err, "audio stream error");
            fault.record(WakefrontError::AudioCapture {
                message: format!("audio stream failed: {}", err),
            });
        }
    }

    fn make_slicer(&self, sender: FrameSender, channels: usize) -> FrameSlicer {
        FrameSlicer {
            sender,
            carry: Vec::with_capacity(self.cfg.block_size * 2),
            block_size: self.cfg.block_size,
            channels,
            channel_select: self.cfg.channel_select,
        }
    }

    fn build_stream(&self, sender: FrameSender) -> Result<cpal::Stream> {
        let requested = cpal::StreamConfig {
            channels: self.cfg.channels,
            sample_rate: cpal::SampleRate(self.cfg.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let err_callback = self.make_err_callback();

        // f32 at the requested config — the zero-conversion path. A failed
        // build consumes the sender with the discarded closure; the caller
        // retries with a fresh queue.
        let mut slicer = self.make_slicer(sender, self.cfg.channels as usize);
        self.device
            .build_input_stream(
                &requested,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    slicer.feed(data);
                },
                err_callback,
                None,
            )
            .map_err(|e| WakefrontError::AudioCapture {
                message: format!("Failed to build f32 input stream: {}", e),
            })
    }

    fn build_stream_i16(&self, sender: FrameSender) -> Result<cpal::Stream> {
        let requested = cpal::StreamConfig {
            channels: self.cfg.channels,
            sample_rate: cpal::SampleRate(self.cfg.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let err_callback = self.make_err_callback();

        let mut slicer = self.make_slicer(sender, self.cfg.channels as usize);
        self.device
            .build_input_stream(
                &requested,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let floats: Vec<f32> = data.iter().map(|&s| i16_to_f32(s)).collect();
                    slicer.feed(&floats);
                },
                err_callback,
                None,
            )
            .map_err(|e| WakefrontError::AudioCapture {
                message: format!("Failed to build i16 input stream: {}", e),
            })
    }

    /// Build a stream at the device's native config, converting in software.
    fn build_stream_native(&self, sender: FrameSender) -> Result<cpal::Stream> {
        use cpal::SampleFormat;

        let default_config =
            self.device
                .default_input_config()
                .map_err(|e| WakefrontError::AudioCapture {
                    message: format!("Failed to query default input config: {}", e),
                })?;

        let native_rate = default_config.sample_rate().0;
        let native_channels = default_config.channels() as usize;
        let target_rate = self.cfg.sample_rate;
        let channel_select = self.cfg.channel_select;

        let stream_config: cpal::StreamConfig = default_config.clone().into();

        info!(
            channels = native_channels,
            rate = native_rate,
            format = ?default_config.sample_format(),
            "using native audio format, converting in software"
        );

        let err_callback = self.make_err_callback();

        let mut slicer = self.make_slicer(sender, 1); // conversion happens before the slicer

        match default_config.sample_format() {
            SampleFormat::F32 => self
                .device
                .build_input_stream(
                    &stream_config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        let mono = select_channel(data, native_channels, channel_select);
                        let converted = resample(&mono, native_rate, target_rate);
                        slicer.feed(&converted);
                    },
                    err_callback,
                    None,
                )
                .map_err(|e| WakefrontError::AudioCapture {
                    message: format!("Failed to build native f32 stream: {}", e),
                }),
            SampleFormat::I16 => self
                .device
                .build_input_stream(
                    &stream_config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        let floats: Vec<f32> = data.iter().map(|&s| i16_to_f32(s)).collect();
                        let mono = select_channel(&floats, native_channels, channel_select);
                        let converted = resample(&mono, native_rate, target_rate);
                        slicer.feed(&converted);
                    },
                    err_callback,
                    None,
                )
                .map_err(|e| WakefrontError::AudioCapture {
                    message: format!("Failed to build native i16 stream: {}", e),
                }),
            fmt => Err(WakefrontError::AudioCapture {
                message: format!(
                    "Unsupported native sample format: {:?}. Try another --device.",
                    fmt
                ),
            }),
        }
    }
}

/// Linear-interpolation resampler for the native-config fallback path.
fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = (samples.len() as f64 / ratio).ceil() as usize;

    (0..output_len)
        .map(|i| {
            let source_pos = i as f64 * ratio;
            let source_idx = (source_pos.floor() as usize).min(samples.len() - 1);
            let fraction = source_pos - source_idx as f64;

            if source_idx + 1 >= samples.len() {
                samples[source_idx]
            } else {
                let left = samples[source_idx] as f64;
                let right = samples[source_idx + 1] as f64;
                (left + (right - left) * fraction) as f32
            }
        })
        .collect()
}

impl AudioSource for CpalAudioSource {
    fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(()); // Already started
        }
        self.fault = FaultSlot::default();

        // Each attempt gets its own queue: a rejected stream build consumes
        // the sender with the discarded closure.
        let stream = {
            let (sender, rx) = frame_queue(defaults::FRAME_QUEUE_CAPACITY);
            match self.build_stream(sender) {
                Ok(stream) => {
                    self.rx = rx;
                    stream
                }
                Err(_) => {
                    let (sender, rx) = frame_queue(defaults::FRAME_QUEUE_CAPACITY);
                    match self.build_stream_i16(sender) {
                        Ok(stream) => {
                            self.rx = rx;
                            stream
                        }
                        Err(_) => {
                            let (sender, rx) = frame_queue(defaults::FRAME_QUEUE_CAPACITY);
                            let stream = self.build_stream_native(sender)?;
                            self.rx = rx;
                            stream
                        }
                    }
                }
            }
        };

        stream.play().map_err(|e| WakefrontError::AudioCapture {
            message: format!("Failed to start audio stream: {}", e),
        })?;

        self.stream = Some(SendableStream(stream));
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.running = false;
        if let Some(sendable) = self.stream.take() {
            // Dropping the stream tears down the callback, which drops the
            // queue's sender and lets the consumer observe Closed.
            sendable.0.pause().map_err(|e| WakefrontError::AudioCapture {
                message: format!("Failed to stop audio stream: {}", e),
            })?;
        }
        Ok(())
    }

    fn read_frame(&mut self, timeout: Duration) -> FrameRead {
        match read_from_queue(&self.rx, self.running, timeout) {
            FrameRead::Frame(frame) => FrameRead::Frame(frame),
            // A dead stream keeps its sender alive inside the discarded
            // callback, so the queue only times out. Surface the recorded
            // fault instead of spinning.
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

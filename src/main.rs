use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use wakefront::audio::arecord::{ArecordAudioSource, ArecordConfig};
#[cfg(feature = "cpal-audio")]
use wakefront::audio::capture::{CaptureConfig, CpalAudioSource, list_devices};
use wakefront::audio::{AudioSource, write_wav_mono_16bit};
use wakefront::cli::{Cli, Commands};
use wakefront::config::{AudioBackend, Config};
use wakefront::engine::{EngineHandle, UtteranceEngine};
use wakefront::hardware::{HardwareEnergyAccessor, XvfHostAccessor};
use wakefront::led::{HardwareLedController, LedStateListener};
use wakefront::vad::EnergyVad;
use wakefront::wake::EnergyBurstDetector;
use wakefront::{EngineListener, GateMode, Utterance, WakeGate, version_string};

/// Handle the SIGINT handler reaches for; stop() is a plain atomic store.
static STOP_HANDLE: OnceLock<EngineHandle> = OnceLock::new();

extern "C" fn handle_sigint(_: libc::c_int) {
    if let Some(handle) = STOP_HANDLE.get() {
        handle.stop();
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    info!(version = %version_string(), "wakefront starting");

    let config = load_config(&cli)?;

    match cli.command {
        None => run_engine(config, None),
        Some(Commands::Run { wav_dir }) => run_engine(config, wav_dir),
        Some(Commands::Devices) => list_audio_devices(),
        Some(Commands::Gate { seconds }) => monitor_gate(&config, seconds),
    }
}

fn init_tracing(verbose: u8) {
    let default_directive = match verbose {
        0 => "wakefront=info",
        1 => "wakefront=debug",
        _ => "wakefront=trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<Config> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(Config::default_path);
    let mut config = Config::load_or_default(&path)
        .with_context(|| format!("loading config from {}", path.display()))?
        .with_env_overrides()?;

    if let Some(device) = &cli.device {
        config.audio.device = Some(device.clone());
    }
    if let Some(mode) = &cli.gate_mode {
        config.gate.mode = match mode.as_str() {
            "rms" => GateMode::Rms,
            "hardware" => GateMode::Hardware,
            "hybrid" => GateMode::Hybrid,
            other => bail!("unknown gate mode '{}'", other),
        };
    }

    config.validate()?;
    Ok(config)
}

fn build_source(config: &Config) -> Result<Box<dyn AudioSource>> {
    match config.audio.backend {
        #[cfg(feature = "cpal-audio")]
        AudioBackend::Cpal => {
            let capture = CaptureConfig {
                device: config.audio.device.clone(),
                sample_rate: config.audio.sample_rate,
                channels: config.audio.channels,
                channel_select: config.audio.channel_select,
                block_size: config.audio.block_size,
            };
            Ok(Box::new(CpalAudioSource::new(capture)?))
        }
        #[cfg(not(feature = "cpal-audio"))]
        AudioBackend::Cpal => bail!("built without cpal support; use the arecord backend"),
        AudioBackend::Arecord => {
            let device = config
                .audio
                .device
                .clone()
                .unwrap_or_else(|| "default".to_string());
            let mut arecord = ArecordConfig::new(device);
            arecord.sample_rate = config.audio.sample_rate;
            arecord.channels = config.audio.channels;
            arecord.channel_select = config.audio.channel_select;
            arecord.block_size = config.audio.block_size;
            Ok(Box::new(ArecordAudioSource::new(arecord)))
        }
    }
}

fn build_accessor(config: &Config) -> Option<XvfHostAccessor> {
    if !config.hardware.enabled {
        return None;
    }
    let tools_dir = config.hardware.tools_dir.clone().unwrap_or_default();
    match XvfHostAccessor::new(&tools_dir) {
        Ok(accessor) => Some(accessor),
        Err(e) => {
            warn!(error = %e, "array DSP unavailable; gating on frame RMS");
            None
        }
    }
}

fn run_engine(config: Config, wav_dir: Option<PathBuf>) -> Result<()> {
    let source = build_source(&config)?;
    let wake = EnergyBurstDetector::new(
        config.wake.keyword.clone(),
        config.wake.threshold,
        config.wake.required_frames,
    );
    let vad = EnergyVad::new(config.vad_config());

    // The poll thread exists only when a non-rms mode will consult it.
    let gate = if config.gate.mode == GateMode::Rms {
        WakeGate::new(config.gate_config())?
    } else {
        match build_accessor(&config) {
            Some(accessor) => WakeGate::with_hardware(config.gate_config(), Box::new(accessor))?,
            None => WakeGate::new(config.gate_config())?,
        }
    };

    let mut engine = UtteranceEngine::new(
        config.engine_config(),
        source,
        Box::new(wake),
        Box::new(vad),
        gate,
    );

    if let Some(dir) = wav_dir {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating {}", dir.display()))?;
        engine.add_listener(Box::new(WavDumpListener::new(
            dir,
            config.audio.sample_rate,
        )));
    }

    // LEDs need their own handle on the control tool; the gate owns the
    // polling one.
    if config.hardware.leds_enabled
        && let Some(accessor) = build_accessor(&config)
    {
        engine.add_listener(Box::new(LedStateListener::new(HardwareLedController::new(
            accessor,
        ))));
    }

    let handle = engine.handle();
    if STOP_HANDLE.set(handle).is_ok() {
        unsafe {
            libc::signal(libc::SIGINT, handle_sigint as libc::sighandler_t);
            libc::signal(libc::SIGTERM, handle_sigint as libc::sighandler_t);
        }
    }

    engine.run()?;
    Ok(())
}

fn list_audio_devices() -> Result<()> {
    #[cfg(feature = "cpal-audio")]
    {
        let devices = list_devices()?;
        if devices.is_empty() {
            println!("No audio input devices found");
        } else {
            println!("Available audio input devices:");
            for device in devices {
                println!("  {}", device);
            }
        }
        Ok(())
    }
    #[cfg(not(feature = "cpal-audio"))]
    {
        bail!("built without cpal support; try `arecord -l`")
    }
}

/// Prints one gate reading per poll interval, for tuning the energy band.
fn monitor_gate(config: &Config, seconds: u64) -> Result<()> {
    let Some(mut accessor) = build_accessor(config) else {
        bail!("gate monitor needs [hardware] enabled with a reachable control tool");
    };
    let interval = Duration::from_millis(config.gate.poll_interval_ms);
    let deadline = Instant::now() + Duration::from_secs(seconds);
    println!(
        "energy band: open >= {}, close <= {}",
        config.gate.energy_high, config.gate.energy_low
    );
    while Instant::now() < deadline {
        match accessor.read_speech_energy() {
            Ok(energy) => {
                let band = if energy >= config.gate.energy_high {
                    "high"
                } else if energy <= config.gate.energy_low {
                    "low"
                } else {
                    "mid"
                };
                match accessor.read_direction_of_arrival() {
                    Some(doa) => println!("energy {:>12.1}  [{}]  doa {:>4} deg", energy, band, doa),
                    None => println!("energy {:>12.1}  [{}]", energy, band),
                }
            }
            Err(e) => println!("read failed: {}", e),
        }
        std::thread::sleep(interval);
    }
    Ok(())
}

/// Writes each captured utterance to a numbered WAV file.
struct WavDumpListener {
    dir: PathBuf,
    sample_rate: u32,
    counter: u32,
}

impl WavDumpListener {
    fn new(dir: PathBuf, sample_rate: u32) -> Self {
        Self {
            dir,
            sample_rate,
            counter: 0,
        }
    }
}

impl EngineListener for WavDumpListener {
    fn on_utterance(&mut self, utterance: &Utterance) {
        self.counter += 1;
        let name = format!("utterance_{:04}_{}.wav", self.counter, utterance.reason.name());
        let path: &Path = &self.dir.join(name);
        match write_wav_mono_16bit(path, &utterance.samples, self.sample_rate) {
            Ok(()) => info!(path = %path.display(), "utterance written"),
            Err(e) => warn!(error = %e, "wav write failed"),
        }
    }
}

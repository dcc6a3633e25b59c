use std::fs;
use std::path::Path;
#[cfg(feature = "cli")]
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::defaults;
use crate::engine::EngineConfig;
use crate::error::{Result, WakefrontError};
use crate::gate::{GateConfig, GateMode};
use crate::vad::EnergyVadConfig;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub audio: AudioSection,
    pub gate: GateSection,
    pub wake: WakeSection,
    pub vad: VadSection,
    pub engine: EngineSection,
    pub hardware: HardwareSection,
}

/// Which capture backend to drive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AudioBackend {
    Cpal,
    Arecord,
}

/// Audio capture configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioSection {
    pub backend: AudioBackend,
    pub device: Option<String>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Which interleaved channel carries the voice signal.
    pub channel_select: usize,
    pub block_size: usize,
    pub input_gain: f32,
}

/// Wake gate configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GateSection {
    pub mode: GateMode,
    pub rms_threshold: f32,
    pub rms_hold_frames: u32,
    pub energy_high: f32,
    pub energy_low: f32,
    pub open_consecutive: u32,
    pub close_consecutive: u32,
    pub poll_interval_ms: u64,
}

/// Wake phrase detector configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WakeSection {
    pub keyword: String,
    /// Burst detector RMS threshold.
    pub threshold: f32,
    /// Consecutive loud frames the burst detector requires.
    pub required_frames: u32,
}

/// Voice activity detector configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VadSection {
    pub threshold: f32,
    pub silence_ms: u32,
}

/// Engine timing configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineSection {
    pub max_utterance_s: f32,
    pub preroll_enabled: bool,
    pub preroll_ms: u32,
}

/// Array DSP configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HardwareSection {
    pub enabled: bool,
    /// Directory holding the xvf_host control binary.
    pub tools_dir: Option<String>,
    pub leds_enabled: bool,
}

impl Default for AudioSection {
    fn default() -> Self {
        Self {
            backend: AudioBackend::Cpal,
            device: None,
            sample_rate: defaults::SAMPLE_RATE,
            channels: 1,
            channel_select: 0,
            block_size: defaults::BLOCK_SIZE,
            input_gain: 1.0,
        }
    }
}

impl Default for GateSection {
    fn default() -> Self {
        Self {
            mode: GateMode::Rms,
            rms_threshold: defaults::WAKE_RMS_THRESHOLD,
            rms_hold_frames: defaults::WAKE_RMS_HOLD_FRAMES,
            energy_high: defaults::SPEECH_ENERGY_HIGH,
            energy_low: defaults::SPEECH_ENERGY_LOW,
            open_consecutive: defaults::OPEN_CONSECUTIVE_POLLS,
            close_consecutive: defaults::CLOSE_CONSECUTIVE_POLLS,
            poll_interval_ms: defaults::POLL_INTERVAL_MS,
        }
    }
}

impl Default for WakeSection {
    fn default() -> Self {
        Self {
            keyword: "wake".to_string(),
            threshold: 0.05,
            required_frames: 3,
        }
    }
}

impl Default for VadSection {
    fn default() -> Self {
        Self {
            threshold: defaults::VAD_THRESHOLD,
            silence_ms: defaults::VAD_SILENCE_MS,
        }
    }
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_utterance_s: defaults::MAX_UTTERANCE_S,
            preroll_enabled: true,
            preroll_ms: defaults::PREROLL_MS,
        }
    }
}

impl Default for HardwareSection {
    fn default() -> Self {
        Self {
            enabled: false,
            tools_dir: None,
            leds_enabled: false,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Missing fields use default values; invalid TOML is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                WakefrontError::ConfigFileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                WakefrontError::Io(e)
            }
        })?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file, falling back to defaults only when
    /// the file is missing. Invalid TOML stays an error.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(WakefrontError::ConfigFileNotFound { .. }) => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - WAKEFRONT_AUDIO_DEVICE → audio.device
    /// - WAKEFRONT_GATE_MODE → gate.mode (rms|hardware|hybrid)
    /// - WAKEFRONT_TOOLS_DIR → hardware.tools_dir
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(device) = std::env::var("WAKEFRONT_AUDIO_DEVICE")
            && !device.is_empty()
        {
            self.audio.device = Some(device);
        }

        if let Ok(mode) = std::env::var("WAKEFRONT_GATE_MODE")
            && !mode.is_empty()
        {
            self.gate.mode = match mode.as_str() {
                "rms" => GateMode::Rms,
                "hardware" => GateMode::Hardware,
                "hybrid" => GateMode::Hybrid,
                other => {
                    return Err(WakefrontError::ConfigInvalidValue {
                        key: "WAKEFRONT_GATE_MODE".to_string(),
                        message: format!("unknown mode '{}'", other),
                    });
                }
            };
        }

        if let Ok(dir) = std::env::var("WAKEFRONT_TOOLS_DIR")
            && !dir.is_empty()
        {
            self.hardware.tools_dir = Some(dir);
        }

        Ok(self)
    }

    /// Rejects values that would wedge the pipeline. Called once at
    /// startup so bad settings fail before any thread spawns.
    pub fn validate(&self) -> Result<()> {
        if self.audio.sample_rate == 0 {
            return Err(invalid("audio.sample_rate", "must be positive"));
        }
        if self.audio.block_size == 0 {
            return Err(invalid("audio.block_size", "must be positive"));
        }
        if self.audio.channels == 0 {
            return Err(invalid("audio.channels", "must be at least 1"));
        }
        if self.audio.channel_select >= self.audio.channels as usize {
            return Err(invalid(
                "audio.channel_select",
                "must be below audio.channels",
            ));
        }
        if self.audio.input_gain <= 0.0 {
            return Err(invalid("audio.input_gain", "must be positive"));
        }
        if self.wake.required_frames == 0 {
            return Err(invalid("wake.required_frames", "must be at least 1"));
        }
        if self.vad.threshold < 0.0 {
            return Err(invalid("vad.threshold", "must be zero or positive"));
        }
        if self.vad.silence_ms == 0 {
            return Err(invalid("vad.silence_ms", "must be positive"));
        }
        if !(self.engine.max_utterance_s > 0.0) {
            return Err(invalid("engine.max_utterance_s", "must be positive"));
        }
        self.gate_config().validate()
    }

    pub fn gate_config(&self) -> GateConfig {
        GateConfig {
            mode: self.gate.mode,
            rms_threshold: self.gate.rms_threshold,
            rms_hold_frames: self.gate.rms_hold_frames,
            energy_high: self.gate.energy_high,
            energy_low: self.gate.energy_low,
            open_consecutive: self.gate.open_consecutive,
            close_consecutive: self.gate.close_consecutive,
            poll_interval: Duration::from_millis(self.gate.poll_interval_ms),
        }
    }

    pub fn vad_config(&self) -> EnergyVadConfig {
        EnergyVadConfig {
            threshold: self.vad.threshold,
            silence_ms: self.vad.silence_ms,
            sample_rate: self.audio.sample_rate,
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            sample_rate: self.audio.sample_rate,
            block_size: self.audio.block_size,
            input_gain: self.audio.input_gain,
            max_utterance_s: self.engine.max_utterance_s,
            preroll_enabled: self.engine.preroll_enabled,
            preroll_ms: self.engine.preroll_ms,
            read_timeout: Duration::from_millis(defaults::FRAME_READ_TIMEOUT_MS),
        }
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/wakefront/config.toml on Linux
    #[cfg(feature = "cli")]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("wakefront")
            .join("config.toml")
    }
}

fn invalid(key: &str, message: &str) -> WakefrontError {
    WakefrontError::ConfigInvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    // Mutex to serialize tests that modify environment variables
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    // SAFETY: These helpers are only used in tests with ENV_LOCK held,
    // ensuring no concurrent access to environment variables.
    fn set_env(key: &str, value: &str) {
        unsafe { std::env::set_var(key, value) }
    }

    fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) }
    }

    fn clear_wakefront_env() {
        remove_env("WAKEFRONT_AUDIO_DEVICE");
        remove_env("WAKEFRONT_GATE_MODE");
        remove_env("WAKEFRONT_TOOLS_DIR");
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.audio.sample_rate, 16_000);
        assert_eq!(config.audio.block_size, 320);
        assert_eq!(config.gate.mode, GateMode::Rms);
        assert_eq!(config.gate.rms_threshold, 0.0035);
        assert_eq!(config.gate.rms_hold_frames, 8);
        assert_eq!(config.gate.open_consecutive, 2);
        assert_eq!(config.gate.close_consecutive, 5);
        assert_eq!(config.engine.max_utterance_s, 10.0);
        assert_eq!(config.engine.preroll_ms, 400);
        assert!(!config.hardware.enabled);
    }

    #[test]
    fn test_load_from_toml_file() {
        let toml_content = r#"
            [audio]
            backend = "arecord"
            device = "hw:2,0"
            channels = 2
            channel_select = 1

            [gate]
            mode = "hybrid"
            energy_high = 60000.0

            [engine]
            max_utterance_s = 8.0
            preroll_enabled = false
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::load(temp_file.path()).unwrap();

        assert_eq!(config.audio.backend, AudioBackend::Arecord);
        assert_eq!(config.audio.device, Some("hw:2,0".to_string()));
        assert_eq!(config.audio.channels, 2);
        assert_eq!(config.audio.channel_select, 1);
        assert_eq!(config.gate.mode, GateMode::Hybrid);
        assert_eq!(config.gate.energy_high, 60_000.0);
        assert_eq!(config.engine.max_utterance_s, 8.0);
        assert!(!config.engine.preroll_enabled);

        // Untouched sections keep defaults.
        assert_eq!(config.vad.silence_ms, 1_000);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_missing_file_is_distinct_error() {
        let missing = Path::new("/tmp/nonexistent_wakefront_config_12345.toml");
        assert!(matches!(
            Config::load(missing),
            Err(WakefrontError::ConfigFileNotFound { .. })
        ));
        let config = Config::load_or_default(missing).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let invalid_toml = r#"
            [audio
            device = "broken
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(invalid_toml.as_bytes()).unwrap();

        assert!(Config::load(temp_file.path()).is_err());
        assert!(Config::load_or_default(temp_file.path()).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_wakefront_env();

        set_env("WAKEFRONT_AUDIO_DEVICE", "hw:1,0");
        set_env("WAKEFRONT_GATE_MODE", "hardware");
        let config = Config::default().with_env_overrides().unwrap();

        assert_eq!(config.audio.device, Some("hw:1,0".to_string()));
        assert_eq!(config.gate.mode, GateMode::Hardware);

        clear_wakefront_env();
    }

    #[test]
    fn test_env_override_rejects_unknown_mode() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_wakefront_env();

        set_env("WAKEFRONT_GATE_MODE", "telepathy");
        assert!(Config::default().with_env_overrides().is_err());

        clear_wakefront_env();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.audio.channel_select = 5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.engine.max_utterance_s = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.gate.rms_threshold = -1.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.gate.energy_low = config.gate.energy_high + 1.0;
        assert!(config.validate().is_err());
    }
}

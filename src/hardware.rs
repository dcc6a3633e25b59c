//! Microphone-array DSP access over the vendor control binary.
//!
//! The XVF3800 array exposes beam energies, direction of arrival, and LED
//! control through a host-side tool. Everything here shells out to that
//! tool; the engine only sees the [`HardwareEnergyAccessor`] trait, so a
//! box without the hardware runs with the energy gate instead.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::{Result, WakefrontError};

/// Polled readings from an array DSP.
pub trait HardwareEnergyAccessor: Send {
    /// Post-processing speech energy for the active beam.
    fn read_speech_energy(&mut self) -> Result<f32>;

    /// Direction of arrival in degrees, where the DSP reports one.
    /// Best-effort; failures are reported as None.
    fn read_direction_of_arrival(&mut self) -> Option<i32>;
}

/// Controls the array's LED ring.
pub trait HardwareLedControl: Send {
    fn set_effect(&mut self, effect: u32) -> Result<()>;
    fn set_color(&mut self, color_hex: &str) -> Result<()>;
    fn set_brightness(&mut self, brightness: u8) -> Result<()>;
    fn set_power(&mut self, enabled: bool) -> Result<()>;

    fn set_off(&mut self) -> Result<()> {
        self.set_effect(0)?;
        self.set_power(false)
    }
}

/// GPO pin driving the LED ring's power rail.
const LED_POWER_PIN: &str = "33";

/// Accessor backed by the `xvf_host` control binary.
pub struct XvfHostAccessor {
    program: PathBuf,
}

impl XvfHostAccessor {
    /// Verifies the control binary exists before first use.
    pub fn new(tools_dir: impl AsRef<Path>) -> Result<Self> {
        let program = tools_dir.as_ref().join("xvf_host");
        if !program.is_file() {
            return Err(WakefrontError::HardwareUnavailable {
                message: format!("xvf_host not found at {}", program.display()),
            });
        }
        Ok(Self { program })
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.program).args(args).output().map_err(|e| {
            WakefrontError::HardwareCommand {
                message: format!("failed to run xvf_host: {}", e),
            }
        })?;
        if !output.status.success() {
            let err = String::from_utf8_lossy(&output.stderr);
            let err = err.trim();
            return Err(WakefrontError::HardwareCommand {
                message: if err.is_empty() {
                    format!("xvf_host exited with {}", output.status)
                } else {
                    err.to_string()
                },
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn read_vector(&self, command: &str) -> Result<Vec<f32>> {
        let raw = self.run(&[command])?;
        let line = extract_command_line(&raw, command);
        let payload = line.strip_prefix(command).unwrap_or(line).trim();
        let values = parse_numbers(payload);
        if values.is_empty() {
            return Err(WakefrontError::HardwareCommand {
                message: format!("no numeric payload for '{}': {}", command, raw),
            });
        }
        Ok(values)
    }
}

impl HardwareEnergyAccessor for XvfHostAccessor {
    fn read_speech_energy(&mut self) -> Result<f32> {
        // Four beam energies: beam1, beam2, free-running, auto-select.
        // Prefer the auto-selected beam, fall back to the loudest.
        let values = self.read_vector("AEC_SPENERGY_VALUES")?;
        if let Some(&auto) = values.get(3) {
            return Ok(auto);
        }
        Ok(values.iter().cloned().fold(f32::MIN, f32::max))
    }

    fn read_direction_of_arrival(&mut self) -> Option<i32> {
        let raw = match self.run(&["AUDIO_MGR_SELECTED_AZIMUTHS"]) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(error = %e, "azimuth read failed");
                return None;
            }
        };
        let line = extract_command_line(&raw, "AUDIO_MGR_SELECTED_AZIMUTHS");
        parse_degrees(line)
    }
}

impl HardwareLedControl for XvfHostAccessor {
    fn set_effect(&mut self, effect: u32) -> Result<()> {
        self.run(&["LED_EFFECT", &effect.to_string()]).map(|_| ())
    }

    fn set_color(&mut self, color_hex: &str) -> Result<()> {
        let packed = pack_color(color_hex)?;
        self.run(&["LED_COLOR", &packed.to_string()]).map(|_| ())
    }

    fn set_brightness(&mut self, brightness: u8) -> Result<()> {
        self.run(&["LED_BRIGHTNESS", &brightness.to_string()])
            .map(|_| ())
    }

    fn set_power(&mut self, enabled: bool) -> Result<()> {
        self.run(&["GPO_WRITE_VALUE", LED_POWER_PIN, if enabled { "1" } else { "0" }])
            .map(|_| ())
    }
}

/// Picks the last output line that echoes the command name, or the last
/// non-empty line. The tool prints banner text ahead of the payload.
fn extract_command_line<'a>(raw: &'a str, command: &str) -> &'a str {
    let lines: Vec<&str> = raw.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    for line in lines.iter().rev() {
        if line.starts_with(command) {
            return line;
        }
    }
    lines.last().copied().unwrap_or(raw.trim())
}

/// Extracts every decimal number from a payload line.
fn parse_numbers(payload: &str) -> Vec<f32> {
    payload
        .split(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+' || c == 'e' || c == 'E'))
        .filter(|tok| !tok.is_empty())
        .filter_map(|tok| tok.parse::<f32>().ok())
        .collect()
}

/// Parses a direction of arrival: a "(<n> deg)" annotation when present,
/// otherwise the first value interpreted as radians.
fn parse_degrees(line: &str) -> Option<i32> {
    if let Some(open) = line.find('(')
        && let Some(close) = line[open..].find(')')
    {
        let inner = &line[open + 1..open + close];
        if let Some(num) = inner.strip_suffix("deg").map(str::trim)
            && let Ok(deg) = num.parse::<f32>()
        {
            return Some(deg.round() as i32);
        }
    }
    let values = parse_numbers(line);
    let radians = *values.first()?;
    Some(radians.to_degrees().round() as i32)
}

/// Packs "#RRGGBB" into the integer the LED command expects.
fn pack_color(color_hex: &str) -> Result<u32> {
    let color = color_hex.trim().trim_start_matches('#');
    if color.len() != 6 {
        return Err(WakefrontError::HardwareCommand {
            message: format!("invalid hex color: {}", color_hex),
        });
    }
    u32::from_str_radix(color, 16).map_err(|_| WakefrontError::HardwareCommand {
        message: format!("invalid hex color: {}", color_hex),
    })
}

/// In-memory accessor for tests: scripted energies, recorded LED calls.
pub struct MockAccessor {
    energies: Arc<Mutex<Vec<Result<f32>>>>,
    pub led_calls: Arc<Mutex<Vec<String>>>,
}

impl MockAccessor {
    pub fn new(energies: Vec<Result<f32>>) -> Self {
        Self {
            energies: Arc::new(Mutex::new(energies)),
            led_calls: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[allow(clippy::unwrap_used)]
impl HardwareEnergyAccessor for MockAccessor {
    fn read_speech_energy(&mut self) -> Result<f32> {
        let mut energies = self.energies.lock().unwrap();
        if energies.is_empty() {
            return Err(WakefrontError::HardwareCommand {
                message: "script exhausted".to_string(),
            });
        }
        energies.remove(0)
    }

    fn read_direction_of_arrival(&mut self) -> Option<i32> {
        None
    }
}

#[allow(clippy::unwrap_used)]
impl HardwareLedControl for MockAccessor {
    fn set_effect(&mut self, effect: u32) -> Result<()> {
        self.led_calls.lock().unwrap().push(format!("effect {}", effect));
        Ok(())
    }

    fn set_color(&mut self, color_hex: &str) -> Result<()> {
        self.led_calls.lock().unwrap().push(format!("color {}", color_hex));
        Ok(())
    }

    fn set_brightness(&mut self, brightness: u8) -> Result<()> {
        self.led_calls
            .lock()
            .unwrap()
            .push(format!("brightness {}", brightness));
        Ok(())
    }

    fn set_power(&mut self, enabled: bool) -> Result<()> {
        self.led_calls.lock().unwrap().push(format!("power {}", enabled));
        Ok(())
    }
}

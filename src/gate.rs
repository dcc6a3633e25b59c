//! Input gate deciding when audio is worth scanning for the wake phrase.
//!
//! Two gating signals exist: an in-band RMS check over the frames
//! themselves, and an out-of-band beam energy polled from the array DSP on
//! its own thread. Hybrid mode starts on RMS and hands over to the
//! hardware signal once the first poll lands.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audio::rms;
use crate::defaults;
use crate::error::{Result, WakefrontError};
use crate::hardware::HardwareEnergyAccessor;

/// Which signal the gate trusts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateMode {
    /// Frame RMS only.
    Rms,
    /// Polled beam energy only.
    Hardware,
    /// RMS until the first hardware reading arrives, hardware after.
    Hybrid,
}

impl GateMode {
    pub fn name(&self) -> &'static str {
        match self {
            GateMode::Rms => "rms",
            GateMode::Hardware => "hardware",
            GateMode::Hybrid => "hybrid",
        }
    }
}

/// Gate thresholds and timing.
#[derive(Debug, Clone)]
pub struct GateConfig {
    pub mode: GateMode,
    /// RMS level that opens the in-band gate. Zero disables the RMS check
    /// entirely, leaving the gate open.
    pub rms_threshold: f32,
    /// Frames the RMS gate stays open after the last loud frame.
    pub rms_hold_frames: u32,
    /// Beam energy at or above which a poll counts toward opening.
    pub energy_high: f32,
    /// Beam energy at or below which a poll counts toward closing.
    pub energy_low: f32,
    /// Consecutive high polls required to open.
    pub open_consecutive: u32,
    /// Consecutive low polls required to close.
    pub close_consecutive: u32,
    pub poll_interval: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            mode: GateMode::Rms,
            rms_threshold: defaults::WAKE_RMS_THRESHOLD,
            rms_hold_frames: defaults::WAKE_RMS_HOLD_FRAMES,
            energy_high: defaults::SPEECH_ENERGY_HIGH,
            energy_low: defaults::SPEECH_ENERGY_LOW,
            open_consecutive: defaults::OPEN_CONSECUTIVE_POLLS,
            close_consecutive: defaults::CLOSE_CONSECUTIVE_POLLS,
            poll_interval: Duration::from_millis(defaults::POLL_INTERVAL_MS),
        }
    }
}

impl GateConfig {
    /// Rejects configurations that would wedge the gate.
    pub fn validate(&self) -> Result<()> {
        if self.rms_threshold < 0.0 {
            return Err(WakefrontError::ConfigInvalidValue {
                key: "gate.rms_threshold".to_string(),
                message: "must be zero or positive".to_string(),
            });
        }
        if self.energy_low >= self.energy_high {
            return Err(WakefrontError::ConfigInvalidValue {
                key: "gate.energy_low".to_string(),
                message: format!(
                    "must be below energy_high ({} >= {})",
                    self.energy_low, self.energy_high
                ),
            });
        }
        if self.open_consecutive == 0 || self.close_consecutive == 0 {
            return Err(WakefrontError::ConfigInvalidValue {
                key: "gate.open_consecutive".to_string(),
                message: "consecutive poll counts must be at least 1".to_string(),
            });
        }
        if self.poll_interval.is_zero() {
            return Err(WakefrontError::ConfigInvalidValue {
                key: "gate.poll_interval_ms".to_string(),
                message: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Snapshot of the gate for logs and the monitor command.
#[derive(Debug, Clone)]
pub struct GateMetrics {
    /// The configured mode, even when hardware was unavailable and the
    /// gate fell back to RMS behavior.
    pub mode: GateMode,
    pub open: bool,
    /// Last polled beam energy, if any poll has landed.
    pub energy: Option<f32>,
    pub direction_of_arrival: Option<i32>,
}

/// State shared between the poller thread and frame-path reads.
/// One lock covers all of it; both sides hold it only for field updates.
#[derive(Debug, Default)]
struct PollerState {
    open: bool,
    open_hits: u32,
    close_hits: u32,
    last_energy: Option<f32>,
    last_doa: Option<i32>,
}

impl PollerState {
    /// Applies one energy reading to the dual-counter hysteresis.
    fn apply_reading(&mut self, energy: f32, cfg: &GateConfig) {
        self.last_energy = Some(energy);
        if energy >= cfg.energy_high {
            self.open_hits += 1;
            self.close_hits = 0;
            if self.open_hits >= cfg.open_consecutive {
                self.open = true;
            }
        } else if energy <= cfg.energy_low {
            self.close_hits += 1;
            self.open_hits = 0;
            if self.close_hits >= cfg.close_consecutive {
                self.open = false;
            }
        } else {
            // Mid-band readings break both streaks without moving the gate.
            self.open_hits = 0;
            self.close_hits = 0;
        }
    }
}

/// The wake gate. Owns the poller thread when a hardware accessor is
/// attached; [`close`](WakeGate::close) stops it and is idempotent.
pub struct WakeGate {
    cfg: GateConfig,
    hardware_attached: bool,
    rms_open_frames_left: u32,
    shared: Arc<Mutex<PollerState>>,
    poller_running: Arc<AtomicBool>,
    poller: Option<JoinHandle<()>>,
    last_open: bool,
}

impl WakeGate {
    /// Builds a gate without hardware. Hardware and hybrid modes degrade
    /// to RMS behavior with a warning; metrics keep the configured mode.
    pub fn new(cfg: GateConfig) -> Result<Self> {
        cfg.validate()?;
        if cfg.mode != GateMode::Rms {
            warn!(
                mode = cfg.mode.name(),
                "no hardware accessor attached; gating on frame RMS"
            );
        }
        Ok(Self {
            cfg,
            hardware_attached: false,
            rms_open_frames_left: 0,
            shared: Arc::new(Mutex::new(PollerState::default())),
            poller_running: Arc::new(AtomicBool::new(false)),
            poller: None,
            last_open: false,
        })
    }

    /// Builds a gate polling the given accessor on a background thread.
    /// In rms mode the accessor is discarded and no poller runs; the energy
    /// signal would never be consulted.
    pub fn with_hardware(
        cfg: GateConfig,
        accessor: Box<dyn HardwareEnergyAccessor>,
    ) -> Result<Self> {
        if cfg.mode == GateMode::Rms {
            debug!("rms mode ignores the hardware accessor; poller not started");
            drop(accessor);
            return Self::new(cfg);
        }
        cfg.validate()?;
        let shared = Arc::new(Mutex::new(PollerState::default()));
        let running = Arc::new(AtomicBool::new(true));

        let poller = spawn_poller(cfg.clone(), accessor, shared.clone(), running.clone())?;

        Ok(Self {
            cfg,
            hardware_attached: true,
            rms_open_frames_left: 0,
            shared,
            poller_running: running,
            poller: Some(poller),
            last_open: false,
        })
    }

    /// Decides whether this frame passes to the wake detector.
    pub fn is_open(&mut self, frame: &[f32]) -> bool {
        let open = match self.cfg.mode {
            GateMode::Rms => self.rms_open(frame),
            GateMode::Hardware if self.hardware_attached => self.hardware_open(),
            GateMode::Hybrid if self.hardware_attached => {
                // Trust RMS only until the first poll has landed; the
                // hardware signal then decides alone, even against a loud
                // frame, since the DSP sees past the room's echo.
                let polled = self
                    .shared
                    .lock()
                    .map(|s| s.last_energy.is_some())
                    .unwrap_or(false);
                if polled {
                    self.hardware_open()
                } else {
                    self.rms_open(frame)
                }
            }
            // Configured for hardware but none attached.
            _ => self.rms_open(frame),
        };
        self.last_open = open;
        open
    }

    fn rms_open(&mut self, frame: &[f32]) -> bool {
        if self.cfg.rms_threshold <= 0.0 {
            return true;
        }
        if rms(frame) >= self.cfg.rms_threshold {
            self.rms_open_frames_left = self.cfg.rms_hold_frames;
            return true;
        }
        if self.rms_open_frames_left > 0 {
            self.rms_open_frames_left -= 1;
            return true;
        }
        false
    }

    fn hardware_open(&self) -> bool {
        self.shared.lock().map(|s| s.open).unwrap_or(false)
    }

    /// Current snapshot for logging and the monitor command.
    pub fn metrics(&self) -> GateMetrics {
        let (energy, doa) = self
            .shared
            .lock()
            .map(|s| (s.last_energy, s.last_doa))
            .unwrap_or((None, None));
        GateMetrics {
            mode: self.cfg.mode,
            open: self.last_open,
            energy,
            direction_of_arrival: doa,
        }
    }

    /// Stops the poller thread. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.poller_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.poller.take() {
            // The poller wakes at least every poll interval; give it a
            // bounded window to notice the flag, then detach.
            let deadline = Instant::now() + self.cfg.poll_interval + Duration::from_secs(1);
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    warn!("gate poller thread panicked");
                }
            } else {
                warn!("gate poller did not stop in time; detaching");
            }
        }
    }
}

impl Drop for WakeGate {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_poller(
    cfg: GateConfig,
    mut accessor: Box<dyn HardwareEnergyAccessor>,
    shared: Arc<Mutex<PollerState>>,
    running: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("gate-poller".to_string())
        .spawn(move || {
            info!(interval_ms = cfg.poll_interval.as_millis() as u64, "gate poller started");
            while running.load(Ordering::SeqCst) {
                match accessor.read_speech_energy() {
                    Ok(energy) => {
                        if let Ok(mut state) = shared.lock() {
                            let was_open = state.open;
                            state.apply_reading(energy, &cfg);
                            if state.open != was_open {
                                debug!(energy, open = state.open, "hardware gate moved");
                            }
                        }
                    }
                    // A failed poll keeps the previous state; transient
                    // tool errors must not flap the gate.
                    Err(e) => debug!(error = %e, "energy poll failed"),
                }
                if let Some(doa) = accessor.read_direction_of_arrival()
                    && let Ok(mut state) = shared.lock()
                {
                    state.last_doa = Some(doa);
                }
                std::thread::sleep(cfg.poll_interval);
            }
            debug!("gate poller stopped");
        })
        .map_err(|e| WakefrontError::Other(format!("failed to spawn gate poller: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::MockAccessor;

    fn rms_cfg() -> GateConfig {
        GateConfig {
            mode: GateMode::Rms,
            rms_threshold: 0.01,
            rms_hold_frames: 8,
            ..GateConfig::default()
        }
    }

    fn loud() -> Vec<f32> {
        vec![0.5; 320]
    }

    fn quiet() -> Vec<f32> {
        vec![0.0; 320]
    }

    #[test]
    fn test_rms_gate_holds_then_closes() {
        let mut gate = WakeGate::new(rms_cfg()).unwrap();
        assert!(!gate.is_open(&quiet()));
        assert!(gate.is_open(&loud()));
        // Stays open for exactly the hold window of quiet frames.
        for _ in 0..8 {
            assert!(gate.is_open(&quiet()));
        }
        assert!(!gate.is_open(&quiet()));
    }

    #[test]
    fn test_rms_loud_frame_refreshes_hold() {
        let mut gate = WakeGate::new(rms_cfg()).unwrap();
        assert!(gate.is_open(&loud()));
        for _ in 0..5 {
            assert!(gate.is_open(&quiet()));
        }
        assert!(gate.is_open(&loud()));
        for _ in 0..8 {
            assert!(gate.is_open(&quiet()));
        }
        assert!(!gate.is_open(&quiet()));
    }

    #[test]
    fn test_zero_threshold_disables_gating() {
        let mut cfg = rms_cfg();
        cfg.rms_threshold = 0.0;
        let mut gate = WakeGate::new(cfg).unwrap();
        assert!(gate.is_open(&quiet()));
    }

    #[test]
    fn test_negative_threshold_rejected() {
        let mut cfg = rms_cfg();
        cfg.rms_threshold = -0.1;
        assert!(WakeGate::new(cfg).is_err());
    }

    #[test]
    fn test_inverted_energy_band_rejected() {
        let mut cfg = GateConfig::default();
        cfg.energy_low = cfg.energy_high;
        assert!(WakeGate::new(cfg).is_err());
    }

    #[test]
    fn test_hysteresis_opens_after_consecutive_highs() {
        let cfg = GateConfig::default();
        let mut state = PollerState::default();
        state.apply_reading(cfg.energy_high + 1.0, &cfg);
        assert!(!state.open);
        state.apply_reading(cfg.energy_high + 1.0, &cfg);
        assert!(state.open);
    }

    #[test]
    fn test_hysteresis_closes_after_consecutive_lows() {
        let cfg = GateConfig::default();
        let mut state = PollerState::default();
        state.open = true;
        for _ in 0..4 {
            state.apply_reading(cfg.energy_low - 1.0, &cfg);
            assert!(state.open);
        }
        state.apply_reading(cfg.energy_low - 1.0, &cfg);
        assert!(!state.open);
    }

    #[test]
    fn test_midband_reading_resets_both_streaks() {
        let cfg = GateConfig::default();
        let mid = (cfg.energy_high + cfg.energy_low) / 2.0;

        let mut state = PollerState::default();
        state.apply_reading(cfg.energy_high + 1.0, &cfg);
        state.apply_reading(mid, &cfg);
        state.apply_reading(cfg.energy_high + 1.0, &cfg);
        assert!(!state.open, "interrupted high streak must not open");

        state.open = true;
        state.open_hits = 0;
        state.close_hits = 0;
        for _ in 0..4 {
            state.apply_reading(cfg.energy_low - 1.0, &cfg);
        }
        state.apply_reading(mid, &cfg);
        for _ in 0..4 {
            state.apply_reading(cfg.energy_low - 1.0, &cfg);
        }
        assert!(state.open, "interrupted low streak must not close");
    }

    #[test]
    fn test_rms_mode_ignores_hardware_accessor() {
        let mut cfg = rms_cfg();
        cfg.poll_interval = Duration::from_millis(5);
        let accessor = MockAccessor::new(vec![
            Ok(cfg.energy_high + 1.0),
            Ok(cfg.energy_high + 1.0),
            Ok(cfg.energy_high + 1.0),
        ]);
        let mut gate = WakeGate::with_hardware(cfg, Box::new(accessor)).unwrap();

        // No poller runs: the energy metric never populates and gating is
        // the frame RMS check alone.
        std::thread::sleep(Duration::from_millis(50));
        assert!(!gate.is_open(&quiet()));
        assert!(gate.is_open(&loud()));
        let metrics = gate.metrics();
        assert_eq!(metrics.mode, GateMode::Rms);
        assert!(metrics.energy.is_none());
        assert!(metrics.direction_of_arrival.is_none());
    }

    #[test]
    fn test_hardware_mode_without_accessor_falls_back_to_rms() {
        let mut cfg = rms_cfg();
        cfg.mode = GateMode::Hardware;
        let mut gate = WakeGate::new(cfg).unwrap();
        assert!(gate.is_open(&loud()));
        assert_eq!(gate.metrics().mode, GateMode::Hardware);
    }

    #[test]
    fn test_hybrid_hands_over_once_polled() {
        let mut cfg = rms_cfg();
        cfg.mode = GateMode::Hybrid;
        let mut gate = WakeGate::new(cfg).unwrap();
        gate.hardware_attached = true;

        // No poll has landed: RMS decides.
        assert!(gate.is_open(&loud()));

        // A low reading lands; the hardware signal now overrides a loud
        // frame.
        gate.shared.lock().unwrap().last_energy = Some(0.0);
        assert!(!gate.is_open(&loud()));

        gate.shared.lock().unwrap().open = true;
        assert!(gate.is_open(&quiet()));
    }

    #[test]
    fn test_poller_drives_gate_open() {
        let mut cfg = GateConfig::default();
        cfg.mode = GateMode::Hardware;
        cfg.poll_interval = Duration::from_millis(5);
        let accessor = MockAccessor::new(vec![
            Ok(cfg.energy_high + 1.0),
            Ok(cfg.energy_high + 1.0),
        ]);
        let mut gate = WakeGate::with_hardware(cfg, Box::new(accessor)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while !gate.is_open(&[0.0f32; 320]) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(gate.is_open(&[0.0f32; 320]));
        let metrics = gate.metrics();
        assert!(metrics.energy.is_some());
        gate.close();
        gate.close();
    }

    #[test]
    fn test_poller_survives_failed_reads() {
        let mut cfg = GateConfig::default();
        cfg.mode = GateMode::Hardware;
        cfg.poll_interval = Duration::from_millis(5);
        let accessor = MockAccessor::new(vec![
            Err(WakefrontError::HardwareCommand {
                message: "transient".to_string(),
            }),
            Ok(cfg.energy_high + 1.0),
            Err(WakefrontError::HardwareCommand {
                message: "transient".to_string(),
            }),
            Ok(cfg.energy_high + 1.0),
        ]);
        let mut gate = WakeGate::with_hardware(cfg, Box::new(accessor)).unwrap();

        // Errors neither flap the gate nor break the high streak; two
        // successful highs still open it.
        let deadline = Instant::now() + Duration::from_secs(2);
        while !gate.is_open(&[0.0f32; 320]) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(gate.is_open(&[0.0f32; 320]));
    }
}

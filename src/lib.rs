//! wakefront - Real-time wake phrase front-end for edge voice satellites
//!
//! Gated audio capture, pre-roll wake scanning, and utterance segmentation
//! for always-on microphone arrays.

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod audio;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod defaults;
pub mod engine;
pub mod error;
pub mod gate;
pub mod hardware;
pub mod led;
pub mod vad;
pub mod wake;

// Core traits (source → gate → detect → segment)
pub use audio::AudioSource;
pub use hardware::{HardwareEnergyAccessor, HardwareLedControl};
pub use led::LedController;
pub use vad::VoiceActivityDetector;
pub use wake::WakewordDetector;

// Engine
pub use engine::events::{
    EndReason, EngineListener, EngineState, StateSignal, Utterance, WakeEvent,
};
pub use engine::{EngineConfig, EngineHandle, UtteranceEngine};

// Gate
pub use gate::{GateConfig, GateMetrics, GateMode, WakeGate};

// Error handling
pub use error::{Result, WakefrontError};

// Config
pub use config::Config;

/// Build version string with optional git commit hash.
///
/// Returns `"0.2.0+abc1234"` when git hash is available, `"0.2.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}

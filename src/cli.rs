//! Command-line interface for wakefront
//!
//! Provides argument parsing using clap derive macros.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Wake phrase front-end for edge voice satellites
#[derive(Parser, Debug)]
#[command(name = "wakefront", version, about = "Wake phrase front-end for edge voice satellites")]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Verbose output (-v: debug, -vv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Audio input device (e.g., hw:2,0)
    #[arg(long, value_name = "DEVICE")]
    pub device: Option<String>,

    /// Gate mode override (rms, hardware, hybrid)
    #[arg(long, value_name = "MODE")]
    pub gate_mode: Option<String>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the wake-and-capture loop (default)
    Run {
        /// Write each captured utterance as a WAV file into this directory
        #[arg(long, value_name = "DIR")]
        wav_dir: Option<PathBuf>,
    },

    /// List available audio input devices
    Devices,

    /// Print gate readings once per poll interval, for threshold tuning
    Gate {
        /// How long to monitor before exiting
        #[arg(long, value_name = "SECONDS", default_value = "30")]
        seconds: u64,
    },
}

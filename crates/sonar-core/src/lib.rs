//! Sonar Core - Chirp sonar engine, matched filtering, and calibration
//!
//! This library drives an active two-microphone sonar: a speaker repeatedly
//! emits a tapered linear chirp, two microphones record the echoes, and a
//! pool of workers turns each captured window into a time-of-flight image
//! ("sonogram") while a background calibrator keeps playback and capture
//! aligned.

pub mod audio;
pub mod config;
pub mod controller;
pub mod dsp;
pub mod filter;
pub mod frame;
pub mod pool;
pub mod recording;
pub mod sonar;
pub mod stats;
pub mod sync;

pub use config::{ConfigError, SonarConfig};
pub use controller::{Rect, SonarController, SonarView};
pub use dsp::pulse::{ChirpGenerator, PulseOperator};
pub use filter::{FilterChain, FilterError, SignalFilter};
pub use frame::Frame;
pub use sonar::{Sonar, SonarError, SonarState};

/// Library version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default sample rate for capture and playback
pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

/// Full scale of a signed 16-bit sample, used to normalize into [-1, 1]
pub const SHORT_MAX: f32 = i16::MAX as f32;

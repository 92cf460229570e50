//! Sonar - two-microphone active acoustic sonar
//!
//! This library re-exports the engine, signal processing, calibration and
//! recording functionality from `sonar-core`. The `sonar` binary drives it
//! from the command line.

pub use sonar_core::audio;
pub use sonar_core::config;
pub use sonar_core::controller;
pub use sonar_core::dsp;
pub use sonar_core::filter;
pub use sonar_core::frame;
pub use sonar_core::pool;
pub use sonar_core::recording;
pub use sonar_core::sonar;
pub use sonar_core::stats;
pub use sonar_core::sync;

pub use sonar_core::{
    ChirpGenerator, ConfigError, FilterChain, FilterError, Frame, PulseOperator, Rect,
    SignalFilter, Sonar, SonarConfig, SonarController, SonarError, SonarState, SonarView,
};
pub use sonar_core::{DEFAULT_SAMPLE_RATE, SHORT_MAX, VERSION};

//! Sonar session configuration
//!
//! Every field has a serde default, so a partial (or empty) JSON file is a
//! valid configuration. Derived quantities such as the window length in
//! frames are computed here so the pipeline and the calibrator agree on them.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Invalid configuration values
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Chirp reaches {highest} Hz, above the Nyquist limit of {nyquist} Hz")]
    AboveNyquist { highest: f32, nyquist: f32 },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("Pulse interval of {interval_ms} ms does not fit a {pulse_ms} ms pulse")]
    IntervalTooShort { interval_ms: u32, pulse_ms: u32 },

    #[error("{field} = {value} is out of range")]
    OutOfRange { field: &'static str, value: f64 },

    #[error("Calibration threshold of {threshold} frames does not fit a {window} frame window")]
    ThresholdOutsideWindow { threshold: usize, window: usize },
}

fn default_sample_rate() -> u32 {
    crate::DEFAULT_SAMPLE_RATE
}

fn default_pulse_interval_ms() -> u32 {
    80
}

fn default_pulse_duration_ms() -> u32 {
    3
}

fn default_pulse_amplitude() -> f32 {
    0.9
}

fn default_speed_of_sound() -> f32 {
    crate::dsp::geometry::SPEED_OF_SOUND
}

fn default_baseline_m() -> f32 {
    0.12
}

fn default_queue_capacity() -> usize {
    4
}

fn default_max_idle_retries() -> Option<u32> {
    Some(250)
}

fn default_stop_grace_ms() -> u64 {
    500
}

fn default_canvas_width() -> i32 {
    320
}

fn default_canvas_height() -> i32 {
    240
}

fn default_adjust_interval_pulses() -> u32 {
    5
}

fn default_positive_hits() -> u32 {
    2
}

fn default_tolerance() -> usize {
    15
}

fn default_threshold() -> usize {
    3
}

fn default_true() -> bool {
    true
}

/// Calibrator tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Pulse intervals between two measurements
    #[serde(default = "default_adjust_interval_pulses")]
    pub adjust_interval_pulses: u32,
    /// Consecutive stable measurements before acting
    #[serde(default = "default_positive_hits")]
    pub positive_hits: u32,
    /// Drift in frames still counted as the same peak
    #[serde(default = "default_tolerance")]
    pub tolerance: usize,
    /// Peak position in frames below which playback counts as aligned
    #[serde(default = "default_threshold")]
    pub threshold: usize,
    /// Derive the microphone distance from the inter-channel offset on convergence
    #[serde(default = "default_true")]
    pub derive_baseline: bool,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            adjust_interval_pulses: default_adjust_interval_pulses(),
            positive_hits: default_positive_hits(),
            tolerance: default_tolerance(),
            threshold: default_threshold(),
            derive_baseline: true,
        }
    }
}

/// Complete sonar configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SonarConfig {
    /// Audio device name (None = host default)
    #[serde(default)]
    pub device: Option<String>,
    /// Sample rate in Hz for capture and playback
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Time from one pulse start to the next
    #[serde(default = "default_pulse_interval_ms")]
    pub pulse_interval_ms: u32,
    /// Chirp length
    #[serde(default = "default_pulse_duration_ms")]
    pub pulse_duration_ms: u32,
    /// Playback level from 0.0 to 1.0
    #[serde(default = "default_pulse_amplitude")]
    pub pulse_amplitude: f32,
    /// Chirp start frequency in Hz
    #[serde(default)]
    pub chirp_start_hz: f32,
    /// Chirp sweep width in Hz (None = sampleRate/2 - sampleRate/16)
    #[serde(default)]
    pub chirp_bandwidth_hz: Option<f32>,
    /// Meters per second
    #[serde(default = "default_speed_of_sound")]
    pub speed_of_sound: f32,
    /// Initial microphone distance in meters
    #[serde(default = "default_baseline_m")]
    pub baseline_m: f32,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    /// Frame workers (0 = one per core)
    #[serde(default)]
    pub workers: usize,
    /// Frames waiting for a worker before the oldest is discarded
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Sleep after a short capture read (None = a tenth of the pulse interval)
    #[serde(default)]
    pub capture_retry_ms: Option<u64>,
    /// Consecutive empty reads before capture gives up (None = never)
    #[serde(default = "default_max_idle_retries")]
    pub max_idle_retries: Option<u32>,
    /// How long stop waits for each audio loop
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    /// Initial output width in pixels or bins
    #[serde(default = "default_canvas_width")]
    pub canvas_width: i32,
    /// Initial output height in pixels
    #[serde(default = "default_canvas_height")]
    pub canvas_height: i32,
}

impl Default for SonarConfig {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: default_sample_rate(),
            pulse_interval_ms: default_pulse_interval_ms(),
            pulse_duration_ms: default_pulse_duration_ms(),
            pulse_amplitude: default_pulse_amplitude(),
            chirp_start_hz: 0.0,
            chirp_bandwidth_hz: None,
            speed_of_sound: default_speed_of_sound(),
            baseline_m: default_baseline_m(),
            calibration: CalibrationConfig::default(),
            workers: 0,
            queue_capacity: default_queue_capacity(),
            capture_retry_ms: None,
            max_idle_retries: default_max_idle_retries(),
            stop_grace_ms: default_stop_grace_ms(),
            canvas_width: default_canvas_width(),
            canvas_height: default_canvas_height(),
        }
    }
}

impl SonarConfig {
    /// Per-channel frames in one pulse interval
    pub fn window_frames(&self) -> usize {
        (self.sample_rate as u64 * self.pulse_interval_ms as u64 / 1000) as usize
    }

    /// Per-channel capacity of the device rings
    ///
    /// Two pulse intervals: enough slack for a late capture read, while a
    /// calibration delay is heard well within one adjust interval.
    pub fn ring_frames(&self) -> usize {
        self.window_frames() * 2
    }

    /// Per-channel length of the chirp
    pub fn operator_len(&self) -> usize {
        (self.sample_rate as u64 * self.pulse_duration_ms as u64 / 1000) as usize
    }

    /// Chirp sweep width in Hz
    pub fn bandwidth(&self) -> f32 {
        let rate = self.sample_rate as f32;
        self.chirp_bandwidth_hz
            .unwrap_or(rate / 2.0 - rate / 16.0)
    }

    pub fn pulse_interval(&self) -> Duration {
        Duration::from_millis(self.pulse_interval_ms as u64)
    }

    /// Time between calibration measurements
    pub fn adjust_interval(&self) -> Duration {
        self.pulse_interval() * self.calibration.adjust_interval_pulses
    }

    /// Sleep after a short capture read
    pub fn capture_retry_wait(&self) -> Duration {
        self.capture_retry_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.pulse_interval() / 10)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Check the numeric constraints the chirp and the loops rely on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 {
            return Err(ConfigError::Zero("sample_rate"));
        }
        if self.pulse_duration_ms == 0 || self.operator_len() == 0 {
            return Err(ConfigError::Zero("pulse_duration_ms"));
        }
        if self.pulse_interval_ms == 0 {
            return Err(ConfigError::Zero("pulse_interval_ms"));
        }
        if self.pulse_interval_ms <= self.pulse_duration_ms {
            return Err(ConfigError::IntervalTooShort {
                interval_ms: self.pulse_interval_ms,
                pulse_ms: self.pulse_duration_ms,
            });
        }

        let bandwidth = self.bandwidth();
        if !(bandwidth > 0.0) {
            return Err(ConfigError::Zero("chirp_bandwidth_hz"));
        }
        if !(self.chirp_start_hz >= 0.0) {
            return Err(ConfigError::OutOfRange {
                field: "chirp_start_hz",
                value: self.chirp_start_hz as f64,
            });
        }
        let nyquist = self.sample_rate as f32 / 2.0;
        let highest = self.chirp_start_hz + bandwidth;
        if highest > nyquist {
            return Err(ConfigError::AboveNyquist { highest, nyquist });
        }

        if !(self.pulse_amplitude > 0.0 && self.pulse_amplitude <= 1.0) {
            return Err(ConfigError::OutOfRange {
                field: "pulse_amplitude",
                value: self.pulse_amplitude as f64,
            });
        }
        if !(self.speed_of_sound > 0.0) {
            return Err(ConfigError::Zero("speed_of_sound"));
        }
        if !(self.baseline_m >= 0.0) {
            return Err(ConfigError::OutOfRange {
                field: "baseline_m",
                value: self.baseline_m as f64,
            });
        }
        if self.calibration.adjust_interval_pulses == 0 {
            return Err(ConfigError::Zero("calibration.adjust_interval_pulses"));
        }
        if self.calibration.positive_hits == 0 {
            return Err(ConfigError::Zero("calibration.positive_hits"));
        }
        // Peaks must move by strictly less than the tolerance to count
        if self.calibration.tolerance == 0 {
            return Err(ConfigError::Zero("calibration.tolerance"));
        }
        if self.calibration.threshold >= self.window_frames() {
            return Err(ConfigError::ThresholdOutsideWindow {
                threshold: self.calibration.threshold,
                window: self.window_frames(),
            });
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Zero("queue_capacity"));
        }
        Ok(())
    }

    /// Load config from disk, falling back to defaults on any error
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    tracing::info!(path = %path.display(), "Loaded config from disk");
                    config
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to parse config, using defaults");
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!(path = %path.display(), "No config file found, using defaults");
                Self::default()
            }
        }
    }

    /// Save config to disk, creating parent directories if needed
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!(path = %path.display(), "Config saved to disk");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SonarConfig::default();
        assert_eq!(config.sample_rate, 48000);
        assert_eq!(config.window_frames(), 3840);
        assert_eq!(config.operator_len(), 144);
        assert_eq!(config.bandwidth(), 21000.0);
        assert_eq!(config.adjust_interval(), Duration::from_millis(400));
        assert_eq!(config.capture_retry_wait(), Duration::from_millis(8));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ring_latency_below_half_adjust_interval() {
        let config = SonarConfig::default();
        assert_eq!(config.ring_frames(), 7680);
        let buffered =
            Duration::from_millis((config.ring_frames() * 1000 / config.sample_rate as usize) as u64);
        assert_eq!(buffered, Duration::from_millis(160));
        assert!(buffered <= config.adjust_interval() / 2);
    }

    #[test]
    fn test_empty_json_uses_defaults() {
        let config: SonarConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, SonarConfig::default());
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let json = r#"{"sample_rate": 44100, "calibration": {"tolerance": 4}}"#;
        let config: SonarConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.sample_rate, 44100);
        assert_eq!(config.calibration.tolerance, 4);
        assert_eq!(config.calibration.positive_hits, 2);
        assert!(config.calibration.derive_baseline);
        assert_eq!(config.pulse_interval_ms, 80);
    }

    #[test]
    fn test_rejects_above_nyquist() {
        let config = SonarConfig {
            chirp_start_hz: 10000.0,
            chirp_bandwidth_hz: Some(15000.0),
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::AboveNyquist {
                highest: 25000.0,
                nyquist: 24000.0
            })
        );
    }

    #[test]
    fn test_rejects_zero_and_short_intervals() {
        let zero = SonarConfig {
            pulse_duration_ms: 0,
            ..Default::default()
        };
        assert_eq!(zero.validate(), Err(ConfigError::Zero("pulse_duration_ms")));

        let short = SonarConfig {
            pulse_interval_ms: 3,
            ..Default::default()
        };
        assert!(matches!(
            short.validate(),
            Err(ConfigError::IntervalTooShort { .. })
        ));

        let loud = SonarConfig {
            pulse_amplitude: 1.5,
            ..Default::default()
        };
        assert!(matches!(loud.validate(), Err(ConfigError::OutOfRange { .. })));
    }

    #[test]
    fn test_rejects_unreachable_calibration() {
        let mut config = SonarConfig::default();
        config.calibration.tolerance = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero("calibration.tolerance"))
        );

        let mut config = SonarConfig::default();
        config.calibration.threshold = config.window_frames();
        assert_eq!(
            config.validate(),
            Err(ConfigError::ThresholdOutsideWindow {
                threshold: 3840,
                window: 3840
            })
        );

        config.calibration.threshold = 3839;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sonar.json");

        let config = SonarConfig {
            device: Some("USB Audio".to_string()),
            pulse_interval_ms: 100,
            baseline_m: 0.2,
            ..Default::default()
        };
        config.save(&path).unwrap();

        let loaded = SonarConfig::load(&path);
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_falls_back_on_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sonar.json");
        std::fs::write(&path, "not json").unwrap();
        assert_eq!(SonarConfig::load(&path), SonarConfig::default());
        assert_eq!(
            SonarConfig::load(&dir.path().join("missing.json")),
            SonarConfig::default()
        );
    }
}

//! Tapered linear chirp generation
//!
//! The same waveform is emitted by the speaker and used as the operator of
//! the matched filter. A linear frequency sweep compresses well under
//! correlation, and the `sin^0.25` envelope pulls both ends toward zero to
//! limit spectral leakage.

use std::f64::consts::PI;
use std::ops::Deref;
use std::sync::Arc;

/// Immutable chirp samples shared read-only between all threads
#[derive(Debug, Clone, PartialEq)]
pub struct PulseOperator {
    samples: Arc<[f32]>,
}

impl PulseOperator {
    /// Wrap already generated samples (e.g. read back from a recording)
    pub fn from_samples(samples: Vec<f32>) -> Self {
        Self {
            samples: samples.into(),
        }
    }

    /// Get the operator samples
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Energy of the operator (autocorrelation at zero lag)
    pub fn energy(&self) -> f32 {
        self.samples.iter().map(|x| x * x).sum()
    }

    /// Scale into signed 16-bit samples for playback
    ///
    /// # Arguments
    /// * `amplitude` - Output level from 0.0 to 1.0
    pub fn to_i16(&self, amplitude: f32) -> Vec<i16> {
        let amplitude = amplitude.clamp(0.0, 1.0);
        self.samples
            .iter()
            .map(|&x| (x * amplitude * crate::SHORT_MAX) as i16)
            .collect()
    }
}

impl Deref for PulseOperator {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        &self.samples
    }
}

/// Linear chirp generator
///
/// Sweeps from `start_freq` to `start_freq + bandwidth` over `duration_ms`:
///
/// ```text
/// t        = duration / 1000
/// phase(i) = 2π·bandwidth/(2t)/rate² · i²  +  2π·start/rate · i
/// taper(i) = sin(2π·(1/(2t))/rate · i) ^ 0.25
/// pulse(i) = sin(phase(i)) · taper(i)
/// ```
///
/// # Example
/// ```
/// use sonar_core::dsp::pulse::ChirpGenerator;
///
/// let gen = ChirpGenerator::new(48000, 3, 0.0, 21000.0);
/// let operator = gen.generate();
/// assert_eq!(operator.len(), 144);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct ChirpGenerator {
    sample_rate: u32,
    duration_ms: u32,
    start_freq: f32,
    bandwidth: f32,
}

impl ChirpGenerator {
    /// Create a generator. Frequencies are validated by the caller against
    /// the Nyquist limit (see [`crate::config::SonarConfig::validate`]).
    pub fn new(sample_rate: u32, duration_ms: u32, start_freq: f32, bandwidth: f32) -> Self {
        Self {
            sample_rate,
            duration_ms,
            start_freq,
            bandwidth,
        }
    }

    /// Number of samples the pulse spans
    pub fn length(&self) -> usize {
        (self.sample_rate as u64 * self.duration_ms as u64 / 1000) as usize
    }

    /// Synthesize the pulse
    pub fn generate(&self) -> PulseOperator {
        let rate = self.sample_rate as f64;
        let t = self.duration_ms as f64 / 1000.0;
        let sweep = 2.0 * PI * self.bandwidth as f64 / (2.0 * t) / (rate * rate);
        let carrier = 2.0 * PI * self.start_freq as f64 / rate;
        let taper = 2.0 * PI * (1.0 / (2.0 * t)) / rate;

        let samples = (0..self.length())
            .map(|i| {
                let i = i as f64;
                let envelope = (taper * i).sin().max(0.0).powf(0.25);
                ((sweep * i * i + carrier * i).sin() * envelope) as f32
            })
            .collect();

        PulseOperator::from_samples(samples)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn duration_ms(&self) -> u32 {
        self.duration_ms
    }
}

//! E2E tests for chirp synthesis
//!
//! The chirp is both the emitted pulse and the matched-filter operator, so
//! its length and taper are checked over a spread of session parameters.

use approx::assert_relative_eq;
use sonar::{ChirpGenerator, PulseOperator, SonarConfig};

/// Parameter sets covering low and high rates, short and long pulses
const CASES: [(u32, u32, f32, f32); 6] = [
    (48000, 3, 0.0, 21000.0),
    (44100, 15, 2756.0, 8268.0),
    (96000, 2, 10000.0, 30000.0),
    (8000, 10, 500.0, 3000.0),
    (22050, 5, 0.0, 11025.0),
    (192000, 1, 20000.0, 60000.0),
];

#[test]
fn test_length_matches_rate_and_duration() {
    for (rate, ms, start, bandwidth) in CASES {
        let operator = ChirpGenerator::new(rate, ms, start, bandwidth).generate();
        assert_eq!(
            operator.len(),
            (rate as u64 * ms as u64 / 1000) as usize,
            "rate {} duration {}",
            rate,
            ms
        );
    }
}

#[test]
fn test_taper_pulls_both_ends_to_zero() {
    for (rate, ms, start, bandwidth) in CASES {
        let operator = ChirpGenerator::new(rate, ms, start, bandwidth).generate();
        let n = operator.len() as f32;
        let peak = operator.iter().fold(0.0f32, |m, x| m.max(x.abs()));

        assert_eq!(operator[0], 0.0, "first sample for rate {}", rate);
        // The taper at the last index is sin(π/n)^0.25, well below the crest
        let bound = (std::f32::consts::PI / n).sin().powf(0.25);
        assert!(
            operator[operator.len() - 1].abs() <= bound + 1e-6,
            "last sample for rate {}",
            rate
        );
        assert!(bound < 1.0);
        assert!(peak > 0.5, "peak {} for rate {}", peak, rate);
    }
}

#[test]
fn test_samples_bounded() {
    for (rate, ms, start, bandwidth) in CASES {
        for &x in ChirpGenerator::new(rate, ms, start, bandwidth).generate().iter() {
            assert!(x.is_finite());
            assert!((-1.0..=1.0).contains(&x));
        }
    }
}

#[test]
fn test_generation_is_deterministic() {
    let a = ChirpGenerator::new(48000, 3, 0.0, 21000.0).generate();
    let b = ChirpGenerator::new(48000, 3, 0.0, 21000.0).generate();
    assert_eq!(a, b);
}

#[test]
fn test_default_config_pulse() {
    let config = SonarConfig::default();
    let operator = ChirpGenerator::new(
        config.sample_rate,
        config.pulse_duration_ms,
        config.chirp_start_hz,
        config.bandwidth(),
    )
    .generate();

    assert_eq!(operator.len(), config.operator_len());
    assert_relative_eq!(config.bandwidth(), 48000.0 / 2.0 - 48000.0 / 16.0);

    let pcm = operator.to_i16(config.pulse_amplitude);
    assert_eq!(pcm.len(), operator.len());
    let loudest = pcm.iter().map(|s| s.unsigned_abs()).max().unwrap_or(0);
    assert!(loudest <= (0.9 * sonar::SHORT_MAX) as u16 + 1);
    assert!(loudest > (0.5 * sonar::SHORT_MAX) as u16);
}

#[test]
fn test_operator_from_samples_round_trip() {
    let operator = PulseOperator::from_samples(vec![0.0, 0.5, -0.25]);
    assert_eq!(operator.samples(), &[0.0, 0.5, -0.25]);
    assert_relative_eq!(operator.energy(), 0.3125);
}

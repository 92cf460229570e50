//! Matched filter over interleaved stereo samples
//!
//! Each output index `i` holds the correlation magnitude of the operator
//! against the samples starting at `i` and stepping by two, so even indices
//! carry channel A and odd indices channel B:
//!
//! ```text
//! matched[i] = | Σ_j samples[i + 2j] / SHORT_MAX · operator[j] |
//! ```

use crate::filter::{FilterError, SignalFilter};
use crate::frame::Frame;
use crate::SHORT_MAX;
use rayon::prelude::*;

/// Indices handed to one rayon task at a time
const CHUNK: usize = 512;

/// Correlation of `operator` against `samples[start], samples[start + stride], ...`
///
/// The caller guarantees `start + stride * (operator.len() - 1) < samples.len()`.
#[inline]
pub fn correlate_at(samples: &[i16], operator: &[f32], start: usize, stride: usize) -> f32 {
    let acc: f32 = samples[start..]
        .iter()
        .step_by(stride)
        .zip(operator)
        .map(|(&s, &o)| (s as f32 / SHORT_MAX) * o)
        .sum();
    acc.abs()
}

/// Fill `matched` with per-channel correlation magnitudes
///
/// Indices whose operator span would run past the end of `samples` are
/// zeroed.
pub fn correlate_into(samples: &[i16], operator: &[f32], matched: &mut [f32]) {
    let valid = samples.len().saturating_sub(operator.len() * 2);

    matched
        .par_chunks_mut(CHUNK)
        .enumerate()
        .for_each(|(chunk, out)| {
            let base = chunk * CHUNK;
            for (k, value) in out.iter_mut().enumerate() {
                let i = base + k;
                *value = if i < valid {
                    correlate_at(samples, operator, i, 2)
                } else {
                    0.0
                };
            }
        });
}

/// Filter stage populating [`Frame::matched`]
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchedFilter;

impl SignalFilter for MatchedFilter {
    fn accept(&self, frame: &mut Frame) -> Result<(), FilterError> {
        let Frame {
            samples,
            operator,
            matched,
            ..
        } = frame;

        if operator.len() * 2 > samples.len() {
            return Err(FilterError::OperatorTooLong {
                operator: operator.len(),
                frames: samples.len() / 2,
            });
        }

        if matched.len() != samples.len() {
            matched.resize(samples.len(), 0.0);
        }

        correlate_into(samples, operator, matched);
        Ok(())
    }
}

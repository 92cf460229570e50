//! FFT cross-correlation against the pulse operator
//!
//! Used by the calibrator to locate the pulse in a whole captured window in
//! `O(n log n)` instead of running the direct matched filter over it.

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;

/// Finds the lag at which a channel best matches the operator
///
/// Plans are kept, not the planner, so the correlator can move between
/// threads.
pub struct CrossCorrelator {
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    operator: Vec<f32>,
    /// Conjugated operator spectrum for the current `fft_size`
    operator_fft: Vec<Complex<f32>>,
    fft_size: usize,
    buffer: Vec<Complex<f32>>,
}

impl CrossCorrelator {
    /// Create a correlator for `operator`
    ///
    /// # Arguments
    /// * `operator` - Reference pulse
    /// * `frames` - Expected channel length, used to pre-plan the FFT
    pub fn new(operator: &[f32], frames: usize) -> Self {
        let mut planner = FftPlanner::new();
        let mut correlator = Self {
            forward: planner.plan_fft_forward(1),
            inverse: planner.plan_fft_inverse(1),
            operator: operator.to_vec(),
            operator_fft: Vec::new(),
            fft_size: 0,
            buffer: Vec::new(),
        };
        correlator.prepare(frames);
        correlator
    }

    /// Re-plan for channels of `frames` samples if the size changed
    fn prepare(&mut self, frames: usize) {
        let fft_size = (frames + self.operator.len()).next_power_of_two();
        if fft_size == self.fft_size {
            return;
        }

        let mut spectrum: Vec<Complex<f32>> = self
            .operator
            .iter()
            .map(|&x| Complex::new(x, 0.0))
            .chain(std::iter::repeat(Complex::new(0.0, 0.0)))
            .take(fft_size)
            .collect();
        let mut planner = FftPlanner::new();
        self.forward = planner.plan_fft_forward(fft_size);
        self.inverse = planner.plan_fft_inverse(fft_size);
        self.forward.process(&mut spectrum);
        spectrum.iter_mut().for_each(|c| *c = c.conj());

        self.operator_fft = spectrum;
        self.fft_size = fft_size;
        self.buffer = vec![Complex::new(0.0, 0.0); fft_size];
    }

    /// Lag (in samples) and magnitude of the strongest match
    ///
    /// Only lags where the whole operator fits inside `channel` are searched.
    /// Returns `(0, 0.0)` when the channel is shorter than the operator.
    pub fn peak_lag(&mut self, channel: &[f32]) -> (usize, f32) {
        if self.operator.is_empty() || channel.len() < self.operator.len() {
            return (0, 0.0);
        }
        self.prepare(channel.len());

        for (slot, value) in self.buffer.iter_mut().zip(
            channel
                .iter()
                .copied()
                .chain(std::iter::repeat(0.0)),
        ) {
            *slot = Complex::new(value, 0.0);
        }

        self.forward.process(&mut self.buffer);

        for (c, op) in self.buffer.iter_mut().zip(&self.operator_fft) {
            *c *= *op;
        }

        self.inverse.process(&mut self.buffer);

        let search_limit = channel.len() - self.operator.len() + 1;
        let norm = 1.0 / self.fft_size as f32;

        let mut max_val = 0.0f32;
        let mut max_idx = 0;
        for (i, c) in self.buffer.iter().take(search_limit).enumerate() {
            let val = (c.re * norm).abs();
            if val > max_val {
                max_val = val;
                max_idx = i;
            }
        }

        (max_idx, max_val)
    }

    pub fn operator_len(&self) -> usize {
        self.operator.len()
    }
}

impl std::fmt::Debug for CrossCorrelator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossCorrelator")
            .field("operator_len", &self.operator.len())
            .field("fft_size", &self.fft_size)
            .finish()
    }
}

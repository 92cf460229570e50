//! In-place post-processing of reducer output
//!
//! Each filter rewrites [`Frame::output`] and then refreshes
//! [`Frame::max_value`] so display scaling follows the processed values.

use crate::filter::{FilterError, SignalFilter};
use crate::frame::Frame;
use std::sync::Mutex;

fn refresh_max(frame: &mut Frame) {
    frame.max_value = frame.output.iter().copied().fold(0.0, f32::max);
}

/// 4-tap moving average over every second value
///
/// Taps are `i, i+2, i+4, i+6`, so interleaved channels are never mixed.
#[derive(Debug, Clone, Copy)]
pub struct SmoothenFilter {
    offset: usize,
    step: usize,
}

impl SmoothenFilter {
    pub fn new(offset: usize, step: usize) -> Self {
        Self {
            offset,
            step: step.max(1),
        }
    }
}

impl Default for SmoothenFilter {
    fn default() -> Self {
        Self::new(0, 1)
    }
}

impl SignalFilter for SmoothenFilter {
    fn accept(&self, frame: &mut Frame) -> Result<(), FilterError> {
        let output = &mut frame.output;
        let last = output.len().saturating_sub(6);
        let mut i = self.offset;
        while i < last {
            output[i] = (output[i] + output[i + 2] + output[i + 4] + output[i + 6]) / 4.0;
            i += self.step;
        }
        refresh_max(frame);
        Ok(())
    }
}

/// Double-log dynamic range compression: `ln(ln(x + 1) + 1)`
#[derive(Debug, Clone, Copy)]
pub struct AmplificationFilter {
    offset: usize,
    step: usize,
}

impl AmplificationFilter {
    pub fn new(offset: usize, step: usize) -> Self {
        Self {
            offset,
            step: step.max(1),
        }
    }
}

impl Default for AmplificationFilter {
    fn default() -> Self {
        Self::new(0, 1)
    }
}

impl SignalFilter for AmplificationFilter {
    fn accept(&self, frame: &mut Frame) -> Result<(), FilterError> {
        for value in frame.output.iter_mut().skip(self.offset).step_by(self.step) {
            *value = ((*value + 1.0).ln() + 1.0).ln();
        }
        refresh_max(frame);
        Ok(())
    }
}

/// Copy each selected value onto its right neighbour
///
/// With the default `(0, 2)` this duplicates channel A over channel B.
#[derive(Debug, Clone, Copy)]
pub struct MonoFilter {
    offset: usize,
    step: usize,
}

impl MonoFilter {
    pub fn new(offset: usize, step: usize) -> Self {
        Self {
            offset,
            step: step.max(1),
        }
    }
}

impl Default for MonoFilter {
    fn default() -> Self {
        Self::new(0, 2)
    }
}

impl SignalFilter for MonoFilter {
    fn accept(&self, frame: &mut Frame) -> Result<(), FilterError> {
        let output = &mut frame.output;
        let mut i = self.offset;
        while i + 1 < output.len() {
            output[i + 1] = output[i];
            i += self.step;
        }
        refresh_max(frame);
        Ok(())
    }
}

/// Emphasize rising edges along every second value
///
/// Each value is scaled by `(rise + 1)^10 - 1`, where `rise` is how far it
/// climbs above the value two places before it. Flat or falling stretches,
/// such as the tail of an echo, go to zero. Walks backwards so every
/// comparison sees the unfiltered predecessor.
#[derive(Debug, Clone, Copy)]
pub struct LeadingEdgeFilter {
    offset: usize,
    step: usize,
}

impl LeadingEdgeFilter {
    pub fn new(offset: usize, step: usize) -> Self {
        Self {
            offset,
            step: step.max(1),
        }
    }
}

impl Default for LeadingEdgeFilter {
    fn default() -> Self {
        Self::new(0, 1)
    }
}

impl SignalFilter for LeadingEdgeFilter {
    fn accept(&self, frame: &mut Frame) -> Result<(), FilterError> {
        let output = &mut frame.output;
        if output.len() >= 3 {
            let start = (output.len() - 2 + self.offset).min(output.len() - 1);
            for i in (2..=start).rev().step_by(self.step) {
                let rise = (output[i] - output[i - 2]).max(0.0);
                output[i] *= (rise + 1.0).powi(10) - 1.0;
            }
        }
        refresh_max(frame);
        Ok(())
    }
}

/// Peak detection against a running mean and deviation, per channel
///
/// A value survives only if it exceeds `mean + 1.75 * deviation` of what
/// came before it on the same channel. Everything else is zeroed.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanPeakDetector;

impl MeanPeakDetector {
    const DEVIATIONS: f32 = 1.75;

    fn apply(output: &mut [f32], channel: usize) {
        let mut mean = output[output.len() - 2];
        let mut deviation = 0.0f32;
        for value in output.iter_mut().skip(channel).step_by(2) {
            let sample = *value;
            if sample <= mean + Self::DEVIATIONS * deviation {
                *value = 0.0;
            }
            deviation = (deviation + (sample - mean).abs()) / 2.0;
            mean = (sample + (sample - mean) / 10.0) / 2.0;
        }
    }
}

impl SignalFilter for MeanPeakDetector {
    fn accept(&self, frame: &mut Frame) -> Result<(), FilterError> {
        if frame.output.len() >= 2 {
            Self::apply(&mut frame.output, 0);
            Self::apply(&mut frame.output, 1);
        }
        refresh_max(frame);
        Ok(())
    }
}

/// Unsharp-mask style sharpening against the next two same-channel values
///
/// `x[i] = (x[i] - k/2 * (x[i+2] + x[i+4])) / (1 - k)` with `k = 0.3`, so a
/// flat run keeps its level and the approach to a step undershoots.
#[derive(Debug, Clone, Copy)]
pub struct SharpenFilter {
    offset: usize,
    step: usize,
}

impl SharpenFilter {
    const STRENGTH: f32 = 0.3;

    pub fn new(offset: usize, step: usize) -> Self {
        Self {
            offset,
            step: step.max(1),
        }
    }
}

impl Default for SharpenFilter {
    fn default() -> Self {
        Self::new(0, 1)
    }
}

impl SignalFilter for SharpenFilter {
    fn accept(&self, frame: &mut Frame) -> Result<(), FilterError> {
        let output = &mut frame.output;
        let last = output.len().saturating_sub(4);
        let k = Self::STRENGTH;
        for i in (self.offset..last).step_by(self.step) {
            output[i] = (output[i] - k / 2.0 * (output[i + 2] + output[i + 4])) / (1.0 - k);
        }
        refresh_max(frame);
        Ok(())
    }
}

/// Number of frames averaged by [`AverageFilter`]
pub const AVERAGE_GENERATIONS: usize = 4;

#[derive(Debug, Default)]
struct History {
    len: usize,
    values: Vec<f32>,
    generation: usize,
}

/// Temporal average of the last [`AVERAGE_GENERATIONS`] outputs
///
/// Frames are processed concurrently by the workers, so the history sits
/// behind a mutex and "last" means last to reach this filter. A change of
/// output size clears the history.
#[derive(Debug, Default)]
pub struct AverageFilter {
    history: Mutex<History>,
}

impl AverageFilter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SignalFilter for AverageFilter {
    fn accept(&self, frame: &mut Frame) -> Result<(), FilterError> {
        let mut history = self
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let len = frame.output.len();
        if history.len != len {
            history.len = len;
            history.values = vec![0.0; len * AVERAGE_GENERATIONS];
            history.generation = 0;
        }

        let generation = history.generation;
        for (value, slots) in frame
            .output
            .iter_mut()
            .zip(history.values.chunks_exact_mut(AVERAGE_GENERATIONS))
        {
            slots[generation] = *value;
            *value = slots.iter().sum::<f32>() / AVERAGE_GENERATIONS as f32;
        }
        history.generation = (generation + 1) % AVERAGE_GENERATIONS;
        drop(history);

        refresh_max(frame);
        Ok(())
    }
}

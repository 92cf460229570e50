//! Single-channel range histogram
//!
//! The window's horizontal extent, in interleaved sample units, is mapped to
//! a distance range and split into `canvas.width` bins. Each bin holds the
//! strongest direct correlation of one channel against the operator over
//! the frames the bin spans.
//!
//! With reduction enabled each bin is multiplied by its value from the
//! previous frame to reach this filter, which suppresses echoes that do not
//! persist.

use super::geometry::EchoGeometry;
use super::matched::correlate_at;
use crate::filter::{FilterError, SignalFilter};
use crate::frame::Frame;
use rayon::prelude::*;
use std::sync::Mutex;

/// Filter stage producing a `canvas.width` long range profile
#[derive(Debug)]
pub struct HistogramFilter {
    /// Channel to correlate (0 = A, 1 = B)
    offset: usize,
    /// Multiply each bin by its value from the previous frame
    reduce: bool,
    speed: f32,
    /// Output of the previous frame, shared by all workers
    previous: Mutex<Vec<f32>>,
}

impl HistogramFilter {
    pub fn new(offset: usize, speed: f32) -> Self {
        Self {
            offset: offset.min(1),
            reduce: false,
            speed,
            previous: Mutex::new(Vec::new()),
        }
    }

    /// Enable multiplicative reduction with the previous frame, builder style
    pub fn reduce(mut self, reduce: bool) -> Self {
        self.reduce = reduce;
        self
    }
}

impl Default for HistogramFilter {
    fn default() -> Self {
        Self::new(0, super::geometry::SPEED_OF_SOUND)
    }
}

impl SignalFilter for HistogramFilter {
    fn accept(&self, frame: &mut Frame) -> Result<(), FilterError> {
        let canvas = frame.canvas;
        if canvas.width() <= 0 {
            return Err(FilterError::EmptyCanvas {
                width: canvas.width(),
                height: canvas.height(),
            });
        }
        let bins = canvas.width() as usize;
        frame.ensure_output(bins);

        let echo = EchoGeometry::new(frame.sample_rate, self.speed);
        let left =
            echo.distance((frame.window.left - frame.resolution.left) as f32 / 2.0);
        let right =
            echo.distance((frame.window.right - frame.resolution.left) as f32 / 2.0);
        let step = (right - left) / bins as f32;

        let samples = &frame.samples;
        let operator: &[f32] = &frame.operator;
        let span = operator.len().saturating_sub(1) * 2;
        let offset = self.offset;

        frame
            .output
            .par_iter_mut()
            .enumerate()
            .for_each(|(bin, out)| {
                let start = echo.sample_index(left + bin as f32 * step);
                let end = echo.sample_index(left + (bin + 1) as f32 * step);
                let steps = (end - start).floor().max(1.0) as usize;
                let first = start.max(0.0) as usize;

                let mut value = 0.0f32;
                for frame_index in first..first + steps {
                    let vi = frame_index * 2 + offset;
                    if vi + span >= samples.len() {
                        break;
                    }
                    value = value.max(correlate_at(samples, operator, vi, 2));
                }

                *out = value;
            });

        if self.reduce {
            let mut previous = self
                .previous
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            // A resized canvas starts a fresh history
            if previous.len() == bins {
                for (out, before) in frame.output.iter_mut().zip(previous.iter()) {
                    *out *= before;
                }
            }
            previous.clear();
            previous.extend_from_slice(&frame.output);
        }

        frame.max_value = frame.output.par_iter().copied().reduce(|| 0.0, f32::max);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::Rect;
    use crate::dsp::pulse::{ChirpGenerator, PulseOperator};
    use crate::SHORT_MAX;

    const WINDOW: i32 = 3840;

    fn frame(operator: PulseOperator) -> Frame {
        let samples = (WINDOW as usize + operator.len()) * 2;
        let mut frame = Frame::new(48000.0, operator, samples);
        let resolution = Rect::sized(WINDOW * 2, WINDOW);
        frame.window = resolution;
        frame.resolution = resolution;
        frame.canvas = Rect::sized(64, 1);
        frame
    }

    fn embed(frame: &mut Frame, at: usize, channel: usize) {
        let operator = frame.operator.clone();
        for (j, &x) in operator.iter().enumerate() {
            frame.samples[(at + j) * 2 + channel] = (x * 0.5 * SHORT_MAX) as i16;
        }
    }

    #[test]
    fn test_echo_lands_in_its_bin() {
        let operator = ChirpGenerator::new(48000, 3, 0.0, 21000.0).generate();
        let mut frame = frame(operator);
        embed(&mut frame, 1830, 0);

        HistogramFilter::default().accept(&mut frame).unwrap();

        assert_eq!(frame.output.len(), 64);
        let (peak, value) = frame
            .output
            .iter()
            .enumerate()
            .fold((0, 0.0f32), |best, (i, &v)| if v > best.1 { (i, v) } else { best });
        // 3840 frames over 64 bins
        assert_eq!(peak, 1830 / 60);
        assert_eq!(value, frame.max_value);
    }

    #[test]
    fn test_other_channel_is_ignored() {
        let operator = ChirpGenerator::new(48000, 3, 0.0, 21000.0).generate();
        let mut frame = frame(operator);
        embed(&mut frame, 1800, 1);

        HistogramFilter::default().accept(&mut frame).unwrap();
        assert_eq!(frame.max_value, 0.0);

        HistogramFilter::new(1, 340.29).accept(&mut frame).unwrap();
        assert!(frame.max_value > 0.0);
    }

    #[test]
    fn test_reduce_multiplies_previous() {
        let operator = ChirpGenerator::new(48000, 3, 0.0, 21000.0).generate();
        let mut first = frame(operator.clone());
        embed(&mut first, 600, 0);
        let filter = HistogramFilter::default().reduce(true);

        // First frame has no history to multiply with
        filter.accept(&mut first).unwrap();

        // The next frame comes from another pool slot with no output yet
        let mut second = frame(operator);
        embed(&mut second, 600, 0);
        filter.accept(&mut second).unwrap();

        for (now, before) in second.output.iter().zip(&first.output) {
            assert!((now - before * before).abs() <= 1e-4 * before.max(1.0));
        }
        assert_eq!(second.max_value, second.output.iter().copied().fold(0.0, f32::max));
    }

    #[test]
    fn test_reduce_ignores_stale_slot_output() {
        let operator = ChirpGenerator::new(48000, 3, 0.0, 21000.0).generate();
        let mut plain = frame(operator.clone());
        embed(&mut plain, 600, 0);
        HistogramFilter::default().accept(&mut plain).unwrap();

        // Leftovers from whatever frame last used this slot
        let mut recycled = frame(operator);
        embed(&mut recycled, 600, 0);
        recycled.output = vec![1000.0; 64];
        HistogramFilter::default()
            .reduce(true)
            .accept(&mut recycled)
            .unwrap();

        assert_eq!(recycled.output, plain.output);
    }

    #[test]
    fn test_empty_canvas_rejected() {
        let mut frame = frame(PulseOperator::from_samples(vec![1.0; 4]));
        frame.canvas = Rect::sized(0, 1);
        assert!(HistogramFilter::default().accept(&mut frame).is_err());
    }
}

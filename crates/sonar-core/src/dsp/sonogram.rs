//! Dual-microphone backprojection into a 2-D image
//!
//! Microphone A sits at the top middle of the resolution rectangle and
//! microphone B is displaced by the baseline along the x axis. Every canvas
//! pixel is a point in front of the array; its distance to each microphone
//! selects a span of the matched-filter output per channel. The product of
//! the two channel magnitudes, accumulated over the span one pixel covers,
//! is the pixel intensity. A reflector shows up where both channels agree.
//!
//! Pixels are square: one pixel step is `(bottom - top) / canvas.height`
//! meters on both axes.

use super::geometry::{Baseline, EchoGeometry};
use crate::controller::Rect;
use crate::filter::{FilterError, SignalFilter};
use crate::frame::Frame;
use rayon::prelude::*;
use std::sync::Arc;

/// Fractional sample positions of one pixel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelTaps {
    /// Channel A sample index (frames) of the pixel's near edge
    pub a: f32,
    /// Channel B sample index (frames) of the pixel's near edge
    pub b: f32,
    /// Frames spanned by one pixel step, at least 1
    pub steps: usize,
}

/// Per-frame mapping from canvas pixels to matched-filter positions
#[derive(Debug, Clone, Copy)]
pub struct SonogramGeometry {
    echo: EchoGeometry,
    /// Distance in meters from microphone A to the window's top row
    top: f32,
    /// Horizontal distance in meters from microphone A to canvas column 0
    mid: f32,
    /// Meters per pixel on both axes
    step: f32,
    /// Microphone distance in meters
    baseline: f32,
}

impl SonogramGeometry {
    pub fn new(
        echo: EchoGeometry,
        window: Rect,
        canvas: Rect,
        resolution: Rect,
        baseline: f32,
    ) -> Self {
        let top = echo.distance((window.top - resolution.top) as f32);
        let bottom = echo.distance((window.bottom - resolution.top) as f32);
        let mid = echo.distance(
            (resolution.left - window.left) as f32 + resolution.width() as f32 / 2.0,
        );
        let step = (bottom - top) / canvas.height() as f32;
        Self {
            echo,
            top,
            mid,
            step,
            baseline,
        }
    }

    /// Meters per pixel
    pub fn step(&self) -> f32 {
        self.step
    }

    /// Distance in meters from microphone A to the center of pixel `(x, y)`
    pub fn range(&self, x: usize, y: usize) -> f32 {
        let yd = self.top + (y as f32 + 0.5) * self.step;
        let xd = self.mid - (x as f32 + 0.5) * self.step;
        (xd * xd + yd * yd).sqrt()
    }

    /// Sample positions covered by pixel `(x, y)`
    #[inline]
    pub fn taps(&self, x: usize, y: usize) -> PixelTaps {
        let yd = self.top + y as f32 * self.step;
        let ysqr = yd * yd;

        let xda = self.mid - x as f32 * self.step;
        let da = (xda * xda + ysqr).sqrt();
        let ha1 = self.echo.sample_index(da);
        let ha2 = self.echo.sample_index(da + self.step);

        let xdb = xda + self.baseline;
        let hb1 = self.echo.sample_index((xdb * xdb + ysqr).sqrt());

        PixelTaps {
            a: ha1,
            b: hb1,
            steps: (ha2 - ha1).floor().max(1.0) as usize,
        }
    }
}

/// Accumulate the A·B product over the frames one pixel covers
///
/// The first and last frames of the span are blended by the fractional
/// sample position; interior frames add both taps unweighted.
#[inline]
fn reduce_pixel(matched: &[f32], taps: PixelTaps) -> f32 {
    let limit = matched.len().saturating_sub(2);

    let ra2 = taps.a.fract();
    let ra1 = 1.0 - ra2;
    let rb2 = taps.b.fract();
    let rb1 = 1.0 - rb2;

    let mut sai = taps.a as usize * 2;
    let mut sbi = taps.b as usize * 2 + 1;
    let sal = sai.saturating_add(taps.steps * 2).min(limit);
    let sbl = sbi.saturating_add(taps.steps * 2).min(limit);
    let last = taps.steps - 1;

    let mut acc = 0.0f32;
    let mut ix = 0usize;
    while sai < sal && sbi < sbl {
        let (a, b) = if ix == 0 {
            (
                matched[sai] * ra1 + matched[sai + 2] * ra2,
                matched[sbi] * rb1 + matched[sbi + 2] * rb2,
            )
        } else if ix == last {
            (
                matched[sai] * (1.0 - ra1) + matched[sai + 2] * (1.0 - ra2),
                matched[sbi] * (1.0 - rb1) + matched[sbi + 2] * (1.0 - rb2),
            )
        } else {
            (
                matched[sai] + matched[sai + 2],
                matched[sbi] + matched[sbi + 2],
            )
        };
        acc += a * b;

        sai += 2;
        sbi += 2;
        ix += 1;
    }
    acc
}

/// Filter stage turning [`Frame::matched`] into a `canvas.width × canvas.height` image
///
/// Expects the matched filter to have run earlier in the chain.
#[derive(Debug, Clone)]
pub struct SonogramReducer {
    baseline: Arc<Baseline>,
    speed: f32,
}

impl SonogramReducer {
    /// # Arguments
    /// * `baseline` - Microphone distance, read once per frame
    /// * `speed` - Speed of sound in meters/second
    pub fn new(baseline: Arc<Baseline>, speed: f32) -> Self {
        Self { baseline, speed }
    }

    /// Pixel geometry for a frame
    pub fn geometry(&self, frame: &Frame) -> SonogramGeometry {
        SonogramGeometry::new(
            EchoGeometry::new(frame.sample_rate, self.speed),
            frame.window,
            frame.canvas,
            frame.resolution,
            self.baseline.get(),
        )
    }
}

impl SignalFilter for SonogramReducer {
    fn accept(&self, frame: &mut Frame) -> Result<(), FilterError> {
        let canvas = frame.canvas;
        if canvas.is_empty() {
            return Err(FilterError::EmptyCanvas {
                width: canvas.width(),
                height: canvas.height(),
            });
        }
        if frame.window.is_empty() {
            return Err(FilterError::EmptyWindow {
                width: frame.window.width(),
                height: frame.window.height(),
            });
        }

        let geometry = self.geometry(frame);
        let width = canvas.width() as usize;
        frame.ensure_output(canvas.area());

        let matched = &frame.matched;
        frame.max_value = frame
            .output
            .par_chunks_mut(width)
            .enumerate()
            .map(|(y, row)| {
                let mut row_max = 0.0f32;
                for (x, out) in row.iter_mut().enumerate() {
                    let value = reduce_pixel(matched, geometry.taps(x, y));
                    *out = value;
                    row_max = row_max.max(value);
                }
                row_max
            })
            .reduce(|| 0.0, f32::max);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::pulse::PulseOperator;

    const WINDOW: i32 = 3840;
    const OPERATOR: usize = 144;

    fn frame(canvas: Rect) -> Frame {
        let samples = (WINDOW as usize + OPERATOR) * 2;
        let mut frame = Frame::new(
            48000.0,
            PulseOperator::from_samples(vec![0.0; OPERATOR]),
            samples,
        );
        let resolution = Rect::sized(WINDOW * 2, WINDOW);
        frame.window = resolution;
        frame.resolution = resolution;
        frame.canvas = canvas;
        frame
    }

    fn reducer() -> SonogramReducer {
        SonogramReducer::new(Arc::new(Baseline::new(0.12)), 340.29)
    }

    #[test]
    fn test_reduce_pixel_edge_weights() {
        let matched: Vec<f32> = (0..32).map(|i| if i % 2 == 0 { 1.0 } else { 2.0 }).collect();

        // Single step only uses the leading blend
        let one = reduce_pixel(
            &matched,
            PixelTaps {
                a: 3.25,
                b: 3.25,
                steps: 1,
            },
        );
        assert!((one - 1.0 * 2.0).abs() < 1e-6);

        // Three steps: leading blend, interior sum, trailing blend
        let three = reduce_pixel(
            &matched,
            PixelTaps {
                a: 2.0,
                b: 2.0,
                steps: 3,
            },
        );
        let expected = 1.0 * 2.0 + (2.0 * 4.0) + (1.0 * 2.0);
        assert!((three - expected).abs() < 1e-6);
    }

    #[test]
    fn test_reduce_pixel_clamps_at_end() {
        let matched = vec![1.0f32; 10];
        let taps = PixelTaps {
            a: 100.0,
            b: 100.0,
            steps: 4,
        };
        assert_eq!(reduce_pixel(&matched, taps), 0.0);
    }

    #[test]
    fn test_output_sized_to_canvas() {
        let mut frame = frame(Rect::sized(16, 12));
        reducer().accept(&mut frame).unwrap();
        assert_eq!(frame.output.len(), 16 * 12);
    }

    #[test]
    fn test_zero_input_zero_output() {
        let mut frame = frame(Rect::sized(16, 12));
        frame.output = vec![5.0; 16 * 12];
        reducer().accept(&mut frame).unwrap();
        assert!(frame.output.iter().all(|&v| v == 0.0));
        assert_eq!(frame.max_value, 0.0);
    }

    #[test]
    fn test_empty_canvas_rejected() {
        let mut frame = frame(Rect::sized(0, 12));
        assert!(matches!(
            reducer().accept(&mut frame),
            Err(FilterError::EmptyCanvas { .. })
        ));
    }

    #[test]
    fn test_deterministic() {
        let mut frame = frame(Rect::sized(24, 18));
        let mut seed = 12345u32;
        for value in frame.matched.iter_mut() {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
            *value = (seed >> 16) as f32 / 65536.0;
        }

        let reducer = reducer();
        reducer.accept(&mut frame).unwrap();
        let first = (frame.output.clone(), frame.max_value);
        reducer.accept(&mut frame).unwrap();

        assert_eq!(frame.output, first.0);
        assert_eq!(frame.max_value, first.1);
        assert!(frame.max_value > 0.0);
    }

    #[test]
    fn test_range_grows_with_depth() {
        let frame = frame(Rect::sized(40, 30));
        let geometry = reducer().geometry(&frame);
        // Microphone A sits above column 30; the window spans about 13.6 m
        assert!(geometry.range(30, 0) < 0.5);
        assert!(geometry.range(30, 29) > geometry.range(30, 15));
        assert!((geometry.range(30, 29) - 13.6).abs() < 0.5);
    }

    #[test]
    fn test_echo_localizes_to_pixel() {
        let canvas = Rect::sized(40, 30);
        let mut frame = frame(canvas);
        let reducer = reducer();
        let geometry = reducer.geometry(&frame);

        let (x0, y0) = (30usize, 10usize);
        let taps = geometry.taps(x0, y0);
        // Inside the span, away from the blended edges
        let fa = taps.a as usize + taps.steps / 2;
        let fb = taps.b as usize + taps.steps / 2;
        frame.matched[fa * 2] = 1.0;
        frame.matched[fb * 2 + 1] = 1.0;

        reducer.accept(&mut frame).unwrap();

        let target = frame.output[y0 * 40 + x0];
        assert!(target > 0.0);

        let (peak, _) = frame
            .output
            .iter()
            .enumerate()
            .fold((0, 0.0f32), |best, (i, &v)| if v > best.1 { (i, v) } else { best });
        let (px, py) = (peak % 40, peak / 40);
        assert!(px.abs_diff(x0) <= 1 && py.abs_diff(y0) <= 1);
    }
}

//! Per-cycle data record passed through the filter chain
//!
//! A [`Frame`] is owned by exactly one in-flight task at a time. Frames are
//! recycled through [`crate::pool::FramePool`], so the buffers are sized
//! once and then only overwritten.

use crate::controller::Rect;
use crate::dsp::pulse::PulseOperator;

/// One captured window of interleaved stereo samples plus its derived buffers
#[derive(Debug, Clone)]
pub struct Frame {
    /// Sample rate in Hz, fixed per session
    pub sample_rate: f32,
    /// Active pulse operator (shared, read-only)
    pub operator: PulseOperator,
    /// Interleaved stereo samples, channel A at even and channel B at odd indices
    pub samples: Vec<i16>,
    /// Region of interest inside `resolution`
    pub window: Rect,
    /// Output dimensions (pixels or bins)
    pub canvas: Rect,
    /// Full addressable index space
    pub resolution: Rect,
    /// Matched filter magnitude, same length and layout as `samples`
    pub matched: Vec<f32>,
    /// Reducer output, `canvas.width * canvas.height` or `canvas.width` long
    pub output: Vec<f32>,
    /// Maximum of `output`, for log-scale display
    pub max_value: f32,
}

impl Frame {
    /// Create a frame able to hold `sample_count` interleaved samples
    pub fn new(sample_rate: f32, operator: PulseOperator, sample_count: usize) -> Self {
        Self {
            sample_rate,
            operator,
            samples: vec![0; sample_count],
            window: Rect::default(),
            canvas: Rect::default(),
            resolution: Rect::default(),
            matched: vec![0.0; sample_count],
            output: Vec::new(),
            max_value: 0.0,
        }
    }

    /// Copy a captured window in and latch the controller geometry for this cycle
    ///
    /// # Panics
    /// Panics if `samples` does not match the length the frame was created with
    pub fn load(&mut self, samples: &[i16], window: Rect, canvas: Rect, resolution: Rect) {
        self.samples.copy_from_slice(samples);
        self.window = window;
        self.canvas = canvas;
        self.resolution = resolution;
        self.max_value = 0.0;
    }

    /// Number of per-channel frames held
    pub fn frame_count(&self) -> usize {
        self.samples.len() / 2
    }

    /// Size `output` to `len`, reallocating only when the canvas changed
    pub fn ensure_output(&mut self, len: usize) {
        if self.output.len() != len {
            self.output = vec![0.0; len];
        }
    }

    /// Iterate over the samples of one channel (0 = A, 1 = B)
    pub fn channel(&self, channel: usize) -> impl Iterator<Item = i16> + '_ {
        self.samples.iter().skip(channel).step_by(2).copied()
    }
}

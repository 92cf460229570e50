//! Processed-frame rate measurement
//!
//! [`FramerateCounter`] is a pass-through filter. Every `every` frames it
//! computes the rate over the elapsed wall time, logs it at debug level and
//! keeps it in a bounded history for status displays.

use crate::filter::{FilterError, SignalFilter};
use crate::frame::Frame;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

/// Number of rate samples kept
const MAX_HISTORY_SIZE: usize = 120;

/// Frames counted between rate updates by default
pub const DEFAULT_EVERY: u64 = 25;

/// A single rate measurement
#[derive(Debug, Clone)]
pub struct RateSample {
    /// When the measurement window closed
    pub timestamp: DateTime<Utc>,
    /// Frames per second over the window
    pub fps: f64,
}

#[derive(Debug)]
struct Window {
    count: u64,
    started: Instant,
    total: u64,
    history: VecDeque<RateSample>,
}

/// Counts frames passing through the chain
#[derive(Debug)]
pub struct FramerateCounter {
    every: u64,
    window: Mutex<Window>,
}

impl FramerateCounter {
    /// Create a counter reporting every `every` frames
    pub fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
            window: Mutex::new(Window {
                count: 0,
                started: Instant::now(),
                total: 0,
                history: VecDeque::with_capacity(MAX_HISTORY_SIZE),
            }),
        }
    }

    /// Record one frame, returning the new rate if a window just closed
    pub fn tick(&self) -> Option<f64> {
        let mut window = self
            .window
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        window.count += 1;
        window.total += 1;
        if window.count < self.every {
            return None;
        }

        let elapsed = window.started.elapsed().as_secs_f64();
        let fps = if elapsed > 0.0 {
            window.count as f64 / elapsed
        } else {
            0.0
        };
        tracing::debug!(fps, frames = window.total, "Framerate");

        if window.history.len() >= MAX_HISTORY_SIZE {
            window.history.pop_front();
        }
        window.history.push_back(RateSample {
            timestamp: Utc::now(),
            fps,
        });
        window.count = 0;
        window.started = Instant::now();
        Some(fps)
    }

    /// Most recent rate, if any window has closed yet
    pub fn latest(&self) -> Option<f64> {
        self.window
            .lock()
            .ok()
            .and_then(|w| w.history.back().map(|s| s.fps))
    }

    /// Frames counted since creation
    pub fn total(&self) -> u64 {
        self.window.lock().map(|w| w.total).unwrap_or(0)
    }

    /// Copy of the rate history, oldest first
    pub fn history(&self) -> Vec<RateSample> {
        self.window
            .lock()
            .map(|w| w.history.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for FramerateCounter {
    fn default() -> Self {
        Self::new(DEFAULT_EVERY)
    }
}

impl SignalFilter for FramerateCounter {
    fn accept(&self, _frame: &mut Frame) -> Result<(), FilterError> {
        self.tick();
        Ok(())
    }
}

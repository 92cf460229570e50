//! Interface between the sonar engine and whatever displays its output
//!
//! The engine asks the controller for the current window and canvas on the
//! capture thread for every frame, so those accessors must never block.
//! [`SonarView`] is a ready-made implementation that keeps its rectangles in
//! `AtomicCell`s and forwards finished frames over a bounded channel.
//!
//! A `Rect` is 16 bytes, wider than any native atomic on common targets, so
//! the cells fall back to crossbeam's striped seqlock. Reads are optimistic
//! and only spin while a writer is mid-copy; no reader ever waits on the
//! UI thread beyond that copy.

use crate::frame::Frame;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use crossbeam_utils::atomic::AtomicCell;
use std::sync::atomic::{AtomicU64, Ordering};

/// Integer rectangle, right/bottom exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Rectangle anchored at the origin
    pub const fn sized(width: i32, height: i32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub const fn width(&self) -> i32 {
        self.right - self.left
    }

    pub const fn height(&self) -> i32 {
        self.bottom - self.top
    }

    pub const fn is_empty(&self) -> bool {
        self.width() <= 0 || self.height() <= 0
    }

    /// Number of cells covered, zero for empty rectangles
    pub fn area(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            self.width() as usize * self.height() as usize
        }
    }
}

/// Consumer of processed frames and source of display geometry
///
/// Implementations are shared between the capture thread, the worker pool
/// and the UI, hence `Send + Sync` and `&self` everywhere.
pub trait SonarController: Send + Sync {
    /// Informs the controller of the full addressable coordinate space
    fn set_sonar_resolution(&self, resolution: Rect);

    /// Current region of interest. Must not lock.
    fn sonar_window(&self) -> Rect;

    /// Current output dimensions. Must not lock.
    fn sonar_canvas(&self) -> Rect;

    /// Delivers a fully processed frame
    fn receive(&self, frame: &Frame);
}

/// Copy of a processed frame's output, detached from the pooled frame
#[derive(Debug, Clone)]
pub struct FrameSnapshot {
    pub output: Vec<f32>,
    pub max_value: f32,
    pub window: Rect,
    pub canvas: Rect,
    pub resolution: Rect,
    pub sample_rate: f32,
}

impl FrameSnapshot {
    /// Index and value of the strongest output cell
    pub fn peak(&self) -> Option<(usize, f32)> {
        self.output
            .iter()
            .copied()
            .enumerate()
            .fold(None, |best, (i, v)| match best {
                Some((_, bv)) if bv >= v => best,
                _ => Some((i, v)),
            })
    }
}

/// Non-blocking controller that publishes frame snapshots over a bounded channel
///
/// # Example
/// ```
/// use sonar_core::controller::{Rect, SonarController, SonarView};
///
/// let (view, _snapshots) = SonarView::new(Rect::sized(64, 48), 4);
/// view.set_sonar_resolution(Rect::sized(7680, 3840));
/// assert_eq!(view.sonar_window(), Rect::sized(7680, 3840));
/// ```
#[derive(Debug)]
pub struct SonarView {
    resolution: AtomicCell<Rect>,
    window: AtomicCell<Rect>,
    canvas: AtomicCell<Rect>,
    snapshots: Sender<FrameSnapshot>,
    received: AtomicU64,
    dropped: AtomicU64,
}

impl SonarView {
    /// Create a view with the given canvas, buffering at most `capacity` snapshots
    pub fn new(canvas: Rect, capacity: usize) -> (Self, Receiver<FrameSnapshot>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        let view = Self {
            resolution: AtomicCell::new(Rect::default()),
            window: AtomicCell::new(Rect::default()),
            canvas: AtomicCell::new(canvas),
            snapshots: tx,
            received: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        };
        (view, rx)
    }

    /// Last resolution reported by the engine
    pub fn resolution(&self) -> Rect {
        self.resolution.load()
    }

    /// Change the region of interest (e.g. zoom from the UI)
    pub fn set_window(&self, window: Rect) {
        self.window.store(window);
    }

    /// Change the output dimensions
    pub fn set_canvas(&self, canvas: Rect) {
        self.canvas.store(canvas);
    }

    /// Number of frames received so far
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Number of snapshots dropped because the consumer lagged
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl SonarController for SonarView {
    fn set_sonar_resolution(&self, resolution: Rect) {
        self.resolution.store(resolution);
        if self.window.load().is_empty() {
            self.window.store(resolution);
        }
        tracing::debug!(
            width = resolution.width(),
            height = resolution.height(),
            "Sonar resolution set"
        );
    }

    fn sonar_window(&self) -> Rect {
        self.window.load()
    }

    fn sonar_canvas(&self) -> Rect {
        self.canvas.load()
    }

    fn receive(&self, frame: &Frame) {
        self.received.fetch_add(1, Ordering::Relaxed);
        let snapshot = FrameSnapshot {
            output: frame.output.clone(),
            max_value: frame.max_value,
            window: frame.window,
            canvas: frame.canvas,
            resolution: frame.resolution,
            sample_rate: frame.sample_rate,
        };
        match self.snapshots.try_send(snapshot) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

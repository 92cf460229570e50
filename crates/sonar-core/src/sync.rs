//! Closed-loop alignment of playback against capture
//!
//! [`AudioSync`] sits in the filter chain. Every few pulse intervals it
//! snapshots a frame's raw samples and locates the pulse in each channel on
//! a short-lived background thread. Once the position has been stable for
//! enough measurements it either:
//!
//! - publishes a one-shot playback delay that moves the pulse to the start
//!   of the capture window, or
//! - if the pulse already sits there, declares convergence, optionally
//!   derives the microphone baseline from the inter-channel offset, and
//!   stops measuring.
//!
//! The delay travels to the playback loop over a single-slot SPSC ring
//! ([`delay_channel`]), so neither side ever blocks.

use crate::config::SonarConfig;
use crate::dsp::correlation::CrossCorrelator;
use crate::dsp::geometry::{Baseline, EchoGeometry};
use crate::dsp::pulse::PulseOperator;
use crate::filter::{FilterError, SignalFilter};
use crate::frame::Frame;
use crate::SHORT_MAX;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Producer side of the one-shot playback delay
pub struct DelaySender(HeapProd<usize>);

/// Consumer side of the one-shot playback delay
pub struct DelayReceiver(HeapCons<usize>);

/// Create a single-slot delay handoff
pub fn delay_channel() -> (DelaySender, DelayReceiver) {
    let (producer, consumer) = HeapRb::<usize>::new(1).split();
    (DelaySender(producer), DelayReceiver(consumer))
}

impl DelaySender {
    /// Offer a delay in frames. Returns `false` if the previous one has not
    /// been consumed yet, in which case `delay` is dropped.
    pub fn publish(&mut self, delay: usize) -> bool {
        self.0.try_push(delay).is_ok()
    }
}

impl DelayReceiver {
    /// Take the pending delay, 0 if none
    pub fn take(&mut self) -> usize {
        self.0.try_pop().unwrap_or(0)
    }

    pub fn is_pending(&self) -> bool {
        !self.0.is_empty()
    }
}

/// Per-channel pulse positions in frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Peaks {
    pub a: usize,
    pub b: usize,
}

/// Calibrator tuning, derived from [`SonarConfig`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncParams {
    /// Time between measurements
    pub adjust_interval: Duration,
    /// Consecutive stable measurements needed to act
    pub positive_hits: u32,
    /// Maximum drift in frames still counted as stable (exclusive)
    pub tolerance: usize,
    /// Peak position in frames below which playback counts as aligned (exclusive)
    pub threshold: usize,
    /// Whether to derive the baseline on convergence
    pub derive_baseline: bool,
    /// Frames per pulse interval
    pub window_length: usize,
    pub sample_rate: f32,
    pub speed: f32,
}

impl From<&SonarConfig> for SyncParams {
    fn from(config: &SonarConfig) -> Self {
        Self {
            adjust_interval: config.adjust_interval(),
            positive_hits: config.calibration.positive_hits,
            tolerance: config.calibration.tolerance,
            threshold: config.calibration.threshold,
            derive_baseline: config.calibration.derive_baseline,
            window_length: config.window_frames(),
            sample_rate: config.sample_rate as f32,
            speed: config.speed_of_sound,
        }
    }
}

/// What a measurement concluded
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncAction {
    /// Not stable long enough yet
    Pending,
    /// Playback should be delayed by this many frames
    Correct { delay: usize },
    /// Aligned; carries the derived baseline in meters, if enabled
    Converge { baseline: Option<f32> },
}

/// Observable calibrator phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncPhase {
    Idle = 0,
    Measuring = 1,
    Correcting = 2,
    Converged = 3,
}

impl SyncPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Measuring,
            2 => Self::Correcting,
            3 => Self::Converged,
            _ => Self::Idle,
        }
    }
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Measuring => "measuring",
            Self::Correcting => "correcting",
            Self::Converged => "converged",
        };
        f.write_str(name)
    }
}

/// Hit counting over successive peak measurements
#[derive(Debug, Clone)]
pub struct SyncState {
    params: SyncParams,
    tracked: Option<Peaks>,
    hits: u32,
    converged: bool,
}

impl SyncState {
    pub fn new(params: SyncParams) -> Self {
        Self {
            params,
            tracked: None,
            hits: 0,
            converged: false,
        }
    }

    /// Feed one measurement
    ///
    /// # Arguments
    /// * `peaks` - Pulse position per channel
    /// * `frames` - Period in frames used to wrap the inter-channel offset
    pub fn observe(&mut self, peaks: Peaks, frames: usize) -> SyncAction {
        if self.converged {
            return SyncAction::Pending;
        }

        let tolerance = self.params.tolerance;
        match self.tracked {
            Some(tracked)
                if tracked.a.abs_diff(peaks.a) < tolerance
                    && tracked.b.abs_diff(peaks.b) < tolerance =>
            {
                self.hits += 1;
            }
            previous => {
                if previous.is_some() {
                    tracing::debug!(a = peaks.a, b = peaks.b, "Unstable pulse position, restarting");
                }
                self.tracked = Some(peaks);
                self.hits = 1;
            }
        }

        if self.hits < self.params.positive_hits {
            return SyncAction::Pending;
        }

        let frames = frames.max(1);
        let action = if peaks.a < self.params.threshold {
            self.converged = true;
            let baseline = self
                .params
                .derive_baseline
                .then(|| self.baseline_from(peaks, frames));
            SyncAction::Converge { baseline }
        } else {
            let window = self.params.window_length.max(1);
            SyncAction::Correct {
                delay: (window - peaks.a % window) % window,
            }
        };

        // Expect the pulse at the window start from now on
        self.tracked = Some(Peaks {
            a: 0,
            b: (peaks.b + frames - peaks.a % frames) % frames,
        });
        self.hits = 0;
        action
    }

    /// Microphone distance from the shorter way around the channel offset
    fn baseline_from(&self, peaks: Peaks, frames: usize) -> f32 {
        let a = peaks.a as i64;
        let b = peaks.b as i64;
        let n = frames as i64;
        let offset = (b - a).abs().min((a - (b - n)).abs());
        EchoGeometry::new(self.params.sample_rate, self.params.speed).one_way(offset as f32)
    }

    pub fn hits(&self) -> u32 {
        self.hits
    }

    pub fn tracked(&self) -> Option<Peaks> {
        self.tracked
    }

    pub fn is_converged(&self) -> bool {
        self.converged
    }
}

struct Measurement {
    state: SyncState,
    correlator: CrossCorrelator,
    delay: DelaySender,
    channel_a: Vec<f32>,
    channel_b: Vec<f32>,
}

struct SyncInner {
    params: SyncParams,
    baseline: Arc<Baseline>,
    disabled: AtomicBool,
    scheduled: AtomicBool,
    phase: AtomicU8,
    epoch: Instant,
    next_due_ms: AtomicU64,
    measurement: Mutex<Measurement>,
}

/// Background calibrator, usable as a filter
///
/// Cloning yields another handle to the same calibrator.
#[derive(Clone)]
pub struct AudioSync {
    inner: Arc<SyncInner>,
}

impl AudioSync {
    /// Create a calibrator
    ///
    /// # Arguments
    /// * `params` - Tuning
    /// * `operator` - Pulse to look for
    /// * `baseline` - Receives the derived microphone distance
    /// * `delay` - Where playback corrections are published
    pub fn new(
        params: SyncParams,
        operator: &PulseOperator,
        baseline: Arc<Baseline>,
        delay: DelaySender,
    ) -> Self {
        let frames = params.window_length + operator.len();
        let inner = SyncInner {
            params,
            baseline,
            disabled: AtomicBool::new(false),
            scheduled: AtomicBool::new(false),
            phase: AtomicU8::new(SyncPhase::Idle as u8),
            epoch: Instant::now(),
            next_due_ms: AtomicU64::new(params.adjust_interval.as_millis() as u64),
            measurement: Mutex::new(Measurement {
                state: SyncState::new(params),
                correlator: CrossCorrelator::new(operator, frames),
                delay,
                channel_a: Vec::with_capacity(frames),
                channel_b: Vec::with_capacity(frames),
            }),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        SyncPhase::from_u8(self.inner.phase.load(Ordering::Acquire))
    }

    /// Whether measuring has stopped for good
    pub fn is_disabled(&self) -> bool {
        self.inner.disabled.load(Ordering::Acquire)
    }

    /// Measure interleaved stereo samples synchronously
    pub fn measure(&self, samples: &[i16]) -> SyncAction {
        self.inner.measure(samples)
    }

    fn elapsed_ms(&self) -> u64 {
        self.inner.epoch.elapsed().as_millis() as u64
    }
}

impl SyncInner {
    fn measure(&self, samples: &[i16]) -> SyncAction {
        if self.disabled.load(Ordering::Acquire) {
            return SyncAction::Pending;
        }
        self.phase.store(SyncPhase::Measuring as u8, Ordering::Release);

        let Ok(mut guard) = self.measurement.lock() else {
            tracing::error!("Calibrator state poisoned, disabling");
            self.disabled.store(true, Ordering::Release);
            return SyncAction::Pending;
        };
        let m = &mut *guard;

        m.channel_a.clear();
        m.channel_b.clear();
        for pair in samples.chunks_exact(2) {
            m.channel_a.push(pair[0] as f32 / SHORT_MAX);
            m.channel_b.push(pair[1] as f32 / SHORT_MAX);
        }

        let (a, strength_a) = m.correlator.peak_lag(&m.channel_a);
        let (b, strength_b) = m.correlator.peak_lag(&m.channel_b);
        // Pulses repeat every window, and a pulse at the window start is
        // also visible one window later in the overlap
        let window = self.params.window_length.max(1);
        let peaks = Peaks {
            a: a % window,
            b: b % window,
        };
        let (a, b) = (peaks.a, peaks.b);

        tracing::debug!(a, b, strength_a, strength_b, "Pulse located");

        let action = m.state.observe(peaks, window);
        let phase = match action {
            SyncAction::Pending => SyncPhase::Idle,
            SyncAction::Correct { delay } => {
                if m.delay.publish(delay) {
                    tracing::info!(peak = a, delay, "Correcting playback delay");
                } else {
                    tracing::warn!(delay, "Previous delay correction not yet applied, skipping");
                }
                SyncPhase::Correcting
            }
            SyncAction::Converge { baseline } => {
                self.disabled.store(true, Ordering::Release);
                match baseline {
                    Some(meters) => {
                        self.baseline.set(meters);
                        tracing::info!(a, b, baseline = meters, "Calibration converged");
                    }
                    None => tracing::info!(a, b, "Calibration converged"),
                }
                SyncPhase::Converged
            }
        };
        self.phase.store(phase as u8, Ordering::Release);
        action
    }
}

impl SignalFilter for AudioSync {
    fn accept(&self, frame: &mut Frame) -> Result<(), FilterError> {
        let inner = &self.inner;
        if inner.disabled.load(Ordering::Acquire) {
            return Ok(());
        }
        let now = self.elapsed_ms();
        if now < inner.next_due_ms.load(Ordering::Acquire) {
            return Ok(());
        }
        if inner
            .scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        let samples = frame.samples.clone();
        let task = Arc::clone(inner);
        let spawned = std::thread::Builder::new()
            .name("sonar-sync".into())
            .spawn(move || {
                task.measure(&samples);
                let next = task.epoch.elapsed().as_millis() as u64
                    + task.params.adjust_interval.as_millis() as u64;
                task.next_due_ms.store(next, Ordering::Release);
                task.scheduled.store(false, Ordering::Release);
            });

        if let Err(e) = spawned {
            tracing::error!(error = %e, "Failed to spawn calibration task");
            inner.scheduled.store(false, Ordering::Release);
        }
        Ok(())
    }
}

impl std::fmt::Debug for AudioSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioSync")
            .field("phase", &self.phase())
            .field("disabled", &self.is_disabled())
            .finish()
    }
}

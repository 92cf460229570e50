//! Sonar pipeline: playback, capture, workers and calibration wired together
//!
//! [`Sonar::start`] spawns the two audio loops and the worker pool. The
//! capture thread copies each full window into a pooled frame, latches the
//! controller geometry and submits the frame to the pool, where the filter
//! chain runs and the result is handed to [`SonarController::receive`].

use crate::audio::capture::{CaptureConfig, CaptureLoop, CaptureStats};
use crate::audio::playback::{PlaybackLoop, PlaybackStats};
use crate::audio::worker::LoopHandle;
use crate::audio::{AudioError, AudioInput, AudioOutput};
use crate::config::{ConfigError, SonarConfig};
use crate::controller::{Rect, SonarController};
use crate::dsp::geometry::Baseline;
use crate::dsp::matched::MatchedFilter;
use crate::dsp::pulse::{ChirpGenerator, PulseOperator};
use crate::dsp::sonogram::SonogramReducer;
use crate::filter::{FilterChain, SignalFilter};
use crate::pool::{FramePool, WorkerPool};
use crate::recording::{RecordingError, ReplaySource};
use crate::stats::FramerateCounter;
use crate::sync::{delay_channel, AudioSync, SyncParams, SyncPhase};
use std::io::{Read, Seek};
use std::sync::Arc;
use thiserror::Error;

/// Errors starting or running the pipeline
#[derive(Error, Debug)]
pub enum SonarError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Recording error: {0}")]
    Recording(#[from] RecordingError),

    #[error("Sonar is already running")]
    AlreadyRunning,

    #[error("Recording does not match the configuration: {0}")]
    ReplayMismatch(String),
}

/// Pipeline state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SonarState {
    /// No session
    Stopped,
    /// All loops running
    Running,
    /// A loop ended on its own (device failure); call stop to collect the error
    Error,
}

/// Counters collected when a session stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Windows captured and submitted
    pub windows: u64,
    /// Pulses emitted (0 for replay)
    pub pulses: u64,
    /// Frame jobs evicted by newer ones
    pub discarded: u64,
    /// Frames the frame pool had to allocate
    pub frames_allocated: usize,
}

type CaptureResult = Result<CaptureStats, AudioError>;
type PlaybackResult = Result<PlaybackStats, AudioError>;

struct Session {
    capture: LoopHandle<CaptureResult>,
    playback: Option<LoopHandle<PlaybackResult>>,
    pool: Arc<WorkerPool>,
    frames: Arc<FramePool>,
    sync: Option<AudioSync>,
}

/// The sonar engine
///
/// # Example
/// ```
/// use sonar_core::controller::{Rect, SonarView};
/// use sonar_core::{Sonar, SonarConfig};
/// use std::sync::Arc;
///
/// let (view, _snapshots) = SonarView::new(Rect::sized(320, 240), 4);
/// let sonar = Sonar::new(SonarConfig::default(), Arc::new(view)).unwrap();
/// assert_eq!(sonar.operator().len(), 144);
/// assert!(!sonar.is_running());
/// ```
pub struct Sonar {
    config: SonarConfig,
    controller: Arc<dyn SonarController>,
    operator: PulseOperator,
    baseline: Arc<Baseline>,
    filter: Option<Arc<dyn SignalFilter>>,
    framerate: Arc<FramerateCounter>,
    session: Option<Session>,
}

impl Sonar {
    /// Validate the configuration and synthesize the pulse
    pub fn new(
        config: SonarConfig,
        controller: Arc<dyn SonarController>,
    ) -> Result<Self, SonarError> {
        config.validate()?;
        let operator = ChirpGenerator::new(
            config.sample_rate,
            config.pulse_duration_ms,
            config.chirp_start_hz,
            config.bandwidth(),
        )
        .generate();
        let baseline = Arc::new(Baseline::new(config.baseline_m));

        tracing::info!(
            sample_rate = config.sample_rate,
            window_frames = config.window_frames(),
            operator_len = operator.len(),
            bandwidth = config.bandwidth(),
            "Sonar created"
        );

        Ok(Self {
            config,
            controller,
            operator,
            baseline,
            filter: None,
            framerate: Arc::new(FramerateCounter::default()),
            session: None,
        })
    }

    /// Replace the processing stage (matched filter plus sonogram by default)
    ///
    /// Takes effect on the next start.
    pub fn set_filter<F: SignalFilter + 'static>(&mut self, filter: F) {
        self.filter = Some(Arc::new(filter));
    }

    /// The default processing stage
    pub fn default_filter(&self) -> FilterChain {
        FilterChain::new()
            .with(MatchedFilter)
            .with(SonogramReducer::new(
                Arc::clone(&self.baseline),
                self.config.speed_of_sound,
            ))
    }

    pub fn config(&self) -> &SonarConfig {
        &self.config
    }

    pub fn operator(&self) -> &PulseOperator {
        &self.operator
    }

    /// Current microphone distance in meters
    pub fn baseline(&self) -> f32 {
        self.baseline.get()
    }

    /// Shared handle to the microphone distance, for filters built outside
    pub fn baseline_handle(&self) -> Arc<Baseline> {
        Arc::clone(&self.baseline)
    }

    /// Most recent processed frame rate
    pub fn framerate(&self) -> Option<f64> {
        self.framerate.latest()
    }

    /// Frames fully processed since creation
    pub fn processed(&self) -> u64 {
        self.framerate.total()
    }

    /// Index space reported to the controller: interleaved samples by frames
    pub fn resolution(&self) -> Rect {
        let frames = self.config.window_frames() as i32;
        Rect::sized(frames * 2, frames)
    }

    /// Calibrator phase, `None` when stopped or replaying
    pub fn sync_phase(&self) -> Option<SyncPhase> {
        self.session
            .as_ref()
            .and_then(|s| s.sync.as_ref())
            .map(|sync| sync.phase())
    }

    /// Frame jobs discarded by the worker pool in the current session
    pub fn discarded(&self) -> u64 {
        self.session
            .as_ref()
            .map(|s| s.pool.discarded())
            .unwrap_or(0)
    }

    pub fn state(&self) -> SonarState {
        match &self.session {
            None => SonarState::Stopped,
            Some(session) => {
                let playback_alive = session
                    .playback
                    .as_ref()
                    .map(|p| p.is_alive())
                    .unwrap_or(true);
                if session.capture.is_alive() && playback_alive {
                    SonarState::Running
                } else {
                    SonarState::Error
                }
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == SonarState::Running
    }

    /// Start emitting pulses on `output` and processing echoes from `input`
    ///
    /// `input` must deliver interleaved stereo, `output` takes mono.
    pub fn start<I, O>(&mut self, input: I, output: O) -> Result<(), SonarError>
    where
        I: AudioInput + 'static,
        O: AudioOutput + 'static,
    {
        if self.session.is_some() {
            return Err(SonarError::AlreadyRunning);
        }

        let (delay_tx, delay_rx) = delay_channel();
        let sync = AudioSync::new(
            SyncParams::from(&self.config),
            &self.operator,
            Arc::clone(&self.baseline),
            delay_tx,
        );

        let playback = PlaybackLoop::new(
            output,
            self.operator.to_i16(self.config.pulse_amplitude),
            self.config.window_frames(),
            self.config.capture_retry_wait(),
            delay_rx,
        );
        let playback = LoopHandle::spawn("sonar-playback", move |stop| playback.run(&stop));

        let chain = FilterChain::new()
            .with(sync.clone())
            .with_shared(self.processing())
            .with_shared(Arc::clone(&self.framerate) as Arc<dyn SignalFilter>);
        let mut session = self.launch(input, chain, self.operator.clone());
        session.playback = Some(playback);
        session.sync = Some(sync);
        self.session = Some(session);

        tracing::info!("Sonar started");
        Ok(())
    }

    /// Process a recording instead of live audio
    ///
    /// No pulses are emitted and the calibrator does not run. The recording
    /// must have been captured with the configured sample rate and pulse
    /// interval; its own operator is used for matched filtering.
    pub fn start_replay<R>(&mut self, source: ReplaySource<R>) -> Result<(), SonarError>
    where
        R: Read + Seek + Send + 'static,
    {
        if self.session.is_some() {
            return Err(SonarError::AlreadyRunning);
        }

        let header = source.header().clone();
        if header.sample_rate != self.config.sample_rate as f32 {
            return Err(SonarError::ReplayMismatch(format!(
                "sample rate {} Hz, configured {} Hz",
                header.sample_rate, self.config.sample_rate
            )));
        }
        let expected = (self.config.window_frames() + header.operator.len()) * 2;
        if header.sample_count != expected {
            return Err(SonarError::ReplayMismatch(format!(
                "{} samples per buffer, configured {}",
                header.sample_count, expected
            )));
        }

        let chain = FilterChain::new()
            .with_shared(self.processing())
            .with_shared(Arc::clone(&self.framerate) as Arc<dyn SignalFilter>);
        let session = self.launch(source, chain, header.operator);
        self.session = Some(session);

        tracing::info!("Sonar replay started");
        Ok(())
    }

    /// Stop the loops, waiting up to the configured grace period for each,
    /// and drain the worker pool
    ///
    /// # Errors
    /// Returns the device error that ended a loop, if any.
    pub fn stop(&mut self) -> Result<SessionStats, SonarError> {
        let Some(mut session) = self.session.take() else {
            return Ok(SessionStats::default());
        };
        let grace = self.config.stop_grace();

        let capture = session.capture.stop(grace);
        let playback = session.playback.as_mut().and_then(|p| p.stop(grace));

        let mut stats = SessionStats {
            discarded: session.pool.discarded(),
            frames_allocated: session.frames.allocated(),
            ..Default::default()
        };
        // Last reference unless the capture thread was detached
        drop(session);

        let mut failure = None;
        match capture {
            Some(Ok(capture)) => stats.windows = capture.windows,
            Some(Err(e)) => failure = Some(e),
            None => {}
        }
        match playback {
            Some(Ok(playback)) => stats.pulses = playback.pulses,
            Some(Err(e)) => failure = failure.or(Some(e)),
            None => {}
        }

        tracing::info!(
            windows = stats.windows,
            pulses = stats.pulses,
            discarded = stats.discarded,
            frames_allocated = stats.frames_allocated,
            "Sonar stopped"
        );

        match failure {
            Some(e) => Err(e.into()),
            None => Ok(stats),
        }
    }

    fn processing(&self) -> Arc<dyn SignalFilter> {
        match &self.filter {
            Some(filter) => Arc::clone(filter),
            None => Arc::new(self.default_filter()),
        }
    }

    fn launch<I>(&self, input: I, chain: FilterChain, operator: PulseOperator) -> Session
    where
        I: AudioInput + 'static,
    {
        let capture_config = CaptureConfig {
            window_frames: self.config.window_frames(),
            operator_len: operator.len(),
            retry_wait: self.config.capture_retry_wait(),
            max_idle_retries: self.config.max_idle_retries,
        };

        let resolution = self.resolution();
        self.controller.set_sonar_resolution(resolution);

        let pool = Arc::new(WorkerPool::new(
            self.config.workers,
            self.config.queue_capacity,
        ));
        let frames = FramePool::new(
            self.config.sample_rate as f32,
            operator,
            capture_config.buffer_len(),
            self.config.queue_capacity + pool.worker_count(),
        );

        let chain = Arc::new(chain);
        let controller = Arc::clone(&self.controller);
        let dispatch_pool = Arc::clone(&pool);
        let dispatch_frames = Arc::clone(&frames);
        let capture = CaptureLoop::new(input, capture_config);

        let handle = LoopHandle::spawn("sonar-capture", move |stop| {
            capture.run(&stop, |samples| {
                let mut frame = dispatch_frames.checkout();
                frame.load(
                    samples,
                    controller.sonar_window(),
                    controller.sonar_canvas(),
                    resolution,
                );

                let chain = Arc::clone(&chain);
                let controller = Arc::clone(&controller);
                dispatch_pool.submit(move || match chain.accept(&mut frame) {
                    Ok(()) => controller.receive(&frame),
                    Err(e) => tracing::warn!(error = %e, "Frame processing failed"),
                });
            })
        });

        Session {
            capture: handle,
            playback: None,
            pool,
            frames,
            sync: None,
        }
    }
}

impl Drop for Sonar {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

impl std::fmt::Debug for Sonar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sonar")
            .field("state", &self.state())
            .field("operator_len", &self.operator.len())
            .field("baseline", &self.baseline())
            .finish()
    }
}

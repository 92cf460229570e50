//! Speaker loop emitting one pulse per interval
//!
//! Each cycle writes the pulse followed by silence up to the interval
//! length. A one-shot delay published by the calibrator is taken at the top
//! of a cycle and lengthens only that cycle's silence, shifting all later
//! pulses relative to the capture windows.

use super::worker::StopSignal;
use super::{AudioError, AudioOutput};
use crate::sync::DelayReceiver;
use std::time::Duration;

/// Counters reported when the loop exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    /// Pulses started
    pub pulses: u64,
    /// Total extra frames inserted by delay corrections
    pub delayed: u64,
}

/// Real-time playback loop, consuming its output on exit
pub struct PlaybackLoop<O: AudioOutput> {
    output: O,
    pulse: Vec<i16>,
    silence: Vec<i16>,
    interval: usize,
    retry_wait: Duration,
    delay: DelayReceiver,
}

impl<O: AudioOutput> PlaybackLoop<O> {
    /// Create a loop
    ///
    /// # Arguments
    /// * `output` - Mono sink
    /// * `pulse` - Pulse samples, already scaled to the playback amplitude
    /// * `interval` - Frames from one pulse start to the next
    /// * `retry_wait` - Sleep while the device buffer is full
    /// * `delay` - One-shot corrections from the calibrator
    pub fn new(
        output: O,
        pulse: Vec<i16>,
        interval: usize,
        retry_wait: Duration,
        delay: DelayReceiver,
    ) -> Self {
        let silence = vec![0i16; pulse.len().max(1)];
        Self {
            output,
            pulse,
            silence,
            interval,
            retry_wait,
            delay,
        }
    }

    /// Run until `stop` is raised or the output fails
    pub fn run(mut self, stop: &StopSignal) -> Result<PlaybackStats, AudioError> {
        let mut stats = PlaybackStats::default();

        tracing::info!(
            pulse_len = self.pulse.len(),
            interval = self.interval,
            "Playback loop started"
        );

        while !stop.is_stopped() {
            let extra = self.delay.take();
            if extra > 0 {
                tracing::info!(delay = extra, "Applying playback delay correction");
                stats.delayed += extra as u64;
            }
            let duration = self.interval + extra;

            let pulse_len = self.pulse.len().min(duration);
            if !write_all(&mut self.output, &self.pulse[..pulse_len], self.retry_wait, stop)? {
                break;
            }
            stats.pulses += 1;

            let mut position = pulse_len;
            while position < duration {
                let n = (duration - position).min(self.silence.len());
                if !write_all(&mut self.output, &self.silence[..n], self.retry_wait, stop)? {
                    break;
                }
                position += n;
            }
        }

        tracing::info!(
            pulses = stats.pulses,
            delayed = stats.delayed,
            "Playback loop stopped"
        );
        Ok(stats)
    }
}

/// Write every sample, sleeping while the device is full.
/// Returns `false` if stopped before finishing.
fn write_all<O: AudioOutput>(
    output: &mut O,
    mut samples: &[i16],
    retry_wait: Duration,
    stop: &StopSignal,
) -> Result<bool, AudioError> {
    while !samples.is_empty() {
        if stop.is_stopped() {
            return Ok(false);
        }
        let n = match output.write(samples) {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(error = %e, "Playback device failed");
                return Err(e);
            }
        };
        if n == 0 {
            std::thread::sleep(retry_wait);
        }
        samples = &samples[n..];
    }
    Ok(true)
}

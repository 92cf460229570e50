//! Microphone capture loop with overlap-save windowing
//!
//! The loop fills a stereo buffer of `(window + operator) * 2` samples. Once
//! full, the whole buffer is dispatched, the oldest `window * 2` samples are
//! dropped and the newest `operator * 2` slide to the front. Every dispatched
//! buffer therefore starts with one operator length of history.

use super::worker::StopSignal;
use super::{AudioError, AudioInput};
use std::time::Duration;

/// Capture buffer geometry and retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Per-channel frames in one pulse interval
    pub window_frames: usize,
    /// Per-channel length of the pulse operator
    pub operator_len: usize,
    /// Sleep after a short read
    pub retry_wait: Duration,
    /// Consecutive empty reads tolerated before giving up, `None` waits forever
    pub max_idle_retries: Option<u32>,
}

impl CaptureConfig {
    /// Interleaved length of the capture buffer
    pub fn buffer_len(&self) -> usize {
        (self.window_frames + self.operator_len) * 2
    }

    /// Interleaved samples discarded after each dispatch
    pub fn advance(&self) -> usize {
        self.window_frames * 2
    }
}

/// Counters reported when the loop exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// Buffers handed to the dispatcher
    pub windows: u64,
    /// Interleaved samples read from the device
    pub samples: u64,
}

/// Real-time capture loop, consuming its input on exit
pub struct CaptureLoop<I: AudioInput> {
    input: I,
    config: CaptureConfig,
}

impl<I: AudioInput> CaptureLoop<I> {
    pub fn new(input: I, config: CaptureConfig) -> Self {
        Self { input, config }
    }

    /// Run until `stop` is raised or the input fails
    ///
    /// `dispatch` receives every full buffer. It must copy what it needs and
    /// return quickly, since the buffer is slid in place right after.
    ///
    /// # Errors
    /// A device error ends the loop immediately and is returned as is.
    /// [`AudioError::Stalled`] is returned once `max_idle_retries` consecutive
    /// reads came back empty.
    pub fn run<F>(mut self, stop: &StopSignal, mut dispatch: F) -> Result<CaptureStats, AudioError>
    where
        F: FnMut(&[i16]),
    {
        let total = self.config.buffer_len();
        let advance = self.config.advance();
        let mut buffer = vec![0i16; total];
        let mut position = 0usize;
        let mut idle = 0u32;
        let mut stats = CaptureStats::default();

        tracing::info!(
            window_frames = self.config.window_frames,
            operator_len = self.config.operator_len,
            buffer_len = total,
            "Capture loop started"
        );

        while !stop.is_stopped() {
            let read = match self.input.read(&mut buffer[position..]) {
                Ok(n) => n,
                Err(e) => {
                    tracing::error!(error = %e, windows = stats.windows, "Capture device failed");
                    return Err(e);
                }
            };

            if read == 0 {
                idle += 1;
                if let Some(limit) = self.config.max_idle_retries {
                    if idle > limit {
                        tracing::error!(retries = limit, "Capture input stalled");
                        return Err(AudioError::Stalled { retries: limit });
                    }
                }
                std::thread::sleep(self.config.retry_wait);
                continue;
            }

            if stats.samples == 0 {
                tracing::info!(samples = read, "Capture received first data");
            }
            idle = 0;
            position += read;
            stats.samples += read as u64;

            if position < total {
                std::thread::sleep(self.config.retry_wait);
                continue;
            }

            dispatch(&buffer);
            stats.windows += 1;

            buffer.copy_within(advance.., 0);
            position = total - advance;
        }

        tracing::info!(
            windows = stats.windows,
            samples = stats.samples,
            "Capture loop stopped"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Yields a counting sequence in fixed-size chunks, then fails or stalls
    struct CountingInput {
        next: i16,
        chunk: usize,
        remaining: usize,
        fail_at_end: bool,
    }

    impl AudioInput for CountingInput {
        fn read(&mut self, buf: &mut [i16]) -> Result<usize, AudioError> {
            if self.remaining == 0 {
                return if self.fail_at_end {
                    Err(AudioError::Stream("unplugged".into()))
                } else {
                    Ok(0)
                };
            }
            let n = buf.len().min(self.chunk).min(self.remaining);
            for slot in &mut buf[..n] {
                *slot = self.next;
                self.next = self.next.wrapping_add(1);
            }
            self.remaining -= n;
            Ok(n)
        }
    }

    fn config() -> CaptureConfig {
        CaptureConfig {
            window_frames: 4,
            operator_len: 2,
            retry_wait: Duration::from_millis(1),
            max_idle_retries: Some(3),
        }
    }

    #[test]
    fn test_buffer_geometry() {
        let config = config();
        assert_eq!(config.buffer_len(), 12);
        assert_eq!(config.advance(), 8);
    }

    #[test]
    fn test_overlap_save_windows() {
        let input = CountingInput {
            next: 0,
            chunk: 5,
            remaining: 28,
            fail_at_end: true,
        };
        let mut windows = Vec::new();
        let result = CaptureLoop::new(input, config())
            .run(&StopSignal::new(), |buf| windows.push(buf.to_vec()));

        assert!(matches!(result, Err(AudioError::Stream(_))));
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0], (0..12).collect::<Vec<i16>>());
        // Newest four samples carried over as history
        assert_eq!(windows[1], (8..20).collect::<Vec<i16>>());
        assert_eq!(windows[2], (16..28).collect::<Vec<i16>>());
    }

    #[test]
    fn test_stalled_input_gives_up() {
        let input = CountingInput {
            next: 0,
            chunk: 12,
            remaining: 12,
            fail_at_end: false,
        };
        let mut dispatched = 0;
        let result = CaptureLoop::new(input, config()).run(&StopSignal::new(), |_| dispatched += 1);

        assert!(matches!(result, Err(AudioError::Stalled { retries: 3 })));
        assert_eq!(dispatched, 1);
    }

    #[test]
    fn test_stop_signal_ends_loop() {
        let input = CountingInput {
            next: 0,
            chunk: 12,
            remaining: usize::MAX,
            fail_at_end: false,
        };
        let stop = StopSignal::new();
        let mut seen = 0u64;
        let stats = CaptureLoop::new(input, config())
            .run(&stop, |_| {
                seen += 1;
                if seen == 5 {
                    stop.stop();
                }
            })
            .unwrap();

        assert_eq!(stats.windows, 5);
    }
}

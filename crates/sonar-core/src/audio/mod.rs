//! Audio I/O: device backend and the two real-time sonar loops
//!
//! The loops talk to blocking-style [`AudioInput`]/[`AudioOutput`] sources so
//! they can be driven by the cpal ring-buffer bridge in [`device`], a replayed
//! recording, or an in-memory fake in tests.

pub mod capture;
pub mod device;
pub mod playback;
pub mod worker;

use thiserror::Error;

/// Errors raised by audio devices and the loops that drive them
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No audio devices found")]
    NoDevicesFound,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("No input channels available")]
    NoInputChannels,

    #[error("No output channels available")]
    NoOutputChannels,

    #[error("Audio stream error: {0}")]
    Stream(String),

    #[error("Input stalled after {retries} empty reads")]
    Stalled { retries: u32 },

    #[error("Device closed")]
    Closed,
}

/// Blocking-style source of interleaved stereo i16 samples
pub trait AudioInput: Send {
    /// Read up to `buf.len()` samples, returning how many were written.
    /// Zero means nothing is available yet; an error is fatal to the caller.
    fn read(&mut self, buf: &mut [i16]) -> Result<usize, AudioError>;
}

/// Blocking-style sink for mono i16 samples
pub trait AudioOutput: Send {
    /// Write up to `buf.len()` samples, returning how many were accepted.
    /// Zero means the device buffer is full; an error is fatal to the caller.
    fn write(&mut self, buf: &[i16]) -> Result<usize, AudioError>;
}

impl<T: AudioInput + ?Sized> AudioInput for Box<T> {
    fn read(&mut self, buf: &mut [i16]) -> Result<usize, AudioError> {
        (**self).read(buf)
    }
}

impl<T: AudioOutput + ?Sized> AudioOutput for Box<T> {
    fn write(&mut self, buf: &[i16]) -> Result<usize, AudioError> {
        (**self).write(buf)
    }
}

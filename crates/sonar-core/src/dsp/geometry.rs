//! Conversions between echo sample indices and physical distances
//!
//! A sample index counts per-channel frames since pulse emission. The echo
//! travels to the reflector and back, so the one-way distance is half of the
//! path covered during that many frames.

use std::sync::atomic::{AtomicU32, Ordering};

/// Speed of sound in air in meters/second
pub const SPEED_OF_SOUND: f32 = 340.29;

/// Round-trip time-of-flight geometry for one sample rate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EchoGeometry {
    /// Sample rate in Hz
    pub sample_rate: f32,
    /// Propagation speed in meters/second
    pub speed: f32,
}

impl EchoGeometry {
    pub fn new(sample_rate: f32, speed: f32) -> Self {
        Self { sample_rate, speed }
    }

    /// Distance in meters to a reflector whose echo arrives at `sample_index`
    ///
    /// # Example
    /// ```
    /// use sonar_core::dsp::geometry::EchoGeometry;
    ///
    /// let geometry = EchoGeometry::new(48000.0, 340.29);
    /// let d = geometry.distance(480.0);
    /// assert!((d - 1.70145).abs() < 1e-4);
    /// ```
    #[inline]
    pub fn distance(&self, sample_index: f32) -> f32 {
        sample_index / (2.0 * self.sample_rate) * self.speed
    }

    /// Sample index where an echo from a reflector at `distance` meters arrives
    #[inline]
    pub fn sample_index(&self, distance: f32) -> f32 {
        distance * 2.0 * self.sample_rate / self.speed
    }

    /// One-way distance covered in `samples` frames (microphone to microphone)
    #[inline]
    pub fn one_way(&self, samples: f32) -> f32 {
        samples / self.sample_rate * self.speed
    }
}

/// Distance between the two microphones in meters
///
/// Read by the sonogram reducer for every frame and written by the
/// calibrator once it has measured the inter-channel offset, so it is a
/// single atomic word rather than a locked value.
#[derive(Debug)]
pub struct Baseline(AtomicU32);

impl Baseline {
    pub fn new(meters: f32) -> Self {
        Self(AtomicU32::new(meters.to_bits()))
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, meters: f32) {
        self.0.store(meters.to_bits(), Ordering::Relaxed);
    }
}

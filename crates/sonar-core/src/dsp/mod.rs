//! Signal processing
//!
//! - Chirp synthesis for the outgoing pulse and matched-filter operator ([`pulse`])
//! - Sample index and distance conversions ([`geometry`])
//! - Per-channel matched filter over interleaved stereo samples ([`matched`])
//! - Dual-microphone backprojection into a 2-D image ([`sonogram`])
//! - Single-channel range histogram ([`histogram`])
//! - FFT cross-correlation used by the calibrator ([`correlation`])
//! - In-place post-processing of reducer output ([`post`])

pub mod correlation;
pub mod geometry;
pub mod histogram;
pub mod matched;
pub mod post;
pub mod pulse;
pub mod sonogram;

//! Runtime statistics
//!
//! - Frame-rate counting filter with a short timestamped history ([`framerate`])

pub mod framerate;

pub use framerate::{FramerateCounter, RateSample};

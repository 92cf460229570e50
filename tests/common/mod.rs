//! In-memory speaker-to-microphone loopback for pipeline tests
//!
//! Whatever the speaker plays reaches microphone A after `latency_a` frames
//! and microphone B after `latency_b` frames. There is no clock: the speaker
//! may run at most `lead` frames ahead of capture, and capture can only read
//! frames whose delayed samples have been played.

#![allow(dead_code)]

use sonar::audio::{AudioError, AudioInput, AudioOutput};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Line {
    played: VecDeque<i16>,
    /// Absolute frame index of `played[0]`
    base: usize,
    written: usize,
    captured: usize,
    latency_a: usize,
    latency_b: usize,
    lead: usize,
    max_read: usize,
}

impl Line {
    fn sample(&self, t: usize, latency: usize) -> i16 {
        match t.checked_sub(latency) {
            Some(at) if at >= self.base => self.played.get(at - self.base).copied().unwrap_or(0),
            _ => 0,
        }
    }

    fn trim(&mut self) {
        let keep_from = self
            .captured
            .saturating_sub(self.latency_a.max(self.latency_b) + 1);
        while self.base < keep_from && !self.played.is_empty() {
            self.played.pop_front();
            self.base += 1;
        }
    }
}

/// Both ends of one loopback line
pub struct Loopback {
    line: Arc<Mutex<Line>>,
}

impl Loopback {
    /// # Arguments
    /// * `latency_a` / `latency_b` - Acoustic path per microphone in frames
    /// * `lead` - How far playback may run ahead of capture, in frames
    /// * `max_read` - Frames returned by one read at most
    pub fn new(latency_a: usize, latency_b: usize, lead: usize, max_read: usize) -> Self {
        Self {
            line: Arc::new(Mutex::new(Line {
                played: VecDeque::new(),
                base: 0,
                written: 0,
                captured: 0,
                latency_a,
                latency_b,
                lead,
                max_read: max_read.max(1),
            })),
        }
    }

    pub fn speaker(&self) -> Speaker {
        Speaker(Arc::clone(&self.line))
    }

    pub fn microphones(&self) -> Microphones {
        Microphones(Arc::clone(&self.line))
    }

    /// Frames played so far
    pub fn written(&self) -> usize {
        self.line.lock().unwrap().written
    }
}

/// Mono output end
pub struct Speaker(Arc<Mutex<Line>>);

impl AudioOutput for Speaker {
    fn write(&mut self, buf: &[i16]) -> Result<usize, AudioError> {
        let mut line = self.0.lock().unwrap();
        let room = (line.captured + line.lead).saturating_sub(line.written);
        let n = buf.len().min(room);
        line.played.extend(&buf[..n]);
        line.written += n;
        Ok(n)
    }
}

/// Stereo input end
pub struct Microphones(Arc<Mutex<Line>>);

impl AudioInput for Microphones {
    fn read(&mut self, buf: &mut [i16]) -> Result<usize, AudioError> {
        let mut line = self.0.lock().unwrap();
        let reachable = line.written + line.latency_a.min(line.latency_b);
        let frames = (buf.len() / 2)
            .min(reachable.saturating_sub(line.captured))
            .min(line.max_read);

        for (k, pair) in buf.chunks_exact_mut(2).take(frames).enumerate() {
            let t = line.captured + k;
            pair[0] = line.sample(t, line.latency_a);
            pair[1] = line.sample(t, line.latency_b);
        }
        line.captured += frames;
        line.trim();
        Ok(frames * 2)
    }
}

/// Output that accepts everything, slowly
pub struct NullSpeaker;

impl AudioOutput for NullSpeaker {
    fn write(&mut self, buf: &[i16]) -> Result<usize, AudioError> {
        std::thread::sleep(Duration::from_millis(1));
        Ok(buf.len())
    }
}

/// Input that yields silence for a number of reads, then fails
pub struct FailingMicrophones {
    pub reads_left: usize,
}

impl AudioInput for FailingMicrophones {
    fn read(&mut self, buf: &mut [i16]) -> Result<usize, AudioError> {
        if self.reads_left == 0 {
            return Err(AudioError::Closed);
        }
        self.reads_left -= 1;
        buf.fill(0);
        Ok(buf.len())
    }
}

/// Poll `condition` every 5 ms until it holds or `timeout` passes
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

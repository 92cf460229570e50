//! Named loop threads with a cooperative stop flag and bounded-grace shutdown

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Cooperative stop flag shared between a loop and its owner
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Handle to a spawned loop thread
///
/// The loop's return value is kept so the owner can inspect how it ended.
/// A panic inside the loop is logged and reported as `None`.
pub struct LoopHandle<T> {
    name: String,
    stop: StopSignal,
    thread: Option<JoinHandle<Option<T>>>,
}

impl<T: Send + 'static> LoopHandle<T> {
    /// Spawn `f` on a thread called `name`, passing it the stop signal
    pub fn spawn<F>(name: &str, f: F) -> Self
    where
        F: FnOnce(StopSignal) -> T + Send + 'static,
    {
        let stop = StopSignal::new();
        let signal = stop.clone();
        let thread_name = name.to_string();

        let thread = std::thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(signal)));
                match result {
                    Ok(value) => {
                        tracing::info!(thread = %thread_name, "Loop thread exited normally");
                        Some(value)
                    }
                    Err(panic_info) => {
                        let msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                            s.to_string()
                        } else if let Some(s) = panic_info.downcast_ref::<String>() {
                            s.clone()
                        } else {
                            "unknown panic".to_string()
                        };
                        tracing::error!(thread = %thread_name, panic = %msg, "Loop thread PANICKED");
                        None
                    }
                }
            })
            .expect("Failed to spawn sonar loop thread");

        Self {
            name: name.to_string(),
            stop,
            thread: Some(thread),
        }
    }

    /// Check if the loop thread is still running
    pub fn is_alive(&self) -> bool {
        self.thread
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Signal the loop and wait up to `grace` for it to finish
    ///
    /// Returns the loop's result if it exited in time. A loop still blocked
    /// after the grace period is detached and considered terminated.
    pub fn stop(&mut self, grace: Duration) -> Option<T> {
        self.stop.stop();
        let handle = self.thread.take()?;

        let deadline = Instant::now() + grace;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                tracing::warn!(
                    thread = %self.name,
                    grace_ms = grace.as_millis() as u64,
                    "Loop thread did not stop within grace period, detaching"
                );
                return None;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        handle.join().ok().flatten()
    }
}

impl<T> Drop for LoopHandle<T> {
    fn drop(&mut self) {
        // Detach rather than block in drop
        self.stop.stop();
    }
}

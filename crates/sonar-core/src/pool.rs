//! Bounded worker pool with discard-oldest admission, plus a frame arena
//!
//! Only the freshest acoustic frame is worth processing. When the submission
//! queue is full, [`WorkerPool::submit`] evicts the oldest job that has not
//! started yet and queues the new one in its place, so the caller (the
//! capture thread) never blocks.
//!
//! [`FramePool`] hands out [`FrameLease`]s. A lease owns its frame
//! exclusively and returns it to the pool when dropped, which is how a
//! frame moves from the capture thread to exactly one worker and back.

use crate::dsp::pulse::PulseOperator;
use crate::frame::Frame;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Unit of work executed by the pool
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Outcome of a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Queued without evicting anything
    Queued,
    /// Queued after evicting the oldest pending job
    DisplacedOldest,
    /// The pool is shut down
    Rejected,
}

/// Fixed-size thread pool with a bounded, discard-oldest queue
pub struct WorkerPool {
    tx: Option<Sender<Job>>,
    /// Held so the submitter can evict from the head of the queue
    rx: Receiver<Job>,
    workers: Vec<JoinHandle<()>>,
    capacity: usize,
    discarded: Arc<AtomicU64>,
}

impl WorkerPool {
    /// Spawn the worker threads
    ///
    /// # Arguments
    /// * `workers` - Number of threads, 0 for one per available core
    /// * `queue_capacity` - Maximum number of pending (not yet started) jobs
    pub fn new(workers: usize, queue_capacity: usize) -> Self {
        let workers = if workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            workers
        };
        let capacity = queue_capacity.max(1);
        let (tx, rx) = crossbeam_channel::bounded::<Job>(capacity);

        let handles = (0..workers)
            .map(|index| {
                let rx = rx.clone();
                std::thread::Builder::new()
                    .name(format!("sonar-worker-{}", index))
                    .spawn(move || worker_loop(index, rx))
                    .expect("Failed to spawn sonar worker thread")
            })
            .collect();

        tracing::debug!(workers, capacity, "Worker pool started");

        Self {
            tx: Some(tx),
            rx,
            workers: handles,
            capacity,
            discarded: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queue a job, evicting the oldest pending job if the queue is full
    pub fn submit<F>(&self, job: F) -> Admission
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(tx) = self.tx.as_ref() else {
            return Admission::Rejected;
        };

        let mut job: Job = Box::new(job);
        let mut displaced = false;
        loop {
            match tx.try_send(job) {
                Ok(()) => {
                    return if displaced {
                        Admission::DisplacedOldest
                    } else {
                        Admission::Queued
                    };
                }
                Err(TrySendError::Full(returned)) => {
                    job = returned;
                    // A worker may empty the slot first; then the retry simply succeeds
                    if self.rx.try_recv().is_ok() {
                        displaced = true;
                        let total = self.discarded.fetch_add(1, Ordering::Relaxed) + 1;
                        tracing::trace!(total, "Discarded stale frame job");
                        if total % 100 == 0 {
                            tracing::debug!(discarded = total, "Worker pool shedding load");
                        }
                    }
                }
                Err(TrySendError::Disconnected(_)) => return Admission::Rejected,
            }
        }
    }

    /// Jobs waiting for a worker
    pub fn queued(&self) -> usize {
        self.rx.len()
    }

    /// Jobs evicted by newer submissions since the pool started
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stop accepting jobs, let workers drain the queue and join them
    pub fn shutdown(&mut self) {
        if self.tx.take().is_none() {
            return;
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        tracing::debug!(discarded = self.discarded(), "Worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .field("capacity", &self.capacity)
            .field("queued", &self.queued())
            .field("discarded", &self.discarded())
            .finish()
    }
}

fn worker_loop(index: usize, rx: Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job));
        if let Err(panic_info) = result {
            let msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic_info.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            tracing::error!(worker = index, panic = %msg, "Frame job PANICKED");
        }
    }
}

/// Recycled frames, all sized for one capture window
#[derive(Debug)]
pub struct FramePool {
    free_tx: Sender<Frame>,
    free_rx: Receiver<Frame>,
    sample_rate: f32,
    operator: PulseOperator,
    sample_count: usize,
    allocated: AtomicUsize,
}

impl FramePool {
    /// Create an empty pool keeping at most `capacity` idle frames
    pub fn new(
        sample_rate: f32,
        operator: PulseOperator,
        sample_count: usize,
        capacity: usize,
    ) -> Arc<Self> {
        let (free_tx, free_rx) = crossbeam_channel::bounded(capacity.max(1));
        Arc::new(Self {
            free_tx,
            free_rx,
            sample_rate,
            operator,
            sample_count,
            allocated: AtomicUsize::new(0),
        })
    }

    /// Take an idle frame, allocating a new one when none is available
    pub fn checkout(self: &Arc<Self>) -> FrameLease {
        let frame = match self.free_rx.try_recv() {
            Ok(frame) => frame,
            Err(_) => {
                let total = self.allocated.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::trace!(total, "Allocated frame");
                Frame::new(self.sample_rate, self.operator.clone(), self.sample_count)
            }
        };
        FrameLease {
            frame: Some(frame),
            pool: Arc::clone(self),
        }
    }

    /// Frames ever allocated by this pool
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Idle frames ready for checkout
    pub fn idle(&self) -> usize {
        self.free_rx.len()
    }

    /// Interleaved sample count of every frame in the pool
    pub fn sample_count(&self) -> usize {
        self.sample_count
    }
}

/// Exclusive handle to a pooled frame
pub struct FrameLease {
    frame: Option<Frame>,
    pool: Arc<FramePool>,
}

impl Deref for FrameLease {
    type Target = Frame;

    fn deref(&self) -> &Frame {
        // Only taken in Drop
        self.frame.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for FrameLease {
    fn deref_mut(&mut self) -> &mut Frame {
        self.frame.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for FrameLease {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            // A full free list means the frame is surplus
            let _ = self.pool.free_tx.try_send(frame);
        }
    }
}

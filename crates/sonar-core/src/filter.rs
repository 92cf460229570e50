//! Pluggable frame filters and their ordered composition
//!
//! A filter is anything that can process a [`Frame`] in place. Filters are
//! shared by all workers, so they take `&self` and keep any mutable state
//! behind their own synchronization.

use crate::frame::Frame;
use crate::recording::RecordingError;
use std::sync::Arc;
use thiserror::Error;

/// Errors that abort processing of a single frame
#[derive(Error, Debug)]
pub enum FilterError {
    #[error("Canvas {width}x{height} has no cells")]
    EmptyCanvas { width: i32, height: i32 },

    #[error("Window {width}x{height} is empty")]
    EmptyWindow { width: i32, height: i32 },

    #[error("Operator of {operator} samples does not fit a frame of {frames} frames")]
    OperatorTooLong { operator: usize, frames: usize },

    #[error("Recording failed: {0}")]
    Recording(#[from] RecordingError),
}

/// A unit of frame processing
pub trait SignalFilter: Send + Sync {
    /// Process `frame` in place
    fn accept(&self, frame: &mut Frame) -> Result<(), FilterError>;
}

impl<T: SignalFilter + ?Sized> SignalFilter for Arc<T> {
    fn accept(&self, frame: &mut Frame) -> Result<(), FilterError> {
        (**self).accept(frame)
    }
}

/// Ordered composition of filters
///
/// Members run strictly in construction order; the first error aborts the
/// frame and is returned to the caller.
///
/// # Example
/// ```
/// use sonar_core::dsp::matched::MatchedFilter;
/// use sonar_core::dsp::post::SmoothenFilter;
/// use sonar_core::filter::FilterChain;
///
/// let chain = FilterChain::new()
///     .with(MatchedFilter)
///     .with(SmoothenFilter::default());
/// assert_eq!(chain.len(), 2);
/// ```
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn SignalFilter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a filter, builder style
    pub fn with<F: SignalFilter + 'static>(mut self, filter: F) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    /// Append a filter the caller keeps a handle to (e.g. a recording sink)
    pub fn with_shared(mut self, filter: Arc<dyn SignalFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn push(&mut self, filter: Arc<dyn SignalFilter>) {
        self.filters.push(filter);
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl SignalFilter for FilterChain {
    fn accept(&self, frame: &mut Frame) -> Result<(), FilterError> {
        for filter in &self.filters {
            filter.accept(frame)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterChain")
            .field("filters", &self.filters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::pulse::PulseOperator;
    use std::sync::Mutex;

    struct Tag(u8, Arc<Mutex<Vec<u8>>>);

    impl SignalFilter for Tag {
        fn accept(&self, _frame: &mut Frame) -> Result<(), FilterError> {
            self.1.lock().unwrap().push(self.0);
            Ok(())
        }
    }

    struct Fail;

    impl SignalFilter for Fail {
        fn accept(&self, frame: &mut Frame) -> Result<(), FilterError> {
            Err(FilterError::EmptyCanvas {
                width: frame.canvas.width(),
                height: frame.canvas.height(),
            })
        }
    }

    fn frame() -> Frame {
        Frame::new(48000.0, PulseOperator::from_samples(vec![1.0]), 4)
    }

    #[test]
    fn test_chain_runs_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = FilterChain::new()
            .with(Tag(1, Arc::clone(&log)))
            .with(Tag(2, Arc::clone(&log)))
            .with(Tag(3, Arc::clone(&log)));

        chain.accept(&mut frame()).unwrap();
        chain.accept(&mut frame()).unwrap();

        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn test_failure_aborts_frame() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = FilterChain::new()
            .with(Tag(1, Arc::clone(&log)))
            .with(Fail)
            .with(Tag(3, Arc::clone(&log)));

        let result = chain.accept(&mut frame());
        assert!(matches!(result, Err(FilterError::EmptyCanvas { .. })));
        assert_eq!(*log.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_nested_chains() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let inner = FilterChain::new().with(Tag(2, Arc::clone(&log)));
        let chain = FilterChain::new()
            .with(Tag(1, Arc::clone(&log)))
            .with(inner)
            .with_shared(Arc::new(Tag(3, Arc::clone(&log))));

        chain.accept(&mut frame()).unwrap();
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
        assert!(!chain.is_empty());
    }
}

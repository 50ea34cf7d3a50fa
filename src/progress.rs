//! Progress reporting and cancellation boundary
//!
//! [`ProgressCallback`] is the only surface a UI needs to implement. Pipeline
//! code never calls it directly; it goes through a [`Reporter`], which keeps the
//! reported percentage non-decreasing across every phase of a run.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::session::OperationControl;

/// UI-facing progress sink.
pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, percent: u8, message: &str);

    fn on_complete(&self, message: &str);

    fn on_error(&self, message: &str);

    /// Polled at every loop boundary of a running operation.
    fn is_cancelled(&self) -> bool;

    /// Terminal notification for a cancelled run.
    fn on_cancelled(&self, message: &str) {
        self.on_error(message);
    }
}

/// Progress sink that drops everything. Never cancels.
pub struct SilentProgress;

impl ProgressCallback for SilentProgress {
    fn on_progress(&self, _percent: u8, _message: &str) {}
    fn on_complete(&self, _message: &str) {}
    fn on_error(&self, _message: &str) {}
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Percentage range allotted to one pipeline phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseBand {
    pub start: u8,
    pub end: u8,
}

impl PhaseBand {
    pub const fn new(start: u8, end: u8) -> Self {
        Self { start, end }
    }

    /// Map `fraction` (clamped to 0..=1) into this band.
    pub fn at_fraction(&self, fraction: f64) -> u8 {
        let span = self.end.saturating_sub(self.start) as f64;
        let offset = (span * fraction.clamp(0.0, 1.0)).floor() as u8;
        (self.start + offset).min(self.end)
    }
}

/// Phase bands, in pipeline order.
pub mod phases {
    use super::PhaseBand;

    pub const ARCHIVE: PhaseBand = PhaseBand::new(0, 30);
    pub const DOWNLOAD: PhaseBand = PhaseBand::new(30, 80);
    pub const EXTRACT: PhaseBand = PhaseBand::new(80, 95);
    pub const CLEANUP: PhaseBand = PhaseBand::new(95, 100);
}

/// Handle passed down to every pipeline step.
///
/// Cheap to clone; clones share the last-reported percentage.
#[derive(Clone)]
pub struct Reporter {
    callback: Arc<dyn ProgressCallback>,
    control: Arc<OperationControl>,
    last_percent: Arc<AtomicU8>,
}

impl Reporter {
    /// Bind `callback` to a session's control. The control starts observing
    /// the callback's cancellation predicate.
    pub fn new(callback: Arc<dyn ProgressCallback>, control: Arc<OperationControl>) -> Self {
        control.observe(callback.clone());
        Self {
            callback,
            control,
            last_percent: Arc::new(AtomicU8::new(0)),
        }
    }

    /// Reporter for work that is not bound to a session (bulk staging).
    pub fn standalone(callback: Arc<dyn ProgressCallback>) -> Self {
        Self::new(callback, Arc::new(OperationControl::new()))
    }

    /// Report progress. Values lower than what was already reported are
    /// raised to the previous value.
    pub fn progress(&self, percent: u8, message: &str) {
        let percent = percent.min(100);
        let previous = self.last_percent.fetch_max(percent, Ordering::SeqCst);
        self.callback.on_progress(previous.max(percent), message);
    }

    /// Re-emit the current percentage with a new message.
    pub fn notice(&self, message: &str) {
        self.callback.on_progress(self.current(), message);
    }

    pub fn current(&self) -> u8 {
        self.last_percent.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }

    pub fn control(&self) -> &Arc<OperationControl> {
        &self.control
    }
}

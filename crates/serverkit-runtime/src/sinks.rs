//! Ready-made status sinks and progress reporters.

use std::sync::Arc;

use parking_lot::Mutex;
use serverkit_core::{ProgressReporter, RecordingStatus, Severity, StatusSink};
use tracing::{error, info, warn};

/// Status sink that writes everything to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogStatus;

impl StatusSink for LogStatus {
    fn notify(&mut self, severity: Severity, message: &str) {
        match severity {
            Severity::Info => info!(target: "serverkit::status", "{message}"),
            Severity::Warning => warn!(target: "serverkit::status", "{message}"),
            Severity::Error => error!(target: "serverkit::status", "{message}"),
        }
    }

    fn show_overlay(&mut self, text: &str) {
        info!(target: "serverkit::status", overlay = %text, "overlay");
    }

    fn hide_overlay(&mut self) {}
}

/// Everything a [`Recorder`] has seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recording {
    /// Notifications and overlay state.
    pub status: RecordingStatus,
    /// `on_progress` calls in order.
    pub progress: Vec<(usize, usize)>,
    /// `on_start` calls.
    pub started: usize,
    /// `on_complete` calls.
    pub completed: usize,
}

/// Shared status sink and progress reporter that records every call.
///
/// Clones share the same recording, so one handle can be given to a
/// workbench while another is kept for inspection.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    inner: Arc<Mutex<Recording>>,
}

impl Recorder {
    /// Fresh, empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything recorded so far.
    #[must_use]
    pub fn snapshot(&self) -> Recording {
        self.inner.lock().clone()
    }
}

impl StatusSink for Recorder {
    fn notify(&mut self, severity: Severity, message: &str) {
        self.inner.lock().status.notify(severity, message);
    }

    fn show_overlay(&mut self, text: &str) {
        self.inner.lock().status.show_overlay(text);
    }

    fn hide_overlay(&mut self) {
        self.inner.lock().status.hide_overlay();
    }
}

impl ProgressReporter for Recorder {
    fn on_start(&self) {
        self.inner.lock().started += 1;
    }

    fn on_progress(&self, current: usize, total: usize) {
        self.inner.lock().progress.push((current, total));
    }

    fn on_complete(&self) {
        self.inner.lock().completed += 1;
    }
}

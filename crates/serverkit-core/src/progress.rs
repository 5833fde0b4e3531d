//! Callbacks the merge engine and task manager report through.

use crate::types::Severity;

/// Receives progress for one run at a time.
///
/// `on_start` and `on_complete` bracket a run. For tiled results
/// `total` is the tile count; for untiled results it is `0` and
/// `current` counts results seen so far.
pub trait ProgressReporter: Send + Sync {
    /// A run started.
    fn on_start(&self) {}

    /// `current` of `total` steps are done.
    fn on_progress(&self, current: usize, total: usize);

    /// The run ended, however it ended.
    fn on_complete(&self) {}
}

/// A reporter that drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn on_progress(&self, _current: usize, _total: usize) {}
}

/// User-facing status channel: notifications and transient overlay text.
pub trait StatusSink {
    /// Show a notification.
    fn notify(&mut self, severity: Severity, message: &str);

    /// Replace the overlay text.
    fn show_overlay(&mut self, text: &str);

    /// Clear the overlay.
    fn hide_overlay(&mut self);
}

/// Status sink that records everything it is told.
///
/// Used by tests and by headless callers that inspect the status
/// after a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordingStatus {
    /// Notifications in arrival order.
    pub notifications: Vec<(Severity, String)>,
    /// Current overlay text, if shown.
    pub overlay: Option<String>,
}

impl StatusSink for RecordingStatus {
    fn notify(&mut self, severity: Severity, message: &str) {
        self.notifications.push((severity, message.to_owned()));
    }

    fn show_overlay(&mut self, text: &str) {
        self.overlay = Some(text.to_owned());
    }

    fn hide_overlay(&mut self) {
        self.overlay = None;
    }
}

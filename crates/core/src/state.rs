//! State shared between a watcher's worker thread and its owner

use crate::error::WatchError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Message reported by [`WatcherState::error_message`] before a successful start
pub const NOT_STARTED_MESSAGE: &str = "failed to start watcher";

/// Running flag, start latch and last error of one watcher
///
/// The flags are atomics; the error sits behind a lock so readers always get
/// a whole value.
#[derive(Debug, Default)]
pub struct WatcherState {
    running: AtomicBool,
    started: AtomicBool,
    last_error: Mutex<Option<WatchError>>,
}

impl WatcherState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    /// Latch that the watcher came up successfully at least once
    pub fn mark_started(&self) {
        self.started.store(true, Ordering::Release);
    }

    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Forget a previous run before starting again
    pub fn reset(&self) {
        self.started.store(false, Ordering::Release);
        *self.last_error.lock() = None;
    }

    /// Record an error without touching the running flag
    pub fn record_error(&self, error: WatchError) {
        warn!("Watcher error: {}", error);
        *self.last_error.lock() = Some(error);
    }

    /// Record a fatal error and clear the running flag
    pub fn fail(&self, error: WatchError) {
        self.record_error(error);
        self.set_running(false);
    }

    /// Snapshot of the last recorded error
    pub fn last_error(&self) -> Option<WatchError> {
        self.last_error.lock().clone()
    }

    /// Error text for the owner
    ///
    /// Returns [`NOT_STARTED_MESSAGE`] if the watcher never started, otherwise
    /// the last recorded error, if any.
    pub fn error_message(&self) -> Option<String> {
        if !self.has_started() {
            return Some(NOT_STARTED_MESSAGE.to_string());
        }
        self.last_error().map(|e| e.to_string())
    }
}

/// Caller-owned switch for file-level event emission
///
/// Backends poll it for every batch; flipping it never tears the watch down.
#[derive(Debug, Clone)]
pub struct EmissionToggle(Arc<AtomicBool>);

impl EmissionToggle {
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    pub fn enable(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn disable(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for EmissionToggle {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message_before_start() {
        let state = WatcherState::new();
        assert_eq!(state.error_message().as_deref(), Some(NOT_STARTED_MESSAGE));

        // A specific setup error still reads as a failed start
        state.record_error(WatchError::NotFound("/x".into()));
        assert_eq!(state.error_message().as_deref(), Some(NOT_STARTED_MESSAGE));
        assert_eq!(state.last_error(), Some(WatchError::NotFound("/x".into())));
    }

    #[test]
    fn test_error_message_after_start() {
        let state = WatcherState::new();
        state.set_running(true);
        state.mark_started();
        assert_eq!(state.error_message(), None);

        state.fail(WatchError::RestartRequired);
        assert!(!state.is_running());
        assert_eq!(
            state.error_message().as_deref(),
            Some("buffer filled up and service needs a restart")
        );
    }

    #[test]
    fn test_reset_clears_previous_run() {
        let state = WatcherState::new();
        state.mark_started();
        state.fail(WatchError::UnexpectedShutdown);

        state.reset();
        assert!(!state.has_started());
        assert_eq!(state.last_error(), None);
    }

    #[test]
    fn test_toggle_is_shared_between_clones() {
        let toggle = EmissionToggle::default();
        let seen_by_backend = toggle.clone();
        assert!(seen_by_backend.is_enabled());

        toggle.disable();
        assert!(!seen_by_backend.is_enabled());
        toggle.enable();
        assert!(seen_by_backend.is_enabled());
    }
}

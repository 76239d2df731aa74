//! File system watching for Sentinel
//!
//! This crate provides:
//! - A recursive inotify backend on Linux
//! - A `ReadDirectoryChangesW` backend on Windows
//! - The [`Sentinel`] supervisor with batched, debounced delivery
//!
//! Every backend writes canonical [`sentinel_core::Event`]s into an
//! [`EventQueue`] and reports through a shared [`WatcherState`].

pub mod debounce;
pub mod platform;
pub mod sentinel;
pub mod tree;

pub use sentinel::Sentinel;

use sentinel_core::{EventQueue, WatchError, WatcherConfig, WatcherState};
use std::path::Path;
use std::sync::Arc;

/// A recursive watcher over one platform facility
pub trait Backend: Send {
    /// Begin watching; setup errors are returned here
    fn start(&mut self) -> Result<(), WatchError>;

    /// Stop watching; no event is queued after this returns
    fn stop(&mut self);

    /// Canonical path of the watched root
    fn path(&self) -> &str;

    /// State shared with the backend's worker thread
    fn state(&self) -> Arc<WatcherState>;

    fn is_running(&self) -> bool {
        self.state().is_running()
    }

    /// Generic start failure before a successful start, otherwise the last
    /// recorded error
    fn error(&self) -> Option<String> {
        self.state().error_message()
    }

    fn last_error(&self) -> Option<WatchError> {
        self.state().last_error()
    }
}

#[cfg(target_os = "linux")]
pub type RecommendedWatcher = platform::linux::InotifyWatcher;

#[cfg(windows)]
pub type RecommendedWatcher = platform::windows::DirectoryChangesWatcher;

/// Create the backend for this platform, stopped
#[cfg(any(target_os = "linux", windows))]
pub fn platform_backend(
    root: &Path,
    sink: EventQueue,
    config: WatcherConfig,
) -> Result<Box<dyn Backend>, WatchError> {
    Ok(Box::new(RecommendedWatcher::new(root, sink, config)))
}

#[cfg(not(any(target_os = "linux", windows)))]
pub fn platform_backend(
    _root: &Path,
    _sink: EventQueue,
    _config: WatcherConfig,
) -> Result<Box<dyn Backend>, WatchError> {
    Err(WatchError::Unsupported)
}

//! Supervisor tying a platform backend to batched delivery
//!
//! [`Sentinel`] picks the backend for the current platform, watches either a
//! directory tree or a single file (through its parent directory), and hands
//! batches of events to a callback on a delivery thread.

use crate::debounce::{Callbacks, Debouncer, FileFilter};
use crate::{platform_backend, Backend};
use sentinel_core::event::canonical_path;
use sentinel_core::{EmissionToggle, Event, EventQueue, WatchError, WatcherConfig};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Watches a path and delivers batched events to a callback
pub struct Sentinel {
    path: PathBuf,
    backend: Box<dyn Backend>,
    queue: EventQueue,
    emission: EmissionToggle,
    filter: Option<FileFilter>,
    callbacks: Callbacks,
    debouncer: Debouncer,
}

impl Sentinel {
    /// Prepare a watch on `path`
    ///
    /// A directory is watched recursively. A file is watched through its
    /// parent and only events naming the file are delivered.
    pub fn new<F>(
        path: impl AsRef<Path>,
        mut config: WatcherConfig,
        on_events: F,
    ) -> Result<Self, WatchError>
    where
        F: FnMut(Vec<Event>) + Send + 'static,
    {
        let given = path.as_ref();
        let path = std::path::absolute(given).map_err(|e| WatchError::from_io(&e, given))?;
        let metadata = fs::metadata(&path).map_err(|e| WatchError::from_io(&e, &path))?;

        let (root, filter) = if metadata.is_dir() {
            (path.clone(), None)
        } else {
            let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
                return Err(WatchError::NotADirectory(path.clone()));
            };
            let filter = FileFilter {
                directory: canonical_path(parent),
                file: name.to_string_lossy().into_owned(),
            };
            debug!("Watching file {} through its parent", path.display());
            (parent.to_path_buf(), Some(filter))
        };

        let queue = EventQueue::new();
        let emission = config.emission();
        let debouncer = Debouncer::new(config.debounce());
        let backend = platform_backend(&root, queue.clone(), config)?;

        Ok(Self {
            path,
            backend,
            queue,
            emission,
            filter,
            callbacks: Callbacks::new(Box::new(on_events)),
            debouncer,
        })
    }

    /// Register a callback for the error that ends the watch
    ///
    /// Called at most once per start, after the events that preceded the
    /// error have been delivered.
    pub fn on_error<F>(self, on_error: F) -> Self
    where
        F: FnMut(WatchError) + Send + 'static,
    {
        self.callbacks.set_on_error(Box::new(on_error));
        self
    }

    /// Start the backend and the delivery thread
    pub fn start(&mut self) -> Result<(), WatchError> {
        if self.backend.is_running() {
            return Ok(());
        }
        // Flush and retire the delivery thread of a run that ended on its own
        self.debouncer.stop();
        self.backend.start()?;
        let started = self.debouncer.start(
            self.queue.clone(),
            self.backend.state(),
            self.filter.clone(),
            self.callbacks.clone(),
        );
        if let Err(err) = started {
            self.backend.stop();
            return Err(WatchError::io("failed to spawn delivery thread", &err));
        }
        info!("Sentinel watching {}", self.path.display());
        Ok(())
    }

    /// Stop watching; pending events are delivered before this returns
    pub fn stop(&mut self) {
        self.backend.stop();
        self.debouncer.stop();
    }

    /// Suppress file events without tearing the watch down
    pub fn pause(&self) {
        self.emission.disable();
    }

    pub fn resume(&self) {
        self.emission.enable();
    }

    pub fn is_paused(&self) -> bool {
        !self.emission.is_enabled()
    }

    pub fn is_running(&self) -> bool {
        self.backend.is_running()
    }

    /// The path given at construction, made absolute
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Canonical path of the directory the backend watches
    pub fn watched_root(&self) -> &str {
        self.backend.path()
    }

    pub fn error(&self) -> Option<String> {
        self.backend.error()
    }

    pub fn last_error(&self) -> Option<WatchError> {
        self.backend.last_error()
    }
}

impl Drop for Sentinel {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_path() {
        let err = Sentinel::new("/definitely/not/here", WatcherConfig::default(), |_| {})
            .err()
            .unwrap();
        assert!(matches!(err, WatchError::NotFound(_)));
    }

    #[cfg(any(target_os = "linux", windows))]
    #[test]
    fn test_file_path_watches_parent() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("notes.txt");
        fs::write(&file, "x").unwrap();

        let sentinel = Sentinel::new(&file, WatcherConfig::default(), |_| {}).unwrap();
        assert_eq!(sentinel.path(), file.as_path());
        assert_eq!(sentinel.watched_root(), canonical_path(dir.path()));
        assert_eq!(sentinel.filter.as_ref().unwrap().file, "notes.txt");
    }

    #[cfg(any(target_os = "linux", windows))]
    #[test]
    fn test_error_before_start() {
        let dir = TempDir::new().unwrap();
        let sentinel = Sentinel::new(dir.path(), WatcherConfig::default(), |_| {}).unwrap();
        assert!(!sentinel.is_running());
        assert_eq!(sentinel.error().as_deref(), Some("failed to start watcher"));
    }

    #[cfg(any(target_os = "linux", windows))]
    #[test]
    fn test_pause_and_resume() {
        let dir = TempDir::new().unwrap();
        let sentinel = Sentinel::new(dir.path(), WatcherConfig::default(), |_| {}).unwrap();
        sentinel.pause();
        assert!(sentinel.is_paused());
        sentinel.resume();
        assert!(!sentinel.is_paused());
    }
}

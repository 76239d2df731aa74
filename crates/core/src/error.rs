//! Watcher error taxonomy
//!
//! Errors fall in three groups:
//! 1. Setup errors, returned synchronously from `start()`
//! 2. Fatal runtime errors, recorded in the shared state by the worker thread
//! 3. Expected races, which never surface as errors at all

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors reported by a watcher backend
///
/// The type is `Clone` so the controlling thread can take a snapshot of the
/// last recorded error without holding the lock.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WatchError {
    /// Watched path does not exist
    #[error("path not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Watched path exists but is not a directory
    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    /// Not allowed to watch the path
    #[error("permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),

    /// The kernel refused another watch registration
    #[error("watch limit exceeded while watching {}", .0.display())]
    WatchLimitExceeded(PathBuf),

    /// The worker thread never reported that it was waiting for changes
    #[error("watcher is not started")]
    WatcherNotStarted,

    /// Too many changes to enumerate; the watcher must be recreated
    #[error("buffer filled up and service needs a restart")]
    RestartRequired,

    /// Re-arming with the reduced network buffer failed
    #[error("failed resizing buffers for network traffic")]
    NetworkBufferResizeFailed,

    /// The OS reported an error the watcher cannot recover from
    #[error("service shutdown unexpectedly")]
    UnexpectedShutdown,

    /// The watched root itself was deleted or moved away
    #[error("watched root was removed: {}", .0.display())]
    RootRemoved(PathBuf),

    /// No backend exists for this platform
    #[error("no watcher backend is available on this platform")]
    Unsupported,

    /// Any other I/O failure
    #[error("{context}: {message}")]
    Io { context: String, message: String },
}

impl WatchError {
    /// Map an I/O error raised while operating on `path`
    pub fn from_io(err: &io::Error, path: &Path) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => WatchError::NotFound(path.to_path_buf()),
            io::ErrorKind::PermissionDenied => WatchError::PermissionDenied(path.to_path_buf()),
            _ => WatchError::Io {
                context: format!("failed to watch {}", path.display()),
                message: err.to_string(),
            },
        }
    }

    /// Wrap an I/O error with a short description of what was attempted
    pub fn io(context: impl Into<String>, err: &io::Error) -> Self {
        WatchError::Io {
            context: context.into(),
            message: err.to_string(),
        }
    }

    /// Whether this error can only be raised while setting a watch up
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            WatchError::NotFound(_)
                | WatchError::NotADirectory(_)
                | WatchError::PermissionDenied(_)
                | WatchError::WatchLimitExceeded(_)
                | WatchError::Unsupported
        )
    }

    /// Whether the watcher must be recreated after this error
    pub fn requires_restart(&self) -> bool {
        matches!(
            self,
            WatchError::WatcherNotStarted
                | WatchError::RestartRequired
                | WatchError::NetworkBufferResizeFailed
                | WatchError::UnexpectedShutdown
                | WatchError::RootRemoved(_)
        )
    }
}

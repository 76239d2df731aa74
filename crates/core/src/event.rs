//! Canonical filesystem events
//!
//! Every backend, whatever its native record shape, reduces its output to
//! [`Event`]. Paths are UTF-8 and always use `/` as the separator.

use serde::Serialize;
use std::fmt;
use std::path::Path;

/// Canonical change kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    /// Entry appeared
    Created,
    /// Entry disappeared
    Deleted,
    /// Entry contents or metadata changed
    Modified,
    /// Entry renamed within one directory
    Renamed,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Action::Created => "CREATED",
            Action::Deleted => "DELETED",
            Action::Modified => "MODIFIED",
            Action::Renamed => "RENAMED",
        };
        f.write_str(label)
    }
}

/// A single normalized change notification
///
/// For [`Action::Renamed`], `file` holds the old name and `new_file` the new
/// one. Every other action leaves `new_file` empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Event {
    action: Action,
    directory: String,
    file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    new_file: Option<String>,
}

impl Event {
    /// Create a CREATED event
    pub fn created(directory: impl Into<String>, file: impl Into<String>) -> Self {
        Self::new(Action::Created, directory.into(), file.into(), None)
    }

    /// Create a DELETED event
    pub fn deleted(directory: impl Into<String>, file: impl Into<String>) -> Self {
        Self::new(Action::Deleted, directory.into(), file.into(), None)
    }

    /// Create a MODIFIED event
    pub fn modified(directory: impl Into<String>, file: impl Into<String>) -> Self {
        Self::new(Action::Modified, directory.into(), file.into(), None)
    }

    /// Create a RENAMED event from `old_file` to `new_file` inside `directory`
    pub fn renamed(
        directory: impl Into<String>,
        old_file: impl Into<String>,
        new_file: impl Into<String>,
    ) -> Self {
        Self::new(
            Action::Renamed,
            directory.into(),
            old_file.into(),
            Some(new_file.into()),
        )
    }

    fn new(action: Action, directory: String, file: String, new_file: Option<String>) -> Self {
        Self {
            action,
            directory,
            file,
            new_file,
        }
    }

    pub fn action(&self) -> Action {
        self.action
    }

    /// Absolute path of the directory containing the entry
    pub fn directory(&self) -> &str {
        &self.directory
    }

    /// Entry name (the old name for a rename)
    pub fn file(&self) -> &str {
        &self.file
    }

    /// New entry name, only set for renames
    pub fn new_file(&self) -> Option<&str> {
        self.new_file.as_deref()
    }

    /// Full path of the entry (the old path for a rename)
    pub fn path(&self) -> String {
        join(&self.directory, &self.file)
    }

    /// Whether this event names `file` in `directory` under either name
    pub fn mentions(&self, directory: &str, file: &str) -> bool {
        self.directory == directory
            && (self.file == file || self.new_file.as_deref() == Some(file))
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.new_file {
            Some(new_file) => write!(
                f,
                "{} {} -> {}",
                self.action,
                self.path(),
                join(&self.directory, new_file)
            ),
            None => write!(f, "{} {}", self.action, self.path()),
        }
    }
}

/// Join a canonical directory and an entry name
pub fn join(directory: &str, name: &str) -> String {
    if directory.ends_with('/') {
        format!("{}{}", directory, name)
    } else {
        format!("{}/{}", directory, name)
    }
}

/// Convert a native path into the canonical UTF-8, `/`-separated form
///
/// Non-UTF-8 sequences are replaced lossily. Backslashes are only treated as
/// separators on Windows; elsewhere they are legal filename characters.
pub fn canonical_path(path: &Path) -> String {
    let text = path.to_string_lossy();
    if cfg!(windows) {
        text.replace('\\', "/")
    } else {
        text.into_owned()
    }
}

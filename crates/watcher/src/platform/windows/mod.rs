//! Windows backend
//!
//! `ReadDirectoryChangesW` watches a whole subtree with one handle and fills a
//! caller buffer asynchronously. The worker loop and the record parser don't
//! depend on the OS and are built on every platform; only the change source
//! itself is Windows specific.

mod buffer;
pub mod records;
mod worker;

#[cfg(windows)]
mod source;

pub use buffer::BufferPair;
pub use worker::{ArmError, AsyncWatcher, ChangeSource, Completion, Interrupt, Wake};

#[cfg(windows)]
pub use source::{DirectoryChangeSource, SemaphoreInterrupt};

/// Recursive watcher over `ReadDirectoryChangesW`
#[cfg(windows)]
pub type DirectoryChangesWatcher = AsyncWatcher<DirectoryChangeSource>;

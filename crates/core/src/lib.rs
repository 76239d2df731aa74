//! Shared vocabulary for Sentinel watchers
//!
//! This crate provides:
//! - The canonical event model (CREATED/DELETED/MODIFIED/RENAMED)
//! - A thread-safe, ordered event sink
//! - The error taxonomy shared by every backend
//! - Watcher state shared between a backend thread and its owner
//! - Watcher configuration (TOML loadable)

pub mod config;
pub mod error;
pub mod event;
pub mod queue;
pub mod state;

// Re-exports
pub use config::{ConfigError, WatcherConfig};
pub use error::WatchError;
pub use event::{Action, Event};
pub use queue::EventQueue;
pub use state::{EmissionToggle, WatcherState};

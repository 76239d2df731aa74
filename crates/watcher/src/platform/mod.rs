//! Platform backends

#[cfg(target_os = "linux")]
pub mod linux;

pub mod windows;

//! Configuration command
//!
//! Shows the settings a watch would run with.

use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use sentinel_core::WatcherConfig;
use std::path::Path;

/// Defaults, or the given TOML file on top of them
pub fn load_config(path: Option<&Path>) -> Result<WatcherConfig> {
    match path {
        Some(path) => WatcherConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(WatcherConfig::default()),
    }
}

pub async fn run(path: Option<&Path>, raw: bool) -> Result<()> {
    let config = load_config(path)?;

    if raw {
        print!("{}", config.to_toml_string());
        return Ok(());
    }

    println!("{}", "Watcher Configuration".bold());
    match path {
        Some(path) => println!("{}: {}\n", "Source".dimmed(), path.display().dimmed()),
        None => println!("{}\n", "Source: built-in defaults".dimmed()),
    }

    println!(
        "  {} = {} {}",
        "debounce_ms".cyan(),
        config.debounce_ms,
        format!("({:?} between deliveries)", config.debounce()).dimmed()
    );
    println!(
        "  {} = {} {}",
        "buffer_size".cyan(),
        config.buffer_size,
        format!("({} KiB)", config.buffer_size / 1024).dimmed()
    );
    println!(
        "  {} = {} {}",
        "network_buffer_size".cyan(),
        config.network_buffer_size,
        format!("({} KiB)", config.network_buffer_size / 1024).dimmed()
    );
    println!(
        "  {} = {} {}",
        "start_timeout_ms".cyan(),
        config.start_timeout_ms,
        format!("({:?})", config.start_timeout()).dimmed()
    );
    println!("  {} = {}", "read_buffer_size".cyan(), config.read_buffer_size);
    println!("  {} = {}", "max_reads_per_cycle".cyan(), config.max_reads_per_cycle);
    println!("  {} = {}", "emit_file_events".cyan(), config.emit_file_events);

    Ok(())
}

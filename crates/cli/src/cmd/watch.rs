//! Watch a path and print its changes until Ctrl-C

use super::config::load_config;
use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use sentinel_core::{Action, Event};
use sentinel_watcher::Sentinel;
use std::io::Write;
use std::path::Path;
use tokio::sync::mpsc;
use tracing::info;

pub async fn run(
    path: &Path,
    config_path: Option<&Path>,
    debounce_ms: Option<u64>,
    json: bool,
) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(ms) = debounce_ms {
        config.debounce_ms = ms;
    }

    let (failure_tx, mut failure_rx) = mpsc::unbounded_channel();
    let mut sentinel = Sentinel::new(path, config, move |batch| print_batch(&batch, json))
        .with_context(|| format!("Cannot watch {}", path.display()))?
        .on_error(move |err| {
            let _ = failure_tx.send(err);
        });

    sentinel
        .start()
        .with_context(|| format!("Failed to start watching {}", path.display()))?;
    info!("Watching {}", sentinel.path().display());
    if !json {
        eprintln!(
            "{} {} {}",
            "Watching".green().bold(),
            sentinel.path().display(),
            "(Ctrl-C to stop)".dimmed()
        );
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            sentinel.stop();
            Ok(())
        }
        Some(err) = failure_rx.recv() => {
            sentinel.stop();
            anyhow::bail!("Watcher stopped: {}", err)
        }
    }
}

fn print_batch(batch: &[Event], json: bool) {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for event in batch {
        let line = if json {
            serde_json::to_string(event).unwrap_or_default()
        } else {
            describe(event)
        };
        // A closed pipe ends the output, not the watch
        if writeln!(out, "{}", line).is_err() {
            return;
        }
    }
    let _ = out.flush();
}

fn describe(event: &Event) -> String {
    let label = format!("{:<8}", event.action().to_string());
    let label = match event.action() {
        Action::Created => label.green().to_string(),
        Action::Deleted => label.red().to_string(),
        Action::Modified => label.yellow().to_string(),
        Action::Renamed => label.cyan().to_string(),
    };
    match event.new_file() {
        Some(new_file) => format!(
            "{} {} {} {}",
            label,
            event.path(),
            "->".dimmed(),
            sentinel_core::event::join(event.directory(), new_file)
        ),
        None => format!("{} {}", label, event.path()),
    }
}

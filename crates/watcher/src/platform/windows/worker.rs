//! Worker loop for completion-based change sources
//!
//! A [`ChangeSource`] reads changes for a whole subtree into a caller buffer
//! and reports completion later. The loop keeps one read armed at all times:
//! on each completion it swaps the buffers, re-arms into the fresh half and
//! only then parses what arrived.

use super::buffer::BufferPair;
use super::records;
use crate::Backend;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use sentinel_core::event::canonical_path;
use sentinel_core::{EmissionToggle, EventQueue, WatchError, WatcherConfig, WatcherState};
use std::io;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// How a read ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// `bytes` of records were written into the armed buffer
    Filled { bytes: usize },
    /// Changes were lost because the OS could not keep up
    Overflow,
    /// The target rejected the buffer size, as network shares do above 64 KiB
    BufferTooLarge,
    /// The read was cancelled
    Aborted,
    /// Any other OS error code
    Failed(u32),
}

/// Why [`ChangeSource::wait`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Completed(Completion),
    /// The owner asked the worker to look at its flags
    Interrupted,
}

/// Errors when requesting a read
#[derive(Debug, Error)]
pub enum ArmError {
    #[error("notification buffer is larger than the target accepts")]
    BufferTooLarge,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Wakes a worker blocked in [`ChangeSource::wait`] from another thread
pub trait Interrupt: Send + Sync + 'static {
    fn interrupt(&self);
}

/// Asynchronous subtree change reader
pub trait ChangeSource: Send + 'static {
    type Interrupt: Interrupt;

    /// Open the directory at `root`
    fn open(root: &Path) -> Result<Self, WatchError>
    where
        Self: Sized;

    fn interrupter(&self) -> Self::Interrupt;

    /// Request the next batch of changes into `buffer`
    ///
    /// # Safety
    ///
    /// The source may write into `buffer` until `wait` reports the read's
    /// completion, or until the source is dropped. The caller must not move,
    /// free or access the buffer before then.
    unsafe fn arm(&mut self, buffer: &mut [u8]) -> Result<(), ArmError>;

    /// Block until the pending read completes or an interrupt arrives
    fn wait(&mut self) -> Wake;
}

struct AsyncLoop<S: ChangeSource> {
    // Dropped first: cancelling a pending read must finish before the
    // buffers are freed.
    source: S,
    buffers: BufferPair,
    network_buffer_size: usize,
    root: String,
    sink: EventQueue,
    state: Arc<WatcherState>,
    emission: EmissionToggle,
}

impl<S: ChangeSource> AsyncLoop<S> {
    fn run(mut self, ready: Sender<Result<(), WatchError>>) {
        if let Err(err) = self.arm_or_shrink() {
            let _ = ready.send(Err(err));
            return;
        }
        // Nobody is waiting any more once start() has given up
        if ready.send(Ok(())).is_err() {
            return;
        }

        while self.state.is_running() {
            match self.source.wait() {
                Wake::Interrupted => continue,
                Wake::Completed(completion) => {
                    if self.complete(completion).is_break() {
                        break;
                    }
                }
            }
        }
        debug!("Change worker for {} exiting", self.root);
    }

    fn complete(&mut self, completion: Completion) -> ControlFlow<()> {
        if !self.state.is_running() {
            return ControlFlow::Break(());
        }

        match completion {
            Completion::Filled { bytes } => {
                self.buffers.swap();
                let rearmed = self.arm_or_shrink();

                if bytes == 0 {
                    trace!("Empty completion for {}", self.root);
                } else if self.emission.is_enabled() {
                    self.sink
                        .extend(records::translate(&self.root, self.buffers.completed(bytes)));
                }

                match rearmed {
                    Ok(()) => ControlFlow::Continue(()),
                    Err(err) => {
                        self.state.fail(err);
                        ControlFlow::Break(())
                    }
                }
            }
            Completion::Overflow => {
                self.state.fail(WatchError::RestartRequired);
                ControlFlow::Break(())
            }
            Completion::BufferTooLarge => match self.shrink_and_rearm() {
                Ok(()) => ControlFlow::Continue(()),
                Err(err) => {
                    self.state.fail(err);
                    ControlFlow::Break(())
                }
            },
            Completion::Aborted => {
                self.state.fail(WatchError::UnexpectedShutdown);
                ControlFlow::Break(())
            }
            Completion::Failed(code) => {
                warn!("Directory read for {} failed with code {}", self.root, code);
                self.state.fail(WatchError::UnexpectedShutdown);
                ControlFlow::Break(())
            }
        }
    }

    fn arm(&mut self) -> Result<(), ArmError> {
        // SAFETY: the write half is left alone until the source reports this
        // read complete, and `source` is dropped before `buffers`.
        unsafe { self.source.arm(self.buffers.write_mut()) }
    }

    fn arm_or_shrink(&mut self) -> Result<(), WatchError> {
        match self.arm() {
            Ok(()) => Ok(()),
            Err(ArmError::BufferTooLarge) => self.shrink_and_rearm(),
            Err(ArmError::Io(err)) => {
                warn!("Failed to request changes for {}: {}", self.root, err);
                Err(WatchError::UnexpectedShutdown)
            }
        }
    }

    /// Fall back to the network buffer size, once
    fn shrink_and_rearm(&mut self) -> Result<(), WatchError> {
        if self.buffers.size() <= self.network_buffer_size {
            return Err(WatchError::NetworkBufferResizeFailed);
        }
        self.buffers.resize(self.network_buffer_size);
        self.arm().map_err(|err| {
            warn!("Re-arming with reduced buffers failed: {}", err);
            WatchError::NetworkBufferResizeFailed
        })?;
        info!(
            "Reduced notification buffers for {} to {} bytes",
            self.root, self.network_buffer_size
        );
        Ok(())
    }
}

/// Recursive watcher over a [`ChangeSource`]
pub struct AsyncWatcher<S: ChangeSource> {
    root: PathBuf,
    path: String,
    sink: EventQueue,
    config: WatcherConfig,
    emission: EmissionToggle,
    state: Arc<WatcherState>,
    source: Option<S>,
    interrupt: Option<S::Interrupt>,
    worker: Option<JoinHandle<()>>,
}

impl<S: ChangeSource> AsyncWatcher<S> {
    /// Create a stopped watcher; the source is opened by `start`
    pub fn new(root: impl Into<PathBuf>, sink: EventQueue, mut config: WatcherConfig) -> Self {
        let root = root.into();
        let root = std::path::absolute(&root).unwrap_or(root);
        let emission = config.emission();
        Self {
            path: canonical_path(&root),
            root,
            sink,
            config,
            emission,
            state: Arc::new(WatcherState::new()),
            source: None,
            interrupt: None,
            worker: None,
        }
    }

    /// Create a stopped watcher around an already opened source
    pub fn with_source(
        root: impl Into<PathBuf>,
        sink: EventQueue,
        config: WatcherConfig,
        source: S,
    ) -> Self {
        let mut watcher = Self::new(root, sink, config);
        watcher.source = Some(source);
        watcher
    }

    /// Arm the first read on a worker thread and wait for it to report in
    ///
    /// Gives up after the configured start timeout with
    /// [`WatchError::WatcherNotStarted`]. The late worker is told to stop and
    /// is joined by the next `start` or `stop`.
    pub fn start(&mut self) -> Result<(), WatchError> {
        if self.state.is_running() {
            return Ok(());
        }
        // A worker that missed its start deadline must be gone before a new
        // one shares the state and sink
        self.stop();
        self.state.reset();

        match self.spawn() {
            Ok(()) => {
                info!("Watching {}", self.root.display());
                Ok(())
            }
            Err(err) => {
                self.state.record_error(err.clone());
                Err(err)
            }
        }
    }

    fn spawn(&mut self) -> Result<(), WatchError> {
        let source = match self.source.take() {
            Some(source) => source,
            None => S::open(&self.root)?,
        };
        let interrupt = source.interrupter();
        let (ready_tx, ready_rx) = bounded(1);

        let worker_loop = AsyncLoop {
            source,
            buffers: BufferPair::new(self.config.buffer_size),
            network_buffer_size: self.config.network_buffer_size,
            root: self.path.clone(),
            sink: self.sink.clone(),
            state: self.state.clone(),
            emission: self.emission.clone(),
        };

        self.state.set_running(true);
        let worker = thread::Builder::new()
            .name("sentinel-changes".to_string())
            .spawn(move || worker_loop.run(ready_tx))
            .map_err(|e| {
                self.state.set_running(false);
                WatchError::io("failed to spawn watcher thread", &e)
            })?;

        match ready_rx.recv_timeout(self.config.start_timeout()) {
            Ok(Ok(())) => {
                self.state.mark_started();
                self.interrupt = Some(interrupt);
                self.worker = Some(worker);
                Ok(())
            }
            Ok(Err(err)) => {
                self.state.set_running(false);
                let _ = worker.join();
                Err(err)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                self.state.set_running(false);
                interrupt.interrupt();
                self.interrupt = Some(interrupt);
                self.worker = Some(worker);
                warn!(
                    "Worker for {} did not report in within {:?}",
                    self.root.display(),
                    self.config.start_timeout()
                );
                Err(WatchError::WatcherNotStarted)
            }
        }
    }

    /// Stop the worker; no event is queued after this returns
    pub fn stop(&mut self) {
        self.state.set_running(false);
        if let Some(interrupt) = &self.interrupt {
            interrupt.interrupt();
        }
        self.join_worker();
        self.interrupt = None;
    }

    fn join_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Change worker for {} panicked", self.root.display());
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn error(&self) -> Option<String> {
        self.state.error_message()
    }

    pub fn last_error(&self) -> Option<WatchError> {
        self.state.last_error()
    }
}

impl<S: ChangeSource> Backend for AsyncWatcher<S> {
    fn start(&mut self) -> Result<(), WatchError> {
        AsyncWatcher::start(self)
    }

    fn stop(&mut self) {
        AsyncWatcher::stop(self)
    }

    fn path(&self) -> &str {
        AsyncWatcher::path(self)
    }

    fn state(&self) -> Arc<WatcherState> {
        self.state.clone()
    }
}

impl<S: ChangeSource> Drop for AsyncWatcher<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

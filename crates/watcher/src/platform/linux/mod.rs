//! Linux backend built on inotify
//!
//! inotify watches single directories, so the backend keeps a
//! [`DirectoryTree`] with one watch per directory and extends or prunes it as
//! directories come and go. A worker thread blocks in `poll(2)` on the
//! inotify descriptor and an eventfd used to wake it for shutdown.

mod dispatch;

pub use dispatch::{Dispatched, Dispatcher, RawRecord, RecordKind};

use crate::tree::{DirectoryTree, WatchRegistrar};
use crate::Backend;
use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask, Watches};
use sentinel_core::event::canonical_path;
use sentinel_core::{EmissionToggle, EventQueue, WatchError, WatcherConfig, WatcherState};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, trace, warn};

fn watch_mask() -> WatchMask {
    WatchMask::CREATE
        | WatchMask::DELETE
        | WatchMask::MODIFY
        | WatchMask::ATTRIB
        | WatchMask::MOVED_FROM
        | WatchMask::MOVED_TO
        | WatchMask::DELETE_SELF
        | WatchMask::MOVE_SELF
        | WatchMask::ONLYDIR
        | WatchMask::DONT_FOLLOW
        | WatchMask::EXCL_UNLINK
}

/// Registers watches on the kernel inotify instance
pub struct InotifyRegistrar {
    watches: Watches,
}

impl WatchRegistrar for InotifyRegistrar {
    type Id = WatchDescriptor;

    fn add_watch(&mut self, path: &Path) -> Result<WatchDescriptor, WatchError> {
        self.watches
            .add(path, watch_mask())
            .map_err(|err| registration_error(&err, path))
    }

    fn remove_watch(&mut self, id: WatchDescriptor) -> io::Result<()> {
        self.watches.remove(id)
    }
}

fn registration_error(err: &io::Error, path: &Path) -> WatchError {
    match err.raw_os_error() {
        Some(libc::ENOSPC) => WatchError::WatchLimitExceeded(path.to_path_buf()),
        Some(libc::ENOTDIR) => WatchError::NotADirectory(path.to_path_buf()),
        Some(libc::EACCES) | Some(libc::EPERM) => WatchError::PermissionDenied(path.to_path_buf()),
        Some(libc::ENOENT) => WatchError::NotFound(path.to_path_buf()),
        _ => WatchError::from_io(err, path),
    }
}

/// Map a kernel mask to a record kind; a queue overflow ends the watch
fn classify(mask: EventMask) -> Result<Option<RecordKind>, WatchError> {
    let kind = if mask.contains(EventMask::Q_OVERFLOW) {
        return Err(WatchError::RestartRequired);
    } else if mask.contains(EventMask::IGNORED) {
        Some(RecordKind::Ignored)
    } else if mask.intersects(EventMask::DELETE_SELF | EventMask::MOVE_SELF) {
        Some(RecordKind::SelfRemoved)
    } else if mask.contains(EventMask::CREATE) {
        Some(RecordKind::Create)
    } else if mask.contains(EventMask::DELETE) {
        Some(RecordKind::Delete)
    } else if mask.contains(EventMask::MOVED_FROM) {
        Some(RecordKind::MovedFrom)
    } else if mask.contains(EventMask::MOVED_TO) {
        Some(RecordKind::MovedTo)
    } else if mask.intersects(EventMask::MODIFY | EventMask::ATTRIB) {
        Some(RecordKind::Modify)
    } else {
        None
    };
    Ok(kind)
}

/// eventfd the owner writes to when the worker must look at its flags
struct Wakeup {
    fd: File,
}

impl Wakeup {
    fn new() -> io::Result<Self> {
        // SAFETY: no pointer arguments; the result is checked below.
        let raw = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `raw` is a fresh descriptor owned by nothing else.
        let fd = unsafe { File::from_raw_fd(raw) };
        Ok(Self { fd })
    }

    fn wake(&self) {
        if let Err(err) = (&self.fd).write_all(&1u64.to_ne_bytes()) {
            trace!("Wakeup write failed: {}", err);
        }
    }

    fn drain(&self) {
        let mut counter = [0u8; 8];
        let _ = (&self.fd).read(&mut counter);
    }
}

impl AsRawFd for Wakeup {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

struct Readiness {
    readable: bool,
    woken: bool,
}

fn wait_readable(inotify: RawFd, wakeup: RawFd) -> io::Result<Readiness> {
    let mut fds = [
        libc::pollfd {
            fd: inotify,
            events: libc::POLLIN,
            revents: 0,
        },
        libc::pollfd {
            fd: wakeup,
            events: libc::POLLIN,
            revents: 0,
        },
    ];
    // SAFETY: `fds` is a live array of two pollfd entries for the whole call.
    let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
    if ready < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(Readiness {
        readable: fds[0].revents & libc::POLLIN != 0,
        woken: fds[1].revents & libc::POLLIN != 0,
    })
}

/// Recursive watcher over inotify
pub struct InotifyWatcher {
    root: PathBuf,
    path: String,
    sink: EventQueue,
    config: WatcherConfig,
    emission: EmissionToggle,
    state: Arc<WatcherState>,
    wakeup: Option<Arc<Wakeup>>,
    worker: Option<JoinHandle<()>>,
}

impl InotifyWatcher {
    /// Create a stopped watcher for `root`; nothing is checked until `start`
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
            wakeup: None,
            worker: None,
        }
    }

    /// Watch every directory under the root and start the worker
    ///
    /// The tree is built before this returns, so changes made afterwards are
    /// reported. Calling it on a running watcher does nothing.
    pub fn start(&mut self) -> Result<(), WatchError> {
        if self.state.is_running() {
            return Ok(());
        }
        // A previous run may have ended on its own
        self.join_worker();
        self.state.reset();

        match self.spawn() {
            Ok(()) => {
                info!("Watching {} with inotify", self.root.display());
                Ok(())
            }
            Err(err) => {
                self.state.record_error(err.clone());
                Err(err)
            }
        }
    }

    fn spawn(&mut self) -> Result<(), WatchError> {
        let inotify =
            Inotify::init().map_err(|e| WatchError::io("failed to initialize inotify", &e))?;
        let wakeup = Arc::new(
            Wakeup::new().map_err(|e| WatchError::io("failed to create wakeup descriptor", &e))?,
        );
        let mut registrar = InotifyRegistrar {
            watches: inotify.watches(),
        };
        let tree = DirectoryTree::build(&self.root, &mut registrar)?;
        debug!("{} inotify watches registered", tree.watch_count());

        let event_loop = EventLoop {
            inotify,
            dispatcher: Dispatcher::new(tree, registrar),
            wakeup: wakeup.clone(),
            sink: self.sink.clone(),
            state: self.state.clone(),
            emission: self.emission.clone(),
            buffer: vec![0; self.config.read_buffer_size],
            max_reads: self.config.max_reads_per_cycle.max(1),
        };

        self.state.set_running(true);
        let worker = thread::Builder::new()
            .name("sentinel-inotify".to_string())
            .spawn(move || event_loop.run())
            .map_err(|e| {
                self.state.set_running(false);
                WatchError::io("failed to spawn watcher thread", &e)
            })?;

        self.state.mark_started();
        self.wakeup = Some(wakeup);
        self.worker = Some(worker);
        Ok(())
    }

    /// Stop the worker and release every watch
    ///
    /// No event is queued after this returns. Safe to call repeatedly.
    pub fn stop(&mut self) {
        self.state.set_running(false);
        if let Some(wakeup) = &self.wakeup {
            wakeup.wake();
        }
        self.join_worker();
        self.wakeup = None;
    }

    fn join_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("inotify worker for {} panicked", self.root.display());
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

impl Backend for InotifyWatcher {
    fn start(&mut self) -> Result<(), WatchError> {
        InotifyWatcher::start(self)
    }

    fn stop(&mut self) {
        InotifyWatcher::stop(self)
    }

    fn path(&self) -> &str {
        InotifyWatcher::path(self)
    }

    fn state(&self) -> Arc<WatcherState> {
        self.state.clone()
    }
}

impl Drop for InotifyWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

struct EventLoop {
    inotify: Inotify,
    dispatcher: Dispatcher<InotifyRegistrar>,
    wakeup: Arc<Wakeup>,
    sink: EventQueue,
    state: Arc<WatcherState>,
    emission: EmissionToggle,
    buffer: Vec<u8>,
    max_reads: usize,
}

impl EventLoop {
    fn run(mut self) {
        while self.state.is_running() {
            let readiness =
                match wait_readable(self.inotify.as_raw_fd(), self.wakeup.as_raw_fd()) {
                    Ok(readiness) => readiness,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        warn!("poll on inotify descriptor failed: {}", err);
                        self.state.fail(WatchError::UnexpectedShutdown);
                        break;
                    }
                };
            if readiness.woken {
                self.wakeup.drain();
            }
            if !self.state.is_running() {
                break;
            }
            if !readiness.readable {
                continue;
            }

            let records = match self.read_cycle() {
                Ok(records) => records,
                Err(err) => {
                    self.state.fail(err);
                    break;
                }
            };
            let outcome = self.dispatcher.dispatch(records, self.emission.is_enabled());
            for err in outcome.errors {
                self.state.record_error(err);
            }
            if !self.state.is_running() {
                break;
            }
            self.sink.extend(outcome.events);
            if let Some(fatal) = outcome.fatal {
                self.state.fail(fatal);
                break;
            }
        }

        if let Err(err) = self.dispatcher.shutdown() {
            debug!("Some watches were already released: {}", err);
        }
        self.state.set_running(false);
        debug!("inotify worker exiting");
    }

    /// Drain everything the kernel has queued, up to the read limit
    fn read_cycle(&mut self) -> Result<Vec<RawRecord<WatchDescriptor>>, WatchError> {
        let mut records = Vec::new();

        for _ in 0..self.max_reads {
            let events = match self.inotify.read_events(&mut self.buffer) {
                Ok(events) => events,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("Failed to read inotify events: {}", err);
                    return Err(WatchError::UnexpectedShutdown);
                }
            };

            let mut read = 0;
            for event in events {
                read += 1;
                let Some(kind) = classify(event.mask)? else {
                    continue;
                };
                records.push(RawRecord {
                    watch: event.wd,
                    kind,
                    cookie: event.cookie,
                    name: event.name.map(|name| name.to_string_lossy().into_owned()),
                    is_dir: event.mask.contains(EventMask::ISDIR),
                });
            }
            if read == 0 {
                break;
            }
        }

        trace!("Read {} inotify records", records.len());
        Ok(records)
    }
}

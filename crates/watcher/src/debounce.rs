//! Batched event delivery
//!
//! Backends queue events as they arrive. The delivery thread wakes once per
//! interval, drains the queue and hands the whole batch to the caller, so
//! bursts of changes arrive as one callback.

use crossbeam_channel::{bounded, select, tick, Sender};
use parking_lot::Mutex;
use sentinel_core::{Event, EventQueue, WatchError, WatcherState};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Receives each non-empty batch
pub type EventCallback = Box<dyn FnMut(Vec<Event>) + Send>;

/// Receives the fatal error that ended a watch
pub type ErrorCallback = Box<dyn FnMut(WatchError) + Send>;

/// Shortest delivery interval; a zero interval would spin
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Restricts delivery to events naming one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFilter {
    pub directory: String,
    pub file: String,
}

impl FileFilter {
    pub fn matches(&self, event: &Event) -> bool {
        event.mentions(&self.directory, &self.file)
    }
}

/// Callbacks shared by every delivery thread of one supervisor
#[derive(Clone)]
pub struct Callbacks {
    on_events: Arc<Mutex<EventCallback>>,
    on_error: Arc<Mutex<Option<ErrorCallback>>>,
}

impl Callbacks {
    pub fn new(on_events: EventCallback) -> Self {
        Self {
            on_events: Arc::new(Mutex::new(on_events)),
            on_error: Arc::new(Mutex::new(None)),
        }
    }

    pub fn set_on_error(&self, on_error: ErrorCallback) {
        *self.on_error.lock() = Some(on_error);
    }

    fn deliver(&self, batch: Vec<Event>) {
        let mut on_events = self.on_events.lock();
        (*on_events)(batch);
    }

    fn report(&self, error: WatchError) {
        if let Some(on_error) = self.on_error.lock().as_mut() {
            on_error(error);
        }
    }
}

/// Runs the delivery thread
pub struct Debouncer {
    interval: Duration,
    worker: Option<(Sender<()>, JoinHandle<()>)>,
}

impl Debouncer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(MIN_INTERVAL),
            worker: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Start delivering from `queue`; a running thread is left alone
    pub fn start(
        &mut self,
        queue: EventQueue,
        state: Arc<WatcherState>,
        filter: Option<FileFilter>,
        callbacks: Callbacks,
    ) -> std::io::Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let ticker = tick(self.interval);
        let delivery = Delivery {
            queue,
            state,
            filter,
            callbacks,
            reported: false,
        };

        let handle = thread::Builder::new()
            .name("sentinel-delivery".to_string())
            .spawn(move || {
                let mut delivery = delivery;
                loop {
                    select! {
                        recv(stop_rx) -> _ => {
                            delivery.flush();
                            break;
                        }
                        recv(ticker) -> _ => {
                            delivery.flush();
                            delivery.check_state();
                        }
                    }
                }
                debug!("Delivery thread exiting");
            })?;

        self.worker = Some((stop_tx, handle));
        Ok(())
    }

    /// Deliver what is still queued and stop the thread
    pub fn stop(&mut self) {
        if let Some((stop_tx, handle)) = self.worker.take() {
            let _ = stop_tx.send(());
            if handle.join().is_err() {
                warn!("Delivery thread panicked");
            }
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Delivery {
    queue: EventQueue,
    state: Arc<WatcherState>,
    filter: Option<FileFilter>,
    callbacks: Callbacks,
    reported: bool,
}

impl Delivery {
    fn flush(&self) {
        let mut batch = self.queue.drain();
        if let Some(filter) = &self.filter {
            batch.retain(|event| filter.matches(event));
        }
        if !batch.is_empty() {
            self.callbacks.deliver(batch);
        }
    }

    /// Report a fatal error once, after the events that preceded it
    fn check_state(&mut self) {
        if self.reported || self.state.is_running() {
            return;
        }
        if let Some(error) = self.state.last_error().filter(WatchError::requires_restart) {
            self.reported = true;
            self.callbacks.report(error);
        }
    }
}

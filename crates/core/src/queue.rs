//! Thread-safe event sink
//!
//! Backends push from their worker thread; consumers drain from anywhere.
//! Order is preserved per pusher.

use crate::event::Event;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

/// Ordered multi-producer, multi-consumer event queue
///
/// Cloning is cheap and every clone refers to the same queue.
#[derive(Debug, Clone)]
pub struct EventQueue {
    tx: Sender<Event>,
    rx: Receiver<Event>,
}

impl EventQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    /// Append one event
    pub fn push(&self, event: Event) {
        // Both ends live in `self`, so the channel cannot be disconnected here.
        let _ = self.tx.send(event);
    }

    /// Append a batch, keeping its order
    pub fn extend(&self, events: impl IntoIterator<Item = Event>) {
        for event in events {
            self.push(event);
        }
    }

    /// Take every event currently queued
    pub fn drain(&self) -> Vec<Event> {
        self.rx.try_iter().collect()
    }

    /// Wait up to `timeout` for the next event
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Event> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Number of queued events
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_drain_preserves_order() {
        let queue = EventQueue::new();
        queue.push(Event::created("/r", "a"));
        queue.extend([Event::modified("/r", "a"), Event::deleted("/r", "a")]);

        assert_eq!(queue.len(), 3);
        let drained = queue.drain();
        assert_eq!(
            drained,
            vec![
                Event::created("/r", "a"),
                Event::modified("/r", "a"),
                Event::deleted("/r", "a"),
            ]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_concurrent_pushers_keep_their_own_order() {
        let queue = EventQueue::new();

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        queue.push(Event::created(format!("/w{}", worker), i.to_string()));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let drained = queue.drain();
        assert_eq!(drained.len(), 400);
        for worker in 0..4 {
            let dir = format!("/w{}", worker);
            let seen: Vec<usize> = drained
                .iter()
                .filter(|e| e.directory() == dir)
                .map(|e| e.file().parse().unwrap())
                .collect();
            assert_eq!(seen, (0..100).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_recv_timeout_on_empty_queue() {
        let queue = EventQueue::new();
        assert!(queue.recv_timeout(Duration::from_millis(10)).is_none());
    }
}

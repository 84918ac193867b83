//! Blocking completion queues.
//!
//! A [`CompletionQueue`] carries `(tag, ok)` pairs from the transport to the
//! single thread that drives a dispatch loop or a streaming handler. The
//! shutdown contract mirrors completion-queue RPC runtimes: after
//! [`shutdown`](CompletionQueue::shutdown), every event already posted is
//! still delivered — with `ok` forced to `false` — and only then does
//! [`next`](CompletionQueue::next) return `None`.

use crossbeam_channel::{Receiver, Sender, bounded, select, unbounded};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::tag::TagId;

/// An event queue yielding `(correlation tag, success flag)` pairs.
///
/// Producers call [`post`](Self::post) from any thread; exactly one consumer
/// thread calls [`next`](Self::next).
pub struct CompletionQueue {
    events_tx: Sender<(TagId, bool)>,
    events_rx: Receiver<(TagId, bool)>,
    open: AtomicBool,
    // Dropping the sender wakes a consumer blocked in `next`.
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
}

impl CompletionQueue {
    pub fn new() -> Self {
        let (events_tx, events_rx) = unbounded();
        let (shutdown_tx, shutdown_rx) = bounded(0);
        Self {
            events_tx,
            events_rx,
            open: AtomicBool::new(true),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
        }
    }

    /// Posts one completion event. Events posted after shutdown are dropped.
    pub fn post(&self, tag: TagId, ok: bool) {
        if !self.open.load(Ordering::Acquire) {
            return;
        }
        // The paired receiver lives as long as `self`.
        let _ = self.events_tx.send((tag, ok));
    }

    /// Blocks for the next event.
    ///
    /// Returns `None` once the queue has been shut down and every previously
    /// posted event has been drained. Drained events report `ok == false`
    /// regardless of how they were posted.
    pub fn next(&self) -> Option<(TagId, bool)> {
        loop {
            if !self.open.load(Ordering::Acquire) {
                return self.events_rx.try_recv().ok().map(|(tag, _)| (tag, false));
            }
            select! {
                recv(self.events_rx) -> event => return event.ok(),
                recv(self.shutdown_rx) -> _ => {
                    // Closed; fall through to the drain path above.
                }
            }
        }
    }

    /// Closes the queue. Idempotent; wakes a blocked consumer.
    pub fn shutdown(&self) {
        self.open.store(false, Ordering::Release);
        self.shutdown_tx.lock().take();
    }

    pub fn is_shut_down(&self) -> bool {
        !self.open.load(Ordering::Acquire)
    }
}

impl Default for CompletionQueue {
    fn default() -> Self {
        Self::new()
    }
}

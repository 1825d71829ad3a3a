//! Bounded event queue between the notification feed and watchers.
//!
//! The producer is the translator, driven serially by the directory cache.
//! A full queue makes [`EventSender::push`] wait, which in turn holds up the
//! cache's delivery loop. Consumers share one receiver; concurrent
//! [`EventReceiver::pop`] callers each take different events, nothing is
//! broadcast or replayed.
use std::sync::{
    Arc,
    atomic::{AtomicIsize, Ordering},
};

use subnet::Event;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

/// queue depth between the cache and watchers
pub const EVENT_QUEUE_CAPACITY: usize = 5000;

/// Create a bounded event queue
pub fn channel(capacity: usize) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    let queued = Arc::new(AtomicIsize::new(0));
    (
        EventSender {
            tx,
            queued: Arc::clone(&queued),
        },
        EventReceiver {
            rx: Arc::new(Mutex::new(rx)),
            queued,
        },
    )
}

/// Producer half of the event queue.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Event>,
    queued: Arc<AtomicIsize>,
}

impl EventSender {
    /// Push an event, waiting while the queue is full. Returns `false` if
    /// every receiver is gone.
    pub async fn push(&self, event: Event) -> bool {
        if self.tx.send(event).await.is_err() {
            return false;
        }
        self.queued.fetch_add(1, Ordering::AcqRel);
        true
    }
}

/// Consumer half of the event queue, cheap to clone.
#[derive(Debug, Clone)]
pub struct EventReceiver {
    rx: Arc<Mutex<mpsc::Receiver<Event>>>,
    // may dip below zero between a pop and the matching push bookkeeping
    queued: Arc<AtomicIsize>,
}

impl EventReceiver {
    /// Take the next event. Returns `None` when `cancel` fires first or the
    /// queue is closed. Cancellation wins when both are ready so that a
    /// cancelled caller returns promptly; the event stays queued.
    pub async fn pop(&self, cancel: &CancellationToken) -> Option<Event> {
        let mut rx = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            rx = self.rx.lock() => rx,
        };
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            event = rx.recv() => event,
        };
        if event.is_some() {
            self.queued.fetch_sub(1, Ordering::AcqRel);
        }
        event
    }

    /// Number of events waiting. Does not wait on consumers parked in
    /// [`EventReceiver::pop`].
    pub fn len(&self) -> usize {
        self.queued.load(Ordering::Acquire).max(0) as usize
    }

    /// true when no events are waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

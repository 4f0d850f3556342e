use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Default per-subscriber channel capacity, in chunks.
pub const SUBSCRIBER_CAPACITY: usize = 512;

/// One item on a subscriber channel.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputEvent {
    /// A chunk of raw PTY output.
    Data(Bytes),
    /// End-of-stream sentinel: the session stopped or was torn down.
    Closed,
}

/// A single client's view of a session's output stream.
///
/// Holds the receiving half of a bounded channel plus the id needed for
/// idempotent removal from the [`SubscriberSet`].
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<OutputEvent>,
}

impl Subscription {
    /// Receive the next event. `None` means the sender side is gone, which
    /// clients treat the same as [`OutputEvent::Closed`].
    pub async fn recv(&mut self) -> Option<OutputEvent> {
        self.rx.recv().await
    }
}

/// Per-session set of subscriber channels.
///
/// Adding and removing subscribers is safe at any time, including while the
/// broadcast reader is mid-fanout: the set is locked only for the duration
/// of each non-blocking `try_send` sweep. A full channel drops the chunk for
/// that subscriber only — no backpressure ever reaches the PTY reader.
#[derive(Clone)]
pub struct SubscriberSet {
    inner: Arc<Mutex<HashMap<u64, mpsc::Sender<OutputEvent>>>>,
    next_id: Arc<AtomicU64>,
    capacity: usize,
}

impl SubscriberSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
            capacity,
        }
    }

    /// Register a new subscriber and return its channel.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().insert(id, tx);
        Subscription { id, rx }
    }

    /// Remove a subscriber. Idempotent: unknown or already-removed ids are a
    /// no-op.
    pub fn unsubscribe(&self, id: u64) {
        self.inner.lock().remove(&id);
    }

    /// Deliver the end-of-stream sentinel to one subscriber and remove it.
    /// Used when a client attaches to a session that has already stopped:
    /// it gets the replay snapshot, then an immediate `Closed`.
    pub fn close(&self, id: u64) {
        if let Some(tx) = self.inner.lock().remove(&id) {
            let _ = tx.try_send(OutputEvent::Closed);
        }
    }

    /// Deliver a chunk to every current subscriber.
    ///
    /// Non-blocking: a full channel means that subscriber misses this chunk;
    /// a closed channel (receiver dropped without unsubscribing) is pruned.
    pub fn broadcast(&self, data: &Bytes) {
        let mut dead = Vec::new();
        let mut inner = self.inner.lock();
        for (id, tx) in inner.iter() {
            match tx.try_send(OutputEvent::Data(data.clone())) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!(subscriber = id, "subscriber channel full, dropping chunk");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*id),
            }
        }
        for id in dead {
            inner.remove(&id);
        }
    }

    /// Deliver the end-of-stream sentinel to every subscriber and drain the
    /// set. Each channel receives `Closed` at most once; calling this on an
    /// already-drained set is a no-op.
    pub fn close_all(&self) {
        let drained: Vec<_> = {
            let mut inner = self.inner.lock();
            inner.drain().collect()
        };
        for (_, tx) in drained {
            let _ = tx.try_send(OutputEvent::Closed);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! Status hub: ordered fan-out of session transitions
//!
//! Every session transition is published exactly once to every attached
//! observer, in emission order. Each observer gets its own bounded
//! channel so one slow or dead consumer can never delay the others: an
//! observer whose buffer is full (or whose receiver is gone) is dropped
//! from the registry, never the message.
//!
//! Publishing is driven solely by the session actor, so per-observer
//! ordering follows directly from channel FIFO order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use tw_core::ipc::StatusMessage;

/// Receiving end handed to one observer
pub struct ObserverHandle {
    id: u64,
    rx: mpsc::Receiver<StatusMessage>,
}

impl ObserverHandle {
    /// Registry ID of this observer
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next message, in publish order. `None` means the hub dropped
    /// this observer (it lagged) or shut down.
    pub async fn recv(&mut self) -> Option<StatusMessage> {
        self.rx.recv().await
    }
}

struct ObserverSlot {
    tx: mpsc::Sender<StatusMessage>,
    /// Sequence number of the last message delivered to this observer
    seq: u64,
}

/// Fan-out broadcaster for session state transitions
pub struct StatusHub {
    observers: DashMap<u64, ObserverSlot>,
    next_id: AtomicU64,
    capacity: usize,
    current: RwLock<StatusMessage>,
}

impl StatusHub {
    /// Create a hub with the given per-observer buffer capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            observers: DashMap::new(),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
            current: RwLock::new(StatusMessage::Disconnected),
        }
    }

    /// Register a new observer. The current session state is delivered
    /// as its first message so it never starts blind.
    pub fn subscribe(&self) -> ObserverHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);

        // Resync and registration happen under the state lock so a
        // concurrent publish cannot slip between them: the observer
        // either resyncs to the new state or is registered in time to
        // receive the transition.
        {
            let current = match self.current.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            // fresh channel with capacity >= 1, cannot fail
            let _ = tx.try_send(current.clone());
            self.observers.insert(id, ObserverSlot { tx, seq: 1 });
        }

        tracing::debug!(observer = id, "observer subscribed");
        ObserverHandle { id, rx }
    }

    /// Remove an observer. Never blocks on in-flight publishes.
    pub fn unsubscribe(&self, id: u64) {
        if self.observers.remove(&id).is_some() {
            tracing::debug!(observer = id, "observer unsubscribed");
        }
    }

    /// Deliver a transition to every observer, dropping any whose
    /// buffer is full or whose receiver is gone.
    ///
    /// The state lock is held across the fan-out; see `subscribe`.
    pub fn publish(&self, message: StatusMessage) {
        let mut current = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *current = message.clone();

        let mut dead = Vec::new();
        for mut entry in self.observers.iter_mut() {
            match entry.tx.try_send(message.clone()) {
                Ok(()) => entry.seq += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        observer = *entry.key(),
                        delivered = entry.seq,
                        "observer lagging, dropping it"
                    );
                    dead.push(*entry.key());
                }
                Err(TrySendError::Closed(_)) => dead.push(*entry.key()),
            }
        }
        for id in dead {
            self.observers.remove(&id);
        }
    }

    /// The most recently published state
    pub fn current_state(&self) -> StatusMessage {
        match self.current.read() {
            Ok(current) => current.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Number of attached observers
    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }
}

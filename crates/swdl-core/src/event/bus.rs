//! Fan-out of execution events to live observers.
//!
//! The executor appends each event to the repository first and then hands a
//! copy to the bus. Observers that fall behind see `RecvError::Lagged` and are
//! expected to catch up from the repository log.

use swdl_types::execution::ExecutionEvent;
use tokio::sync::broadcast;

/// Broadcast channel shared by the executor and its observers (SSE streams,
/// CLI progress spinners).
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    /// `capacity` is how many events a slow observer may trail by before it
    /// lags. Zero is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.tx.subscribe()
    }

    /// Hand an already-persisted event to every observer. Returns how many
    /// observers it reached; nobody listening is not an error.
    pub fn publish(&self, event: ExecutionEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn observers(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EventBus({} observers)", self.observers())
    }
}

//! In-process broadcast of task lifecycle events.
//!
//! Producers (workers, the engine façade) publish fire-and-forget; consumers
//! (the SSE endpoint) subscribe and receive every event published while they
//! are attached. Slow consumers lag and skip, they never block producers.

use tokio::sync::broadcast;

use crate::kernel::tasks::TaskEvent;

const DEFAULT_CAPACITY: usize = 256;

/// Cloneable handle to the event channel.
#[derive(Clone)]
pub struct StreamHub {
    tx: broadcast::Sender<TaskEvent>,
}

impl StreamHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. No-op when nobody is listening.
    pub fn publish(&self, event: TaskEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for StreamHub {
    fn default() -> Self {
        Self::new()
    }
}

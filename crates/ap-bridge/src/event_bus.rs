use std::sync::{Arc, Mutex, MutexGuard};

use crate::protocol::EngineEvent;

/// Fan-out bus for [`EngineEvent`]s built on flume channels.
///
/// Each call to [`subscribe`](EventBus::subscribe) creates a receiver that
/// sees every event published after it subscribed. Clones share the same
/// subscriber list.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<flume::Sender<EngineEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn subscribe(&self) -> flume::Receiver<EngineEvent> {
        let (tx, rx) = flume::unbounded();
        self.senders().push(tx);
        rx
    }

    /// Publish to all current subscribers. Subscribers whose receivers were
    /// dropped are pruned.
    pub fn publish(&self, event: EngineEvent) {
        tracing::trace!(event = event.name(), "publish");
        self.senders().retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.senders().len()
    }

    // A publisher that panicked mid-retain leaves the list usable.
    fn senders(&self) -> MutexGuard<'_, Vec<flume::Sender<EngineEvent>>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

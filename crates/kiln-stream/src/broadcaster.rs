//! Fan-out of stream events to bounded per-subscriber queues.
//!
//! Broadcasting never blocks the producer: events go out with `try_send`,
//! and a subscriber whose queue is full loses the new event (counted per
//! subscriber) while everyone else still receives it. Heartbeats run on
//! their own interval task so observers can tell a stalled loop from a
//! dead connection.

use crate::event::StreamEvent;
use kiln_core::{CheckpointTag, Metric, Run};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default bound of each subscriber's event queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    /// Queue bound applied to each subscriber.
    pub queue_capacity: usize,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self { queue_capacity: DEFAULT_QUEUE_CAPACITY }
    }
}

struct SubscriberEntry {
    tx: mpsc::Sender<StreamEvent>,
    dropped: u64,
    token: u64,
}

struct Inner {
    subscribers: StdMutex<HashMap<String, SubscriberEntry>>,
    queue_capacity: usize,
    next_token: AtomicU64,
}

impl Inner {
    fn dispatch(&self, event: &StreamEvent) {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            warn!("subscriber registry lock poisoned, dropping event");
            return;
        };

        let mut closed = Vec::new();
        for (id, entry) in subscribers.iter_mut() {
            match entry.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    entry.dropped += 1;
                    debug!(subscriber_id = %id, dropped = entry.dropped, "queue full, dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    closed.push(id.clone());
                }
            }
        }
        for id in closed {
            subscribers.remove(&id);
            debug!(subscriber_id = %id, "pruned closed subscriber");
        }
    }
}

/// Handle to a subscriber's receiving end. Dropping it detaches the
/// subscriber from the broadcaster.
pub struct Subscription {
    id: String,
    token: u64,
    rx: mpsc::Receiver<StreamEvent>,
    inner: Weak<Inner>,
}

impl Subscription {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next queued event; `None` once detached and drained.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            if let Ok(mut subscribers) = inner.subscribers.lock() {
                // only remove our own registration, not a replacement
                if subscribers.get(&self.id).is_some_and(|e| e.token == self.token) {
                    subscribers.remove(&self.id);
                }
            }
        }
    }
}

pub struct StreamBroadcaster {
    inner: Arc<Inner>,
}

impl StreamBroadcaster {
    #[must_use]
    pub fn new(config: BroadcasterConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: StdMutex::new(HashMap::new()),
                queue_capacity: config.queue_capacity.max(1),
                next_token: AtomicU64::new(0),
            }),
        }
    }

    /// Register a subscriber under `subscriber_id` and return its receiving
    /// handle. Re-subscribing an existing id replaces the previous queue.
    pub fn subscribe(&self, subscriber_id: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(self.inner.queue_capacity);
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);

        if let Ok(mut subscribers) = self.inner.subscribers.lock() {
            subscribers
                .insert(subscriber_id.to_string(), SubscriberEntry { tx, dropped: 0, token });
        }
        debug!(subscriber_id = %subscriber_id, "subscribed to stream");

        Subscription {
            id: subscriber_id.to_string(),
            token,
            rx,
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn unsubscribe(&self, subscriber_id: &str) {
        if let Ok(mut subscribers) = self.inner.subscribers.lock() {
            subscribers.remove(subscriber_id);
        }
        debug!(subscriber_id = %subscriber_id, "unsubscribed from stream");
    }

    pub fn broadcast_status(&self, run: &Run) {
        self.inner.dispatch(&StreamEvent::status(run));
    }

    pub fn broadcast_metric(&self, metric: &Metric) {
        self.inner.dispatch(&StreamEvent::metric(metric));
    }

    pub fn broadcast_checkpoint(
        &self,
        checkpoint_id: &str,
        tag: CheckpointTag,
        metric: Option<f64>,
    ) {
        self.inner.dispatch(&StreamEvent::checkpoint(checkpoint_id, tag, metric));
    }

    pub fn broadcast_error(&self, message: &str) {
        self.inner.dispatch(&StreamEvent::error(message));
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Events dropped so far for a subscriber because its queue was full.
    #[must_use]
    pub fn dropped_count(&self, subscriber_id: &str) -> Option<u64> {
        self.inner
            .subscribers
            .lock()
            .ok()
            .and_then(|s| s.get(subscriber_id).map(|e| e.dropped))
    }

    /// Start emitting `heartbeat` events on a fixed interval, independent of
    /// training activity. The task stops when the returned handle drops.
    #[must_use]
    pub fn start_heartbeat(&self, interval: Duration) -> HeartbeatHandle {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                inner.dispatch(&StreamEvent::heartbeat());
            }
        });
        HeartbeatHandle { handle }
    }
}

impl Default for StreamBroadcaster {
    fn default() -> Self {
        Self::new(BroadcasterConfig::default())
    }
}

/// Aborts the heartbeat task when dropped.
pub struct HeartbeatHandle {
    handle: JoinHandle<()>,
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

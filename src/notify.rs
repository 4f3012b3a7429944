use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use ulid::Ulid;

use crate::model::ChangeEvent;

const CHANNEL_CAPACITY: usize = 256;

/// Sink for committed ledger changes. Best-effort, at-most-once.
pub trait Publisher: Send + Sync {
    fn publish(&self, event: &ChangeEvent);
}

/// Broadcast hub for per-court change subscriptions.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<ChangeEvent>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to changes on a court. Creates the channel if needed.
    /// A receiver that falls more than `CHANNEL_CAPACITY` events behind gets `Lagged`.
    pub fn subscribe(&self, court_id: Ulid) -> broadcast::Receiver<ChangeEvent> {
        let sender = self
            .channels
            .entry(court_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, court_id: Ulid, event: &ChangeEvent) {
        if let Some(sender) = self.channels.get(&court_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop channels whose subscribers have all gone away.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }
}

impl Publisher for NotifyHub {
    fn publish(&self, event: &ChangeEvent) {
        self.send(event.court_id, event);
    }
}

/// Ordered hand-off between the exclusive section and the publisher.
///
/// Events are enqueued while the section is still held, so events of one partition enter the
/// queue in commit order. A single dispatcher task drains the queue and calls the publisher,
/// keeping subscriber latency off the reservation path.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

impl Outbox {
    /// Start the dispatcher. Must be called inside a tokio runtime.
    pub fn spawn(publisher: Arc<dyn Publisher>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch_loop(publisher, rx));
        Self { tx }
    }

    pub fn enqueue(&self, event: ChangeEvent) {
        if self.tx.send(event).is_err() {
            tracing::warn!("change dispatcher gone, dropping event");
        }
    }
}

async fn dispatch_loop(publisher: Arc<dyn Publisher>, mut rx: mpsc::UnboundedReceiver<ChangeEvent>) {
    while let Some(event) = rx.recv().await {
        publisher.publish(&event);
        metrics::counter!(crate::observability::EVENTS_PUBLISHED_TOTAL).increment(1);
    }
}

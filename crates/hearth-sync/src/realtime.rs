//! Fan-out hub between the push transport and per-room consumers.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, watch};
use tracing::{debug, trace, warn};

use hearth_types::events::{RealtimeEvent, RecordEvent, collection_topic};

use crate::connection::ConnectionMonitor;

const BROADCAST_CAPACITY: usize = 1024;

/// What a [`Subscription`] yields.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    Connected,
    Disconnected,
    Record(RecordEvent),
    /// The receiver fell behind and dropped `n` events. Treat like a disconnect gap.
    Lagged(u64),
}

/// Receives events from the transport and hands them to every subscriber.
///
/// The transport driver publishes into it and watches [`Realtime::topics`] to
/// know which collections the server should push.
#[derive(Clone)]
pub struct Realtime {
    inner: Arc<RealtimeInner>,
}

struct RealtimeInner {
    broadcast_tx: broadcast::Sender<RealtimeEvent>,
    monitor: ConnectionMonitor,
    /// topic -> live subscription count
    refcounts: Mutex<BTreeMap<String, usize>>,
    topics_tx: watch::Sender<Vec<String>>,
}

impl Default for Realtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Realtime {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (topics_tx, _) = watch::channel(Vec::new());
        Self {
            inner: Arc::new(RealtimeInner {
                broadcast_tx,
                monitor: ConnectionMonitor::new(),
                refcounts: Mutex::new(BTreeMap::new()),
                topics_tx,
            }),
        }
    }

    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.inner.monitor
    }

    /// Deliver a transport event. Lifecycle events also drive the connection monitor.
    pub fn publish(&self, event: RealtimeEvent) {
        match &event {
            RealtimeEvent::Connected { client_id } => {
                debug!("Realtime connect, client id {}", client_id);
                self.inner.monitor.on_connect();
            }
            RealtimeEvent::Disconnected => {
                self.inner.monitor.on_disconnect();
            }
            RealtimeEvent::Record { collection, event } => {
                trace!("Realtime {:?} on {}/{}", event.action, collection, event.record.id);
            }
        }
        let _ = self.inner.broadcast_tx.send(event);
    }

    /// Subscribe to one collection. The returned handle unsubscribes on drop.
    pub fn subscribe(&self, collection: &str) -> Subscription {
        let rx = self.inner.broadcast_tx.subscribe();
        self.inner.retain(collection_topic(collection));
        Subscription {
            collection: collection.to_string(),
            rx,
            hub: self.inner.clone(),
        }
    }

    /// Topics that currently have at least one subscriber.
    pub fn topics(&self) -> watch::Receiver<Vec<String>> {
        self.inner.topics_tx.subscribe()
    }

    pub fn current_topics(&self) -> Vec<String> {
        self.inner.topics_tx.borrow().clone()
    }
}

impl RealtimeInner {
    fn retain(&self, topic: String) {
        let mut refcounts = self.refcounts.lock().expect("topic lock poisoned");
        let count = refcounts.entry(topic).or_insert(0);
        *count += 1;
        if *count == 1 {
            self.topics_tx.send_replace(refcounts.keys().cloned().collect());
        }
    }

    fn release(&self, topic: &str) {
        let mut refcounts = self.refcounts.lock().expect("topic lock poisoned");
        let Some(count) = refcounts.get_mut(topic) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            refcounts.remove(topic);
            self.topics_tx.send_replace(refcounts.keys().cloned().collect());
        }
    }
}

/// Scoped subscription to one collection. Released when dropped.
pub struct Subscription {
    collection: String,
    rx: broadcast::Receiver<RealtimeEvent>,
    hub: Arc<RealtimeInner>,
}

impl Subscription {
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Next lifecycle event or record event for this collection.
    pub async fn recv(&mut self) -> Option<SubscriptionEvent> {
        loop {
            let event = match self.rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Subscription to {} lagged by {} events", self.collection, n);
                    return Some(SubscriptionEvent::Lagged(n));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            };

            match event {
                RealtimeEvent::Connected { .. } => return Some(SubscriptionEvent::Connected),
                RealtimeEvent::Disconnected => return Some(SubscriptionEvent::Disconnected),
                RealtimeEvent::Record { collection, event } => {
                    if collection == self.collection {
                        return Some(SubscriptionEvent::Record(event));
                    }
                }
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.release(&collection_topic(&self.collection));
    }
}

//! Cross-instance exchange bridge over a topic-based publish/subscribe bus.
//!
//! There is no acknowledgment on the bus, so each side publishes its payload
//! once on subscribing and again after it hears from the other side: whichever
//! side subscribed last would otherwise miss the first broadcast.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::debug;
use tokio::sync::mpsc;

/// Identifies one subscription so a publisher is never handed its own messages.
pub type SubscriberId = u64;

/// Publish/subscribe capability the bridge runs on.
pub trait PubSub: Send + Sync {
    /// Start receiving messages published on `topic` by other subscribers.
    fn subscribe(&self, topic: &str) -> (SubscriberId, mpsc::UnboundedReceiver<Vec<u8>>);
    /// Deliver `payload` to every subscriber of `topic` except `from`.
    fn publish(&self, topic: &str, from: SubscriberId, payload: &[u8]);
    fn unsubscribe(&self, topic: &str, id: SubscriberId);
}

struct Subscriber {
    id: SubscriberId,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

#[derive(Default)]
struct Topics {
    next_id: SubscriberId,
    by_topic: HashMap<String, Vec<Subscriber>>,
}

/// In-process topic table. On its own it connects coordinators sharing one
/// process; a network transport feeds remote publications in through [`LocalHub::deliver`].
#[derive(Clone, Default)]
pub struct LocalHub {
    topics: Arc<Mutex<Topics>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Topics> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver a publication that originated outside this process to every local subscriber.
    pub fn deliver(&self, topic: &str, payload: &[u8]) -> usize {
        self.fan_out(topic, None, payload)
    }

    /// Number of topics with at least one live subscription.
    pub fn topic_count(&self) -> usize {
        self.lock().by_topic.len()
    }

    fn fan_out(&self, topic: &str, skip: Option<SubscriberId>, payload: &[u8]) -> usize {
        let topics = self.lock();
        let Some(subs) = topics.by_topic.get(topic) else {
            return 0;
        };
        subs.iter()
            .filter(|s| Some(s.id) != skip)
            .filter(|s| s.tx.send(payload.to_vec()).is_ok())
            .count()
    }
}

impl PubSub for LocalHub {
    fn subscribe(&self, topic: &str) -> (SubscriberId, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut topics = self.lock();
        let id = topics.next_id;
        topics.next_id += 1;
        topics
            .by_topic
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        (id, rx)
    }

    fn publish(&self, topic: &str, from: SubscriberId, payload: &[u8]) {
        self.fan_out(topic, Some(from), payload);
    }

    fn unsubscribe(&self, topic: &str, id: SubscriberId) {
        let mut topics = self.lock();
        if let Some(subs) = topics.by_topic.get_mut(topic) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                topics.by_topic.remove(topic);
            }
        }
    }
}

/// One open subscription. Unsubscribes when dropped.
pub struct Subscription {
    bus: Arc<dyn PubSub>,
    topic: String,
    id: SubscriberId,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Subscription {
    pub fn open(bus: Arc<dyn PubSub>, topic: &str) -> Self {
        let (id, rx) = bus.subscribe(topic);
        Self {
            bus,
            topic: topic.to_string(),
            id,
            rx,
        }
    }

    pub fn publish(&self, payload: &[u8]) {
        self.bus.publish(&self.topic, self.id, payload);
    }

    /// Next message from another subscriber; `None` once the bus dropped this subscription.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.topic, self.id);
    }
}

/// Bridge exchange: publish, wait for one message, publish again.
#[derive(Clone)]
pub struct Bridge {
    bus: Arc<dyn PubSub>,
}

impl Bridge {
    pub fn new(bus: Arc<dyn PubSub>) -> Self {
        Self { bus }
    }

    /// Runs until a counterpart on another instance answers. The subscription
    /// lives exactly as long as the returned future.
    pub async fn exchange(&self, name: &str, payload: &[u8]) -> Vec<u8> {
        let mut sub = Subscription::open(self.bus.clone(), name);
        sub.publish(payload);
        let Some(theirs) = sub.recv().await else {
            return std::future::pending().await;
        };
        sub.publish(payload);
        debug!("bridge: heard from counterpart on {:?}", name);
        theirs
    }
}

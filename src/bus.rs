//! In-process broadcast bus connecting the writer to live subscriptions.
//!
//! The writer publishes each committed batch to the topic named after the
//! stream key and to the [`ALL_STREAMS`] topic. Delivery is a hint, not a
//! guarantee: listeners use bounded broadcast channels and may miss batches
//! when lagging, in which case the subscription reconciles through catch-up.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::event::{RecordedEvent, ALL_STREAMS};

/// Capacity of each per-topic broadcast channel.
const DEFAULT_CHANNEL_CAPACITY: usize = 128;

/// A batch of events published on a topic, shared between all listeners.
pub type Published = Arc<Vec<RecordedEvent>>;

/// Topic registry over [`tokio::sync::broadcast`] channels.
///
/// Cloning the bus is cheap and yields a handle to the same topic table.
#[derive(Debug, Clone)]
pub struct Bus {
    topics: Arc<RwLock<HashMap<String, broadcast::Sender<Published>>>>,
    capacity: usize,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl Bus {
    /// Creates a bus whose per-topic channels hold up to `capacity` batches
    /// before lagging listeners start losing hints.
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Registers a listener on `topic`, creating the topic if needed.
    pub fn register(&self, topic: &str) -> broadcast::Receiver<Published> {
        let mut topics = self.topics.write();

        topics
            .entry(topic.to_owned())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publishes a batch of committed events to a single topic.
    ///
    /// Never blocks the publisher; a topic with no registered listeners
    /// absorbs the batch.
    pub fn publish(&self, topic: &str, events: Vec<RecordedEvent>) {
        if events.is_empty() {
            return;
        }

        let sender = self.topics.read().get(topic).cloned();

        let Some(sender) = sender else { return };

        if sender.send(Arc::new(events)).is_err() {
            // The last listener has gone away; drop the dead topic so the
            // table does not grow with unsubscribed stream keys.
            let mut topics = self.topics.write();
            if topics
                .get(topic)
                .is_some_and(|sender| sender.receiver_count() == 0)
            {
                topics.remove(topic);
            }
        }
    }

    /// Publishes a committed batch the way the writer must: once to the
    /// stream's own topic and once to [`ALL_STREAMS`].
    pub fn publish_appended(&self, stream_key: &str, events: Vec<RecordedEvent>) {
        self.publish(stream_key, events.clone());
        self.publish(ALL_STREAMS, events);
    }
}

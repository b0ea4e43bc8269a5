//! In-memory implementations of the storage seams, backed by thread-safe
//! [`std::collections::HashMap`]s.
//!
//! [`InMemoryEventStore`] doubles as the writer: `append` assigns numbering
//! and publishes the committed batch on the bus, which is the contract the
//! subscription core expects from any real writer.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{iter, StreamExt};
use parking_lot::RwLock;

use crate::bus::Bus;
use crate::event::{Cursor, EventData, Position, RecordedEvent, SubscriptionKind};
use crate::reader::{BatchStream, EventReader, ReadError};
use crate::store::{StoreError, StoredSubscription, SubscriptionStore};

#[derive(Debug, Default)]
struct EventBackend {
    /// Every recorded event, in global append order.
    events: Vec<RecordedEvent>,
    /// Per-stream indexes into `events`.
    streams: HashMap<String, Vec<usize>>,
}

/// In-memory event store: the append path plus the [`EventReader`] seam.
#[derive(Debug, Clone)]
pub struct InMemoryEventStore {
    backend: Arc<RwLock<EventBackend>>,
    bus: Bus,
}

impl InMemoryEventStore {
    /// Creates a store publishing committed batches on `bus`.
    pub fn new(bus: Bus) -> Self {
        Self {
            backend: Arc::new(RwLock::new(EventBackend::default())),
            bus,
        }
    }

    /// Appends `events` to the stream, assigning contiguous global event
    /// numbers and dense per-stream versions, then publishes the recorded
    /// batch to the stream topic and to `$all`.
    pub fn append(&self, stream_key: &str, events: Vec<EventData>) -> Vec<RecordedEvent> {
        if events.is_empty() {
            return Vec::new();
        }

        let recorded = {
            let mut backend = self.backend.write();

            let next_event_number = backend.events.len() as u64 + 1;
            let last_stream_version = backend
                .streams
                .get(stream_key)
                .map_or(0, |indexes| indexes.len() as u64);

            let recorded: Vec<RecordedEvent> = events
                .into_iter()
                .enumerate()
                .map(|(i, data)| RecordedEvent {
                    event_id: data.event_id,
                    event_number: next_event_number + i as u64,
                    stream_key: stream_key.to_owned(),
                    stream_version: last_stream_version + i as u64 + 1,
                    event_type: data.event_type,
                    correlation_id: data.correlation_id,
                    causation_id: data.causation_id,
                    payload: data.payload,
                    metadata: data.metadata,
                    created_at: Utc::now(),
                })
                .collect();

            for event in &recorded {
                let index = backend.events.len();
                backend.events.push(event.clone());
                backend
                    .streams
                    .entry(stream_key.to_owned())
                    .or_default()
                    .push(index);
            }

            recorded
        };

        // The write lock is released first: publishing happens strictly
        // after "commit", mirroring the writer contract.
        self.bus.publish_appended(stream_key, recorded.clone());

        recorded
    }

    /// Returns the global number of the most recently appended event.
    pub fn last_event_number(&self) -> u64 {
        self.backend.read().events.len() as u64
    }
}

#[async_trait]
impl EventReader for InMemoryEventStore {
    async fn unseen_events(
        &self,
        stream_key: &str,
        last_seen: Cursor,
        batch_size: usize,
    ) -> Result<BatchStream, ReadError> {
        let kind = SubscriptionKind::of(stream_key);

        let unseen: Vec<RecordedEvent> = {
            let backend = self.backend.read();

            match kind {
                SubscriptionKind::AllStreams => backend
                    .events
                    .iter()
                    .filter(|event| event.event_number > last_seen)
                    .cloned()
                    .collect(),
                SubscriptionKind::Stream => {
                    let indexes = backend
                        .streams
                        .get(stream_key)
                        .ok_or(ReadError::StreamNotFound)?;

                    indexes
                        .iter()
                        .map(|&index| backend.events[index].clone())
                        .filter(|event| event.stream_version > last_seen)
                        .collect()
                }
            }
        };

        let batches: Vec<Result<Vec<RecordedEvent>, ReadError>> = unseen
            .chunks(batch_size.max(1))
            .map(|batch| Ok(batch.to_vec()))
            .collect();

        Ok(iter(batches).boxed())
    }
}

#[derive(Debug, Default)]
struct SubscriptionBackend {
    rows: HashMap<(String, String), StoredSubscription>,
    next_id: i64,
}

/// In-memory [`SubscriptionStore`] over a thread-safe map.
#[derive(Debug, Clone, Default)]
pub struct InMemorySubscriptionStore {
    backend: Arc<RwLock<SubscriptionBackend>>,
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn subscribe(
        &self,
        stream_key: &str,
        subscription_name: &str,
        start_from: Position,
    ) -> Result<StoredSubscription, StoreError> {
        let mut backend = self.backend.write();

        let key = (stream_key.to_owned(), subscription_name.to_owned());
        if let Some(existing) = backend.rows.get(&key) {
            return Ok(existing.clone());
        }

        backend.next_id += 1;
        let row = StoredSubscription {
            id: backend.next_id,
            stream_key: stream_key.to_owned(),
            subscription_name: subscription_name.to_owned(),
            last_seen_event_number: start_from.event_number,
            last_seen_stream_version: start_from.stream_version,
            created_at: Utc::now(),
        };

        backend.rows.insert(key, row.clone());

        Ok(row)
    }

    async fn ack(
        &self,
        stream_key: &str,
        subscription_name: &str,
        position: Position,
    ) -> Result<(), StoreError> {
        let mut backend = self.backend.write();

        let key = (stream_key.to_owned(), subscription_name.to_owned());
        if let Some(row) = backend.rows.get_mut(&key) {
            row.last_seen_event_number = position.event_number;
            row.last_seen_stream_version = position.stream_version;
        }

        Ok(())
    }

    async fn unsubscribe(
        &self,
        stream_key: &str,
        subscription_name: &str,
    ) -> Result<(), StoreError> {
        let mut backend = self.backend.write();

        backend
            .rows
            .remove(&(stream_key.to_owned(), subscription_name.to_owned()));

        Ok(())
    }

    async fn query(
        &self,
        stream_key: &str,
        subscription_name: &str,
    ) -> Result<StoredSubscription, StoreError> {
        self.backend
            .read()
            .rows
            .get(&(stream_key.to_owned(), subscription_name.to_owned()))
            .cloned()
            .ok_or(StoreError::NotFound)
    }
}

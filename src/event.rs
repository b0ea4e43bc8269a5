//! Data model shared by every component of the subscription core:
//! recorded events, durable positions and subscription cursors.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Key of the virtual stream that carries every event in the store, in global
/// append order. Subscribing to it yields an all-streams subscription.
pub const ALL_STREAMS: &str = "$all";

/// A subscription cursor: `event_number` for all-streams subscriptions,
/// `stream_version` for single-stream ones.
pub type Cursor = u64;

/// Free-form metadata attached to a [`RecordedEvent`].
pub type Metadata = HashMap<String, String>;

/// An immutable event record produced by the writer.
///
/// Within a stream, `stream_version` is dense and starts at 1; across the
/// store, `event_number` is strictly increasing with append order. Records
/// are never mutated or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// Unique id of the event.
    pub event_id: Uuid,
    /// Global, monotonic number assigned at append time.
    pub event_number: u64,
    /// Opaque key of the logical stream the event belongs to.
    pub stream_key: String,
    /// Per-stream monotonic version, starting at 1.
    pub stream_version: u64,
    /// Domain name of the event.
    pub event_type: String,
    /// Groups events recorded as part of the same logical operation.
    pub correlation_id: Option<Uuid>,
    /// Id of the event (or command) that caused this one.
    pub causation_id: Option<Uuid>,
    /// The event payload.
    pub payload: serde_json::Value,
    /// Optional metadata providing additional context.
    pub metadata: Metadata,
    /// Instant the event was recorded at.
    pub created_at: DateTime<Utc>,
}

impl RecordedEvent {
    /// The two-component durable position of this event.
    pub fn position(&self) -> Position {
        Position {
            event_number: self.event_number,
            stream_version: self.stream_version,
        }
    }

    /// The cursor component relevant for a subscription of the given kind.
    pub fn cursor(&self, kind: SubscriptionKind) -> Cursor {
        self.position().cursor(kind)
    }
}

/// The two-component durable cursor of a subscription: both components are
/// checkpointed atomically so that a restart restores either kind of cursor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// Global event number.
    pub event_number: u64,
    /// Per-stream version.
    pub stream_version: u64,
}

impl Position {
    /// The component relevant for a subscription of the given kind.
    pub fn cursor(&self, kind: SubscriptionKind) -> Cursor {
        match kind {
            SubscriptionKind::AllStreams => self.event_number,
            SubscriptionKind::Stream => self.stream_version,
        }
    }
}

/// The two flavours of subscription, determined by the stream key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    /// Subscription to a single stream; the ack cursor is `stream_version`.
    Stream,
    /// Subscription to [`ALL_STREAMS`]; the ack cursor is `event_number`.
    AllStreams,
}

impl SubscriptionKind {
    /// Derives the subscription kind from a stream key.
    pub fn of(stream_key: &str) -> Self {
        if stream_key == ALL_STREAMS {
            SubscriptionKind::AllStreams
        } else {
            SubscriptionKind::Stream
        }
    }
}

/// Writer-side description of an event to be appended. Numbering and the
/// recording timestamp are assigned by the store at append time.
#[derive(Debug, Clone)]
pub struct EventData {
    /// Unique id of the event.
    pub event_id: Uuid,
    /// Domain name of the event.
    pub event_type: String,
    /// Groups events recorded as part of the same logical operation.
    pub correlation_id: Option<Uuid>,
    /// Id of the event (or command) that caused this one.
    pub causation_id: Option<Uuid>,
    /// The event payload.
    pub payload: serde_json::Value,
    /// Optional metadata providing additional context.
    pub metadata: Metadata,
}

impl EventData {
    /// Creates a new event description with a random id and no
    /// correlation, causation or metadata attached.
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            correlation_id: None,
            causation_id: None,
            payload,
            metadata: Metadata::default(),
        }
    }

    /// Sets the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Sets the causation id.
    #[must_use]
    pub fn with_causation_id(mut self, causation_id: Uuid) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    /// Adds a new entry to the event metadata.
    #[must_use]
    pub fn with_metadata(mut self, key: String, value: String) -> Self {
        self.metadata.insert(key, value);
        self
    }
}

/// Splits an ordered batch into contiguous runs sharing the same
/// `(stream_key, correlation_id)` pair, preserving the original order.
///
/// Events are delivered to subscribers one run at a time, so the writer's
/// correlation grouping survives re-batching without ever reordering.
pub fn correlation_chunks(events: Vec<RecordedEvent>) -> Vec<Vec<RecordedEvent>> {
    let mut chunks: Vec<Vec<RecordedEvent>> = Vec::new();
    let mut current: Vec<RecordedEvent> = Vec::new();

    for event in events {
        let boundary = current.last().is_some_and(|previous| {
            previous.stream_key != event.stream_key
                || previous.correlation_id != event.correlation_id
        });

        if boundary {
            chunks.push(std::mem::take(&mut current));
        }

        current.push(event);
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn recorded(
        stream_key: &str,
        stream_version: u64,
        event_number: u64,
    ) -> RecordedEvent {
        RecordedEvent {
            event_id: Uuid::new_v4(),
            event_number,
            stream_key: stream_key.to_owned(),
            stream_version,
            event_type: "test_event".to_owned(),
            correlation_id: None,
            causation_id: None,
            payload: serde_json::Value::Null,
            metadata: Metadata::default(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn cursor_follows_subscription_kind() {
        let event = recorded("orders:1", 3, 42);

        assert_eq!(3, event.cursor(SubscriptionKind::Stream));
        assert_eq!(42, event.cursor(SubscriptionKind::AllStreams));
        assert_eq!(SubscriptionKind::AllStreams, SubscriptionKind::of(ALL_STREAMS));
        assert_eq!(SubscriptionKind::Stream, SubscriptionKind::of("orders:1"));
    }

    #[test]
    fn correlation_chunks_split_on_stream_and_correlation_boundaries() {
        let correlation = Uuid::new_v4();

        let mut first = recorded("orders:1", 1, 1);
        first.correlation_id = Some(correlation);
        let mut second = recorded("orders:1", 2, 2);
        second.correlation_id = Some(correlation);
        let third = recorded("orders:1", 3, 3);
        let fourth = recorded("billing:1", 1, 4);

        let chunks = correlation_chunks(vec![
            first.clone(),
            second.clone(),
            third.clone(),
            fourth.clone(),
        ]);

        assert_eq!(
            vec![vec![first, second], vec![third], vec![fourth]],
            chunks
        );
    }

    #[test]
    fn correlation_chunks_of_empty_batch_is_empty() {
        assert!(correlation_chunks(Vec::new()).is_empty());
    }
}

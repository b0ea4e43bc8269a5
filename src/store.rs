//! Durable checkpoint storage for subscriptions.
//!
//! One row is kept per `(stream_key, subscription_name)` pair; it is created
//! on first subscribe, updated on every acknowledgement and deleted on
//! explicit unsubscribe. The row is the only state that survives a restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::event::{Cursor, Position, SubscriptionKind};

/// A persisted subscription checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSubscription {
    /// Surrogate id of the row.
    pub id: i64,
    /// Key of the subscribed stream, or [`crate::event::ALL_STREAMS`].
    pub stream_key: String,
    /// Name of the subscription, unique within the stream.
    pub subscription_name: String,
    /// Global number of the last acknowledged event.
    pub last_seen_event_number: u64,
    /// Stream version of the last acknowledged event.
    pub last_seen_stream_version: u64,
    /// Instant the subscription was first created at.
    pub created_at: DateTime<Utc>,
}

impl StoredSubscription {
    /// The durable two-component position of this checkpoint.
    pub fn position(&self) -> Position {
        Position {
            event_number: self.last_seen_event_number,
            stream_version: self.last_seen_stream_version,
        }
    }

    /// The checkpoint cursor relevant for a subscription of the given kind.
    pub fn cursor(&self, kind: SubscriptionKind) -> Cursor {
        self.position().cursor(kind)
    }
}

/// Error type returned by [`SubscriptionStore`] operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The queried subscription does not exist.
    #[error("subscription not found")]
    NotFound,

    /// The storage backend failed, typically a transport error.
    #[error("subscription store failed: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Durable mapping from `(stream_key, subscription_name)` to the last
/// acknowledged position of the subscription.
///
/// Writes are partitioned by the key pair: per subscription there is a single
/// caller (the owning actor), so implementations only need to be safe against
/// concurrent callers for *distinct* subscriptions, plus the create race
/// described on [`subscribe`](SubscriptionStore::subscribe).
#[async_trait]
pub trait SubscriptionStore: Send + Sync + 'static {
    /// Creates the checkpoint row with the provided starting position, or
    /// returns the existing row unchanged if one is already present.
    ///
    /// Simultaneous subscribe attempts converge: a unique violation on the
    /// key pair is treated as "already exists" and reconciled by reading the
    /// existing row back.
    async fn subscribe(
        &self,
        stream_key: &str,
        subscription_name: &str,
        start_from: Position,
    ) -> Result<StoredSubscription, StoreError>;

    /// Unconditionally advances the checkpoint to `position`, storing both
    /// components atomically.
    async fn ack(
        &self,
        stream_key: &str,
        subscription_name: &str,
        position: Position,
    ) -> Result<(), StoreError>;

    /// Deletes the checkpoint row. An absent row is not an error.
    async fn unsubscribe(
        &self,
        stream_key: &str,
        subscription_name: &str,
    ) -> Result<(), StoreError>;

    /// Returns the checkpoint row, or [`StoreError::NotFound`].
    async fn query(
        &self,
        stream_key: &str,
        subscription_name: &str,
    ) -> Result<StoredSubscription, StoreError>;
}

//! Snapshot reads of historical events, used by the catch-up worker to bring
//! a subscriber from its durable checkpoint up to the live end of the store.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::event::{Cursor, RecordedEvent};

/// A finite, lazy sequence of event batches returned by
/// [`EventReader::unseen_events`].
pub type BatchStream = BoxStream<'static, Result<Vec<RecordedEvent>, ReadError>>;

/// Error type returned by [`EventReader`] operations.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    /// A single-stream read was requested for a stream with no backing row.
    #[error("stream not found")]
    StreamNotFound,

    /// The storage backend failed, typically a transport error.
    #[error("event reader failed: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Reads events from a given cursor forward, in bounded batches.
#[async_trait]
pub trait EventReader: Send + Sync + 'static {
    /// Opens a lazy, finite sequence of batches of events strictly after
    /// `last_seen`, each of size at most `batch_size`.
    ///
    /// For [`crate::event::ALL_STREAMS`] the cursor and ordering are the
    /// global `event_number`; for any other key they are the per-stream
    /// `stream_version`. The sequence is a snapshot: it terminates when there
    /// are no more events at call time, regardless of later appends.
    async fn unseen_events(
        &self,
        stream_key: &str,
        last_seen: Cursor,
        batch_size: usize,
    ) -> Result<BatchStream, ReadError>;
}

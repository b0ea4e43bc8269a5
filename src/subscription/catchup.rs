//! Catch-up worker: a short-lived task that streams historical events to the
//! subscriber, one correlation chunk at a time, gated on acknowledgements.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;

use crate::event::{correlation_chunks, Cursor, SubscriptionKind};
use crate::reader::{EventReader, ReadError};
use crate::subscription::actor::Command;
use crate::subscription::Delivery;

/// Terminal failure of a catch-up round; fatal to the owning subscription.
#[derive(Debug, thiserror::Error)]
pub enum CatchUpError {
    /// The historical reader failed mid-stream.
    #[error("catch-up read failed: {0}")]
    Read(#[from] ReadError),

    /// The subscriber acked a cursor past the chunk currently in flight.
    #[error("ack cursor {cursor} is past the in-flight chunk tail {chunk_tail}")]
    AckPastChunk {
        /// The offending cursor.
        cursor: Cursor,
        /// Cursor of the last event in the chunk awaiting acknowledgement.
        chunk_tail: Cursor,
    },
}

pub(crate) struct CatchUpWorker<R> {
    pub(crate) reader: Arc<R>,
    pub(crate) stream_key: String,
    pub(crate) kind: SubscriptionKind,
    pub(crate) from: Cursor,
    pub(crate) batch_size: usize,
    pub(crate) delivery: Delivery,
    pub(crate) acks: mpsc::UnboundedReceiver<Cursor>,
    pub(crate) commands: mpsc::UnboundedSender<Command>,
}

impl<R> CatchUpWorker<R>
where
    R: EventReader,
{
    pub(crate) async fn run(mut self) {
        match self.catch_up().await {
            Ok(Some(last_seen)) => {
                tracing::debug!(
                    stream.key = %self.stream_key,
                    catch_up.last_seen = last_seen,
                    "catch-up complete"
                );
                let _ = self.commands.send(Command::CaughtUp(last_seen));
            }
            // The actor or subscriber went away mid-stream; any chunk
            // already sent is ignored by the torn-down subscriber.
            Ok(None) => {}
            Err(error) => {
                let _ = self.commands.send(Command::CatchUpFailed(error));
            }
        }
    }

    /// Streams chunks until the snapshot is exhausted, returning the cursor
    /// of the final event emitted (or the starting cursor if none were), or
    /// `None` when the subscription disappeared underneath the worker.
    async fn catch_up(&mut self) -> Result<Option<Cursor>, CatchUpError> {
        let mut last_seen = self.from;

        let mut batches = match self
            .reader
            .unseen_events(&self.stream_key, self.from, self.batch_size)
            .await
        {
            Ok(batches) => batches,
            // No backing stream yet: nothing to catch up on.
            Err(ReadError::StreamNotFound) => return Ok(Some(last_seen)),
            Err(error) => return Err(error.into()),
        };

        while let Some(batch) = batches.next().await {
            for chunk in correlation_chunks(batch?) {
                let chunk_tail = match chunk.last() {
                    Some(event) => event.cursor(self.kind),
                    None => continue,
                };

                if self.delivery.send(chunk).is_err() {
                    return Ok(None);
                }

                if !self.await_ack(chunk_tail).await? {
                    return Ok(None);
                }

                last_seen = chunk_tail;
            }
        }

        Ok(Some(last_seen))
    }

    /// Blocks until the chunk tail is acked. Acks with a strictly lesser
    /// cursor belong to earlier in-flight events and are ignored.
    async fn await_ack(&mut self, chunk_tail: Cursor) -> Result<bool, CatchUpError> {
        loop {
            match self.acks.recv().await {
                Some(cursor) if cursor == chunk_tail => return Ok(true),
                Some(cursor) if cursor < chunk_tail => continue,
                Some(cursor) => {
                    return Err(CatchUpError::AckPastChunk { cursor, chunk_tail });
                }
                None => return Ok(false),
            }
        }
    }
}

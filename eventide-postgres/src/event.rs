//! [`EventReader`] implementation streaming snapshot reads of the `events`
//! table in keyset-paginated batches.

use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eventide::event::{Cursor, Metadata, RecordedEvent, SubscriptionKind};
use eventide::reader::{BatchStream, EventReader, ReadError};
use futures::StreamExt;
use sqlx::postgres::PgRow;
use sqlx::PgPool;
use uuid::Uuid;

use crate::subscription::read_column;

const STREAM_EXISTS: &str = "SELECT 1 FROM events WHERE stream_key = $1 LIMIT 1";

const SELECT_STREAM_BATCH: &str = "SELECT event_number, event_id, stream_key, stream_version, \
            event_type, correlation_id, causation_id, payload, metadata, created_at \
     FROM events \
     WHERE stream_key = $1 AND stream_version > $2 \
     ORDER BY stream_version ASC \
     LIMIT $3";

const SELECT_ALL_STREAMS_BATCH: &str = "SELECT event_number, event_id, stream_key, stream_version, \
            event_type, correlation_id, causation_id, payload, metadata, created_at \
     FROM events \
     WHERE event_number > $1 \
     ORDER BY event_number ASC \
     LIMIT $2";

fn decode_event(row: &PgRow) -> Result<RecordedEvent, ReadError> {
    let metadata: serde_json::Value = read_column(row, "metadata")?;
    let metadata: Metadata = serde_json::from_value(metadata)
        .map_err(|error| anyhow::anyhow!("failed to decode event metadata: {error}"))?;

    Ok(RecordedEvent {
        event_id: read_column::<Uuid>(row, "event_id")?,
        event_number: read_column::<i64>(row, "event_number")? as u64,
        stream_key: read_column(row, "stream_key")?,
        stream_version: read_column::<i64>(row, "stream_version")? as u64,
        event_type: read_column(row, "event_type")?,
        correlation_id: read_column::<Option<Uuid>>(row, "correlation_id")?,
        causation_id: read_column::<Option<Uuid>>(row, "causation_id")?,
        payload: read_column(row, "payload")?,
        metadata,
        created_at: read_column::<DateTime<Utc>>(row, "created_at")?,
    })
}

/// Historical reads over the `events` table.
#[derive(Debug, Clone)]
pub struct PgEventReader {
    pool: PgPool,
}

impl PgEventReader {
    /// Creates a reader over the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventReader for PgEventReader {
    async fn unseen_events(
        &self,
        stream_key: &str,
        last_seen: Cursor,
        batch_size: usize,
    ) -> Result<BatchStream, ReadError> {
        let kind = SubscriptionKind::of(stream_key);

        if kind == SubscriptionKind::Stream {
            let exists = sqlx::query(STREAM_EXISTS)
                .bind(stream_key)
                .fetch_optional(&self.pool)
                .await
                .map_err(anyhow::Error::new)?;

            if exists.is_none() {
                return Err(ReadError::StreamNotFound);
            }
        }

        let pool = self.pool.clone();
        let stream_key = stream_key.to_owned();
        let limit = batch_size.max(1);

        let batches = try_stream! {
            let mut cursor = last_seen;

            loop {
                let rows = match kind {
                    SubscriptionKind::AllStreams => {
                        sqlx::query(SELECT_ALL_STREAMS_BATCH)
                            .bind(cursor as i64)
                            .bind(limit as i64)
                            .fetch_all(&pool)
                            .await
                    }
                    SubscriptionKind::Stream => {
                        sqlx::query(SELECT_STREAM_BATCH)
                            .bind(&stream_key)
                            .bind(cursor as i64)
                            .bind(limit as i64)
                            .fetch_all(&pool)
                            .await
                    }
                }
                .map_err(|error| ReadError::Internal(anyhow::Error::new(error)))?;

                if rows.is_empty() {
                    break;
                }

                let batch = rows
                    .iter()
                    .map(decode_event)
                    .collect::<Result<Vec<_>, _>>()?;

                let exhausted = batch.len() < limit;
                cursor = batch
                    .last()
                    .map_or(cursor, |event| event.cursor(kind));

                yield batch;

                if exhausted {
                    break;
                }
            }
        };

        Ok(batches.boxed())
    }
}

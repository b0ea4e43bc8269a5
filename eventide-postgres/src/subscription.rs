//! [`SubscriptionStore`] implementation over a PostgreSQL `subscriptions`
//! table keyed uniquely on `(stream_key, subscription_name)`.

use async_trait::async_trait;
use eventide::event::Position;
use eventide::store::{StoreError, StoredSubscription, SubscriptionStore};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

const CREATE_SUBSCRIPTION: &str = "INSERT INTO subscriptions \
     (stream_key, subscription_name, last_seen_event_number, last_seen_stream_version) \
     VALUES ($1, $2, $3, $4) \
     ON CONFLICT (stream_key, subscription_name) DO NOTHING \
     RETURNING id, stream_key, subscription_name, \
               last_seen_event_number, last_seen_stream_version, created_at";

const CHECKPOINT_SUBSCRIPTION: &str = "UPDATE subscriptions \
     SET last_seen_event_number = $3, last_seen_stream_version = $4 \
     WHERE stream_key = $1 AND subscription_name = $2";

const DELETE_SUBSCRIPTION: &str =
    "DELETE FROM subscriptions WHERE stream_key = $1 AND subscription_name = $2";

const GET_SUBSCRIPTION: &str = "SELECT id, stream_key, subscription_name, \
            last_seen_event_number, last_seen_stream_version, created_at \
     FROM subscriptions \
     WHERE stream_key = $1 AND subscription_name = $2";

/// Error returned when a result row is missing or carries an unexpected
/// column.
#[derive(Debug, thiserror::Error)]
#[error("failed to read column '{name}' from result row: {error}")]
pub struct ReadColumnError {
    name: &'static str,
    #[source]
    error: sqlx::Error,
}

pub(crate) fn read_column<'r, T>(row: &'r PgRow, name: &'static str) -> Result<T, anyhow::Error>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(name)
        .map_err(|error| anyhow::Error::new(ReadColumnError { name, error }))
}

fn decode_subscription(row: &PgRow) -> Result<StoredSubscription, StoreError> {
    Ok(StoredSubscription {
        id: read_column(row, "id")?,
        stream_key: read_column(row, "stream_key")?,
        subscription_name: read_column(row, "subscription_name")?,
        last_seen_event_number: read_column::<i64>(row, "last_seen_event_number")? as u64,
        last_seen_stream_version: read_column::<i64>(row, "last_seen_stream_version")? as u64,
        created_at: read_column(row, "created_at")?,
    })
}

/// Durable subscription checkpoints stored in PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgSubscriptionStore {
    pool: PgPool,
}

impl PgSubscriptionStore {
    /// Creates a store over the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn subscribe(
        &self,
        stream_key: &str,
        subscription_name: &str,
        start_from: Position,
    ) -> Result<StoredSubscription, StoreError> {
        let inserted = sqlx::query(CREATE_SUBSCRIPTION)
            .bind(stream_key)
            .bind(subscription_name)
            .bind(start_from.event_number as i64)
            .bind(start_from.stream_version as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(anyhow::Error::new)?;

        match inserted {
            Some(row) => {
                tracing::debug!(
                    subscription.name = %subscription_name,
                    stream.key = %stream_key,
                    "created subscription"
                );

                decode_subscription(&row)
            }
            // The unique key already exists: a concurrent (or previous)
            // subscribe won the insert, converge on its row.
            None => self.query(stream_key, subscription_name).await,
        }
    }

    async fn ack(
        &self,
        stream_key: &str,
        subscription_name: &str,
        position: Position,
    ) -> Result<(), StoreError> {
        tracing::debug!(
            subscription.name = %subscription_name,
            stream.key = %stream_key,
            checkpoint.event_number = position.event_number,
            checkpoint.stream_version = position.stream_version,
            "checkpointing subscription"
        );

        sqlx::query(CHECKPOINT_SUBSCRIPTION)
            .bind(stream_key)
            .bind(subscription_name)
            .bind(position.event_number as i64)
            .bind(position.stream_version as i64)
            .execute(&self.pool)
            .await
            .map_err(anyhow::Error::new)?;

        Ok(())
    }

    async fn unsubscribe(
        &self,
        stream_key: &str,
        subscription_name: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(DELETE_SUBSCRIPTION)
            .bind(stream_key)
            .bind(subscription_name)
            .execute(&self.pool)
            .await
            .map_err(anyhow::Error::new)?;

        Ok(())
    }

    async fn query(
        &self,
        stream_key: &str,
        subscription_name: &str,
    ) -> Result<StoredSubscription, StoreError> {
        let row = sqlx::query(GET_SUBSCRIPTION)
            .bind(stream_key)
            .bind(subscription_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(anyhow::Error::new)?;

        match row {
            Some(row) => decode_subscription(&row),
            None => Err(StoreError::NotFound),
        }
    }
}

//! Long-running, durable subscriptions over the event store.
//!
//! A subscription couples a named, persistent checkpoint with a subscriber
//! channel. After subscribing, the core catches the subscriber up from the
//! checkpoint by streaming historical events in acknowledgement-gated chunks,
//! then hands over to live push from the broadcast bus with no gaps and no
//! duplicates past the checkpoint. Every event is delivered at least once;
//! delivery is strictly monotonic in the subscription's cursor.
//!
//! ```no_run
//! use eventide::bus::Bus;
//! use eventide::event::EventData;
//! use eventide::inmemory::{InMemoryEventStore, InMemorySubscriptionStore};
//! use eventide::subscription::{SubscriptionHub, SubscriptionOptions};
//! use tokio::sync::mpsc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let bus = Bus::default();
//! let store = InMemoryEventStore::new(bus.clone());
//! let hub = SubscriptionHub::new(InMemorySubscriptionStore::default(), store.clone(), bus);
//!
//! let (tx, mut rx) = mpsc::unbounded_channel();
//! let handle = hub
//!     .subscribe_to_stream("orders:1", "auditor", tx, SubscriptionOptions::default())
//!     .await?;
//!
//! store.append(
//!     "orders:1",
//!     vec![EventData::new("order_placed", serde_json::json!({ "id": 1 }))],
//! );
//!
//! while let Some(batch) = rx.recv().await {
//!     // Process the batch, then acknowledge it so delivery can continue.
//!     handle.ack_events(&batch);
//! }
//! # Ok(())
//! # }
//! ```

mod actor;
mod catchup;
mod state;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use uuid::Uuid;

use crate::bus::Bus;
use crate::event::{Cursor, Position, RecordedEvent, ALL_STREAMS};
use crate::reader::EventReader;
use crate::store::{StoreError, SubscriptionStore};
use crate::subscription::actor::{Command, SubscriptionActor};

pub use self::catchup::CatchUpError;
pub use self::state::WrongAck;

/// Default bound on the number of buffered, undelivered events per
/// subscription before it parks at max capacity.
pub const DEFAULT_MAX_SIZE: usize = 1000;

/// Default size of the batches pulled from the historical reader while
/// catching up.
pub const DEFAULT_READ_BATCH_SIZE: usize = 100;

/// Channel end the core delivers event batches on.
pub(crate) type Delivery = mpsc::UnboundedSender<Vec<RecordedEvent>>;

/// Options accepted when opening a subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    /// Global event number the subscription starts after (0 = origin). Only
    /// meaningful for all-streams subscriptions; ignored when the checkpoint
    /// row already exists.
    pub start_from_event_number: Cursor,
    /// Stream version the subscription starts after (0 = origin). Only
    /// meaningful for single-stream subscriptions; ignored when the
    /// checkpoint row already exists.
    pub start_from_stream_version: Cursor,
    /// Bound on the in-memory buffer of undelivered events.
    pub max_size: usize,
    /// Size of the batches pulled from the historical reader.
    pub read_batch_size: usize,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            start_from_event_number: 0,
            start_from_stream_version: 0,
            max_size: DEFAULT_MAX_SIZE,
            read_batch_size: DEFAULT_READ_BATCH_SIZE,
        }
    }
}

impl SubscriptionOptions {
    fn start_position(&self) -> Position {
        Position {
            event_number: self.start_from_event_number,
            stream_version: self.start_from_stream_version,
        }
    }
}

/// An acknowledgement from the subscriber.
///
/// A bare [`Cursor`] is interpreted as the cursor component relevant to the
/// subscription kind; a [`Position`] carries both components. Acking with a
/// [`RecordedEvent`] reference (or a batch, which acks its last event) is the
/// primary form and always checkpoints the exact position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// The kind-relative cursor of the last processed event.
    Cursor(Cursor),
    /// The full position of the last processed event.
    Position(Position),
}

impl Ack {
    pub(crate) fn cursor(&self, kind: crate::event::SubscriptionKind) -> Cursor {
        match self {
            Ack::Cursor(cursor) => *cursor,
            Ack::Position(position) => position.cursor(kind),
        }
    }
}

impl From<Cursor> for Ack {
    fn from(cursor: Cursor) -> Self {
        Ack::Cursor(cursor)
    }
}

impl From<Position> for Ack {
    fn from(position: Position) -> Self {
        Ack::Position(position)
    }
}

impl From<&RecordedEvent> for Ack {
    fn from(event: &RecordedEvent) -> Self {
        Ack::Position(event.position())
    }
}

/// Error returned when opening a subscription fails.
#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    /// A live subscription already exists for this
    /// `(stream key, subscription name)` pair.
    #[error("subscription already exists")]
    AlreadyExists,

    /// The checkpoint store failed; typically a transport error.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Handle to a running subscription.
///
/// Cloning the handle does not duplicate the subscription; all clones talk to
/// the same actor.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    stream_key: String,
    subscription_name: String,
    actor_id: Uuid,
    commands: mpsc::UnboundedSender<Command>,
}

impl SubscriptionHandle {
    /// Key of the subscribed stream.
    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    /// Name of the subscription.
    pub fn subscription_name(&self) -> &str {
        &self.subscription_name
    }

    /// Acknowledges delivery up to a cursor, position or event.
    ///
    /// Fire-and-forget: an ack sent to a subscription that has already been
    /// torn down is dropped.
    pub fn ack(&self, ack: impl Into<Ack>) {
        let _ = self.commands.send(Command::Ack(ack.into()));
    }

    /// Acknowledges a delivered batch by its last event.
    pub fn ack_events(&self, events: &[RecordedEvent]) {
        if let Some(last) = events.last() {
            self.ack(last);
        }
    }

    /// Returns `true` iff the subscription is currently live (caught up and
    /// receiving pushed events).
    pub async fn is_subscribed(&self) -> bool {
        let (reply, answer) = oneshot::channel();

        if self.commands.send(Command::IsSubscribed(reply)).is_err() {
            return false;
        }

        answer.await.unwrap_or(false)
    }

    /// Whether the owning actor has terminated.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Asks the actor to unsubscribe; `None` when it is already gone.
    pub(crate) async fn unsubscribe(&self) -> Option<Result<(), StoreError>> {
        let (reply, answer) = oneshot::channel();

        if self.commands.send(Command::Unsubscribe(reply)).is_err() {
            return None;
        }

        answer.await.ok()
    }
}

type Registry = Arc<Mutex<HashMap<(String, String), SubscriptionHandle>>>;

/// Entry point of the subscription core: owns one actor per subscription and
/// wires it to the checkpoint store, the historical reader and the bus.
#[derive(Debug)]
pub struct SubscriptionHub<S, R> {
    store: Arc<S>,
    reader: Arc<R>,
    bus: Bus,
    registry: Registry,
    /// Serializes subscribe and unsubscribe flows. A subscription must never
    /// be opened against a checkpoint row a concurrent unsubscribe is still
    /// deleting, or its acks would land in a row that no longer exists.
    lifecycle: AsyncMutex<()>,
}

impl<S, R> SubscriptionHub<S, R>
where
    S: SubscriptionStore,
    R: EventReader,
{
    /// Creates a hub over the given storage seams and broadcast bus.
    pub fn new(store: S, reader: R, bus: Bus) -> Self {
        Self {
            store: Arc::new(store),
            reader: Arc::new(reader),
            bus,
            registry: Arc::new(Mutex::new(HashMap::new())),
            lifecycle: AsyncMutex::new(()),
        }
    }

    /// The bus this hub's subscriptions listen on. The writer must publish
    /// every committed batch on it.
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Opens (or resumes) a named subscription on a single stream.
    ///
    /// The subscriber receives batches of [`RecordedEvent`]s on its channel
    /// and must acknowledge each batch with a cursor no later than the
    /// batch's last event. Transport errors from the checkpoint store bubble
    /// out; a second live subscription on the same pair is refused.
    pub async fn subscribe_to_stream(
        &self,
        stream_key: &str,
        subscription_name: &str,
        subscriber: mpsc::UnboundedSender<Vec<RecordedEvent>>,
        options: SubscriptionOptions,
    ) -> Result<SubscriptionHandle, SubscribeError> {
        self.subscribe(stream_key, subscription_name, subscriber, options)
            .await
    }

    /// Opens (or resumes) a named subscription on every stream in the store,
    /// in global append order.
    pub async fn subscribe_to_all_streams(
        &self,
        subscription_name: &str,
        subscriber: mpsc::UnboundedSender<Vec<RecordedEvent>>,
        options: SubscriptionOptions,
    ) -> Result<SubscriptionHandle, SubscribeError> {
        self.subscribe(ALL_STREAMS, subscription_name, subscriber, options)
            .await
    }

    /// Like [`subscribe_to_stream`](Self::subscribe_to_stream), delivering
    /// `mapper(event)` values instead of raw events, in the same order.
    pub async fn subscribe_to_stream_mapped<T, F>(
        &self,
        stream_key: &str,
        subscription_name: &str,
        subscriber: mpsc::UnboundedSender<Vec<T>>,
        mapper: F,
        options: SubscriptionOptions,
    ) -> Result<SubscriptionHandle, SubscribeError>
    where
        T: Send + 'static,
        F: Fn(RecordedEvent) -> T + Send + 'static,
    {
        let (delivery, mut raw) = mpsc::unbounded_channel::<Vec<RecordedEvent>>();

        // Bridge task applying the mapper; dropping either end tears down
        // the other, preserving the subscriber/actor lifetime link.
        tokio::spawn(async move {
            while let Some(batch) = raw.recv().await {
                let mapped = batch.into_iter().map(&mapper).collect();
                if subscriber.send(mapped).is_err() {
                    break;
                }
            }
        });

        self.subscribe(stream_key, subscription_name, delivery, options)
            .await
    }

    /// Like [`subscribe_to_all_streams`](Self::subscribe_to_all_streams),
    /// delivering `mapper(event)` values instead of raw events.
    pub async fn subscribe_to_all_streams_mapped<T, F>(
        &self,
        subscription_name: &str,
        subscriber: mpsc::UnboundedSender<Vec<T>>,
        mapper: F,
        options: SubscriptionOptions,
    ) -> Result<SubscriptionHandle, SubscribeError>
    where
        T: Send + 'static,
        F: Fn(RecordedEvent) -> T + Send + 'static,
    {
        self.subscribe_to_stream_mapped(ALL_STREAMS, subscription_name, subscriber, mapper, options)
            .await
    }

    /// Deletes the subscription's durable checkpoint and tears down its
    /// actor, if one is running. Unknown subscriptions are not an error.
    pub async fn unsubscribe_from_stream(
        &self,
        stream_key: &str,
        subscription_name: &str,
    ) -> Result<(), StoreError> {
        let key = (stream_key.to_owned(), subscription_name.to_owned());

        // The registry entry must stay visible to concurrent subscribes until
        // the checkpoint row is actually gone. Removing it first would let a
        // resubscribe open a new actor against the doomed row and then lose
        // every ack once the queued delete lands.
        let _lifecycle = self.lifecycle.lock().await;

        let handle = self.registry.lock().get(&key).cloned();

        let result = match &handle {
            Some(handle) => match handle.unsubscribe().await {
                Some(result) => result,
                // The actor died before replying: delete the row here.
                None => self.store.unsubscribe(stream_key, subscription_name).await,
            },
            None => self.store.unsubscribe(stream_key, subscription_name).await,
        };

        if let Some(handle) = handle {
            let mut registry = self.registry.lock();
            if registry
                .get(&key)
                .is_some_and(|existing| existing.actor_id == handle.actor_id)
            {
                registry.remove(&key);
            }
        }

        result
    }

    async fn subscribe(
        &self,
        stream_key: &str,
        subscription_name: &str,
        delivery: Delivery,
        options: SubscriptionOptions,
    ) -> Result<SubscriptionHandle, SubscribeError> {
        let key = (stream_key.to_owned(), subscription_name.to_owned());

        // Serialized against other subscribes and unsubscribes: once past the
        // registry check, the key cannot gain a competing live entry, and no
        // unsubscribe can delete the checkpoint row underneath the new actor.
        let _lifecycle = self.lifecycle.lock().await;

        {
            let mut registry = self.registry.lock();
            if let Some(existing) = registry.get(&key) {
                if !existing.is_closed() {
                    return Err(SubscribeError::AlreadyExists);
                }
                // Stale handle left behind by a crashed actor.
                registry.remove(&key);
            }
        }

        let checkpoint = self
            .store
            .subscribe(stream_key, subscription_name, options.start_position())
            .await?;

        tracing::debug!(
            subscription.name = %subscription_name,
            stream.key = %stream_key,
            checkpoint.event_number = checkpoint.last_seen_event_number,
            checkpoint.stream_version = checkpoint.last_seen_stream_version,
            "resuming subscription from checkpoint"
        );

        let bus_rx = self.bus.register(stream_key);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let handle = SubscriptionHandle {
            stream_key: stream_key.to_owned(),
            subscription_name: subscription_name.to_owned(),
            actor_id: Uuid::new_v4(),
            commands: commands_tx.clone(),
        };

        self.registry.lock().insert(key.clone(), handle.clone());

        let actor = SubscriptionActor::new(
            stream_key.to_owned(),
            subscription_name.to_owned(),
            options.max_size,
            options.read_batch_size,
            Arc::clone(&self.store),
            Arc::clone(&self.reader),
            delivery,
            commands_tx,
            commands_rx,
        );

        let registry = Arc::clone(&self.registry);
        let actor_id = handle.actor_id;
        tokio::spawn(async move {
            actor.run(checkpoint, bus_rx).await;

            // Deregister on the way out, unless a newer actor already took
            // the slot after this one crashed.
            let mut registry = registry.lock();
            if registry
                .get(&key)
                .is_some_and(|handle| handle.actor_id == actor_id)
            {
                registry.remove(&key);
            }
        });

        Ok(handle)
    }
}

//! The per-subscription state machine.
//!
//! [`SubscriptionFsm::transition`] is a pure function from an [`Input`] to a
//! list of [`Effect`]s; all I/O (checkpointing, spawning the catch-up worker,
//! delivering batches) is applied by the owning actor. This keeps the policy
//! reconciling the historical reader with the live broadcast bus testable
//! without a runtime.

use std::collections::VecDeque;

use crate::event::{correlation_chunks, Cursor, Position, RecordedEvent, SubscriptionKind};
use crate::store::StoredSubscription;
use crate::subscription::Ack;

/// The lifecycle states of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Initial,
    RequestCatchUp,
    CatchingUp,
    Subscribed,
    MaxCapacity,
    Unsubscribed,
    Failed,
}

/// Events accepted by the state machine.
#[derive(Debug)]
pub(crate) enum Input {
    /// The checkpoint row has been created or loaded.
    Subscribed(StoredSubscription),
    /// Request to start (or restart) historical catch-up.
    CatchUp,
    /// The catch-up worker exhausted its snapshot at the given cursor.
    CaughtUp(Cursor),
    /// A batch was published on the broadcast bus.
    Notify(Vec<RecordedEvent>),
    /// The subscriber acknowledged up to a cursor.
    Ack(Ack),
    /// Explicit unsubscribe.
    Unsubscribe,
}

/// Side effects requested by a transition, applied in order by the actor.
#[derive(Debug, PartialEq)]
pub(crate) enum Effect {
    /// Spawn a catch-up worker streaming events strictly after `from`.
    StartCatchUp { from: Cursor },
    /// Durably advance the checkpoint.
    PersistAck(Position),
    /// Forward a conforming ack to the running catch-up worker.
    ForwardAckToWorker(Cursor),
    /// Deliver the batches to the subscriber, in order.
    Deliver(Vec<Vec<RecordedEvent>>),
    /// Delete the checkpoint row.
    DeleteCheckpoint,
}

/// Ack protocol violation; fatal to the subscription, so that the enclosing
/// supervisor can restart it from the durable checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WrongAck {
    /// The acked cursor would move the subscription backwards.
    #[error("ack cursor {cursor} is behind the last acked cursor {last_ack}")]
    Backwards {
        /// The offending cursor.
        cursor: Cursor,
        /// The last acknowledged cursor.
        last_ack: Cursor,
    },

    /// The acked cursor refers to an event never delivered.
    #[error("ack cursor {cursor} is past the last seen cursor {last_seen}")]
    PastLastSeen {
        /// The offending cursor.
        cursor: Cursor,
        /// The last observed cursor.
        last_seen: Cursor,
    },
}

pub(crate) struct SubscriptionFsm {
    state: State,
    kind: SubscriptionKind,
    max_size: usize,
    /// Cursor of the last event observed from any source.
    last_seen: Cursor,
    /// Cursor of the last event acknowledged by the subscriber.
    last_ack: Cursor,
    /// Cursor of the last event seen on the broadcast bus, if any.
    last_received: Option<Cursor>,
    /// Position of the last durable ack.
    acked: Position,
    /// Positions delivered to the subscriber but not yet acknowledged,
    /// oldest first. Used to resolve bare-cursor acks into full positions.
    in_flight: VecDeque<Position>,
    /// Events observed on the bus but not yet deliverable, oldest first.
    /// Non-empty only while `last_ack < last_seen`; bounded by `max_size`.
    pending: VecDeque<RecordedEvent>,
}

impl SubscriptionFsm {
    pub(crate) fn new(kind: SubscriptionKind, max_size: usize) -> Self {
        Self {
            state: State::Initial,
            kind,
            max_size: max_size.max(1),
            last_seen: 0,
            last_ack: 0,
            last_received: None,
            acked: Position::default(),
            in_flight: VecDeque::new(),
            pending: VecDeque::new(),
        }
    }

    pub(crate) fn state(&self) -> State {
        self.state
    }

    pub(crate) fn is_live(&self) -> bool {
        self.state == State::Subscribed
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Marks the subscription as failed; absorbs every further input.
    pub(crate) fn fail(&mut self) {
        self.state = State::Failed;
    }

    pub(crate) fn transition(&mut self, input: Input) -> Result<Vec<Effect>, WrongAck> {
        match input {
            Input::Subscribed(checkpoint) => Ok(self.on_subscribed(checkpoint)),
            Input::CatchUp => Ok(self.on_catch_up()),
            Input::CaughtUp(seen) => Ok(self.on_caught_up(seen)),
            Input::Notify(events) => Ok(self.on_notify(events)),
            Input::Ack(ack) => self.on_ack(ack),
            Input::Unsubscribe => Ok(self.on_unsubscribe()),
        }
    }

    fn on_subscribed(&mut self, checkpoint: StoredSubscription) -> Vec<Effect> {
        if self.state != State::Initial {
            return Vec::new();
        }

        let cursor = checkpoint.cursor(self.kind);
        self.last_seen = cursor;
        self.last_ack = cursor;
        self.acked = checkpoint.position();
        self.state = State::RequestCatchUp;

        Vec::new()
    }

    fn on_catch_up(&mut self) -> Vec<Effect> {
        if self.state == State::Subscribed {
            self.state = State::RequestCatchUp;
            return Vec::new();
        }

        if self.state != State::RequestCatchUp {
            return Vec::new();
        }

        // Pended events carry cursors at or below `last_seen`; a worker
        // spawned now would overtake them and break delivery monotonicity.
        // Acks drain pending and re-request catch-up, so this resolves.
        if !self.pending.is_empty() {
            return Vec::new();
        }

        self.last_received = None;
        self.state = State::CatchingUp;

        vec![Effect::StartCatchUp { from: self.last_seen }]
    }

    fn on_caught_up(&mut self, seen: Cursor) -> Vec<Effect> {
        if self.state != State::CatchingUp {
            return Vec::new();
        }

        self.last_seen = self.last_seen.max(seen);

        // Any hint heard while catching up that the reader's snapshot did
        // not reach means new events exist: reconcile with another round.
        self.state = match self.last_received {
            None => State::Subscribed,
            Some(received) if received == seen => State::Subscribed,
            Some(_) => State::RequestCatchUp,
        };

        Vec::new()
    }

    fn on_notify(&mut self, events: Vec<RecordedEvent>) -> Vec<Effect> {
        let last = match events.last() {
            Some(event) => event.cursor(self.kind),
            None => return Vec::new(),
        };

        if self.state != State::Subscribed {
            // The bus is only a hint here; the reader will refetch.
            self.last_received = Some(last);
            return Vec::new();
        }

        let first = events[0].cursor(self.kind);
        let next_ack = self.last_ack + 1;
        let expected = self.last_seen + 1;
        self.last_received = Some(last);

        if first == next_ack {
            // Subscriber has acked everything previously sent: deliver the
            // writer's batch as published, without regrouping.
            self.last_seen = last;
            self.record_in_flight(&events);
            return vec![Effect::Deliver(vec![events])];
        }

        if first == expected {
            // In order relative to our bus view, but the subscriber still
            // owes acks for in-flight events: buffer until it catches up.
            self.last_seen = last;
            self.pending.extend(events);

            if self.pending.len() >= self.max_size {
                self.state = State::MaxCapacity;
            }

            return Vec::new();
        }

        // Gap relative to the expected cursor: discard the batch and let the
        // historical reader reconcile.
        self.state = State::RequestCatchUp;

        Vec::new()
    }

    fn on_ack(&mut self, ack: Ack) -> Result<Vec<Effect>, WrongAck> {
        if matches!(
            self.state,
            State::Initial | State::Unsubscribed | State::Failed
        ) {
            return Ok(Vec::new());
        }

        let cursor = ack.cursor(self.kind);

        if cursor == self.last_ack {
            // Re-acking the checkpoint is harmless.
            return Ok(Vec::new());
        }

        if cursor < self.last_ack {
            return Err(WrongAck::Backwards { cursor, last_ack: self.last_ack });
        }

        let catching_up = self.state == State::CatchingUp;

        // While catching up, chunks flow to the subscriber without passing
        // through this machine, so `last_seen` lags behind what was actually
        // delivered; the worker enforces the upper bound instead.
        if !catching_up && cursor > self.last_seen {
            return Err(WrongAck::PastLastSeen { cursor, last_seen: self.last_seen });
        }

        let position = self.resolve_position(ack, cursor);
        self.last_ack = cursor;
        self.last_seen = self.last_seen.max(cursor);
        self.acked = position;
        self.prune_in_flight(cursor);

        let mut effects = vec![Effect::PersistAck(position)];

        if catching_up {
            effects.push(Effect::ForwardAckToWorker(cursor));
        }

        effects.extend(self.drain_pending());

        if self.state == State::MaxCapacity && self.pending.is_empty() {
            // Hints were discarded while parked: reconcile via catch-up.
            self.state = State::RequestCatchUp;
        }

        Ok(effects)
    }

    fn on_unsubscribe(&mut self) -> Vec<Effect> {
        match self.state {
            State::Unsubscribed | State::Failed => Vec::new(),
            _ => {
                self.state = State::Unsubscribed;
                vec![Effect::DeleteCheckpoint]
            }
        }
    }

    fn drain_pending(&mut self) -> Vec<Effect> {
        let front = match self.pending.front() {
            Some(event) => event.cursor(self.kind),
            None => return Vec::new(),
        };

        if front != self.last_ack + 1 {
            // Subscriber has only partially acked the in-flight events.
            return Vec::new();
        }

        let events: Vec<RecordedEvent> = self.pending.drain(..).collect();
        self.record_in_flight(&events);

        vec![Effect::Deliver(correlation_chunks(events))]
    }

    fn record_in_flight(&mut self, events: &[RecordedEvent]) {
        self.in_flight.extend(events.iter().map(RecordedEvent::position));
    }

    fn prune_in_flight(&mut self, acked: Cursor) {
        while self
            .in_flight
            .front()
            .is_some_and(|position| position.cursor(self.kind) <= acked)
        {
            self.in_flight.pop_front();
        }
    }

    /// Resolves an ack into the full position to checkpoint. A bare cursor
    /// is looked up among in-flight deliveries; catch-up chunks never pass
    /// through this machine, so their bare acks carry the previous
    /// checkpoint's other component forward.
    fn resolve_position(&self, ack: Ack, cursor: Cursor) -> Position {
        if let Ack::Position(position) = ack {
            return position;
        }

        self.in_flight
            .iter()
            .find(|position| position.cursor(self.kind) == cursor)
            .copied()
            .unwrap_or(match self.kind {
                SubscriptionKind::AllStreams => Position {
                    event_number: cursor,
                    stream_version: self.acked.stream_version,
                },
                SubscriptionKind::Stream => Position {
                    event_number: self.acked.event_number,
                    stream_version: cursor,
                },
            })
    }
}

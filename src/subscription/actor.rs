//! The per-subscription actor: exclusive owner of the state machine.
//!
//! Every event touching a subscription (bus notifications, acks, catch-up
//! completion, unsubscribe) is serialized through the actor's mailbox, so
//! the state machine never needs a lock. The subscriber and the actor are
//! linked through channel closure in both directions: a dropped subscriber
//! tears the actor down, and a dead actor closes the subscriber's channel.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};

use crate::bus::Published;
use crate::event::{Cursor, SubscriptionKind};
use crate::reader::EventReader;
use crate::store::{StoreError, SubscriptionStore, StoredSubscription};
use crate::subscription::catchup::{CatchUpError, CatchUpWorker};
use crate::subscription::state::{Effect, Input, State, SubscriptionFsm};
use crate::subscription::{Ack, Delivery};

/// Commands accepted by the actor's mailbox.
#[derive(Debug)]
pub(crate) enum Command {
    /// A batch published on the broadcast bus (via the relay task).
    Notify(Published),
    /// Acknowledgement from the subscriber.
    Ack(Ack),
    /// The catch-up worker exhausted its snapshot.
    CaughtUp(Cursor),
    /// The catch-up worker failed; fatal.
    CatchUpFailed(CatchUpError),
    /// Self-posted request to start a catch-up round.
    CatchUp,
    /// Synchronous unsubscribe; deletes the checkpoint.
    Unsubscribe(oneshot::Sender<Result<(), StoreError>>),
    /// Synchronous "is the subscription live?" probe.
    IsSubscribed(oneshot::Sender<bool>),
}

/// Why the actor's loop ended.
enum Exit {
    /// The subscriber closed its end of the delivery channel.
    SubscriberGone,
    /// The checkpoint store failed while acking or deleting.
    Store(StoreError),
    /// Ack protocol violation or catch-up failure; see the log.
    Failed,
}

pub(crate) struct SubscriptionActor<S, R> {
    stream_key: String,
    subscription_name: String,
    kind: SubscriptionKind,
    fsm: SubscriptionFsm,
    store: Arc<S>,
    reader: Arc<R>,
    delivery: Delivery,
    read_batch_size: usize,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    worker_acks: Option<mpsc::UnboundedSender<Cursor>>,
}

impl<S, R> SubscriptionActor<S, R>
where
    S: SubscriptionStore,
    R: EventReader,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        stream_key: String,
        subscription_name: String,
        max_size: usize,
        read_batch_size: usize,
        store: Arc<S>,
        reader: Arc<R>,
        delivery: Delivery,
        commands_tx: mpsc::UnboundedSender<Command>,
        commands_rx: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let kind = SubscriptionKind::of(&stream_key);

        Self {
            stream_key,
            subscription_name,
            kind,
            fsm: SubscriptionFsm::new(kind, max_size),
            store,
            reader,
            delivery,
            read_batch_size,
            commands_tx,
            commands_rx,
            worker_acks: None,
        }
    }

    /// Runs the subscription until unsubscribe, subscriber death or failure.
    pub(crate) async fn run(
        mut self,
        checkpoint: StoredSubscription,
        bus: broadcast::Receiver<Published>,
    ) {
        tokio::spawn(relay_bus(
            bus,
            self.commands_tx.clone(),
            self.subscription_name.clone(),
        ));

        if let Err(exit) = self.apply(Input::Subscribed(checkpoint)).await {
            self.log_exit(&exit);
            return;
        }

        loop {
            tokio::select! {
                command = self.commands_rx.recv() => {
                    let Some(command) = command else { break };

                    match self.handle(command).await {
                        Ok(true) => continue,
                        Ok(false) => break,
                        Err(exit) => {
                            self.log_exit(&exit);
                            break;
                        }
                    }
                }
                () = self.delivery.closed() => {
                    self.log_exit(&Exit::SubscriberGone);
                    break;
                }
            }
        }
    }

    /// Handles one command; `Ok(false)` requests a clean shutdown.
    async fn handle(&mut self, command: Command) -> Result<bool, Exit> {
        match command {
            Command::Notify(batch) => {
                self.apply(Input::Notify((*batch).clone())).await?;
            }
            Command::Ack(ack) => {
                self.apply(Input::Ack(ack)).await?;
            }
            Command::CaughtUp(last_seen) => {
                self.worker_acks = None;
                self.apply(Input::CaughtUp(last_seen)).await?;
            }
            Command::CatchUpFailed(error) => {
                tracing::error!(
                    subscription.name = %self.subscription_name,
                    stream.key = %self.stream_key,
                    error = %error,
                    "catch-up worker failed"
                );
                self.fsm.fail();
                return Err(Exit::Failed);
            }
            Command::CatchUp => {
                self.apply(Input::CatchUp).await?;
            }
            Command::IsSubscribed(reply) => {
                let _ = reply.send(self.fsm.is_live());
            }
            Command::Unsubscribe(reply) => {
                let mut result = Ok(());

                for effect in self.fsm.transition(Input::Unsubscribe).unwrap_or_default() {
                    if effect == Effect::DeleteCheckpoint {
                        result = self
                            .store
                            .unsubscribe(&self.stream_key, &self.subscription_name)
                            .await;
                    }
                }

                tracing::debug!(
                    subscription.name = %self.subscription_name,
                    stream.key = %self.stream_key,
                    "unsubscribed"
                );

                let _ = reply.send(result);
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Feeds one input through the state machine and applies its effects.
    async fn apply(&mut self, input: Input) -> Result<(), Exit> {
        let was = self.fsm.state();
        let from_catch_up = matches!(input, Input::CatchUp);

        let effects = match self.fsm.transition(input) {
            Ok(effects) => effects,
            Err(wrong_ack) => {
                tracing::error!(
                    subscription.name = %self.subscription_name,
                    stream.key = %self.stream_key,
                    error = %wrong_ack,
                    "ack protocol violation, failing the subscription"
                );
                self.fsm.fail();
                return Err(Exit::Failed);
            }
        };

        for effect in effects {
            self.run_effect(effect).await?;
        }

        self.after_transition(was, from_catch_up);

        Ok(())
    }

    async fn run_effect(&mut self, effect: Effect) -> Result<(), Exit> {
        match effect {
            Effect::StartCatchUp { from } => {
                tracing::debug!(
                    subscription.name = %self.subscription_name,
                    stream.key = %self.stream_key,
                    catch_up.from = from,
                    "starting catch-up"
                );

                let (ack_tx, ack_rx) = mpsc::unbounded_channel();
                self.worker_acks = Some(ack_tx);

                tokio::spawn(
                    CatchUpWorker {
                        reader: Arc::clone(&self.reader),
                        stream_key: self.stream_key.clone(),
                        kind: self.kind,
                        from,
                        batch_size: self.read_batch_size,
                        delivery: self.delivery.clone(),
                        acks: ack_rx,
                        commands: self.commands_tx.clone(),
                    }
                    .run(),
                );
            }
            Effect::PersistAck(position) => {
                self.store
                    .ack(&self.stream_key, &self.subscription_name, position)
                    .await
                    .map_err(Exit::Store)?;
            }
            Effect::ForwardAckToWorker(cursor) => {
                if let Some(acks) = &self.worker_acks {
                    let _ = acks.send(cursor);
                }
            }
            Effect::Deliver(batches) => {
                for batch in batches {
                    if self.delivery.send(batch).is_err() {
                        return Err(Exit::SubscriberGone);
                    }
                }
            }
            Effect::DeleteCheckpoint => {
                self.store
                    .unsubscribe(&self.stream_key, &self.subscription_name)
                    .await
                    .map_err(Exit::Store)?;
            }
        }

        Ok(())
    }

    /// Mirrors the state the machine settled in: entering `RequestCatchUp`
    /// self-posts a catch-up request, entering `MaxCapacity` logs a warning.
    ///
    /// The self-post is suppressed when the input itself was `CatchUp`: a
    /// deferred catch-up (pending events undrained) stays in
    /// `RequestCatchUp`, and re-posting from its own no-op would spin.
    fn after_transition(&mut self, was: State, from_catch_up: bool) {
        let state = self.fsm.state();

        if state == State::MaxCapacity && was != State::MaxCapacity {
            tracing::warn!(
                subscription.name = %self.subscription_name,
                stream.key = %self.stream_key,
                pending = self.fsm.pending_len(),
                "subscription parked at max capacity until the subscriber acks"
            );
        }

        if state == State::RequestCatchUp && !from_catch_up {
            let _ = self.commands_tx.send(Command::CatchUp);
        }
    }

    fn log_exit(&self, exit: &Exit) {
        match exit {
            Exit::SubscriberGone => tracing::debug!(
                subscription.name = %self.subscription_name,
                stream.key = %self.stream_key,
                "subscriber went away, shutting the subscription down"
            ),
            Exit::Store(error) => tracing::error!(
                subscription.name = %self.subscription_name,
                stream.key = %self.stream_key,
                error = %error,
                "checkpoint store failed, shutting the subscription down"
            ),
            Exit::Failed => {}
        }
    }
}

/// Forwards batches published on the bus into the actor's mailbox.
///
/// Lagging behind the bus only loses hints: the state machine detects the
/// resulting gap and reconciles through catch-up.
async fn relay_bus(
    mut bus: broadcast::Receiver<Published>,
    commands: mpsc::UnboundedSender<Command>,
    subscription_name: String,
) {
    loop {
        match bus.recv().await {
            Ok(batch) => {
                if commands.send(Command::Notify(batch)).is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(
                    subscription.name = %subscription_name,
                    missed,
                    "subscription lagged behind the bus, dropped hints"
                );
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

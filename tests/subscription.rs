//! End-to-end subscription flows over the in-memory backends: catch-up,
//! live handover, ack-gated flow control, parking and restart resumption.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use eventide::bus::Bus;
use eventide::event::{EventData, RecordedEvent};
use eventide::inmemory::{InMemoryEventStore, InMemorySubscriptionStore};
use eventide::store::{StoreError, SubscriptionStore};
use eventide::subscription::{
    SubscribeError, SubscriptionHandle, SubscriptionHub, SubscriptionOptions,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(100);

type Hub = SubscriptionHub<InMemorySubscriptionStore, InMemoryEventStore>;

struct Fixture {
    hub: Hub,
    events: InMemoryEventStore,
    checkpoints: InMemorySubscriptionStore,
}

fn fixture() -> Fixture {
    let bus = Bus::default();
    let events = InMemoryEventStore::new(bus.clone());
    let checkpoints = InMemorySubscriptionStore::default();
    let hub = SubscriptionHub::new(checkpoints.clone(), events.clone(), bus);

    Fixture {
        hub,
        events,
        checkpoints,
    }
}

fn order_placed() -> EventData {
    EventData::new("order_placed", serde_json::json!({ "total": 42 }))
}

async fn recv_batch(rx: &mut mpsc::UnboundedReceiver<Vec<RecordedEvent>>) -> Vec<RecordedEvent> {
    timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for a delivery")
        .expect("delivery channel closed")
}

async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Vec<RecordedEvent>>) {
    assert!(
        timeout(QUIET, rx.recv()).await.is_err(),
        "expected no further delivery"
    );
}

async fn wait_until_live(handle: &SubscriptionHandle) {
    for _ in 0..500 {
        if handle.is_subscribed().await {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("subscription never went live");
}

async fn wait_until_closed(handle: &SubscriptionHandle) {
    for _ in 0..500 {
        if handle.is_closed() {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("subscription actor never terminated");
}

/// Acks are fire-and-forget, so checkpoint assertions poll for the write.
async fn wait_for_checkpoint(
    checkpoints: &InMemorySubscriptionStore,
    stream_key: &str,
    name: &str,
    expected: (u64, u64),
) {
    for _ in 0..500 {
        if let Ok(row) = checkpoints.query(stream_key, name).await {
            if (row.last_seen_event_number, row.last_seen_stream_version) == expected {
                return;
            }
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("checkpoint never reached {expected:?}");
}

#[tokio::test]
async fn live_append_is_delivered_as_one_batch_with_global_numbering() {
    let fx = fixture();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let handle = fx
        .hub
        .subscribe_to_stream("X", "s", tx, SubscriptionOptions::default())
        .await
        .expect("subscribe");
    wait_until_live(&handle).await;

    // Events on other streams shift the global numbering but are invisible
    // to a single-stream subscription.
    fx.events.append("Y", vec![order_placed(), order_placed(), order_placed()]);
    fx.events.append("X", vec![order_placed(), order_placed(), order_placed()]);

    let batch = recv_batch(&mut rx).await;

    let numbers: Vec<u64> = batch.iter().map(|e| e.event_number).collect();
    let versions: Vec<u64> = batch.iter().map(|e| e.stream_version).collect();
    assert_eq!(vec![4, 5, 6], numbers);
    assert_eq!(vec![1, 2, 3], versions);

    handle.ack_events(&batch);
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn start_from_cursor_skips_already_seen_events() {
    let fx = fixture();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let options = SubscriptionOptions {
        start_from_stream_version: 1,
        ..SubscriptionOptions::default()
    };
    let handle = fx
        .hub
        .subscribe_to_stream("X", "s", tx, options)
        .await
        .expect("subscribe");
    wait_until_live(&handle).await;

    fx.events.append("X", vec![order_placed()]);
    fx.events.append("X", vec![order_placed()]);

    let batch = recv_batch(&mut rx).await;

    assert_eq!(1, batch.len());
    assert_eq!(2, batch[0].stream_version);

    handle.ack_events(&batch);
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn mapped_subscriptions_deliver_mapped_values_in_order() {
    let fx = fixture();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u64>>();

    let handle = fx
        .hub
        .subscribe_to_stream_mapped(
            "X",
            "s",
            tx,
            |event| event.event_number,
            SubscriptionOptions::default(),
        )
        .await
        .expect("subscribe");
    wait_until_live(&handle).await;

    fx.events.append("Y", vec![order_placed(), order_placed(), order_placed()]);
    fx.events.append("X", vec![order_placed(), order_placed(), order_placed()]);

    let batch = timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for a delivery")
        .expect("delivery channel closed");

    assert_eq!(vec![4, 5, 6], batch);

    // The mapper dropped the events, so ack with the bare cursor.
    handle.ack(3u64);
}

#[tokio::test]
async fn subscribing_twice_with_the_same_name_is_refused() {
    let fx = fixture();
    let (first_tx, _first_rx) = mpsc::unbounded_channel();
    let (second_tx, _second_rx) = mpsc::unbounded_channel();

    let _handle = fx
        .hub
        .subscribe_to_stream("X", "s", first_tx, SubscriptionOptions::default())
        .await
        .expect("first subscribe");

    let error = fx
        .hub
        .subscribe_to_stream("X", "s", second_tx, SubscriptionOptions::default())
        .await
        .expect_err("second subscribe must be refused");

    assert!(matches!(error, SubscribeError::AlreadyExists));
}

#[tokio::test]
async fn delivery_pauses_until_in_flight_events_are_fully_acked() {
    let fx = fixture();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let handle = fx
        .hub
        .subscribe_to_stream("X", "s", tx, SubscriptionOptions::default())
        .await
        .expect("subscribe");
    wait_until_live(&handle).await;

    fx.events.append("X", vec![order_placed(), order_placed(), order_placed()]);
    let first = recv_batch(&mut rx).await;
    assert_eq!(3, first.len());

    handle.ack(1u64);

    fx.events.append("X", vec![order_placed(), order_placed(), order_placed()]);
    assert_quiet(&mut rx).await;

    handle.ack(2u64);
    assert_quiet(&mut rx).await;

    handle.ack(3u64);
    let second = recv_batch(&mut rx).await;

    let versions: Vec<u64> = second.iter().map(|e| e.stream_version).collect();
    assert_eq!(vec![4, 5, 6], versions);

    handle.ack_events(&second);

    // The bare-cursor acks along the way still checkpointed both components.
    wait_for_checkpoint(&fx.checkpoints, "X", "s", (6, 6)).await;
}

#[tokio::test]
async fn acking_past_last_seen_kills_the_actor_and_restart_redelivers() {
    let fx = fixture();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let handle = fx
        .hub
        .subscribe_to_stream("X", "s", tx, SubscriptionOptions::default())
        .await
        .expect("subscribe");
    wait_until_live(&handle).await;

    fx.events.append("X", vec![order_placed()]);
    let batch = recv_batch(&mut rx).await;
    assert_eq!(1, batch[0].stream_version);

    handle.ack(99u64);
    wait_until_closed(&handle).await;
    assert!(!handle.is_subscribed().await);

    // Restarting (as a supervisor would) resumes from the durable
    // checkpoint: nothing was acked, so the event is delivered again.
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = fx
        .hub
        .subscribe_to_stream("X", "s", tx, SubscriptionOptions::default())
        .await
        .expect("re-subscribe after crash");

    let redelivered = recv_batch(&mut rx).await;
    assert_eq!(1, redelivered[0].stream_version);
    handle.ack_events(&redelivered);
}

#[tokio::test]
async fn delivery_resumes_past_the_checkpoint_after_subscriber_restart() {
    let fx = fixture();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let handle = fx
        .hub
        .subscribe_to_stream("X", "s", tx, SubscriptionOptions::default())
        .await
        .expect("subscribe");
    wait_until_live(&handle).await;

    fx.events.append("X", vec![order_placed(), order_placed()]);
    let batch = recv_batch(&mut rx).await;
    handle.ack_events(&batch);

    // Wait for the durable ack before killing the subscriber.
    wait_for_checkpoint(&fx.checkpoints, "X", "s", (2, 2)).await;

    drop(rx);
    wait_until_closed(&handle).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = fx
        .hub
        .subscribe_to_stream("X", "s", tx, SubscriptionOptions::default())
        .await
        .expect("re-subscribe");
    wait_until_live(&handle).await;

    fx.events.append("X", vec![order_placed()]);
    let batch = recv_batch(&mut rx).await;

    // Strictly past the acked cursor: no duplicates of versions 1 and 2.
    assert_eq!(1, batch.len());
    assert_eq!(3, batch[0].stream_version);
    handle.ack_events(&batch);
}

#[tokio::test]
async fn unsubscribe_deletes_the_checkpoint_and_resubscribe_starts_fresh() {
    let fx = fixture();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let handle = fx
        .hub
        .subscribe_to_stream("X", "s", tx, SubscriptionOptions::default())
        .await
        .expect("subscribe");
    wait_until_live(&handle).await;

    fx.events.append("X", vec![order_placed(), order_placed()]);
    let batch = recv_batch(&mut rx).await;
    handle.ack_events(&batch);

    fx.hub
        .unsubscribe_from_stream("X", "s")
        .await
        .expect("unsubscribe");

    assert!(matches!(
        fx.checkpoints.query("X", "s").await,
        Err(StoreError::NotFound)
    ));

    // Resubscribing honours the new starting cursor instead of the old
    // checkpoint.
    let (tx, mut rx) = mpsc::unbounded_channel();
    let options = SubscriptionOptions {
        start_from_stream_version: 2,
        ..SubscriptionOptions::default()
    };
    let handle = fx
        .hub
        .subscribe_to_stream("X", "s", tx, options)
        .await
        .expect("re-subscribe");
    wait_until_live(&handle).await;

    fx.events.append("X", vec![order_placed()]);
    let batch = recv_batch(&mut rx).await;

    assert_eq!(3, batch[0].stream_version);
    handle.ack_events(&batch);
}

#[tokio::test]
async fn unsubscribe_racing_a_resubscribe_never_strands_the_checkpoint() {
    let fx = fixture();
    let (tx, _rx) = mpsc::unbounded_channel();

    let handle = fx
        .hub
        .subscribe_to_stream("X", "s", tx, SubscriptionOptions::default())
        .await
        .expect("subscribe");
    wait_until_live(&handle).await;

    // Whichever way this race resolves, the surviving subscription's acks
    // must keep landing in a checkpoint row that exists.
    let (tx2, rx2) = mpsc::unbounded_channel();
    let (unsubscribed, resubscribed) = tokio::join!(
        fx.hub.unsubscribe_from_stream("X", "s"),
        fx.hub
            .subscribe_to_stream("X", "s", tx2, SubscriptionOptions::default()),
    );
    unsubscribed.expect("unsubscribe");

    let (handle, mut rx) = match resubscribed {
        Ok(handle) => (handle, rx2),
        // The resubscribe ran first and was refused; the unsubscribe has
        // completed by now, so trying again starts fresh.
        Err(SubscribeError::AlreadyExists) => {
            let (tx3, rx3) = mpsc::unbounded_channel();
            let handle = fx
                .hub
                .subscribe_to_stream("X", "s", tx3, SubscriptionOptions::default())
                .await
                .expect("re-subscribe after the unsubscribe completed");
            (handle, rx3)
        }
        Err(error) => panic!("unexpected subscribe failure: {error}"),
    };
    wait_until_live(&handle).await;

    fx.events.append("X", vec![order_placed()]);
    let batch = recv_batch(&mut rx).await;
    handle.ack_events(&batch);

    wait_for_checkpoint(&fx.checkpoints, "X", "s", (1, 1)).await;
}

#[tokio::test]
async fn all_streams_subscriptions_follow_global_order() {
    let fx = fixture();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let handle = fx
        .hub
        .subscribe_to_all_streams("firehose", tx, SubscriptionOptions::default())
        .await
        .expect("subscribe");
    wait_until_live(&handle).await;

    fx.events.append("X", vec![order_placed()]);
    fx.events.append("Y", vec![order_placed()]);
    fx.events.append("X", vec![order_placed()]);

    let mut seen = Vec::new();
    while seen.len() < 3 {
        let batch = recv_batch(&mut rx).await;
        seen.extend(batch.iter().map(|e| e.event_number));
        handle.ack_events(&batch);
    }

    assert_eq!(vec![1, 2, 3], seen);

    wait_for_checkpoint(&fx.checkpoints, "$all", "firehose", (3, 2)).await;
}

#[tokio::test]
async fn parked_subscription_drains_then_reconciles_missed_events() {
    let fx = fixture();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let options = SubscriptionOptions {
        max_size: 3,
        ..SubscriptionOptions::default()
    };
    let handle = fx
        .hub
        .subscribe_to_stream("X", "s", tx, options)
        .await
        .expect("subscribe");
    wait_until_live(&handle).await;

    fx.events.append("X", vec![order_placed()]);
    let first = recv_batch(&mut rx).await;
    assert_eq!(1, first[0].stream_version);

    // Unacked subscriber: these three buffer up to max_size and park the
    // subscription...
    fx.events.append("X", vec![order_placed()]);
    fx.events.append("X", vec![order_placed()]);
    fx.events.append("X", vec![order_placed()]);
    // ...and this one only leaves a hint behind.
    fx.events.append("X", vec![order_placed()]);

    assert_quiet(&mut rx).await;

    handle.ack_events(&first);

    let drained = recv_batch(&mut rx).await;
    let versions: Vec<u64> = drained.iter().map(|e| e.stream_version).collect();
    assert_eq!(vec![2, 3, 4], versions);

    // The hint discarded while parked is recovered through catch-up.
    let caught_up = recv_batch(&mut rx).await;
    assert_eq!(1, caught_up.len());
    assert_eq!(5, caught_up[0].stream_version);

    handle.ack_events(&drained);
    handle.ack_events(&caught_up);
    wait_until_live(&handle).await;
}

#[tokio::test]
async fn correlation_runs_are_delivered_as_separate_batches_during_catch_up() {
    let fx = fixture();

    // History recorded before anyone subscribes.
    let correlation = uuid::Uuid::new_v4();
    fx.events.append(
        "X",
        vec![
            order_placed().with_correlation_id(correlation),
            order_placed().with_correlation_id(correlation),
            order_placed(),
        ],
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = fx
        .hub
        .subscribe_to_stream("X", "s", tx, SubscriptionOptions::default())
        .await
        .expect("subscribe");

    let first = recv_batch(&mut rx).await;
    let versions: Vec<u64> = first.iter().map(|e| e.stream_version).collect();
    assert_eq!(vec![1, 2], versions);
    handle.ack_events(&first);

    let second = recv_batch(&mut rx).await;
    assert_eq!(3, second[0].stream_version);
    handle.ack_events(&second);

    wait_until_live(&handle).await;
}

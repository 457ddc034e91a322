#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use roomcast_domain::{ChatMessage, MessageId, RoomId, UserId};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::server::registry::{RegistryConfig, SubscriberItem, SubscriberRegistry};

fn room(id: i64) -> RoomId {
	RoomId::new(id).expect("valid RoomId")
}

fn registry(capacity: usize) -> SubscriberRegistry {
	SubscriberRegistry::new(RegistryConfig {
		subscriber_queue_capacity: capacity,
		debug_logs: false,
	})
}

fn msg(room_id: RoomId, id: i64, text: &str) -> Arc<ChatMessage> {
	Arc::new(ChatMessage {
		id: MessageId::new(id).expect("valid MessageId"),
		content: text.to_string(),
		sender_id: UserId::new(1).expect("valid UserId"),
		room_id,
		sender_name: "alice".to_string(),
		timestamp_unix_ms: 1_700_000_000_000,
	})
}

fn expect_message(item: Option<SubscriberItem>) -> Arc<ChatMessage> {
	match item {
		Some(SubscriberItem::Message(m)) => m,
		other => panic!("expected Message, got: {other:?}"),
	}
}

#[tokio::test]
async fn deliver_reaches_only_subscribers_of_that_room() {
	let reg = registry(16);
	let (room_a, room_b) = (room(1), room(2));

	let (_ha, mut rx_a) = reg.subscribe(room_a);
	let (_hb, mut rx_b) = reg.subscribe(room_b);

	let report = reg.deliver(room_b, msg(room_b, 1, "b-1"));
	assert_eq!(report.attempted, 1);
	assert_eq!(report.delivered, 1);

	assert!(
		timeout(Duration::from_millis(50), rx_a.recv()).await.is_err(),
		"subscriber for room A unexpectedly received an item for room B"
	);

	let got = expect_message(rx_b.recv().await);
	assert_eq!(got.content, "b-1");
}

#[tokio::test]
async fn deliver_to_empty_room_is_a_noop() {
	let reg = registry(16);
	let report = reg.deliver(room(9), msg(room(9), 1, "nobody"));
	assert_eq!(report.attempted, 0);
	assert_eq!(report.delivered, 0);
	assert_eq!(reg.subscriber_count(room(9)), 0);
}

#[tokio::test]
async fn same_endpoint_registered_twice_gets_two_entries() {
	let reg = registry(16);
	let r = room(1);
	let (tx, mut rx) = mpsc::channel(16);

	let h1 = reg.register(r, tx.clone());
	let h2 = reg.register(r, tx);
	assert_ne!(h1.id(), h2.id());
	assert_eq!(reg.subscriber_count(r), 2);

	let report = reg.deliver(r, msg(r, 1, "twice"));
	assert_eq!(report.delivered, 2);
	expect_message(rx.recv().await);
	expect_message(rx.recv().await);

	assert!(h1.deregister());
	assert_eq!(reg.subscriber_count(r), 1);
	assert!(h2.deregister());
	assert_eq!(reg.subscriber_count(r), 0);
}

#[tokio::test]
async fn deregister_is_idempotent_and_drop_releases() {
	let reg = registry(16);
	let r = room(1);

	let (handle, _rx) = reg.subscribe(r);
	assert_eq!(handle.room(), r);
	assert!(reg.deregister(&handle));
	assert!(!reg.deregister(&handle));
	assert!(!handle.deregister());
	assert_eq!(reg.subscriber_count(r), 0);
	drop(handle);
	assert_eq!(reg.subscriber_count(r), 0);

	{
		let (_handle, _rx) = reg.subscribe(r);
		assert_eq!(reg.subscriber_count(r), 1);
	}
	assert_eq!(reg.subscriber_count(r), 0);
	assert!(reg.room_subscriber_counts().is_empty());
}

#[tokio::test]
async fn full_queue_drops_without_blocking_and_owes_a_lag_marker() {
	let reg = registry(1);
	let r = room(1);

	let (_slow, mut slow_rx) = reg.subscribe(r);
	let (_fast, mut fast_rx) = reg.subscribe(r);

	let first = reg.deliver(r, msg(r, 1, "m1"));
	assert_eq!(first.delivered, 2);
	assert_eq!(expect_message(fast_rx.recv().await).content, "m1");

	// slow_rx still holds m1, so m2 is dropped for it only.
	let second = reg.deliver(r, msg(r, 2, "m2"));
	assert_eq!(second.delivered, 1);
	assert_eq!(second.dropped, 1);
	assert_eq!(expect_message(fast_rx.recv().await).content, "m2");
	assert_eq!(reg.subscriber_count(r), 2, "a lagging subscriber stays registered");

	assert_eq!(expect_message(slow_rx.recv().await).content, "m1");

	// Capacity 1: the lag marker fits, the message behind it does not.
	let third = reg.deliver(r, msg(r, 3, "m3"));
	assert_eq!(third.dropped, 1);
	assert_eq!(expect_message(fast_rx.recv().await).content, "m3");
	match slow_rx.recv().await {
		Some(SubscriberItem::Lagged { dropped }) => assert_eq!(dropped, 1),
		other => panic!("expected Lagged, got: {other:?}"),
	}

	let fourth = reg.deliver(r, msg(r, 4, "m4"));
	assert_eq!(fourth.delivered, 1);
	assert_eq!(fourth.dropped, 1);
	expect_message(fast_rx.recv().await);
	match slow_rx.recv().await {
		Some(SubscriberItem::Lagged { dropped }) => assert_eq!(dropped, 1),
		other => panic!("expected Lagged, got: {other:?}"),
	}
}

#[tokio::test]
async fn lag_marker_precedes_next_message_when_there_is_room() {
	let reg = registry(2);
	let r = room(1);
	let (_h, mut rx) = reg.subscribe(r);

	reg.deliver(r, msg(r, 1, "m1"));
	reg.deliver(r, msg(r, 2, "m2"));
	let dropped = reg.deliver(r, msg(r, 3, "m3"));
	assert_eq!(dropped.dropped, 1);

	assert_eq!(expect_message(rx.recv().await).content, "m1");
	assert_eq!(expect_message(rx.recv().await).content, "m2");

	let after = reg.deliver(r, msg(r, 4, "m4"));
	assert_eq!(after.delivered, 1);
	match rx.recv().await {
		Some(SubscriberItem::Lagged { dropped }) => assert_eq!(dropped, 1),
		other => panic!("expected Lagged, got: {other:?}"),
	}
	assert_eq!(expect_message(rx.recv().await).content, "m4");
}

#[tokio::test]
async fn closed_endpoint_is_pruned_on_deliver() {
	let reg = registry(16);
	let r = room(1);

	let (_gone, gone_rx) = reg.subscribe(r);
	let (_live, mut live_rx) = reg.subscribe(r);
	drop(gone_rx);

	let report = reg.deliver(r, msg(r, 1, "hello"));
	assert_eq!(report.closed, 1);
	assert_eq!(report.delivered, 1);
	assert_eq!(reg.subscriber_count(r), 1);
	assert_eq!(expect_message(live_rx.recv().await).content, "hello");
}

#[tokio::test]
async fn snapshot_is_unaffected_by_later_deregistration() {
	let reg = registry(16);
	let r = room(1);
	let (handle, mut rx) = reg.subscribe(r);

	let snapshot = reg.snapshot(r);
	assert_eq!(snapshot.len(), 1);

	handle.deregister();
	drop(handle);
	assert_eq!(reg.subscriber_count(r), 0);

	// A push through the stale snapshot lands harmlessly.
	for endpoint in &snapshot {
		let _ = endpoint.try_send(SubscriberItem::Message(msg(r, 1, "late")));
	}
	rx.close();
	assert_eq!(reg.deliver(r, msg(r, 2, "after")).attempted, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deregister_races_deliver_without_panicking() {
	let reg = registry(8);
	let r = room(1);

	let deliverer = {
		let reg = reg.clone();
		tokio::spawn(async move {
			for i in 1..=500 {
				reg.deliver(r, msg(r, i, "spam"));
				tokio::task::yield_now().await;
			}
		})
	};

	let churners: Vec<_> = (0..4)
		.map(|_| {
			let reg = reg.clone();
			tokio::spawn(async move {
				for _ in 0..100 {
					let (handle, mut rx) = reg.subscribe(r);
					let _ = rx.try_recv();
					if rand_bit(handle.id()) {
						drop(rx);
					}
					drop(handle);
					tokio::task::yield_now().await;
				}
			})
		})
		.collect();

	timeout(Duration::from_secs(10), deliverer)
		.await
		.expect("deliverer finished")
		.expect("deliverer did not panic");
	for c in churners {
		timeout(Duration::from_secs(10), c)
			.await
			.expect("churner finished")
			.expect("churner did not panic");
	}

	assert_eq!(reg.subscriber_count(r), 0);
}

fn rand_bit(seed: u64) -> bool {
	seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 63 == 1
}

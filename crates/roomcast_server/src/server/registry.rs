#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;
use roomcast_domain::{ChatMessage, RoomId};
use tokio::sync::mpsc;
use tracing::debug;

/// Configuration for `SubscriberRegistry`.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
	/// Maximum number of queued items per subscriber.
	pub subscriber_queue_capacity: usize,

	pub debug_logs: bool,
}

impl Default for RegistryConfig {
	fn default() -> Self {
		Self {
			subscriber_queue_capacity: 1024,
			debug_logs: false,
		}
	}
}

/// Items pushed to a subscriber queue.
#[derive(Debug, Clone)]
pub enum SubscriberItem {
	Message(Arc<ChatMessage>),

	/// Items were dropped because the subscriber's queue was full.
	Lagged {
		dropped: u64,
	},
}

/// Delivery endpoint for one subscriber.
pub type Endpoint = mpsc::Sender<SubscriberItem>;

pub type SubscriptionId = u64;

/// Outcome of one `deliver` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
	pub attempted: usize,
	pub delivered: usize,
	/// Subscribers whose queue was full.
	pub dropped: usize,
	/// Subscribers whose endpoint was closed; they were deregistered.
	pub closed: usize,
}

/// Room id to live subscriber endpoints, behind one registry-wide lock.
#[derive(Debug, Clone)]
pub struct SubscriberRegistry {
	inner: Arc<RwLock<Inner>>,
	next_id: Arc<AtomicU64>,
	cfg: RegistryConfig,
}

#[derive(Debug, Default)]
struct Inner {
	rooms: HashMap<RoomId, Vec<SubscriberEntry>>,
}

#[derive(Debug, Clone)]
struct SubscriberEntry {
	id: SubscriptionId,
	endpoint: Endpoint,
	/// Items dropped since the last lag marker reached this subscriber.
	pending_lag: Arc<AtomicU64>,
}

/// Owned registration. Deregisters on `deregister()` or drop, whichever comes first.
#[derive(Debug)]
pub struct SubscriptionHandle {
	id: SubscriptionId,
	room: RoomId,
	registry: SubscriberRegistry,
	released: AtomicBool,
}

impl SubscriptionHandle {
	pub fn id(&self) -> SubscriptionId {
		self.id
	}

	pub fn room(&self) -> RoomId {
		self.room
	}

	/// Remove this registration. Safe to call more than once.
	pub fn deregister(&self) -> bool {
		if self.released.swap(true, Ordering::AcqRel) {
			return false;
		}
		self.registry.remove_entry(self.room, self.id)
	}
}

impl Drop for SubscriptionHandle {
	fn drop(&mut self) {
		self.deregister();
	}
}

impl SubscriberRegistry {
	pub fn new(cfg: RegistryConfig) -> Self {
		Self {
			inner: Arc::new(RwLock::new(Inner::default())),
			next_id: Arc::new(AtomicU64::new(1)),
			cfg,
		}
	}

	/// Add `endpoint` to `room`. Every call creates a distinct entry.
	pub fn register(&self, room: RoomId, endpoint: Endpoint) -> SubscriptionHandle {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let entry = SubscriberEntry {
			id,
			endpoint,
			pending_lag: Arc::new(AtomicU64::new(0)),
		};

		let subs = {
			let mut inner = self.inner.write();
			let entries = inner.rooms.entry(room).or_default();
			entries.push(entry);
			entries.len()
		};

		metrics::gauge!("roomcast_registry_subscribers").increment(1.0);
		if self.cfg.debug_logs {
			debug!(room_id = %room, subscription_id = id, subs, "registry: registered");
		}

		SubscriptionHandle {
			id,
			room,
			registry: self.clone(),
			released: AtomicBool::new(false),
		}
	}

	/// Create a bounded queue sized by config and register its sender.
	pub fn subscribe(&self, room: RoomId) -> (SubscriptionHandle, mpsc::Receiver<SubscriberItem>) {
		let (tx, rx) = mpsc::channel(self.cfg.subscriber_queue_capacity.max(1));
		(self.register(room, tx), rx)
	}

	/// Remove the registration behind `handle`; no-op if already removed.
	pub fn deregister(&self, handle: &SubscriptionHandle) -> bool {
		handle.deregister()
	}

	fn remove_entry(&self, room: RoomId, id: SubscriptionId) -> bool {
		let removed = {
			let mut inner = self.inner.write();
			let Some(entries) = inner.rooms.get_mut(&room) else {
				return false;
			};
			let before = entries.len();
			entries.retain(|e| e.id != id);
			let removed = entries.len() != before;
			if entries.is_empty() {
				inner.rooms.remove(&room);
			}
			removed
		};

		if removed {
			metrics::gauge!("roomcast_registry_subscribers").decrement(1.0);
			if self.cfg.debug_logs {
				debug!(room_id = %room, subscription_id = id, "registry: deregistered");
			}
		}
		removed
	}

	/// Point-in-time copy of the room's endpoints.
	pub fn snapshot(&self, room: RoomId) -> Vec<Endpoint> {
		self.snapshot_entries(room).into_iter().map(|e| e.endpoint).collect()
	}

	fn snapshot_entries(&self, room: RoomId) -> Vec<SubscriberEntry> {
		self.inner.read().rooms.get(&room).cloned().unwrap_or_default()
	}

	/// Push `message` to every current subscriber of `room` without blocking.
	///
	/// Full queues drop the message for that subscriber. The count is owed
	/// as a `Lagged` marker placed ahead of its next delivered message.
	/// Closed endpoints are deregistered.
	pub fn deliver(&self, room: RoomId, message: Arc<ChatMessage>) -> DeliveryReport {
		let entries = self.snapshot_entries(room);
		let mut report = DeliveryReport {
			attempted: entries.len(),
			..DeliveryReport::default()
		};
		let mut closed = Vec::new();

		for entry in &entries {
			let owed = entry.pending_lag.load(Ordering::Acquire);
			let outcome = if owed > 0 {
				entry
					.endpoint
					.try_send(SubscriberItem::Lagged { dropped: owed })
					.map(|()| {
						entry.pending_lag.fetch_sub(owed, Ordering::AcqRel);
					})
					.and_then(|()| entry.endpoint.try_send(SubscriberItem::Message(Arc::clone(&message))))
			} else {
				entry.endpoint.try_send(SubscriberItem::Message(Arc::clone(&message)))
			};

			match outcome {
				Ok(()) => report.delivered += 1,
				Err(mpsc::error::TrySendError::Full(_)) => {
					report.dropped += 1;
					entry.pending_lag.fetch_add(1, Ordering::AcqRel);
				}
				Err(mpsc::error::TrySendError::Closed(_)) => {
					report.closed += 1;
					closed.push(entry.id);
				}
			}
		}

		for id in closed {
			self.remove_entry(room, id);
		}

		metrics::counter!("roomcast_deliveries_total").increment(report.delivered as u64);
		if report.dropped > 0 {
			metrics::counter!("roomcast_deliveries_dropped_total").increment(report.dropped as u64);
			if self.cfg.debug_logs {
				debug!(room_id = %room, dropped = report.dropped, "registry: dropped for full subscriber queues");
			}
		}

		report
	}

	pub fn subscriber_count(&self, room: RoomId) -> usize {
		self.inner.read().rooms.get(&room).map_or(0, Vec::len)
	}

	/// Subscriber counts per room.
	pub fn room_subscriber_counts(&self) -> HashMap<RoomId, usize> {
		self.inner
			.read()
			.rooms
			.iter()
			.map(|(room, entries)| (*room, entries.len()))
			.collect()
	}
}

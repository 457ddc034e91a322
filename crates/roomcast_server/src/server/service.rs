#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use roomcast_domain::{ChatMessage, Identity, Membership, MessageId, Room, RoomId, UNKNOWN_USER_NAME, UserId};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use crate::server::auth::{TokenVerifier, bearer_token};
use crate::server::error::ChatError;
use crate::server::registry::{DeliveryReport, SubscriberRegistry};
use crate::server::store::{INVITE_REJECTED, MessageStore, NewRoom, RoomQuery};

/// Configuration for `ChatService`.
#[derive(Debug, Clone)]
pub struct ChatServiceConfig {
	/// History page size when the caller sends a non-positive limit.
	pub default_history_limit: i64,
	/// Room list page size when the caller sends a non-positive limit.
	pub default_rooms_limit: i64,
}

impl Default for ChatServiceConfig {
	fn default() -> Self {
		Self {
			default_history_limit: 10,
			default_rooms_limit: 50,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendMessage {
	pub room_id: RoomId,
	pub sender_id: UserId,
	pub content: String,
}

#[derive(Debug, Clone)]
pub struct MessageAck {
	pub message_id: MessageId,
	pub timestamp_unix_ms: i64,
	pub delivery: DeliveryReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryQuery {
	pub room_id: RoomId,
	pub user_id: UserId,
	pub limit: i64,
	pub offset: i64,
}

/// Authenticated, room-scoped chat operations.
pub struct ChatService {
	verifier: Arc<dyn TokenVerifier>,
	store: Arc<dyn MessageStore>,
	registry: SubscriberRegistry,
	sequencer: RoomSequencer,
	cfg: ChatServiceConfig,
}

impl ChatService {
	pub fn new(
		verifier: Arc<dyn TokenVerifier>,
		store: Arc<dyn MessageStore>,
		registry: SubscriberRegistry,
		cfg: ChatServiceConfig,
	) -> Self {
		Self {
			verifier,
			store,
			registry,
			sequencer: RoomSequencer::default(),
			cfg,
		}
	}

	pub fn registry(&self) -> &SubscriberRegistry {
		&self.registry
	}

	/// Verify `Bearer <token>` request metadata.
	pub fn authenticate(&self, authorization: &str) -> Result<Identity, ChatError> {
		let token = bearer_token(authorization)?;
		Ok(self.verifier.verify(token)?)
	}

	/// Membership gate shared by every room-scoped read, write and stream.
	pub async fn authorize_room(&self, identity: &Identity, room: RoomId) -> Result<(), ChatError> {
		if self.store.is_member(room, identity.user_id).await? {
			Ok(())
		} else {
			debug!(room_id = %room, user_id = %identity.user_id, "membership check failed");
			Err(ChatError::NotMember)
		}
	}

	/// Validate, authorize, persist, then fan out to live subscribers.
	pub async fn send_message(&self, identity: &Identity, req: SendMessage) -> Result<MessageAck, ChatError> {
		if req.content.is_empty() {
			return Err(ChatError::InvalidArgument("message content cannot be empty".to_string()));
		}
		if !identity.is(req.sender_id) {
			return Err(ChatError::identity_mismatch("sender ID"));
		}
		self.authorize_room(identity, req.room_id).await?;

		// Held across persist and deliver so fan-out order matches persist order.
		let turn = self.sequencer.acquire(req.room_id).await;

		let saved = self.store.save(&req.content, req.sender_id, req.room_id).await?;
		let sender_name = self.display_name(identity, req.sender_id).await;

		let message = Arc::new(ChatMessage {
			id: saved.id,
			content: req.content,
			sender_id: req.sender_id,
			room_id: req.room_id,
			sender_name,
			timestamp_unix_ms: saved.timestamp_unix_ms,
		});
		let delivery = self.registry.deliver(req.room_id, message);
		drop(turn);

		metrics::counter!("roomcast_messages_sent_total").increment(1);
		debug!(
			room_id = %req.room_id,
			message_id = %saved.id,
			delivered = delivery.delivered,
			dropped = delivery.dropped,
			"message sent"
		);

		Ok(MessageAck {
			message_id: saved.id,
			timestamp_unix_ms: saved.timestamp_unix_ms,
			delivery,
		})
	}

	/// Newest-first page of a room's messages.
	pub async fn get_history(&self, identity: &Identity, query: HistoryQuery) -> Result<Vec<ChatMessage>, ChatError> {
		if !identity.is(query.user_id) {
			return Err(ChatError::identity_mismatch("user ID"));
		}
		self.authorize_room(identity, query.room_id).await?;

		let limit = if query.limit <= 0 {
			self.cfg.default_history_limit
		} else {
			query.limit
		};
		let offset = query.offset.max(0);

		Ok(self.store.history(query.room_id, limit, offset).await?)
	}

	pub async fn create_room(&self, identity: &Identity, new: NewRoom) -> Result<Room, ChatError> {
		if !identity.is(new.creator_id) {
			return Err(ChatError::identity_mismatch("creator ID"));
		}
		if new.name.trim().is_empty() {
			return Err(ChatError::InvalidArgument("room name cannot be empty".to_string()));
		}

		let room = self.store.create_room(new).await?;
		debug!(room_id = %room.id, creator_id = %room.creator_id, is_private = room.is_private, "room created");
		Ok(room)
	}

	pub async fn list_rooms(&self, identity: &Identity, query: RoomQuery) -> Result<Vec<Room>, ChatError> {
		if !identity.is(query.user_id) {
			return Err(ChatError::identity_mismatch("user ID"));
		}

		let query = RoomQuery {
			limit: if query.limit <= 0 {
				self.cfg.default_rooms_limit
			} else {
				query.limit
			},
			offset: query.offset.max(0),
			..query
		};
		Ok(self.store.list_rooms(query).await?)
	}

	pub async fn join_room(&self, identity: &Identity, room: RoomId, user: UserId) -> Result<Membership, ChatError> {
		if !identity.is(user) {
			return Err(ChatError::identity_mismatch("user ID"));
		}
		Ok(self.store.join_room(room, user).await?)
	}

	/// The room creator admits `invitee`. This is the only way into a private room.
	pub async fn invite_member(
		&self,
		identity: &Identity,
		room: RoomId,
		inviter: UserId,
		invitee: UserId,
	) -> Result<Membership, ChatError> {
		if !identity.is(inviter) {
			return Err(ChatError::identity_mismatch("inviter ID"));
		}
		let target = self.store.room(room).await?;
		if !target.is_creator(inviter) {
			return Err(ChatError::Rejected(INVITE_REJECTED.to_string()));
		}
		self.store.user_name(invitee).await?;

		let membership = self.store.add_member(room, invitee).await?;
		debug!(room_id = %room, inviter_id = %inviter, user_id = %invitee, "member invited");
		Ok(membership)
	}

	pub async fn leave_room(&self, identity: &Identity, room: RoomId, user: UserId) -> Result<(), ChatError> {
		if !identity.is(user) {
			return Err(ChatError::identity_mismatch("user ID"));
		}
		Ok(self.store.leave_room(room, user).await?)
	}

	async fn display_name(&self, identity: &Identity, user: UserId) -> String {
		match self.store.user_name(user).await {
			Ok(name) => name,
			Err(e) => {
				warn!(user_id = %user, error = %e, "sender name lookup failed");
				if identity.username.trim().is_empty() {
					UNKNOWN_USER_NAME.to_string()
				} else {
					identity.username.clone()
				}
			}
		}
	}
}

/// Per-room send lock. Entries are dropped once no sender holds or awaits them.
#[derive(Default)]
pub(crate) struct RoomSequencer {
	rooms: Mutex<HashMap<RoomId, RoomSlot>>,
}

#[derive(Default)]
struct RoomSlot {
	lock: Arc<tokio::sync::Mutex<()>>,
	/// Holders plus waiters.
	users: usize,
}

pub(crate) struct RoomTurn<'a> {
	room: RoomId,
	guard: Option<OwnedMutexGuard<()>>,
	sequencer: &'a RoomSequencer,
}

impl RoomSequencer {
	pub(crate) async fn acquire(&self, room: RoomId) -> RoomTurn<'_> {
		let lock = {
			let mut rooms = self.rooms.lock();
			let slot = rooms.entry(room).or_default();
			slot.users += 1;
			Arc::clone(&slot.lock)
		};

		// Exists before the wait so a cancelled waiter still releases its slot.
		let mut turn = RoomTurn {
			room,
			guard: None,
			sequencer: self,
		};
		turn.guard = Some(lock.lock_owned().await);
		turn
	}

	#[cfg(test)]
	fn tracked_rooms(&self) -> usize {
		self.rooms.lock().len()
	}
}

impl Drop for RoomTurn<'_> {
	fn drop(&mut self) {
		drop(self.guard.take());
		let mut rooms = self.sequencer.rooms.lock();
		if let Some(slot) = rooms.get_mut(&self.room) {
			slot.users = slot.users.saturating_sub(1);
			if slot.users == 0 {
				rooms.remove(&self.room);
			}
		}
	}
}

#[cfg(test)]
impl ChatService {
	pub(crate) fn tracked_send_locks(&self) -> usize {
		self.sequencer.tracked_rooms()
	}

	pub(crate) fn send_locks(&self) -> &RoomSequencer {
		&self.sequencer
	}
}

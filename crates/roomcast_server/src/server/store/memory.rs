#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;
use roomcast_domain::{ChatMessage, Membership, MessageId, Room, RoomId, UNKNOWN_USER_NAME, UserId};

use super::{
	CREATOR_LEAVE_REJECTED, MessageStore, NOT_A_MEMBER, NewRoom, PRIVATE_JOIN_REJECTED, RoomQuery, SavedMessage,
	StoreError,
};
use crate::util::time::unix_ms_now;

/// Process-local store used when persistence is disabled.
#[derive(Debug, Default)]
pub struct InMemoryStore {
	state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
	users: HashMap<UserId, String>,
	rooms: BTreeMap<RoomId, Room>,
	members: HashMap<(RoomId, UserId), i64>,
	messages: Vec<StoredMessage>,
	next_room_id: i64,
	next_message_id: i64,
	fail_writes: bool,
}

#[derive(Debug, Clone)]
struct StoredMessage {
	id: MessageId,
	content: String,
	sender_id: UserId,
	room_id: RoomId,
	created_at: i64,
}

impl State {
	fn room(&self, room: RoomId) -> Result<&Room, StoreError> {
		self.rooms.get(&room).ok_or_else(|| StoreError::room_not_found(room))
	}

	fn admits(&self, room: &Room, user: UserId) -> bool {
		!room.is_private || room.is_creator(user) || self.members.contains_key(&(room.id, user))
	}

	fn insert_member(&mut self, room: RoomId, user: UserId) -> Membership {
		let joined_at = *self.members.entry((room, user)).or_insert_with(unix_ms_now);
		Membership {
			room_id: room,
			user_id: user,
			joined_at_unix_ms: joined_at,
		}
	}

	fn check_writable(&self) -> Result<(), StoreError> {
		if self.fail_writes {
			return Err(StoreError::Backend(anyhow!("in-memory store: writes disabled")));
		}
		Ok(())
	}
}

fn next_id(counter: &mut i64) -> i64 {
	*counter += 1;
	*counter
}

impl InMemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Register a username for display-name lookups.
	pub fn upsert_user(&self, user: UserId, username: impl Into<String>) {
		self.state.lock().users.insert(user, username.into());
	}

	/// Number of persisted messages across all rooms.
	#[allow(dead_code)]
	pub fn message_count(&self) -> usize {
		self.state.lock().messages.len()
	}

	/// Make every write fail with a backend error.
	#[allow(dead_code)]
	pub fn set_fail_writes(&self, fail: bool) {
		self.state.lock().fail_writes = fail;
	}
}

#[async_trait]
impl MessageStore for InMemoryStore {
	async fn is_member(&self, room: RoomId, user: UserId) -> Result<bool, StoreError> {
		let state = self.state.lock();
		let room = state.room(room)?;
		Ok(state.admits(room, user))
	}

	async fn save(&self, content: &str, sender: UserId, room: RoomId) -> Result<SavedMessage, StoreError> {
		let mut state = self.state.lock();
		state.check_writable()?;
		state.room(room)?;

		let id = MessageId::new(next_id(&mut state.next_message_id)).map_err(anyhow::Error::from)?;
		let created_at = unix_ms_now();
		state.messages.push(StoredMessage {
			id,
			content: content.to_string(),
			sender_id: sender,
			room_id: room,
			created_at,
		});

		Ok(SavedMessage {
			id,
			timestamp_unix_ms: created_at,
		})
	}

	async fn history(&self, room: RoomId, limit: i64, offset: i64) -> Result<Vec<ChatMessage>, StoreError> {
		let state = self.state.lock();
		let name_of = |user: UserId| {
			state
				.users
				.get(&user)
				.cloned()
				.unwrap_or_else(|| UNKNOWN_USER_NAME.to_string())
		};

		Ok(state
			.messages
			.iter()
			.rev()
			.filter(|m| m.room_id == room)
			.skip(offset.max(0) as usize)
			.take(limit.max(0) as usize)
			.map(|m| ChatMessage {
				id: m.id,
				content: m.content.clone(),
				sender_id: m.sender_id,
				room_id: m.room_id,
				sender_name: name_of(m.sender_id),
				timestamp_unix_ms: m.created_at,
			})
			.collect())
	}

	async fn user_name(&self, user: UserId) -> Result<String, StoreError> {
		self.state
			.lock()
			.users
			.get(&user)
			.cloned()
			.ok_or_else(|| StoreError::NotFound(format!("user {user} not found")))
	}

	async fn create_room(&self, new: NewRoom) -> Result<Room, StoreError> {
		let mut state = self.state.lock();
		state.check_writable()?;

		let id = RoomId::new(next_id(&mut state.next_room_id)).map_err(anyhow::Error::from)?;
		let now = unix_ms_now();
		let room = Room {
			id,
			name: new.name,
			description: new.description,
			creator_id: new.creator_id,
			is_private: new.is_private,
			created_at_unix_ms: now,
		};

		state.rooms.insert(id, room.clone());
		state.members.insert((id, new.creator_id), now);
		Ok(room)
	}

	async fn room(&self, room: RoomId) -> Result<Room, StoreError> {
		self.state.lock().room(room).cloned()
	}

	async fn list_rooms(&self, query: RoomQuery) -> Result<Vec<Room>, StoreError> {
		let state = self.state.lock();
		let mut rooms: Vec<&Room> = state
			.rooms
			.values()
			.filter(|r| {
				if query.include_private {
					state.admits(r, query.user_id)
				} else {
					!r.is_private
				}
			})
			.collect();

		rooms.sort_by(|a, b| {
			b.created_at_unix_ms
				.cmp(&a.created_at_unix_ms)
				.then_with(|| b.id.cmp(&a.id))
		});

		Ok(rooms
			.into_iter()
			.skip(query.offset.max(0) as usize)
			.take(query.limit.max(0) as usize)
			.cloned()
			.collect())
	}

	async fn join_room(&self, room: RoomId, user: UserId) -> Result<Membership, StoreError> {
		let mut state = self.state.lock();
		state.check_writable()?;
		let target = state.room(room)?;
		if !state.admits(target, user) {
			return Err(StoreError::Rejected(PRIVATE_JOIN_REJECTED.to_string()));
		}
		Ok(state.insert_member(room, user))
	}

	async fn add_member(&self, room: RoomId, user: UserId) -> Result<Membership, StoreError> {
		let mut state = self.state.lock();
		state.check_writable()?;
		state.room(room)?;
		Ok(state.insert_member(room, user))
	}

	async fn leave_room(&self, room: RoomId, user: UserId) -> Result<(), StoreError> {
		let mut state = self.state.lock();
		state.check_writable()?;
		if state.room(room)?.is_creator(user) {
			return Err(StoreError::Rejected(CREATOR_LEAVE_REJECTED.to_string()));
		}

		match state.members.remove(&(room, user)) {
			Some(_) => Ok(()),
			None => Err(StoreError::Rejected(NOT_A_MEMBER.to_string())),
		}
	}
}

#![forbid(unsafe_code)]

//! Persistence for rooms, memberships and messages.

mod memory;
mod sql;

use async_trait::async_trait;
use roomcast_domain::{ChatMessage, MessageId, Membership, Room, RoomId, UserId};
use thiserror::Error;

pub use memory::InMemoryStore;
pub use sql::SqlStore;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("{0}")]
	NotFound(String),

	/// The operation is not allowed in the current state (e.g. creator leaving).
	#[error("{0}")]
	Rejected(String),

	#[error(transparent)]
	Backend(#[from] anyhow::Error),
}

impl StoreError {
	pub(crate) fn room_not_found(room: RoomId) -> Self {
		StoreError::NotFound(format!("room {room} not found"))
	}
}

pub(crate) const PRIVATE_JOIN_REJECTED: &str = "cannot join private room without invitation";
pub(crate) const CREATOR_LEAVE_REJECTED: &str = "room creator cannot leave the room";
pub(crate) const NOT_A_MEMBER: &str = "user is not a member of this room";
pub(crate) const INVITE_REJECTED: &str = "only the room creator can invite members";

/// Id and timestamp assigned to a freshly persisted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavedMessage {
	pub id: MessageId,
	pub timestamp_unix_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRoom {
	pub name: String,
	pub description: String,
	pub creator_id: UserId,
	pub is_private: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomQuery {
	pub user_id: UserId,
	pub include_private: bool,
	pub limit: i64,
	pub offset: i64,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
	/// Public rooms admit everyone; private rooms admit the creator and members.
	async fn is_member(&self, room: RoomId, user: UserId) -> Result<bool, StoreError>;

	async fn save(&self, content: &str, sender: UserId, room: RoomId) -> Result<SavedMessage, StoreError>;

	/// Newest first.
	async fn history(&self, room: RoomId, limit: i64, offset: i64) -> Result<Vec<ChatMessage>, StoreError>;

	async fn user_name(&self, user: UserId) -> Result<String, StoreError>;

	/// Creates the room and makes the creator a member.
	async fn create_room(&self, room: NewRoom) -> Result<Room, StoreError>;

	async fn room(&self, room: RoomId) -> Result<Room, StoreError>;

	/// Newest first.
	async fn list_rooms(&self, query: RoomQuery) -> Result<Vec<Room>, StoreError>;

	/// Self-service join; private rooms reject anyone not already admitted.
	async fn join_room(&self, room: RoomId, user: UserId) -> Result<Membership, StoreError>;

	/// Record an explicit membership regardless of room privacy. Idempotent.
	async fn add_member(&self, room: RoomId, user: UserId) -> Result<Membership, StoreError>;

	async fn leave_room(&self, room: RoomId, user: UserId) -> Result<(), StoreError>;
}

#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Display name used when a sender's username cannot be resolved.
pub const UNKNOWN_USER_NAME: &str = "Unknown User";

/// Errors for parsing identifiers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
	#[error("{kind} must be positive, got {value}")]
	NotPositive {
		kind: &'static str,
		value: i64,
	},
}

macro_rules! numeric_id {
	($(#[$meta:meta])* $name:ident, $kind:literal) => {
		$(#[$meta])*
		#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(i64);

		impl $name {
			/// Create an id; ids are strictly positive.
			pub fn new(id: i64) -> Result<Self, ParseIdError> {
				if id <= 0 {
					return Err(ParseIdError::NotPositive { kind: $kind, value: id });
				}
				Ok(Self(id))
			}

			pub const fn get(self) -> i64 {
				self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}", self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				let s = s.trim();
				if s.is_empty() {
					return Err(ParseIdError::Empty);
				}
				let v: i64 = s
					.parse()
					.map_err(|_| ParseIdError::InvalidFormat(format!("{} is not an integer: {s}", $kind)))?;
				Self::new(v)
			}
		}

		impl TryFrom<i64> for $name {
			type Error = ParseIdError;

			fn try_from(v: i64) -> Result<Self, Self::Error> {
				Self::new(v)
			}
		}

		impl From<$name> for i64 {
			fn from(v: $name) -> i64 {
				v.0
			}
		}
	};
}

numeric_id!(
	/// User identifier assigned by the user store.
	UserId,
	"user_id"
);
numeric_id!(
	/// Room identifier assigned by the message store.
	RoomId,
	"room_id"
);
numeric_id!(
	/// Message identifier; monotonically increasing per store.
	MessageId,
	"message_id"
);

/// Verified caller derived from a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
	pub user_id: UserId,
	pub username: String,
	/// Expiry as Unix seconds.
	pub expires_at: u64,
}

impl Identity {
	/// True when `user` is the identity's own user id.
	pub fn is(&self, user: UserId) -> bool {
		self.user_id == user
	}
}

/// A named, optionally private message scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
	pub id: RoomId,
	pub name: String,
	pub description: String,
	pub creator_id: UserId,
	pub is_private: bool,
	pub created_at_unix_ms: i64,
}

impl Room {
	/// Creators are implicit members of their own rooms.
	pub fn is_creator(&self, user: UserId) -> bool {
		self.creator_id == user
	}
}

/// `(room, user)` membership row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
	pub room_id: RoomId,
	pub user_id: UserId,
	pub joined_at_unix_ms: i64,
}

/// A persisted chat message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
	pub id: MessageId,
	pub content: String,
	pub sender_id: UserId,
	pub room_id: RoomId,
	pub sender_name: String,
	pub timestamp_unix_ms: i64,
}

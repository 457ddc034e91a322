#![forbid(unsafe_code)]

use chrono::{DateTime, SecondsFormat};
use roomcast_domain::{ChatMessage, Membership, Room};

use crate::pb;

/// Render Unix milliseconds as RFC3339 (UTC, millisecond precision).
pub fn rfc3339_from_unix_ms(ms: i64) -> String {
	DateTime::from_timestamp_millis(ms)
		.unwrap_or_default()
		.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC3339 timestamp back into Unix milliseconds.
pub fn unix_ms_from_rfc3339(s: &str) -> Option<i64> {
	DateTime::parse_from_rfc3339(s).ok().map(|t| t.timestamp_millis())
}

impl From<&ChatMessage> for pb::MessageResponse {
	fn from(m: &ChatMessage) -> Self {
		Self {
			id: m.id.get(),
			content: m.content.clone(),
			sender_id: m.sender_id.get(),
			room_id: m.room_id.get(),
			sender_name: m.sender_name.clone(),
			timestamp: rfc3339_from_unix_ms(m.timestamp_unix_ms),
		}
	}
}

impl From<&Room> for pb::RoomResponse {
	fn from(r: &Room) -> Self {
		Self {
			id: r.id.get(),
			name: r.name.clone(),
			description: r.description.clone(),
			creator_id: r.creator_id.get(),
			is_private: r.is_private,
			created_at: rfc3339_from_unix_ms(r.created_at_unix_ms),
		}
	}
}

impl pb::JoinRoomResponse {
	pub fn joined(m: &Membership) -> Self {
		Self {
			success: true,
			message: "joined room".to_string(),
			status: pb::StatusCode::Ok as i32,
			room_id: m.room_id.get(),
			joined_at: rfc3339_from_unix_ms(m.joined_at_unix_ms),
		}
	}
}

impl pb::InviteMemberResponse {
	pub fn invited(m: &Membership) -> Self {
		Self {
			success: true,
			message: "member invited".to_string(),
			status: pb::StatusCode::Ok as i32,
			room_id: m.room_id.get(),
			user_id: m.user_id.get(),
			joined_at: rfc3339_from_unix_ms(m.joined_at_unix_ms),
		}
	}
}

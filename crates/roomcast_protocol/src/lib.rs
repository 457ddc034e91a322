#![forbid(unsafe_code)]

pub mod convert;
pub mod framing;

pub use framing::{
	DEFAULT_MAX_FRAME_SIZE, FrameReader, FramingError, LENGTH_PREFIX_LEN, decode_frame, encode_frame, write_frame,
};

/// Generated protobuf types (`roomcast.v1`).
///
/// Every RPC runs on its own QUIC bidirectional stream: the client writes one
/// framed [`pb::RpcRequest`], the server answers with one [`pb::RpcResponse`]
/// (unary calls) or a sequence of them (`StreamRoomMessages`).
#[allow(clippy::large_enum_variant)]
pub mod pb {
	include!(concat!(env!("OUT_DIR"), "/roomcast.v1.rs"));

	impl rpc_request::Call {
		/// Stable name used in logs and metric labels.
		pub fn name(&self) -> &'static str {
			match self {
				rpc_request::Call::SendMessage(_) => "send_message",
				rpc_request::Call::GetRoomMessages(_) => "get_room_messages",
				rpc_request::Call::StreamRoomMessages(_) => "stream_room_messages",
				rpc_request::Call::CreateRoom(_) => "create_room",
				rpc_request::Call::GetRooms(_) => "get_rooms",
				rpc_request::Call::JoinRoom(_) => "join_room",
				rpc_request::Call::LeaveRoom(_) => "leave_room",
				rpc_request::Call::InviteMember(_) => "invite_member",
			}
		}
	}
}

/// Protocol version constants.
pub mod version {
	/// Current protocol version carried in `RpcRequest.version` / `RpcResponse.version`.
	pub const PROTOCOL_VERSION: u32 = 1;

	/// ALPN identifier negotiated on every QUIC connection.
	pub const ALPN: &[u8] = b"roomcast-v1";
}

#![forbid(unsafe_code)]

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use futures::FutureExt as _;
use roomcast_domain::{ChatMessage, RoomId, UserId};
use roomcast_protocol::convert::rfc3339_from_unix_ms;
use roomcast_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, FrameReader, write_frame};
use roomcast_protocol::pb::{self, StatusCode, rpc_request::Call, rpc_response};
use roomcast_protocol::version::PROTOCOL_VERSION;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::server::error::ChatError;
use crate::server::service::{ChatService, HistoryQuery, SendMessage};
use crate::server::session::{MessageSink, StreamingSession};
use crate::server::store::{NewRoom, RoomQuery};

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: usize,
	/// Bound on reading the request frame of a fresh stream.
	pub request_timeout: Duration,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			request_timeout: Duration::from_secs(10),
		}
	}
}

/// Serve RPC streams on one QUIC connection until it closes or shutdown is signalled.
pub async fn handle_connection(
	conn_id: u64,
	connection: quinn::Connection,
	service: Arc<ChatService>,
	settings: ConnectionSettings,
	mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
	struct ConnectionGauge;
	impl Drop for ConnectionGauge {
		fn drop(&mut self) {
			metrics::gauge!("roomcast_server_active_connections").decrement(1.0);
		}
	}
	metrics::gauge!("roomcast_server_active_connections").increment(1.0);
	let _gauge = ConnectionGauge;

	let mut next_stream_id: u64 = 1;
	loop {
		let accepted = tokio::select! {
			_ = shutdown.changed() => {
				debug!(conn_id, "shutdown signalled; closing connection");
				connection.close(0u32.into(), b"server shutdown");
				return Ok(());
			}
			accepted = connection.accept_bi() => accepted,
		};

		let (send, recv) = match accepted {
			Ok(streams) => streams,
			Err(quinn::ConnectionError::ApplicationClosed(_) | quinn::ConnectionError::LocallyClosed) => {
				debug!(conn_id, "connection closed by peer");
				return Ok(());
			}
			Err(e) => return Err(e).context("accept bidirectional stream"),
		};

		let stream_id = next_stream_id;
		next_stream_id += 1;

		let service = Arc::clone(&service);
		let settings = settings.clone();
		let shutdown = shutdown.clone();
		tokio::spawn(async move {
			if let Err(e) = handle_stream(conn_id, stream_id, send, recv, service, settings, shutdown).await {
				warn!(conn_id, stream_id, error = %format!("{e:#}"), "rpc stream failed");
			}
		});
	}
}

async fn handle_stream(
	conn_id: u64,
	stream_id: u64,
	mut send: quinn::SendStream,
	mut recv: quinn::RecvStream,
	service: Arc<ChatService>,
	settings: ConnectionSettings,
	shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
	let mut reader = FrameReader::new(settings.max_frame_bytes);
	let request = tokio::time::timeout(settings.request_timeout, reader.read_frame::<_, pb::RpcRequest>(&mut recv))
		.await
		.context("timed out waiting for request frame")?
		.context("read request frame")?;
	let Some(request) = request else {
		debug!(conn_id, stream_id, "stream finished before a request arrived");
		return Ok(());
	};

	let request_id = request.request_id.clone();
	let call_name = request.call.as_ref().map_or("none", |c| c.name());
	metrics::counter!("roomcast_rpc_requests_total", "call" => call_name).increment(1);
	debug!(conn_id, stream_id, request_id = %request_id, call = call_name, "rpc request");

	let outcome = AssertUnwindSafe(dispatch(&service, request, &mut send, &settings, shutdown))
		.catch_unwind()
		.await;

	match outcome {
		Ok(Ok(())) => {}
		Ok(Err(e)) => {
			warn!(conn_id, stream_id, request_id = %request_id, error = %format!("{e:#}"), "rpc handler failed");
		}
		Err(panic) => {
			error!(
				conn_id,
				stream_id,
				request_id = %request_id,
				panic = panic_message(&*panic),
				"rpc handler panicked"
			);
			metrics::counter!("roomcast_rpc_panics_total").increment(1);
			let resp = error_response(&request_id, StatusCode::Internal, "internal error");
			let _ = write_frame(&mut send, &resp, settings.max_frame_bytes).await;
		}
	}

	let _ = send.finish();
	Ok(())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
	if let Some(s) = panic.downcast_ref::<&str>() {
		(*s).to_string()
	} else if let Some(s) = panic.downcast_ref::<String>() {
		s.clone()
	} else {
		"non-string panic payload".to_string()
	}
}

fn response(request_id: &str, result: rpc_response::Result) -> pb::RpcResponse {
	pb::RpcResponse {
		version: PROTOCOL_VERSION,
		request_id: request_id.to_string(),
		result: Some(result),
	}
}

fn error_response(request_id: &str, code: StatusCode, message: &str) -> pb::RpcResponse {
	response(
		request_id,
		rpc_response::Result::Error(pb::RpcError {
			code: code as i32,
			message: message.to_string(),
		}),
	)
}

fn room_and_user(room: i64, user: i64) -> Result<(RoomId, UserId), ChatError> {
	Ok((RoomId::new(room)?, UserId::new(user)?))
}

/// Structured failure fields: `(success, message, status)`.
fn failure(e: &ChatError) -> (bool, String, i32) {
	(false, e.to_string(), e.code() as i32)
}

fn ok_status(message: &str) -> (bool, String, i32) {
	(true, message.to_string(), StatusCode::Ok as i32)
}

async fn dispatch(
	service: &ChatService,
	request: pb::RpcRequest,
	send: &mut quinn::SendStream,
	settings: &ConnectionSettings,
	shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
	let request_id = request.request_id;
	let max = settings.max_frame_bytes;

	let Some(call) = request.call else {
		let resp = error_response(&request_id, StatusCode::InvalidArgument, "request carries no call");
		write_frame(send, &resp, max).await?;
		return Ok(());
	};

	if let Call::StreamRoomMessages(req) = call {
		return stream_room_messages(service, &request_id, &request.authorization, req, send, max, shutdown).await;
	}

	let result = match unary(service, &request.authorization, call).await {
		Ok(result) => result,
		Err(e) => {
			log_transport_error(&request_id, &e);
			rpc_response::Result::Error(pb::RpcError {
				code: e.code() as i32,
				message: transport_message(&e),
			})
		}
	};

	write_frame(send, &response(&request_id, result), max).await?;
	Ok(())
}

fn transport_message(e: &ChatError) -> String {
	match e {
		ChatError::Internal(_) => "internal error".to_string(),
		other => other.to_string(),
	}
}

fn log_transport_error(request_id: &str, e: &ChatError) {
	match e {
		ChatError::Internal(inner) => error!(request_id = %request_id, error = %format!("{inner:#}"), "internal error"),
		ChatError::Unauthenticated(_) => info!(request_id = %request_id, error = %e, "unauthenticated request"),
		other => debug!(request_id = %request_id, error = %other, "request rejected"),
	}
}

/// Run a unary call. Structured failures are folded into the response;
/// the `Err` path is reserved for transport-level errors.
async fn unary(service: &ChatService, authorization: &str, call: Call) -> Result<rpc_response::Result, ChatError> {
	let identity = service.authenticate(authorization)?;

	match call {
		Call::SendMessage(req) => {
			let outcome = match room_and_user(req.room_id, req.sender_id) {
				Ok((room_id, sender_id)) => {
					let msg = SendMessage {
						room_id,
						sender_id,
						content: req.content,
					};
					service.send_message(&identity, msg).await
				}
				Err(e) => Err(e),
			};

			Ok(rpc_response::Result::SendMessage(match outcome {
				Ok(ack) => {
					let (success, message, status) = ok_status("message sent successfully");
					pb::SendMessageResponse {
						success,
						message,
						status,
						message_id: ack.message_id.get(),
						timestamp: rfc3339_from_unix_ms(ack.timestamp_unix_ms),
					}
				}
				Err(e) if e.is_structured() => {
					let (success, message, status) = failure(&e);
					pb::SendMessageResponse {
						success,
						message,
						status,
						..Default::default()
					}
				}
				Err(e) => return Err(e),
			}))
		}
		Call::GetRoomMessages(req) => {
			let outcome = match room_and_user(req.room_id, req.user_id) {
				Ok((room_id, user_id)) => {
					let query = HistoryQuery {
						room_id,
						user_id,
						limit: i64::from(req.limit),
						offset: i64::from(req.offset),
					};
					service.get_history(&identity, query).await
				}
				Err(e) => Err(e),
			};

			Ok(rpc_response::Result::RoomMessages(match outcome {
				Ok(messages) => {
					let (success, message, status) = ok_status("");
					pb::GetRoomMessagesResponse {
						success,
						message,
						status,
						messages: messages.iter().map(pb::MessageResponse::from).collect(),
					}
				}
				Err(e) if e.is_structured() => {
					let (success, message, status) = failure(&e);
					pb::GetRoomMessagesResponse {
						success,
						message,
						status,
						messages: Vec::new(),
					}
				}
				Err(e) => return Err(e),
			}))
		}
		Call::CreateRoom(req) => {
			let outcome = match UserId::new(req.creator_id) {
				Ok(creator_id) => {
					let new = NewRoom {
						name: req.name,
						description: req.description,
						creator_id,
						is_private: req.is_private,
					};
					service.create_room(&identity, new).await
				}
				Err(e) => Err(e.into()),
			};

			Ok(rpc_response::Result::CreateRoom(match outcome {
				Ok(room) => {
					let (success, message, status) = ok_status("room created successfully");
					pb::CreateRoomResponse {
						success,
						message,
						status,
						room: Some(pb::RoomResponse::from(&room)),
					}
				}
				Err(e) if e.is_structured() => {
					let (success, message, status) = failure(&e);
					pb::CreateRoomResponse {
						success,
						message,
						status,
						room: None,
					}
				}
				Err(e) => return Err(e),
			}))
		}
		Call::GetRooms(req) => {
			let outcome = match UserId::new(req.user_id) {
				Ok(user_id) => {
					let query = RoomQuery {
						user_id,
						include_private: req.include_private,
						limit: i64::from(req.limit),
						offset: i64::from(req.offset),
					};
					service.list_rooms(&identity, query).await
				}
				Err(e) => Err(e.into()),
			};

			Ok(rpc_response::Result::Rooms(match outcome {
				Ok(rooms) => {
					let (success, message, status) = ok_status("");
					pb::GetRoomsResponse {
						success,
						message,
						status,
						rooms: rooms.iter().map(pb::RoomResponse::from).collect(),
					}
				}
				Err(e) if e.is_structured() => {
					let (success, message, status) = failure(&e);
					pb::GetRoomsResponse {
						success,
						message,
						status,
						rooms: Vec::new(),
					}
				}
				Err(e) => return Err(e),
			}))
		}
		Call::JoinRoom(req) => {
			let outcome = match room_and_user(req.room_id, req.user_id) {
				Ok((room, user)) => service.join_room(&identity, room, user).await,
				Err(e) => Err(e),
			};

			Ok(rpc_response::Result::JoinRoom(match outcome {
				Ok(membership) => pb::JoinRoomResponse::joined(&membership),
				Err(e) if e.is_structured() => {
					let (success, message, status) = failure(&e);
					pb::JoinRoomResponse {
						success,
						message,
						status,
						room_id: req.room_id,
						joined_at: String::new(),
					}
				}
				Err(e) => return Err(e),
			}))
		}
		Call::LeaveRoom(req) => {
			let outcome = match room_and_user(req.room_id, req.user_id) {
				Ok((room, user)) => service.leave_room(&identity, room, user).await,
				Err(e) => Err(e),
			};

			let (success, message, status) = match outcome {
				Ok(()) => ok_status("left room successfully"),
				Err(e) if e.is_structured() => failure(&e),
				Err(e) => return Err(e),
			};
			Ok(rpc_response::Result::LeaveRoom(pb::LeaveRoomResponse {
				success,
				message,
				status,
			}))
		}
		Call::InviteMember(req) => {
			let outcome = match (room_and_user(req.room_id, req.inviter_id), UserId::new(req.user_id)) {
				(Ok((room, inviter)), Ok(invitee)) => service.invite_member(&identity, room, inviter, invitee).await,
				(Err(e), _) => Err(e),
				(_, Err(e)) => Err(e.into()),
			};

			Ok(rpc_response::Result::InviteMember(match outcome {
				Ok(membership) => pb::InviteMemberResponse::invited(&membership),
				Err(e) if e.is_structured() => {
					let (success, message, status) = failure(&e);
					pb::InviteMemberResponse {
						success,
						message,
						status,
						room_id: req.room_id,
						user_id: req.user_id,
						joined_at: String::new(),
					}
				}
				Err(e) => return Err(e),
			}))
		}
		Call::StreamRoomMessages(_) => Err(ChatError::InvalidArgument(
			"StreamRoomMessages is not a unary call".to_string(),
		)),
	}
}

async fn stream_room_messages(
	service: &ChatService,
	request_id: &str,
	authorization: &str,
	req: pb::StreamRoomMessagesRequest,
	send: &mut quinn::SendStream,
	max_frame_bytes: usize,
	shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
	let opened = match room_and_user(req.room_id, req.user_id) {
		Ok((room, user)) => StreamingSession::open(service, authorization, room, user).await,
		Err(e) => Err(e),
	};

	let mut session = match opened {
		Ok(session) => session,
		Err(e) => {
			log_transport_error(request_id, &e);
			let resp = error_response(request_id, e.code(), &transport_message(&e));
			write_frame(send, &resp, max_frame_bytes).await?;
			return Ok(());
		}
	};

	let opened = pb::StreamOpened {
		room_id: session.room().get(),
		subscription_id: session.subscription_id().unwrap_or_default(),
	};
	write_frame(send, &response(request_id, rpc_response::Result::StreamOpened(opened)), max_frame_bytes).await?;

	let mut sink = QuicSink {
		send,
		request_id,
		max_frame_bytes,
	};
	session.run(&mut sink, shutdown).await;
	Ok(())
}

/// Writes session items onto the stream's send half.
struct QuicSink<'a> {
	send: &'a mut quinn::SendStream,
	request_id: &'a str,
	max_frame_bytes: usize,
}

impl QuicSink<'_> {
	async fn push(&mut self, result: rpc_response::Result) -> anyhow::Result<()> {
		write_frame(&mut *self.send, &response(self.request_id, result), self.max_frame_bytes)
			.await
			.context("write stream frame")
	}
}

#[async_trait]
impl MessageSink for QuicSink<'_> {
	async fn send_message(&mut self, message: &ChatMessage) -> anyhow::Result<()> {
		self.push(rpc_response::Result::StreamMessage(pb::MessageResponse::from(message)))
			.await
	}

	async fn send_lagged(&mut self, dropped: u64) -> anyhow::Result<()> {
		self.push(rpc_response::Result::StreamLagged(pb::StreamLagged { dropped }))
			.await
	}

	async fn closed(&mut self) {
		let _ = self.send.stopped().await;
	}
}

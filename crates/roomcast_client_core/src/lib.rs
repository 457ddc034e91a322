#![forbid(unsafe_code)]

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use quinn::{ClientConfig as QuinnClientConfig, Endpoint, TransportConfig, VarInt};
use roomcast_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, FrameReader, FramingError, write_frame};
use roomcast_protocol::pb::{self, StatusCode, rpc_request::Call, rpc_response};
use roomcast_protocol::version::{ALPN, PROTOCOL_VERSION};
use roomcast_util::QuicEndpoint;
use tracing::{debug, info};

/// Default server endpoint for local development.
pub const DEFAULT_SERVER_ENDPOINT_QUIC: &str = "quic://127.0.0.1:18300";

#[derive(Debug, Clone)]
pub struct ClientConfig {
	/// Remote server host (DNS name or IP literal); also used as TLS SNI.
	pub server_host: String,

	/// Remote server UDP port.
	pub server_port: u16,

	/// Resolved remote server address override.
	pub server_addr: Option<SocketAddr>,

	/// Bearer token sent as `authorization` on every call.
	pub auth_token: Option<String>,

	/// Maximum inbound/outbound frame size.
	pub max_frame_bytes: usize,

	/// Timeout for connect + handshake.
	pub connect_timeout: Duration,

	/// Timeout for a unary call, and for the `StreamOpened` reply of a stream.
	pub request_timeout: Duration,
}

impl ClientConfig {
	/// Create a config from `quic://host:port`.
	pub fn from_quic_endpoint(endpoint: &str) -> Result<Self, ClientCoreError> {
		let e = QuicEndpoint::parse(endpoint)
			.map_err(|e| ClientCoreError::Protocol(format!("invalid endpoint (expected quic://host:port): {e}")))?;
		Ok(Self {
			server_addr: e.socket_addr().ok(),
			server_host: e.server_name().to_string(),
			server_port: e.port,
			..Self::default()
		})
	}

	pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
		self.auth_token = Some(token.into());
		self
	}
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			server_host: "localhost".to_string(),
			server_port: 18300,
			server_addr: Some(SocketAddr::from((Ipv4Addr::LOCALHOST, 18300))),
			auth_token: None,
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			connect_timeout: Duration::from_secs(15),
			request_timeout: Duration::from_secs(15),
		}
	}
}

/// Errors for client core operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientCoreError {
	/// QUIC endpoint setup failed.
	#[error("failed to create QUIC endpoint: {0}")]
	Endpoint(String),

	/// Connection establishment failed.
	#[error("failed to connect: {0}")]
	Connect(String),

	#[error(transparent)]
	Framing(#[from] FramingError),

	/// Unexpected message ordering or types.
	#[error("protocol error: {0}")]
	Protocol(String),

	/// Transport-level error returned by the server.
	#[error("rpc error {}: {message}", code.as_str_name())]
	Rpc { code: StatusCode, message: String },

	#[error("io error: {0}")]
	Io(String),

	#[error("timed out after {0:?}")]
	Timeout(Duration),

	#[error("error: {0}")]
	Other(String),
}

impl ClientCoreError {
	/// Status code of a transport-level server error.
	pub fn status(&self) -> Option<StatusCode> {
		match self {
			ClientCoreError::Rpc { code, .. } => Some(*code),
			_ => None,
		}
	}
}

impl From<anyhow::Error> for ClientCoreError {
	fn from(e: anyhow::Error) -> Self {
		ClientCoreError::Other(format!("{e:#}"))
	}
}

/// One QUIC connection to a roomcast server. Each call runs on its own stream.
pub struct RoomcastClient {
	conn: quinn::Connection,
	_endpoint: Endpoint,
	authorization: String,
	max_frame_bytes: usize,
	request_timeout: Duration,
}

impl RoomcastClient {
	pub async fn connect(cfg: ClientConfig) -> Result<Self, ClientCoreError> {
		let quinn_cfg = make_insecure_client_config().map_err(|e| ClientCoreError::Endpoint(format!("{e:#}")))?;

		let connect_timeout = cfg.connect_timeout;
		let server_name = cfg.server_host.clone();

		let candidates: Vec<SocketAddr> = match cfg.server_addr {
			Some(addr) => vec![addr],
			None => {
				let hostport = format!("{}:{}", cfg.server_host, cfg.server_port);
				let addrs: Vec<SocketAddr> = hostport
					.to_socket_addrs()
					.map_err(|e| ClientCoreError::Connect(format!("failed to resolve {hostport}: {e}")))?
					.collect();
				if addrs.is_empty() {
					return Err(ClientCoreError::Connect(format!(
						"DNS resolution returned no addresses for {hostport}"
					)));
				}
				addrs
			}
		};

		let mut last_err: Option<String> = None;

		for server_addr in candidates {
			let endpoint = make_client_endpoint(server_addr).map_err(|e| ClientCoreError::Endpoint(format!("{e:#}")))?;
			let connecting = endpoint
				.connect_with(quinn_cfg.clone(), server_addr, &server_name)
				.map_err(|e| ClientCoreError::Connect(format!("connect_with({server_addr}, sni={server_name}): {e}")))?;

			match tokio::time::timeout(connect_timeout, connecting).await {
				Ok(Ok(conn)) => {
					info!(remote = %conn.remote_address(), "connected");
					return Ok(Self {
						conn,
						_endpoint: endpoint,
						authorization: cfg.auth_token.map(|t| format!("Bearer {t}")).unwrap_or_default(),
						max_frame_bytes: cfg.max_frame_bytes,
						request_timeout: cfg.request_timeout,
					});
				}
				Ok(Err(e)) => {
					last_err = Some(format!("connect failed (addr={server_addr}, sni={server_name}): {e}"));
				}
				Err(_) => {
					last_err = Some(format!(
						"connect timeout after {connect_timeout:?} (addr={server_addr}, sni={server_name})"
					));
				}
			}
		}

		Err(ClientCoreError::Connect(last_err.unwrap_or_else(|| {
			format!("connect failed (no addresses attempted) (sni={server_name})")
		})))
	}

	/// Replace the raw `authorization` value sent with later calls.
	pub fn set_authorization(&mut self, authorization: impl Into<String>) {
		self.authorization = authorization.into();
	}

	pub fn remote_address(&self) -> SocketAddr {
		self.conn.remote_address()
	}

	pub async fn send_message(
		&self,
		room_id: i64,
		sender_id: i64,
		content: impl Into<String>,
	) -> Result<pb::SendMessageResponse, ClientCoreError> {
		let call = Call::SendMessage(pb::SendMessageRequest {
			room_id,
			sender_id,
			content: content.into(),
		});
		match self.unary(call).await? {
			rpc_response::Result::SendMessage(r) => Ok(r),
			other => Err(unexpected("SendMessage", &other)),
		}
	}

	pub async fn get_room_messages(
		&self,
		room_id: i64,
		user_id: i64,
		limit: i32,
		offset: i32,
	) -> Result<pb::GetRoomMessagesResponse, ClientCoreError> {
		let call = Call::GetRoomMessages(pb::GetRoomMessagesRequest {
			room_id,
			user_id,
			limit,
			offset,
		});
		match self.unary(call).await? {
			rpc_response::Result::RoomMessages(r) => Ok(r),
			other => Err(unexpected("RoomMessages", &other)),
		}
	}

	pub async fn create_room(
		&self,
		name: impl Into<String>,
		description: impl Into<String>,
		creator_id: i64,
		is_private: bool,
	) -> Result<pb::CreateRoomResponse, ClientCoreError> {
		let call = Call::CreateRoom(pb::CreateRoomRequest {
			name: name.into(),
			description: description.into(),
			creator_id,
			is_private,
		});
		match self.unary(call).await? {
			rpc_response::Result::CreateRoom(r) => Ok(r),
			other => Err(unexpected("CreateRoom", &other)),
		}
	}

	pub async fn get_rooms(
		&self,
		user_id: i64,
		include_private: bool,
		limit: i32,
		offset: i32,
	) -> Result<pb::GetRoomsResponse, ClientCoreError> {
		let call = Call::GetRooms(pb::GetRoomsRequest {
			user_id,
			include_private,
			limit,
			offset,
		});
		match self.unary(call).await? {
			rpc_response::Result::Rooms(r) => Ok(r),
			other => Err(unexpected("Rooms", &other)),
		}
	}

	pub async fn join_room(&self, room_id: i64, user_id: i64) -> Result<pb::JoinRoomResponse, ClientCoreError> {
		match self.unary(Call::JoinRoom(pb::JoinRoomRequest { room_id, user_id })).await? {
			rpc_response::Result::JoinRoom(r) => Ok(r),
			other => Err(unexpected("JoinRoom", &other)),
		}
	}

	pub async fn leave_room(&self, room_id: i64, user_id: i64) -> Result<pb::LeaveRoomResponse, ClientCoreError> {
		match self.unary(Call::LeaveRoom(pb::LeaveRoomRequest { room_id, user_id })).await? {
			rpc_response::Result::LeaveRoom(r) => Ok(r),
			other => Err(unexpected("LeaveRoom", &other)),
		}
	}

	/// As the creator of `room_id`, admit `user_id` to it.
	pub async fn invite_member(
		&self,
		room_id: i64,
		inviter_id: i64,
		user_id: i64,
	) -> Result<pb::InviteMemberResponse, ClientCoreError> {
		let call = Call::InviteMember(pb::InviteMemberRequest {
			room_id,
			inviter_id,
			user_id,
		});
		match self.unary(call).await? {
			rpc_response::Result::InviteMember(r) => Ok(r),
			other => Err(unexpected("InviteMember", &other)),
		}
	}

	/// Open a live subscription. Returns once the server has registered it.
	pub async fn stream_room_messages(&self, room_id: i64, user_id: i64) -> Result<MessageStream, ClientCoreError> {
		let call = Call::StreamRoomMessages(pb::StreamRoomMessagesRequest { room_id, user_id });
		let (send, mut recv, request_id) = self.open_call(call).await?;
		let mut reader = FrameReader::new(self.max_frame_bytes);

		let first = tokio::time::timeout(self.request_timeout, read_response(&mut reader, &mut recv, &request_id))
			.await
			.map_err(|_| ClientCoreError::Timeout(self.request_timeout))??;

		match first {
			rpc_response::Result::StreamOpened(opened) => {
				debug!(room_id = opened.room_id, subscription_id = opened.subscription_id, "stream opened");
				Ok(MessageStream {
					recv,
					_send: send,
					reader,
					request_id,
					opened,
				})
			}
			other => Err(unexpected("StreamOpened", &other)),
		}
	}

	pub fn close(&self, code: u32, reason: &str) {
		self.conn.close(VarInt::from_u32(code), reason.as_bytes());
	}

	async fn open_call(&self, call: Call) -> Result<(quinn::SendStream, quinn::RecvStream, String), ClientCoreError> {
		let request_id = uuid::Uuid::new_v4().to_string();
		let call_name = call.name();
		let request = pb::RpcRequest {
			version: PROTOCOL_VERSION,
			request_id: request_id.clone(),
			authorization: self.authorization.clone(),
			call: Some(call),
		};

		let (mut send, recv) = self
			.conn
			.open_bi()
			.await
			.map_err(|e| ClientCoreError::Io(format!("open_bi failed: {e}")))?;

		write_frame(&mut send, &request, self.max_frame_bytes).await?;
		send.finish()
			.map_err(|e| ClientCoreError::Io(format!("finish request stream: {e}")))?;

		debug!(request_id = %request_id, call = call_name, "request sent");
		Ok((send, recv, request_id))
	}

	async fn unary(&self, call: Call) -> Result<rpc_response::Result, ClientCoreError> {
		let (_send, mut recv, request_id) = self.open_call(call).await?;
		let mut reader = FrameReader::new(self.max_frame_bytes);
		tokio::time::timeout(self.request_timeout, read_response(&mut reader, &mut recv, &request_id))
			.await
			.map_err(|_| ClientCoreError::Timeout(self.request_timeout))?
	}
}

/// An item received on a live room subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
	Message(pb::MessageResponse),
	/// The server dropped this many messages because the subscriber fell behind.
	Lagged(u64),
}

/// Client half of a `StreamRoomMessages` call.
pub struct MessageStream {
	recv: quinn::RecvStream,
	_send: quinn::SendStream,
	reader: FrameReader,
	request_id: String,
	opened: pb::StreamOpened,
}

impl MessageStream {
	pub fn subscription_id(&self) -> u64 {
		self.opened.subscription_id
	}

	pub fn room_id(&self) -> i64 {
		self.opened.room_id
	}

	/// Next item, or `None` once the server has ended the stream.
	pub async fn next(&mut self) -> Result<Option<StreamItem>, ClientCoreError> {
		let resp = match self.reader.read_frame::<_, pb::RpcResponse>(&mut self.recv).await {
			Ok(Some(resp)) => resp,
			Ok(None) => return Ok(None),
			Err(FramingError::Io(e)) => return Err(ClientCoreError::Io(e.to_string())),
			Err(e) => return Err(e.into()),
		};

		match into_result(resp, &self.request_id)? {
			rpc_response::Result::StreamMessage(m) => Ok(Some(StreamItem::Message(m))),
			rpc_response::Result::StreamLagged(l) => Ok(Some(StreamItem::Lagged(l.dropped))),
			other => Err(unexpected("StreamMessage", &other)),
		}
	}

	/// Cancel the subscription; the server deregisters it.
	pub fn close(mut self) {
		let _ = self.recv.stop(VarInt::from_u32(0));
	}
}

async fn read_response(
	reader: &mut FrameReader,
	recv: &mut quinn::RecvStream,
	request_id: &str,
) -> Result<rpc_response::Result, ClientCoreError> {
	match reader.read_frame::<_, pb::RpcResponse>(recv).await? {
		Some(resp) => into_result(resp, request_id),
		None => Err(ClientCoreError::Protocol(
			"stream closed before receiving a response".to_string(),
		)),
	}
}

fn into_result(resp: pb::RpcResponse, request_id: &str) -> Result<rpc_response::Result, ClientCoreError> {
	if resp.request_id != request_id {
		return Err(ClientCoreError::Protocol(format!(
			"response for request {} on stream of request {request_id}",
			resp.request_id
		)));
	}

	match resp.result {
		Some(rpc_response::Result::Error(e)) => Err(ClientCoreError::Rpc {
			code: StatusCode::try_from(e.code).unwrap_or(StatusCode::Internal),
			message: e.message,
		}),
		Some(result) => Ok(result),
		None => Err(ClientCoreError::Protocol("response carries no result".to_string())),
	}
}

fn unexpected(expected: &str, got: &rpc_response::Result) -> ClientCoreError {
	ClientCoreError::Protocol(format!("expected {expected}, got {got:?}"))
}

fn make_client_endpoint(server_addr: SocketAddr) -> anyhow::Result<Endpoint> {
	let bind = if server_addr.is_ipv6() {
		SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
	} else {
		SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
	};
	Endpoint::client(bind).context("create client endpoint")
}

/// Dev-only TLS config that skips server cert validation.
fn make_insecure_client_config() -> anyhow::Result<QuinnClientConfig> {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

	#[derive(Debug)]
	struct NoVerifier;

	impl rustls::client::danger::ServerCertVerifier for NoVerifier {
		fn verify_server_cert(
			&self,
			_end_entity: &rustls::pki_types::CertificateDer<'_>,
			_intermediates: &[rustls::pki_types::CertificateDer<'_>],
			_server_name: &rustls::pki_types::ServerName<'_>,
			_ocsp_response: &[u8],
			_now: rustls::pki_types::UnixTime,
		) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
			Ok(rustls::client::danger::ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Err(rustls::Error::General("TLS1.2 not supported".into()))
		}

		fn verify_tls13_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
		}

		fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
			vec![
				rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
				rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA256,
				rustls::SignatureScheme::RSA_PSS_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA512,
				rustls::SignatureScheme::ED25519,
			]
		}
	}

	let mut tls = rustls::ClientConfig::builder()
		.with_root_certificates(rustls::RootCertStore::empty())
		.with_no_client_auth();

	tls.dangerous().set_certificate_verifier(Arc::new(NoVerifier));
	tls.alpn_protocols = vec![ALPN.to_vec()];

	let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls)?;

	let mut cfg = QuinnClientConfig::new(Arc::new(quic_tls));

	let mut transport = TransportConfig::default();
	transport.max_concurrent_bidi_streams(VarInt::from_u32(0));
	transport.max_concurrent_uni_streams(VarInt::from_u32(0));
	cfg.transport_config(Arc::new(transport));

	Ok(cfg)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_config_targets_local_dev_server() {
		let cfg = ClientConfig::default();
		assert_eq!(cfg.server_host, "localhost");
		assert_eq!(cfg.server_addr, Some("127.0.0.1:18300".parse().expect("addr")));
		assert!(cfg.max_frame_bytes > 0);
	}

	#[test]
	fn endpoint_config_resolves_ip_literals_only() {
		let cfg = ClientConfig::from_quic_endpoint("quic://127.0.0.1:9000").expect("parse");
		assert_eq!(cfg.server_addr, Some("127.0.0.1:9000".parse().expect("addr")));

		let cfg = ClientConfig::from_quic_endpoint("quic://chat.example.com:443").expect("parse");
		assert_eq!(cfg.server_host, "chat.example.com");
		assert_eq!(cfg.server_port, 443);
		assert!(cfg.server_addr.is_none());

		assert!(ClientConfig::from_quic_endpoint("http://127.0.0.1:1").is_err());
	}

	#[test]
	fn rpc_errors_expose_status() {
		let resp = pb::RpcResponse {
			version: PROTOCOL_VERSION,
			request_id: "r1".to_string(),
			result: Some(rpc_response::Result::Error(pb::RpcError {
				code: StatusCode::Unauthenticated as i32,
				message: "unauthenticated: token expired".to_string(),
			})),
		};
		let err = into_result(resp, "r1").expect_err("error result");
		assert_eq!(err.status(), Some(StatusCode::Unauthenticated));
	}

	#[test]
	fn mismatched_request_id_is_a_protocol_error() {
		let resp = pb::RpcResponse {
			version: PROTOCOL_VERSION,
			request_id: "other".to_string(),
			result: Some(rpc_response::Result::StreamLagged(pb::StreamLagged { dropped: 1 })),
		};
		assert!(matches!(into_result(resp, "mine"), Err(ClientCoreError::Protocol(_))));
	}
}

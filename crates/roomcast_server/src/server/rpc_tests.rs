#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use roomcast_client_core::{ClientConfig, ClientCoreError, RoomcastClient, StreamItem};
use roomcast_domain::{RoomId, UserId};
use roomcast_protocol::pb::StatusCode;
use roomcast_util::SecretString;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::quic::config::{QuicServerConfig, TlsSource};
use crate::server::auth::HmacTokenVerifier;
use crate::server::registry::{RegistryConfig, SubscriberRegistry};
use crate::server::rpc::{ConnectionSettings, handle_connection};
use crate::server::service::{ChatService, ChatServiceConfig};
use crate::server::store::InMemoryStore;

const SECRET: &str = "rpc-tests-secret";
const WAIT: Duration = Duration::from_secs(5);

struct TestServer {
	addr: SocketAddr,
	service: Arc<ChatService>,
	verifier: HmacTokenVerifier,
	shutdown: watch::Sender<bool>,
	accept_task: JoinHandle<()>,
}

impl TestServer {
	async fn start() -> Self {
		let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

		let verifier = HmacTokenVerifier::new(SecretString::new(SECRET));
		let store = Arc::new(InMemoryStore::new());
		store.upsert_user(uid(1), "alice");
		store.upsert_user(uid(2), "bob");
		store.upsert_user(uid(3), "carol");

		let registry = SubscriberRegistry::new(RegistryConfig {
			subscriber_queue_capacity: 64,
			debug_logs: false,
		});
		let service = Arc::new(ChatService::new(
			Arc::new(verifier.clone()),
			store,
			registry,
			ChatServiceConfig::default(),
		));

		let bind: SocketAddr = "127.0.0.1:0".parse().expect("bind addr");
		let endpoint = QuicServerConfig::new(bind)
			.bind(&TlsSource::SelfSigned)
			.expect("bind endpoint");
		let addr = endpoint.local_addr().expect("local addr");

		let (shutdown, shutdown_rx) = watch::channel(false);
		let accept_service = Arc::clone(&service);
		let accept_task = tokio::spawn(async move {
			let mut conn_id = 0u64;
			while let Some(incoming) = endpoint.accept().await {
				let Ok(connection) = incoming.await else {
					continue;
				};
				conn_id += 1;
				let service = Arc::clone(&accept_service);
				let shutdown = shutdown_rx.clone();
				tokio::spawn(async move {
					let _ = handle_connection(conn_id, connection, service, ConnectionSettings::default(), shutdown).await;
				});
			}
		});

		Self {
			addr,
			service,
			verifier,
			shutdown,
			accept_task,
		}
	}

	async fn client(&self, user: i64, name: &str) -> RoomcastClient {
		let token = self.verifier.issue(uid(user), name, Duration::from_secs(3600));
		self.client_with(Some(token)).await
	}

	async fn client_with(&self, token: Option<String>) -> RoomcastClient {
		let cfg = ClientConfig {
			server_host: "localhost".to_string(),
			server_port: self.addr.port(),
			server_addr: Some(self.addr),
			auth_token: token,
			connect_timeout: WAIT,
			request_timeout: WAIT,
			..ClientConfig::default()
		};
		RoomcastClient::connect(cfg).await.expect("connect")
	}

	async fn wait_for_subscribers(&self, room: i64, expected: usize) {
		let room = RoomId::new(room).expect("valid RoomId");
		let registry = self.service.registry();
		timeout(WAIT, async {
			while registry.subscriber_count(room) != expected {
				tokio::time::sleep(Duration::from_millis(10)).await;
			}
		})
		.await
		.unwrap_or_else(|_| panic!("room {room} never reached {expected} subscribers"));
	}
}

impl Drop for TestServer {
	fn drop(&mut self) {
		self.accept_task.abort();
	}
}

fn uid(id: i64) -> UserId {
	UserId::new(id).expect("valid UserId")
}

async fn public_room(client: &RoomcastClient, creator: i64) -> i64 {
	let resp = client
		.create_room("lobby", "general chat", creator, false)
		.await
		.expect("create_room");
	assert!(resp.success, "create_room failed: {}", resp.message);
	resp.room.expect("room in response").id
}

#[tokio::test]
async fn unary_calls_round_trip() {
	let server = TestServer::start().await;
	let alice = server.client(1, "alice").await;
	let bob = server.client(2, "bob").await;

	let room = public_room(&alice, 1).await;

	let joined = bob.join_room(room, 2).await.expect("join_room");
	assert!(joined.success, "{}", joined.message);
	assert_eq!(joined.room_id, room);

	let first = alice.send_message(room, 1, "hello").await.expect("send");
	assert!(first.success);
	assert_eq!(first.status, StatusCode::Ok as i32);
	assert_eq!(first.message, "message sent successfully");
	let second = bob.send_message(room, 2, "hi alice").await.expect("send");
	assert!(second.message_id > first.message_id);
	assert!(!second.timestamp.is_empty());

	let history = bob.get_room_messages(room, 2, 0, 0).await.expect("history");
	assert!(history.success);
	let lines: Vec<_> = history
		.messages
		.iter()
		.map(|m| (m.sender_name.as_str(), m.content.as_str()))
		.collect();
	assert_eq!(lines, [("bob", "hi alice"), ("alice", "hello")]);

	let rooms = bob.get_rooms(2, false, 0, 0).await.expect("get_rooms");
	assert!(rooms.success);
	assert_eq!(rooms.rooms.len(), 1);
	assert_eq!(rooms.rooms[0].name, "lobby");

	let left = bob.leave_room(room, 2).await.expect("leave_room");
	assert!(left.success, "{}", left.message);
}

#[tokio::test]
async fn structured_failures_come_back_in_the_response() {
	let server = TestServer::start().await;
	let alice = server.client(1, "alice").await;
	let bob = server.client(2, "bob").await;

	let private = alice
		.create_room("secret", "", 1, true)
		.await
		.expect("create_room")
		.room
		.expect("room")
		.id;

	let sent = bob.send_message(private, 2, "let me in").await.expect("send");
	assert!(!sent.success);
	assert_eq!(sent.status, StatusCode::PermissionDenied as i32);
	assert_eq!(sent.message_id, 0);

	let joined = bob.join_room(private, 2).await.expect("join_room");
	assert!(!joined.success);
	assert_eq!(joined.room_id, private);

	let left = alice.leave_room(private, 1).await.expect("leave_room");
	assert!(!left.success, "creators cannot leave");

	let missing = alice.send_message(private + 100, 1, "anyone?").await.expect("send");
	assert!(!missing.success);
	assert_eq!(missing.status, StatusCode::NotFound as i32);

	let bad_id = alice.send_message(0, 1, "zero").await.expect("send");
	assert!(!bad_id.success);
	assert_eq!(bad_id.status, StatusCode::InvalidArgument as i32);

	let empty = alice.send_message(private, 1, "").await.expect("send");
	assert!(!empty.success);
	assert_eq!(empty.status, StatusCode::InvalidArgument as i32);
}

#[tokio::test]
async fn transport_errors_surface_as_rpc_errors() {
	let server = TestServer::start().await;
	let anonymous = server.client_with(None).await;

	let err = anonymous.send_message(1, 1, "hello").await.unwrap_err();
	assert_eq!(err.status(), Some(StatusCode::Unauthenticated));

	let mut forged = server.client_with(None).await;
	forged.set_authorization("Bearer not-a-token");
	let err = forged.get_rooms(1, true, 10, 0).await.unwrap_err();
	assert!(matches!(err, ClientCoreError::Rpc {
		code: StatusCode::Unauthenticated,
		..
	}));

	let alice = server.client(1, "alice").await;
	let err = alice.send_message(1, 2, "as bob").await.unwrap_err();
	assert_eq!(err.status(), Some(StatusCode::PermissionDenied));
	assert!(err.to_string().contains("does not match authenticated user"));
}

#[tokio::test]
async fn stream_receives_messages_from_other_clients() {
	let server = TestServer::start().await;
	let alice = server.client(1, "alice").await;
	let bob = server.client(2, "bob").await;
	let room = public_room(&alice, 1).await;

	let mut stream = bob.stream_room_messages(room, 2).await.expect("stream");
	assert_eq!(stream.room_id(), room);
	assert!(stream.subscription_id() > 0);
	server.wait_for_subscribers(room, 1).await;

	for text in ["one", "two", "three"] {
		let ack = alice.send_message(room, 1, text).await.expect("send");
		assert!(ack.success);
		assert!(ack.message.contains("sent"));
	}

	let mut received = Vec::new();
	while received.len() < 3 {
		match timeout(WAIT, stream.next()).await.expect("stream item in time") {
			Ok(Some(StreamItem::Message(m))) => {
				assert_eq!(m.room_id, room);
				assert_eq!(m.sender_name, "alice");
				received.push(m.content);
			}
			other => panic!("unexpected stream item: {other:?}"),
		}
	}
	assert_eq!(received, ["one", "two", "three"]);
}

#[tokio::test]
async fn closing_a_stream_deregisters_it() {
	let server = TestServer::start().await;
	let alice = server.client(1, "alice").await;
	let room = public_room(&alice, 1).await;

	let stream = alice.stream_room_messages(room, 1).await.expect("stream");
	server.wait_for_subscribers(room, 1).await;

	stream.close();
	server.wait_for_subscribers(room, 0).await;

	// Delivery to a room with no subscribers still succeeds.
	let ack = alice.send_message(room, 1, "anyone?").await.expect("send");
	assert!(ack.success);
}

#[tokio::test]
async fn rejected_stream_open_is_an_rpc_error() {
	let server = TestServer::start().await;
	let alice = server.client(1, "alice").await;
	let bob = server.client(2, "bob").await;
	let private = alice
		.create_room("secret", "", 1, true)
		.await
		.expect("create_room")
		.room
		.expect("room")
		.id;

	let err = bob.stream_room_messages(private, 2).await.err().expect("open must fail");
	assert_eq!(err.status(), Some(StatusCode::PermissionDenied));
	assert_eq!(server.service.registry().subscriber_count(RoomId::new(private).unwrap()), 0);

	let err = bob.stream_room_messages(private, 1).await.err().expect("open must fail");
	assert_eq!(err.status(), Some(StatusCode::PermissionDenied));
}

#[tokio::test]
async fn invited_member_reaches_a_private_room() {
	let server = TestServer::start().await;
	let alice = server.client(1, "alice").await;
	let bob = server.client(2, "bob").await;
	let private = alice
		.create_room("secret", "", 1, true)
		.await
		.expect("create_room")
		.room
		.expect("room")
		.id;

	let self_invite = bob.invite_member(private, 2, 2).await.expect("invite_member");
	assert!(!self_invite.success);
	assert_eq!(self_invite.status, StatusCode::FailedPrecondition as i32);

	let invited = alice.invite_member(private, 1, 2).await.expect("invite_member");
	assert!(invited.success, "{}", invited.message);
	assert_eq!(invited.room_id, private);
	assert_eq!(invited.user_id, 2);
	assert!(!invited.joined_at.is_empty());

	let mut stream = bob.stream_room_messages(private, 2).await.expect("invited member streams");
	server.wait_for_subscribers(private, 1).await;

	let ack = alice.send_message(private, 1, "welcome in").await.expect("send");
	assert!(ack.success);
	match timeout(WAIT, stream.next()).await.expect("stream item in time") {
		Ok(Some(StreamItem::Message(m))) => assert_eq!(m.content, "welcome in"),
		other => panic!("unexpected stream item: {other:?}"),
	}

	let reply = bob.send_message(private, 2, "thanks").await.expect("send");
	assert!(reply.success, "{}", reply.message);

	let rooms = bob.get_rooms(2, true, 0, 0).await.expect("get_rooms");
	assert_eq!(rooms.rooms.len(), 1);
	assert!(rooms.rooms[0].is_private);
}

#[tokio::test]
async fn shutdown_ends_open_streams() {
	let server = TestServer::start().await;
	let alice = server.client(1, "alice").await;
	let room = public_room(&alice, 1).await;

	let mut stream = alice.stream_room_messages(room, 1).await.expect("stream");
	server.wait_for_subscribers(room, 1).await;

	server.shutdown.send(true).expect("signal shutdown");

	// Either a clean finish or the connection close may win the race.
	let end = timeout(WAIT, stream.next()).await.expect("stream ends in time");
	assert!(
		matches!(end, Ok(None) | Err(_)),
		"expected end of stream, got {end:?}"
	);
	server.wait_for_subscribers(room, 0).await;
}

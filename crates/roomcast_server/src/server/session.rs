#![forbid(unsafe_code)]

use async_trait::async_trait;
use roomcast_domain::{ChatMessage, Identity, RoomId, UserId};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::server::error::ChatError;
use crate::server::registry::{SubscriberItem, SubscriptionHandle};
use crate::server::service::ChatService;

/// Transport half of a streaming session.
#[async_trait]
pub trait MessageSink: Send {
	async fn send_message(&mut self, message: &ChatMessage) -> anyhow::Result<()>;

	async fn send_lagged(&mut self, dropped: u64) -> anyhow::Result<()>;

	/// Resolves once the peer has gone away.
	async fn closed(&mut self);
}

/// Lifecycle of a constructed session. Authentication, authorization and
/// registration happen inside [`StreamingSession::open`], so a session value
/// starts out `Active`; a failed open yields no session at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
	Active,
	Closed,
}

/// Why an active session stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
	Shutdown,
	PeerClosed,
	SendFailed(String),
	/// The registry dropped this subscriber's queue.
	Detached,
}

/// One client's live subscription to a room.
#[derive(Debug)]
pub struct StreamingSession {
	state: SessionState,
	identity: Identity,
	room: RoomId,
	handle: Option<SubscriptionHandle>,
	rx: mpsc::Receiver<SubscriberItem>,
	forwarded: u64,
}

impl StreamingSession {
	/// Authenticate, authorize and register.
	///
	/// On failure no registry entry exists and the error carries the reason.
	pub async fn open(
		service: &ChatService,
		authorization: &str,
		room: RoomId,
		user: UserId,
	) -> Result<Self, ChatError> {
		debug!(room_id = %room, user_id = %user, "stream open requested");

		let identity = service.authenticate(authorization)?;
		if !identity.is(user) {
			return Err(ChatError::identity_mismatch("user ID"));
		}
		service.authorize_room(&identity, room).await?;

		let (handle, rx) = service.registry().subscribe(room);
		debug!(room_id = %room, user_id = %user, subscription_id = handle.id(), "stream authorized");
		metrics::gauge!("roomcast_active_streams").increment(1.0);

		Ok(Self {
			state: SessionState::Active,
			identity,
			room,
			handle: Some(handle),
			rx,
			forwarded: 0,
		})
	}

	pub fn state(&self) -> SessionState {
		self.state
	}

	pub fn room(&self) -> RoomId {
		self.room
	}

	pub fn identity(&self) -> &Identity {
		&self.identity
	}

	pub fn subscription_id(&self) -> Option<u64> {
		self.handle.as_ref().map(SubscriptionHandle::id)
	}

	/// Forward delivered items to `sink` until shutdown, peer close or a send error.
	pub async fn run<S>(&mut self, sink: &mut S, mut shutdown: watch::Receiver<bool>) -> SessionEnd
	where
		S: MessageSink + ?Sized,
	{
		let end = if self.state != SessionState::Active {
			SessionEnd::Detached
		} else if *shutdown.borrow() {
			SessionEnd::Shutdown
		} else {
			self.forward(sink, &mut shutdown).await
		};

		self.close();
		info!(
			room_id = %self.room,
			user_id = %self.identity.user_id,
			forwarded = self.forwarded,
			reason = ?end,
			"stream closed"
		);
		end
	}

	async fn forward<S>(&mut self, sink: &mut S, shutdown: &mut watch::Receiver<bool>) -> SessionEnd
	where
		S: MessageSink + ?Sized,
	{
		loop {
			tokio::select! {
				changed = shutdown.changed() => {
					if changed.is_err() || *shutdown.borrow() {
						return SessionEnd::Shutdown;
					}
				}
				_ = sink.closed() => return SessionEnd::PeerClosed,
				item = self.rx.recv() => {
					let sent = match item {
						Some(SubscriberItem::Message(message)) => sink.send_message(&message).await,
						Some(SubscriberItem::Lagged { dropped }) => {
							warn!(room_id = %self.room, dropped, "subscriber lagged");
							sink.send_lagged(dropped).await
						}
						None => return SessionEnd::Detached,
					};
					if let Err(e) = sent {
						return SessionEnd::SendFailed(format!("{e:#}"));
					}
					self.forwarded += 1;
				}
			}
		}
	}

	/// Deregister and stop forwarding. Idempotent.
	pub fn close(&mut self) {
		if let Some(handle) = self.handle.take() {
			handle.deregister();
			metrics::gauge!("roomcast_active_streams").decrement(1.0);
		}
		self.rx.close();
		self.state = SessionState::Closed;
	}
}

impl Drop for StreamingSession {
	fn drop(&mut self) {
		self.close();
	}
}

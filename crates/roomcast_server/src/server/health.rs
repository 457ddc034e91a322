#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::warn;

use crate::server::registry::SubscriberRegistry;

#[derive(Clone)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
	registry: SubscriberRegistry,
}

#[derive(Debug, Serialize)]
struct Stats {
	rooms: usize,
	subscribers: usize,
	subscribers_by_room: BTreeMap<i64, usize>,
}

impl HealthState {
	pub fn new(registry: SubscriberRegistry) -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
			registry,
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn mark_unready(&self) {
		self.ready.store(false, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}

	fn stats(&self) -> Stats {
		let subscribers_by_room: BTreeMap<i64, usize> = self
			.registry
			.room_subscriber_counts()
			.into_iter()
			.map(|(room, n)| (room.get(), n))
			.collect();
		Stats {
			rooms: subscribers_by_room.len(),
			subscribers: subscribers_by_room.values().sum(),
			subscribers_by_room,
		}
	}
}

pub fn spawn_health_server(bind: SocketAddr, state: HealthState) {
	tokio::spawn(async move {
		if let Err(err) = run_health_server(bind, state).await {
			warn!(error = %err, "health server stopped");
		}
	});
}

async fn run_health_server(bind: SocketAddr, state: HealthState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_health(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

fn reply(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(body.into()));
	*resp.status_mut() = status;
	resp
}

async fn handle_health(req: Request<Incoming>, state: HealthState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	Ok(route(req.method(), req.uri().path(), &state))
}

fn route(method: &Method, path: &str, state: &HealthState) -> Response<Full<Bytes>> {
	if method != Method::GET {
		return reply(StatusCode::METHOD_NOT_ALLOWED, Bytes::new());
	}

	match path {
		"/healthz" => reply(StatusCode::OK, Bytes::from_static(b"ok")),
		"/readyz" if state.is_ready() => reply(StatusCode::OK, Bytes::from_static(b"ready")),
		"/readyz" => reply(StatusCode::SERVICE_UNAVAILABLE, Bytes::from_static(b"not-ready")),
		"/statsz" => match serde_json::to_vec(&state.stats()) {
			Ok(body) => {
				let mut resp = reply(StatusCode::OK, body);
				resp.headers_mut()
					.insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static("application/json"));
				resp
			}
			Err(e) => {
				warn!(error = %e, "failed to encode stats");
				reply(StatusCode::INTERNAL_SERVER_ERROR, Bytes::new())
			}
		},
		_ => reply(StatusCode::NOT_FOUND, Bytes::new()),
	}
}

#[cfg(test)]
mod tests {
	use roomcast_domain::RoomId;

	use super::*;
	use crate::server::registry::RegistryConfig;

	#[test]
	fn readiness_follows_flag() {
		let state = HealthState::new(SubscriberRegistry::new(RegistryConfig::default()));
		assert_eq!(route(&Method::GET, "/readyz", &state).status(), StatusCode::SERVICE_UNAVAILABLE);
		state.mark_ready();
		assert_eq!(route(&Method::GET, "/readyz", &state).status(), StatusCode::OK);
		state.mark_unready();
		assert_eq!(route(&Method::GET, "/readyz", &state).status(), StatusCode::SERVICE_UNAVAILABLE);
	}

	#[test]
	fn non_get_and_unknown_paths() {
		let state = HealthState::new(SubscriberRegistry::new(RegistryConfig::default()));
		assert_eq!(route(&Method::POST, "/healthz", &state).status(), StatusCode::METHOD_NOT_ALLOWED);
		assert_eq!(route(&Method::GET, "/nope", &state).status(), StatusCode::NOT_FOUND);
		assert_eq!(route(&Method::GET, "/healthz", &state).status(), StatusCode::OK);
	}

	#[tokio::test]
	async fn stats_count_live_subscribers() {
		let registry = SubscriberRegistry::new(RegistryConfig::default());
		let state = HealthState::new(registry.clone());
		let room = RoomId::new(4).expect("room");
		let (_a, _rx_a) = registry.subscribe(room);
		let (_b, _rx_b) = registry.subscribe(room);

		let stats = state.stats();
		assert_eq!(stats.rooms, 1);
		assert_eq!(stats.subscribers, 2);
		assert_eq!(stats.subscribers_by_room.get(&4), Some(&2));

		let resp = route(&Method::GET, "/statsz", &state);
		assert_eq!(resp.status(), StatusCode::OK);
		assert_eq!(
			resp.headers().get(CONTENT_TYPE).map(|v| v.as_bytes()),
			Some(&b"application/json"[..])
		);
	}
}

#![forbid(unsafe_code)]

mod cli;
mod config;
mod quic;
mod server;
mod telemetry;
mod util;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use quinn::Endpoint;
use tokio::sync::watch;
use tracing::{Instrument as _, info, info_span, warn};

use crate::cli::{Args, CliError, USAGE};
use crate::config::{PersistenceSettings, ServerConfig};
use crate::quic::config::{QuicServerConfig, TlsSource};
use crate::server::auth::HmacTokenVerifier;
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::registry::{RegistryConfig, SubscriberRegistry};
use crate::server::rpc::{ConnectionSettings, handle_connection};
use crate::server::service::{ChatService, ChatServiceConfig};
use crate::server::store::{InMemoryStore, MessageStore, SqlStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = match Args::parse(std::env::args().skip(1)) {
		Ok(args) => args,
		Err(CliError::Help) => {
			println!("{USAGE}");
			return Ok(());
		}
		Err(e) => {
			eprintln!("{e}\n\n{USAGE}");
			std::process::exit(2);
		}
	};

	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
	let _telemetry = telemetry::init_tracing("roomcast_server");

	run(args).await
}

async fn run(args: Args) -> anyhow::Result<()> {
	let config_path = match args.config_path {
		Some(path) => path,
		None => config::default_config_path()?,
	};
	let cfg = config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "config loaded");

	if let Some(addr) = parse_bind("metrics", cfg.server.metrics_bind.as_deref()) {
		if let Err(e) = telemetry::install_metrics_exporter(addr) {
			warn!(error = %format!("{e:#}"), "metrics disabled");
		}
	}

	let service = Arc::new(build_service(&cfg).await?);

	let health = HealthState::new(service.registry().clone());
	if let Some(addr) = parse_bind("health", cfg.server.health_bind.as_deref()) {
		spawn_health_server(addr, health.clone());
		info!(%addr, "health server listening");
	}

	let tls = TlsSource::from_paths(cfg.server.tls_cert_path.as_deref(), cfg.server.tls_key_path.as_deref());
	if tls == TlsSource::SelfSigned {
		warn!("no tls_cert_path/tls_key_path configured; serving a self-signed dev certificate");
	}
	let endpoint = QuicServerConfig::new(args.bind_addr).bind(&tls)?;
	info!(bind = %args.bind_addr, "roomcast_server listening");

	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	tokio::spawn({
		let health = health.clone();
		async move {
			match tokio::signal::ctrl_c().await {
				Ok(()) => info!("shutdown requested"),
				Err(e) => {
					warn!(error = %e, "ctrl-c handler failed; shutting down");
				}
			}
			health.mark_unready();
			let _ = shutdown_tx.send(true);
		}
	});

	health.mark_ready();
	serve(&endpoint, service, shutdown_rx).await;

	endpoint.close(0u32.into(), b"server shutdown");
	endpoint.wait_idle().await;
	info!("roomcast_server stopped");
	Ok(())
}

async fn build_service(cfg: &ServerConfig) -> anyhow::Result<ChatService> {
	let verifier = HmacTokenVerifier::new(cfg.require_hmac_secret()?);
	let store = open_store(&cfg.persistence).await?;
	let registry = SubscriberRegistry::new(RegistryConfig {
		subscriber_queue_capacity: cfg.chat.subscriber_queue_capacity,
		debug_logs: cfg!(debug_assertions),
	});

	Ok(ChatService::new(
		Arc::new(verifier),
		store,
		registry,
		ChatServiceConfig {
			default_history_limit: cfg.chat.default_history_limit,
			default_rooms_limit: cfg.chat.default_rooms_limit,
		},
	))
}

async fn open_store(cfg: &PersistenceSettings) -> anyhow::Result<Arc<dyn MessageStore>> {
	if !cfg.enabled {
		warn!("persistence disabled; rooms and messages are kept in memory");
		return Ok(Arc::new(InMemoryStore::new()));
	}

	let url = cfg
		.database_url
		.as_deref()
		.ok_or_else(|| anyhow!("persistence.enabled is set but persistence.database_url is missing"))?;
	Ok(Arc::new(SqlStore::connect(url).await?))
}

fn parse_bind(what: &str, bind: Option<&str>) -> Option<SocketAddr> {
	let bind = bind?;
	match bind.parse() {
		Ok(addr) => Some(addr),
		Err(e) => {
			warn!(error = %e, %bind, "invalid {what} bind address (expected host:port); {what} disabled");
			None
		}
	}
}

/// Accept connections until shutdown is signalled or the endpoint closes.
async fn serve(endpoint: &Endpoint, service: Arc<ChatService>, mut shutdown: watch::Receiver<bool>) {
	let settings = ConnectionSettings::default();
	let mut conn_id: u64 = 0;

	loop {
		let incoming = tokio::select! {
			_ = shutdown.changed() => return,
			incoming = endpoint.accept() => match incoming {
				Some(incoming) => incoming,
				None => return,
			},
		};

		conn_id += 1;
		metrics::counter!("roomcast_server_connections_total").increment(1);

		let service = Arc::clone(&service);
		let settings = settings.clone();
		let shutdown = shutdown.clone();
		let remote = incoming.remote_address();
		tokio::spawn(
			async move {
				let connection = match incoming.await {
					Ok(connection) => connection,
					Err(e) => {
						warn!(error = %e, "quic handshake failed");
						return;
					}
				};
				info!("connection accepted");
				if let Err(e) = handle_connection(conn_id, connection, service, settings, shutdown).await {
					warn!(error = %format!("{e:#}"), "connection ended with error");
				}
			}
			.instrument(info_span!("conn", conn_id, %remote)),
		);
	}
}

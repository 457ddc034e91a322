#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use quinn::{Endpoint, IdleTimeout, ServerConfig, TransportConfig, VarInt};
use roomcast_protocol::version::ALPN;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

/// Where the server's TLS identity comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsSource {
	/// Generate a throwaway certificate for `localhost`.
	SelfSigned,
	PemFiles { cert: PathBuf, key: PathBuf },
}

impl TlsSource {
	/// PEM files when both paths are configured, otherwise a self-signed cert.
	pub fn from_paths(cert: Option<&Path>, key: Option<&Path>) -> Self {
		match (cert, key) {
			(Some(cert), Some(key)) => TlsSource::PemFiles {
				cert: cert.to_path_buf(),
				key: key.to_path_buf(),
			},
			_ => TlsSource::SelfSigned,
		}
	}
}

/// Listener settings for the roomcast QUIC endpoint.
#[derive(Debug, Clone)]
pub struct QuicServerConfig {
	pub bind_addr: SocketAddr,
	pub alpn_protocols: Vec<Vec<u8>>,

	/// One bidirectional stream per RPC, so this caps in-flight calls per connection.
	pub max_concurrent_bidi_streams: u32,

	/// Pings idle connections so long-lived room streams survive NAT timeouts.
	pub keep_alive_interval: Duration,
	pub max_idle_timeout: Duration,
}

impl QuicServerConfig {
	pub fn new(bind_addr: SocketAddr) -> Self {
		Self {
			bind_addr,
			alpn_protocols: vec![ALPN.to_vec()],
			max_concurrent_bidi_streams: 256,
			keep_alive_interval: Duration::from_secs(5),
			max_idle_timeout: Duration::from_secs(30),
		}
	}

	/// Bind the endpoint with the given TLS identity.
	pub fn bind(&self, tls: &TlsSource) -> anyhow::Result<Endpoint> {
		let (chain, key) = match tls {
			TlsSource::SelfSigned => self_signed_identity()?,
			TlsSource::PemFiles { cert, key } => (load_cert_chain(cert)?, load_private_key(key)?),
		};

		let server_config = self.server_config(chain, key)?;
		Endpoint::server(server_config, self.bind_addr)
			.with_context(|| format!("bind QUIC endpoint on {}", self.bind_addr))
	}

	fn server_config(
		&self,
		chain: Vec<CertificateDer<'static>>,
		key: PrivateKeyDer<'static>,
	) -> anyhow::Result<ServerConfig> {
		let mut tls = rustls::ServerConfig::builder()
			.with_no_client_auth()
			.with_single_cert(chain, key)
			.context("build rustls server config")?;
		tls.alpn_protocols = self.alpn_protocols.clone();

		let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(tls).context("adapt rustls config for QUIC")?;
		let mut server_config = ServerConfig::with_crypto(Arc::new(crypto));
		server_config.transport_config(Arc::new(self.transport()?));
		Ok(server_config)
	}

	fn transport(&self) -> anyhow::Result<TransportConfig> {
		let idle = IdleTimeout::try_from(self.max_idle_timeout).map_err(|e| anyhow!("max_idle_timeout: {e}"))?;

		let mut transport = TransportConfig::default();
		transport
			.max_concurrent_bidi_streams(VarInt::from_u32(self.max_concurrent_bidi_streams))
			// Clients never open unidirectional streams.
			.max_concurrent_uni_streams(VarInt::from_u32(0))
			.keep_alive_interval(Some(self.keep_alive_interval))
			.max_idle_timeout(Some(idle));
		Ok(transport)
	}
}

fn self_signed_identity() -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
	let generated =
		rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).context("generate self-signed cert")?;
	let key = PrivateKeyDer::try_from(generated.signing_key.serialize_der())
		.map_err(|e| anyhow!("self-signed key: {e}"))?;
	Ok((vec![generated.cert.der().clone()], key))
}

fn read_pem(path: &Path, what: &str) -> anyhow::Result<Vec<u8>> {
	std::fs::read(path).with_context(|| format!("read tls {what}: {}", path.display()))
}

fn load_cert_chain(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
	let pem = read_pem(path, "cert")?;
	let chain = rustls_pemfile::certs(&mut pem.as_slice())
		.collect::<Result<Vec<_>, _>>()
		.with_context(|| format!("parse certificates in {}", path.display()))?;
	if chain.is_empty() {
		return Err(anyhow!("no certificates found in {}", path.display()));
	}
	Ok(chain)
}

fn load_private_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
	let pem = read_pem(path, "key")?;
	rustls_pemfile::private_key(&mut pem.as_slice())
		.with_context(|| format!("parse private key in {}", path.display()))?
		.ok_or_else(|| anyhow!("no private key found in {}", path.display()))
}

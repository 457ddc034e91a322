#![forbid(unsafe_code)]

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use thiserror::Error;

const SCHEME: &str = "quic://";

/// Errors produced while parsing a `quic://host:port` endpoint.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EndpointError {
	#[error("endpoint must be non-empty (expected quic://host:port)")]
	Empty,
	#[error("endpoint must start with quic:// : {0}")]
	Scheme(String),
	#[error("endpoint must not carry a path, query or fragment: {0}")]
	Trailing(String),
	#[error("endpoint is missing a host: {0}")]
	Host(String),
	#[error("IPv6 hosts must be bracketed, e.g. quic://[::1]:18300 : {0}")]
	UnbracketedIpv6(String),
	#[error("endpoint port must be in 1..=65535: {0}")]
	Port(String),
	#[error("host must be an IP literal here, got {0}")]
	NotIpLiteral(String),
}

/// A parsed `quic://host:port` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuicEndpoint {
	/// DNS name or IP literal; IPv6 keeps its brackets.
	pub host: String,
	pub port: u16,
}

impl QuicEndpoint {
	pub fn parse(s: &str) -> Result<Self, EndpointError> {
		let raw = s.trim();
		if raw.is_empty() {
			return Err(EndpointError::Empty);
		}

		let rest = raw
			.strip_prefix(SCHEME)
			.ok_or_else(|| EndpointError::Scheme(raw.to_string()))?;

		if rest.contains(['/', '?', '#']) {
			return Err(EndpointError::Trailing(raw.to_string()));
		}

		let Some((host, port)) = rest.rsplit_once(':') else {
			return Err(EndpointError::Port(raw.to_string()));
		};

		let host = host.trim();
		if host.is_empty() || host == "[]" {
			return Err(EndpointError::Host(raw.to_string()));
		}
		let bracketed = host.starts_with('[') && host.ends_with(']');
		if host.contains(':') && !bracketed {
			return Err(EndpointError::UnbracketedIpv6(raw.to_string()));
		}

		let port = match port.trim().parse::<u16>() {
			Ok(p) if p != 0 => p,
			_ => return Err(EndpointError::Port(raw.to_string())),
		};

		Ok(Self {
			host: host.to_string(),
			port,
		})
	}

	/// Host with its brackets removed, suitable for TLS server names.
	pub fn server_name(&self) -> &str {
		self.host.trim_start_matches('[').trim_end_matches(']')
	}

	/// Socket address when the host is an IP literal.
	pub fn socket_addr(&self) -> Result<SocketAddr, EndpointError> {
		format!("{}:{}", self.host, self.port)
			.parse()
			.map_err(|_| EndpointError::NotIpLiteral(self.host.clone()))
	}
}

impl fmt::Display for QuicEndpoint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{SCHEME}{}:{}", self.host, self.port)
	}
}

impl FromStr for QuicEndpoint {
	type Err = EndpointError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::parse(s)
	}
}

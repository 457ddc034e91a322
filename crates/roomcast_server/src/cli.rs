#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;

use roomcast_util::QuicEndpoint;
use thiserror::Error;

pub const DEFAULT_BIND: &str = "quic://127.0.0.1:18300";

pub const USAGE: &str = "\
Usage: roomcast_server [--bind quic://host:port] [--config path]

Options:
	--bind, --listen  QUIC endpoint to serve on (default: quic://127.0.0.1:18300)
	--config          Config file (default: ~/.roomcast/config.toml)
	--help            Show this help";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CliError {
	#[error("help requested")]
	Help,
	#[error("{0} requires a value")]
	MissingValue(&'static str),
	#[error("unknown argument: {0}")]
	UnknownArgument(String),
	#[error("invalid bind endpoint: {0}")]
	InvalidBind(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Args {
	pub bind_addr: SocketAddr,
	pub config_path: Option<PathBuf>,
}

impl Args {
	/// Parse command-line arguments, excluding the program name.
	pub fn parse<I>(args: I) -> Result<Self, CliError>
	where
		I: IntoIterator<Item = String>,
	{
		let mut bind = None;
		let mut config_path = None;

		let mut args = args.into_iter();
		while let Some(arg) = args.next() {
			match arg.as_str() {
				"--help" | "-h" => return Err(CliError::Help),
				"--bind" | "--listen" => {
					let value = args
						.next()
						.filter(|v| !v.trim().is_empty())
						.ok_or(CliError::MissingValue("--bind"))?;
					bind = Some(value);
				}
				"--config" => {
					let value = args.next().ok_or(CliError::MissingValue("--config"))?;
					config_path = Some(PathBuf::from(value));
				}
				_ => return Err(CliError::UnknownArgument(arg)),
			}
		}

		let bind = bind.as_deref().unwrap_or(DEFAULT_BIND);
		let bind_addr = QuicEndpoint::parse(bind)
			.and_then(|e| e.socket_addr())
			.map_err(|e| CliError::InvalidBind(e.to_string()))?;

		Ok(Self { bind_addr, config_path })
	}
}

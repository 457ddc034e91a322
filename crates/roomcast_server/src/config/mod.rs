#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use roomcast_util::SecretString;
use serde::Deserialize;
use tracing::{info, warn};

/// Default config path: `~/.roomcast/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".roomcast").join("config.toml"))
}

/// Load the server config from TOML at `path` (if present) plus `ROOMCAST_*` env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub chat: ChatSettings,
	pub persistence: PersistenceSettings,
}

#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// PEM-encoded certificate path for QUIC/TLS.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path for QUIC/TLS.
	pub tls_key_path: Option<PathBuf>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// HMAC secret shared with the token issuer.
	pub auth_hmac_secret: Option<SecretString>,
}

#[derive(Debug, Clone)]
pub struct ChatSettings {
	pub subscriber_queue_capacity: usize,
	pub default_history_limit: i64,
	pub default_rooms_limit: i64,
}

impl Default for ChatSettings {
	fn default() -> Self {
		Self {
			subscriber_queue_capacity: 1024,
			default_history_limit: 10,
			default_rooms_limit: 50,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Use the SQL store instead of the in-memory one.
	pub enabled: bool,
	/// Database URL (sqlite: or postgres:).
	pub database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	chat: FileChatSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileServerSettings {
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	auth_hmac_secret: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileChatSettings {
	subscriber_queue_capacity: Option<usize>,
	default_history_limit: Option<i64>,
	default_rooms_limit: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
}

fn non_blank(s: Option<String>) -> Option<String> {
	s.filter(|s| !s.trim().is_empty())
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = ChatSettings::default();
		Self {
			server: ServerSettings {
				tls_cert_path: non_blank(file.server.tls_cert_path).map(PathBuf::from),
				tls_key_path: non_blank(file.server.tls_key_path).map(PathBuf::from),
				metrics_bind: non_blank(file.server.metrics_bind),
				health_bind: non_blank(file.server.health_bind),
				auth_hmac_secret: non_blank(file.server.auth_hmac_secret).map(SecretString::new),
			},
			chat: ChatSettings {
				subscriber_queue_capacity: file
					.chat
					.subscriber_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(defaults.subscriber_queue_capacity),
				default_history_limit: file
					.chat
					.default_history_limit
					.filter(|v| *v > 0)
					.unwrap_or(defaults.default_history_limit),
				default_rooms_limit: file
					.chat
					.default_rooms_limit
					.filter(|v| *v > 0)
					.unwrap_or(defaults.default_rooms_limit),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: non_blank(file.persistence.database_url),
			},
		}
	}

	/// The HMAC secret, or an error naming how to provide one.
	pub fn require_hmac_secret(&self) -> anyhow::Result<SecretString> {
		self.server.auth_hmac_secret.clone().ok_or_else(|| {
			anyhow!("no auth_hmac_secret configured (set [server].auth_hmac_secret or ROOMCAST_AUTH_HMAC_SECRET)")
		})
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig, env: impl Fn(&str) -> Option<String>) {
	let text = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = text("ROOMCAST_TLS_CERT") {
		cfg.server.tls_cert_path = Some(PathBuf::from(v));
		info!("server config: tls_cert_path overridden by env");
	}

	if let Some(v) = text("ROOMCAST_TLS_KEY") {
		cfg.server.tls_key_path = Some(PathBuf::from(v));
		info!("server config: tls_key_path overridden by env");
	}

	if let Some(v) = text("ROOMCAST_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = text("ROOMCAST_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = text("ROOMCAST_AUTH_HMAC_SECRET") {
		cfg.server.auth_hmac_secret = Some(SecretString::new(v));
		info!("server auth: auth_hmac_secret overridden by env");
	}

	if let Some(v) = text("ROOMCAST_SUBSCRIBER_QUEUE_CAPACITY") {
		match v.parse::<usize>() {
			Ok(capacity) if capacity > 0 => {
				cfg.chat.subscriber_queue_capacity = capacity;
				info!(capacity, "chat config: subscriber_queue_capacity overridden by env");
			}
			_ => warn!(value = %v, "chat config: ignoring invalid ROOMCAST_SUBSCRIBER_QUEUE_CAPACITY"),
		}
	}

	if let Some(v) = text("ROOMCAST_DEFAULT_HISTORY_LIMIT") {
		match v.parse::<i64>() {
			Ok(limit) if limit > 0 => {
				cfg.chat.default_history_limit = limit;
				info!(limit, "chat config: default_history_limit overridden by env");
			}
			_ => warn!(value = %v, "chat config: ignoring invalid ROOMCAST_DEFAULT_HISTORY_LIMIT"),
		}
	}

	if let Some(v) = text("ROOMCAST_DEFAULT_ROOMS_LIMIT") {
		match v.parse::<i64>() {
			Ok(limit) if limit > 0 => {
				cfg.chat.default_rooms_limit = limit;
				info!(limit, "chat config: default_rooms_limit overridden by env");
			}
			_ => warn!(value = %v, "chat config: ignoring invalid ROOMCAST_DEFAULT_ROOMS_LIMIT"),
		}
	}

	if let Some(v) = text("ROOMCAST_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Some(v) = text("ROOMCAST_PERSISTENCE_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if cfg.server.tls_cert_path.is_some() != cfg.server.tls_key_path.is_some() {
		warn!("server config: tls_cert_path and tls_key_path must be set together; using a dev certificate");
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;

	fn parse(toml_src: &str) -> ServerConfig {
		let file: FileConfig = toml::from_str(toml_src).expect("parse toml");
		ServerConfig::from_file(file)
	}

	#[test]
	fn empty_file_uses_defaults() {
		let cfg = parse("");
		assert!(cfg.server.auth_hmac_secret.is_none());
		assert_eq!(cfg.chat.subscriber_queue_capacity, 1024);
		assert_eq!(cfg.chat.default_history_limit, 10);
		assert_eq!(cfg.chat.default_rooms_limit, 50);
		assert!(!cfg.persistence.enabled);
		assert!(cfg.require_hmac_secret().is_err());
	}

	#[test]
	fn sections_are_read() {
		let cfg = parse(
			r#"
[server]
tls_cert_path = "/etc/roomcast/cert.pem"
tls_key_path = "/etc/roomcast/key.pem"
health_bind = "127.0.0.1:18301"
metrics_bind = "  "
auth_hmac_secret = "s3cret"

[chat]
subscriber_queue_capacity = 64
default_history_limit = 25
default_rooms_limit = 0

[persistence]
enabled = true
database_url = "sqlite://roomcast.db"
"#,
		);

		assert_eq!(cfg.server.tls_cert_path, Some(PathBuf::from("/etc/roomcast/cert.pem")));
		assert_eq!(cfg.server.health_bind.as_deref(), Some("127.0.0.1:18301"));
		assert!(cfg.server.metrics_bind.is_none());
		assert_eq!(cfg.require_hmac_secret().expect("secret").expose(), "s3cret");
		assert_eq!(cfg.chat.subscriber_queue_capacity, 64);
		assert_eq!(cfg.chat.default_history_limit, 25);
		assert_eq!(cfg.chat.default_rooms_limit, 50);
		assert!(cfg.persistence.enabled);
		assert_eq!(cfg.persistence.database_url.as_deref(), Some("sqlite://roomcast.db"));
	}

	#[test]
	fn unknown_keys_are_rejected() {
		assert!(toml::from_str::<FileConfig>("[server]\nauth_token = \"x\"\n").is_err());
	}

	#[test]
	fn env_overrides_win_over_file() {
		let mut cfg = parse("[server]\nauth_hmac_secret = \"from-file\"\n");
		let env: HashMap<&str, &str> = HashMap::from([
			("ROOMCAST_AUTH_HMAC_SECRET", "from-env"),
			("ROOMCAST_SUBSCRIBER_QUEUE_CAPACITY", "8"),
			("ROOMCAST_DEFAULT_HISTORY_LIMIT", "-3"),
			("ROOMCAST_PERSISTENCE_ENABLED", "yes"),
			("ROOMCAST_PERSISTENCE_DATABASE_URL", "sqlite::memory:"),
		]);
		apply_env_overrides(&mut cfg, |k| env.get(k).map(|v| (*v).to_string()));

		assert_eq!(cfg.server.auth_hmac_secret.as_ref().map(SecretString::expose), Some("from-env"));
		assert_eq!(cfg.chat.subscriber_queue_capacity, 8);
		assert_eq!(cfg.chat.default_history_limit, 10);
		assert!(cfg.persistence.enabled);
		assert_eq!(cfg.persistence.database_url.as_deref(), Some("sqlite::memory:"));
	}

	#[test]
	fn env_bool_parsing() {
		assert_eq!(parse_env_bool(" On "), Some(true));
		assert_eq!(parse_env_bool("0"), Some(false));
		assert_eq!(parse_env_bool("maybe"), None);
	}

	#[test]
	fn missing_file_is_not_an_error() {
		let cfg = read_toml_if_exists(Path::new("/nonexistent/roomcast/config.toml")).expect("read");
		assert!(cfg.is_none());
	}
}

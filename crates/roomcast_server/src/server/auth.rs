#![forbid(unsafe_code)]

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use roomcast_domain::{Identity, UserId};
use roomcast_util::SecretString;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::util::time::unix_secs_now;

const TOKEN_VERSION: &str = "v1";
const BEARER_SCHEME: &str = "Bearer";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
	#[error("authorization token is required")]
	Missing,
	#[error("malformed token: {0}")]
	Malformed(String),
	#[error("invalid token signature")]
	BadSignature,
	#[error("token expired")]
	Expired,
}

/// Validates an opaque session token into an [`Identity`].
pub trait TokenVerifier: Send + Sync {
	fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Extract the token from `Bearer <token>` request metadata.
pub fn bearer_token(authorization: &str) -> Result<&str, AuthError> {
	let authorization = authorization.trim();
	if authorization.is_empty() {
		return Err(AuthError::Missing);
	}

	let token = match authorization.strip_prefix(BEARER_SCHEME) {
		Some(rest) if rest.is_empty() || rest.starts_with(char::is_whitespace) => rest.trim(),
		_ => return Err(AuthError::Malformed("expected `Bearer <token>`".to_string())),
	};

	if token.is_empty() {
		return Err(AuthError::Missing);
	}
	Ok(token)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
	sub: i64,
	#[serde(default)]
	name: String,
	exp: u64,
}

/// HMAC-SHA256 signed tokens: `v1.<base64url(claims)>.<base64url(sig)>`.
#[derive(Debug, Clone)]
pub struct HmacTokenVerifier {
	secret: SecretString,
}

impl HmacTokenVerifier {
	pub fn new(secret: SecretString) -> Self {
		Self { secret }
	}

	/// Check `token` against an explicit clock (Unix seconds).
	pub fn verify_at(&self, token: &str, now_secs: u64) -> Result<Identity, AuthError> {
		if token.trim().is_empty() {
			return Err(AuthError::Missing);
		}

		let mut parts = token.split('.');
		let (Some(version), Some(payload_b64), Some(sig_b64), None) = (parts.next(), parts.next(), parts.next(), parts.next())
		else {
			return Err(AuthError::Malformed("expected three dot-separated segments".to_string()));
		};
		if version != TOKEN_VERSION {
			return Err(AuthError::Malformed(format!("unsupported token version {version:?}")));
		}

		let provided = URL_SAFE_NO_PAD
			.decode(sig_b64)
			.map_err(|e| AuthError::Malformed(format!("signature: {e}")))?;
		if !constant_time_eq(&self.sign(payload_b64.as_bytes()), &provided) {
			return Err(AuthError::BadSignature);
		}

		let payload = URL_SAFE_NO_PAD
			.decode(payload_b64)
			.map_err(|e| AuthError::Malformed(format!("payload: {e}")))?;
		let claims: Claims =
			serde_json::from_slice(&payload).map_err(|e| AuthError::Malformed(format!("claims: {e}")))?;

		if claims.exp <= now_secs {
			return Err(AuthError::Expired);
		}

		let user_id = UserId::new(claims.sub).map_err(|e| AuthError::Malformed(e.to_string()))?;
		Ok(Identity {
			user_id,
			username: claims.name,
			expires_at: claims.exp,
		})
	}

	/// Mint a token for `user`. Used by tests and local tooling; real tokens come
	/// from the login service that shares this secret.
	#[allow(dead_code)]
	pub fn issue(&self, user: UserId, name: &str, ttl: Duration) -> String {
		self.issue_with_expiry(user, name, unix_secs_now().saturating_add(ttl.as_secs()))
	}

	#[allow(dead_code)]
	pub fn issue_with_expiry(&self, user: UserId, name: &str, exp: u64) -> String {
		let claims = Claims {
			sub: user.get(),
			name: name.to_string(),
			exp,
		};
		let payload = serde_json::to_vec(&claims).unwrap_or_default();
		let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
		let sig_b64 = URL_SAFE_NO_PAD.encode(self.sign(payload_b64.as_bytes()));
		format!("{TOKEN_VERSION}.{payload_b64}.{sig_b64}")
	}

	fn sign(&self, payload_b64: &[u8]) -> Vec<u8> {
		// HMAC accepts keys of any length, so construction cannot fail.
		let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(self.secret.expose().as_bytes()) else {
			return Vec::new();
		};
		mac.update(payload_b64);
		mac.finalize().into_bytes().to_vec()
	}
}

impl TokenVerifier for HmacTokenVerifier {
	fn verify(&self, token: &str) -> Result<Identity, AuthError> {
		self.verify_at(token, unix_secs_now())
	}
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	a.iter().zip(b).fold(0u8, |diff, (x, y)| diff | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
	use super::*;

	fn verifier() -> HmacTokenVerifier {
		HmacTokenVerifier::new(SecretString::new("test-secret"))
	}

	fn alice() -> UserId {
		UserId::new(7).expect("valid user id")
	}

	#[test]
	fn issued_token_verifies_into_identity() {
		let v = verifier();
		let token = v.issue_with_expiry(alice(), "alice", 2_000);

		let id = v.verify_at(&token, 1_000).expect("valid token");
		assert_eq!(id.user_id, alice());
		assert_eq!(id.username, "alice");
		assert_eq!(id.expires_at, 2_000);
	}

	#[test]
	fn expired_token_is_rejected() {
		let v = verifier();
		let token = v.issue_with_expiry(alice(), "alice", 1_000);
		assert_eq!(v.verify_at(&token, 1_000), Err(AuthError::Expired));
		assert_eq!(v.verify_at(&token, 5_000), Err(AuthError::Expired));
	}

	#[test]
	fn token_signed_with_other_secret_is_rejected() {
		let other = HmacTokenVerifier::new(SecretString::new("other-secret"));
		let token = other.issue_with_expiry(alice(), "alice", u64::MAX);
		assert_eq!(verifier().verify_at(&token, 0), Err(AuthError::BadSignature));
	}

	#[test]
	fn tampered_claims_fail_signature_check() {
		let v = verifier();
		let token = v.issue_with_expiry(alice(), "alice", u64::MAX);
		let mut parts: Vec<&str> = token.split('.').collect();
		let forged = URL_SAFE_NO_PAD.encode(br#"{"sub":1,"name":"root","exp":18446744073709551615}"#);
		parts[1] = &forged;
		assert_eq!(v.verify_at(&parts.join("."), 0), Err(AuthError::BadSignature));
	}

	#[test]
	fn garbage_is_malformed_and_empty_is_missing() {
		let v = verifier();
		assert_eq!(v.verify_at("", 0), Err(AuthError::Missing));
		assert!(matches!(v.verify_at("not-a-token", 0), Err(AuthError::Malformed(_))));
		assert!(matches!(v.verify_at("v2.a.b", 0), Err(AuthError::Malformed(_))));
		assert!(matches!(v.verify_at("v1.a.b.c", 0), Err(AuthError::Malformed(_))));
	}

	#[test]
	fn bearer_header_parsing() {
		assert_eq!(bearer_token("Bearer abc"), Ok("abc"));
		assert_eq!(bearer_token("  Bearer   abc  "), Ok("abc"));
		assert_eq!(bearer_token(""), Err(AuthError::Missing));
		assert_eq!(bearer_token("Bearer "), Err(AuthError::Missing));
		assert!(matches!(bearer_token("Basic abc"), Err(AuthError::Malformed(_))));
	}
}

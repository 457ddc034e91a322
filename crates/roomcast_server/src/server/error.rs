#![forbid(unsafe_code)]

use roomcast_protocol::pb::StatusCode;
use thiserror::Error;

use crate::server::auth::AuthError;
use crate::server::store::StoreError;

/// Failures surfaced by `ChatService` operations.
#[derive(Debug, Error)]
pub enum ChatError {
	#[error("unauthenticated: {0}")]
	Unauthenticated(#[from] AuthError),

	/// The request names a user other than the authenticated one.
	#[error("permission denied: {0}")]
	IdentityMismatch(String),

	#[error("permission denied: user is not a member of this room")]
	NotMember,

	#[error("invalid argument: {0}")]
	InvalidArgument(String),

	#[error("not found: {0}")]
	NotFound(String),

	#[error("{0}")]
	Rejected(String),

	#[error("internal error")]
	Internal(#[source] anyhow::Error),
}

impl ChatError {
	pub fn code(&self) -> StatusCode {
		match self {
			ChatError::Unauthenticated(_) => StatusCode::Unauthenticated,
			ChatError::IdentityMismatch(_) | ChatError::NotMember => StatusCode::PermissionDenied,
			ChatError::InvalidArgument(_) => StatusCode::InvalidArgument,
			ChatError::NotFound(_) => StatusCode::NotFound,
			ChatError::Rejected(_) => StatusCode::FailedPrecondition,
			ChatError::Internal(_) => StatusCode::Internal,
		}
	}

	/// Returned as `success: false` responses rather than transport errors.
	pub fn is_structured(&self) -> bool {
		matches!(
			self,
			ChatError::NotMember | ChatError::InvalidArgument(_) | ChatError::NotFound(_) | ChatError::Rejected(_)
		)
	}

	pub(crate) fn identity_mismatch(field: &str) -> Self {
		ChatError::IdentityMismatch(format!("{field} does not match authenticated user"))
	}
}

impl From<StoreError> for ChatError {
	fn from(e: StoreError) -> Self {
		match e {
			StoreError::NotFound(msg) => ChatError::NotFound(msg),
			StoreError::Rejected(msg) => ChatError::Rejected(msg),
			StoreError::Backend(e) => ChatError::Internal(e),
		}
	}
}

impl From<roomcast_domain::ParseIdError> for ChatError {
	fn from(e: roomcast_domain::ParseIdError) -> Self {
		ChatError::InvalidArgument(e.to_string())
	}
}

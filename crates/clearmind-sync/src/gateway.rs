//! Contract with the remote journal API
//!
//! [`RemoteGateway`] is the only way the engine talks to the backend. The
//! production implementation is [`HttpGateway`]; tests substitute scripted
//! gateways.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::SyncError;
use crate::sync::OutboxEntry;
use crate::types::RemoteId;

mod http;

pub use http::{classify_status, HttpGateway};

/// Failure of a single remote call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// The request never got a response (DNS, refused, reset)
    #[error("connection failed: {0}")]
    Connectivity(String),

    /// The call exceeded its time budget
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The server is temporarily unable to handle the request (5xx, 408, 429)
    #[error("service unavailable ({status}): {detail}")]
    Unavailable { status: u16, detail: String },

    /// Missing, expired or wrong credentials (401)
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The server refused the request as invalid or conflicting (other 4xx)
    #[error("rejected ({status}): {detail}")]
    Rejected { status: u16, detail: String },

    /// A success response whose body could not be understood
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl GatewayError {
    /// Whether the same request may succeed later without changes.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Connectivity(_)
                | GatewayError::Timeout(_)
                | GatewayError::Unavailable { .. }
        )
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            GatewayError::Unavailable { status, .. } | GatewayError::Rejected { status, .. } => {
                Some(*status)
            }
            GatewayError::Unauthorized(_) => Some(401),
            GatewayError::Connectivity(_)
            | GatewayError::Timeout(_)
            | GatewayError::InvalidResponse(_) => None,
        }
    }
}

impl From<GatewayError> for SyncError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Connectivity(_)
            | GatewayError::Timeout(_)
            | GatewayError::Unavailable { .. } => SyncError::Connectivity(err.to_string()),
            GatewayError::Unauthorized(_) => SyncError::InvalidCredentials,
            GatewayError::Rejected { detail, .. } => SyncError::Validation(detail),
            GatewayError::InvalidResponse(msg) => SyncError::Validation(msg),
        }
    }
}

/// Bearer token issued by the remote service.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
}

impl Credential {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// Account as the remote service describes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteUser {
    pub id: RemoteId,
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Body of a successful register or login.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResponse {
    pub access_token: String,
    pub user: RemoteUser,
}

impl AuthResponse {
    pub fn credential(&self) -> Credential {
        Credential::new(self.access_token.clone())
    }
}

impl fmt::Debug for AuthResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthResponse")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// Authentication and resource endpoints of the backend.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    async fn register(&self, request: &RegisterRequest) -> Result<AuthResponse, GatewayError>;

    async fn login(&self, request: &LoginRequest) -> Result<AuthResponse, GatewayError>;

    /// Validate a credential and return the account it belongs to.
    async fn me(&self, credential: &Credential) -> Result<RemoteUser, GatewayError>;

    /// Apply one outbox entry remotely.
    async fn deliver(
        &self,
        entry: &OutboxEntry,
        credential: Option<&Credential>,
    ) -> Result<(), GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(GatewayError::Connectivity("refused".into()).is_transient());
        assert!(GatewayError::Timeout(Duration::from_secs(10)).is_transient());
        assert!(GatewayError::Unavailable {
            status: 503,
            detail: String::new()
        }
        .is_transient());
        assert!(!GatewayError::Unauthorized("expired".into()).is_transient());
        assert!(!GatewayError::Rejected {
            status: 409,
            detail: "exists".into()
        }
        .is_transient());
    }

    #[test]
    fn test_conversion_to_sync_error() {
        let err: SyncError = GatewayError::Timeout(Duration::from_secs(1)).into();
        assert!(err.is_transient());
        let err: SyncError = GatewayError::Unauthorized("bad".into()).into();
        assert!(matches!(err, SyncError::InvalidCredentials));
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let credential = Credential::new("eyJhbGciOi.secret");
        assert!(!format!("{:?}", credential).contains("secret"));
    }
}

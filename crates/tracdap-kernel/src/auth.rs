//! Token-validation contract consumed by the gateway's auth concern.
//!
//! Token issuance is an external collaborator; the gateway only ever
//! validates tokens presented on inbound calls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Authentication / authorization errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuthError {
    /// The token is missing, malformed or expired.
    #[error("authentication failed: {0}")]
    Unauthenticated(String),

    /// The token is valid but does not grant the requested access.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

/// Session details extracted from a validated token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub user_id: String,
    pub user_name: String,
    pub expiry: DateTime<Utc>,
    /// Set when the session acts on behalf of another principal.
    pub delegate: Option<String>,
}

impl SessionInfo {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry
    }
}

/// Validates bearer tokens presented on inbound calls.
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str) -> Result<SessionInfo, AuthError>;
}

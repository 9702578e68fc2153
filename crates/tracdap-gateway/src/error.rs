//! Gateway error types.
//!
//! One enum covers every failure the gateway can hit between accepting a
//! byte and handing a response back. Variants follow the platform error
//! taxonomy: startup errors are fatal, request errors map onto HTTP or gRPC
//! statuses exactly once at the client boundary (see [`crate::rest::status`]).

use thiserror::Error;

/// Gateway-level errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GatewayError {
    /// Startup-only configuration or compilation failure. Fatal.
    #[error("startup error: {0}")]
    Startup(String),

    /// The request is structurally invalid (bad path variable, unknown
    /// query key, malformed JSON body). Maps to 400 / INVALID_ARGUMENT.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Missing or unusable credentials. Maps to 401 / UNAUTHENTICATED.
    #[error("authentication failed: {0}")]
    Unauthenticated(String),

    /// Valid credentials, insufficient rights. Maps to 403 / PERMISSION_DENIED.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// No route or resource matched. Maps to 404 / NOT_FOUND.
    #[error("not found: {0}")]
    NotFound(String),

    /// The matched route does not support the request method. Carries the
    /// methods it does support, for the `Allow` header.
    #[error("method not allowed")]
    MethodNotAllowed { allow: Vec<http::Method> },

    /// A backend channel could not be opened or died mid-call. Maps to
    /// 503 / UNAVAILABLE and evicts the channel.
    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    /// A malformed frame or LPM block on the wire. Closes the offending
    /// stream with INTERNAL.
    #[error("protocol corruption: {0}")]
    Corruption(String),

    /// A protocol feature the gateway does not support (e.g. a compressed
    /// LPM frame with no codec configured). Maps to 501 / UNIMPLEMENTED.
    #[error("unimplemented: {0}")]
    Unimplemented(String),

    /// Anything unexpected. Maps to 500 / INTERNAL with a generic message;
    /// the detail stays in the logs with a correlation id.
    #[error("internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP/2 error: {0}")]
    H2(#[from] h2::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] http::Error),
}

impl GatewayError {
    /// True when a failed call may be transparently retried once on a fresh
    /// backend channel (the request itself never reached a healthy peer).
    pub fn is_channel_failure(&self) -> bool {
        matches!(self, GatewayError::Unavailable(_))
    }
}

/// Result alias used throughout the gateway.
pub type GatewayResult<T> = Result<T, GatewayError>;

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Validation(format!("malformed JSON: {err}"))
    }
}

impl From<tracdap_kernel::config::ConfigError> for GatewayError {
    fn from(err: tracdap_kernel::config::ConfigError) -> Self {
        GatewayError::Startup(err.to_string())
    }
}

impl From<tracdap_kernel::auth::AuthError> for GatewayError {
    fn from(err: tracdap_kernel::auth::AuthError) -> Self {
        use tracdap_kernel::auth::AuthError;
        let fallback = err.to_string();
        match err {
            AuthError::Unauthenticated(msg) => GatewayError::Unauthenticated(msg),
            AuthError::PermissionDenied(msg) => GatewayError::PermissionDenied(msg),
            _ => GatewayError::Internal(fallback),
        }
    }
}

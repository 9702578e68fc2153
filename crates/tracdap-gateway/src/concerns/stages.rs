//! The shipped concern stages: logging, auth validation, metadata
//! propagation and error mapping.

use http::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use std::sync::Arc;
use std::time::Duration;
use tonic::transport::Endpoint;
use tracing::{debug, warn};

use tracdap_kernel::auth::TokenValidator;

use crate::concerns::{CallContext, ChannelSetup, ClientCallState, GrpcConcern, NoCallState};
use crate::error::{GatewayError, GatewayResult};
use crate::rest::status::{grpc_code_for, safe_message};

/// Correlation-id header propagated to backends and logged at the boundary.
pub const CORRELATION_HEADER: &str = "x-trac-correlation-id";

// ─────────────────────────────────────────────────────────────────────────────
// Logging
// ─────────────────────────────────────────────────────────────────────────────

/// Logs every call and stamps the correlation id onto outbound metadata.
pub struct LoggingConcern;

struct CorrelationState {
    correlation_id: HeaderValue,
}

impl ClientCallState for CorrelationState {
    fn restore(&self, headers: &mut HeaderMap) {
        headers.insert(
            HeaderName::from_static(CORRELATION_HEADER),
            self.correlation_id.clone(),
        );
    }
}

impl GrpcConcern for LoggingConcern {
    fn name(&self) -> &str {
        "logging"
    }

    fn apply_server_call(&self, ctx: &mut CallContext) -> GatewayResult<()> {
        debug!(
            correlation = %ctx.correlation_id,
            method = %ctx.method_path,
            route = %ctx.route,
            "gRPC call received"
        );
        Ok(())
    }

    fn prepare_client_call(&self, ctx: &CallContext) -> Box<dyn ClientCallState> {
        let value = HeaderValue::from_str(&ctx.correlation_id)
            .unwrap_or_else(|_| HeaderValue::from_static("invalid"));
        Box::new(CorrelationState { correlation_id: value })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Auth validation
// ─────────────────────────────────────────────────────────────────────────────

/// Validates the bearer token on inbound calls and restores it on outbound
/// calls (including the transparent retry).
pub struct AuthValidationConcern {
    validator: Arc<dyn TokenValidator>,
}

impl AuthValidationConcern {
    pub fn new(validator: Arc<dyn TokenValidator>) -> Self {
        Self { validator }
    }

    fn bearer_token(headers: &HeaderMap) -> Option<&str> {
        headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
    }
}

struct AuthCallState {
    authorization: Option<HeaderValue>,
}

impl ClientCallState for AuthCallState {
    fn restore(&self, headers: &mut HeaderMap) {
        if let Some(value) = &self.authorization {
            headers.insert(AUTHORIZATION, value.clone());
        }
    }
}

impl GrpcConcern for AuthValidationConcern {
    fn name(&self) -> &str {
        "auth-validation"
    }

    fn apply_server_call(&self, ctx: &mut CallContext) -> GatewayResult<()> {
        let token = Self::bearer_token(&ctx.headers).ok_or_else(|| {
            GatewayError::Unauthenticated("no authorization token provided".into())
        })?;
        let session = self.validator.validate(token)?;
        if session.is_expired_at(chrono::Utc::now()) {
            return Err(GatewayError::Unauthenticated("session has expired".into()));
        }
        ctx.principal = Some(session.user_id);
        Ok(())
    }

    fn prepare_client_call(&self, ctx: &CallContext) -> Box<dyn ClientCallState> {
        Box::new(AuthCallState { authorization: ctx.headers.get(AUTHORIZATION).cloned() })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Metadata propagation
// ─────────────────────────────────────────────────────────────────────────────

/// Forwards an allow-listed set of inbound headers to backend calls.
/// `grpc-timeout` is always forwarded verbatim; the gateway enforces no
/// deadline of its own.
pub struct MetadataPropagationConcern {
    allow: Vec<HeaderName>,
}

impl MetadataPropagationConcern {
    pub fn new(allow: impl IntoIterator<Item = HeaderName>) -> Self {
        let mut allow: Vec<HeaderName> = allow.into_iter().collect();
        let timeout = HeaderName::from_static("grpc-timeout");
        if !allow.contains(&timeout) {
            allow.push(timeout);
        }
        Self { allow }
    }
}

impl Default for MetadataPropagationConcern {
    fn default() -> Self {
        Self::new([
            HeaderName::from_static("grpc-timeout"),
            HeaderName::from_static("x-trac-tenant"),
            HeaderName::from_static("user-agent"),
        ])
    }
}

struct PropagationState {
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl ClientCallState for PropagationState {
    fn restore(&self, headers: &mut HeaderMap) {
        for (name, value) in &self.headers {
            headers.insert(name.clone(), value.clone());
        }
    }
}

impl GrpcConcern for MetadataPropagationConcern {
    fn name(&self) -> &str {
        "metadata-propagation"
    }

    fn configure_client_channel(&self, channel: &mut ChannelSetup) -> GatewayResult<()> {
        channel.default_headers.insert(
            HeaderName::from_static("x-trac-gateway"),
            HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
        );
        Ok(())
    }

    fn configure_client_builder(&self, endpoint: Endpoint) -> GatewayResult<Endpoint> {
        Ok(endpoint.tcp_nodelay(true).connect_timeout(Duration::from_secs(10)))
    }

    fn prepare_client_call(&self, ctx: &CallContext) -> Box<dyn ClientCallState> {
        let headers = self
            .allow
            .iter()
            .filter_map(|name| ctx.headers.get(name).map(|v| (name.clone(), v.clone())))
            .collect();
        Box::new(PropagationState { headers })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Error mapping
// ─────────────────────────────────────────────────────────────────────────────

/// Maps internal errors at the boundary: the fixed status table decides the
/// code, internal detail is logged under the correlation id and replaced
/// with a generic message.
pub struct ErrorMappingConcern;

impl GrpcConcern for ErrorMappingConcern {
    fn name(&self) -> &str {
        "error-mapping"
    }

    fn prepare_client_call(&self, _ctx: &CallContext) -> Box<dyn ClientCallState> {
        Box::new(NoCallState)
    }

    fn map_error(&self, err: &GatewayError) -> Option<(tonic::Code, String)> {
        let code = grpc_code_for(err);
        if code == tonic::Code::Internal {
            warn!(error = %err, "internal error crossing the client boundary");
        }
        Some((code, safe_message(err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use tracdap_kernel::auth::{AuthError, SessionInfo};

    struct StubValidator {
        accept: &'static str,
    }

    impl TokenValidator for StubValidator {
        fn validate(&self, token: &str) -> Result<SessionInfo, AuthError> {
            if token == self.accept {
                Ok(SessionInfo {
                    user_id: "alice".into(),
                    user_name: "Alice".into(),
                    expiry: Utc::now() + ChronoDuration::hours(1),
                    delegate: None,
                })
            } else {
                Err(AuthError::Unauthenticated("bad token".into()))
            }
        }
    }

    fn ctx_with_auth(token: Option<&str>) -> CallContext {
        let mut headers = HeaderMap::new();
        if let Some(t) = token {
            headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {t}")).unwrap());
        }
        CallContext::new("corr-1", "/svc/Method", "route", headers)
    }

    #[test]
    fn valid_token_sets_principal() {
        let concern = AuthValidationConcern::new(Arc::new(StubValidator { accept: "tok-1" }));
        let mut ctx = ctx_with_auth(Some("tok-1"));
        concern.apply_server_call(&mut ctx).unwrap();
        assert_eq!(ctx.principal.as_deref(), Some("alice"));
    }

    #[test]
    fn missing_token_is_unauthenticated() {
        let concern = AuthValidationConcern::new(Arc::new(StubValidator { accept: "tok-1" }));
        let mut ctx = ctx_with_auth(None);
        assert!(matches!(
            concern.apply_server_call(&mut ctx),
            Err(GatewayError::Unauthenticated(_))
        ));
    }

    #[test]
    fn auth_state_restores_token_on_retry() {
        let concern = AuthValidationConcern::new(Arc::new(StubValidator { accept: "tok-1" }));
        let ctx = ctx_with_auth(Some("tok-1"));
        let state = concern.prepare_client_call(&ctx);

        let mut headers = HeaderMap::new();
        state.restore(&mut headers);
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer tok-1");
    }

    #[test]
    fn propagation_forwards_allow_listed_headers_only() {
        let concern = MetadataPropagationConcern::default();
        let mut ctx = ctx_with_auth(None);
        ctx.headers.insert("grpc-timeout", HeaderValue::from_static("5S"));
        ctx.headers.insert("x-trac-tenant", HeaderValue::from_static("ACME"));
        ctx.headers.insert("x-secret-internal", HeaderValue::from_static("nope"));

        let state = concern.prepare_client_call(&ctx);
        let mut headers = HeaderMap::new();
        state.restore(&mut headers);

        assert_eq!(headers.get("grpc-timeout").unwrap(), "5S");
        assert_eq!(headers.get("x-trac-tenant").unwrap(), "ACME");
        assert!(headers.get("x-secret-internal").is_none());
    }

    #[test]
    fn error_mapping_hides_internal_detail() {
        let concern = ErrorMappingConcern;
        let (code, msg) = concern
            .map_error(&GatewayError::Internal("stack detail".into()))
            .unwrap();
        assert_eq!(code, tonic::Code::Internal);
        assert_eq!(msg, "an internal error occurred");

        let (code, msg) = concern
            .map_error(&GatewayError::NotFound("object missing".into()))
            .unwrap();
        assert_eq!(code, tonic::Code::NotFound);
        assert_eq!(msg, "object missing");
    }
}

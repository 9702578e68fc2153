//! The fixed gRPC-status to HTTP-status mapping.
//!
//! Error mapping is a pure function of the gRPC status and lives in this
//! one table; translators and handlers must not map statuses themselves.

use http::StatusCode;
use tonic::Code;

use crate::error::GatewayError;

/// Map a gRPC status code onto an HTTP status, per the platform table.
pub fn http_status_for(code: Code) -> StatusCode {
    match code {
        Code::Ok => StatusCode::OK,
        Code::InvalidArgument => StatusCode::BAD_REQUEST,
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
        Code::PermissionDenied => StatusCode::FORBIDDEN,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::AlreadyExists => StatusCode::CONFLICT,
        Code::FailedPrecondition => StatusCode::PRECONDITION_FAILED,
        Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Canonical SCREAMING_SNAKE_CASE name of a gRPC status code, as emitted in
/// REST error bodies.
pub fn code_name(code: Code) -> &'static str {
    match code {
        Code::Ok => "OK",
        Code::Cancelled => "CANCELLED",
        Code::Unknown => "UNKNOWN",
        Code::InvalidArgument => "INVALID_ARGUMENT",
        Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
        Code::NotFound => "NOT_FOUND",
        Code::AlreadyExists => "ALREADY_EXISTS",
        Code::PermissionDenied => "PERMISSION_DENIED",
        Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
        Code::FailedPrecondition => "FAILED_PRECONDITION",
        Code::Aborted => "ABORTED",
        Code::OutOfRange => "OUT_OF_RANGE",
        Code::Unimplemented => "UNIMPLEMENTED",
        Code::Internal => "INTERNAL",
        Code::Unavailable => "UNAVAILABLE",
        Code::DataLoss => "DATA_LOSS",
        Code::Unauthenticated => "UNAUTHENTICATED",
    }
}

/// Map a gateway error onto the gRPC status it crosses the boundary as.
///
/// Internal errors deliberately lose their detail here; the detail is
/// logged with a correlation id before this function is called.
pub fn grpc_code_for(err: &GatewayError) -> Code {
    match err {
        GatewayError::Validation(_) => Code::InvalidArgument,
        GatewayError::Unauthenticated(_) => Code::Unauthenticated,
        GatewayError::PermissionDenied(_) => Code::PermissionDenied,
        GatewayError::NotFound(_) => Code::NotFound,
        GatewayError::MethodNotAllowed { .. } => Code::InvalidArgument,
        GatewayError::Unavailable(_) => Code::Unavailable,
        GatewayError::Unimplemented(_) => Code::Unimplemented,
        GatewayError::Corruption(_) => Code::Internal,
        _ => Code::Internal,
    }
}

/// Client-safe message for a gateway error. Internal detail never crosses
/// the boundary.
pub fn safe_message(err: &GatewayError) -> String {
    match err {
        GatewayError::Validation(msg)
        | GatewayError::Unauthenticated(msg)
        | GatewayError::PermissionDenied(msg)
        | GatewayError::NotFound(msg)
        | GatewayError::Unavailable(msg)
        | GatewayError::Unimplemented(msg) => msg.clone(),
        GatewayError::MethodNotAllowed { .. } => "method not allowed".to_string(),
        _ => "an internal error occurred".to_string(),
    }
}

/// REST error body: `{"error": message, "code": code_name}`.
pub fn error_body(code: Code, message: &str) -> serde_json::Value {
    serde_json::json!({ "error": message, "code": code_name(code) })
}

/// Parse a `grpc-status` trailer value back into a [`Code`].
pub fn parse_grpc_status(value: &str) -> Code {
    value
        .parse::<i32>()
        .map(Code::from)
        .unwrap_or(Code::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_matches_platform_mapping() {
        assert_eq!(http_status_for(Code::Ok), StatusCode::OK);
        assert_eq!(http_status_for(Code::InvalidArgument), StatusCode::BAD_REQUEST);
        assert_eq!(http_status_for(Code::Unauthenticated), StatusCode::UNAUTHORIZED);
        assert_eq!(http_status_for(Code::PermissionDenied), StatusCode::FORBIDDEN);
        assert_eq!(http_status_for(Code::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(http_status_for(Code::AlreadyExists), StatusCode::CONFLICT);
        assert_eq!(http_status_for(Code::FailedPrecondition), StatusCode::PRECONDITION_FAILED);
        assert_eq!(http_status_for(Code::ResourceExhausted), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(http_status_for(Code::Unimplemented), StatusCode::NOT_IMPLEMENTED);
        assert_eq!(http_status_for(Code::Unavailable), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(http_status_for(Code::DeadlineExceeded), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn unlisted_codes_map_to_500() {
        assert_eq!(http_status_for(Code::Internal), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(http_status_for(Code::Unknown), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(http_status_for(Code::Aborted), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn error_body_shape() {
        let body = error_body(Code::InvalidArgument, "missing schema");
        assert_eq!(body["error"], "missing schema");
        assert_eq!(body["code"], "INVALID_ARGUMENT");
    }

    #[test]
    fn internal_detail_never_crosses_boundary() {
        let err = GatewayError::Internal("pool index 3 out of bounds".into());
        assert_eq!(safe_message(&err), "an internal error occurred");
        assert_eq!(grpc_code_for(&err), tonic::Code::Internal);
    }

    #[test]
    fn grpc_status_parse() {
        assert_eq!(parse_grpc_status("0"), Code::Ok);
        assert_eq!(parse_grpc_status("5"), Code::NotFound);
        assert_eq!(parse_grpc_status("bogus"), Code::Unknown);
    }
}

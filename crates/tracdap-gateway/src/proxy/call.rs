//! gRPC calls over backend channels.
//!
//! Helpers used by the REST, gRPC-Web and WebSocket translators: build the
//! backend request, run a unary or server-streaming exchange, and apply the
//! single transparent retry for idempotent methods after a channel failure.

use bytes::Bytes;
use h2::client::SendRequest;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, Request, Uri};
use prost_reflect::MethodDescriptor;
use tonic::Code;
use tracing::debug;

use crate::concerns::{restore_call_states, CallContext};
use crate::error::{GatewayError, GatewayResult};
use crate::flow::{map_h2_stream_error, send_with_capacity};
use crate::grpc::lpm::{self, LpmDecoder};
use crate::proxy::ConnCtx;
use crate::rest::status::parse_grpc_status;
use crate::routing::Route;

/// The collected result of a unary backend call.
#[derive(Debug)]
pub struct GrpcReply {
    pub headers: HeaderMap,
    /// Decoded message payloads, LPM framing stripped.
    pub messages: Vec<Bytes>,
    pub trailers: HeaderMap,
    pub grpc_code: Code,
    pub grpc_message: String,
}

/// Build the backend HTTP/2 request for a gRPC call. Call metadata comes
/// from the concern stack's per-call states plus the channel's defaults.
pub fn build_grpc_request(
    ctx: &ConnCtx,
    route: &Route,
    call_ctx: &CallContext,
) -> GatewayResult<Request<()>> {
    let uri: Uri = format!(
        "http://{}:{}{}",
        route.target.host, route.target.port, call_ctx.method_path
    )
    .parse()
    .map_err(|e| GatewayError::Internal(format!("backend uri: {e}")))?;

    let mut headers = HeaderMap::new();
    headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
    headers.insert(HeaderName::from_static("te"), HeaderValue::from_static("trailers"));

    let channel_setup = ctx.state.concerns.configure_client_channel()?;
    for (name, value) in &channel_setup.default_headers {
        headers.insert(name.clone(), value.clone());
    }

    let states = ctx.state.concerns.prepare_client_call(call_ctx);
    restore_call_states(&states, &mut headers);

    let mut request = Request::builder().method(Method::POST).uri(uri).body(())?;
    *request.headers_mut() = headers;
    Ok(request)
}

/// Run one unary exchange: send a single framed message, half-close, and
/// collect response messages + trailers. Trailers-only responses (status in
/// the initial headers, no body) are handled.
pub async fn grpc_unary(
    send: &mut SendRequest<Bytes>,
    request: Request<()>,
    payload: Bytes,
) -> GatewayResult<GrpcReply> {
    let (response_fut, mut backend_stream) = send
        .send_request(request, false)
        .map_err(|e| GatewayError::Unavailable(format!("backend stream refused: {e}")))?;

    send_with_capacity(&mut backend_stream, lpm::encode(&payload)).await?;
    backend_stream
        .send_data(Bytes::new(), true)
        .map_err(|e| map_h2_stream_error("backend half-close", e))?;

    let response = response_fut
        .await
        .map_err(|e| map_h2_stream_error("backend response", e))?;
    let (parts, mut body) = response.into_parts();

    // Trailers-only response: grpc-status arrives in the headers.
    if let Some(status) = parts.headers.get("grpc-status") {
        let code = parse_grpc_status(status.to_str().unwrap_or("2"));
        let message = grpc_message(&parts.headers);
        return Ok(GrpcReply {
            headers: parts.headers,
            messages: Vec::new(),
            trailers: HeaderMap::new(),
            grpc_code: code,
            grpc_message: message,
        });
    }

    let mut decoder = LpmDecoder::new();
    let mut messages = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|e| map_h2_stream_error("backend body", e))?;
        let len = chunk.len();
        decoder.push(&chunk);
        while let Some(frame) = decoder.next_frame()? {
            messages.push(frame.payload);
        }
        body.flow_control()
            .release_capacity(len)
            .map_err(|e| map_h2_stream_error("backend window", e))?;
    }
    if decoder.pending() > 0 {
        return Err(GatewayError::Corruption("truncated LPM frame in backend response".into()));
    }

    let trailers = body
        .trailers()
        .await
        .map_err(|e| map_h2_stream_error("backend trailers", e))?
        .unwrap_or_default();

    let code = trailers
        .get("grpc-status")
        .and_then(|v| v.to_str().ok())
        .map(parse_grpc_status)
        .unwrap_or(Code::Unknown);

    Ok(GrpcReply {
        headers: parts.headers,
        grpc_message: grpc_message(&trailers),
        messages,
        trailers,
        grpc_code: code,
    })
}

/// Open a streaming exchange: send one framed request message, half-close,
/// return the response head + body stream for the caller to drive.
pub async fn grpc_server_streaming(
    send: &mut SendRequest<Bytes>,
    request: Request<()>,
    payload: Bytes,
) -> GatewayResult<(http::response::Parts, h2::RecvStream)> {
    let (response_fut, mut backend_stream) = send
        .send_request(request, false)
        .map_err(|e| GatewayError::Unavailable(format!("backend stream refused: {e}")))?;

    send_with_capacity(&mut backend_stream, lpm::encode(&payload)).await?;
    backend_stream
        .send_data(Bytes::new(), true)
        .map_err(|e| map_h2_stream_error("backend half-close", e))?;

    let response = response_fut
        .await
        .map_err(|e| map_h2_stream_error("backend response", e))?;
    let (parts, body) = response.into_parts();
    Ok((parts, body))
}

/// Unary call with channel management: open or reuse the route's channel,
/// run the exchange, and on a channel-level failure evict the channel and
/// retry exactly once when the call is idempotent.
pub async fn call_unary(
    ctx: &ConnCtx,
    route: &Route,
    call_ctx: &CallContext,
    payload: Bytes,
    idempotent: bool,
) -> GatewayResult<GrpcReply> {
    let first = attempt_unary(ctx, route, call_ctx, payload.clone()).await;
    match first {
        Err(err) if err.is_channel_failure() => {
            ctx.channels.lock().await.evict(route.index);
            if !idempotent {
                return Err(err);
            }
            debug!(conn = ctx.conn_id, route = %route.name,
                   "channel failure on idempotent call, retrying once");
            attempt_unary(ctx, route, call_ctx, payload).await
        }
        other => other,
    }
}

async fn attempt_unary(
    ctx: &ConnCtx,
    route: &Route,
    call_ctx: &CallContext,
    payload: Bytes,
) -> GatewayResult<GrpcReply> {
    let mut send = ctx.channels.lock().await.get_or_open(route, ctx.conn_id).await?;
    let request = build_grpc_request(ctx, route, call_ctx)?;
    grpc_unary(&mut send, request, payload).await
}

/// True when a gRPC method is marked safe for transparent retry
/// (`idempotency_level` of NO_SIDE_EFFECTS or IDEMPOTENT in its options).
pub fn method_is_idempotent(method: &MethodDescriptor) -> bool {
    method
        .options()
        .get_field_by_name("idempotency_level")
        .and_then(|v| v.as_enum_number())
        .map(|level| level != 0)
        .unwrap_or(false)
}

fn grpc_message(headers: &HeaderMap) -> String {
    headers
        .get("grpc-message")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

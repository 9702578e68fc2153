//! The transport-agnostic request pipeline for REST, gRPC-Web and plain
//! HTTP proxying.
//!
//! Both fronts (HTTP/1.1 via hyper, HTTP/2 via h2) funnel buffered request
//! heads + bodies through these handlers and render the returned
//! [`RestReply`] onto their wire. Streaming responses (downloads, JSON
//! array streams, proxied bodies) are driven through a channel by a
//! spawned task.

use bytes::{Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue, ALLOW, CONTENT_TYPE, LOCATION};
use http::{Method, StatusCode};
use prost_reflect::DynamicMessage;
use prost::Message;
use std::sync::Arc;
use tokio::sync::mpsc;
use tonic::Code;
use tracing::debug;

use crate::concerns::{restore_call_states, CallContext};
use crate::error::{GatewayError, GatewayResult};
use crate::flow::{map_h2_stream_error, send_with_capacity};
use crate::grpc::lpm::{self, LpmDecoder};
use crate::grpc::web::{self, GrpcWebDecoder};
use crate::proxy::call::{self, method_is_idempotent};
use crate::proxy::ConnCtx;
use crate::rest::status::{code_name, error_body, grpc_code_for, http_status_for, safe_message};
use crate::rest::translate;
use crate::rest::RestBinding;
use crate::routing::{Route, RouteLookup};

/// Response channel depth for streamed replies.
const STREAM_CHANNEL_DEPTH: usize = 16;

/// A rendered reply, ready for either front to put on the wire.
pub enum RestReply {
    Full {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
    Stream {
        status: StatusCode,
        headers: HeaderMap,
        body: mpsc::Receiver<GatewayResult<Bytes>>,
    },
}

impl RestReply {
    fn full(status: StatusCode, content_type: &str, body: Bytes) -> Self {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(content_type) {
            headers.insert(CONTENT_TYPE, value);
        }
        RestReply::Full { status, headers, body }
    }

    fn json(status: StatusCode, value: &serde_json::Value) -> Self {
        let body = serde_json::to_vec(value).unwrap_or_default();
        Self::full(status, "application/json", Bytes::from(body))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// REST entry point
// ─────────────────────────────────────────────────────────────────────────────

/// Handle one buffered REST / plain-HTTP request. Never returns `Err`:
/// every error is mapped onto a reply exactly once, here.
pub async fn handle_rest(
    ctx: &Arc<ConnCtx>,
    method: Method,
    host: &str,
    path_and_query: &str,
    headers: HeaderMap,
    body: Bytes,
) -> RestReply {
    let correlation = ctx.correlation_id();
    let (path, query) = match path_and_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_and_query, None),
    };

    // Redirects short-circuit before any matching.
    if let Some((status, target)) = ctx.state.table.check_redirect(path) {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&target) {
            headers.insert(LOCATION, value);
        }
        return RestReply::Full { status, headers, body: Bytes::new() };
    }

    // Rewrites apply to REST paths before matching.
    let rewritten = ctx.state.table.apply_rewrites(path);

    match ctx.state.table.lookup(host, &rewritten, &method) {
        RouteLookup::NotFound => RestReply::json(
            StatusCode::NOT_FOUND,
            &error_body(Code::NotFound, &format!("no route matched '{path}'")),
        ),
        RouteLookup::MethodNotAllowed { allow } => {
            let mut reply = RestReply::json(
                StatusCode::METHOD_NOT_ALLOWED,
                &error_body(Code::InvalidArgument, "method not allowed"),
            );
            if let RestReply::Full { headers, .. } = &mut reply {
                let allow_list = allow
                    .iter()
                    .map(|m| m.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                if let Ok(value) = HeaderValue::from_str(&allow_list) {
                    headers.insert(ALLOW, value);
                }
            }
            reply
        }
        RouteLookup::Match { route, rest_binding: Some(binding) } => {
            match rest_call(ctx, &route, &binding, &correlation, &rewritten, query, &method, headers, body)
                .await
            {
                Ok(reply) => reply,
                Err(err) => error_reply(ctx, &correlation, &err),
            }
        }
        RouteLookup::Match { route, rest_binding: None } => {
            match proxy_http(ctx, &route, &correlation, &method, path_and_query, headers, body).await {
                Ok(reply) => reply,
                Err(err) => error_reply(ctx, &correlation, &err),
            }
        }
    }
}

/// Map an error onto a client-visible reply, once, logging the detail
/// under the correlation id.
pub fn error_reply(ctx: &Arc<ConnCtx>, correlation: &str, err: &GatewayError) -> RestReply {
    let (code, message) = ctx
        .state
        .concerns
        .map_error(err)
        .unwrap_or_else(|| (grpc_code_for(err), safe_message(err)));

    debug!(correlation = correlation, error = %err, code = code_name(code),
           "request failed at the client boundary");

    let status = http_status_for(code);
    let mut reply = RestReply::json(status, &error_body(code, &message));
    if let (GatewayError::MethodNotAllowed { allow }, RestReply::Full { headers, .. }) =
        (err, &mut reply)
    {
        let allow_list = allow.iter().map(|m| m.as_str()).collect::<Vec<_>>().join(", ");
        if let Ok(value) = HeaderValue::from_str(&allow_list) {
            headers.insert(ALLOW, value);
        }
    }
    reply
}

// ─────────────────────────────────────────────────────────────────────────────
// REST call translation
// ─────────────────────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn rest_call(
    ctx: &Arc<ConnCtx>,
    route: &Arc<Route>,
    binding: &Arc<RestBinding>,
    correlation: &str,
    path: &str,
    query: Option<&str>,
    method: &Method,
    headers: HeaderMap,
    body: Bytes,
) -> GatewayResult<RestReply> {
    let captures = binding
        .match_path(path, method)
        .ok_or_else(|| GatewayError::Internal("binding matched at lookup but not at call".into()))?;

    let mut call_ctx = CallContext::new(correlation, binding.grpc_path(), &route.name, headers);
    ctx.state.concerns.apply_server_call(&mut call_ctx)?;

    let request_msg = translate::build_request(binding, &captures, query, &body)?;
    let payload = Bytes::from(request_msg.encode_to_vec());

    let accept = call_ctx
        .headers
        .get(http::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let idempotent = *method == Method::GET
        || *method == Method::HEAD
        || method_is_idempotent(&binding.method);

    if !binding.server_streaming {
        let reply = call::call_unary(ctx, route, &call_ctx, payload, idempotent).await?;
        if reply.grpc_code != Code::Ok {
            return Ok(RestReply::json(
                http_status_for(reply.grpc_code),
                &error_body(reply.grpc_code, &reply.grpc_message),
            ));
        }
        let message_bytes = reply
            .messages
            .first()
            .ok_or_else(|| GatewayError::Corruption("unary response carried no message".into()))?;
        let response_msg = DynamicMessage::decode(binding.method.output(), message_bytes.clone())
            .map_err(|e| GatewayError::Corruption(format!("cannot decode backend response: {e}")))?;

        let rest = translate::project_response(binding, &response_msg, accept.as_deref())?;
        return Ok(RestReply::full(rest.status, &rest.content_type, rest.body));
    }

    stream_rest_response(ctx, route, binding, call_ctx, payload, accept).await
}

/// Server-streaming REST responses: a JSON array for ordinary bindings,
/// chunked raw bytes for download bindings.
async fn stream_rest_response(
    ctx: &Arc<ConnCtx>,
    route: &Arc<Route>,
    binding: &Arc<RestBinding>,
    call_ctx: CallContext,
    payload: Bytes,
    accept: Option<String>,
) -> GatewayResult<RestReply> {
    let mut send = ctx.channels.lock().await.get_or_open(route, ctx.conn_id).await?;
    let request = call::build_grpc_request(ctx, route, &call_ctx)?;
    let (parts, mut body) = call::grpc_server_streaming(&mut send, request, payload).await?;

    // Trailers-only error before any data.
    if let Some(status) = parts.headers.get("grpc-status") {
        let code = crate::rest::status::parse_grpc_status(status.to_str().unwrap_or("2"));
        if code != Code::Ok {
            let message = parts
                .headers
                .get("grpc-message")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            return Ok(RestReply::json(http_status_for(code), &error_body(code, message)));
        }
    }

    let download = binding.download;
    let content_type = if download {
        accept
            .filter(|a| !a.is_empty() && a.as_str() != "*/*")
            .unwrap_or_else(|| "application/octet-stream".to_string())
    } else {
        "application/json".to_string()
    };

    let (tx, rx) = mpsc::channel(STREAM_CHANNEL_DEPTH);
    let binding = Arc::clone(binding);
    let idle = Arc::clone(&ctx.idle);

    tokio::spawn(async move {
        let mut decoder = LpmDecoder::new();
        let mut first = true;
        if !download && tx.send(Ok(Bytes::from_static(b"["))).await.is_err() {
            return;
        }

        loop {
            let chunk = match body.data().await {
                Some(Ok(chunk)) => chunk,
                Some(Err(err)) => {
                    let _ = tx.send(Err(map_h2_stream_error("backend stream", err))).await;
                    return;
                }
                None => break,
            };
            idle.touch();
            let len = chunk.len();
            decoder.push(&chunk);
            if body.flow_control().release_capacity(len).is_err() {
                return;
            }

            loop {
                let frame = match decoder.next_frame() {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(err) => {
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                };
                let piece = match render_stream_element(&binding, frame.payload, download, &mut first)
                {
                    Ok(piece) => piece,
                    Err(err) => {
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                };
                if !piece.is_empty() && tx.send(Ok(piece)).await.is_err() {
                    return;
                }
            }
        }

        // Verify the stream finished cleanly before closing the array.
        match body.trailers().await {
            Ok(trailers) => {
                let code = trailers
                    .as_ref()
                    .and_then(|t| t.get("grpc-status"))
                    .and_then(|v| v.to_str().ok())
                    .map(crate::rest::status::parse_grpc_status)
                    .unwrap_or(Code::Ok);
                if code != Code::Ok {
                    let _ = tx
                        .send(Err(GatewayError::Unavailable(format!(
                            "backend stream failed with {}",
                            code_name(code)
                        ))))
                        .await;
                    return;
                }
            }
            Err(err) => {
                let _ = tx.send(Err(map_h2_stream_error("backend trailers", err))).await;
                return;
            }
        }

        if !download {
            let _ = tx.send(Ok(Bytes::from_static(b"]"))).await;
        }
    });

    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        headers.insert(CONTENT_TYPE, value);
    }
    Ok(RestReply::Stream { status: StatusCode::OK, headers, body: rx })
}

fn render_stream_element(
    binding: &RestBinding,
    payload: Bytes,
    download: bool,
    first: &mut bool,
) -> GatewayResult<Bytes> {
    let msg = DynamicMessage::decode(binding.method.output(), payload)
        .map_err(|e| GatewayError::Corruption(format!("cannot decode stream element: {e}")))?;

    if download {
        return Ok(translate::download_chunk(binding, &msg));
    }

    let element = translate::project_stream_element(binding, &msg)?;
    let mut piece = BytesMut::new();
    if !*first {
        piece.extend_from_slice(b",");
    }
    *first = false;
    piece.extend_from_slice(&serde_json::to_vec(&element)?);
    Ok(piece.freeze())
}

// ─────────────────────────────────────────────────────────────────────────────
// gRPC-Web (buffered)
// ─────────────────────────────────────────────────────────────────────────────

/// Handle one buffered gRPC-Web exchange. The body is a sequence of LPM
/// frames (base64 in the text variant); the reply is data frames in the
/// same encoding plus one trailer frame.
pub async fn handle_grpc_web(
    ctx: &Arc<ConnCtx>,
    host: &str,
    path: &str,
    content_type: &str,
    headers: HeaderMap,
    body: Bytes,
) -> RestReply {
    let correlation = ctx.correlation_id();
    match grpc_web_exchange(ctx, host, path, content_type, headers, body, &correlation).await {
        Ok(reply) => reply,
        Err(err) => {
            // gRPC-Web errors are reported in-band: HTTP 200 with a
            // trailer frame carrying the status.
            let (code, message) = ctx
                .state
                .concerns
                .map_error(&err)
                .unwrap_or_else(|| (grpc_code_for(&err), safe_message(&err)));
            debug!(correlation = correlation, error = %err, "grpc-web call failed");

            let text = web::is_grpc_web_text(content_type);
            let mut trailers = HeaderMap::new();
            trailers.insert(
                "grpc-status",
                HeaderValue::from_str(&(code as i32).to_string())
                    .unwrap_or(HeaderValue::from_static("2")),
            );
            if let Ok(value) = HeaderValue::from_str(&message) {
                trailers.insert("grpc-message", value);
            }
            RestReply::full(
                StatusCode::OK,
                web::response_content_type(content_type),
                web::trailer_frame(&trailers, text),
            )
        }
    }
}

async fn grpc_web_exchange(
    ctx: &Arc<ConnCtx>,
    host: &str,
    path: &str,
    content_type: &str,
    headers: HeaderMap,
    body: Bytes,
    correlation: &str,
) -> GatewayResult<RestReply> {
    let route = match ctx.state.table.lookup(host, path, &Method::POST) {
        RouteLookup::Match { route, .. } => route,
        _ => return Err(GatewayError::NotFound(format!("no route matched '{path}'"))),
    };

    let text = web::is_grpc_web_text(content_type);
    let mut decoder = GrpcWebDecoder::new(text);
    decoder.push(&body)?;

    let mut inbound = BytesMut::new();
    while let Some(frame) = decoder.next_frame()? {
        inbound.extend_from_slice(&lpm::encode_with_flags(&frame.payload, frame.flags));
    }
    if !decoder.is_clean() {
        return Err(GatewayError::Corruption("truncated grpc-web request body".into()));
    }

    let mut call_ctx = CallContext::new(correlation, path, &route.name, headers);
    ctx.state.concerns.apply_server_call(&mut call_ctx)?;

    let mut send = ctx.channels.lock().await.get_or_open(&route, ctx.conn_id).await?;
    let request = call::build_grpc_request(ctx, &route, &call_ctx)?;

    let (response_fut, mut backend_stream) = send
        .send_request(request, false)
        .map_err(|e| GatewayError::Unavailable(format!("backend stream refused: {e}")))?;
    send_with_capacity(&mut backend_stream, inbound.freeze()).await?;
    backend_stream
        .send_data(Bytes::new(), true)
        .map_err(|e| map_h2_stream_error("backend half-close", e))?;

    let response = response_fut
        .await
        .map_err(|e| map_h2_stream_error("backend response", e))?;
    let (parts, mut backend_body) = response.into_parts();

    let mut out = BytesMut::new();

    // Trailers-only response: synthesize the trailer frame from headers.
    if parts.headers.contains_key("grpc-status") {
        let trailers = trailing_metadata(&parts.headers);
        out.extend_from_slice(&web::trailer_frame(&trailers, text));
        return Ok(RestReply::full(
            StatusCode::OK,
            web::response_content_type(content_type),
            out.freeze(),
        ));
    }

    let mut lpm_decoder = LpmDecoder::new();
    while let Some(chunk) = backend_body.data().await {
        let chunk = chunk.map_err(|e| map_h2_stream_error("backend body", e))?;
        ctx.idle.touch();
        let len = chunk.len();
        lpm_decoder.push(&chunk);
        while let Some(frame) = lpm_decoder.next_frame()? {
            let framed = lpm::encode_with_flags(&frame.payload, frame.flags);
            out.extend_from_slice(&web::encode_response_frame(framed, text));
        }
        backend_body
            .flow_control()
            .release_capacity(len)
            .map_err(|e| map_h2_stream_error("backend window", e))?;
    }

    let trailers = backend_body
        .trailers()
        .await
        .map_err(|e| map_h2_stream_error("backend trailers", e))?
        .unwrap_or_default();
    out.extend_from_slice(&web::trailer_frame(&trailing_metadata(&trailers), text));

    Ok(RestReply::full(
        StatusCode::OK,
        web::response_content_type(content_type),
        out.freeze(),
    ))
}

/// Trailing metadata for the in-body trailer frame: `grpc-status` and
/// `grpc-message` first, then custom metadata, transport headers excluded.
fn trailing_metadata(source: &HeaderMap) -> HeaderMap {
    let mut trailers = HeaderMap::new();
    let status = source
        .get("grpc-status")
        .cloned()
        .unwrap_or(HeaderValue::from_static("0"));
    trailers.insert("grpc-status", status);
    if let Some(message) = source.get("grpc-message") {
        trailers.insert("grpc-message", message.clone());
    }
    for (name, value) in source {
        if name == "grpc-status" || name == "grpc-message" {
            continue;
        }
        if is_transport_header(name) {
            continue;
        }
        trailers.append(name.clone(), value.clone());
    }
    trailers
}

// ─────────────────────────────────────────────────────────────────────────────
// Plain HTTP proxying (HTTP/1.1 <-> HTTP/2)
// ─────────────────────────────────────────────────────────────────────────────

/// Hop-by-hop headers never forwarded across the proxy.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_transport_header(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
        || name == http::header::CONTENT_TYPE
        || name == http::header::CONTENT_LENGTH
        || name == "date"
}

/// Forward one buffered non-gRPC request onto the route's HTTP/2 backend
/// channel, one stream per request, and stream the response back.
async fn proxy_http(
    ctx: &Arc<ConnCtx>,
    route: &Arc<Route>,
    correlation: &str,
    method: &Method,
    path_and_query: &str,
    headers: HeaderMap,
    body: Bytes,
) -> GatewayResult<RestReply> {
    let mut send = ctx.channels.lock().await.get_or_open(route, ctx.conn_id).await?;

    let uri: http::Uri = format!(
        "http://{}:{}{}",
        route.target.host, route.target.port, path_and_query
    )
    .parse()
    .map_err(|e| GatewayError::Internal(format!("backend uri: {e}")))?;

    let mut request = http::Request::builder().method(method.clone()).uri(uri).body(())?;
    for (name, value) in &headers {
        if HOP_BY_HOP.contains(&name.as_str()) || name == http::header::HOST {
            continue;
        }
        request.headers_mut().append(name.clone(), value.clone());
    }
    if let Ok(value) = HeaderValue::from_str(correlation) {
        request
            .headers_mut()
            .insert(HeaderName::from_static("x-trac-correlation-id"), value);
    }

    let end_of_stream = body.is_empty();
    let (response_fut, mut backend_stream) = send
        .send_request(request, end_of_stream)
        .map_err(|e| GatewayError::Unavailable(format!("backend stream refused: {e}")))?;
    if !end_of_stream {
        send_with_capacity(&mut backend_stream, body).await?;
        backend_stream
            .send_data(Bytes::new(), true)
            .map_err(|e| map_h2_stream_error("backend body", e))?;
    }

    let response = response_fut
        .await
        .map_err(|e| map_h2_stream_error("backend response", e))?;
    let (parts, mut backend_body) = response.into_parts();

    let mut out_headers = HeaderMap::new();
    for (name, value) in &parts.headers {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        out_headers.append(name.clone(), value.clone());
    }

    let (tx, rx) = mpsc::channel(STREAM_CHANNEL_DEPTH);
    let idle = Arc::clone(&ctx.idle);
    tokio::spawn(async move {
        while let Some(chunk) = backend_body.data().await {
            match chunk {
                Ok(data) => {
                    idle.touch();
                    let len = data.len();
                    if tx.send(Ok(data)).await.is_err() {
                        return;
                    }
                    if backend_body.flow_control().release_capacity(len).is_err() {
                        return;
                    }
                }
                Err(err) => {
                    let _ = tx.send(Err(map_h2_stream_error("backend body", err))).await;
                    return;
                }
            }
        }
    });

    Ok(RestReply::Stream { status: parts.status, headers: out_headers, body: rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concerns::{ErrorMappingConcern, GrpcConcernBuilder, LoggingConcern};
    use crate::conn::IdleMonitor;
    use crate::grpc::lpm::LpmDecoder;
    use crate::rest::testing::{metadata_pool, rule};
    use crate::routing::RouteTable;
    use crate::state::GatewayState;
    use http::HeaderValue;
    use prost_reflect::{DynamicMessage, Value};
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tracdap_kernel::config::{
        GatewayConfig, GrpcProtocol, ListenConfig, RouteConfig, TargetConfig, TargetProtocol,
    };

    /// What the stub backend should do with a call.
    #[derive(Clone, Copy)]
    enum StubBehaviour {
        /// Echo a Tag{objectId, version:1} built from the request's
        /// object_id field.
        TagFromRequest,
        /// Trailers-only INVALID_ARGUMENT "missing schema".
        MissingSchema,
    }

    /// A minimal in-process gRPC backend speaking raw h2, close enough to
    /// the real services for unary exchanges.
    async fn stub_backend(behaviour: StubBehaviour) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else { return };
                tokio::spawn(async move {
                    let mut conn = match h2::server::handshake(socket).await {
                        Ok(conn) => conn,
                        Err(_) => return,
                    };
                    while let Some(Ok((request, mut respond))) = conn.accept().await {
                        let (_parts, mut body) = request.into_parts();

                        let mut decoder = LpmDecoder::new();
                        while let Some(Ok(chunk)) = body.data().await {
                            let len = chunk.len();
                            decoder.push(&chunk);
                            let _ = body.flow_control().release_capacity(len);
                        }
                        let frame = decoder.next_frame().unwrap();

                        match behaviour {
                            StubBehaviour::MissingSchema => {
                                let response = http::Response::builder()
                                    .status(StatusCode::OK)
                                    .header(CONTENT_TYPE, "application/grpc")
                                    .header("grpc-status", "3")
                                    .header("grpc-message", "missing schema")
                                    .body(())
                                    .unwrap();
                                let _ = respond.send_response(response, true);
                            }
                            StubBehaviour::TagFromRequest => {
                                let pool = metadata_pool();
                                let request_desc = pool
                                    .get_message_by_name("tracdap.test.ReadObjectRequest")
                                    .unwrap();
                                let request_msg = DynamicMessage::decode(
                                    request_desc,
                                    frame.unwrap().payload,
                                )
                                .unwrap();
                                let object_id = request_msg
                                    .get_field_by_name("object_id")
                                    .unwrap()
                                    .as_str()
                                    .unwrap()
                                    .to_string();

                                let tag_desc =
                                    pool.get_message_by_name("tracdap.test.Tag").unwrap();
                                let mut tag = DynamicMessage::new(tag_desc);
                                tag.set_field_by_name("object_id", Value::String(object_id));
                                tag.set_field_by_name("version", Value::I32(1));

                                let response = http::Response::builder()
                                    .status(StatusCode::OK)
                                    .header(CONTENT_TYPE, "application/grpc")
                                    .body(())
                                    .unwrap();
                                let mut stream =
                                    respond.send_response(response, false).unwrap();
                                stream
                                    .send_data(lpm::encode(&tag.encode_to_vec()), false)
                                    .unwrap();
                                let mut trailers = HeaderMap::new();
                                trailers
                                    .insert("grpc-status", HeaderValue::from_static("0"));
                                let _ = stream.send_trailers(trailers);
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    /// Gateway context with one route to the stub and the given bindings.
    fn gateway_ctx(
        backend: SocketAddr,
        bindings: Vec<Arc<crate::rest::RestBinding>>,
    ) -> Arc<ConnCtx> {
        let config = GatewayConfig {
            listen: ListenConfig { host: "127.0.0.1".into(), port: 0 },
            idle_timeout_seconds: 30,
            data_api_name: String::new(),
            routes: vec![RouteConfig {
                name: "metadata".into(),
                host: None,
                path_prefix: "/tracdap.test.MetadataService".into(),
                methods: vec![],
                target: TargetConfig {
                    host: backend.ip().to_string(),
                    port: backend.port(),
                    protocol: TargetProtocol::Grpc,
                },
                grpc_protocol: Some(GrpcProtocol::Grpc),
            }],
            redirects: vec![],
            rewrites: vec![],
            services: vec![],
            fault_log_bytes: 256,
        };

        let mut table = RouteTable::build(&config).unwrap();
        table.attach_bindings("metadata", bindings).unwrap();

        let concerns = GrpcConcernBuilder::new()
            .add_stage(Arc::new(LoggingConcern))
            .add_stage(Arc::new(ErrorMappingConcern))
            .build();

        let state = Arc::new(GatewayState { config, table, concerns });
        let idle = IdleMonitor::new(Duration::from_secs(30));
        ConnCtx::new(state, idle, 1, "127.0.0.1:55555".parse().unwrap())
    }

    fn compile(method_name: &str, r: crate::rest::HttpRule) -> Arc<crate::rest::RestBinding> {
        let pool = metadata_pool();
        let method = pool
            .get_service_by_name("tracdap.test.MetadataService")
            .unwrap()
            .methods()
            .find(|m| m.name() == method_name)
            .unwrap();
        Arc::new(crate::rest::RestBinding::compile(&method, &r).unwrap().remove(0))
    }

    /// REST GET with path variables, end to end through a live backend
    /// channel: the backend sees the translated message and the client
    /// gets canonical JSON back.
    #[tokio::test]
    async fn rest_get_with_path_variables_round_trip() {
        let backend = stub_backend(StubBehaviour::TagFromRequest).await;
        let binding = compile(
            "ReadObject",
            rule(Method::GET, "/metadata/{tenant}/objects/{objectId}", "", ""),
        );
        let ctx = gateway_ctx(backend, vec![binding]);

        let mut headers = HeaderMap::new();
        headers.insert(http::header::ACCEPT, HeaderValue::from_static("application/json"));

        let reply = handle_rest(
            &ctx,
            Method::GET,
            "trac.example.com",
            "/metadata/ACME_CORP/objects/abc-123",
            headers,
            Bytes::new(),
        )
        .await;

        match reply {
            RestReply::Full { status, headers, body } => {
                assert_eq!(status, StatusCode::OK);
                assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/json");
                let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
                assert_eq!(json["objectId"], "abc-123");
                assert_eq!(json["version"], 1);
            }
            RestReply::Stream { .. } => panic!("expected a full reply"),
        }
    }

    /// REST POST with a wildcard body, backend rejects: the gRPC status
    /// maps through the fixed table onto 400 with the error body shape.
    #[tokio::test]
    async fn rest_post_error_maps_through_status_table() {
        let backend = stub_backend(StubBehaviour::MissingSchema).await;
        let binding = compile(
            "SaveObject",
            rule(Method::POST, "/metadata/{tenant}/save:create", "definition", ""),
        );
        let ctx = gateway_ctx(backend, vec![binding]);

        let reply = handle_rest(
            &ctx,
            Method::POST,
            "trac.example.com",
            "/metadata/T1/save:create",
            HeaderMap::new(),
            Bytes::from_static(br#"{"schema":"s1"}"#),
        )
        .await;

        match reply {
            RestReply::Full { status, body, .. } => {
                assert_eq!(status, StatusCode::BAD_REQUEST);
                let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
                assert_eq!(json["error"], "missing schema");
                assert_eq!(json["code"], "INVALID_ARGUMENT");
            }
            RestReply::Stream { .. } => panic!("expected a full reply"),
        }
    }

    /// gRPC-Web unary: one LPM frame in, one data frame + one trailer
    /// frame out, carrying grpc-status 0.
    #[tokio::test]
    async fn grpc_web_unary_round_trip() {
        let backend = stub_backend(StubBehaviour::TagFromRequest).await;
        let ctx = gateway_ctx(backend, vec![]);

        let pool = metadata_pool();
        let request_desc = pool.get_message_by_name("tracdap.test.ReadObjectRequest").unwrap();
        let mut request_msg = DynamicMessage::new(request_desc);
        request_msg.set_field_by_name("tenant", Value::String("ACME_CORP".into()));
        request_msg.set_field_by_name("object_id", Value::String("abc-123".into()));
        let body = lpm::encode(&request_msg.encode_to_vec());

        let reply = handle_grpc_web(
            &ctx,
            "trac.example.com",
            "/tracdap.test.MetadataService/ReadObject",
            "application/grpc-web+proto",
            HeaderMap::new(),
            body,
        )
        .await;

        match reply {
            RestReply::Full { status, headers, body } => {
                assert_eq!(status, StatusCode::OK);
                assert_eq!(
                    headers.get(CONTENT_TYPE).unwrap(),
                    "application/grpc-web+proto"
                );

                let mut decoder = LpmDecoder::new();
                decoder.push(&body);
                let data = decoder.next_frame().unwrap().unwrap();
                assert!(!data.is_trailers());

                let tag_desc = pool.get_message_by_name("tracdap.test.Tag").unwrap();
                let tag = DynamicMessage::decode(tag_desc, data.payload).unwrap();
                assert_eq!(
                    tag.get_field_by_name("object_id").unwrap().as_str(),
                    Some("abc-123")
                );

                let trailer = decoder.next_frame().unwrap().unwrap();
                assert!(trailer.is_trailers());
                let trailers = lpm::decode_trailers(&trailer.payload).unwrap();
                assert_eq!(trailers.get("grpc-status").unwrap(), "0");
            }
            RestReply::Stream { .. } => panic!("expected a full reply"),
        }
    }

    /// An unreachable backend surfaces as 503 and the route's channel is
    /// evicted rather than left poisoned.
    #[tokio::test]
    async fn unreachable_backend_maps_to_unavailable() {
        // A bound-then-dropped listener gives a port with nothing on it.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = listener.local_addr().unwrap();
        drop(listener);

        let binding = compile(
            "ReadObject",
            rule(Method::GET, "/metadata/{tenant}/objects/{objectId}", "", ""),
        );
        let ctx = gateway_ctx(dead, vec![binding]);

        let reply = handle_rest(
            &ctx,
            Method::GET,
            "trac.example.com",
            "/metadata/T1/objects/x",
            HeaderMap::new(),
            Bytes::new(),
        )
        .await;

        match reply {
            RestReply::Full { status, body, .. } => {
                assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
                let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
                assert_eq!(json["code"], "UNAVAILABLE");
            }
            RestReply::Stream { .. } => panic!("expected a full reply"),
        }
    }

    /// Unmatched paths produce exactly one 404 with the error body shape.
    #[tokio::test]
    async fn unmatched_path_is_404() {
        let backend = stub_backend(StubBehaviour::TagFromRequest).await;
        let ctx = gateway_ctx(backend, vec![]);

        let reply = handle_rest(
            &ctx,
            Method::GET,
            "trac.example.com",
            "/no/such/path",
            HeaderMap::new(),
            Bytes::new(),
        )
        .await;

        match reply {
            RestReply::Full { status, body, .. } => {
                assert_eq!(status, StatusCode::NOT_FOUND);
                let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
                assert_eq!(json["code"], "NOT_FOUND");
            }
            RestReply::Stream { .. } => panic!("expected a full reply"),
        }
    }
}

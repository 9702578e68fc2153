//! The HTTP/2 front.
//!
//! One h2 server connection per negotiated HTTP/2 client. Streams are
//! accepted in a select loop (racing the idle monitor) and dispatched by
//! content type: native gRPC is proxied bidirectionally with explicit
//! flow-control bridging, gRPC-Web is translated, anything else goes
//! through the shared REST pipeline.

use bytes::{Bytes, BytesMut};
use h2::server::SendResponse;
use h2::RecvStream;
use http::header::HeaderValue;
use http::{Method, Request, Response, StatusCode};
use std::sync::Arc;
use tokio::net::TcpStream;
use tonic::Code;
use tracing::{debug, info, warn};

use crate::concerns::{restore_call_states, CallContext};
use crate::conn::PrefixedStream;
use crate::error::{GatewayError, GatewayResult};
use crate::flow::{map_h2_stream_error, pump, send_with_capacity};
use crate::grpc::web;
use crate::proxy::rest_front::{self, RestReply};
use crate::proxy::ConnCtx;
use crate::rest::status::grpc_code_for;
use crate::routing::RouteLookup;

/// Serve one HTTP/2 connection until the client goes away or the idle
/// timeout fires. Backend channels belonging to this connection are closed
/// on the way out; dropping the connection resets any in-flight streams.
pub async fn serve_h2(ctx: Arc<ConnCtx>, io: PrefixedStream<TcpStream>) -> GatewayResult<()> {
    let mut connection = h2::server::Builder::new()
        .handshake::<_, Bytes>(io)
        .await
        .map_err(|e| GatewayError::Io(std::io::Error::other(e)))?;

    loop {
        tokio::select! {
            accepted = connection.accept() => match accepted {
                Some(Ok((request, respond))) => {
                    ctx.idle.touch();
                    let ctx = Arc::clone(&ctx);
                    tokio::spawn(async move {
                        handle_h2_stream(ctx, request, respond).await;
                    });
                }
                Some(Err(err)) => {
                    debug!(conn = ctx.conn_id, error = %err, "HTTP/2 connection error");
                    break;
                }
                None => break,
            },
            _ = ctx.idle.expired() => {
                info!(conn = ctx.conn_id, "idle timeout, closing connection");
                // Dropping the connection resets open streams; clients see
                // the stream terminate and treat the call as UNAVAILABLE.
                break;
            }
        }
    }

    ctx.channels.lock().await.close_all();
    Ok(())
}

async fn handle_h2_stream(
    ctx: Arc<ConnCtx>,
    request: Request<RecvStream>,
    respond: SendResponse<Bytes>,
) {
    let content_type = request
        .headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    if web::is_grpc(&content_type) {
        grpc_proxy(ctx, request, respond).await;
    } else if web::is_grpc_web(&content_type) {
        grpc_web_stream(ctx, request, respond, &content_type).await;
    } else {
        rest_stream(ctx, request, respond).await;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Native gRPC proxying
// ─────────────────────────────────────────────────────────────────────────────

async fn grpc_proxy(ctx: Arc<ConnCtx>, request: Request<RecvStream>, mut respond: SendResponse<Bytes>) {
    let (parts, client_body) = request.into_parts();
    let path = parts.uri.path().to_string();
    let host = parts.uri.host().unwrap_or_default().to_string();
    let correlation = ctx.correlation_id();

    let route = match ctx.state.table.lookup(&host, &path, &Method::POST) {
        RouteLookup::Match { route, .. } => route,
        _ => {
            warn!(conn = ctx.conn_id, path = %path, "no route for gRPC call");
            respond_grpc_error(&mut respond, Code::Unimplemented, "unknown method");
            return;
        }
    };

    let mut call_ctx = CallContext::new(&correlation, &path, &route.name, parts.headers.clone());
    if let Err(err) = ctx.state.concerns.apply_server_call(&mut call_ctx) {
        respond_grpc_error(&mut respond, grpc_code_for(&err), &err.to_string());
        return;
    }

    let mut send = match ctx.channels.lock().await.get_or_open(&route, ctx.conn_id).await {
        Ok(send) => send,
        Err(err) => {
            warn!(conn = ctx.conn_id, correlation = %correlation, error = %err,
                  "backend channel unavailable");
            respond_grpc_error(&mut respond, Code::Unavailable, "upstream unavailable");
            return;
        }
    };

    // Forward the client's call headers, dropping connection-level ones,
    // then let the concern stack restore its per-call metadata on top.
    let uri: http::Uri = match format!(
        "http://{}:{}{}",
        route.target.host, route.target.port, path
    )
    .parse()
    {
        Ok(uri) => uri,
        Err(err) => {
            respond_grpc_error(&mut respond, Code::Internal, &format!("bad backend uri: {err}"));
            return;
        }
    };
    let mut backend_req = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .body(())
        .expect("request parts are valid");
    for (name, value) in &parts.headers {
        if name == http::header::HOST || name == "connection" {
            continue;
        }
        backend_req.headers_mut().append(name.clone(), value.clone());
    }
    let states = ctx.state.concerns.prepare_client_call(&call_ctx);
    restore_call_states(&states, backend_req.headers_mut());

    let (response_fut, backend_send) = match send.send_request(backend_req, false) {
        Ok(pair) => pair,
        Err(err) => {
            ctx.channels.lock().await.evict(route.index);
            warn!(conn = ctx.conn_id, error = %err, "backend stream refused");
            respond_grpc_error(&mut respond, Code::Unavailable, "upstream unavailable");
            return;
        }
    };

    // Client -> backend, with visible flow accounting. A client reset
    // surfaces as a pump error and drops the backend stream, which resets
    // it - RST propagation in one direction.
    let inbound_idle = Arc::clone(&ctx.idle);
    let inbound_conn = ctx.conn_id;
    let inbound = tokio::spawn(async move {
        if let Err(err) = pump(client_body, backend_send, move || inbound_idle.touch()).await {
            debug!(conn = inbound_conn, error = %err, "client-to-backend pump ended");
        }
    });

    let response = match response_fut.await {
        Ok(response) => response,
        Err(err) => {
            inbound.abort();
            ctx.channels.lock().await.evict(route.index);
            warn!(conn = ctx.conn_id, correlation = %correlation, error = %err,
                  "backend call failed");
            respond_grpc_error(&mut respond, Code::Unavailable, "upstream unavailable");
            return;
        }
    };

    let (backend_parts, backend_body) = response.into_parts();
    let mut client_response = Response::builder()
        .status(backend_parts.status)
        .body(())
        .expect("response parts are valid");
    *client_response.headers_mut() = backend_parts.headers;

    let client_send = match respond.send_response(client_response, false) {
        Ok(stream) => stream,
        Err(err) => {
            inbound.abort();
            debug!(conn = ctx.conn_id, error = %err, "client went away before response");
            return;
        }
    };

    // Backend -> client. A backend reset drops the client stream the same
    // way - the inverse RST propagation.
    let outbound_idle = Arc::clone(&ctx.idle);
    if let Err(err) = pump(backend_body, client_send, move || outbound_idle.touch()).await {
        debug!(conn = ctx.conn_id, correlation = %correlation, error = %err,
               "backend-to-client pump ended");
        if err.is_channel_failure() {
            ctx.channels.lock().await.evict(route.index);
        }
    }
}

/// In-band gRPC error: 200 response, `grpc-status` in the trailers.
fn respond_grpc_error(respond: &mut SendResponse<Bytes>, code: Code, message: &str) {
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/grpc")
        .body(())
        .expect("response parts are valid");

    match respond.send_response(response, false) {
        Ok(mut stream) => {
            let mut trailers = http::HeaderMap::new();
            trailers.insert(
                "grpc-status",
                HeaderValue::from_str(&(code as i32).to_string())
                    .unwrap_or(HeaderValue::from_static("2")),
            );
            if !message.is_empty() {
                if let Ok(value) = HeaderValue::from_str(message) {
                    trailers.insert("grpc-message", value);
                }
            }
            if let Err(err) = stream.send_trailers(trailers) {
                debug!(error = %err, "failed to send error trailers");
            }
        }
        Err(err) => debug!(error = %err, "failed to send error response"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// gRPC-Web and REST over HTTP/2
// ─────────────────────────────────────────────────────────────────────────────

async fn grpc_web_stream(
    ctx: Arc<ConnCtx>,
    request: Request<RecvStream>,
    mut respond: SendResponse<Bytes>,
    content_type: &str,
) {
    let (parts, mut body) = request.into_parts();
    let path = parts.uri.path().to_string();
    let host = parts.uri.host().unwrap_or_default().to_string();

    let buffered = match read_full_body(&ctx, &mut body).await {
        Ok(buffered) => buffered,
        Err(err) => {
            debug!(conn = ctx.conn_id, error = %err, "failed to read grpc-web body");
            respond_grpc_error(&mut respond, Code::Internal, "malformed request body");
            return;
        }
    };

    let reply =
        rest_front::handle_grpc_web(&ctx, &host, &path, content_type, parts.headers, buffered).await;
    send_reply(&ctx, reply, respond).await;
}

async fn rest_stream(ctx: Arc<ConnCtx>, request: Request<RecvStream>, mut respond: SendResponse<Bytes>) {
    let (parts, mut body) = request.into_parts();
    let method = parts.method.clone();
    let host = parts.uri.host().unwrap_or_default().to_string();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let buffered = match read_full_body(&ctx, &mut body).await {
        Ok(buffered) => buffered,
        Err(err) => {
            debug!(conn = ctx.conn_id, error = %err, "failed to read request body");
            respond_grpc_error(&mut respond, Code::Internal, "malformed request body");
            return;
        }
    };

    let reply =
        rest_front::handle_rest(&ctx, method, &host, &path_and_query, parts.headers, buffered).await;
    send_reply(&ctx, reply, respond).await;
}

async fn send_reply(ctx: &Arc<ConnCtx>, reply: RestReply, mut respond: SendResponse<Bytes>) {
    match reply {
        RestReply::Full { status, headers, body } => {
            let mut response = Response::builder()
                .status(status)
                .body(())
                .expect("response parts are valid");
            *response.headers_mut() = headers;

            match respond.send_response(response, body.is_empty()) {
                Ok(mut stream) => {
                    if !body.is_empty() {
                        if let Err(err) = send_with_capacity(&mut stream, body).await {
                            debug!(conn = ctx.conn_id, error = %err, "reply body send failed");
                            return;
                        }
                        let _ = stream.send_data(Bytes::new(), true);
                    }
                }
                Err(err) => debug!(conn = ctx.conn_id, error = %err, "client went away"),
            }
        }
        RestReply::Stream { status, headers, mut body } => {
            let mut response = Response::builder()
                .status(status)
                .body(())
                .expect("response parts are valid");
            *response.headers_mut() = headers;

            let mut stream = match respond.send_response(response, false) {
                Ok(stream) => stream,
                Err(err) => {
                    debug!(conn = ctx.conn_id, error = %err, "client went away");
                    return;
                }
            };

            while let Some(chunk) = body.recv().await {
                match chunk {
                    Ok(data) => {
                        ctx.idle.touch();
                        if let Err(err) = send_with_capacity(&mut stream, data).await {
                            debug!(conn = ctx.conn_id, error = %err, "stream send failed");
                            return;
                        }
                    }
                    Err(err) => {
                        debug!(conn = ctx.conn_id, error = %err, "stream failed mid-flight");
                        stream.send_reset(h2::Reason::INTERNAL_ERROR);
                        return;
                    }
                }
            }
            let _ = stream.send_data(Bytes::new(), true);
        }
    }
}

/// Read a whole inbound stream body, releasing flow-control credit as
/// chunks arrive.
async fn read_full_body(ctx: &Arc<ConnCtx>, body: &mut RecvStream) -> GatewayResult<Bytes> {
    let mut buffered = BytesMut::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|e| map_h2_stream_error("request body", e))?;
        ctx.idle.touch();
        let len = chunk.len();
        buffered.extend_from_slice(&chunk);
        body.flow_control()
            .release_capacity(len)
            .map_err(|e| map_h2_stream_error("request window", e))?;
    }
    Ok(buffered.freeze())
}

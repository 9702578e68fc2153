//! The WebSocket front: gRPC over WebSocket, subprotocol `grpc-websockets`.
//!
//! One WebSocket connection carries one gRPC call; the upgrade request's
//! path is the method path. Each binary message is one LPM frame and is
//! forwarded verbatim onto the backend stream; a text message carrying the
//! JSON control envelope `{"eos": true}` signals half-close. The response
//! reuses the gRPC-Web frame pipeline: data frames come back as binary
//! messages and the call ends with one trailer-flagged frame.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use http::header::{HeaderMap, HeaderValue};
use http::Method;
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tonic::Code;
use tracing::{debug, warn};

use crate::concerns::{restore_call_states, CallContext};
use crate::conn::PrefixedStream;
use crate::error::{GatewayError, GatewayResult};
use crate::flow::{map_h2_stream_error, send_with_capacity};
use crate::grpc::lpm;
use crate::proxy::ConnCtx;
use crate::rest::status::grpc_code_for;
use crate::routing::RouteLookup;

/// The subprotocol this gateway speaks.
pub const SUBPROTOCOL: &str = "grpc-websockets";

/// Serve one WebSocket connection carrying one gRPC call.
pub async fn serve_websocket(
    ctx: Arc<ConnCtx>,
    stream: PrefixedStream<TcpStream>,
) -> GatewayResult<()> {
    let captured: Arc<Mutex<Option<(String, HeaderMap)>>> = Arc::new(Mutex::new(None));
    let capture = Arc::clone(&captured);

    let callback = move |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
        *capture.lock().unwrap() =
            Some((req.uri().path().to_string(), req.headers().clone()));

        let requested = req
            .headers()
            .get("sec-websocket-protocol")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if requested.split(',').any(|p| p.trim() == SUBPROTOCOL) {
            resp.headers_mut()
                .insert("sec-websocket-protocol", HeaderValue::from_static(SUBPROTOCOL));
        }
        Ok(resp)
    };

    let ws = accept_hdr_async(stream, callback)
        .await
        .map_err(|e| GatewayError::Io(std::io::Error::other(e)))?;
    ctx.idle.touch();

    let (path, headers) = captured
        .lock()
        .unwrap()
        .take()
        .ok_or_else(|| GatewayError::Internal("websocket handshake captured no request".into()))?;

    let (mut ws_tx, mut ws_rx) = ws.split();
    let correlation = ctx.correlation_id();

    // Route and concern checks; failures are reported in-band as a trailer
    // frame, gRPC-Web style.
    let setup = websocket_call_setup(&ctx, &path, headers, &correlation).await;
    let (route, call_ctx) = match setup {
        Ok(pair) => pair,
        Err(err) => {
            let _ = send_error_frame(&mut ws_tx, grpc_code_for(&err), &err.to_string()).await;
            let _ = ws_tx.close().await;
            return Ok(());
        }
    };

    let mut send = match ctx.channels.lock().await.get_or_open(&route, ctx.conn_id).await {
        Ok(send) => send,
        Err(err) => {
            warn!(conn = ctx.conn_id, correlation = %correlation, error = %err,
                  "backend channel unavailable");
            let _ = send_error_frame(&mut ws_tx, Code::Unavailable, "upstream unavailable").await;
            let _ = ws_tx.close().await;
            return Ok(());
        }
    };

    let backend_req = crate::proxy::call::build_grpc_request(&ctx, &route, &call_ctx)?;
    let (response_fut, mut backend_send) = send
        .send_request(backend_req, false)
        .map_err(|e| GatewayError::Unavailable(format!("backend stream refused: {e}")))?;

    // Inbound: websocket messages onto the backend stream.
    let inbound_ctx = Arc::clone(&ctx);
    let inbound = tokio::spawn(async move {
        while let Some(message) = ws_rx.next().await {
            inbound_ctx.idle.touch();
            match message {
                Ok(Message::Binary(frame)) => {
                    if let Err(err) =
                        send_with_capacity(&mut backend_send, Bytes::from(frame)).await
                    {
                        debug!(error = %err, "websocket inbound forward failed");
                        return;
                    }
                }
                Ok(Message::Text(text)) => {
                    if is_eos_envelope(&text) {
                        let _ = backend_send.send_data(Bytes::new(), true);
                        return;
                    }
                }
                Ok(Message::Close(_)) | Err(_) => {
                    // Dropping the send half resets the backend stream.
                    return;
                }
                Ok(_) => {}
            }
        }
    });

    // Outbound: backend response frames back as binary messages.
    let result = async {
        let response = response_fut
            .await
            .map_err(|e| map_h2_stream_error("backend response", e))?;
        let (parts, mut body) = response.into_parts();

        if let Some(status) = parts.headers.get("grpc-status") {
            // Trailers-only response.
            let code =
                crate::rest::status::parse_grpc_status(status.to_str().unwrap_or("2"));
            let message = parts
                .headers
                .get("grpc-message")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            send_error_frame(&mut ws_tx, code, &message).await?;
            return Ok::<_, GatewayError>(());
        }

        while let Some(chunk) = body.data().await {
            let chunk = chunk.map_err(|e| map_h2_stream_error("backend body", e))?;
            ctx.idle.touch();
            let len = chunk.len();
            if !chunk.is_empty() {
                ws_tx
                    .send(Message::Binary(chunk.to_vec()))
                    .await
                    .map_err(|e| GatewayError::Io(std::io::Error::other(e)))?;
            }
            body.flow_control()
                .release_capacity(len)
                .map_err(|e| map_h2_stream_error("backend window", e))?;
        }

        let trailers = body
            .trailers()
            .await
            .map_err(|e| map_h2_stream_error("backend trailers", e))?
            .unwrap_or_default();
        ws_tx
            .send(Message::Binary(lpm::encode_trailer_frame(&trailers).to_vec()))
            .await
            .map_err(|e| GatewayError::Io(std::io::Error::other(e)))?;
        Ok(())
    }
    .await;

    if let Err(err) = &result {
        debug!(conn = ctx.conn_id, correlation = %correlation, error = %err,
               "websocket call ended with error");
        let _ = send_error_frame(&mut ws_tx, grpc_code_for(err), "call failed").await;
    }

    let _ = ws_tx.close().await;
    inbound.abort();
    ctx.channels.lock().await.close_all();
    Ok(())
}

async fn websocket_call_setup(
    ctx: &Arc<ConnCtx>,
    path: &str,
    headers: HeaderMap,
    correlation: &str,
) -> GatewayResult<(Arc<crate::routing::Route>, CallContext)> {
    let host = headers
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or(h).to_string())
        .unwrap_or_default();

    let route = match ctx.state.table.lookup(&host, path, &Method::POST) {
        RouteLookup::Match { route, .. } => route,
        _ => return Err(GatewayError::NotFound(format!("no route matched '{path}'"))),
    };

    let mut call_ctx = CallContext::new(correlation, path, &route.name, headers);
    ctx.state.concerns.apply_server_call(&mut call_ctx)?;
    Ok((route, call_ctx))
}

/// The JSON control envelope `{"eos": true}` signals client half-close.
fn is_eos_envelope(text: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text)
        .map(|v| v.get("eos").and_then(|e| e.as_bool()).unwrap_or(false))
        .unwrap_or(false)
}

async fn send_error_frame<S>(
    ws_tx: &mut S,
    code: Code,
    message: &str,
) -> GatewayResult<()>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let mut trailers = HeaderMap::new();
    trailers.insert(
        "grpc-status",
        HeaderValue::from_str(&(code as i32).to_string()).unwrap_or(HeaderValue::from_static("2")),
    );
    if !message.is_empty() {
        if let Ok(value) = HeaderValue::from_str(message) {
            trailers.insert("grpc-message", value);
        }
    }
    ws_tx
        .send(Message::Binary(lpm::encode_trailer_frame(&trailers).to_vec()))
        .await
        .map_err(|e| GatewayError::Io(std::io::Error::other(e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eos_envelope_detection() {
        assert!(is_eos_envelope(r#"{"eos": true}"#));
        assert!(!is_eos_envelope(r#"{"eos": false}"#));
        assert!(!is_eos_envelope(r#"{"other": 1}"#));
        assert!(!is_eos_envelope("not json"));
    }
}

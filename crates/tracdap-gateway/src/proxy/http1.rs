//! The HTTP/1.1 front.
//!
//! One hyper http1 connection per negotiated HTTP/1.1 client. Requests are
//! served serially (keep-alive, no pipelining), which makes REST responses
//! arrive in request order by construction. Request bodies are buffered
//! before translation; responses stream when the pipeline streams.

use bytes::Bytes;
use futures::StreamExt;
use http::header::HOST;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Code;
use tracing::debug;

use crate::conn::PrefixedStream;
use crate::error::{GatewayError, GatewayResult};
use crate::grpc::web;
use crate::proxy::rest_front::{self, RestReply};
use crate::proxy::ConnCtx;
use crate::rest::status::error_body;

type ReplyBody = http_body_util::combinators::BoxBody<Bytes, GatewayError>;

/// Serve one HTTP/1.1 connection until the client closes or the idle
/// monitor fires (the caller races this future against expiry).
pub async fn serve_http1(
    ctx: Arc<ConnCtx>,
    stream: PrefixedStream<TcpStream>,
) -> GatewayResult<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let ctx = Arc::clone(&ctx);
        async move { Ok::<_, Infallible>(handle_request(ctx, req).await) }
    });

    hyper::server::conn::http1::Builder::new()
        .keep_alive(true)
        .serve_connection(io, service)
        .await
        .map_err(|e| GatewayError::Io(std::io::Error::other(e)))
}

async fn handle_request(ctx: Arc<ConnCtx>, req: Request<Incoming>) -> Response<ReplyBody> {
    ctx.idle.touch();

    let method = req.method().clone();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or(h).to_string())
        .unwrap_or_default();
    let content_type = req
        .headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let headers = req.headers().clone();

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            debug!(conn = ctx.conn_id, error = %err, "failed to read request body");
            return error_response(
                StatusCode::BAD_REQUEST,
                &error_body(Code::InvalidArgument, "could not read request body"),
            );
        }
    };
    ctx.idle.touch();

    // Native gRPC needs HTTP/2; over HTTP/1.1 only the web variants apply.
    if web::is_grpc(&content_type) {
        return error_response(
            StatusCode::HTTP_VERSION_NOT_SUPPORTED,
            &error_body(Code::Unimplemented, "native gRPC requires HTTP/2"),
        );
    }

    let reply = if web::is_grpc_web(&content_type) {
        let path = path_and_query.split('?').next().unwrap_or("/").to_string();
        rest_front::handle_grpc_web(&ctx, &host, &path, &content_type, headers, body).await
    } else {
        rest_front::handle_rest(&ctx, method, &host, &path_and_query, headers, body).await
    };

    render_reply(reply)
}

fn render_reply(reply: RestReply) -> Response<ReplyBody> {
    match reply {
        RestReply::Full { status, headers, body } => {
            let mut response = Response::builder()
                .status(status)
                .body(full_body(body))
                .expect("static response parts are valid");
            *response.headers_mut() = headers;
            response
        }
        RestReply::Stream { status, headers, body } => {
            let stream = ReceiverStream::new(body)
                .map(|item| item.map(hyper::body::Frame::data));
            let mut response = Response::builder()
                .status(status)
                .body(BodyExt::boxed(StreamBody::new(stream)))
                .expect("static response parts are valid");
            *response.headers_mut() = headers;
            response
        }
    }
}

fn error_response(status: StatusCode, body: &serde_json::Value) -> Response<ReplyBody> {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(full_body(Bytes::from(bytes)))
        .expect("static response parts are valid")
}

fn full_body(bytes: Bytes) -> ReplyBody {
    BodyExt::boxed(Full::new(bytes).map_err(|never| match never {}))
}

//! Per-connection protocol negotiation.
//!
//! Each accepted connection is classified exactly once, before any codec is
//! installed, and the selection never changes:
//!
//! 1. The first 24 bytes equal the HTTP/2 connection preface - HTTP/2
//!    prior knowledge (ALPN `h2` lands here too, since such clients open
//!    with the preface).
//! 2. An HTTP/1.1 head with `Upgrade: websocket` - WebSocket codec.
//! 3. An HTTP/1.1 head with `Upgrade: h2c` - the upgrade is declined and
//!    the request served over HTTP/1.1 (see DESIGN.md); cleartext HTTP/2
//!    clients use prior knowledge.
//! 4. Anything else that parses as an HTTP/1.1 head - HTTP/1.1.

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::debug;

use crate::conn::PrefixedStream;
use crate::error::{GatewayError, GatewayResult};

/// RFC 7540 connection preface.
pub const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Cap on bytes sniffed while looking for the end of an HTTP/1.1 head.
const MAX_SNIFF: usize = 16 * 1024;

/// The outcome of negotiation: the selected protocol plus the stream with
/// sniffed bytes ready to replay.
pub enum Negotiated {
    Http2Prior(PrefixedStream<TcpStream>),
    Http1(PrefixedStream<TcpStream>),
    WebSocket(PrefixedStream<TcpStream>),
}

impl Negotiated {
    pub fn protocol_name(&self) -> &'static str {
        match self {
            Negotiated::Http2Prior(_) => "http/2",
            Negotiated::Http1(_) => "http/1.1",
            Negotiated::WebSocket(_) => "websocket",
        }
    }
}

/// Classify one accepted connection.
pub async fn negotiate(mut stream: TcpStream, conn_id: u64) -> GatewayResult<Negotiated> {
    let mut buf = BytesMut::with_capacity(1024);

    loop {
        if let Some(selected) = classify(&buf, conn_id) {
            let prefix = buf.freeze();
            return Ok(match selected {
                Protocol::Http2Prior => Negotiated::Http2Prior(PrefixedStream::new(prefix, stream)),
                Protocol::Http1 => Negotiated::Http1(PrefixedStream::new(prefix, stream)),
                Protocol::WebSocket => Negotiated::WebSocket(PrefixedStream::new(prefix, stream)),
            });
        }

        if buf.len() >= MAX_SNIFF {
            return Err(GatewayError::Corruption(
                "request head exceeds the negotiation sniff limit".into(),
            ));
        }

        let read = stream.read_buf(&mut buf).await?;
        if read == 0 {
            return Err(GatewayError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed during protocol negotiation",
            )));
        }
    }
}

enum Protocol {
    Http2Prior,
    Http1,
    WebSocket,
}

fn classify(buf: &[u8], conn_id: u64) -> Option<Protocol> {
    // Preface check first: it is fixed-length and unambiguous.
    let preface_len = buf.len().min(HTTP2_PREFACE.len());
    if buf[..preface_len] == HTTP2_PREFACE[..preface_len] {
        if buf.len() >= HTTP2_PREFACE.len() {
            return Some(Protocol::Http2Prior);
        }
        // Still a possible preface prefix; read more.
        return None;
    }

    // Otherwise wait for a complete HTTP/1.1 head.
    let head_end = find_head_end(buf)?;
    let head = String::from_utf8_lossy(&buf[..head_end]);

    match upgrade_header(&head) {
        Some(upgrade) if upgrade.eq_ignore_ascii_case("websocket") => Some(Protocol::WebSocket),
        Some(upgrade) if upgrade.eq_ignore_ascii_case("h2c") => {
            debug!(
                conn = conn_id,
                "declining h2c upgrade, serving over HTTP/1.1 (prior knowledge is supported)"
            );
            Some(Protocol::Http1)
        }
        _ => Some(Protocol::Http1),
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn upgrade_header(head: &str) -> Option<String> {
    for line in head.lines().skip(1) {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("upgrade") {
            return Some(value.trim().to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preface_selects_http2() {
        assert!(matches!(classify(HTTP2_PREFACE, 1), Some(Protocol::Http2Prior)));
    }

    #[test]
    fn partial_preface_keeps_reading() {
        assert!(classify(&HTTP2_PREFACE[..10], 1).is_none());
    }

    #[test]
    fn websocket_upgrade_detected() {
        let head = b"GET /tracdap.api.TracOrchestratorApi/followJob HTTP/1.1\r\n\
                     Host: trac.example.com\r\n\
                     Connection: Upgrade\r\n\
                     Upgrade: websocket\r\n\
                     Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                     Sec-WebSocket-Protocol: grpc-websockets\r\n\r\n";
        assert!(matches!(classify(head, 1), Some(Protocol::WebSocket)));
    }

    #[test]
    fn h2c_upgrade_declined_to_http1() {
        let head = b"GET / HTTP/1.1\r\nHost: x\r\nUpgrade: h2c\r\nHTTP2-Settings: AAMAAABkAAQCAAAAAAIAAAAA\r\n\r\n";
        assert!(matches!(classify(head, 1), Some(Protocol::Http1)));
    }

    #[test]
    fn plain_http1_detected() {
        let head = b"GET /metadata/T1/objects/x HTTP/1.1\r\nHost: x\r\nAccept: application/json\r\n\r\n";
        assert!(matches!(classify(head, 1), Some(Protocol::Http1)));
    }

    #[test]
    fn incomplete_head_keeps_reading() {
        assert!(classify(b"GET / HTTP/1.1\r\nHost:", 1).is_none());
    }
}

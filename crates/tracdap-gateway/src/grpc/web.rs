//! gRPC-Web translation.
//!
//! A gRPC-Web request body is a sequence of LPM frames, base64-encoded when
//! the client uses the text variant. Responses mirror the request encoding
//! and finish with one trailer-flagged LPM frame carrying `grpc-status`,
//! `grpc-message` and any custom trailing metadata.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::{Bytes, BytesMut};
use http::HeaderMap;

use crate::error::{GatewayError, GatewayResult};
use crate::grpc::lpm::{self, LpmDecoder, LpmFrame};

/// Content types for the gRPC protocol family.
pub const GRPC: &str = "application/grpc";
pub const GRPC_WEB: &str = "application/grpc-web";
pub const GRPC_WEB_TEXT: &str = "application/grpc-web-text";

/// True for native gRPC content types (`application/grpc`,
/// `application/grpc+proto`), excluding the web variants.
pub fn is_grpc(content_type: &str) -> bool {
    content_type == GRPC || content_type.starts_with("application/grpc+")
}

/// True for either gRPC-Web variant.
pub fn is_grpc_web(content_type: &str) -> bool {
    content_type.starts_with(GRPC_WEB)
}

/// True for the base64 text variant.
pub fn is_grpc_web_text(content_type: &str) -> bool {
    content_type.starts_with(GRPC_WEB_TEXT)
}

/// Streaming decoder for a gRPC-Web request body. Handles the base64 text
/// variant transparently, including chunk boundaries that split base64
/// quantums.
#[derive(Debug)]
pub struct GrpcWebDecoder {
    text: bool,
    b64_pending: BytesMut,
    lpm: LpmDecoder,
}

impl GrpcWebDecoder {
    pub fn new(text: bool) -> Self {
        Self { text, b64_pending: BytesMut::new(), lpm: LpmDecoder::new() }
    }

    pub fn push(&mut self, data: &[u8]) -> GatewayResult<()> {
        if !self.text {
            self.lpm.push(data);
            return Ok(());
        }

        // Decode whole base64 quantums; carry the remainder.
        self.b64_pending.extend_from_slice(data);
        let usable = self.b64_pending.len() - self.b64_pending.len() % 4;
        if usable == 0 {
            return Ok(());
        }
        let quantum = self.b64_pending.split_to(usable);
        let decoded = BASE64
            .decode(&quantum[..])
            .map_err(|e| GatewayError::Corruption(format!("invalid base64 in grpc-web-text body: {e}")))?;
        self.lpm.push(&decoded);
        Ok(())
    }

    pub fn next_frame(&mut self) -> GatewayResult<Option<LpmFrame>> {
        self.lpm.next_frame()
    }

    /// True when no partial frame or base64 remainder is left behind.
    pub fn is_clean(&self) -> bool {
        self.b64_pending.is_empty() && self.lpm.pending() == 0
    }
}

/// Encode one outbound frame in the response's encoding. Text-variant
/// frames are base64-encoded independently, which the decoding side
/// tolerates by design.
pub fn encode_response_frame(frame: Bytes, text: bool) -> Bytes {
    if text {
        Bytes::from(BASE64.encode(&frame))
    } else {
        frame
    }
}

/// Build the final trailer frame from backend trailers. `grpc-status` and
/// `grpc-message` lead; custom trailing metadata is preserved.
pub fn trailer_frame(trailers: &HeaderMap, text: bool) -> Bytes {
    encode_response_frame(lpm::encode_trailer_frame(trailers), text)
}

/// The response content type mirroring a request content type.
pub fn response_content_type(request_content_type: &str) -> &'static str {
    if is_grpc_web_text(request_content_type) {
        "application/grpc-web-text+proto"
    } else {
        "application/grpc-web+proto"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn content_type_classification() {
        assert!(is_grpc("application/grpc"));
        assert!(is_grpc("application/grpc+proto"));
        assert!(!is_grpc("application/grpc-web"));
        assert!(is_grpc_web("application/grpc-web+proto"));
        assert!(is_grpc_web_text("application/grpc-web-text"));
        assert!(!is_grpc_web_text("application/grpc-web"));
    }

    #[test]
    fn binary_frames_pass_through() {
        let mut decoder = GrpcWebDecoder::new(false);
        decoder.push(&lpm::encode(b"payload")).unwrap();
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame.payload.as_ref(), b"payload");
        assert!(decoder.is_clean());
    }

    #[test]
    fn text_variant_decodes_across_chunk_boundaries() {
        let framed = lpm::encode(b"text variant payload");
        let encoded = BASE64.encode(&framed);
        let bytes = encoded.as_bytes();

        let mut decoder = GrpcWebDecoder::new(true);
        // Deliver in pieces that do not align with base64 quantums.
        decoder.push(&bytes[..5]).unwrap();
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.push(&bytes[5..11]).unwrap();
        decoder.push(&bytes[11..]).unwrap();

        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame.payload.as_ref(), b"text variant payload");
        assert!(decoder.is_clean());
    }

    #[test]
    fn invalid_base64_is_corruption() {
        let mut decoder = GrpcWebDecoder::new(true);
        assert!(matches!(
            decoder.push(b"!!!!"),
            Err(GatewayError::Corruption(_))
        ));
    }

    #[test]
    fn trailer_frame_carries_status_and_custom_metadata() {
        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", HeaderValue::from_static("0"));
        trailers.insert("x-trac-audit", HeaderValue::from_static("kept"));

        let frame_bytes = trailer_frame(&trailers, false);
        let mut decoder = LpmDecoder::new();
        decoder.push(&frame_bytes);
        let frame = decoder.next_frame().unwrap().unwrap();
        assert!(frame.is_trailers());

        let decoded = lpm::decode_trailers(&frame.payload).unwrap();
        assert_eq!(decoded.get("grpc-status").unwrap(), "0");
        assert_eq!(decoded.get("x-trac-audit").unwrap(), "kept");
    }

    #[test]
    fn response_content_type_mirrors_request() {
        assert_eq!(response_content_type("application/grpc-web-text"), "application/grpc-web-text+proto");
        assert_eq!(response_content_type("application/grpc-web+proto"), "application/grpc-web+proto");
    }
}

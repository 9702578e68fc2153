//! gRPC length-prefixed-message (LPM) framing.
//!
//! Frame layout: 1 flag byte, 4 bytes big-endian length, `length` bytes of
//! payload. Flag bit 0 marks a compressed payload; flag bit 7 marks a
//! trailer frame (gRPC-Web carries `grpc-status` / `grpc-message` in the
//! body this way, after the data frames).

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue};

use crate::error::{GatewayError, GatewayResult};

/// Flag bit 0: payload is compressed with the negotiated codec.
pub const FLAG_COMPRESSED: u8 = 0x01;

/// Flag bit 7: frame carries trailers rather than message data.
pub const FLAG_TRAILERS: u8 = 0x80;

/// Frame header size: flags + big-endian length.
pub const HEADER_LEN: usize = 5;

/// One decoded LPM frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LpmFrame {
    pub flags: u8,
    pub payload: Bytes,
}

impl LpmFrame {
    pub fn is_trailers(&self) -> bool {
        self.flags & FLAG_TRAILERS != 0
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }
}

/// Encode one message payload as an LPM data frame.
pub fn encode(payload: &[u8]) -> Bytes {
    encode_with_flags(payload, 0)
}

/// Encode a payload with explicit flags.
pub fn encode_with_flags(payload: &[u8], flags: u8) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(flags);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Inspect the buffer for a frame without consuming it. Returns the total
/// frame length (header + payload) once the header is readable, and whether
/// the whole frame is present.
pub fn try_peek_frame(buf: &[u8]) -> Option<(usize, bool)> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    let payload_len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    let total = HEADER_LEN + payload_len;
    Some((total, buf.len() >= total))
}

/// Streaming LPM decoder. Push bytes in as they arrive, pull complete
/// frames out. The gateway configures no compression codecs, so a frame
/// with the compression flag set is refused.
#[derive(Debug, Default)]
pub struct LpmDecoder {
    buf: BytesMut,
}

impl LpmDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered but not yet forming a complete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Pull the next complete frame, or `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> GatewayResult<Option<LpmFrame>> {
        let Some((total, complete)) = try_peek_frame(&self.buf) else {
            return Ok(None);
        };
        if !complete {
            return Ok(None);
        }

        let mut frame = self.buf.split_to(total);
        let flags = frame[0];
        let payload = frame.split_off(HEADER_LEN).freeze();

        if flags & FLAG_COMPRESSED != 0 {
            return Err(GatewayError::Unimplemented(
                "compressed gRPC frames are not supported".into(),
            ));
        }

        Ok(Some(LpmFrame { flags, payload }))
    }

    /// Drain every complete frame currently buffered.
    pub fn drain(&mut self) -> GatewayResult<Vec<LpmFrame>> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Trailer block encoding (gRPC-Web)
// ─────────────────────────────────────────────────────────────────────────────

/// Encode trailers as CRLF-separated `name: value` lines, no terminating
/// CRLF, wrapped in an LPM frame with the trailer flag set.
pub fn encode_trailer_frame(trailers: &HeaderMap) -> Bytes {
    let block = encode_trailers(trailers);
    encode_with_flags(&block, FLAG_TRAILERS)
}

/// Encode the raw trailer block without framing.
pub fn encode_trailers(trailers: &HeaderMap) -> Vec<u8> {
    let mut lines = Vec::new();
    for (name, value) in trailers {
        let mut line = Vec::with_capacity(name.as_str().len() + value.len() + 2);
        line.extend_from_slice(name.as_str().as_bytes());
        line.extend_from_slice(b": ");
        line.extend_from_slice(value.as_bytes());
        lines.push(line);
    }
    lines.join(&b"\r\n"[..])
}

/// Decode a trailer block. Blank lines are ignored; malformed lines are a
/// corruption error.
pub fn decode_trailers(block: &[u8]) -> GatewayResult<HeaderMap> {
    let text = std::str::from_utf8(block)
        .map_err(|_| GatewayError::Corruption("trailer block is not UTF-8".into()))?;

    let mut trailers = HeaderMap::new();
    for line in text.split("\r\n").flat_map(|l| l.split('\n')) {
        if line.trim().is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| GatewayError::Corruption(format!("malformed trailer line: {line}")))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| GatewayError::Corruption(format!("bad trailer name: {name}")))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| GatewayError::Corruption("bad trailer value".into()))?;
        trailers.append(name, value);
    }
    Ok(trailers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_identity() {
        let payload = b"metadata request body".to_vec();
        let framed = encode(&payload);

        let mut decoder = LpmDecoder::new();
        decoder.push(&framed);
        let frame = decoder.next_frame().unwrap().unwrap();

        assert_eq!(frame.flags, 0);
        assert_eq!(frame.payload.as_ref(), payload.as_slice());
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn decode_across_split_delivery() {
        let framed = encode(b"split me");
        let mut decoder = LpmDecoder::new();

        decoder.push(&framed[..3]);
        assert!(decoder.next_frame().unwrap().is_none());

        decoder.push(&framed[3..7]);
        assert!(decoder.next_frame().unwrap().is_none());

        decoder.push(&framed[7..]);
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame.payload.as_ref(), b"split me");
    }

    #[test]
    fn peek_reports_length_and_completeness() {
        let framed = encode(b"xyz");
        assert_eq!(try_peek_frame(&framed[..4]), None);
        assert_eq!(try_peek_frame(&framed[..5]), Some((8, false)));
        assert_eq!(try_peek_frame(&framed), Some((8, true)));
    }

    #[test]
    fn compressed_frame_refused() {
        let framed = encode_with_flags(b"deflated", FLAG_COMPRESSED);
        let mut decoder = LpmDecoder::new();
        decoder.push(&framed);
        assert!(matches!(
            decoder.next_frame(),
            Err(GatewayError::Unimplemented(_))
        ));
    }

    #[test]
    fn trailer_frame_round_trip() {
        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", HeaderValue::from_static("0"));
        trailers.insert("grpc-message", HeaderValue::from_static("ok"));
        trailers.insert("x-trac-audit", HeaderValue::from_static("kept"));

        let framed = encode_trailer_frame(&trailers);
        let mut decoder = LpmDecoder::new();
        decoder.push(&framed);
        let frame = decoder.next_frame().unwrap().unwrap();
        assert!(frame.is_trailers());

        let decoded = decode_trailers(&frame.payload).unwrap();
        assert_eq!(decoded.get("grpc-status").unwrap(), "0");
        assert_eq!(decoded.get("grpc-message").unwrap(), "ok");
        assert_eq!(decoded.get("x-trac-audit").unwrap(), "kept");
    }

    #[test]
    fn trailer_block_has_no_terminating_crlf() {
        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", HeaderValue::from_static("0"));
        let block = encode_trailers(&trailers);
        assert_eq!(block, b"grpc-status: 0".to_vec());
    }

    #[test]
    fn blank_trailer_lines_ignored() {
        let decoded = decode_trailers(b"grpc-status: 0\r\n\r\ngrpc-message: done").unwrap();
        assert_eq!(decoded.len(), 2);
    }

    #[test]
    fn multiple_frames_drain_in_order() {
        let mut decoder = LpmDecoder::new();
        decoder.push(&encode(b"first"));
        decoder.push(&encode(b"second"));

        let frames = decoder.drain().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].payload.as_ref(), b"first");
        assert_eq!(frames[1].payload.as_ref(), b"second");
    }
}

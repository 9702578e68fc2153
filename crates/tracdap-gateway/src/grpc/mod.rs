//! gRPC wire-level building blocks: LPM framing and the gRPC-Web variant.

pub mod lpm;
pub mod web;

pub use lpm::{LpmDecoder, LpmFrame, FLAG_COMPRESSED, FLAG_TRAILERS};

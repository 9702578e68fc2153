//! REST to gRPC mapping.
//!
//! Bindings are compiled once at startup ([`binding`]) from method
//! descriptors and HTTP rules ([`rule`], [`template`]); per-request
//! translation ([`translate`]) and the fixed status table ([`status`]) do
//! the rest.

pub mod binding;
pub mod rule;
pub mod status;
pub mod template;
pub mod translate;

pub use binding::{BodySelector, PathCaptures, ResponseSelector, RestBinding};
pub use rule::{HttpRule, discover_service_rules, load_descriptor_pool};
pub use translate::{RestResponse, build_request, project_response};

#[cfg(test)]
pub(crate) mod testing;

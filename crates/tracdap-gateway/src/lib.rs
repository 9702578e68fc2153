//! TRAC D.A.P. gateway - the platform's front door.
//!
//! A single network endpoint that terminates client connections and
//! presents a uniform HTTP/2 gRPC view to the backend services. The
//! gateway accepts:
//!
//! | Client protocol | Translation |
//! |-----------------|-------------|
//! | HTTP/1.1 REST + JSON | compiled method bindings, REST <-> gRPC |
//! | gRPC-Web (binary and base64 text) | LPM frame pipeline, trailer-in-body |
//! | gRPC over WebSocket (`grpc-websockets`) | one call per connection, LPM frames as binary messages |
//! | native gRPC over HTTP/2 | bidirectional proxy with flow-control bridging |
//! | plain HTTP/1.1 | multiplexed onto backend HTTP/2 streams |
//!
//! Module map: [`conn`] negotiates the protocol per connection, [`routing`]
//! selects the route, [`rest`] compiles and executes REST bindings,
//! [`grpc`] does the wire framing, [`flow`] keeps the HTTP/2 windows in
//! step, [`proxy`] owns backend channels and the per-stream pipelines, and
//! [`concerns`] applies the ordered middleware stages to every gRPC call.

pub mod concerns;
pub mod conn;
pub mod error;
pub mod flow;
pub mod grpc;
pub mod proxy;
pub mod rest;
pub mod routing;
pub mod server;
pub mod state;

pub use error::{GatewayError, GatewayResult};
pub use server::GatewayServer;
pub use state::GatewayState;

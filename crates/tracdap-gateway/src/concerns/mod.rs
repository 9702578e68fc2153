//! gRPC concerns: ordered middleware stages applied uniformly to every
//! client and server gRPC call.
//!
//! A concern exposes four operations: configure the server side, configure
//! a client endpoint before connection, configure an opened client channel,
//! and prepare a per-call state object that can restore call metadata on a
//! retry. Stages are composed through [`GrpcConcernBuilder`] and are
//! immutable once built.
//!
//! Ordering: server-side stages are applied in reverse declaration order so
//! the first declared stage is the outermost interceptor and fires first on
//! inbound; client-side stages apply in declaration order.

mod stages;

pub use stages::{
    AuthValidationConcern, ErrorMappingConcern, LoggingConcern, MetadataPropagationConcern,
};

use http::HeaderMap;
use std::sync::Arc;
use tonic::transport::Endpoint;

use crate::error::{GatewayError, GatewayResult};

// ─────────────────────────────────────────────────────────────────────────────
// Call context
// ─────────────────────────────────────────────────────────────────────────────

/// Per-call context flowing through the server-side stages.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Correlation id attached at accept time.
    pub correlation_id: String,
    /// The gRPC method path, `/package.Service/Method`.
    pub method_path: String,
    /// Name of the matched route.
    pub route: String,
    /// Inbound call metadata.
    pub headers: HeaderMap,
    /// Principal resolved by the auth stage; `None` until it runs.
    pub principal: Option<String>,
}

impl CallContext {
    pub fn new(
        correlation_id: impl Into<String>,
        method_path: impl Into<String>,
        route: impl Into<String>,
        headers: HeaderMap,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            method_path: method_path.into(),
            route: route.into(),
            headers,
            principal: None,
        }
    }
}

/// Default headers applied to every call on an opened client channel.
#[derive(Debug, Default, Clone)]
pub struct ChannelSetup {
    pub default_headers: HeaderMap,
}

/// Per-call state returned by `prepare_client_call`. `restore` re-applies
/// the stage's call metadata, including on the transparent retry after a
/// channel failure.
pub trait ClientCallState: Send + Sync {
    fn restore(&self, headers: &mut HeaderMap);
}

// ─────────────────────────────────────────────────────────────────────────────
// Concern trait
// ─────────────────────────────────────────────────────────────────────────────

/// One named middleware stage.
pub trait GrpcConcern: Send + Sync {
    fn name(&self) -> &str;

    /// Server-side inspection of an inbound call. Runs before the call is
    /// proxied; an error here terminates the call at the boundary.
    fn apply_server_call(&self, ctx: &mut CallContext) -> GatewayResult<()> {
        let _ = ctx;
        Ok(())
    }

    /// Configure a client endpoint before it connects.
    fn configure_client_builder(&self, endpoint: Endpoint) -> GatewayResult<Endpoint> {
        Ok(endpoint)
    }

    /// Configure an opened client channel (default call metadata).
    fn configure_client_channel(&self, channel: &mut ChannelSetup) -> GatewayResult<()> {
        let _ = channel;
        Ok(())
    }

    /// Prepare per-call state for an outbound call.
    fn prepare_client_call(&self, ctx: &CallContext) -> Box<dyn ClientCallState>;

    /// Map an internal error to a client-safe status override. Most stages
    /// leave this to the fixed status table and return `None`.
    fn map_error(&self, err: &GatewayError) -> Option<(tonic::Code, String)> {
        let _ = err;
        None
    }
}

/// A call state that restores nothing.
pub(crate) struct NoCallState;

impl ClientCallState for NoCallState {
    fn restore(&self, _headers: &mut HeaderMap) {}
}

// ─────────────────────────────────────────────────────────────────────────────
// Stack and builder
// ─────────────────────────────────────────────────────────────────────────────

/// The immutable, ordered stack of concerns.
#[derive(Clone)]
pub struct GrpcConcernStack {
    stages: Arc<[Arc<dyn GrpcConcern>]>,
}

impl GrpcConcernStack {
    /// Run server-side stages against an inbound call.
    ///
    /// Stages are folded in reverse declaration order when the interceptor
    /// chain is conceptually wrapped, which makes the first declared stage
    /// the outermost one; on this flattened path that means the first
    /// declared stage fires first.
    pub fn apply_server_call(&self, ctx: &mut CallContext) -> GatewayResult<()> {
        for stage in self.stages.iter() {
            stage.apply_server_call(ctx)?;
        }
        Ok(())
    }

    /// Fold client-endpoint configuration in declaration order.
    pub fn configure_client_builder(&self, mut endpoint: Endpoint) -> GatewayResult<Endpoint> {
        for stage in self.stages.iter() {
            endpoint = stage.configure_client_builder(endpoint)?;
        }
        Ok(endpoint)
    }

    /// Fold channel configuration in declaration order.
    pub fn configure_client_channel(&self) -> GatewayResult<ChannelSetup> {
        let mut setup = ChannelSetup::default();
        for stage in self.stages.iter() {
            stage.configure_client_channel(&mut setup)?;
        }
        Ok(setup)
    }

    /// Collect per-call states from every stage, in declaration order. The
    /// returned list re-applies metadata for the initial attempt and for
    /// the transparent retry.
    pub fn prepare_client_call(&self, ctx: &CallContext) -> Vec<Box<dyn ClientCallState>> {
        self.stages.iter().map(|s| s.prepare_client_call(ctx)).collect()
    }

    /// Ask the stages for an error-mapping override; first answer wins.
    pub fn map_error(&self, err: &GatewayError) -> Option<(tonic::Code, String)> {
        self.stages.iter().find_map(|s| s.map_error(err))
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }
}

/// Restore every per-call state onto a header map, in order.
pub fn restore_call_states(states: &[Box<dyn ClientCallState>], headers: &mut HeaderMap) {
    for state in states {
        state.restore(headers);
    }
}

/// Builder for [`GrpcConcernStack`]. Stages may only be composed before
/// `build()`; the stack is immutable afterwards.
#[derive(Default)]
pub struct GrpcConcernBuilder {
    stages: Vec<Arc<dyn GrpcConcern>>,
}

impl GrpcConcernBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_stage(mut self, stage: Arc<dyn GrpcConcern>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn build(self) -> GrpcConcernStack {
        GrpcConcernStack { stages: self.stages.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use std::sync::Mutex;

    struct RecordingConcern {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    struct RecordingState {
        label: &'static str,
    }

    impl ClientCallState for RecordingState {
        fn restore(&self, headers: &mut HeaderMap) {
            headers.append("x-stage", HeaderValue::from_static(self.label));
        }
    }

    impl GrpcConcern for RecordingConcern {
        fn name(&self) -> &str {
            self.label
        }

        fn apply_server_call(&self, _ctx: &mut CallContext) -> GatewayResult<()> {
            self.log.lock().unwrap().push(format!("server:{}", self.label));
            Ok(())
        }

        fn prepare_client_call(&self, _ctx: &CallContext) -> Box<dyn ClientCallState> {
            Box::new(RecordingState { label: self.label })
        }
    }

    fn ctx() -> CallContext {
        CallContext::new("corr-1", "/svc/Method", "route", HeaderMap::new())
    }

    #[test]
    fn first_declared_stage_fires_first_on_inbound() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stack = GrpcConcernBuilder::new()
            .add_stage(Arc::new(RecordingConcern { label: "auth", log: Arc::clone(&log) }))
            .add_stage(Arc::new(RecordingConcern { label: "logging", log: Arc::clone(&log) }))
            .build();

        stack.apply_server_call(&mut ctx()).unwrap();
        assert_eq!(*log.lock().unwrap(), ["server:auth", "server:logging"]);
    }

    #[test]
    fn client_call_states_restore_in_declaration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stack = GrpcConcernBuilder::new()
            .add_stage(Arc::new(RecordingConcern { label: "one", log: Arc::clone(&log) }))
            .add_stage(Arc::new(RecordingConcern { label: "two", log: Arc::clone(&log) }))
            .build();

        let states = stack.prepare_client_call(&ctx());
        let mut headers = HeaderMap::new();
        restore_call_states(&states, &mut headers);

        let stamped: Vec<_> = headers.get_all("x-stage").iter().collect();
        assert_eq!(stamped, ["one", "two"]);

        // A retry restores identical metadata from the same states.
        let mut retry_headers = HeaderMap::new();
        restore_call_states(&states, &mut retry_headers);
        assert_eq!(retry_headers.get_all("x-stage").iter().count(), 2);
    }

    #[test]
    fn stack_reports_stage_names_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stack = GrpcConcernBuilder::new()
            .add_stage(Arc::new(RecordingConcern { label: "a", log: Arc::clone(&log) }))
            .add_stage(Arc::new(RecordingConcern { label: "b", log }))
            .build();
        assert_eq!(stack.stage_names(), ["a", "b"]);
    }
}

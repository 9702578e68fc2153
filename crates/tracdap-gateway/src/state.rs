//! Immutable cross-connection gateway state.
//!
//! Built once at startup and shared read-only by every connection task:
//! validated configuration, the routing table with compiled REST bindings,
//! and the concern stack.

use std::sync::Arc;
use tracing::info;

use tracdap_kernel::auth::TokenValidator;
use tracdap_kernel::config::GatewayConfig;

use crate::concerns::{
    AuthValidationConcern, ErrorMappingConcern, GrpcConcernBuilder, GrpcConcernStack,
    LoggingConcern, MetadataPropagationConcern,
};
use crate::error::GatewayResult;
use crate::rest::{discover_service_rules, load_descriptor_pool, RestBinding};
use crate::routing::RouteTable;

/// Everything a connection task needs that outlives any one connection.
pub struct GatewayState {
    pub config: GatewayConfig,
    pub table: RouteTable,
    pub concerns: GrpcConcernStack,
}

impl GatewayState {
    /// Build the full startup state. Any error here is fatal.
    pub fn build(
        config: GatewayConfig,
        validator: Option<Arc<dyn TokenValidator>>,
    ) -> GatewayResult<Arc<Self>> {
        config.validate()?;
        let mut table = RouteTable::build(&config)?;

        // Compile the REST surface: every configured service contributes
        // its discovered (method, rule) pairs to its route.
        for svc in &config.services {
            let pool = load_descriptor_pool(&svc.descriptor_set)?;
            let rules = discover_service_rules(&pool, svc)?;

            let mut bindings = Vec::new();
            for (method, rule) in &rules {
                for binding in RestBinding::compile(method, rule)? {
                    bindings.push(Arc::new(binding));
                }
            }
            info!(
                service = %svc.service,
                route = %svc.route,
                bindings = bindings.len(),
                "compiled REST bindings"
            );
            table.attach_bindings(&svc.route, bindings)?;
        }

        // Concern order is the declaration order: auth must fire before
        // anything that trusts the principal.
        let mut builder = GrpcConcernBuilder::new().add_stage(Arc::new(LoggingConcern));
        if let Some(validator) = validator {
            builder = builder.add_stage(Arc::new(AuthValidationConcern::new(validator)));
        }
        let concerns = builder
            .add_stage(Arc::new(MetadataPropagationConcern::default()))
            .add_stage(Arc::new(ErrorMappingConcern))
            .build();

        Ok(Arc::new(Self { config, table, concerns }))
    }
}

//! The routing table.
//!
//! A static, ordered list of routes built once at startup. Lookup matches
//! the host exactly, the path by longest prefix on segment boundaries, and
//! the method against the route's set; declaration order breaks ties
//! between equal-length prefixes. Exactly one route is selected for any
//! accepted request, or exactly one 404 / 405 is produced.

use http::Method;
use regex::Regex;
use std::sync::Arc;

use tracdap_kernel::config::{GatewayConfig, GrpcProtocol, RouteConfig, TargetConfig};

use crate::error::{GatewayError, GatewayResult};
use crate::rest::RestBinding;

/// One immutable route, shared across connections.
#[derive(Debug, Clone)]
pub struct Route {
    /// Position in the declared route list; also the backend channel key.
    pub index: usize,
    pub name: String,
    pub host: Option<String>,
    pub path_prefix: String,
    /// Accepted methods. Empty means all methods.
    pub methods: Vec<Method>,
    pub target: TargetConfig,
    pub grpc_protocol: Option<GrpcProtocol>,
    /// Bulk-data route: backend channels use enlarged HTTP/2 settings.
    pub data_route: bool,
    /// REST bindings served on this route, in declared order.
    pub rest_bindings: Vec<Arc<RestBinding>>,
}

impl Route {
    fn from_config(index: usize, cfg: &RouteConfig, data_route: bool) -> GatewayResult<Self> {
        let methods = cfg
            .methods
            .iter()
            .map(|m| Method::from_bytes(m.as_bytes()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| GatewayError::Startup(format!("route '{}': {e}", cfg.name)))?;

        Ok(Route {
            index,
            name: cfg.name.clone(),
            host: cfg.host.clone(),
            path_prefix: cfg.path_prefix.clone(),
            methods,
            target: cfg.target.clone(),
            grpc_protocol: cfg.grpc_protocol,
            data_route,
            rest_bindings: Vec::new(),
        })
    }

    fn matches_host(&self, host: &str) -> bool {
        match &self.host {
            Some(expected) => expected == host,
            None => true,
        }
    }

    /// Prefix match on segment boundaries: `/api/data` matches
    /// `/api/data` and `/api/data/files`, never `/api/database`.
    fn matches_path(&self, path: &str) -> bool {
        let Some(rest) = path.strip_prefix(self.path_prefix.as_str()) else {
            return false;
        };
        self.path_prefix.ends_with('/') || rest.is_empty() || rest.starts_with('/')
    }

    fn matches_method(&self, method: &Method) -> bool {
        self.methods.is_empty() || self.methods.contains(method)
    }
}

/// Result of a route lookup.
#[derive(Debug, Clone)]
pub enum RouteLookup {
    /// Exactly one route selected, with the REST binding that matched (if
    /// the request matched through a binding rather than the raw prefix).
    Match {
        route: Arc<Route>,
        rest_binding: Option<Arc<RestBinding>>,
    },
    /// A route matched host + path but not the method. Carries the allowed
    /// set for the `Allow` header.
    MethodNotAllowed { allow: Vec<Method> },
    NotFound,
}

/// A redirect rule checked before route matching.
#[derive(Debug, Clone)]
struct CompiledRedirect {
    source: Regex,
    target: String,
    status: http::StatusCode,
}

/// The static routing table plus redirect / rewrite rules.
pub struct RouteTable {
    routes: Vec<Arc<Route>>,
    redirects: Vec<CompiledRedirect>,
    rewrites: Vec<(Regex, String)>,
}

impl RouteTable {
    /// Build the table from validated configuration. REST bindings are
    /// attached afterwards via [`attach_bindings`](Self::attach_bindings).
    pub fn build(cfg: &GatewayConfig) -> GatewayResult<Self> {
        let mut routes = Vec::with_capacity(cfg.routes.len());
        for (index, route_cfg) in cfg.routes.iter().enumerate() {
            let data_route = cfg.is_data_route(route_cfg);
            routes.push(Arc::new(Route::from_config(index, route_cfg, data_route)?));
        }

        let mut redirects = Vec::new();
        for rule in &cfg.redirects {
            redirects.push(CompiledRedirect {
                source: Regex::new(&rule.source)
                    .map_err(|e| GatewayError::Startup(format!("redirect regex: {e}")))?,
                target: rule.target.clone(),
                status: http::StatusCode::from_u16(rule.status)
                    .map_err(|e| GatewayError::Startup(format!("redirect status: {e}")))?,
            });
        }

        let mut rewrites = Vec::new();
        for rule in &cfg.rewrites {
            rewrites.push((
                Regex::new(&rule.source)
                    .map_err(|e| GatewayError::Startup(format!("rewrite regex: {e}")))?,
                rule.target.clone(),
            ));
        }

        Ok(Self { routes, redirects, rewrites })
    }

    /// Attach compiled REST bindings to the named route.
    pub fn attach_bindings(
        &mut self,
        route_name: &str,
        bindings: Vec<Arc<RestBinding>>,
    ) -> GatewayResult<()> {
        let route = self
            .routes
            .iter_mut()
            .find(|r| r.name == route_name)
            .ok_or_else(|| GatewayError::Startup(format!("unknown route '{route_name}'")))?;
        Arc::get_mut(route)
            .expect("bindings are attached before the table is shared")
            .rest_bindings
            .extend(bindings);
        Ok(())
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    /// Check redirect rules. First match wins.
    pub fn check_redirect(&self, path: &str) -> Option<(http::StatusCode, String)> {
        for rule in &self.redirects {
            if rule.source.is_match(path) {
                let target = rule.source.replace(path, rule.target.as_str()).to_string();
                return Some((rule.status, target));
            }
        }
        None
    }

    /// Apply rewrite rules to a REST path before matching. Rules apply in
    /// declared order, each to the output of the previous.
    pub fn apply_rewrites(&self, path: &str) -> String {
        let mut current = path.to_string();
        for (source, target) in &self.rewrites {
            current = source.replace(&current, target.as_str()).to_string();
        }
        current
    }

    /// Select the route for a request.
    ///
    /// REST bindings are tried first, in declared route order: a binding
    /// match is an exact full-path + method match and carries its own
    /// method semantics. Prefix routes are then matched by the longest
    /// path base among host + path + method matches; declaration order
    /// only breaks ties between equal-length prefixes. A path that
    /// matches a route but not its method set produces `MethodNotAllowed`
    /// with that route's methods.
    pub fn lookup(&self, host: &str, path: &str, method: &Method) -> RouteLookup {
        for route in &self.routes {
            if !route.matches_host(host) {
                continue;
            }
            for binding in &route.rest_bindings {
                if binding.match_path(path, method).is_some() {
                    return RouteLookup::Match {
                        route: Arc::clone(route),
                        rest_binding: Some(Arc::clone(binding)),
                    };
                }
            }
        }

        // Longest prefix wins; strictly-greater comparison keeps the
        // earliest declared route on equal-length prefixes.
        let mut selected: Option<&Arc<Route>> = None;
        let mut path_only: Option<&Arc<Route>> = None;
        for route in &self.routes {
            if !route.matches_host(host) || !route.matches_path(path) {
                continue;
            }
            if longer_prefix(route, path_only) {
                path_only = Some(route);
            }
            if route.matches_method(method) && longer_prefix(route, selected) {
                selected = Some(route);
            }
        }

        if let Some(route) = selected {
            return RouteLookup::Match { route: Arc::clone(route), rest_binding: None };
        }

        // A binding may exist for the path under a different method.
        if path_only.is_none() {
            for route in &self.routes {
                let allowed: Vec<Method> = route
                    .rest_bindings
                    .iter()
                    .filter(|b| {
                        let m = b.http_method.clone();
                        b.match_path(path, &m).is_some()
                    })
                    .map(|b| b.http_method.clone())
                    .collect();
                if !allowed.is_empty() {
                    return RouteLookup::MethodNotAllowed { allow: allowed };
                }
            }
        }

        match path_only {
            Some(route) => RouteLookup::MethodNotAllowed { allow: route.methods.clone() },
            None => RouteLookup::NotFound,
        }
    }
}

fn longer_prefix(candidate: &Arc<Route>, current: Option<&Arc<Route>>) -> bool {
    match current {
        Some(current) => candidate.path_prefix.len() > current.path_prefix.len(),
        None => true,
    }
}

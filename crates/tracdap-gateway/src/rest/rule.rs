//! HTTP rules: where REST bindings come from.
//!
//! A rule pairs a gRPC method with an HTTP verb, a path template and body /
//! response-body selectors. Rules are discovered at startup from
//! `google.api.http` method-option annotations when the descriptor pool
//! carries them, or declared in service configuration for descriptors that
//! do not; both sources produce the same record.

use http::Method;
use prost_reflect::{DescriptorPool, DynamicMessage, MethodDescriptor};
use std::path::Path;

use tracdap_kernel::config::{HttpRuleConfig, ServiceApiConfig};

use crate::error::{GatewayError, GatewayResult};

/// Fully-qualified name of the HTTP rule annotation extension.
const HTTP_RULE_EXTENSION: &str = "google.api.http";

/// One HTTP rule attached to a gRPC method.
#[derive(Debug, Clone)]
pub struct HttpRule {
    pub http_method: Method,
    /// Raw path template; compiled in [`crate::rest::binding`].
    pub template: String,
    /// Body selector: empty, `*`, or a field path.
    pub body: String,
    /// Response-body selector: empty, `*`, or a field path.
    pub response_body: String,
    /// Explicit download marking from configuration. Bindings may also be
    /// inferred as downloads from their response shape.
    pub download: bool,
    /// Additional bindings, flattened after the primary at compile time.
    pub additional: Vec<HttpRule>,
}

impl HttpRule {
    pub fn from_config(cfg: &HttpRuleConfig) -> GatewayResult<Self> {
        let http_method = Method::from_bytes(cfg.http_method.as_bytes()).map_err(|_| {
            GatewayError::Startup(format!(
                "http rule for '{}': invalid method '{}'",
                cfg.method, cfg.http_method
            ))
        })?;
        Ok(Self {
            http_method,
            template: cfg.path.clone(),
            body: cfg.body.clone(),
            response_body: cfg.response_body.clone(),
            download: cfg.download,
            additional: Vec::new(),
        })
    }
}

/// Read a binary `FileDescriptorSet` from disk into a descriptor pool.
pub fn load_descriptor_pool(path: &Path) -> GatewayResult<DescriptorPool> {
    let bytes = std::fs::read(path).map_err(|e| {
        GatewayError::Startup(format!("cannot read descriptor set '{}': {e}", path.display()))
    })?;
    DescriptorPool::decode(bytes.as_slice()).map_err(|e| {
        GatewayError::Startup(format!("cannot decode descriptor set '{}': {e}", path.display()))
    })
}

/// Collect every (method, rule) pair for one configured service.
///
/// Annotations win; config rules fill in for methods without one. Methods
/// with neither are simply not exposed over REST.
pub fn discover_service_rules(
    pool: &DescriptorPool,
    cfg: &ServiceApiConfig,
) -> GatewayResult<Vec<(MethodDescriptor, HttpRule)>> {
    let service = pool.get_service_by_name(&cfg.service).ok_or_else(|| {
        GatewayError::Startup(format!(
            "service '{}' not found in descriptor set '{}'",
            cfg.service,
            cfg.descriptor_set.display()
        ))
    })?;

    let mut rules = Vec::new();
    for method in service.methods() {
        if let Some(rule) = annotation_rule(pool, &method)? {
            rules.push((method, rule));
            continue;
        }
        if let Some(rule_cfg) = cfg.http_rules.iter().find(|r| r.method == method.name()) {
            rules.push((method.clone(), HttpRule::from_config(rule_cfg)?));
        }
    }

    if rules.is_empty() {
        tracing::warn!(service = %cfg.service, "service has no REST bindings");
    }
    Ok(rules)
}

// ─────────────────────────────────────────────────────────────────────────────
// Annotation parsing
// ─────────────────────────────────────────────────────────────────────────────

fn annotation_rule(
    pool: &DescriptorPool,
    method: &MethodDescriptor,
) -> GatewayResult<Option<HttpRule>> {
    let Some(ext) = pool.get_extension_by_name(HTTP_RULE_EXTENSION) else {
        return Ok(None);
    };
    let options = method.options();
    if !options.has_extension(&ext) {
        return Ok(None);
    }
    let value = options.get_extension(&ext);
    let Some(rule_msg) = value.as_message() else {
        return Ok(None);
    };
    rule_from_dynamic(method, rule_msg).map(Some)
}

fn rule_from_dynamic(method: &MethodDescriptor, msg: &DynamicMessage) -> GatewayResult<HttpRule> {
    let pattern = [
        ("get", Method::GET),
        ("put", Method::PUT),
        ("post", Method::POST),
        ("delete", Method::DELETE),
        ("patch", Method::PATCH),
    ]
    .into_iter()
    .find_map(|(field, verb)| {
        let template = string_field(msg, field);
        (!template.is_empty()).then(|| (verb, template))
    });

    let (http_method, template) = match pattern {
        Some(found) => found,
        None => {
            // The `custom` pattern carries its own verb.
            let custom = msg
                .get_field_by_name("custom")
                .and_then(|v| v.as_message().cloned());
            match custom {
                Some(custom_msg) => {
                    let kind = string_field(&custom_msg, "kind");
                    let path = string_field(&custom_msg, "path");
                    let verb = Method::from_bytes(kind.as_bytes()).map_err(|_| {
                        GatewayError::Startup(format!(
                            "method '{}': invalid custom verb '{kind}'",
                            method.full_name()
                        ))
                    })?;
                    (verb, path)
                }
                None => {
                    return Err(GatewayError::Startup(format!(
                        "method '{}': http rule has no pattern",
                        method.full_name()
                    )));
                }
            }
        }
    };

    let mut additional = Vec::new();
    if let Some(value) = msg.get_field_by_name("additional_bindings") {
        if let Some(list) = value.as_list() {
            for item in list {
                if let Some(nested) = item.as_message() {
                    additional.push(rule_from_dynamic(method, nested)?);
                }
            }
        }
    }

    Ok(HttpRule {
        http_method,
        template,
        body: string_field(msg, "body"),
        response_body: string_field(msg, "response_body"),
        download: false,
        additional,
    })
}

fn string_field(msg: &DynamicMessage, name: &str) -> String {
    msg.get_field_by_name(name)
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_rule_parses_method() {
        let cfg = HttpRuleConfig {
            method: "ReadObject".into(),
            http_method: "GET".into(),
            path: "/metadata/{tenant}/objects/{objectId}".into(),
            body: String::new(),
            response_body: String::new(),
            download: false,
        };
        let rule = HttpRule::from_config(&cfg).unwrap();
        assert_eq!(rule.http_method, Method::GET);
        assert_eq!(rule.template, "/metadata/{tenant}/objects/{objectId}");
    }

    #[test]
    fn config_rule_rejects_bad_verb() {
        let cfg = HttpRuleConfig {
            method: "ReadObject".into(),
            http_method: "FETCH ".into(),
            path: "/x".into(),
            body: String::new(),
            response_body: String::new(),
            download: false,
        };
        assert!(matches!(
            HttpRule::from_config(&cfg),
            Err(GatewayError::Startup(_))
        ));
    }
}

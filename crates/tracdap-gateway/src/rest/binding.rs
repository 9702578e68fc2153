//! Compiled REST method bindings.
//!
//! Compilation happens once at startup, from a gRPC method descriptor plus
//! an [`HttpRule`]: field paths are resolved to descriptor handles, segment
//! matchers are derived from the captured field types, and body / query
//! eligibility is settled. Request-path evaluation is then allocation-light.

use http::Method;
use prost_reflect::{FieldDescriptor, Kind, MessageDescriptor, MethodDescriptor};
use regex::Regex;
use std::collections::HashMap;

use crate::error::{GatewayError, GatewayResult};
use crate::rest::rule::HttpRule;
use crate::rest::template::{self, TemplateSegment};

// ─────────────────────────────────────────────────────────────────────────────
// Variable typing
// ─────────────────────────────────────────────────────────────────────────────

/// Type of a captured path variable, fixed at compile time.
#[derive(Debug, Clone)]
pub enum VarKind {
    Str,
    Int32,
    Int64,
    UInt32,
    UInt64,
    Enum(prost_reflect::EnumDescriptor),
}

/// A captured variable: the resolved field path into the request message
/// plus its matcher.
#[derive(Debug, Clone)]
pub struct CompiledVar {
    /// Nested field chain; every element but the last is a singular
    /// message field.
    pub fields: Vec<FieldDescriptor>,
    pub kind: VarKind,
    /// Explicit `=pattern` matcher, anchored. Absent means the kind's
    /// default matcher applies.
    pattern: Option<Regex>,
}

impl CompiledVar {
    /// Check a raw path segment against this variable's matcher. Range
    /// checks for numeric kinds happen at translate time.
    pub fn matches(&self, segment: &str) -> bool {
        if let Some(re) = &self.pattern {
            return re.is_match(segment);
        }
        match &self.kind {
            VarKind::Str => !segment.is_empty(),
            VarKind::Int32 | VarKind::Int64 => {
                let digits = segment.strip_prefix('-').unwrap_or(segment);
                !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
            }
            VarKind::UInt32 | VarKind::UInt64 => {
                !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
            }
            VarKind::Enum(desc) => desc.values().any(|v| v.name() == segment),
        }
    }

    /// Dotted display form of the field path.
    pub fn path_display(&self) -> String {
        self.fields.iter().map(|f| f.name()).collect::<Vec<_>>().join(".")
    }
}

/// One compiled segment matcher.
#[derive(Debug, Clone)]
pub enum CompiledSegment {
    Literal(String),
    Wildcard,
    /// Index into [`RestBinding::vars`].
    Var(usize),
}

/// Body selector, resolved at compile time.
#[derive(Debug, Clone)]
pub enum BodySelector {
    /// No body accepted.
    None,
    /// Body is the whole request message as JSON.
    Wildcard,
    /// Body JSON goes into this sub-field (a singular message field).
    Field(Vec<FieldDescriptor>),
}

/// Response-body selector, resolved at compile time.
#[derive(Debug, Clone)]
pub enum ResponseSelector {
    /// Emit the whole response message as JSON.
    Whole,
    /// Emit only this sub-field.
    Field(Vec<FieldDescriptor>),
}

impl ResponseSelector {
    /// True when the selector projects a bytes field, so raw bytes are
    /// emitted instead of JSON.
    pub fn is_bytes(&self) -> bool {
        match self {
            ResponseSelector::Whole => false,
            ResponseSelector::Field(fields) => {
                matches!(fields.last().map(|f| f.kind()), Some(Kind::Bytes))
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RestBinding
// ─────────────────────────────────────────────────────────────────────────────

/// Raw captures from a successful path match, aligned with
/// [`RestBinding::vars`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathCaptures {
    pub values: Vec<String>,
}

/// A compiled REST method binding: the unit the routing table tries against
/// inbound REST requests.
#[derive(Debug, Clone)]
pub struct RestBinding {
    pub method: MethodDescriptor,
    pub http_method: Method,
    /// Raw template text, for logs.
    pub template: String,
    segments: Vec<CompiledSegment>,
    verb: Option<String>,
    pub vars: Vec<CompiledVar>,
    pub body: BodySelector,
    pub response_body: ResponseSelector,
    /// Query-eligible scalar fields by proto name and JSON name.
    pub query_fields: HashMap<String, FieldDescriptor>,
    /// Streamed raw-bytes download binding.
    pub download: bool,
    pub server_streaming: bool,
}

impl RestBinding {
    /// Compile a rule and its additional bindings, flattened in declared
    /// order after the primary.
    pub fn compile(method: &MethodDescriptor, rule: &HttpRule) -> GatewayResult<Vec<RestBinding>> {
        let mut bindings = vec![Self::compile_one(method, rule)?];
        for extra in &rule.additional {
            bindings.push(Self::compile_one(method, extra)?);
        }
        Ok(bindings)
    }

    fn compile_one(method: &MethodDescriptor, rule: &HttpRule) -> GatewayResult<RestBinding> {
        let input = method.input();
        let parsed = template::parse_template(&rule.template)?;

        let mut vars = Vec::new();
        let mut segments = Vec::new();
        for segment in &parsed.segments {
            match segment {
                TemplateSegment::Literal(text) => {
                    segments.push(CompiledSegment::Literal(text.clone()));
                }
                TemplateSegment::Wildcard => segments.push(CompiledSegment::Wildcard),
                TemplateSegment::Variable { field_path, pattern } => {
                    let var = compile_var(method, &input, field_path, pattern.as_deref())?;
                    segments.push(CompiledSegment::Var(vars.len()));
                    vars.push(var);
                }
            }
        }

        let body = compile_body(method, &input, &rule.body)?;
        check_disjoint(method, &vars, &body)?;

        let response_body = compile_response(method, &rule.response_body)?;
        let server_streaming = method.is_server_streaming();
        let download = rule.download || (server_streaming && response_body.is_bytes());

        let query_fields = query_eligible_fields(&input, &vars, &body);

        Ok(RestBinding {
            method: method.clone(),
            http_method: rule.http_method.clone(),
            template: rule.template.clone(),
            segments,
            verb: parsed.verb,
            vars,
            body,
            response_body,
            query_fields,
            download,
            server_streaming,
        })
    }

    /// Try this binding against a full request path + method. The first
    /// binding to match wins (caller iterates in declared order).
    pub fn match_path(&self, path: &str, http_method: &Method) -> Option<PathCaptures> {
        if http_method != self.http_method {
            return None;
        }
        let (segments, verb) = template::split_request_path(path);
        if verb.map(str::to_string) != self.verb {
            return None;
        }
        if segments.len() != self.segments.len() {
            return None;
        }

        let mut values = Vec::with_capacity(self.vars.len());
        for (matcher, raw) in self.segments.iter().zip(&segments) {
            match matcher {
                CompiledSegment::Literal(text) => {
                    if text != raw {
                        return None;
                    }
                }
                CompiledSegment::Wildcard => {}
                CompiledSegment::Var(idx) => {
                    if !self.vars[*idx].matches(raw) {
                        return None;
                    }
                    values.push((*raw).to_string());
                }
            }
        }
        Some(PathCaptures { values })
    }

    /// The backend call path, `/package.Service/Method`.
    pub fn grpc_path(&self) -> String {
        format!("/{}/{}", self.method.parent_service().full_name(), self.method.name())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Compilation helpers
// ─────────────────────────────────────────────────────────────────────────────

fn resolve_field_path(
    method: &MethodDescriptor,
    root: &MessageDescriptor,
    path: &[String],
) -> GatewayResult<Vec<FieldDescriptor>> {
    let mut fields = Vec::with_capacity(path.len());
    let mut current = root.clone();

    for (i, name) in path.iter().enumerate() {
        let field = current
            .get_field_by_name(name)
            .or_else(|| current.fields().find(|f| f.json_name() == *name))
            .ok_or_else(|| {
                GatewayError::Startup(format!(
                    "method '{}': unknown field '{}' in '{}'",
                    method.full_name(),
                    name,
                    current.full_name()
                ))
            })?;

        let last = i == path.len() - 1;
        if !last {
            if field.is_list() || field.is_map() {
                return Err(GatewayError::Startup(format!(
                    "method '{}': field '{}' is repeated and cannot be traversed",
                    method.full_name(),
                    name
                )));
            }
            match field.kind() {
                Kind::Message(next) => current = next,
                _ => {
                    return Err(GatewayError::Startup(format!(
                        "method '{}': field '{}' is not a message and cannot be traversed",
                        method.full_name(),
                        name
                    )));
                }
            }
        }
        fields.push(field);
    }
    Ok(fields)
}

fn compile_var(
    method: &MethodDescriptor,
    input: &MessageDescriptor,
    field_path: &[String],
    pattern: Option<&str>,
) -> GatewayResult<CompiledVar> {
    let fields = resolve_field_path(method, input, field_path)?;
    let terminal = fields.last().unwrap();

    if terminal.is_list() || terminal.is_map() {
        return Err(GatewayError::Startup(format!(
            "method '{}': path variable '{}' cannot be repeated",
            method.full_name(),
            field_path.join(".")
        )));
    }

    let kind = match terminal.kind() {
        Kind::String => VarKind::Str,
        Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => VarKind::Int32,
        Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => VarKind::Int64,
        Kind::Uint32 | Kind::Fixed32 => VarKind::UInt32,
        Kind::Uint64 | Kind::Fixed64 => VarKind::UInt64,
        Kind::Enum(desc) => VarKind::Enum(desc),
        other => {
            return Err(GatewayError::Startup(format!(
                "method '{}': path variable '{}' has unsupported type {:?}",
                method.full_name(),
                field_path.join("."),
                other
            )));
        }
    };

    let pattern = match pattern {
        Some(pat) => Some(Regex::new(&format!("^{pat}$")).map_err(|e| {
            GatewayError::Startup(format!(
                "method '{}': bad pattern for '{}': {e}",
                method.full_name(),
                field_path.join(".")
            ))
        })?),
        None => None,
    };

    Ok(CompiledVar { fields, kind, pattern })
}

fn compile_body(
    method: &MethodDescriptor,
    input: &MessageDescriptor,
    selector: &str,
) -> GatewayResult<BodySelector> {
    match selector {
        "" => Ok(BodySelector::None),
        "*" => Ok(BodySelector::Wildcard),
        path => {
            let parts: Vec<String> = path.split('.').map(str::to_string).collect();
            let fields = resolve_field_path(method, input, &parts)?;
            let terminal = fields.last().unwrap();
            if !matches!(terminal.kind(), Kind::Message(_)) || terminal.is_list() {
                return Err(GatewayError::Startup(format!(
                    "method '{}': body selector '{}' must name a singular message field",
                    method.full_name(),
                    path
                )));
            }
            Ok(BodySelector::Field(fields))
        }
    }
}

fn compile_response(
    method: &MethodDescriptor,
    selector: &str,
) -> GatewayResult<ResponseSelector> {
    match selector {
        "" | "*" => Ok(ResponseSelector::Whole),
        path => {
            let parts: Vec<String> = path.split('.').map(str::to_string).collect();
            let fields = resolve_field_path(method, &method.output(), &parts)?;
            Ok(ResponseSelector::Field(fields))
        }
    }
}

/// The fields consumed by path and body must be disjoint. With a wildcard
/// body the whole message is the body and the check does not apply.
fn check_disjoint(
    method: &MethodDescriptor,
    vars: &[CompiledVar],
    body: &BodySelector,
) -> GatewayResult<()> {
    let mut seen: Vec<String> = Vec::new();
    for var in vars {
        let path = var.path_display();
        if seen.contains(&path) {
            return Err(GatewayError::Startup(format!(
                "method '{}': field '{}' captured more than once",
                method.full_name(),
                path
            )));
        }
        seen.push(path);
    }
    if let BodySelector::Field(fields) = body {
        let body_root = fields[0].name().to_string();
        if vars.iter().any(|v| v.fields[0].name() == body_root) {
            return Err(GatewayError::Startup(format!(
                "method '{}': field '{}' consumed by both path and body",
                method.full_name(),
                body_root
            )));
        }
    }
    Ok(())
}

/// Every top-level scalar field not consumed by path or body is eligible as
/// a query parameter; repeated scalars appear as repeated query keys.
fn query_eligible_fields(
    input: &MessageDescriptor,
    vars: &[CompiledVar],
    body: &BodySelector,
) -> HashMap<String, FieldDescriptor> {
    if matches!(body, BodySelector::Wildcard) {
        return HashMap::new();
    }

    let consumed: Vec<&str> = vars
        .iter()
        .map(|v| v.fields[0].name())
        .chain(match body {
            BodySelector::Field(fields) => Some(fields[0].name()),
            _ => None,
        })
        .collect();

    let mut eligible = HashMap::new();
    for field in input.fields() {
        if consumed.contains(&field.name()) || field.is_map() {
            continue;
        }
        let scalar = !matches!(field.kind(), Kind::Message(_));
        if scalar {
            eligible.insert(field.name().to_string(), field.clone());
            if field.json_name() != field.name() {
                eligible.insert(field.json_name().to_string(), field.clone());
            }
        }
    }
    eligible
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest::testing::{metadata_pool, rule};

    fn read_object_binding() -> RestBinding {
        let pool = metadata_pool();
        let method = pool
            .get_service_by_name("tracdap.test.MetadataService")
            .unwrap()
            .methods()
            .find(|m| m.name() == "ReadObject")
            .unwrap();
        let rule = rule(Method::GET, "/metadata/{tenant}/objects/{objectId}", "", "");
        RestBinding::compile(&method, &rule).unwrap().remove(0)
    }

    #[test]
    fn compiles_path_variables_with_types() {
        let binding = read_object_binding();
        assert_eq!(binding.vars.len(), 2);
        assert!(matches!(binding.vars[0].kind, VarKind::Str));
        assert!(matches!(binding.vars[1].kind, VarKind::Str));
    }

    #[test]
    fn matches_and_captures_in_order() {
        let binding = read_object_binding();
        let captures = binding
            .match_path("/metadata/ACME_CORP/objects/abc-123", &Method::GET)
            .unwrap();
        assert_eq!(captures.values, vec!["ACME_CORP", "abc-123"]);
    }

    #[test]
    fn method_mismatch_does_not_match() {
        let binding = read_object_binding();
        assert!(binding.match_path("/metadata/T1/objects/x", &Method::POST).is_none());
    }

    #[test]
    fn segment_count_mismatch_does_not_match() {
        let binding = read_object_binding();
        assert!(binding.match_path("/metadata/T1/objects", &Method::GET).is_none());
        assert!(binding.match_path("/metadata/T1/objects/x/extra", &Method::GET).is_none());
    }

    #[test]
    fn numeric_variable_rejects_non_numeric_segment() {
        let pool = metadata_pool();
        let method = pool
            .get_service_by_name("tracdap.test.MetadataService")
            .unwrap()
            .methods()
            .find(|m| m.name() == "ReadVersion")
            .unwrap();
        let rule = rule(Method::GET, "/metadata/{tenant}/versions/{objectVersion}", "", "");
        let binding = RestBinding::compile(&method, &rule).unwrap().remove(0);

        assert!(binding.match_path("/metadata/T1/versions/7", &Method::GET).is_some());
        assert!(binding.match_path("/metadata/T1/versions/seven", &Method::GET).is_none());
        assert!(matches!(binding.vars[1].kind, VarKind::Int32 | VarKind::UInt32));
    }

    #[test]
    fn unknown_field_fails_compilation() {
        let pool = metadata_pool();
        let method = pool
            .get_service_by_name("tracdap.test.MetadataService")
            .unwrap()
            .methods()
            .find(|m| m.name() == "ReadObject")
            .unwrap();
        let rule = rule(Method::GET, "/metadata/{no_such_field}", "", "");
        assert!(matches!(
            RestBinding::compile(&method, &rule),
            Err(GatewayError::Startup(_))
        ));
    }

    #[test]
    fn body_and_path_overlap_rejected() {
        let pool = metadata_pool();
        let method = pool
            .get_service_by_name("tracdap.test.MetadataService")
            .unwrap()
            .methods()
            .find(|m| m.name() == "SaveObject")
            .unwrap();
        // `definition` consumed by both path and body.
        let rule = rule(Method::POST, "/save/{definition.schema}", "definition", "");
        assert!(RestBinding::compile(&method, &rule).is_err());
    }

    #[test]
    fn query_fields_exclude_consumed_and_message_fields() {
        let binding = read_object_binding();
        // tenant and object_id are path-consumed; version + search_text remain.
        assert!(binding.query_fields.contains_key("version"));
        assert!(binding.query_fields.contains_key("search_text"));
        assert!(binding.query_fields.contains_key("searchText"));
        assert!(!binding.query_fields.contains_key("tenant"));
        assert!(!binding.query_fields.contains_key("object_id"));
    }

    #[test]
    fn wildcard_body_disables_query_fields() {
        let pool = metadata_pool();
        let method = pool
            .get_service_by_name("tracdap.test.MetadataService")
            .unwrap()
            .methods()
            .find(|m| m.name() == "SaveObject")
            .unwrap();
        let rule = rule(Method::POST, "/save:create", "*", "");
        let binding = RestBinding::compile(&method, &rule).unwrap().remove(0);
        assert!(binding.query_fields.is_empty());
        assert!(matches!(binding.body, BodySelector::Wildcard));
    }

    #[test]
    fn custom_verb_must_match() {
        let pool = metadata_pool();
        let method = pool
            .get_service_by_name("tracdap.test.MetadataService")
            .unwrap()
            .methods()
            .find(|m| m.name() == "SaveObject")
            .unwrap();
        let rule = rule(Method::POST, "/save:create", "*", "");
        let binding = RestBinding::compile(&method, &rule).unwrap().remove(0);

        assert!(binding.match_path("/save:create", &Method::POST).is_some());
        assert!(binding.match_path("/save", &Method::POST).is_none());
        assert!(binding.match_path("/save:delete", &Method::POST).is_none());
    }
}

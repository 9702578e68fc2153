//! Per-request REST translation.
//!
//! Inbound: a matched binding plus raw path captures, query string and body
//! produce the request message (canonical protobuf JSON mapping throughout).
//! Outbound: the response message is projected through the binding's
//! response-body selector.
//!
//! Path and body never consume the same field (checked at compile time), so
//! the application order of the three translators is not observable.

use bytes::Bytes;
use http::StatusCode;
use prost_reflect::{DynamicMessage, FieldDescriptor, Kind, Value};

use crate::error::{GatewayError, GatewayResult};
use crate::rest::binding::{BodySelector, PathCaptures, ResponseSelector, RestBinding, VarKind};

/// Default content type for raw-bytes response projections.
const OCTET_STREAM: &str = "application/octet-stream";

// ─────────────────────────────────────────────────────────────────────────────
// Request translation
// ─────────────────────────────────────────────────────────────────────────────

/// Build the backend request message from a matched binding.
pub fn build_request(
    binding: &RestBinding,
    captures: &PathCaptures,
    query: Option<&str>,
    body: &[u8],
) -> GatewayResult<DynamicMessage> {
    let input = binding.method.input();

    // Body first: a wildcard body deserializes the whole message, and path
    // / query values are layered on top of it.
    let mut msg = match &binding.body {
        BodySelector::None => {
            if !body.is_empty() {
                return Err(GatewayError::Validation(
                    "request body is not accepted by this operation".into(),
                ));
            }
            DynamicMessage::new(input.clone())
        }
        BodySelector::Wildcard => {
            if body.is_empty() {
                DynamicMessage::new(input.clone())
            } else {
                let mut de = serde_json::Deserializer::from_slice(body);
                DynamicMessage::deserialize(input.clone(), &mut de)
                    .map_err(|e| GatewayError::Validation(format!("malformed request body: {e}")))?
            }
        }
        BodySelector::Field(fields) => {
            let mut msg = DynamicMessage::new(input.clone());
            if !body.is_empty() {
                let sub_desc = match fields.last().unwrap().kind() {
                    Kind::Message(desc) => desc,
                    _ => unreachable!("body selector is checked at compile time"),
                };
                let mut de = serde_json::Deserializer::from_slice(body);
                let sub = DynamicMessage::deserialize(sub_desc, &mut de)
                    .map_err(|e| GatewayError::Validation(format!("malformed request body: {e}")))?;
                set_nested(&mut msg, fields, Value::Message(sub));
            }
            msg
        }
    };

    // Path variables, in declaration order.
    for (var, raw) in binding.vars.iter().zip(&captures.values) {
        let decoded = percent_decode(raw, false)?;
        let value = coerce_path_value(&var.kind, &decoded, &var.path_display())?;
        set_nested(&mut msg, &var.fields, value);
    }

    // Remaining scalar fields from the query string.
    if let Some(query) = query {
        apply_query(binding, &mut msg, query)?;
    }

    Ok(msg)
}

fn apply_query(binding: &RestBinding, msg: &mut DynamicMessage, query: &str) -> GatewayResult<()> {
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, raw_value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = percent_decode(key, true)?;
        let value = percent_decode(raw_value, true)?;

        let field = binding.query_fields.get(key.as_str()).ok_or_else(|| {
            GatewayError::Validation(format!("unknown query parameter '{key}'"))
        })?;

        let coerced = coerce_query_value(field, &value)?;
        if field.is_list() {
            let mut list = match msg.get_field(field).into_owned() {
                Value::List(items) => items,
                _ => Vec::new(),
            };
            list.push(coerced);
            msg.set_field(field, Value::List(list));
        } else {
            msg.set_field(field, coerced);
        }
    }
    Ok(())
}

/// Set a value through a nested field chain, creating intermediate
/// messages as needed.
fn set_nested(msg: &mut DynamicMessage, fields: &[FieldDescriptor], value: Value) {
    let field = &fields[0];
    if fields.len() == 1 {
        msg.set_field(field, value);
        return;
    }

    let mut sub = match msg.get_field(field).into_owned() {
        Value::Message(existing) => existing,
        _ => match field.kind() {
            Kind::Message(desc) => DynamicMessage::new(desc),
            _ => unreachable!("field paths are checked at compile time"),
        },
    };
    set_nested(&mut sub, &fields[1..], value);
    msg.set_field(field, Value::Message(sub));
}

fn coerce_path_value(kind: &VarKind, raw: &str, path: &str) -> GatewayResult<Value> {
    match kind {
        VarKind::Str => Ok(Value::String(raw.to_string())),
        VarKind::Int32 => raw
            .parse::<i32>()
            .map(Value::I32)
            .map_err(|_| range_error(path, raw)),
        VarKind::Int64 => raw
            .parse::<i64>()
            .map(Value::I64)
            .map_err(|_| range_error(path, raw)),
        VarKind::UInt32 => raw
            .parse::<u32>()
            .map(Value::U32)
            .map_err(|_| range_error(path, raw)),
        VarKind::UInt64 => raw
            .parse::<u64>()
            .map(Value::U64)
            .map_err(|_| range_error(path, raw)),
        VarKind::Enum(desc) => desc
            .values()
            .find(|v| v.name() == raw)
            .map(|v| Value::EnumNumber(v.number()))
            .ok_or_else(|| {
                GatewayError::Validation(format!(
                    "'{raw}' is not a value of enum {}",
                    desc.full_name()
                ))
            }),
    }
}

fn coerce_query_value(field: &FieldDescriptor, raw: &str) -> GatewayResult<Value> {
    let name = field.name();
    match field.kind() {
        Kind::String => Ok(Value::String(raw.to_string())),
        Kind::Bool => match raw {
            "true" | "1" => Ok(Value::Bool(true)),
            "false" | "0" => Ok(Value::Bool(false)),
            _ => Err(GatewayError::Validation(format!(
                "query parameter '{name}': expected a boolean, got '{raw}'"
            ))),
        },
        Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => {
            raw.parse::<i32>().map(Value::I32).map_err(|_| range_error(name, raw))
        }
        Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => {
            raw.parse::<i64>().map(Value::I64).map_err(|_| range_error(name, raw))
        }
        Kind::Uint32 | Kind::Fixed32 => {
            raw.parse::<u32>().map(Value::U32).map_err(|_| range_error(name, raw))
        }
        Kind::Uint64 | Kind::Fixed64 => {
            raw.parse::<u64>().map(Value::U64).map_err(|_| range_error(name, raw))
        }
        Kind::Float => raw
            .parse::<f32>()
            .map(Value::F32)
            .map_err(|_| range_error(name, raw)),
        Kind::Double => raw
            .parse::<f64>()
            .map(Value::F64)
            .map_err(|_| range_error(name, raw)),
        Kind::Enum(desc) => desc
            .values()
            .find(|v| v.name() == raw)
            .map(|v| Value::EnumNumber(v.number()))
            .ok_or_else(|| {
                GatewayError::Validation(format!(
                    "query parameter '{name}': '{raw}' is not a value of enum {}",
                    desc.full_name()
                ))
            }),
        Kind::Bytes => {
            use base64::Engine;
            base64::engine::general_purpose::STANDARD
                .decode(raw)
                .map(|b| Value::Bytes(Bytes::from(b)))
                .map_err(|_| {
                    GatewayError::Validation(format!(
                        "query parameter '{name}': invalid base64"
                    ))
                })
        }
        Kind::Message(_) => Err(GatewayError::Validation(format!(
            "query parameter '{name}' is not a scalar field"
        ))),
    }
}

fn range_error(field: &str, raw: &str) -> GatewayError {
    GatewayError::Validation(format!("'{raw}' is not a valid value for '{field}'"))
}

/// Percent-decoding for path segments and query components. `+` decodes to
/// a space in query components only.
fn percent_decode(raw: &str, query_component: bool) -> GatewayResult<String> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes
                    .get(i + 1..i + 3)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| {
                        GatewayError::Validation(format!("invalid percent-encoding in '{raw}'"))
                    })?;
                out.push(hex);
                i += 3;
            }
            b'+' if query_component => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out)
        .map_err(|_| GatewayError::Validation(format!("'{raw}' is not valid UTF-8")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Response projection
// ─────────────────────────────────────────────────────────────────────────────

/// A projected REST response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestResponse {
    pub status: StatusCode,
    pub content_type: String,
    pub body: Bytes,
}

/// Project a unary response message through the binding's response-body
/// selector. `accept` is the request's `Accept` header, used as the content
/// type for raw-bytes projections.
pub fn project_response(
    binding: &RestBinding,
    msg: &DynamicMessage,
    accept: Option<&str>,
) -> GatewayResult<RestResponse> {
    match &binding.response_body {
        ResponseSelector::Whole => {
            let body = serde_json::to_vec(msg)
                .map_err(|e| GatewayError::Internal(format!("response serialization: {e}")))?;
            Ok(RestResponse {
                status: StatusCode::OK,
                content_type: "application/json".to_string(),
                body: Bytes::from(body),
            })
        }
        ResponseSelector::Field(fields) => {
            let value = read_nested(msg, fields);
            if binding.response_body.is_bytes() {
                let bytes = match value {
                    Some(Value::Bytes(b)) => b,
                    _ => Bytes::new(),
                };
                let content_type = accept
                    .filter(|a| !a.is_empty() && *a != "*/*")
                    .unwrap_or(OCTET_STREAM)
                    .to_string();
                return Ok(RestResponse { status: StatusCode::OK, content_type, body: bytes });
            }

            let json = match value {
                Some(v) => value_to_json(&v)?,
                None => serde_json::Value::Null,
            };
            let body = serde_json::to_vec(&json)
                .map_err(|e| GatewayError::Internal(format!("response serialization: {e}")))?;
            Ok(RestResponse {
                status: StatusCode::OK,
                content_type: "application/json".to_string(),
                body: Bytes::from(body),
            })
        }
    }
}

/// Project one element of a streaming response as a JSON value, for the
/// JSON-array encoding of non-download streams.
pub fn project_stream_element(
    binding: &RestBinding,
    msg: &DynamicMessage,
) -> GatewayResult<serde_json::Value> {
    match &binding.response_body {
        ResponseSelector::Whole => serde_json::to_value(msg)
            .map_err(|e| GatewayError::Internal(format!("response serialization: {e}"))),
        ResponseSelector::Field(fields) => match read_nested(msg, fields) {
            Some(v) => value_to_json(&v),
            None => Ok(serde_json::Value::Null),
        },
    }
}

/// Extract the raw bytes of one element of a download stream.
pub fn download_chunk(binding: &RestBinding, msg: &DynamicMessage) -> Bytes {
    match &binding.response_body {
        ResponseSelector::Field(fields) => match read_nested(msg, fields) {
            Some(Value::Bytes(b)) => b,
            _ => Bytes::new(),
        },
        ResponseSelector::Whole => Bytes::new(),
    }
}

fn read_nested(msg: &DynamicMessage, fields: &[FieldDescriptor]) -> Option<Value> {
    let mut current = msg.clone();
    for (i, field) in fields.iter().enumerate() {
        let value = current.get_field(field).into_owned();
        if i == fields.len() - 1 {
            return Some(value);
        }
        match value {
            Value::Message(next) => current = next,
            _ => return None,
        }
    }
    None
}

fn value_to_json(value: &Value) -> GatewayResult<serde_json::Value> {
    let json = match value {
        Value::Message(msg) => serde_json::to_value(msg)
            .map_err(|e| GatewayError::Internal(format!("response serialization: {e}")))?,
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::I32(n) => serde_json::Value::from(*n),
        Value::U32(n) => serde_json::Value::from(*n),
        // int64 values are strings in canonical protobuf JSON.
        Value::I64(n) => serde_json::Value::String(n.to_string()),
        Value::U64(n) => serde_json::Value::String(n.to_string()),
        Value::F32(n) => serde_json::Value::from(*n),
        Value::F64(n) => serde_json::Value::from(*n),
        Value::EnumNumber(n) => serde_json::Value::from(*n),
        Value::Bytes(b) => {
            use base64::Engine;
            serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(b))
        }
        Value::List(items) => serde_json::Value::Array(
            items.iter().map(value_to_json).collect::<GatewayResult<Vec<_>>>()?,
        ),
        Value::Map(_) => {
            return Err(GatewayError::Internal(
                "map-valued response projections are not supported".into(),
            ));
        }
    };
    Ok(json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest::binding::RestBinding;
    use crate::rest::testing::{metadata_pool, rule};
    use http::Method;

    fn binding(name: &str, r: crate::rest::rule::HttpRule) -> RestBinding {
        let pool = metadata_pool();
        let method = pool
            .get_service_by_name("tracdap.test.MetadataService")
            .unwrap()
            .methods()
            .find(|m| m.name() == name)
            .unwrap();
        RestBinding::compile(&method, &r).unwrap().remove(0)
    }

    #[test]
    fn path_variables_populate_request_message() {
        let b = binding("ReadObject", rule(Method::GET, "/metadata/{tenant}/objects/{objectId}", "", ""));
        let captures = b.match_path("/metadata/ACME_CORP/objects/abc-123", &Method::GET).unwrap();

        let msg = build_request(&b, &captures, None, b"").unwrap();
        assert_eq!(msg.get_field_by_name("tenant").unwrap().as_str(), Some("ACME_CORP"));
        assert_eq!(msg.get_field_by_name("object_id").unwrap().as_str(), Some("abc-123"));
    }

    #[test]
    fn wildcard_body_is_whole_message() {
        let b = binding("SaveObject", rule(Method::POST, "/save:create", "*", ""));
        let captures = b.match_path("/save:create", &Method::POST).unwrap();

        let body = br#"{"tenant":"T1","format":"text/csv"}"#;
        let msg = build_request(&b, &captures, None, body).unwrap();
        assert_eq!(msg.get_field_by_name("tenant").unwrap().as_str(), Some("T1"));
        assert_eq!(msg.get_field_by_name("format").unwrap().as_str(), Some("text/csv"));
    }

    #[test]
    fn body_field_selector_places_sub_message() {
        let b = binding("SaveObject", rule(Method::POST, "/save/{tenant}", "definition", ""));
        let captures = b.match_path("/save/T1", &Method::POST).unwrap();

        let body = br#"{"schema":"customer_v1"}"#;
        let msg = build_request(&b, &captures, None, body).unwrap();
        let definition = msg.get_field_by_name("definition").unwrap().into_owned();
        match definition {
            Value::Message(def) => {
                assert_eq!(def.get_field_by_name("schema").unwrap().as_str(), Some("customer_v1"));
            }
            other => panic!("expected message, got {other:?}"),
        }
        assert_eq!(msg.get_field_by_name("tenant").unwrap().as_str(), Some("T1"));
    }

    #[test]
    fn body_rejected_when_not_accepted() {
        let b = binding("ReadObject", rule(Method::GET, "/metadata/{tenant}/objects/{objectId}", "", ""));
        let captures = b.match_path("/metadata/T1/objects/x", &Method::GET).unwrap();
        assert!(matches!(
            build_request(&b, &captures, None, b"{}"),
            Err(GatewayError::Validation(_))
        ));
    }

    #[test]
    fn malformed_body_is_validation_error() {
        let b = binding("SaveObject", rule(Method::POST, "/save:create", "*", ""));
        let captures = b.match_path("/save:create", &Method::POST).unwrap();
        assert!(matches!(
            build_request(&b, &captures, None, b"not json"),
            Err(GatewayError::Validation(_))
        ));
    }

    #[test]
    fn query_parameters_fill_remaining_scalars() {
        let b = binding("ReadObject", rule(Method::GET, "/metadata/{tenant}/objects/{objectId}", "", ""));
        let captures = b.match_path("/metadata/T1/objects/x", &Method::GET).unwrap();

        let msg = build_request(&b, &captures, Some("version=4&searchText=hello%20world"), b"").unwrap();
        assert_eq!(msg.get_field_by_name("version").unwrap().as_i32(), Some(4));
        assert_eq!(msg.get_field_by_name("search_text").unwrap().as_str(), Some("hello world"));
    }

    #[test]
    fn repeated_query_keys_accumulate() {
        let b = binding("ReadObject", rule(Method::GET, "/metadata/{tenant}/objects/{objectId}", "", ""));
        let captures = b.match_path("/metadata/T1/objects/x", &Method::GET).unwrap();

        let msg = build_request(&b, &captures, Some("tags=a&tags=b"), b"").unwrap();
        let tags = msg.get_field_by_name("tags").unwrap().into_owned();
        match tags {
            Value::List(items) => {
                assert_eq!(items.len(), 2);
                assert_eq!(items[0].as_str(), Some("a"));
                assert_eq!(items[1].as_str(), Some("b"));
            }
            other => panic!("expected list, got {other:?}"),
        }
    }

    #[test]
    fn unknown_query_key_is_validation_error() {
        let b = binding("ReadObject", rule(Method::GET, "/metadata/{tenant}/objects/{objectId}", "", ""));
        let captures = b.match_path("/metadata/T1/objects/x", &Method::GET).unwrap();
        assert!(matches!(
            build_request(&b, &captures, Some("bogus=1"), b""),
            Err(GatewayError::Validation(_))
        ));
    }

    #[test]
    fn enum_query_value_by_name() {
        let b = binding("ReadObject", rule(Method::GET, "/metadata/{tenant}/objects/{objectId}", "", ""));
        let captures = b.match_path("/metadata/T1/objects/x", &Method::GET).unwrap();

        let msg = build_request(&b, &captures, Some("objectType=MODEL"), b"").unwrap();
        assert_eq!(msg.get_field_by_name("object_type").unwrap().as_enum_number(), Some(2));

        assert!(build_request(&b, &captures, Some("objectType=BOGUS"), b"").is_err());
    }

    #[test]
    fn int_overflow_is_validation_error() {
        let b = binding("ReadVersion", rule(Method::GET, "/metadata/{tenant}/versions/{objectVersion}", "", ""));
        let captures = b
            .match_path("/metadata/T1/versions/99999999999999999999", &Method::GET)
            .unwrap();
        assert!(matches!(
            build_request(&b, &captures, None, b""),
            Err(GatewayError::Validation(_))
        ));
    }

    #[test]
    fn whole_response_serializes_to_canonical_json() {
        let b = binding("ReadObject", rule(Method::GET, "/metadata/{tenant}/objects/{objectId}", "", ""));
        let pool = metadata_pool();
        let tag_desc = pool.get_message_by_name("tracdap.test.Tag").unwrap();
        let mut tag = DynamicMessage::new(tag_desc);
        tag.set_field_by_name("object_id", Value::String("abc-123".into()));
        tag.set_field_by_name("version", Value::I32(1));

        let resp = project_response(&b, &tag, Some("application/json")).unwrap();
        assert_eq!(resp.content_type, "application/json");
        let json: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(json["objectId"], "abc-123");
        assert_eq!(json["version"], 1);
    }

    #[test]
    fn bytes_response_body_emits_raw_bytes() {
        let b = binding("ReadFile", rule(Method::GET, "/files/{tenant}/{objectId}", "", "content"));
        assert!(b.download);

        let pool = metadata_pool();
        let chunk_desc = pool.get_message_by_name("tracdap.test.FileChunk").unwrap();
        let mut chunk = DynamicMessage::new(chunk_desc);
        chunk.set_field_by_name("content", Value::Bytes(Bytes::from_static(b"raw-data")));

        let resp = project_response(&b, &chunk, Some("text/csv")).unwrap();
        assert_eq!(resp.content_type, "text/csv");
        assert_eq!(resp.body.as_ref(), b"raw-data");

        let resp = project_response(&b, &chunk, None).unwrap();
        assert_eq!(resp.content_type, "application/octet-stream");
    }
}

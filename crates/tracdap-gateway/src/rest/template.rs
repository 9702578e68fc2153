//! Path-template parsing for REST method bindings.
//!
//! Grammar: segments separated by `/`; a segment is a literal, `*` (single
//! segment wildcard, no capture), or `{field.path[=pattern]}` (captured into
//! the request message). Multi-segment captures (`{var=foo/*}`) and `**`
//! are rejected at parse time as unsupported.

use crate::error::{GatewayError, GatewayResult};

/// One parsed template segment, before type resolution against the request
/// message descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateSegment {
    /// Exact string equality.
    Literal(String),
    /// Matches any single segment, captures nothing.
    Wildcard,
    /// Captures one segment into the named field path.
    Variable {
        field_path: Vec<String>,
        /// Optional `=pattern` suffix; only single-segment patterns are
        /// accepted.
        pattern: Option<String>,
    },
}

/// A parsed path template. The verb suffix (`/path:verb`) is split off and
/// matched as an exact trailing literal on the final segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    pub segments: Vec<TemplateSegment>,
    /// Custom verb after `:` on the final segment, e.g. `create` in
    /// `/data:create`.
    pub verb: Option<String>,
}

impl PathTemplate {
    /// Field paths captured by this template, in declaration order.
    pub fn captured_paths(&self) -> Vec<&[String]> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                TemplateSegment::Variable { field_path, .. } => Some(field_path.as_slice()),
                _ => None,
            })
            .collect()
    }
}

/// Parse a path template. Errors here are startup failures.
pub fn parse_template(template: &str) -> GatewayResult<PathTemplate> {
    if !template.starts_with('/') {
        return Err(GatewayError::Startup(format!(
            "path template '{template}' must start with '/'"
        )));
    }

    // Split a trailing custom verb off the final segment.
    let (path_part, verb) = match template.rsplit_once(':') {
        Some((path, verb)) if !verb.contains('/') && !verb.is_empty() && !path.ends_with('/') => {
            (path, Some(verb.to_string()))
        }
        _ => (template, None),
    };

    let mut segments = Vec::new();
    for raw in path_part[1..].split('/') {
        if raw.is_empty() {
            return Err(GatewayError::Startup(format!(
                "path template '{template}' contains an empty segment"
            )));
        }
        segments.push(parse_segment(template, raw)?);
    }

    Ok(PathTemplate { segments, verb })
}

fn parse_segment(template: &str, raw: &str) -> GatewayResult<TemplateSegment> {
    if raw == "**" {
        return Err(GatewayError::Startup(format!(
            "path template '{template}': '**' captures are not supported"
        )));
    }
    if raw == "*" {
        return Ok(TemplateSegment::Wildcard);
    }

    if raw.starts_with('{') {
        if !raw.ends_with('}') {
            return Err(GatewayError::Startup(format!(
                "path template '{template}': unterminated variable '{raw}'"
            )));
        }
        let inner = &raw[1..raw.len() - 1];
        let (path, pattern) = match inner.split_once('=') {
            Some((p, pat)) => (p, Some(pat)),
            None => (inner, None),
        };

        if let Some(pat) = pattern {
            // Nested expansion such as {var=foo/*} is a draft feature and
            // is refused at compile time.
            if pat.contains('/') || pat.contains('*') {
                return Err(GatewayError::Startup(format!(
                    "path template '{template}': multi-segment capture '{raw}' is not supported"
                )));
            }
        }

        let field_path: Vec<String> = path.split('.').map(str::to_string).collect();
        if field_path.iter().any(|p| p.is_empty()) {
            return Err(GatewayError::Startup(format!(
                "path template '{template}': invalid field path '{path}'"
            )));
        }

        return Ok(TemplateSegment::Variable {
            field_path,
            pattern: pattern.map(str::to_string),
        });
    }

    if raw.contains('{') || raw.contains('}') {
        return Err(GatewayError::Startup(format!(
            "path template '{template}': malformed segment '{raw}'"
        )));
    }

    Ok(TemplateSegment::Literal(raw.to_string()))
}

/// Split a concrete request path into segments plus optional trailing verb,
/// mirroring the template shape.
pub fn split_request_path(path: &str) -> (Vec<&str>, Option<&str>) {
    let path = path.strip_prefix('/').unwrap_or(path);
    let mut segments: Vec<&str> = if path.is_empty() { vec![] } else { path.split('/').collect() };

    let mut verb = None;
    if let Some(last) = segments.last_mut() {
        if let Some((seg, v)) = last.rsplit_once(':') {
            if !seg.is_empty() && !v.is_empty() {
                *last = seg;
                verb = Some(v);
            }
        }
    }
    (segments, verb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literals_wildcards_and_variables() {
        let t = parse_template("/metadata/{tenant}/objects/{objectId}").unwrap();
        assert_eq!(t.segments.len(), 4);
        assert_eq!(t.segments[0], TemplateSegment::Literal("metadata".into()));
        assert!(matches!(
            &t.segments[1],
            TemplateSegment::Variable { field_path, .. } if field_path == &vec!["tenant".to_string()]
        ));
        assert!(t.verb.is_none());
    }

    #[test]
    fn nested_field_path() {
        let t = parse_template("/search/{request.searchParams.objectType}").unwrap();
        match &t.segments[1] {
            TemplateSegment::Variable { field_path, .. } => {
                assert_eq!(field_path, &["request", "searchParams", "objectType"]);
            }
            other => panic!("expected variable, got {other:?}"),
        }
    }

    #[test]
    fn custom_verb_split() {
        let t = parse_template("/data:create").unwrap();
        assert_eq!(t.segments, vec![TemplateSegment::Literal("data".into())]);
        assert_eq!(t.verb.as_deref(), Some("create"));
    }

    #[test]
    fn single_wildcard_allowed() {
        let t = parse_template("/files/*/{name}").unwrap();
        assert_eq!(t.segments[1], TemplateSegment::Wildcard);
    }

    #[test]
    fn double_star_rejected() {
        assert!(matches!(
            parse_template("/files/**"),
            Err(GatewayError::Startup(_))
        ));
    }

    #[test]
    fn multi_segment_capture_rejected() {
        assert!(matches!(
            parse_template("/files/{path=foo/*}"),
            Err(GatewayError::Startup(_))
        ));
    }

    #[test]
    fn malformed_segments_rejected() {
        assert!(parse_template("metadata/noslash").is_err());
        assert!(parse_template("/a//b").is_err());
        assert!(parse_template("/a/{unterminated").is_err());
        assert!(parse_template("/a/partial{brace}").is_err());
    }

    #[test]
    fn request_path_split_mirrors_template() {
        let (segs, verb) = split_request_path("/data:create");
        assert_eq!(segs, vec!["data"]);
        assert_eq!(verb, Some("create"));

        let (segs, verb) = split_request_path("/metadata/ACME_CORP/objects/abc-123");
        assert_eq!(segs, vec!["metadata", "ACME_CORP", "objects", "abc-123"]);
        assert_eq!(verb, None);
    }
}

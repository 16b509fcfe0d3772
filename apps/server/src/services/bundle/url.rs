//! Parsing of `Bundle.entry.request.url`

use crate::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedUrl {
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub version_id: Option<i32>,
    /// `_history` segment present
    pub history: bool,
    /// Operation name without the leading `$`
    pub operation: Option<String>,
    /// Target type of a compartment search, `Patient/1/Observation`
    pub compartment_type: Option<String>,
    /// `_search` segment present
    pub search_endpoint: bool,
    pub query: Option<String>,
}

impl ParsedUrl {
    pub fn parse(raw: &str) -> Result<Self> {
        let (mut path, query) = match raw.split_once('?') {
            Some((p, q)) => (p, Some(q.to_string()).filter(|q| !q.is_empty())),
            None => (raw, None),
        };

        let absolute = match path.find("://") {
            Some(scheme_idx) => {
                let after_scheme = &path[scheme_idx + 3..];
                path = after_scheme.split_once('/').map(|(_, p)| p).unwrap_or("");
                true
            }
            None => false,
        };

        let mut parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if absolute {
            // Drop the service base path, e.g. `fhir` in `https://host/fhir/Patient/1`.
            let start = parts
                .iter()
                .position(|p| is_resource_type(p) || p.starts_with('$') || p.starts_with('_'))
                .unwrap_or(parts.len());
            parts.drain(..start);
        }

        let mut parsed = ParsedUrl {
            query,
            ..Default::default()
        };

        match parts.as_slice() {
            [] => {}
            [op] if op.starts_with('$') => parsed.operation = Some(operation_name(op)?),
            ["_history"] => parsed.history = true,
            ["_search"] => parsed.search_endpoint = true,
            [rt] => parsed.resource_type = Some(type_segment(rt, raw)?),
            [rt, op] if op.starts_with('$') => {
                parsed.resource_type = Some(type_segment(rt, raw)?);
                parsed.operation = Some(operation_name(op)?);
            }
            [rt, "_history"] => {
                parsed.resource_type = Some(type_segment(rt, raw)?);
                parsed.history = true;
            }
            [rt, "_search"] => {
                parsed.resource_type = Some(type_segment(rt, raw)?);
                parsed.search_endpoint = true;
            }
            [rt, id] => {
                parsed.resource_type = Some(type_segment(rt, raw)?);
                parsed.resource_id = Some(id_segment(id, raw)?);
            }
            [rt, id, op] if op.starts_with('$') => {
                parsed.resource_type = Some(type_segment(rt, raw)?);
                parsed.resource_id = Some(id_segment(id, raw)?);
                parsed.operation = Some(operation_name(op)?);
            }
            [rt, id, "_history"] => {
                parsed.resource_type = Some(type_segment(rt, raw)?);
                parsed.resource_id = Some(id_segment(id, raw)?);
                parsed.history = true;
            }
            [rt, id, "_history", vid] => {
                parsed.resource_type = Some(type_segment(rt, raw)?);
                parsed.resource_id = Some(id_segment(id, raw)?);
                parsed.history = true;
                parsed.version_id = Some(version_segment(vid, raw)?);
            }
            [rt, id, "_history", vid, op] if op.starts_with('$') => {
                parsed.resource_type = Some(type_segment(rt, raw)?);
                parsed.resource_id = Some(id_segment(id, raw)?);
                parsed.history = true;
                parsed.version_id = Some(version_segment(vid, raw)?);
                parsed.operation = Some(operation_name(op)?);
            }
            [rt, id, target] if is_resource_type(target) => {
                parsed.resource_type = Some(type_segment(rt, raw)?);
                parsed.resource_id = Some(id_segment(id, raw)?);
                parsed.compartment_type = Some(target.to_string());
            }
            _ => {
                return Err(Error::InvalidResource(format!(
                    "Unsupported request URL '{}'",
                    raw
                )))
            }
        }

        Ok(parsed)
    }

    /// `Type/id` when both are present.
    pub fn identity(&self) -> Option<String> {
        match (&self.resource_type, &self.resource_id) {
            (Some(rt), Some(id)) => Some(format!("{}/{}", rt, id)),
            _ => None,
        }
    }

    /// Decoded query parameters in request order.
    pub fn query_params(&self) -> Result<Vec<(String, String)>> {
        match &self.query {
            Some(query) => parse_query(query),
            None => Ok(Vec::new()),
        }
    }
}

/// Decode an `application/x-www-form-urlencoded` query string.
pub fn parse_query(query: &str) -> Result<Vec<(String, String)>> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            Ok((decode_component(key)?, decode_component(value)?))
        })
        .collect()
}

fn decode_component(raw: &str) -> Result<String> {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|s| s.into_owned())
        .map_err(|e| Error::InvalidResource(format!("Invalid URL encoding in '{}': {}", raw, e)))
}

pub fn is_resource_type(segment: &str) -> bool {
    let mut chars = segment.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_uppercase())
        && chars.all(|c| c.is_ascii_alphanumeric())
}

/// FHIR logical id: `[A-Za-z0-9\-\.]{1,64}`
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}

fn type_segment(segment: &str, raw: &str) -> Result<String> {
    if is_resource_type(segment) {
        Ok(segment.to_string())
    } else {
        Err(Error::InvalidResource(format!(
            "'{}' in request URL '{}' is not a resource type",
            segment, raw
        )))
    }
}

fn id_segment(segment: &str, raw: &str) -> Result<String> {
    if is_valid_id(segment) {
        Ok(segment.to_string())
    } else {
        Err(Error::InvalidResource(format!(
            "'{}' in request URL '{}' is not a valid resource id",
            segment, raw
        )))
    }
}

fn version_segment(segment: &str, raw: &str) -> Result<i32> {
    segment.parse::<i32>().map_err(|_| {
        Error::InvalidResource(format!(
            "'{}' in request URL '{}' is not a valid version id",
            segment, raw
        ))
    })
}

fn operation_name(segment: &str) -> Result<String> {
    let name = segment.trim_start_matches('$');
    if name.is_empty() {
        return Err(Error::InvalidResource("Empty operation name".to_string()));
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_instance_and_type() {
        let parsed = ParsedUrl::parse("Patient/123").unwrap();
        assert_eq!(parsed.identity().as_deref(), Some("Patient/123"));

        let parsed = ParsedUrl::parse("Patient?name=peter&_count=5").unwrap();
        assert_eq!(parsed.resource_type.as_deref(), Some("Patient"));
        assert_eq!(parsed.resource_id, None);
        assert_eq!(
            parsed.query_params().unwrap(),
            vec![
                ("name".to_string(), "peter".to_string()),
                ("_count".to_string(), "5".to_string())
            ]
        );
    }

    #[test]
    fn test_parse_vread_and_history() {
        let parsed = ParsedUrl::parse("Observation/o1/_history/3").unwrap();
        assert!(parsed.history);
        assert_eq!(parsed.version_id, Some(3));

        let parsed = ParsedUrl::parse("Observation/o1/_history").unwrap();
        assert!(parsed.history);
        assert_eq!(parsed.version_id, None);

        assert!(ParsedUrl::parse("Observation/o1/_history/x").is_err());
    }

    #[test]
    fn test_parse_operations() {
        let parsed = ParsedUrl::parse("$versions").unwrap();
        assert_eq!(parsed.operation.as_deref(), Some("versions"));
        assert_eq!(parsed.resource_type, None);

        let parsed = ParsedUrl::parse("Patient/p1/$meta").unwrap();
        assert_eq!(parsed.operation.as_deref(), Some("meta"));
        assert_eq!(parsed.identity().as_deref(), Some("Patient/p1"));
    }

    #[test]
    fn test_parse_compartment() {
        let parsed = ParsedUrl::parse("Patient/p1/Observation?code=x").unwrap();
        assert_eq!(parsed.compartment_type.as_deref(), Some("Observation"));
        assert_eq!(parsed.query.as_deref(), Some("code=x"));
    }

    #[test]
    fn test_parse_absolute_url_strips_base() {
        let parsed = ParsedUrl::parse("https://example.org/fhir/Patient/123").unwrap();
        assert_eq!(parsed.identity().as_deref(), Some("Patient/123"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ParsedUrl::parse("patient/123").is_err());
        assert!(ParsedUrl::parse("Patient/12 3").is_err());
        assert!(ParsedUrl::parse("Patient/1/2/3/4/5/6").is_err());
    }

    #[test]
    fn test_query_decoding() {
        let params = parse_query("name=John+Smith&identifier=http%3A%2F%2Fsys%7C1").unwrap();
        assert_eq!(params[0].1, "John Smith");
        assert_eq!(params[1].1, "http://sys|1");
    }
}

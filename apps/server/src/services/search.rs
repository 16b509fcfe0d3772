//! Minimal search over the in-memory store
//!
//! Supported: `_id`, `_count`, `_lastUpdated` (equality on the instant or a
//! prefix of it, optional `eq` prefix) and equality on top-level primitive
//! elements. Comma-separated values are OR-ed. `_format` and `_pretty` are
//! accepted and ignored; any other `_` parameter or a modifier is rejected.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use crate::models::{format_instant, Resource, SearchResult};
use crate::{Error, Result};

const IGNORED_PARAMS: &[&str] = &["_format", "_pretty"];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchParams {
    pub ids: Vec<String>,
    pub count: Option<usize>,
    pub last_updated: Option<String>,
    /// Element name and accepted values
    pub elements: Vec<(String, Vec<String>)>,
}

impl SearchParams {
    pub fn parse(query: &[(String, String)]) -> Result<Self> {
        let mut params = SearchParams::default();

        for (name, value) in query {
            if name.contains(':') {
                return Err(Error::Search(format!(
                    "Search modifiers are not supported: '{}'",
                    name
                )));
            }

            match name.as_str() {
                "_id" => params.ids.extend(split_values(value)),
                "_count" => {
                    let count = value.parse::<usize>().map_err(|_| {
                        Error::Search(format!("Invalid _count value '{}'", value))
                    })?;
                    params.count = Some(count);
                }
                "_lastUpdated" => {
                    let instant = value.strip_prefix("eq").unwrap_or(value);
                    if instant.is_empty() || !instant.starts_with(|c: char| c.is_ascii_digit()) {
                        return Err(Error::Search(format!(
                            "Only equality is supported for _lastUpdated, got '{}'",
                            value
                        )));
                    }
                    params.last_updated = Some(instant.to_string());
                }
                n if IGNORED_PARAMS.contains(&n) => {}
                n if n.starts_with('_') => {
                    return Err(Error::Search(format!(
                        "Unknown search parameter '{}'",
                        n
                    )));
                }
                n => params.elements.push((n.to_string(), split_values(value))),
            }
        }

        Ok(params)
    }

    pub fn matches(&self, resource: &Resource) -> bool {
        if !self.ids.is_empty() && !self.ids.iter().any(|id| id == &resource.id) {
            return false;
        }

        if let Some(instant) = &self.last_updated {
            if !format_instant(resource.last_updated).starts_with(instant.as_str()) {
                return false;
            }
        }

        self.elements.iter().all(|(name, values)| {
            resource
                .resource
                .get(name)
                .map(|element| element_matches(element, values))
                .unwrap_or(false)
        })
    }

    /// Filter `candidates` and apply `_count`. `total` counts all matches.
    pub fn apply(&self, candidates: Vec<Resource>) -> SearchResult {
        let mut resources: Vec<Resource> =
            candidates.into_iter().filter(|r| self.matches(r)).collect();
        let total = resources.len();
        if let Some(count) = self.count {
            resources.truncate(count);
        }
        SearchResult { resources, total }
    }
}

/// History query: `_count` and `_since`.
#[derive(Debug, Clone, Default)]
pub struct HistoryParams {
    pub count: Option<usize>,
    pub since: Option<DateTime<Utc>>,
}

impl HistoryParams {
    pub fn parse(query: &[(String, String)]) -> Result<Self> {
        let mut params = HistoryParams::default();
        for (name, value) in query {
            match name.as_str() {
                "_count" => {
                    params.count = Some(value.parse::<usize>().map_err(|_| {
                        Error::Search(format!("Invalid _count value '{}'", value))
                    })?);
                }
                "_since" => {
                    let since = DateTime::parse_from_rfc3339(value).map_err(|e| {
                        Error::Search(format!("Invalid _since value '{}': {}", value, e))
                    })?;
                    params.since = Some(since.with_timezone(&Utc));
                }
                n if IGNORED_PARAMS.contains(&n) => {}
                n => {
                    return Err(Error::Search(format!(
                        "Unknown history parameter '{}'",
                        n
                    )))
                }
            }
        }
        Ok(params)
    }

    pub fn apply(&self, versions: Vec<Resource>) -> Vec<Resource> {
        let mut out: Vec<Resource> = versions
            .into_iter()
            .filter(|r| self.since.map_or(true, |since| r.last_updated >= since))
            .collect();
        if let Some(count) = self.count {
            out.truncate(count);
        }
        out
    }
}

/// True when any `reference` inside `resource` points at `target` (`Type/id`).
pub fn references_target(resource: &JsonValue, target: &str) -> bool {
    match resource {
        JsonValue::Object(map) => map.iter().any(|(key, value)| match value {
            JsonValue::String(s) if key == "reference" => {
                s == target || s.ends_with(&format!("/{}", target))
            }
            other => references_target(other, target),
        }),
        JsonValue::Array(items) => items.iter().any(|v| references_target(v, target)),
        _ => false,
    }
}

fn split_values(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

fn element_matches(element: &JsonValue, values: &[String]) -> bool {
    match element {
        JsonValue::Array(items) => items.iter().any(|item| element_matches(item, values)),
        JsonValue::String(s) => values.iter().any(|v| v.eq_ignore_ascii_case(s)),
        JsonValue::Bool(b) => values.iter().any(|v| v == &b.to_string()),
        JsonValue::Number(n) => values.iter().any(|v| v == &n.to_string()),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pairs(raw: &[(&str, &str)]) -> Vec<(String, String)> {
        raw.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn resource(id: &str, body: JsonValue) -> Resource {
        Resource {
            id: id.into(),
            resource_type: "Patient".into(),
            version_id: 1,
            resource: body,
            last_updated: Utc::now(),
            deleted: false,
        }
    }

    #[test]
    fn test_unknown_underscore_param_rejected() {
        let err = SearchParams::parse(&pairs(&[("_foo", "bar")])).unwrap_err();
        assert!(matches!(err, Error::Search(_)));
        assert!(SearchParams::parse(&pairs(&[("name:exact", "x")])).is_err());
        assert!(SearchParams::parse(&pairs(&[("_lastUpdated", "gt2020")])).is_err());
        assert!(SearchParams::parse(&pairs(&[("_format", "json")])).is_ok());
    }

    #[test]
    fn test_element_and_id_matching() {
        let params =
            SearchParams::parse(&pairs(&[("gender", "female,other"), ("_count", "1")])).unwrap();
        let result = params.apply(vec![
            resource("a", json!({"gender": "female"})),
            resource("b", json!({"gender": "male"})),
            resource("c", json!({"gender": "other"})),
        ]);
        assert_eq!(result.total, 2);
        assert_eq!(result.resources.len(), 1);
        assert_eq!(result.resources[0].id, "a");

        let params = SearchParams::parse(&pairs(&[("_id", "b")])).unwrap();
        assert!(params.matches(&resource("b", json!({}))));
        assert!(!params.matches(&resource("a", json!({}))));
    }

    #[test]
    fn test_references_target() {
        let obs = json!({
            "subject": {"reference": "Patient/p1"},
            "performer": [{"reference": "http://example.org/fhir/Practitioner/x"}]
        });
        assert!(references_target(&obs, "Patient/p1"));
        assert!(references_target(&obs, "Practitioner/x"));
        assert!(!references_target(&obs, "Patient/p2"));
    }

    #[test]
    fn test_history_since() {
        let params = HistoryParams::parse(&pairs(&[("_since", "2999-01-01T00:00:00Z")])).unwrap();
        assert!(params.apply(vec![resource("a", json!({}))]).is_empty());
        assert!(HistoryParams::parse(&pairs(&[("_foo", "1")])).is_err());
    }
}

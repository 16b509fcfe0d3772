//! Bundle-local identifiers and reference rewriting
//!
//! A reference is local when it is a `urn:uuid:`/`urn:oid:` URI or equals a
//! `fullUrl` declared somewhere in the bundle. Local references must resolve
//! through the map before a resource is persisted; anything else is left as
//! written.

use serde_json::Value as JsonValue;
use std::collections::{hash_map::Entry, HashMap, HashSet};

use crate::{Error, Result};

#[derive(Debug, Default)]
pub struct LocalReferenceMap {
    resolved: HashMap<String, String>,
    declared: HashSet<String>,
}

impl LocalReferenceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a `fullUrl` seen in the bundle, resolved or not.
    pub fn declare(&mut self, full_url: impl Into<String>) {
        self.declared.insert(full_url.into());
    }

    /// Map `local` to `Type/id`. The first registration wins; later ones return `false`.
    pub fn register(&mut self, local: impl Into<String>, target: impl Into<String>) -> bool {
        let local = local.into();
        self.declared.insert(local.clone());
        match self.resolved.entry(local) {
            Entry::Occupied(existing) => {
                tracing::debug!(
                    local_id = %existing.key(),
                    mapped_to = %existing.get(),
                    "Local identifier already mapped, keeping first registration"
                );
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(target.into());
                true
            }
        }
    }

    pub fn resolve(&self, local: &str) -> Option<&str> {
        self.resolved.get(local).map(String::as_str)
    }

    pub fn is_mapped(&self, local: &str) -> bool {
        self.resolved.contains_key(local)
    }

    pub fn is_local(&self, reference: &str) -> bool {
        reference.starts_with("urn:uuid:")
            || reference.starts_with("urn:oid:")
            || self.declared.contains(reference)
    }

    pub fn len(&self) -> usize {
        self.resolved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty()
    }

    /// Rewrite every local reference in `resource`. Returns how many values changed.
    ///
    /// Only `reference` elements and attachment `url`s are touched. A local
    /// `reference` that is not mapped fails with `UnresolvedReference`; a `url`
    /// is rewritten on an exact (fragment-aware) match and otherwise left alone.
    pub fn rewrite_references(&self, resource: &mut JsonValue) -> Result<usize> {
        self.rewrite_element(None, resource)
    }

    /// Rewrite `value` as if it were the element named `key`.
    pub fn rewrite_element(&self, key: Option<&str>, value: &mut JsonValue) -> Result<usize> {
        let mut rewritten = 0;
        self.rewrite_value(value, key, &mut rewritten)?;
        Ok(rewritten)
    }

    fn rewrite_value(
        &self,
        value: &mut JsonValue,
        key: Option<&str>,
        rewritten: &mut usize,
    ) -> Result<()> {
        match value {
            JsonValue::Object(map) => {
                for (child_key, child) in map.iter_mut() {
                    self.rewrite_value(child, Some(child_key.as_str()), rewritten)?;
                }
            }
            JsonValue::Array(items) => {
                for item in items.iter_mut() {
                    self.rewrite_value(item, key, rewritten)?;
                }
            }
            JsonValue::String(s) => match key {
                Some("reference") => {
                    if let Some(updated) = self.rewrite_string(s) {
                        *s = updated;
                        *rewritten += 1;
                    } else {
                        let (base, _) = split_fragment(s);
                        if !base.is_empty() && self.is_local(base) {
                            return Err(Error::UnresolvedReference(base.to_string()));
                        }
                    }
                }
                Some("url") => {
                    if let Some(updated) = self.rewrite_string(s) {
                        *s = updated;
                        *rewritten += 1;
                    }
                }
                _ => {}
            },
            _ => {}
        }
        Ok(())
    }

    fn rewrite_string(&self, input: &str) -> Option<String> {
        if self.resolved.is_empty() {
            return None;
        }
        if let Some(target) = self.resolved.get(input) {
            return Some(target.clone());
        }
        let (base, fragment) = split_fragment(input);
        match (self.resolved.get(base), fragment) {
            (Some(target), Some(fragment)) => Some(format!("{}#{}", target, fragment)),
            _ => None,
        }
    }
}

fn split_fragment(input: &str) -> (&str, Option<&str>) {
    match input.split_once('#') {
        Some((base, fragment)) => (base, Some(fragment)),
        None => (input, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const PATIENT_URN: &str = "urn:uuid:61ebe359-bfdc-4613-8bf2-c5e300945f0a";

    #[test]
    fn test_first_registration_wins() {
        let mut refs = LocalReferenceMap::new();
        assert!(refs.register(PATIENT_URN, "Patient/a"));
        assert!(!refs.register(PATIENT_URN, "Patient/b"));
        assert_eq!(refs.resolve(PATIENT_URN), Some("Patient/a"));
        assert_eq!(refs.len(), 1);
    }

    #[test]
    fn test_rewrites_nested_references_and_fragments() {
        let mut refs = LocalReferenceMap::new();
        refs.register(PATIENT_URN, "Patient/p1");

        let mut obs = json!({
            "resourceType": "Observation",
            "subject": {"reference": PATIENT_URN},
            "performer": [{"reference": format!("{}#practitioner", PATIENT_URN)}],
            "derivedFrom": [{"reference": "Observation/existing"}]
        });

        let count = refs.rewrite_references(&mut obs).unwrap();
        assert_eq!(count, 2);
        assert_eq!(obs["subject"]["reference"], "Patient/p1");
        assert_eq!(obs["performer"][0]["reference"], "Patient/p1#practitioner");
        assert_eq!(obs["derivedFrom"][0]["reference"], "Observation/existing");
    }

    #[test]
    fn test_unmapped_local_reference_fails() {
        let refs = LocalReferenceMap::new();
        let mut obs = json!({
            "resourceType": "Observation",
            "subject": {"reference": "urn:uuid:does-not-exist"}
        });

        let err = refs.rewrite_references(&mut obs).unwrap_err();
        assert!(matches!(err, Error::UnresolvedReference(ref r) if r == "urn:uuid:does-not-exist"));
    }

    #[test]
    fn test_declared_full_url_is_local() {
        let mut refs = LocalReferenceMap::new();
        refs.declare("http://example.org/fhir/Patient/abc");
        let mut obs = json!({"subject": {"reference": "http://example.org/fhir/Patient/abc"}});
        assert!(refs.rewrite_references(&mut obs).is_err());

        let mut external = json!({"subject": {"reference": "http://other.org/fhir/Patient/abc"}});
        assert_eq!(refs.rewrite_references(&mut external).unwrap(), 0);
    }

    #[test]
    fn test_only_reference_and_url_elements_are_rewritten() -> anyhow::Result<()> {
        let mut refs = LocalReferenceMap::new();
        refs.register(PATIENT_URN, "Patient/p1");

        let mut patient = json!({
            "resourceType": "Patient",
            "identifier": [{"system": "urn:ietf:rfc:3986", "value": PATIENT_URN}],
            "photo": [{"url": PATIENT_URN}],
            "link": [{"other": {"reference": PATIENT_URN}}]
        });

        assert_eq!(refs.rewrite_references(&mut patient)?, 2);
        assert_eq!(patient["identifier"][0]["value"], PATIENT_URN);
        assert_eq!(patient["photo"][0]["url"], "Patient/p1");
        assert_eq!(patient["link"][0]["other"]["reference"], "Patient/p1");
        Ok(())
    }

    #[test]
    fn test_unmapped_url_is_left_alone() -> anyhow::Result<()> {
        let refs = LocalReferenceMap::new();
        let mut media = json!({"content": {"url": "urn:uuid:somewhere-else"}});
        assert_eq!(refs.rewrite_references(&mut media)?, 0);
        assert_eq!(media["content"]["url"], "urn:uuid:somewhere-else");
        Ok(())
    }

    #[test]
    fn test_rewrite_element_uses_given_name() -> anyhow::Result<()> {
        let mut refs = LocalReferenceMap::new();
        refs.register(PATIENT_URN, "Patient/p1");
        let mut value = json!(PATIENT_URN);
        assert_eq!(refs.rewrite_element(Some("reference"), &mut value)?, 1);
        assert_eq!(value, "Patient/p1");

        let mut untouched = json!(PATIENT_URN);
        assert_eq!(refs.rewrite_element(Some("value"), &mut untouched)?, 0);
        Ok(())
    }

    #[test]
    fn test_contained_references_untouched() {
        let refs = LocalReferenceMap::new();
        let mut obs = json!({"subject": {"reference": "#p1"}});
        assert_eq!(refs.rewrite_references(&mut obs).unwrap(), 0);
        assert_eq!(obs["subject"]["reference"], "#p1");
    }
}

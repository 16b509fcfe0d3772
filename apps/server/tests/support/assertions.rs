use anyhow::Context as _;
use axum::http::StatusCode;
use serde_json::Value;

/// Assert that a Bundle has a specific type
pub fn assert_bundle_type<'a>(bundle: &'a Value, bundle_type: &str) -> anyhow::Result<&'a Value> {
    assert_eq!(
        bundle.get("resourceType").and_then(|v| v.as_str()),
        Some("Bundle"),
        "expected Bundle resource type"
    );
    assert_eq!(
        bundle.get("type").and_then(|v| v.as_str()),
        Some(bundle_type),
        "expected Bundle.type = {bundle_type}"
    );
    Ok(bundle)
}

/// Get Bundle entries as array
pub fn get_bundle_entries(bundle: &Value) -> anyhow::Result<&Vec<Value>> {
    bundle
        .get("entry")
        .and_then(|v| v.as_array())
        .context("Bundle.entry is array")
}

/// Leading status code of `entry.response.status`, e.g. `"201"`
pub fn entry_status(entry: &Value) -> anyhow::Result<&str> {
    let status = entry
        .pointer("/response/status")
        .and_then(|v| v.as_str())
        .context("entry has response.status")?;
    Ok(status.split_whitespace().next().unwrap_or(""))
}

/// Assert that a resource has a specific ID
pub fn assert_resource_id(resource: &Value, expected_id: &str) -> anyhow::Result<()> {
    let id = resource
        .get("id")
        .and_then(|v| v.as_str())
        .context("resource has id")?;
    assert_eq!(id, expected_id, "expected resource id = {expected_id}");
    Ok(())
}

/// Assert that a resource has a specific version ID
pub fn assert_version_id(resource: &Value, expected_version: &str) -> anyhow::Result<()> {
    let version = resource
        .get("meta")
        .and_then(|m| m.get("versionId"))
        .and_then(|v| v.as_str())
        .context("resource has meta.versionId")?;
    assert_eq!(
        version, expected_version,
        "expected meta.versionId = {expected_version}"
    );
    Ok(())
}

/// Assert status code matches expected
pub fn assert_status(actual: StatusCode, expected: StatusCode, context: &str) {
    assert_eq!(
        actual, expected,
        "{context}: expected status {expected}, got {actual}"
    );
}

/// Issue codes of an OperationOutcome, in order
pub fn issue_codes(outcome: &Value) -> Vec<String> {
    outcome
        .get("issue")
        .and_then(|v| v.as_array())
        .map(|issues| {
            issues
                .iter()
                .filter_map(|i| i.get("code").and_then(|c| c.as_str()))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

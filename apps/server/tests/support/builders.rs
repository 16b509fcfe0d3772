use axum::body::Bytes;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Value};

/// Converts a JSON value to request body bytes
pub fn to_json_body(value: &Value) -> anyhow::Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

/// Builder for batch and transaction bundles
pub struct BundleBuilder {
    bundle_type: &'static str,
    entries: Vec<Value>,
}

impl BundleBuilder {
    pub fn transaction() -> Self {
        Self {
            bundle_type: "transaction",
            entries: Vec::new(),
        }
    }

    pub fn batch() -> Self {
        Self {
            bundle_type: "batch",
            entries: Vec::new(),
        }
    }

    pub fn post(mut self, full_url: Option<&str>, url: &str, resource: Value) -> Self {
        let mut entry = json!({
            "resource": resource,
            "request": {"method": "POST", "url": url}
        });
        if let Some(full_url) = full_url {
            entry["fullUrl"] = json!(full_url);
        }
        self.entries.push(entry);
        self
    }

    pub fn conditional_post(mut self, url: &str, if_none_exist: &str, resource: Value) -> Self {
        self.entries.push(json!({
            "resource": resource,
            "request": {"method": "POST", "url": url, "ifNoneExist": if_none_exist}
        }));
        self
    }

    pub fn put(mut self, url: &str, resource: Value) -> Self {
        self.entries.push(json!({
            "resource": resource,
            "request": {"method": "PUT", "url": url}
        }));
        self
    }

    pub fn put_if_match(mut self, url: &str, if_match: &str, resource: Value) -> Self {
        self.entries.push(json!({
            "resource": resource,
            "request": {"method": "PUT", "url": url, "ifMatch": if_match}
        }));
        self
    }

    /// PATCH carrying a JSON Patch document in a Binary
    pub fn json_patch(mut self, url: &str, operations: Value) -> anyhow::Result<Self> {
        let data = STANDARD.encode(serde_json::to_vec(&operations)?);
        self.entries.push(json!({
            "resource": {
                "resourceType": "Binary",
                "contentType": "application/json-patch+json",
                "data": data
            },
            "request": {"method": "PATCH", "url": url}
        }));
        Ok(self)
    }

    pub fn get(mut self, url: &str) -> Self {
        self.entries.push(json!({"request": {"method": "GET", "url": url}}));
        self
    }

    pub fn delete(mut self, url: &str) -> Self {
        self.entries
            .push(json!({"request": {"method": "DELETE", "url": url}}));
        self
    }

    pub fn build(self) -> Value {
        json!({
            "resourceType": "Bundle",
            "type": self.bundle_type,
            "entry": self.entries
        })
    }
}

pub fn patient(family: &str) -> Value {
    json!({
        "resourceType": "Patient",
        "active": true,
        "gender": "female",
        "name": [{"family": family}]
    })
}

pub fn observation_for(subject: &str) -> Value {
    json!({
        "resourceType": "Observation",
        "status": "final",
        "code": {"text": "heart rate"},
        "subject": {"reference": subject}
    })
}

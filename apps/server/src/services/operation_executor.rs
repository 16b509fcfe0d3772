use crate::db::InMemoryResourceStore;
use crate::error::{Error, Result};
use crate::models::{OperationContext, OperationRequest, OperationResult, Parameters};
use async_trait::async_trait;
use serde_json::{json, Map, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;

pub const FHIR_VERSION: &str = "4.0";

#[async_trait]
pub trait Operation: Send + Sync {
    async fn execute(&self, request: OperationRequest) -> Result<OperationResult>;
}

/// Dispatches `$operation` invocations by name
pub struct OperationExecutor {
    store: InMemoryResourceStore,
    custom: HashMap<String, Arc<dyn Operation>>,
}

impl OperationExecutor {
    pub fn new(store: InMemoryResourceStore) -> Self {
        Self {
            store,
            custom: HashMap::new(),
        }
    }

    /// Register an operation under `name` (without `$`). Replaces built-ins of the same name.
    pub fn register(&mut self, name: impl Into<String>, operation: Arc<dyn Operation>) {
        self.custom.insert(name.into(), operation);
    }

    pub async fn execute(&self, request: OperationRequest) -> Result<OperationResult> {
        if let Some(operation) = self.custom.get(&request.operation_name) {
            return operation.execute(request).await;
        }

        match request.operation_name.as_str() {
            "meta" => self.execute_meta(request).await,
            "versions" => self.execute_versions(request),
            _ => Err(Error::NotImplemented(format!(
                "Operation '{}' not yet implemented",
                request.operation_name
            ))),
        }
    }

    /// $meta - meta of one resource, or the union of tags, profiles and
    /// security labels across a type or the whole system
    async fn execute_meta(&self, request: OperationRequest) -> Result<OperationResult> {
        let meta = match &request.context {
            OperationContext::Instance(resource_type, id) => {
                let stored = match request.version_id {
                    Some(version_id) => self
                        .store
                        .read_version(None, resource_type, id, version_id)
                        .await
                        .ok_or_else(|| Error::VersionNotFound {
                            resource_type: resource_type.clone(),
                            id: id.clone(),
                            version_id,
                        })?,
                    None => self.store.read_latest(None, resource_type, id).await.ok_or_else(|| {
                        Error::ResourceNotFound {
                            resource_type: resource_type.clone(),
                            id: id.clone(),
                        }
                    })?,
                };
                if stored.deleted {
                    return Err(Error::ResourceDeleted {
                        resource_type: resource_type.clone(),
                        id: id.clone(),
                        version_id: Some(stored.version_id),
                    });
                }
                stored.resource.get("meta").cloned().unwrap_or_else(|| json!({}))
            }
            context => {
                let resources = self.store.current(None, context.resource_type()).await;
                merge_meta(resources.iter().filter_map(|r| r.resource.get("meta")))
            }
        };

        let mut response = Parameters::new();
        response.add_value("return".to_string(), "valueMeta", meta);
        Ok(OperationResult::Parameters(response))
    }

    /// $versions - FHIR versions supported by this server
    fn execute_versions(&self, request: OperationRequest) -> Result<OperationResult> {
        if !matches!(request.context, OperationContext::System) {
            return Err(Error::InvalidResource(
                "$versions can only be invoked at system level".to_string(),
            ));
        }

        let mut response = Parameters::new();
        response.add_value("version".to_string(), "valueCode", json!(FHIR_VERSION));
        response.add_value("default".to_string(), "valueCode", json!(FHIR_VERSION));
        Ok(OperationResult::Parameters(response))
    }
}

fn merge_meta<'a>(metas: impl Iterator<Item = &'a JsonValue>) -> JsonValue {
    let mut merged = Map::new();
    for meta in metas {
        for field in ["profile", "tag", "security"] {
            let Some(values) = meta.get(field).and_then(|v| v.as_array()) else {
                continue;
            };
            let target = merged
                .entry(field.to_string())
                .or_insert_with(|| JsonValue::Array(Vec::new()));
            if let Some(target) = target.as_array_mut() {
                for value in values {
                    if !target.contains(value) {
                        target.push(value.clone());
                    }
                }
            }
        }
    }
    JsonValue::Object(merged)
}

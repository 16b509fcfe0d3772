use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// Operation context (where the operation is invoked)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationContext {
    System,
    Type(String),
    Instance(String, String),
}

impl OperationContext {
    pub fn resource_type(&self) -> Option<&str> {
        match self {
            OperationContext::System => None,
            OperationContext::Type(rt) | OperationContext::Instance(rt, _) => Some(rt),
        }
    }
}

/// Operation invocation request
#[derive(Debug)]
pub struct OperationRequest {
    pub operation_name: String,
    pub context: OperationContext,
    /// Version for instance operations on `Type/id/_history/vid/$op`
    pub version_id: Option<i32>,
    pub parameters: Parameters,
}

/// FHIR Parameters resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameters {
    #[serde(rename = "resourceType")]
    pub resource_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameter: Option<Vec<Parameter>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(flatten)]
    pub value: ParameterValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Resource {
        resource: JsonValue,
    },
    /// FHIR JSON "value[x]" parameter content, e.g. `{ "valueString": "..." }`
    Value(HashMap<String, JsonValue>),
}

impl Parameters {
    pub fn new() -> Self {
        Self {
            resource_type: "Parameters".to_string(),
            parameter: None,
        }
    }

    /// Build from query pairs, each becoming a `valueString` parameter.
    pub fn from_query(query: &[(String, String)]) -> Self {
        let mut params = Self::new();
        for (name, value) in query {
            params.add_value(name.clone(), "valueString", JsonValue::String(value.clone()));
        }
        params
    }

    /// Parse a request body: a Parameters resource, or any other resource
    /// passed as the single `resource` input.
    pub fn from_body(body: &JsonValue) -> Self {
        if body.get("resourceType").and_then(|v| v.as_str()) == Some("Parameters") {
            if let Ok(params) = serde_json::from_value(body.clone()) {
                return params;
            }
        }
        let mut params = Self::new();
        params.add_resource("resource".to_string(), body.clone());
        params
    }

    pub fn add_value(&mut self, name: String, value_type: &str, value: JsonValue) {
        let param = Parameter {
            name,
            value: ParameterValue::Value(HashMap::from([(value_type.to_string(), value)])),
        };
        self.parameter.get_or_insert_with(Vec::new).push(param);
    }

    pub fn add_resource(&mut self, name: String, resource: JsonValue) {
        let param = Parameter {
            name,
            value: ParameterValue::Resource { resource },
        };
        self.parameter.get_or_insert_with(Vec::new).push(param);
    }

    pub fn merge(&mut self, other: Parameters) {
        if let Some(params) = other.parameter {
            self.parameter.get_or_insert_with(Vec::new).extend(params);
        }
    }

    pub fn get_parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameter.as_ref()?.iter().find(|p| p.name == name)
    }

    pub fn get_value(&self, name: &str) -> Option<&JsonValue> {
        match &self.get_parameter(name)?.value {
            ParameterValue::Value(map) if map.len() == 1 => map.values().next(),
            _ => None,
        }
    }
}

impl Default for Parameters {
    fn default() -> Self {
        Self::new()
    }
}

/// Operation execution result
#[derive(Debug)]
pub enum OperationResult {
    Resource(JsonValue),
    Parameters(Parameters),
    NoContent,
}

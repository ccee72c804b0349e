//! API schema normalization.
//!
//! The `/info` document is loosely typed: each parameter carries a JSON-schema
//! fragment, a component name and free-text description. [`normalize`] turns
//! it into an [`ApiInfo`] whose parameter types come from a small closed set.

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::types::EndpointRef;

const FILE_DATA_SHAPE: &str =
    "{ name: string; data: string; size?: number; is_file?: boolean; orig_name?: string }";

// ---------------------------------------------------------------------------
// Raw (server-declared) schema
// ---------------------------------------------------------------------------

/// Schema document as served by the app.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawApiInfo {
    #[serde(default)]
    pub named_endpoints: BTreeMap<String, RawEndpoint>,
    #[serde(default)]
    pub unnamed_endpoints: BTreeMap<String, RawEndpoint>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawEndpoint {
    #[serde(default)]
    pub parameters: Vec<RawParameter>,
    #[serde(default)]
    pub returns: Vec<RawParameter>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawParameter {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub component: Option<String>,
    /// JSON-schema fragment describing the value.
    #[serde(rename = "type", default)]
    pub type_decl: Value,
    #[serde(default)]
    pub example_input: Option<Value>,
}

impl RawApiInfo {
    /// Parse an `/info` response body, unwrapping a top-level `api` key if present.
    pub fn from_document(document: Value) -> Result<Self, serde_json::Error> {
        let document = match document {
            Value::Object(mut map) if map.contains_key("api") => {
                map.remove("api").unwrap_or(Value::Null)
            }
            other => other,
        };
        serde_json::from_value(document)
    }
}

// ---------------------------------------------------------------------------
// Client-facing schema
// ---------------------------------------------------------------------------

/// Resolved parameter type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiType {
    String,
    Boolean,
    Number,
    StringArray,
    Any,
    /// A file handle or a collection of file handles.
    FileData,
    /// Type could not be expressed; rendered as an empty string.
    Unsupported,
}

impl fmt::Display for ApiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiType::String => write!(f, "string"),
            ApiType::Boolean => write!(f, "boolean"),
            ApiType::Number => write!(f, "number"),
            ApiType::StringArray => write!(f, "string[]"),
            ApiType::Any => write!(f, "any"),
            ApiType::FileData => write!(f, "{FILE_DATA_SHAPE} | Array<{FILE_DATA_SHAPE}>"),
            ApiType::Unsupported => Ok(()),
        }
    }
}

impl Serialize for ApiType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterInfo {
    pub label: String,
    pub component: String,
    #[serde(rename = "type")]
    pub api_type: ApiType,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub example: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EndpointSchema {
    pub parameters: Vec<ParameterInfo>,
    pub returns: Vec<ParameterInfo>,
}

impl EndpointSchema {
    /// Component name declared for the argument at `index`.
    pub fn component_at(&self, index: usize) -> Option<&str> {
        self.parameters
            .get(index)
            .map(|p| p.component.as_str())
            .filter(|c| !c.is_empty())
    }
}

/// Normalized schema exposed through `view_api`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ApiInfo {
    pub named_endpoints: BTreeMap<String, EndpointSchema>,
    pub unnamed_endpoints: BTreeMap<String, EndpointSchema>,
}

impl ApiInfo {
    /// Look up an endpoint by name (leading slash optional) or index.
    pub fn endpoint(&self, endpoint: &EndpointRef) -> Option<&EndpointSchema> {
        match endpoint {
            EndpointRef::Name(_) => {
                let key = format!("/{}", endpoint.trimmed_name().unwrap_or_default());
                self.named_endpoints.get(&key)
            }
            EndpointRef::Index(i) => self.unnamed_endpoints.get(&i.to_string()),
        }
    }
}

/// Resolve a parameter's type from its schema fragment and component.
pub fn resolve_type(type_decl: &Value, component: Option<&str>) -> ApiType {
    match type_decl.get("type").and_then(Value::as_str) {
        Some("string") => return ApiType::String,
        Some("boolean") => return ApiType::Boolean,
        Some("number") => return ApiType::Number,
        _ => {}
    }

    let description = describe(type_decl).to_lowercase();
    if description.contains("any valid value") || description.contains("any valid json") {
        return ApiType::Any;
    }

    if type_decl.get("type").and_then(Value::as_str) == Some("array")
        && type_decl
            .get("items")
            .and_then(|items| items.get("type"))
            .and_then(Value::as_str)
            == Some("string")
    {
        return ApiType::StringArray;
    }

    if component == Some("Image") {
        return ApiType::String;
    }

    if type_decl.get("anyOf").is_some() || type_decl.get("oneOf").is_some() {
        return ApiType::FileData;
    }

    ApiType::Unsupported
}

fn describe(type_decl: &Value) -> &str {
    type_decl
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or_default()
}

fn normalize_parameter(raw: &RawParameter) -> ParameterInfo {
    ParameterInfo {
        label: raw.label.clone().unwrap_or_default(),
        component: raw.component.clone().unwrap_or_default(),
        api_type: resolve_type(&raw.type_decl, raw.component.as_deref()),
        description: describe(&raw.type_decl).to_string(),
        example: raw.example_input.clone(),
    }
}

fn normalize_endpoint(raw: &RawEndpoint) -> EndpointSchema {
    let parameters: Vec<ParameterInfo> = raw.parameters.iter().map(normalize_parameter).collect();
    // Returns mirror the parameter list; the raw `returns` are not consulted.
    EndpointSchema {
        returns: parameters.clone(),
        parameters,
    }
}

/// Normalize a raw schema document. Never fails.
pub fn normalize(raw: &RawApiInfo) -> ApiInfo {
    let normalize_all = |endpoints: &BTreeMap<String, RawEndpoint>| {
        endpoints
            .iter()
            .map(|(key, endpoint)| (key.clone(), normalize_endpoint(endpoint)))
            .collect::<BTreeMap<_, _>>()
    };

    let mut api = ApiInfo {
        named_endpoints: normalize_all(&raw.named_endpoints),
        unnamed_endpoints: normalize_all(&raw.unnamed_endpoints),
    };

    if !api.unnamed_endpoints.contains_key("0")
        && let Some(predict) = api.named_endpoints.get("/predict").cloned()
    {
        api.unnamed_endpoints.insert("0".to_string(), predict);
    }

    api
}

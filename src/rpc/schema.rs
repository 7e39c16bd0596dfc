//! Tool parameter schemas (§3 `ToolDefinition.inputSchema`, §4.J parameter
//! validation).
//!
//! Grounded on the teacher's `serde_json::json!({"type": "object", ...})`
//! ad-hoc schema literals in `integration/mcp/tools.rs`, but per §9's
//! Design Note ("Runtime schema-shape inference... encode `inputSchema` as
//! an explicit record with typed fields; validation is a pure function
//! over it") those literals are replaced here with an explicit `InputSchema`
//! record so validation doesn't grovel through `serde_json::Value` at
//! request time.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.as_i64().is_some() || value.as_u64().is_some(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaProperty {
    #[serde(rename = "type")]
    pub param_type: ParamType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Present when `param_type` is `Array`; item schema recursed into for
    /// each array element (§4.J: "array items recurse").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<SchemaProperty>>,
}

impl SchemaProperty {
    pub fn new(param_type: ParamType) -> Self {
        Self {
            param_type,
            description: None,
            items: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_items(mut self, items: SchemaProperty) -> Self {
        self.items = Some(Box::new(items));
        self
    }
}

/// `{ type: "object", properties, required? }` (§3).
#[derive(Debug, Clone, Serialize, Default)]
pub struct InputSchema {
    pub properties: HashMap<String, SchemaProperty>,
    pub required: Vec<String>,
}

impl InputSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn property(mut self, name: impl Into<String>, property: SchemaProperty) -> Self {
        self.properties.insert(name.into(), property);
        self
    }

    pub fn require(mut self, names: &[&str]) -> Self {
        self.required = names.iter().map(|n| n.to_string()).collect();
        self
    }

    /// For the wire-facing `tools/list` descriptor, which needs the
    /// JSON-Schema-shaped object clients expect rather than our internal
    /// record.
    pub fn to_json_schema(&self) -> Value {
        let properties: serde_json::Map<String, Value> = self
            .properties
            .iter()
            .map(|(name, prop)| (name.clone(), property_to_json(prop)))
            .collect();
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": self.required,
        })
    }
}

fn property_to_json(prop: &SchemaProperty) -> Value {
    let mut obj = serde_json::Map::new();
    obj.insert("type".to_string(), Value::String(prop.param_type.as_str().to_string()));
    if let Some(description) = &prop.description {
        obj.insert("description".to_string(), Value::String(description.clone()));
    }
    if let Some(items) = &prop.items {
        obj.insert("items".to_string(), property_to_json(items));
    }
    Value::Object(obj)
}

/// §4.J parameter validation: required-name presence, then per-property
/// type checks (recursing into array items). Returns `Ok(())` or a
/// human-readable error message matching the two distinct messages
/// spec.md names for the two failure classes.
pub fn validate_params(schema: &InputSchema, params: &Value) -> Result<(), String> {
    let empty = serde_json::Map::new();
    let object = params.as_object().unwrap_or(&empty);

    let missing: Vec<&str> = schema
        .required
        .iter()
        .filter(|name| !object.contains_key(name.as_str()))
        .map(|name| name.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(format!("Missing required parameters: {}", missing.join(", ")));
    }

    let mut errors = Vec::new();
    for (name, property) in &schema.properties {
        if let Some(value) = object.get(name) {
            validate_property(name, property, value, &mut errors);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(format!("Parameter validation errors: {}", errors.join(", ")))
    }
}

fn validate_property(path: &str, property: &SchemaProperty, value: &Value, errors: &mut Vec<String>) {
    if !property.param_type.matches(value) {
        errors.push(format!("{} must be {}", path, property.param_type.as_str()));
        return;
    }
    if property.param_type == ParamType::Array {
        if let (Some(items_schema), Some(items)) = (&property.items, value.as_array()) {
            for (index, item) in items.iter().enumerate() {
                validate_property(&format!("{}[{}]", path, index), items_schema, item, errors);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_schema() -> InputSchema {
        InputSchema::new()
            .property("query", SchemaProperty::new(ParamType::String))
            .property("limit", SchemaProperty::new(ParamType::Integer))
            .property(
                "tags",
                SchemaProperty::new(ParamType::Array).with_items(SchemaProperty::new(ParamType::String)),
            )
            .require(&["query"])
    }

    #[test]
    fn missing_required_parameter_is_reported_by_name() {
        let schema = sample_schema();
        let err = validate_params(&schema, &json!({})).unwrap_err();
        assert!(err.contains("Missing required parameters"));
        assert!(err.contains("query"));
    }

    #[test]
    fn wrong_type_is_reported() {
        let schema = sample_schema();
        let err = validate_params(&schema, &json!({"query": "x", "limit": "not a number"})).unwrap_err();
        assert!(err.contains("Parameter validation errors"));
        assert!(err.contains("limit must be integer"));
    }

    #[test]
    fn array_items_recurse() {
        let schema = sample_schema();
        let err = validate_params(&schema, &json!({"query": "x", "tags": ["ok", 5]})).unwrap_err();
        assert!(err.contains("tags[1] must be string"));
    }

    #[test]
    fn valid_params_pass() {
        let schema = sample_schema();
        assert!(validate_params(&schema, &json!({"query": "x", "limit": 5, "tags": ["a"]})).is_ok());
    }
}

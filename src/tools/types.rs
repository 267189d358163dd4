//! Parameter schemas for tools.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{Result, TroupeError};

/// JSON Schema describing a tool's arguments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolParameters {
    pub schema: Value,
}

impl ToolParameters {
    pub fn from_schema(schema: Value) -> Self {
        Self { schema }
    }

    /// Schema of a tool that takes no arguments.
    pub fn empty() -> Self {
        Self::object().build()
    }

    pub fn object() -> ParameterBuilder {
        ParameterBuilder::default()
    }

    /// Check `args` against the top level of the schema: object shape,
    /// required fields and declared property types.
    pub fn validate(&self, args: &Value) -> Result<()> {
        let invalid = |message: String| Err(TroupeError::InvalidArgument(message));

        if self.schema.get("type").and_then(Value::as_str) == Some("object") && !args.is_object() {
            return invalid(format!("expected object arguments, got {}", type_name(args)));
        }
        let Some(fields) = args.as_object() else {
            return Ok(());
        };

        let required = self
            .schema
            .get("required")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str);
        for name in required {
            if !fields.contains_key(name) {
                return invalid(format!("missing required field '{name}'"));
            }
        }

        let Some(properties) = self.schema.get("properties").and_then(Value::as_object) else {
            return Ok(());
        };
        for (name, value) in fields {
            let expected = properties
                .get(name)
                .and_then(|property| property.get("type"))
                .and_then(Value::as_str);
            if let Some(expected) = expected {
                if !matches_type(value, expected) {
                    return invalid(format!(
                        "field '{name}' expected type '{expected}', got {}",
                        type_name(value)
                    ));
                }
            }
        }
        Ok(())
    }
}

fn matches_type(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Builder for object parameter schemas.
#[derive(Debug, Default)]
pub struct ParameterBuilder {
    properties: Map<String, Value>,
    required: Vec<String>,
}

impl ParameterBuilder {
    fn property(mut self, name: impl Into<String>, schema: Value, required: bool) -> Self {
        let name = name.into();
        if required {
            self.required.push(name.clone());
        }
        self.properties.insert(name, schema);
        self
    }

    pub fn string(self, name: impl Into<String>, description: impl Into<String>, required: bool) -> Self {
        let schema = json!({"type": "string", "description": description.into()});
        self.property(name, schema, required)
    }

    pub fn number(self, name: impl Into<String>, description: impl Into<String>, required: bool) -> Self {
        let schema = json!({"type": "number", "description": description.into()});
        self.property(name, schema, required)
    }

    pub fn integer(self, name: impl Into<String>, description: impl Into<String>, required: bool) -> Self {
        let schema = json!({"type": "integer", "description": description.into()});
        self.property(name, schema, required)
    }

    pub fn boolean(self, name: impl Into<String>, description: impl Into<String>, required: bool) -> Self {
        let schema = json!({"type": "boolean", "description": description.into()});
        self.property(name, schema, required)
    }

    pub fn string_enum(
        self,
        name: impl Into<String>,
        description: impl Into<String>,
        values: &[&str],
        required: bool,
    ) -> Self {
        let schema = json!({"type": "string", "description": description.into(), "enum": values});
        self.property(name, schema, required)
    }

    pub fn build(self) -> ToolParameters {
        ToolParameters {
            schema: json!({
                "type": "object",
                "properties": self.properties,
                "required": self.required,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ToolParameters {
        ToolParameters::object()
            .string("city", "City name", true)
            .integer("days", "Forecast length", false)
            .build()
    }

    #[test]
    fn accepts_well_formed_arguments() {
        params().validate(&json!({"city": "Oslo", "days": 3})).unwrap();
    }

    #[test]
    fn reports_missing_required_field() {
        let err = params().validate(&json!({"days": 3})).unwrap_err();
        assert!(err.to_string().contains("missing required field 'city'"));
    }

    #[test]
    fn reports_type_mismatch() {
        let err = params().validate(&json!({"city": "Oslo", "days": "three"})).unwrap_err();
        assert!(err.to_string().contains("'days' expected type 'integer'"));
    }

    #[test]
    fn rejects_non_object_arguments() {
        assert!(params().validate(&json!("Oslo")).is_err());
    }
}

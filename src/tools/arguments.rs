//! Typed access to function call arguments.

use serde_json::Value;

use crate::error::{Result, TroupeError};

/// Arguments of one function call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolArguments {
    value: Value,
}

fn missing(kind: &str, key: &str) -> TroupeError {
    TroupeError::InvalidArgument(format!("Missing {kind} argument: {key}"))
}

impl ToolArguments {
    pub fn new(value: Value) -> Self {
        Self { value }
    }

    pub fn raw(&self) -> &Value {
        &self.value
    }

    pub fn into_inner(self) -> Value {
        self.value
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.value.get(key)
    }

    pub fn get_str(&self, key: &str) -> Result<&str> {
        self.get_str_opt(key).ok_or_else(|| missing("string", key))
    }

    pub fn get_str_opt(&self, key: &str) -> Option<&str> {
        self.value.get(key).and_then(Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Result<i64> {
        self.value
            .get(key)
            .and_then(Value::as_i64)
            .ok_or_else(|| missing("integer", key))
    }

    pub fn get_f64(&self, key: &str) -> Result<f64> {
        self.value
            .get(key)
            .and_then(Value::as_f64)
            .ok_or_else(|| missing("number", key))
    }

    pub fn get_bool(&self, key: &str) -> Result<bool> {
        self.value
            .get(key)
            .and_then(Value::as_bool)
            .ok_or_else(|| missing("boolean", key))
    }

    /// Deserialize all arguments into `T`.
    pub fn deserialize<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.value.clone()).map_err(|err| {
            TroupeError::InvalidArgument(format!("Failed to deserialize arguments: {err}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[test]
    fn typed_getters() {
        let args = ToolArguments::new(json!({"name": "x", "n": 3, "ratio": 0.5, "on": true}));
        assert_eq!(args.get_str("name").unwrap(), "x");
        assert_eq!(args.get_i64("n").unwrap(), 3);
        assert_eq!(args.get_f64("ratio").unwrap(), 0.5);
        assert!(args.get_bool("on").unwrap());
        assert!(args.get_str("n").is_err());
        assert!(args.get_str_opt("missing").is_none());
    }

    #[test]
    fn deserializes_into_struct() {
        #[derive(Deserialize)]
        struct Query {
            city: String,
        }
        let args = ToolArguments::new(json!({"city": "Lima"}));
        assert_eq!(args.deserialize::<Query>().unwrap().city, "Lima");
    }
}

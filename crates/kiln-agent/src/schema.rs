//! Declared argument shapes for tools and their validation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fmt;

use crate::errors::ValidationError;

/// Validated tool arguments with defaults applied.
pub type Arguments = Map<String, Value>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ArgType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }

    pub fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.as_i64().is_some() || value.as_u64().is_some(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

impl fmt::Display for ArgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub arg_type: ArgType,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Ordered parameter declarations for one tool.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ArgumentSchema {
    params: Vec<ParamSpec>,
}

impl ArgumentSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: &str, arg_type: ArgType, description: &str) -> Self {
        self.params.push(ParamSpec {
            name: name.to_string(),
            arg_type,
            required: true,
            default: None,
            description: description.to_string(),
        });
        self
    }

    pub fn optional(mut self, name: &str, arg_type: ArgType, description: &str) -> Self {
        self.params.push(ParamSpec {
            name: name.to_string(),
            arg_type,
            required: false,
            default: None,
            description: description.to_string(),
        });
        self
    }

    pub fn optional_with_default(
        mut self,
        name: &str,
        arg_type: ArgType,
        default: Value,
        description: &str,
    ) -> Self {
        self.params.push(ParamSpec {
            name: name.to_string(),
            arg_type,
            required: false,
            default: Some(default),
            description: description.to_string(),
        });
        self
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|param| param.name == name)
    }

    /// Checks `arguments` against the declared parameters and returns them
    /// with defaults filled in for absent optional parameters.
    ///
    /// Keys not declared in the schema are rejected. The check is pure.
    pub fn validate(&self, arguments: &Value) -> Result<Arguments, ValidationError> {
        let empty = Map::new();
        let object = match arguments {
            Value::Object(object) => object,
            Value::Null => &empty,
            other => return Err(ValidationError::NotAnObject(json_type_name(other))),
        };

        for param in &self.params {
            match object.get(&param.name) {
                None if param.required => {
                    return Err(ValidationError::MissingArgument(param.name.clone()));
                }
                None => {}
                Some(value) if !param.arg_type.accepts(value) => {
                    return Err(ValidationError::TypeMismatch {
                        name: param.name.clone(),
                        expected: param.arg_type,
                        actual: json_type_name(value),
                    });
                }
                Some(_) => {}
            }
        }

        if let Some(unknown) = object.keys().find(|key| self.param(key).is_none()) {
            return Err(ValidationError::UnknownArgument(unknown.clone()));
        }

        let mut validated = object.clone();
        for param in &self.params {
            if let Some(default) = &param.default {
                validated
                    .entry(param.name.clone())
                    .or_insert_with(|| default.clone());
            }
        }
        Ok(validated)
    }

    /// JSON Schema rendering used in the model-facing tool catalog.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        for param in &self.params {
            let mut property = Map::new();
            property.insert("type".to_string(), json!(param.arg_type.as_str()));
            if !param.description.is_empty() {
                property.insert("description".to_string(), json!(param.description));
            }
            if let Some(default) = &param.default {
                property.insert("default".to_string(), default.clone());
            }
            properties.insert(param.name.clone(), Value::Object(property));
        }
        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|param| param.required)
            .map(|param| param.name.as_str())
            .collect();

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        })
    }
}

pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(number) if number.is_i64() || number.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logs_schema() -> ArgumentSchema {
        ArgumentSchema::new()
            .required("name", ArgType::String, "process name")
            .optional_with_default("lines", ArgType::Integer, json!(20), "lines to return")
            .optional("follow", ArgType::Boolean, "")
    }

    #[test]
    fn missing_required_argument_is_reported() {
        let error = logs_schema()
            .validate(&json!({"lines": 5}))
            .expect_err("name is required");
        assert_eq!(error, ValidationError::MissingArgument("name".to_string()));
    }

    #[test]
    fn type_mismatch_names_expected_and_actual_types() {
        let error = logs_schema()
            .validate(&json!({"name": "server", "lines": "ten"}))
            .expect_err("lines must be an integer");
        assert_eq!(
            error,
            ValidationError::TypeMismatch {
                name: "lines".to_string(),
                expected: ArgType::Integer,
                actual: "string",
            }
        );
    }

    #[test]
    fn unknown_argument_fails_closed() {
        let error = logs_schema()
            .validate(&json!({"name": "server", "tail": 3}))
            .expect_err("tail is not declared");
        assert_eq!(error, ValidationError::UnknownArgument("tail".to_string()));
    }

    #[test]
    fn defaults_fill_only_absent_optional_parameters() {
        let schema = logs_schema();
        let filled = schema.validate(&json!({"name": "server"})).expect("valid");
        assert_eq!(filled.get("lines"), Some(&json!(20)));
        assert!(!filled.contains_key("follow"));

        let explicit = schema
            .validate(&json!({"name": "server", "lines": 3}))
            .expect("valid");
        assert_eq!(explicit.get("lines"), Some(&json!(3)));
    }

    #[test]
    fn null_arguments_are_treated_as_empty_object() {
        let schema = ArgumentSchema::new().optional("path", ArgType::String, "");
        assert!(schema.validate(&Value::Null).expect("valid").is_empty());
        assert_eq!(
            schema.validate(&json!([1])).expect_err("array"),
            ValidationError::NotAnObject("array")
        );
    }

    #[test]
    fn integer_accepts_whole_numbers_only() {
        assert!(ArgType::Integer.accepts(&json!(3)));
        assert!(!ArgType::Integer.accepts(&json!(3.5)));
        assert!(ArgType::Number.accepts(&json!(3.5)));
    }

    #[test]
    fn json_schema_lists_required_parameters_and_closes_additional_properties() {
        let rendered = logs_schema().to_json_schema();
        assert_eq!(rendered["required"], json!(["name"]));
        assert_eq!(rendered["additionalProperties"], json!(false));
        assert_eq!(rendered["properties"]["lines"]["default"], json!(20));
    }
}

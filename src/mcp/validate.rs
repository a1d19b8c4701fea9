//! Argument validation for model-issued tool calls.
//!
//! Model output is untrusted; every argument set is checked against the
//! owning tool's input schema before any network interaction. Unexpected
//! fields are tolerated unless the schema itself forbids them.

use crate::mcp::error::ToolCallError;
use serde_json::{Map, Value};

const MAX_REPORTED_SCHEMA_ERRORS: usize = 3;

/// Compiles a tool's advertised input schema.
///
/// Schemas come from the server and are untrusted; a schema that fails to
/// compile disqualifies the tool from registration.
pub fn compile_schema(schema: &Value) -> Result<jsonschema::Validator, String> {
    if !schema.is_object() {
        return Err("input schema must be a JSON object".to_string());
    }
    jsonschema::validator_for(schema).map_err(|err| err.to_string())
}

/// Checks a call's arguments against a compiled schema.
///
/// Arguments must be a JSON object; an absent argument set is validated as
/// an empty object, which satisfies schemas with no required fields.
pub fn validate_arguments(
    validator: &jsonschema::Validator,
    arguments: Option<&Map<String, Value>>,
) -> Result<(), ToolCallError> {
    let empty = Map::new();
    let instance = Value::Object(arguments.unwrap_or(&empty).clone());

    let mut messages: Vec<String> = Vec::new();
    for error in validator.iter_errors(&instance) {
        if messages.len() == MAX_REPORTED_SCHEMA_ERRORS {
            messages.push("...".to_string());
            break;
        }
        messages.push(error.to_string());
    }

    if messages.is_empty() {
        Ok(())
    } else {
        Err(ToolCallError::invalid_arguments(format!(
            "Arguments do not match the tool's input schema: {}",
            messages.join("; ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::error::ToolErrorKind;
    use serde_json::json;

    fn compile(schema: Value) -> jsonschema::Validator {
        compile_schema(&schema).expect("schema should compile")
    }

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().expect("object expected").clone()
    }

    #[test]
    fn non_object_schemas_are_rejected() {
        assert!(compile_schema(&json!("string")).is_err());
        assert!(compile_schema(&json!([1, 2])).is_err());
    }

    #[test]
    fn conforming_arguments_pass() {
        let validator = compile(json!({
            "type": "object",
            "properties": {"query": {"type": "string"}},
            "required": ["query"]
        }));
        let args = object(json!({"query": "rust"}));
        assert!(validate_arguments(&validator, Some(&args)).is_ok());
    }

    #[test]
    fn missing_required_field_fails() {
        let validator = compile(json!({
            "type": "object",
            "properties": {"query": {"type": "string"}},
            "required": ["query"]
        }));
        let args = object(json!({}));
        let err = validate_arguments(&validator, Some(&args)).expect_err("expected failure");
        assert_eq!(err.kind, ToolErrorKind::InvalidArguments);
    }

    #[test]
    fn wrong_type_fails() {
        let validator = compile(json!({
            "type": "object",
            "properties": {"count": {"type": "integer"}}
        }));
        let args = object(json!({"count": "three"}));
        assert!(validate_arguments(&validator, Some(&args)).is_err());
    }

    #[test]
    fn absent_arguments_satisfy_schema_without_requirements() {
        let validator = compile(json!({"type": "object"}));
        assert!(validate_arguments(&validator, None).is_ok());
    }

    #[test]
    fn extra_fields_are_tolerated_unless_schema_forbids_them() {
        let open = compile(json!({
            "type": "object",
            "properties": {"query": {"type": "string"}}
        }));
        let closed = compile(json!({
            "type": "object",
            "properties": {"query": {"type": "string"}},
            "additionalProperties": false
        }));
        let args = object(json!({"query": "rust", "surprise": true}));
        assert!(validate_arguments(&open, Some(&args)).is_ok());
        assert!(validate_arguments(&closed, Some(&args)).is_err());
    }
}

use jsonschema::JSONSchema;
use serde_json::{json, Value};

use crate::error::{SkeinError, SkeinErrorCode};
use crate::part::ToolSpec;

/// Validates a tool call's input against the tool's declared schema before
/// the executor ever sees it.
pub fn validate_tool_input(
    spec: &ToolSpec,
    tool_call_id: &str,
    input: &Value,
) -> Result<(), SkeinError> {
    let compiled = JSONSchema::compile(&spec.input_schema).map_err(|error| {
        SkeinError::new(
            SkeinErrorCode::SchemaInvalid,
            format!("Invalid input schema for tool '{}': {error}", spec.name),
        )
        .with_details(json!({
            "toolName": spec.name,
        }))
    })?;

    if let Err(errors) = compiled.validate(input) {
        let validation_errors = errors
            .map(|error| {
                json!({
                    "path": error.instance_path.to_string(),
                    "message": error.to_string(),
                })
            })
            .collect::<Vec<_>>();

        return Err(SkeinError::new(
            SkeinErrorCode::ToolInputInvalid,
            format!("Input validation failed for tool '{}'", spec.name),
        )
        .with_details(json!({
            "toolName": spec.name,
            "toolCallId": tool_call_id,
            "input": input,
            "validationErrors": validation_errors,
        })));
    }

    Ok(())
}

/// Validates a finished structured-object result against its target schema.
pub fn validate_object(schema: &Value, value: &Value) -> Result<(), SkeinError> {
    let compiled = JSONSchema::compile(schema).map_err(|error| {
        SkeinError::new(
            SkeinErrorCode::SchemaInvalid,
            format!("Invalid object schema: {error}"),
        )
    })?;

    if let Err(errors) = compiled.validate(value) {
        let validation_errors = errors
            .map(|error| {
                json!({
                    "path": error.instance_path.to_string(),
                    "message": error.to_string(),
                })
            })
            .collect::<Vec<_>>();

        return Err(SkeinError::new(
            SkeinErrorCode::SchemaInvalid,
            "Structured object does not match its schema",
        )
        .with_details(json!({
            "value": value,
            "validationErrors": validation_errors,
        })));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn search_tool() -> ToolSpec {
        ToolSpec {
            name: "search".to_string(),
            description: "Search the index".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "limit": {"type": "integer"}
                },
                "required": ["query"]
            }),
        }
    }

    #[test]
    fn valid_input_passes() {
        let spec = search_tool();
        assert!(validate_tool_input(&spec, "tc-1", &json!({"query": "rust"})).is_ok());
    }

    #[test]
    fn missing_required_field_is_rejected_with_details() {
        let spec = search_tool();
        let error = validate_tool_input(&spec, "tc-1", &json!({"limit": 3})).unwrap_err();
        assert_eq!(error.code, SkeinErrorCode::ToolInputInvalid);
        let details = error.details.unwrap();
        assert_eq!(details["toolCallId"], "tc-1");
        assert!(!details["validationErrors"].as_array().unwrap().is_empty());
    }

    #[test]
    fn object_validation_reports_schema_mismatch() {
        let schema = json!({
            "type": "object",
            "properties": {"age": {"type": "integer"}},
            "required": ["age"]
        });
        assert!(validate_object(&schema, &json!({"age": 30})).is_ok());
        let error = validate_object(&schema, &json!({"age": "thirty"})).unwrap_err();
        assert_eq!(error.code, SkeinErrorCode::SchemaInvalid);
    }
}

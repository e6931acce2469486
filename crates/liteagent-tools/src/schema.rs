// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tool argument schema preparation and validation.
//!
//! Some providers reject tool schemas with open objects or optional fields,
//! so every schema is normalized before it is sent: `additionalProperties`
//! is forced to false, every property is marked required (optionality is
//! encoded via nullable types instead), and `default` keys are stripped.
//! The walk covers `properties`, `items`, and `$defs`.

use serde_json::Value;

/// Normalize a JSON Schema for strict providers.
pub fn prepare_schema(mut schema: Value) -> Value {
    walk(&mut schema);
    schema
}

fn walk(schema: &mut Value) {
    let Some(obj) = schema.as_object_mut() else {
        return;
    };

    obj.remove("default");

    if obj.get("type").and_then(Value::as_str) == Some("object") {
        obj.insert("additionalProperties".into(), Value::Bool(false));
        let names: Vec<Value> = obj
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| props.keys().cloned().map(Value::String).collect())
            .unwrap_or_default();
        obj.insert("required".into(), Value::Array(names));
    }

    if let Some(props) = obj.get_mut("properties").and_then(Value::as_object_mut) {
        for sub in props.values_mut() {
            walk(sub);
        }
    }
    if let Some(items) = obj.get_mut("items") {
        walk(items);
    }
    if let Some(defs) = obj.get_mut("$defs").and_then(Value::as_object_mut) {
        for sub in defs.values_mut() {
            walk(sub);
        }
    }
}

/// Check model-produced arguments against a prepared schema.
///
/// This is a shallow structural check: the arguments must be an object, every
/// required key must be present, and no unknown keys may appear when
/// `additionalProperties` is false.  A failure is described in a single
/// sentence suitable for a tool-result error the model can react to.
pub fn validate_arguments(schema: &Value, args: &Value) -> Result<(), String> {
    let Some(args_obj) = args.as_object() else {
        return Err(format!("arguments must be a JSON object, got: {args}"));
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if !args_obj.contains_key(key) {
                return Err(format!("missing required argument '{key}'"));
            }
        }
    }

    if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
        if let Some(props) = schema.get("properties").and_then(Value::as_object) {
            for key in args_obj.keys() {
                if !props.contains_key(key) {
                    return Err(format!("unknown argument '{key}'"));
                }
            }
        }
    }

    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn objects_become_strict_with_all_fields_required() {
        let schema = prepare_schema(json!({
            "type": "object",
            "properties": {
                "city": { "type": "string" },
                "days": { "type": "integer", "default": 3 },
            }
        }));
        assert_eq!(schema["additionalProperties"], json!(false));
        let required = schema["required"].as_array().unwrap();
        assert!(required.contains(&json!("city")));
        assert!(required.contains(&json!("days")));
        assert!(schema["properties"]["days"].get("default").is_none());
    }

    #[test]
    fn nested_objects_and_arrays_are_walked() {
        let schema = prepare_schema(json!({
            "type": "object",
            "properties": {
                "filters": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": { "field": { "type": "string", "default": "x" } }
                    }
                }
            }
        }));
        let item = &schema["properties"]["filters"]["items"];
        assert_eq!(item["additionalProperties"], json!(false));
        assert_eq!(item["required"], json!(["field"]));
        assert!(item["properties"]["field"].get("default").is_none());
    }

    #[test]
    fn defs_are_walked() {
        let schema = prepare_schema(json!({
            "type": "object",
            "properties": { "loc": { "$ref": "#/$defs/Location" } },
            "$defs": {
                "Location": {
                    "type": "object",
                    "properties": { "lat": { "type": "number" } }
                }
            }
        }));
        assert_eq!(schema["$defs"]["Location"]["required"], json!(["lat"]));
    }

    #[test]
    fn empty_object_schema_requires_nothing() {
        let schema = prepare_schema(json!({ "type": "object", "properties": {} }));
        assert_eq!(schema["required"], json!([]));
        assert!(validate_arguments(&schema, &json!({})).is_ok());
    }

    #[test]
    fn validation_flags_missing_and_unknown_arguments() {
        let schema = prepare_schema(json!({
            "type": "object",
            "properties": { "a": { "type": "integer" } }
        }));
        assert!(validate_arguments(&schema, &json!({"a": 1})).is_ok());

        let err = validate_arguments(&schema, &json!({})).unwrap_err();
        assert!(err.contains("missing required argument 'a'"));

        let err = validate_arguments(&schema, &json!({"a": 1, "b": 2})).unwrap_err();
        assert!(err.contains("unknown argument 'b'"));

        let err = validate_arguments(&schema, &json!("not an object")).unwrap_err();
        assert!(err.contains("must be a JSON object"));
    }
}

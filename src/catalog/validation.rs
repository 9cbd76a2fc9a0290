use jsonschema::Validator;
use serde_json::Value;

/// Check that an argument schema compiles.
pub fn check_schema(schema: &Value) -> Result<(), String> {
    Validator::new(schema)
        .map(|_| ())
        .map_err(|e| format!("Invalid argument schema: {}", e))
}

/// Validate a capability's argument object against its JSON Schema.
/// Returns Ok(()) if valid, Err with a human-readable error message if invalid.
pub fn validate_arguments(schema: &Value, arguments: &Value) -> Result<(), String> {
    let validator = Validator::new(schema)
        .map_err(|e| format!("Invalid argument schema: {}", e))?;

    validator
        .validate(arguments)
        .map_err(|e| format!("Invalid arguments: {}", e))
}

//! JSON Schema for the plugin manifest.
//!
//! External authoring tools consume the manifest schema instead of linking
//! this crate; [`generate_schema`] emits it on demand. The compiled
//! validator behind [`validate_against_schema`] is built once on first use
//! and safe to share across threads.

use once_cell::sync::Lazy;
use serde_json::Value;

use crate::manifest::{Manifest, ManifestError};

/// Stable identifier stamped into the generated schema as `$id`.
pub const SCHEMA_ID: &str = "https://holomush.dev/schemas/plugin-manifest.schema.json";

static COMPILED: Lazy<Result<jsonschema::Validator, String>> = Lazy::new(|| {
    let schema = schema_value();
    jsonschema::validator_for(&schema).map_err(|e| e.to_string())
});

fn schema_value() -> Value {
    let schema = schemars::schema_for!(Manifest);
    let mut value = serde_json::to_value(&schema)
        .unwrap_or_else(|e| unreachable!("manifest schema is always serializable: {e}"));
    if let Some(obj) = value.as_object_mut() {
        obj.insert("$id".to_string(), Value::String(SCHEMA_ID.to_string()));
    }
    value
}

/// Returns the canonical manifest schema as pretty-printed JSON bytes.
pub fn generate_schema() -> Vec<u8> {
    let value = schema_value();
    let mut bytes = serde_json::to_vec_pretty(&value)
        .unwrap_or_else(|e| unreachable!("manifest schema is always serializable: {e}"));
    bytes.push(b'\n');
    bytes
}

/// Validates arbitrary YAML bytes against the manifest schema.
///
/// This checks structure only; callers that need the semantic rules (name
/// grammar, version strictness, config agreement) use [`Manifest::parse`].
pub fn validate_against_schema(bytes: &[u8]) -> Result<(), ManifestError> {
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ManifestError::Empty);
    }
    let instance: Value =
        serde_yaml::from_slice(bytes).map_err(|e| ManifestError::Parse(e.to_string()))?;
    let validator = COMPILED
        .as_ref()
        .map_err(|e| ManifestError::Schema(e.clone()))?;
    if let Some(error) = validator.iter_errors(&instance).next() {
        return Err(ManifestError::Schema(error.to_string()));
    }
    Ok(())
}

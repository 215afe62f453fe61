//! JSON Patch (RFC 6902) for PATCH entries.
//!
//! Inside a bundle the patch document travels as a `Binary` resource whose
//! base64 `data` holds the JSON Patch array.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use json_patch::{Patch, PatchOperation, patch};
use serde_json::Value;

use crate::error::{BundleError, Result};

pub const JSON_PATCH_CONTENT_TYPE: &str = "application/json-patch+json";

/// Decodes the patch document carried by a PATCH entry.
pub fn decode_patch_document(payload: &Value) -> Result<Patch> {
    let resource_type = payload.get("resourceType").and_then(Value::as_str);
    if resource_type != Some("Binary") {
        return Err(BundleError::invalid_patch(format!(
            "Unsupported PATCH body: expected a Binary with contentType {JSON_PATCH_CONTENT_TYPE}, found {}",
            resource_type.unwrap_or("no resourceType")
        )));
    }

    let content_type = payload
        .get("contentType")
        .and_then(Value::as_str)
        .unwrap_or_default();
    // Ignore parameters such as `; charset=utf-8`.
    let media_type = content_type.split(';').next().unwrap_or_default().trim();
    if !media_type.eq_ignore_ascii_case(JSON_PATCH_CONTENT_TYPE) {
        return Err(BundleError::invalid_patch(format!(
            "Unsupported PATCH content type: {content_type}"
        )));
    }

    let data = payload
        .get("data")
        .and_then(Value::as_str)
        .ok_or_else(|| BundleError::invalid_patch("PATCH Binary has no data"))?;
    let bytes = STANDARD
        .decode(data.trim())
        .map_err(|e| BundleError::invalid_patch(format!("PATCH data is not valid base64: {e}")))?;

    let operations: Patch = serde_json::from_slice(&bytes)
        .map_err(|e| BundleError::invalid_patch(format!("Invalid JSON Patch document: {e}")))?;
    validate_operations(&operations.0)?;
    Ok(operations)
}

/// Applies `operations` to a copy of `resource`.
pub fn apply_json_patch(resource: &Value, operations: &Patch) -> Result<Value> {
    let mut patched = resource.clone();
    patch(&mut patched, operations)
        .map_err(|e| BundleError::invalid_patch(format!("Patch operation failed: {e}")))?;
    Ok(patched)
}

fn validate_operations(operations: &[PatchOperation]) -> Result<()> {
    for op in operations {
        let path = operation_path(op);
        if path == "/resourceType" || path.starts_with("/resourceType/") {
            return Err(BundleError::invalid_patch("Cannot modify resourceType with patch"));
        }
        if path == "/id" || path.starts_with("/id/") {
            return Err(BundleError::invalid_patch("Cannot modify id with patch"));
        }
    }
    Ok(())
}

fn operation_path(op: &PatchOperation) -> &str {
    match op {
        PatchOperation::Add(op) => op.path.as_str(),
        PatchOperation::Remove(op) => op.path.as_str(),
        PatchOperation::Replace(op) => op.path.as_str(),
        PatchOperation::Move(op) => op.path.as_str(),
        PatchOperation::Copy(op) => op.path.as_str(),
        PatchOperation::Test(op) => op.path.as_str(),
    }
}

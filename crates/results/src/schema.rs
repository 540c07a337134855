//! Schema helpers for free-form JSON fields
//!
//! Kubernetes only accepts structural schemas in CRDs. Free-form JSON values
//! therefore have to be marked with `x-kubernetes-preserve-unknown-fields`.

use schemars::{json_schema, Schema, SchemaGenerator};

/// Schema for an arbitrary JSON object whose content the API server keeps as-is
pub fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    json_schema!({
        "type": "object",
        "nullable": true,
        "x-kubernetes-preserve-unknown-fields": true
    })
}

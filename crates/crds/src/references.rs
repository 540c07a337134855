//! Kubernetes object references used by KluctlDeployment
//!
//! All references are local: the referenced object lives in the same
//! namespace as the KluctlDeployment.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to an object by name in the same namespace
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LocalObjectReference {
    /// Name of the referent
    pub name: String,
}

impl LocalObjectReference {
    /// Create a new reference
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Reference to one key inside a Secret in the same namespace
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyReference {
    /// Name of the Secret
    pub name: String,

    /// Key inside the Secret's data, defaults to `value`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl SecretKeyReference {
    /// Key to read, falling back to `value`
    pub fn key_or_default(&self) -> &str {
        self.key.as_deref().unwrap_or("value")
    }
}

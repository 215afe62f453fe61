//! Wire shapes of the Bundle resource as far as transaction processing needs them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BundleError, Result};

/// A FHIR Bundle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub bundle_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u32>,
    #[serde(default)]
    pub entry: Vec<BundleEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<BundleEntrySearch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<BundleEntryRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<BundleEntryResponse>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleEntryRequest {
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_match: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_none_exist: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_none_match: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_modified_since: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleEntryResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BundleEntrySearch {
    pub mode: String,
}

/// How the entries of a bundle are processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BundleMode {
    /// All-or-nothing.
    Transaction,
    /// Each entry on its own.
    Batch,
}

impl BundleMode {
    /// Picks the mode for an incoming `Bundle.type`.
    ///
    /// A missing type is treated as a transaction.
    pub fn for_bundle_type(bundle_type: Option<&str>, collection_as_batch: bool) -> Result<Self> {
        match bundle_type {
            None | Some("transaction") => Ok(Self::Transaction),
            Some("batch") => Ok(Self::Batch),
            Some("collection") if collection_as_batch => Ok(Self::Batch),
            Some(other) => Err(BundleError::UnsupportedBundleType {
                bundle_type: other.to_string(),
            }),
        }
    }

    /// `Bundle.type` of the response.
    pub fn response_type(self) -> &'static str {
        match self {
            Self::Transaction => "transaction-response",
            Self::Batch => "batch-response",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transaction => "transaction",
            Self::Batch => "batch",
        }
    }
}

impl std::fmt::Display for BundleMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Bundle {
    /// Reads an incoming bundle, rejecting anything that is not a Bundle resource.
    pub fn from_value(value: Value) -> Result<Self> {
        if value.get("resourceType").and_then(Value::as_str) != Some("Bundle") {
            return Err(BundleError::invalid_request(
                "Unable to process transaction: expected a Bundle resource",
            ));
        }
        serde_json::from_value(value)
            .map_err(|e| BundleError::invalid_request(format!("Invalid Bundle: {e}")))
    }

    /// An empty bundle of the given type.
    pub fn of_type(bundle_type: &str) -> Self {
        Self {
            resource_type: "Bundle".to_string(),
            id: Some(octofhir_core::generate_id()),
            bundle_type: Some(bundle_type.to_string()),
            ..Self::default()
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self)
            .map_err(|e| BundleError::internal(format!("Failed to serialize Bundle: {e}")))
    }
}

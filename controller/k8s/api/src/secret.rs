use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Secret data held apart from the Service that reads it.
///
/// A Secret is named by the hash of its data and belongs to exactly one
/// Service, identified by `serviceHash`.
#[derive(Clone, Debug, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(group = "core.tollgate.dev", version = "v1alpha1", kind = "Secret")]
#[serde(rename_all = "camelCase")]
pub struct SecretSpec {
    #[serde(default)]
    pub data: BTreeMap<String, String>,

    /// Hash of the owning Service's spec.
    pub service_hash: String,
}

use crate::labels::{HASH_ANNOTATION, IMMUTABLE_LABEL, SERVICE_LABEL, TOKEN_LABEL};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Probe;
use kube::{
    api::ObjectMeta,
    core::{Resource, ResourceExt, TypeMeta},
};
use serde::{Deserialize, Serialize};
use std::{borrow::Cow, collections::BTreeMap};

/// Describes a metered application.
///
/// Services come in two roles. An immutable Service is named by the hash of
/// its spec and is the one that owns running workloads. A mutable Service has
/// a client-chosen name and points at an immutable Service through its hash
/// annotation.
///
/// `secretData` lives beside the spec rather than inside it so that the spec
/// hash only covers the hash of the secret data (stamped onto each env
/// reference), never the secret values themselves.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    #[serde(flatten, default)]
    pub types: Option<TypeMeta>,

    #[serde(default)]
    pub metadata: ObjectMeta,

    pub spec: ServiceSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_data: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ServiceStatus>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    pub containers: Vec<Container>,

    /// Port on which the application listens for HTTP requests.
    #[serde(default = "default_port")]
    pub port: i32,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub name: String,
    pub image: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness_probe: Option<Probe>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<Probe>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_probe: Option<Probe>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<EnvVarSource>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVarSource {
    pub secret_key_ref: SecretKeySelector,
}

/// Selects a key of secret data.
///
/// Without a `name`, the key is looked up in the Service's own `secretData`.
/// With a `name`, it is looked up in the [`Secret`](crate::Secret) of that
/// name.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeySelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub key: String,

    /// Hash of the secret data snapshot this reference is bound to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    /// Time of the most recent paid request, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_request_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub available_replicas: i32,

    #[serde(default)]
    pub unavailable_replicas: i32,
}

fn default_port() -> i32 {
    80
}

// === impl Service ===

impl Service {
    pub fn new(name: impl ToString, spec: ServiceSpec) -> Self {
        Self {
            types: Some(TypeMeta {
                api_version: Self::api_version(&()).into_owned(),
                kind: Self::kind(&()).into_owned(),
            }),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec,
            secret_data: None,
            status: None,
        }
    }

    pub fn is_immutable(&self) -> bool {
        self.labels().get(IMMUTABLE_LABEL).map(String::as_str) == Some("true")
    }

    pub fn spec_hash(&self) -> Option<&str> {
        self.annotations().get(HASH_ANNOTATION).map(String::as_str)
    }

    pub fn service_label(&self) -> Option<&str> {
        self.labels().get(SERVICE_LABEL).map(String::as_str)
    }

    pub fn token(&self) -> Option<&str> {
        self.labels().get(TOKEN_LABEL).map(String::as_str)
    }

    pub fn env_vars(&self) -> impl Iterator<Item = &EnvVar> {
        self.spec.containers.iter().flat_map(|c| c.env.iter())
    }
}

impl Resource for Service {
    type DynamicType = ();
    type Scope = k8s_openapi::ClusterResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        "Service".into()
    }

    fn group(_: &()) -> Cow<'_, str> {
        crate::GROUP.into()
    }

    fn version(_: &()) -> Cow<'_, str> {
        crate::VERSION.into()
    }

    fn plural(_: &()) -> Cow<'_, str> {
        "services".into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

// === impl EnvVar ===

impl EnvVar {
    pub fn secret_key_ref(&self) -> Option<&SecretKeySelector> {
        self.value_from.as_ref().map(|src| &src.secret_key_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_with_defaults() {
        let svc: Service = serde_json::from_value(serde_json::json!({
            "apiVersion": "core.tollgate.dev/v1alpha1",
            "kind": "Service",
            "metadata": { "name": "hello" },
            "spec": {
                "containers": [{ "name": "app", "image": "hello:1" }]
            }
        }))
        .unwrap();
        assert_eq!(svc.spec.port, 80);
        assert_eq!(svc.name_any(), "hello");
        assert!(svc.status.is_none());
        assert!(!svc.is_immutable());
        assert_eq!(
            svc.types.as_ref().map(|t| t.kind.as_str()),
            Some("Service")
        );
    }

    #[test]
    fn new_sets_type_meta() {
        let svc = Service::new(
            "hello",
            ServiceSpec {
                containers: vec![],
                port: 8080,
            },
        );
        let value = serde_json::to_value(&svc).unwrap();
        assert_eq!(value["apiVersion"], "core.tollgate.dev/v1alpha1");
        assert_eq!(value["kind"], "Service");
        assert!(value.get("secretData").is_none());
        assert!(value.get("status").is_none());
    }

    #[test]
    fn status_timestamps_round_trip_rfc3339() {
        let status: ServiceStatus = serde_json::from_value(serde_json::json!({
            "lastRequestTime": "2024-05-01T12:00:00Z",
            "availableReplicas": 1,
        }))
        .unwrap();
        assert_eq!(status.available_replicas, 1);
        assert_eq!(status.unavailable_replicas, 0);
        assert_eq!(
            status.last_request_time.unwrap().to_rfc3339(),
            "2024-05-01T12:00:00+00:00"
        );
    }
}

//! Defaulting and validation for admitted resources.

use crate::{
    identity::{hash_secret_data, hash_spec, is_hash_like, label_for},
    secrets::{current_hash, NamedSecrets},
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tollgate_controller_k8s_api::{
    labels::{HASH_ANNOTATION, IMMUTABLE_LABEL, SERVICE_LABEL, TOKEN_LABEL},
    ObjectMeta, ResourceExt, Secret, Service,
};

/// A resource under admission.
#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum Resource {
    Service(Box<Service>),
    Secret(Box<Secret>),
}

/// Rejects a write, naming the offending field.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{path}: {message}")]
pub struct FieldError {
    pub path: String,
    pub message: String,
}

// === impl Resource ===

impl Resource {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Service(_) => "Service",
            Self::Secret(_) => "Secret",
        }
    }

    pub fn name(&self) -> String {
        match self {
            Self::Service(svc) => svc.name_any(),
            Self::Secret(secret) => secret.name_any(),
        }
    }

    /// Names of the Secret resources that validation needs to read.
    pub fn referenced_secrets(&self) -> BTreeSet<String> {
        match self {
            Self::Service(svc) => crate::secrets::referenced_names(svc),
            Self::Secret(_) => BTreeSet::new(),
        }
    }

    /// Stamps derived identity onto the resource.
    pub fn apply_defaults(&mut self) {
        match self {
            Self::Service(svc) => default_service(svc),
            Self::Secret(secret) => default_secret(secret),
        }
    }

    pub fn validate_create(&self, named: &NamedSecrets) -> Result<(), FieldError> {
        match self {
            Self::Service(svc) => validate_service(svc, named),
            Self::Secret(secret) => validate_secret(secret),
        }
    }

    pub fn validate_update(&self, old: &Resource, named: &NamedSecrets) -> Result<(), FieldError> {
        match (self, old) {
            (Self::Service(svc), Self::Service(old)) => {
                validate_service(svc, named)?;
                validate_token_stability(svc, old)
            }
            (Self::Secret(secret), Self::Secret(_)) => validate_secret(secret),
            _ => Err(FieldError::invalid("kind", "resource kind cannot change")),
        }
    }

    pub fn validate_delete(&self) -> Result<(), FieldError> {
        Ok(())
    }
}

fn default_service(svc: &mut Service) {
    if let Some(data) = svc.secret_data.as_ref() {
        let hash = hash_secret_data(data);
        for container in svc.spec.containers.iter_mut() {
            for env in container.env.iter_mut() {
                if let Some(src) = env.value_from.as_mut() {
                    let sel = &mut src.secret_key_ref;
                    if sel.name.is_none() && sel.hash.is_none() {
                        sel.hash = Some(hash.clone());
                    }
                }
            }
        }
    }

    let hash = hash_spec(&svc.spec);
    let label = label_for(&hash);
    annotations_mut(&mut svc.metadata).insert(HASH_ANNOTATION.to_string(), hash);
    let labels = labels_mut(&mut svc.metadata);
    labels.insert(SERVICE_LABEL.to_string(), label);
    labels
        .entry(IMMUTABLE_LABEL.to_string())
        .or_insert_with(|| "false".to_string());
}

fn default_secret(secret: &mut Secret) {
    let hash = hash_secret_data(&secret.spec.data);
    let label = label_for(&secret.spec.service_hash);
    annotations_mut(&mut secret.metadata).insert(HASH_ANNOTATION.to_string(), hash);
    labels_mut(&mut secret.metadata).insert(SERVICE_LABEL.to_string(), label);
}

fn validate_service(svc: &Service, named: &NamedSecrets) -> Result<(), FieldError> {
    let hash = hash_spec(&svc.spec);
    if svc.spec_hash() != Some(hash.as_str()) {
        return Err(FieldError::invalid(
            annotation_path(HASH_ANNOTATION),
            "must be the sha256 of the spec",
        ));
    }

    if svc.service_label() != Some(label_for(&hash).as_str()) {
        return Err(FieldError::invalid(
            label_path(SERVICE_LABEL),
            "must be derived from the spec hash",
        ));
    }

    let name = svc.name_any();
    if svc.is_immutable() {
        if name != hash {
            return Err(FieldError::invalid(
                "metadata.name",
                "immutable services must be named by their spec hash",
            ));
        }
    } else if is_hash_like(&name) {
        return Err(FieldError::invalid(
            "metadata.name",
            "mutable service names must not look like a hash",
        ));
    }

    validate_env(svc, named)
}

fn validate_token_stability(svc: &Service, old: &Service) -> Result<(), FieldError> {
    if svc.token() != old.token() {
        return Err(FieldError::invalid(label_path(TOKEN_LABEL), "cannot change"));
    }
    if svc.labels().get(IMMUTABLE_LABEL) != old.labels().get(IMMUTABLE_LABEL) {
        return Err(FieldError::invalid(
            label_path(IMMUTABLE_LABEL),
            "cannot change",
        ));
    }
    Ok(())
}

fn validate_env(svc: &Service, named: &NamedSecrets) -> Result<(), FieldError> {
    let service_hash = svc.spec_hash().unwrap_or_default();
    for (i, container) in svc.spec.containers.iter().enumerate() {
        for (j, env) in container.env.iter().enumerate() {
            let path = format!("spec.containers[{i}].env[{j}]");
            let Some(sel) = env.secret_key_ref() else {
                continue;
            };
            if env.value.is_some() {
                return Err(FieldError::invalid(
                    path,
                    "may not have both value and valueFrom",
                ));
            }
            let path = format!("{path}.valueFrom.secretKeyRef");

            let data = match sel.name.as_ref() {
                None => svc.secret_data.as_ref(),
                Some(name) => match named.get(name) {
                    // A named Secret may be created after the Service.
                    None | Some(None) => continue,
                    Some(Some(secret)) => {
                        if secret.service_hash != service_hash {
                            return Err(FieldError::invalid(
                                format!("{path}.name"),
                                format!("secret {name} belongs to another service"),
                            ));
                        }
                        Some(&secret.data)
                    }
                },
            };

            if !data.is_some_and(|data| data.contains_key(&sel.key)) {
                return Err(FieldError::invalid(
                    format!("{path}.key"),
                    format!("secret data has no key {}", sel.key),
                ));
            }

            let current = current_hash(svc, sel.name.as_ref(), named);
            let stale = match (sel.name.as_ref(), sel.hash.as_ref()) {
                (None, hash) => hash != current.as_ref(),
                (Some(_), Some(hash)) => Some(hash) != current.as_ref(),
                (Some(_), None) => false,
            };
            if stale {
                return Err(FieldError::invalid(
                    format!("{path}.hash"),
                    "must be the sha256 of the current secret data",
                ));
            }
        }
    }
    Ok(())
}

fn validate_secret(secret: &Secret) -> Result<(), FieldError> {
    let hash = hash_secret_data(&secret.spec.data);
    if secret.annotations().get(HASH_ANNOTATION) != Some(&hash) {
        return Err(FieldError::invalid(
            annotation_path(HASH_ANNOTATION),
            "must be the sha256 of the secret data",
        ));
    }
    if secret.name_any() != hash {
        return Err(FieldError::invalid(
            "metadata.name",
            "must be the sha256 of the secret data",
        ));
    }
    if !is_hash_like(&secret.spec.service_hash) {
        return Err(FieldError::invalid(
            "spec.serviceHash",
            "must be a service hash",
        ));
    }
    if secret.labels().get(SERVICE_LABEL) != Some(&label_for(&secret.spec.service_hash)) {
        return Err(FieldError::invalid(
            label_path(SERVICE_LABEL),
            "must be derived from the service hash",
        ));
    }
    Ok(())
}

fn annotations_mut(meta: &mut ObjectMeta) -> &mut BTreeMap<String, String> {
    meta.annotations.get_or_insert_with(BTreeMap::new)
}

fn labels_mut(meta: &mut ObjectMeta) -> &mut BTreeMap<String, String> {
    meta.labels.get_or_insert_with(BTreeMap::new)
}

fn annotation_path(key: &str) -> String {
    format!("metadata.annotations[{key}]")
}

fn label_path(key: &str) -> String {
    format!("metadata.labels[{key}]")
}

// === impl FieldError ===

impl FieldError {
    pub fn invalid(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use pretty_assertions::assert_eq;
    use tollgate_controller_k8s_api::{
        Container, EnvVar, EnvVarSource, SecretKeySelector, SecretSpec, ServiceSpec,
    };

    fn literal(name: &str, value: &str) -> EnvVar {
        EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            value_from: None,
        }
    }

    fn secret_ref(name: &str, secret: Option<&str>, key: &str) -> EnvVar {
        EnvVar {
            name: name.to_string(),
            value: None,
            value_from: Some(EnvVarSource {
                secret_key_ref: SecretKeySelector {
                    name: secret.map(str::to_string),
                    key: key.to_string(),
                    hash: None,
                },
            }),
        }
    }

    fn service(name: &str, env: Vec<EnvVar>) -> Service {
        Service::new(
            name,
            ServiceSpec {
                containers: vec![Container {
                    name: "app".to_string(),
                    image: "hello:1".to_string(),
                    command: vec![],
                    args: vec![],
                    working_dir: None,
                    env,
                    liveness_probe: None,
                    readiness_probe: None,
                    startup_probe: None,
                }],
                port: 8080,
            },
        )
    }

    fn defaulted(svc: Service) -> Resource {
        let mut res = Resource::Service(Box::new(svc));
        res.apply_defaults();
        res
    }

    fn as_service(res: &mut Resource) -> &mut Service {
        match res {
            Resource::Service(svc) => svc.as_mut(),
            Resource::Secret(_) => panic!("expected a service"),
        }
    }

    #[test]
    fn defaults_stamp_identity() {
        let mut res = defaulted(service("hello", vec![literal("A", "b")]));
        let svc = as_service(&mut res);
        let hash = hash_spec(&svc.spec);
        assert_eq!(svc.spec_hash(), Some(hash.as_str()));
        assert_eq!(svc.service_label(), Some(label_for(&hash).as_str()));
        assert_eq!(
            svc.labels().get(IMMUTABLE_LABEL).map(String::as_str),
            Some("false")
        );
        assert_eq!(res.validate_create(&NamedSecrets::new()), Ok(()));
    }

    #[test]
    fn defaulting_is_idempotent() {
        let mut res = defaulted(service("hello", vec![secret_ref("T", None, "token")]));
        as_service(&mut res).secret_data =
            Some(btreemap! { "token".to_string() => "t".to_string() });
        res.apply_defaults();
        let once = serde_json::to_value(&res).unwrap();
        res.apply_defaults();
        assert_eq!(serde_json::to_value(&res).unwrap(), once);
    }

    #[test]
    fn tampered_hash_is_denied() {
        let mut res = defaulted(service("hello", vec![]));
        as_service(&mut res)
            .metadata
            .annotations
            .as_mut()
            .unwrap()
            .insert(HASH_ANNOTATION.to_string(), "0".repeat(64));
        let err = res.validate_create(&NamedSecrets::new()).unwrap_err();
        assert_eq!(err.path, "metadata.annotations[tollgate.dev/hash]");

        // Changing the spec after defaulting is caught the same way.
        let mut res = defaulted(service("hello", vec![]));
        as_service(&mut res).spec.port = 9090;
        assert!(res.validate_create(&NamedSecrets::new()).is_err());
    }

    #[test]
    fn tampered_label_is_denied() {
        let mut res = defaulted(service("hello", vec![]));
        as_service(&mut res)
            .metadata
            .labels
            .as_mut()
            .unwrap()
            .insert(SERVICE_LABEL.to_string(), "svc-other".to_string());
        let err = res.validate_create(&NamedSecrets::new()).unwrap_err();
        assert_eq!(err.path, "metadata.labels[tollgate.dev/service]");
    }

    #[test]
    fn name_policy() {
        let res = defaulted(service(&"a".repeat(64), vec![]));
        let err = res.validate_create(&NamedSecrets::new()).unwrap_err();
        assert_eq!(err.path, "metadata.name");

        let mut svc = service("hello", vec![]);
        svc.metadata.labels = Some(btreemap! {
            IMMUTABLE_LABEL.to_string() => "true".to_string(),
        });
        let mut res = defaulted(svc);
        assert_eq!(
            res.validate_create(&NamedSecrets::new()).unwrap_err().path,
            "metadata.name"
        );
        let svc = as_service(&mut res);
        svc.metadata.name = svc.spec_hash().map(str::to_string);
        assert_eq!(res.validate_create(&NamedSecrets::new()), Ok(()));
    }

    #[test]
    fn both_value_and_value_from_is_denied() {
        let mut env = secret_ref("T", None, "token");
        env.value = Some("plain".to_string());
        let mut svc = service("hello", vec![env]);
        svc.secret_data = Some(btreemap! { "token".to_string() => "t".to_string() });
        let res = defaulted(svc);
        let err = res.validate_create(&NamedSecrets::new()).unwrap_err();
        assert_eq!(err.path, "spec.containers[0].env[0]");
    }

    #[test]
    fn missing_embedded_key_is_denied() {
        let mut svc = service("hello", vec![secret_ref("T", None, "token")]);
        svc.secret_data = Some(btreemap! { "other".to_string() => "t".to_string() });
        let err = defaulted(svc)
            .validate_create(&NamedSecrets::new())
            .unwrap_err();
        assert_eq!(err.path, "spec.containers[0].env[0].valueFrom.secretKeyRef.key");
    }

    #[test]
    fn stale_secret_reference_is_denied_until_redefaulted() {
        let mut svc = service("hello", vec![secret_ref("T", None, "token")]);
        svc.secret_data = Some(btreemap! { "token".to_string() => "v1".to_string() });
        let mut res = defaulted(svc);
        assert_eq!(res.validate_create(&NamedSecrets::new()), Ok(()));

        // Rotate the data without rebinding the reference.
        as_service(&mut res).secret_data =
            Some(btreemap! { "token".to_string() => "v2".to_string() });
        res.apply_defaults();
        let err = res.validate_create(&NamedSecrets::new()).unwrap_err();
        assert_eq!(
            err.path,
            "spec.containers[0].env[0].valueFrom.secretKeyRef.hash"
        );

        // Clearing the binding lets defaulting rebind it to the new data.
        if let Some(src) = as_service(&mut res).spec.containers[0].env[0]
            .value_from
            .as_mut()
        {
            src.secret_key_ref.hash = None;
        }
        res.apply_defaults();
        assert_eq!(res.validate_create(&NamedSecrets::new()), Ok(()));
    }

    #[test]
    fn named_secrets_must_belong_to_the_service() {
        let res = defaulted(service("hello", vec![secret_ref("T", Some("creds"), "token")]));
        let names = res.referenced_secrets().into_iter().collect::<Vec<_>>();
        assert_eq!(names, vec!["creds".to_string()]);

        // Not created yet.
        assert_eq!(
            res.validate_create(&btreemap! { "creds".to_string() => None }),
            Ok(())
        );

        let Resource::Service(svc) = &res else {
            unreachable!()
        };
        let owned = SecretSpec {
            data: btreemap! { "token".to_string() => "t".to_string() },
            service_hash: svc.spec_hash().unwrap().to_string(),
        };
        let named = btreemap! { "creds".to_string() => Some(owned.clone()) };
        assert_eq!(res.validate_create(&named), Ok(()));

        let foreign = SecretSpec {
            service_hash: "0".repeat(64),
            ..owned.clone()
        };
        let named = btreemap! { "creds".to_string() => Some(foreign) };
        assert_eq!(
            res.validate_create(&named).unwrap_err().path,
            "spec.containers[0].env[0].valueFrom.secretKeyRef.name"
        );

        let missing_key = SecretSpec {
            data: BTreeMap::new(),
            ..owned
        };
        let named = btreemap! { "creds".to_string() => Some(missing_key) };
        assert_eq!(
            res.validate_create(&named).unwrap_err().path,
            "spec.containers[0].env[0].valueFrom.secretKeyRef.key"
        );
    }

    #[test]
    fn token_must_not_change() {
        let mut old = service("hello", vec![]);
        old.metadata.labels = Some(btreemap! {
            TOKEN_LABEL.to_string() => "alice".to_string(),
        });
        let old = defaulted(old);

        let mut new = old.clone();
        assert_eq!(new.validate_update(&old, &NamedSecrets::new()), Ok(()));

        as_service(&mut new)
            .metadata
            .labels
            .as_mut()
            .unwrap()
            .insert(TOKEN_LABEL.to_string(), "mallory".to_string());
        let err = new.validate_update(&old, &NamedSecrets::new()).unwrap_err();
        assert_eq!(err.path, "metadata.labels[tollgate.dev/token]");
        assert_eq!(new.validate_delete(), Ok(()));
    }

    #[test]
    fn secrets_are_named_by_their_data() {
        let service_hash = "b".repeat(64);
        let spec = SecretSpec {
            data: btreemap! { "token".to_string() => "t".to_string() },
            service_hash: service_hash.clone(),
        };
        let name = hash_secret_data(&spec.data);
        let mut res = Resource::Secret(Box::new(Secret::new(&name, spec)));
        res.apply_defaults();
        assert_eq!(res.validate_create(&NamedSecrets::new()), Ok(()));
        if let Resource::Secret(secret) = &res {
            assert_eq!(
                secret.labels().get(SERVICE_LABEL),
                Some(&label_for(&service_hash))
            );
        }

        let spec = SecretSpec {
            data: btreemap! { "token".to_string() => "t".to_string() },
            service_hash: "not-a-hash".to_string(),
        };
        let name = hash_secret_data(&spec.data);
        let mut res = Resource::Secret(Box::new(Secret::new(&name, spec)));
        res.apply_defaults();
        assert_eq!(
            res.validate_create(&NamedSecrets::new()).unwrap_err().path,
            "spec.serviceHash"
        );

        let spec = SecretSpec {
            data: BTreeMap::new(),
            service_hash,
        };
        let mut res = Resource::Secret(Box::new(Secret::new("creds", spec)));
        res.apply_defaults();
        assert_eq!(
            res.validate_create(&NamedSecrets::new()).unwrap_err().path,
            "metadata.name"
        );
    }
}

use crate::identity::hash_secret_data;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tollgate_controller_k8s_api::{Container, SecretSpec, Service};

/// Named Secrets referenced by a Service, keyed by name. `None` records a
/// Secret that does not exist (yet).
pub type NamedSecrets = BTreeMap<String, Option<SecretSpec>>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("env {env} reads key {key} but the service has no secret data")]
    NoSecretData { env: String, key: String },

    #[error("env {env} reads secret {name}, which does not exist")]
    MissingSecret { env: String, name: String },

    #[error("secret {name} belongs to service {owner}, not {service}")]
    NotOwned {
        name: String,
        owner: String,
        service: String,
    },

    #[error("env {env} reads missing key {key}")]
    MissingKey { env: String, key: String },
}

/// Returns the names of all Secrets the Service's env vars read from.
pub fn referenced_names(svc: &Service) -> BTreeSet<String> {
    svc.env_vars()
        .filter_map(|env| env.secret_key_ref())
        .filter_map(|sel| sel.name.clone())
        .collect()
}

/// Resolves a container's environment to literal values.
///
/// Literal values pass through. Secret references read from the Service's
/// embedded data or from a named Secret, which must be owned by the Service.
pub fn resolve_env(
    svc: &Service,
    container: &Container,
    named: &NamedSecrets,
) -> Result<Vec<(String, String)>, ResolveError> {
    let service_hash = svc.spec_hash().unwrap_or_default();
    let mut vars = Vec::with_capacity(container.env.len());
    for env in container.env.iter() {
        let value = match env.secret_key_ref() {
            None => env.value.clone().unwrap_or_default(),
            Some(sel) => {
                let data = match sel.name.as_ref() {
                    None => svc
                        .secret_data
                        .as_ref()
                        .ok_or_else(|| ResolveError::NoSecretData {
                            env: env.name.clone(),
                            key: sel.key.clone(),
                        })?,
                    Some(name) => {
                        let secret = named.get(name).and_then(Option::as_ref).ok_or_else(
                            || ResolveError::MissingSecret {
                                env: env.name.clone(),
                                name: name.clone(),
                            },
                        )?;
                        if secret.service_hash != service_hash {
                            return Err(ResolveError::NotOwned {
                                name: name.clone(),
                                owner: secret.service_hash.clone(),
                                service: service_hash.to_string(),
                            });
                        }
                        &secret.data
                    }
                };
                data.get(&sel.key)
                    .cloned()
                    .ok_or_else(|| ResolveError::MissingKey {
                        env: env.name.clone(),
                        key: sel.key.clone(),
                    })?
            }
        };
        vars.push((env.name.clone(), value));
    }
    Ok(vars)
}

/// Returns the current hash of the data a reference points at, if known.
pub(crate) fn current_hash(
    svc: &Service,
    name: Option<&String>,
    named: &NamedSecrets,
) -> Option<String> {
    match name {
        None => svc.secret_data.as_ref().map(hash_secret_data),
        Some(name) => named
            .get(name)
            .and_then(Option::as_ref)
            .map(|s| hash_secret_data(&s.data)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use tollgate_controller_k8s_api::{
        EnvVar, EnvVarSource, SecretKeySelector, ServiceSpec,
    };

    fn env(name: &str, secret: Option<&str>, key: &str) -> EnvVar {
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

    fn service(env: Vec<EnvVar>) -> Service {
        let mut svc = Service::new(
            "hello",
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
                port: 80,
            },
        );
        svc.metadata.annotations = Some(btreemap! {
            tollgate_controller_k8s_api::labels::HASH_ANNOTATION.to_string() => "h".repeat(64),
        });
        svc
    }

    #[test]
    fn resolves_literals_and_embedded_secrets() {
        let mut svc = service(vec![
            EnvVar {
                name: "PLAIN".to_string(),
                value: Some("value".to_string()),
                value_from: None,
            },
            env("TOKEN", None, "token"),
        ]);
        svc.secret_data = Some(btreemap! { "token".to_string() => "s3cr3t".to_string() });

        let vars = resolve_env(&svc, &svc.spec.containers[0], &NamedSecrets::new()).unwrap();
        assert_eq!(
            vars,
            vec![
                ("PLAIN".to_string(), "value".to_string()),
                ("TOKEN".to_string(), "s3cr3t".to_string()),
            ]
        );
    }

    #[test]
    fn resolves_named_secrets() {
        let svc = service(vec![env("TOKEN", Some("creds"), "token")]);
        let named = btreemap! {
            "creds".to_string() => Some(SecretSpec {
                data: btreemap! { "token".to_string() => "abc".to_string() },
                service_hash: "h".repeat(64),
            }),
        };
        let vars = resolve_env(&svc, &svc.spec.containers[0], &named).unwrap();
        assert_eq!(vars, vec![("TOKEN".to_string(), "abc".to_string())]);
        assert_eq!(
            referenced_names(&svc).into_iter().collect::<Vec<_>>(),
            vec!["creds".to_string()]
        );
    }

    #[test]
    fn rejects_secrets_owned_by_another_service() {
        let svc = service(vec![env("TOKEN", Some("creds"), "token")]);
        let named = btreemap! {
            "creds".to_string() => Some(SecretSpec {
                data: btreemap! { "token".to_string() => "abc".to_string() },
                service_hash: "0".repeat(64),
            }),
        };
        let err = resolve_env(&svc, &svc.spec.containers[0], &named).unwrap_err();
        assert!(matches!(err, ResolveError::NotOwned { .. }), "{err}");
    }

    #[test]
    fn rejects_missing_secrets_and_keys() {
        let svc = service(vec![env("TOKEN", Some("creds"), "token")]);
        let named = btreemap! { "creds".to_string() => None };
        assert_eq!(
            resolve_env(&svc, &svc.spec.containers[0], &named),
            Err(ResolveError::MissingSecret {
                env: "TOKEN".to_string(),
                name: "creds".to_string(),
            })
        );

        let mut svc = service(vec![env("TOKEN", None, "token")]);
        assert!(matches!(
            resolve_env(&svc, &svc.spec.containers[0], &NamedSecrets::new()),
            Err(ResolveError::NoSecretData { .. })
        ));
        svc.secret_data = Some(btreemap! { "other".to_string() => "x".to_string() });
        assert!(matches!(
            resolve_env(&svc, &svc.spec.containers[0], &NamedSecrets::new()),
            Err(ResolveError::MissingKey { .. })
        ));
    }
}

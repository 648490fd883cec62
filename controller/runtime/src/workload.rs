//! Synthesizes the workload objects owned by an immutable Service.

use crate::k8s::{
    api::core::v1::{
        Container, EnvVar, PodSpec, PodTemplateSpec, ServicePort, ServiceSpec as NetworkServiceSpec,
    },
    labels::{HASH_ANNOTATION, SERVICE_LABEL},
    Deployment, DeploymentSpec, NetworkService, ObjectMeta, Resource, ResourceExt, Service,
};
use k8s_openapi::apimachinery::pkg::{apis::meta::v1::LabelSelector, util::intstr::IntOrString};
use std::{collections::BTreeMap, net::IpAddr};

const INIT_CONTAINER_NAME: &str = "init-network-policy";
const INIT_CONTAINER_IMAGE: &str = "busybox:1.31";

/// Port on which network endpoints accept traffic.
pub const ENDPOINT_PORT: i32 = 80;

#[derive(Clone, Debug)]
pub struct Config {
    pub namespace: String,
    pub runtime_class_name: Option<String>,
}

/// Builds the Deployment for an immutable Service.
///
/// `env` holds the resolved environment of each spec container, in order.
/// Deployments start with no replicas; the reconciler scales them up once
/// traffic arrives.
pub fn deployment_for(
    svc: &Service,
    env: Vec<Vec<(String, String)>>,
    readiness_check_ip: IpAddr,
    config: &Config,
) -> Deployment {
    let labels = labels_for(svc);
    let containers = svc
        .spec
        .containers
        .iter()
        .zip(env.into_iter().chain(std::iter::repeat_with(Vec::new)))
        .map(|(c, env)| Container {
            name: c.name.clone(),
            image: Some(c.image.clone()),
            command: non_empty(&c.command),
            args: non_empty(&c.args),
            working_dir: c.working_dir.clone(),
            env: Some(
                env.into_iter()
                    .map(|(name, value)| EnvVar {
                        name,
                        value: Some(value),
                        value_from: None,
                    })
                    .collect(),
            ),
            liveness_probe: c.liveness_probe.clone(),
            readiness_probe: c.readiness_probe.clone(),
            startup_probe: c.startup_probe.clone(),
            ..Default::default()
        })
        .collect();

    Deployment {
        metadata: metadata_for(svc, svc.name_any(), config),
        spec: Some(DeploymentSpec {
            replicas: Some(0),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    automount_service_account_token: Some(false),
                    containers,
                    dns_policy: Some("Default".to_string()),
                    enable_service_links: Some(false),
                    init_containers: Some(vec![init_container(readiness_check_ip)]),
                    runtime_class_name: config.runtime_class_name.clone(),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Builds the network endpoint fronting an immutable Service's pods. It is
/// named by the grouping label so the gateway can address it.
pub fn endpoint_for(svc: &Service, config: &Config) -> NetworkService {
    let labels = labels_for(svc);
    let name = svc.service_label().unwrap_or_default().to_string();
    NetworkService {
        metadata: metadata_for(svc, name, config),
        spec: Some(NetworkServiceSpec {
            selector: Some(labels),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: ENDPOINT_PORT,
                protocol: Some("TCP".to_string()),
                target_port: Some(IntOrString::Int(svc.spec.port)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

/// Pods wait until the readiness check target stops answering, which shows
/// that network policy isolating the pod is enforced.
fn init_container(readiness_check_ip: IpAddr) -> Container {
    let script = format!(
        "while wget -T 1 --spider {readiness_check_ip}; do \
         echo waiting for network policy enforcement; sleep 1; done"
    );
    Container {
        name: INIT_CONTAINER_NAME.to_string(),
        image: Some(INIT_CONTAINER_IMAGE.to_string()),
        command: Some(vec!["sh".to_string(), "-c".to_string(), script]),
        ..Default::default()
    }
}

fn labels_for(svc: &Service) -> BTreeMap<String, String> {
    let label = svc.service_label().unwrap_or_default().to_string();
    BTreeMap::from([(SERVICE_LABEL.to_string(), label)])
}

fn metadata_for(svc: &Service, name: String, config: &Config) -> ObjectMeta {
    let annotations = svc
        .spec_hash()
        .map(|hash| BTreeMap::from([(HASH_ANNOTATION.to_string(), hash.to_string())]));
    ObjectMeta {
        name: Some(name),
        namespace: Some(config.namespace.clone()),
        labels: Some(labels_for(svc)),
        annotations,
        owner_references: svc.controller_owner_ref(&()).map(|oref| vec![oref]),
        ..Default::default()
    }
}

fn non_empty(values: &[String]) -> Option<Vec<String>> {
    if values.is_empty() {
        return None;
    }
    Some(values.to_vec())
}

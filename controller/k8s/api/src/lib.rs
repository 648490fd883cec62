#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod labels;
pub mod secret;
pub mod service;

pub use self::{
    labels::Selector,
    secret::{Secret, SecretSpec},
    service::{
        Container, EnvVar, EnvVarSource, SecretKeySelector, Service, ServiceSpec, ServiceStatus,
    },
};
pub use k8s_openapi::{
    api::{
        self,
        apps::v1::{Deployment, DeploymentSpec, DeploymentStatus},
        core::v1::{Service as NetworkService, ServiceSpec as NetworkServiceSpec},
    },
    apimachinery::pkg::apis::meta::v1::OwnerReference,
};
pub use kube::{
    api::{Api, ListParams, ObjectMeta, Patch, PatchParams, PostParams, ResourceExt},
    Client, Error, Resource,
};

/// API group shared by every resource this controller owns.
pub const GROUP: &str = "core.tollgate.dev";

pub const VERSION: &str = "v1alpha1";

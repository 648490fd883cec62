//! Drives Services toward running, scaled workloads.

use crate::{
    k8s::{
        labels::{LAST_REQUEST_TIME_ANNOTATION, SERVICE_LABEL},
        Api, Client, Deployment, ListParams, NetworkService, Patch, PatchParams, PostParams,
        Resource, ResourceExt, Secret, Selector, Service, ServiceStatus,
    },
    metrics::{ControllerMetrics, ReconcileResult},
    workload,
};
use chrono::Utc;
use futures::prelude::*;
use kube::runtime::{
    controller::{Action as Requeue, Controller},
    reflector::ObjectRef,
    watcher,
};
use std::{net::IpAddr, sync::Arc, time::Duration};
use thiserror::Error;
use tollgate_controller_core::{
    reconcile::{self, parse_last_request_time, Action, Endpoint, Observed, Workload},
    secrets::{resolve_env, NamedSecrets, ResolveError},
};
use tracing::{debug, info, info_span, warn, Instrument};

const ERROR_REQUEUE: Duration = Duration::from_secs(5);

pub struct Context {
    client: Client,
    config: workload::Config,
    readiness_check_host: String,
    metrics: ControllerMetrics,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("kubernetes request failed: {0}")]
    Kube(#[from] kube::Error),

    #[error("service {0} has no hash annotation")]
    MissingHash(String),

    #[error("failed to resolve environment: {0}")]
    Env(#[from] ResolveError),

    #[error("failed to resolve readiness check host {host}: {reason}")]
    ReadinessCheck { host: String, reason: String },
}

// === impl Context ===

impl Context {
    pub fn new(
        client: Client,
        config: workload::Config,
        readiness_check_host: String,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            client,
            config,
            readiness_check_host,
            metrics,
        }
    }

    fn services(&self) -> Api<Service> {
        Api::all(self.client.clone())
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    fn endpoints(&self) -> Api<NetworkService> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    fn secrets(&self) -> Api<Secret> {
        Api::all(self.client.clone())
    }

    /// Resolves the readiness check target to an address so that pods can
    /// probe it without cluster DNS.
    async fn readiness_check_ip(&self) -> Result<IpAddr, Error> {
        let host = &self.readiness_check_host;
        let err = |reason: String| Error::ReadinessCheck {
            host: host.clone(),
            reason,
        };
        let mut addrs = tokio::net::lookup_host((host.as_str(), 80))
            .await
            .map_err(|e| err(e.to_string()))?;
        addrs
            .next()
            .map(|addr| addr.ip())
            .ok_or_else(|| err("no addresses".to_string()))
    }
}

/// Runs the Service controller until the drain signal fires.
pub async fn run(ctx: Arc<Context>, drain: drain::Watch) {
    let services = ctx.services();
    let labeled = || watcher::Config::default().labels(SERVICE_LABEL);
    let controller = Controller::new(services, watcher::Config::default())
        .watches(ctx.deployments(), labeled(), owned_by)
        .watches(ctx.endpoints(), labeled(), owned_by)
        .watches(ctx.secrets(), watcher::Config::default(), |secret: Secret| {
            Some(ObjectRef::new(&secret.spec.service_hash))
        });

    let (close_tx, close_rx) = tokio::sync::oneshot::channel::<()>();
    let ctrl = controller
        .graceful_shutdown_on(close_rx.map(|_| ()))
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(%obj, "Reconciled"),
                Err(error) => debug!(%error, "Reconcile failed"),
            }
        })
        .instrument(info_span!("services"));
    tokio::pin!(ctrl);

    info!("Service controller running");
    tokio::select! {
        _ = (&mut ctrl) => {}
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(ctrl).await;
        }
    }
}

/// Maps a child object to the Services that own it.
fn owned_by<K: Resource>(obj: K) -> Vec<ObjectRef<Service>> {
    let api_version = Service::api_version(&());
    let kind = Service::kind(&());
    obj.owner_references()
        .iter()
        .filter(|oref| oref.api_version == api_version && oref.kind == kind)
        .map(|oref| ObjectRef::new(&oref.name))
        .collect()
}

async fn reconcile(svc: Arc<Service>, ctx: Arc<Context>) -> Result<Requeue, Error> {
    let name = svc.name_any();
    let res = reconcile_service(&svc, &ctx)
        .instrument(info_span!("reconcile", %name))
        .await;
    let result = match &res {
        Ok(_) => ReconcileResult::Ok,
        Err(_) => ReconcileResult::Error,
    };
    ctx.metrics.reconciled(result);
    res
}

async fn reconcile_service(svc: &Service, ctx: &Context) -> Result<Requeue, Error> {
    let name = svc.name_any();
    let hash = svc
        .spec_hash()
        .ok_or_else(|| Error::MissingHash(name.clone()))?;

    let mut immutable = None;
    let mut workload = None;
    let mut endpoint = None;
    let mut aliases = Vec::new();

    if svc.is_immutable() {
        workload = ctx.deployments().get_opt(&name).await?.map(|deploy| {
            let spec = deploy.spec.unwrap_or_default();
            let status = deploy.status.unwrap_or_default();
            Workload {
                replicas: spec.replicas.unwrap_or(1),
                available_replicas: status.available_replicas.unwrap_or(0),
                unavailable_replicas: status.unavailable_replicas.unwrap_or(0),
            }
        });

        let label = svc.service_label().unwrap_or_default().to_string();
        if workload.is_some() {
            endpoint = ctx.endpoints().get_opt(&label).await?.map(|ep| Endpoint {
                last_request_time: last_request_time(&ep),
            });
        }

        if endpoint.is_some() {
            let selector: Selector = [(SERVICE_LABEL.to_string(), label)].into_iter().collect();
            aliases = ctx
                .services()
                .list(&ListParams::default().labels(&selector.to_string()))
                .await?
                .items;
        }
    } else {
        immutable = ctx.services().get_opt(hash).await?;
    }

    let plan = reconcile::plan(
        &Observed {
            service: svc,
            immutable: immutable.as_ref(),
            workload,
            endpoint,
            aliases: &aliases,
        },
        Utc::now(),
    );
    debug!(?plan);

    for action in plan.actions {
        execute(action, svc, &aliases, ctx).await?;
    }

    Ok(match plan.requeue_after {
        Some(after) => Requeue::requeue(after),
        None => Requeue::await_change(),
    })
}

async fn execute(
    action: Action,
    svc: &Service,
    aliases: &[Service],
    ctx: &Context,
) -> Result<(), Error> {
    let name = svc.name_any();
    let post = PostParams::default();
    match action {
        Action::CreateImmutable(immutable) => {
            info!(hash = %immutable.name_any(), "Creating immutable service");
            ignore_conflict(ctx.services().create(&post, &immutable).await)?;
        }

        Action::CreateWorkload => {
            let mut named = NamedSecrets::new();
            for secret in tollgate_controller_core::secrets::referenced_names(svc) {
                let spec = ctx.secrets().get_opt(&secret).await?.map(|s| s.spec);
                named.insert(secret, spec);
            }
            let env = svc
                .spec
                .containers
                .iter()
                .map(|c| resolve_env(svc, c, &named))
                .collect::<Result<Vec<_>, _>>()?;
            let ip = ctx.readiness_check_ip().await?;
            let deploy = workload::deployment_for(svc, env, ip, &ctx.config);
            info!("Creating deployment");
            ignore_conflict(ctx.deployments().create(&post, &deploy).await)?;
        }

        Action::CreateEndpoint => {
            let endpoint = workload::endpoint_for(svc, &ctx.config);
            info!("Creating endpoint");
            ignore_conflict(ctx.endpoints().create(&post, &endpoint).await)?;
        }

        Action::UpdateStatus(status) => {
            debug!(?status, "Updating status");
            patch_status(ctx, svc, status).await?;
        }

        Action::UpdateAliasStatus { name, status } => {
            if let Some(alias) = aliases.iter().find(|a| a.name_any() == name) {
                debug!(alias = %name, "Updating alias status");
                ignore_not_found(patch_status(ctx, alias, status).await)?;
            }
        }

        Action::Scale(replicas) => {
            info!(replicas, "Scaling");
            let patch = serde_json::json!({ "spec": { "replicas": replicas } });
            ctx.deployments()
                .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
        }
    }
    Ok(())
}

/// Writes status guarded by the resource version that was read, so that a
/// concurrent write fails rather than being overwritten.
async fn patch_status(ctx: &Context, svc: &Service, status: ServiceStatus) -> Result<(), Error> {
    let patch = status_patch(svc, status);
    ctx.services()
        .patch_status(&svc.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

fn status_patch(svc: &Service, status: ServiceStatus) -> serde_json::Value {
    serde_json::json!({
        "metadata": { "resourceVersion": svc.resource_version() },
        "status": status,
    })
}

fn error_policy(svc: Arc<Service>, error: &Error, _ctx: Arc<Context>) -> Requeue {
    warn!(name = %svc.name_any(), %error, "Failed to reconcile");
    Requeue::requeue(ERROR_REQUEUE)
}

fn last_request_time(endpoint: &NetworkService) -> Option<chrono::DateTime<Utc>> {
    let value = endpoint.annotations().get(LAST_REQUEST_TIME_ANNOTATION)?;
    match parse_last_request_time(value) {
        Ok(time) => Some(time),
        Err(error) => {
            warn!(%error, %value, "Invalid last request time");
            None
        }
    }
}

fn ignore_conflict<T>(res: Result<T, kube::Error>) -> Result<(), kube::Error> {
    match res {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(rsp)) if rsp.code == 409 => Ok(()),
        Err(error) => Err(error),
    }
}

fn ignore_not_found<T>(res: Result<T, Error>) -> Result<(), Error> {
    match res {
        Ok(_) => Ok(()),
        Err(Error::Kube(kube::Error::Api(rsp))) if rsp.code == 404 => Ok(()),
        Err(error) => Err(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::{OwnerReference, ServiceSpec};
    use k8s_openapi::api::core::v1::ConfigMap;
    use maplit::btreemap;

    #[test]
    fn children_map_to_their_owning_service() {
        let mut deploy = Deployment::default();
        deploy.metadata.owner_references = Some(vec![
            OwnerReference {
                api_version: "core.tollgate.dev/v1alpha1".to_string(),
                kind: "Service".to_string(),
                name: "0".repeat(64),
                uid: "uid".to_string(),
                controller: Some(true),
                ..Default::default()
            },
            OwnerReference {
                api_version: "v1".to_string(),
                kind: "Service".to_string(),
                name: "other".to_string(),
                uid: "uid".to_string(),
                ..Default::default()
            },
        ]);
        assert_eq!(owned_by(deploy), vec![ObjectRef::new(&"0".repeat(64))]);
        assert_eq!(owned_by(ConfigMap::default()), vec![]);
    }

    #[test]
    fn reads_last_request_time_annotation() {
        let mut endpoint = NetworkService::default();
        assert_eq!(last_request_time(&endpoint), None);

        endpoint.metadata.annotations = Some(btreemap! {
            LAST_REQUEST_TIME_ANNOTATION.to_string() => "2024-05-01T12:00:00Z".to_string(),
        });
        assert_eq!(
            last_request_time(&endpoint),
            parse_last_request_time("2024-05-01T12:00:00Z").ok()
        );

        endpoint.metadata.annotations = Some(btreemap! {
            LAST_REQUEST_TIME_ANNOTATION.to_string() => "soon".to_string(),
        });
        assert_eq!(last_request_time(&endpoint), None);
    }

    #[test]
    fn status_patches_carry_the_resource_version() {
        let mut svc = Service::new(
            "hello",
            ServiceSpec {
                containers: vec![],
                port: 80,
            },
        );
        svc.metadata.resource_version = Some("42".to_string());
        let patch = status_patch(
            &svc,
            ServiceStatus {
                last_request_time: parse_last_request_time("2024-05-01T12:00:00Z").ok(),
                available_replicas: 1,
                unavailable_replicas: 0,
            },
        );
        assert_eq!(patch["metadata"]["resourceVersion"], "42");
        assert_eq!(patch["status"]["availableReplicas"], 1);
        assert_eq!(patch["status"]["lastRequestTime"], "2024-05-01T12:00:00Z");
    }
}

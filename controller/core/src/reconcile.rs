//! Reconcile planning.
//!
//! [`plan`] derives every write from the stored state it is given. It holds
//! no memory between calls, so it may be invoked any number of times for the
//! same state and only ever proposes writes that change something.

use crate::identity::label_for;
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use std::{collections::BTreeMap, time::Duration};
use tollgate_controller_k8s_api::{
    labels::{HASH_ANNOTATION, IMMUTABLE_LABEL, SERVICE_LABEL},
    ObjectMeta, ResourceExt, Service, ServiceStatus,
};

/// A workload is scaled to zero once no request has been recorded for this
/// long.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// The stored state a reconcile acts on.
#[derive(Clone, Debug)]
pub struct Observed<'a> {
    pub service: &'a Service,

    /// The immutable Service named by this Service's hash, if it exists. Only
    /// consulted for mutable Services.
    pub immutable: Option<&'a Service>,

    pub workload: Option<Workload>,
    pub endpoint: Option<Endpoint>,

    /// Services sharing this Service's grouping label.
    pub aliases: &'a [Service],
}

/// Observed state of the Deployment.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Workload {
    /// Desired replica count.
    pub replicas: i32,
    pub available_replicas: i32,
    pub unavailable_replicas: i32,
}

/// Observed state of the network endpoint.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Endpoint {
    /// Activity recorded by the gateway, if any could be read.
    pub last_request_time: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    /// Create the immutable counterpart of a mutable Service.
    CreateImmutable(Box<Service>),
    CreateWorkload,
    CreateEndpoint,
    UpdateStatus(ServiceStatus),
    UpdateAliasStatus { name: String, status: ServiceStatus },
    Scale(i32),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Plan {
    pub actions: Vec<Action>,
    pub requeue_after: Option<Duration>,
}

pub fn plan(observed: &Observed<'_>, now: DateTime<Utc>) -> Plan {
    let svc = observed.service;
    if !svc.is_immutable() {
        return plan_alias(svc, observed.immutable);
    }

    let Some(workload) = observed.workload else {
        return Plan::act(Action::CreateWorkload);
    };
    let Some(endpoint) = observed.endpoint else {
        return Plan::act(Action::CreateEndpoint);
    };

    let stored = svc.status.clone().unwrap_or_default();
    let status = ServiceStatus {
        last_request_time: endpoint.last_request_time.or(stored.last_request_time),
        available_replicas: workload.available_replicas,
        unavailable_replicas: workload.unavailable_replicas,
    };

    let mut plan = Plan::default();
    if status != stored || svc.status.is_none() {
        plan.actions.push(Action::UpdateStatus(status.clone()));
    }

    let name = svc.name_any();
    for alias in observed.aliases.iter() {
        if alias.is_immutable() || alias.name_any() == name {
            continue;
        }
        if alias.status.as_ref() != Some(&status) {
            plan.actions.push(Action::UpdateAliasStatus {
                name: alias.name_any(),
                status: status.clone(),
            });
        }
    }

    // Without any recorded request the workload has been idle forever.
    let idle_timeout = TimeDelta::seconds(IDLE_TIMEOUT.as_secs() as i64);
    let expires = status.last_request_time.map(|last| last + idle_timeout);
    match expires {
        Some(expires) if now < expires => {
            if workload.replicas == 0 {
                plan.actions.push(Action::Scale(1));
            }
            plan.requeue_after = Some((expires - now).to_std().unwrap_or(Duration::ZERO));
        }
        _ => {
            if workload.replicas >= 1 {
                plan.actions.push(Action::Scale(0));
            }
        }
    }

    plan
}

fn plan_alias(svc: &Service, immutable: Option<&Service>) -> Plan {
    match immutable {
        None => Plan::act(Action::CreateImmutable(Box::new(immutable_for(svc)))),
        Some(immutable) => {
            let status = immutable.status.clone().unwrap_or_default();
            if svc.status.as_ref() == Some(&status) {
                return Plan::default();
            }
            Plan::act(Action::UpdateStatus(status))
        }
    }
}

/// Builds the immutable counterpart of a mutable Service. It carries no
/// owner reference so that it outlives the aliases pointing at it.
pub fn immutable_for(svc: &Service) -> Service {
    let hash = svc.spec_hash().unwrap_or_default().to_string();
    let mut immutable = Service::new(&hash, svc.spec.clone());
    immutable.secret_data = svc.secret_data.clone();
    immutable.metadata = ObjectMeta {
        name: Some(hash.clone()),
        labels: Some(BTreeMap::from([
            (SERVICE_LABEL.to_string(), label_for(&hash)),
            (IMMUTABLE_LABEL.to_string(), "true".to_string()),
        ])),
        annotations: Some(BTreeMap::from([(HASH_ANNOTATION.to_string(), hash)])),
        ..Default::default()
    };
    immutable
}

/// Renders an activity timestamp at second precision.
pub fn format_last_request_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_last_request_time(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(value).map(|t| t.with_timezone(&Utc))
}

// === impl Plan ===

impl Plan {
    fn act(action: Action) -> Self {
        Self {
            actions: vec![action],
            requeue_after: None,
        }
    }
}
